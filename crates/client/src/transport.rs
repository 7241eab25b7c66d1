//! Reading the endpoint's data stream.

use chat_relay_protocol::{
    ChatRequest, FrameDecoder, STREAM_HEADER, STREAM_VERSION, StreamPart,
};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response};
use serde_json::Value;

use crate::error::ChatError;

/// Something that can post a conversation and stream the reply back.
///
/// The future returned by `open` must not borrow the transport, so a turn
/// can run on its own task and be aborted at any point.
pub trait Transport: Send + Sync + 'static {
    /// The reply body.
    type Stream: PartStream;

    /// Posts the request and waits for the reply to start.
    ///
    /// Errors returned here happen before any part was received.
    fn open(
        &self,
        req: &ChatRequest,
    ) -> impl Future<Output = Result<Self::Stream, ChatError>> + Send + 'static;
}

/// A finite, forward-only sequence of stream parts.
pub trait PartStream: Send + 'static {
    /// Waits for the next part.
    ///
    /// `Ok(None)` means the body ended. Whether that was expected is up to
    /// the caller, which knows if a finish part was seen.
    fn next_part(
        &mut self,
    ) -> impl Future<Output = Result<Option<StreamPart>, ChatError>> + Send;
}

/// Posts to a chat endpoint over HTTP.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    /// Creates a transport posting to the given URL, for example
    /// `http://127.0.0.1:3000/api/chat`.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), url)
    }

    /// Creates a transport that shares an existing client.
    #[inline]
    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Returns the endpoint URL.
    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for HttpTransport {
    type Stream = HttpPartStream;

    fn open(
        &self,
        req: &ChatRequest,
    ) -> impl Future<Output = Result<Self::Stream, ChatError>> + Send + 'static
    {
        let builder = self.client.post(&self.url).json(req);
        async move {
            let resp = builder
                .send()
                .await
                .map_err(|err| ChatError::Network(err.to_string()))?;
            debug!("got response: {}", resp.status());

            if !resp.status().is_success() {
                return Err(rejection_from_response(resp).await);
            }
            check_stream_headers(&resp)?;

            Ok(HttpPartStream {
                resp,
                decoder: FrameDecoder::new(),
                eof: false,
            })
        }
    }
}

fn check_stream_headers(resp: &Response) -> Result<(), ChatError> {
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("text/plain") {
        return Err(ChatError::UnexpectedResponse(format!(
            "content type is {content_type:?}"
        )));
    }

    let version = resp
        .headers()
        .get(STREAM_HEADER)
        .and_then(|value| value.to_str().ok());
    if version != Some(STREAM_VERSION) {
        return Err(ChatError::UnexpectedResponse(format!(
            "unsupported stream version {version:?}"
        )));
    }
    Ok(())
}

async fn rejection_from_response(resp: Response) -> ChatError {
    let status = resp.status().as_u16();
    let body = match resp.text().await {
        Ok(body) => body,
        Err(err) => {
            warn!("failed to read error body: {err}");
            String::new()
        }
    };
    // The endpoint answers `{"error": "..."}`, anything else is shown raw.
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(ToOwned::to_owned))
        .unwrap_or(body);
    ChatError::Rejected { status, message }
}

/// The body of a successful chat response.
///
/// Dropping it closes the connection.
pub struct HttpPartStream {
    resp: Response,
    decoder: FrameDecoder,
    eof: bool,
}

impl PartStream for HttpPartStream {
    async fn next_part(&mut self) -> Result<Option<StreamPart>, ChatError> {
        loop {
            if let Some(part) = self.decoder.next_part()? {
                return Ok(Some(part));
            }
            if self.eof {
                return Ok(None);
            }

            match self.resp.chunk().await {
                Ok(Some(chunk)) => {
                    trace!("received {} bytes", chunk.len());
                    self.decoder.push(&chunk);
                }
                Ok(None) => {
                    self.eof = true;
                    self.decoder.finish()?;
                }
                Err(err) => return Err(ChatError::Network(err.to_string())),
            }
        }
    }
}
