use std::pin::Pin;
use std::sync::Arc;
use std::task::{Poll, ready};

use chat_relay_model::{
    ModelProvider, ModelRequest, ModelResponse, ModelResponseEvent,
};
use futures_util::Stream;
use futures_util::stream;
use tracing::Instrument;

use crate::BackendError;

pub(crate) type EventStream = Pin<
    Box<dyn Stream<Item = Result<ModelResponseEvent, BackendError>> + Send>,
>;
type OpenResult = Result<EventStream, BackendError>;
type BoxedOpenFuture = Pin<Box<dyn Future<Output = OpenResult> + Send>>;
type HandlerFn = Arc<dyn Fn(ModelRequest) -> BoxedOpenFuture + Send + Sync>;

/// A wrapper around a model provider that erases its type, so the endpoint
/// state does not need a generic parameter.
///
/// The relay is cheap to clone and holds no per-request state; concurrent
/// requests share the provider only.
#[derive(Clone)]
pub struct Relay {
    handler_fn: HandlerFn,
}

impl Relay {
    /// Wraps the given provider.
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        let handler_fn: HandlerFn = Arc::new(move |req| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!("sending request: {req:?}");
                    match fut.await {
                        Ok(resp) => Ok(into_event_stream(resp)),
                        Err(err) => {
                            error!("backend refused the request: {err:?}");
                            Err(BackendError::from_provider(err))
                        }
                    }
                }
                .instrument(trace_span!("relay open")),
            )
        });
        Self { handler_fn }
    }

    /// Sends the request to the backend and returns its events.
    ///
    /// Errors returned here happen before the backend produced anything.
    /// Dropping the returned stream drops the backend response with it.
    #[inline]
    pub(crate) async fn open(&self, req: ModelRequest) -> OpenResult {
        (self.handler_fn)(req).await
    }
}

fn into_event_stream<R: ModelResponse>(resp: R) -> EventStream {
    let mut resp = Box::pin(resp);
    Box::pin(stream::poll_fn(move |cx| {
        let item = match ready!(resp.as_mut().poll_next_event(cx)) {
            Ok(Some(event)) => Some(Ok(event)),
            Ok(None) => None,
            Err(err) => Some(Err(BackendError::from_provider(err))),
        };
        Poll::Ready(item)
    }))
}
