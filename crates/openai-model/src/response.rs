use std::pin::Pin;
use std::task::{Context, Poll, ready};

use chat_relay_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
};
use pin_project_lite::pin_project;

use crate::Error;
use crate::io::{Sse, SseError};
use crate::proto::{self, ChatCompletionChunk};

struct PartialState {
    sse: Sse,
    id: Option<String>,
    // Set once the finish reason is seen, the next poll returns it as the
    // completion event and the one after ends the response.
    pending_finish_reason: Option<ModelFinishReason>,
    finished: bool,
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            pending_finish_reason: None,
            finished: false,
        };
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    if let Some(finish_reason) = partial_state.pending_finish_reason.take() {
        partial_state.finished = true;
        return Ok((
            Some(ModelResponseEvent::Completed(finish_reason)),
            partial_state,
        ));
    }
    if partial_state.finished {
        return Ok((None, partial_state));
    }

    loop {
        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                return Err(Error::new(
                    "stream ended before completion",
                    ErrorKind::Unavailable,
                ));
            }
            Err(SseError::ChunksError(err)) => {
                return Err(Error::new(err.0, ErrorKind::Unavailable));
            }
            Err(SseError::Truncated) => {
                return Err(Error::new(
                    "stream ended inside an event",
                    ErrorKind::Unavailable,
                ));
            }
            Err(SseError::InvalidPayload) => {
                return Err(Error::new("invalid event stream", ErrorKind::Other));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event == "[DONE]" {
            // Some providers skip the finish reason and only send the sentinel.
            partial_state.finished = true;
            return Ok((
                Some(ModelResponseEvent::Completed(ModelFinishReason::Stop)),
                partial_state,
            ));
        }

        let mut chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| Error::new(format!("{err}"), ErrorKind::Other))?;
        if partial_state.id.get_or_insert_with(|| chunk.id.clone()) != &chunk.id
        {
            return Err(Error::new("chunk id mismatch", ErrorKind::Other));
        };

        // Usage-only chunks carry no choices.
        let Some(choice) = chunk.choices.pop() else {
            continue;
        };

        let finish_reason =
            choice.finish_reason.as_deref().map(proto::parse_finish_reason);
        if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
            // A delta and the finish reason may arrive in the same chunk, the
            // delta always goes first.
            partial_state.pending_finish_reason = finish_reason;
            return Ok((
                Some(ModelResponseEvent::MessageDelta(content)),
                partial_state,
            ));
        }
        if let Some(finish_reason) = finish_reason {
            partial_state.finished = true;
            return Ok((
                Some(ModelResponseEvent::Completed(finish_reason)),
                partial_state,
            ));
        }
    }
}
