use std::convert::Infallible;
use std::future::ready;

use bytes::Bytes;
use chat_relay_model::{ModelFinishReason, ModelResponseEvent};
use chat_relay_protocol::{FinishReason, StreamPart};
use futures_util::{Stream, StreamExt, stream};

use crate::relay::EventStream;

/// Turns backend events into the data stream body.
///
/// Every delta is encoded and handed to the body as soon as the backend
/// yields it. The body ends with a finish part, or with an error part and
/// nothing after it if the backend fails halfway.
pub(crate) fn data_stream(
    message_id: String,
    events: EventStream,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    let start = StreamPart::Start {
        message_id: message_id.clone(),
    }
    .encode();
    let state = RelayState::Streaming {
        events,
        tracker: Tracker::new(message_id),
    };
    stream::once(ready(start))
        .chain(stream::unfold(state, step))
        .map(Ok)
}

enum RelayState {
    Streaming { events: EventStream, tracker: Tracker },
    Done,
}

async fn step(state: RelayState) -> Option<(Bytes, RelayState)> {
    let RelayState::Streaming {
        mut events,
        mut tracker,
    } = state
    else {
        return None;
    };

    let part = match events.next().await {
        Some(Ok(ModelResponseEvent::MessageDelta(delta))) => {
            tracker.deltas += 1;
            let part = StreamPart::Text(delta).encode();
            return Some((part, RelayState::Streaming { events, tracker }));
        }
        Some(Ok(ModelResponseEvent::Completed(reason))) => {
            tracker.finish("completed");
            StreamPart::Finish {
                finish_reason: finish_reason(reason),
            }
        }
        // Without a completion event the answer may be cut short.
        None => {
            warn!(
                message_id = %tracker.message_id,
                "backend stream ended before completion"
            );
            tracker.finish("truncated");
            StreamPart::Error("model stream ended before completion".to_owned())
        }
        Some(Err(err)) => {
            error!(
                message_id = %tracker.message_id,
                "backend failed mid-stream: {err}"
            );
            tracker.finish("failed");
            StreamPart::Error(err.message().to_owned())
        }
    };
    Some((part.encode(), RelayState::Done))
}

#[inline]
fn finish_reason(reason: ModelFinishReason) -> FinishReason {
    match reason {
        ModelFinishReason::Stop => FinishReason::Stop,
        ModelFinishReason::Length => FinishReason::Length,
        ModelFinishReason::ContentFilter => FinishReason::ContentFilter,
    }
}

/// Follows one outbound stream. Dropped together with the backend events,
/// which is how a client disconnect shows up here.
struct Tracker {
    message_id: String,
    deltas: usize,
    finished: bool,
}

impl Tracker {
    fn new(message_id: String) -> Self {
        Self {
            message_id,
            deltas: 0,
            finished: false,
        }
    }

    fn finish(&mut self, outcome: &str) {
        self.finished = true;
        debug!(
            message_id = %self.message_id,
            deltas = self.deltas,
            "stream {outcome}"
        );
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                message_id = %self.message_id,
                deltas = self.deltas,
                "client went away, backend response released"
            );
        }
    }
}
