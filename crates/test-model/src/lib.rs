//! A local fake model for testing purpose.

mod preset;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use chat_relay_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    events: Vec<PresetEvent>,
    event_idx: usize,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    journal: Arc<Mutex<Journal>>,
}

impl Drop for TestModelResponse {
    fn drop(&mut self) {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live_responses -= 1;
    }
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();

        if let Some(sleep) = &mut this.sleep {
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;

            let idx = this.event_idx;
            if idx < this.events.len() {
                this.event_idx += 1;
                return match &this.events[idx] {
                    PresetEvent::MessageDelta(msg) => Poll::Ready(Ok(Some(
                        ModelResponseEvent::MessageDelta(msg.clone()),
                    ))),
                    PresetEvent::Fault(reason) => {
                        // Nothing follows a fault.
                        this.event_idx = usize::MAX;
                        Poll::Ready(Err(Error::new(
                            reason.clone(),
                            ErrorKind::Unavailable,
                        )))
                    }
                };
            } else if idx == this.events.len() {
                this.event_idx += 1;
                return Poll::Ready(Ok(Some(ModelResponseEvent::Completed(
                    ModelFinishReason::Stop,
                ))));
            } else {
                // In case this method is called after completion.
                return Poll::Ready(Ok(None));
            }
        }

        if this.event_idx > this.events.len() {
            return Poll::Ready(Ok(None));
        }
        this.sleep = Some(Box::pin(sleep(this.delay)));
        Pin::new(this).poll_next_event(cx)
    }
}

#[derive(Clone)]
enum ConversationStep {
    UserInput,
    AssistantResponse(PresetResponse),
}

#[derive(Default)]
struct Journal {
    requests: Vec<ModelRequest>,
    attempts: HashMap<usize, u64>,
    live_responses: usize,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the conversation script, which
/// is how the model should respond to a request. The step is selected by
/// the number of non-system messages in the request, so a request carrying
/// one user message is answered by the second step. If there are no enough
/// steps in the script, an error will be returned.
///
/// Every request is recorded, clones of the provider share the same record.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    conversation_script: Vec<ConversationStep>,
    delay: Option<Duration>,
    journal: Arc<Mutex<Journal>>,
}

impl TestModelProvider {
    #[inline]
    pub fn add_assistant_response_step(&mut self, preset: PresetResponse) {
        self.conversation_script
            .push(ConversationStep::AssistantResponse(preset));
    }

    #[inline]
    pub fn add_user_input_step(&mut self) {
        self.conversation_script.push(ConversationStep::UserInput);
    }

    /// Adds a user input step followed by the assistant's reply to it.
    #[inline]
    pub fn add_turn(&mut self, preset: PresetResponse) {
        self.add_user_input_step();
        self.add_assistant_response_step(preset);
    }

    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns all requests received so far, in arrival order.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }

    /// Returns how many responses handed out are still alive.
    pub fn live_responses(&self) -> usize {
        self.journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live_responses
    }

    fn open(&self, req: &ModelRequest) -> Result<TestModelResponse, Error> {
        let mut journal =
            self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        journal.requests.push(req.clone());

        let step_idx = req.conversation_len();
        let Some(step) = self.conversation_script.get(step_idx) else {
            return Err(Error::new("no enough steps", ErrorKind::Other));
        };
        let preset = match step {
            ConversationStep::UserInput => {
                return Err(Error::new(
                    "not an assistant response step",
                    ErrorKind::Moderated,
                ));
            }
            ConversationStep::AssistantResponse(preset) => preset,
        };

        let attempts = journal.attempts.entry(step_idx).or_default();
        *attempts += 1;
        match preset.failures {
            Some(0) => {
                return Err(Error::new(
                    "scripted failure",
                    ErrorKind::RateLimitExceeded,
                ));
            }
            Some(failures) if *attempts <= failures => {
                return Err(Error::new(
                    "scripted failure",
                    ErrorKind::RateLimitExceeded,
                ));
            }
            _ => {}
        }

        journal.live_responses += 1;
        Ok(TestModelResponse {
            events: preset.events.clone(),
            event_idx: 0,
            delay: self.delay.unwrap_or(Duration::from_millis(1)),
            sleep: None,
            journal: Arc::clone(&self.journal),
        })
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        ready(self.open(req))
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use chat_relay_model::{ModelMessage, ModelRequest};

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> (String, Result<Option<ModelFinishReason>, Error>) {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut finish_reason = None;
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await;
            match event {
                Ok(Some(ModelResponseEvent::MessageDelta(delta))) => {
                    msg.push_str(&delta);
                }
                Ok(Some(ModelResponseEvent::Completed(reason))) => {
                    finish_reason = Some(reason);
                }
                Ok(None) => return (msg, Ok(finish_reason)),
                Err(err) => return (msg, Err(err)),
            }
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut provider = TestModelProvider::default();
        provider.add_turn(PresetResponse::with_deltas(["Hello, ", "world!"]));
        provider.add_turn(PresetResponse::with_deltas([
            "Sure, ",
            "let me take a ",
            "look.",
        ]));

        let mut req = ModelRequest {
            messages: vec![
                ModelMessage::System("Be nice.".to_owned()),
                ModelMessage::User("Hi".to_owned()),
            ],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, finish_reason) = collect_response(resp).await;
        assert_eq!(msg, "Hello, world!");
        assert_eq!(finish_reason.unwrap(), Some(ModelFinishReason::Stop));

        req.messages.push(ModelMessage::Assistant(msg));
        req.messages
            .push(ModelMessage::User("Check my todo".to_owned()));
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, _) = collect_response(resp).await;
        assert_eq!(msg, "Sure, let me take a look.");

        let requests = provider.clone().requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1], req);
    }

    #[tokio::test]
    async fn test_mid_stream_fault() {
        let mut provider = TestModelProvider::default();
        provider.add_turn(PresetResponse::with_events([
            PresetEvent::MessageDelta("Half ".to_owned()),
            PresetEvent::Fault("connection reset".to_owned()),
            PresetEvent::MessageDelta("never sent".to_owned()),
        ]));

        let req = ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
        };
        let resp = provider.send_request(&req).await.unwrap();
        let mut resp = pin!(resp);
        let (msg, result) = collect_response_pinned(resp.as_mut()).await;
        assert_eq!(msg, "Half ");
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Unavailable);

        let after = poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await;
        assert!(matches!(after, Ok(None)));
    }

    async fn collect_response_pinned(
        mut resp: Pin<&mut TestModelResponse>,
    ) -> (String, Result<(), Error>) {
        let mut msg = String::new();
        loop {
            match poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await {
                Ok(Some(ModelResponseEvent::MessageDelta(delta))) => {
                    msg.push_str(&delta);
                }
                Ok(Some(ModelResponseEvent::Completed(_))) => {}
                Ok(None) => return (msg, Ok(())),
                Err(err) => return (msg, Err(err)),
            }
        }
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let mut provider = TestModelProvider::default();
        provider.add_turn(PresetResponse::with_deltas(["ok"]).with_failures(1));

        let req = ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
        };
        let err = provider.send_request(&req).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);

        let resp = provider.send_request(&req).await.unwrap();
        let (msg, _) = collect_response(resp).await;
        assert_eq!(msg, "ok");
    }

    #[tokio::test]
    async fn test_live_responses() {
        let mut provider = TestModelProvider::default();
        provider.add_turn(PresetResponse::with_deltas(["a", "b"]));

        let req = ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
        };
        let first = provider.send_request(&req).await.unwrap();
        let second = provider.send_request(&req).await.unwrap();
        assert_eq!(provider.live_responses(), 2);

        drop(first);
        assert_eq!(provider.live_responses(), 1);
        let (msg, _) = collect_response(second).await;
        assert_eq!(msg, "ab");
        assert_eq!(provider.live_responses(), 0);
    }

    #[tokio::test]
    async fn test_missing_step() {
        let provider = TestModelProvider::default();
        let req = ModelRequest {
            messages: vec![ModelMessage::User("Hi".to_owned())],
        };
        let err = provider.send_request(&req).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert_eq!(provider.requests().len(), 1);
    }
}
