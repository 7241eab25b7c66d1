use std::fmt::{self, Debug};
use std::sync::Arc;

use chat_relay_protocol::StreamPart;
use thiserror::Error;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::{ChatError, SubmitError};
use crate::machine::{ChatMachine, ChatState, Transition, TurnEvent, TurnId};
use crate::message::{Conversation, Message};
use crate::transport::{PartStream, Transport};

type UpdateCallback = Box<dyn Fn(&Message) + Send + Sync>;
type StateCallback = Box<dyn Fn(ChatState) + Send + Sync>;

/// The session task has stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("session is closed")]
pub struct SessionClosedError;

/// How a submitted turn ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The reply is complete.
    Completed(Message),
    /// The turn broke. `partial` is the reply as far as it got.
    Failed {
        /// What went wrong.
        error: ChatError,
        /// The reply received before the failure, if any.
        partial: Option<Message>,
    },
    /// The turn was cancelled. `partial` is the reply as far as it got.
    Cancelled {
        /// The reply received before cancelling, if any.
        partial: Option<Message>,
    },
}

/// A session builder.
///
/// See [`ChatSession`].
pub struct ChatSessionBuilder<T> {
    transport: T,
    on_update: Option<UpdateCallback>,
    on_state_change: Option<StateCallback>,
}

impl<T: Transport> ChatSessionBuilder<T> {
    /// Creates a session builder with the transport to post through.
    #[inline]
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            on_update: None,
            on_state_change: None,
        }
    }

    /// Attaches a callback to be invoked whenever a message is added or
    /// changed, in particular once per received chunk.
    #[inline]
    pub fn on_update(
        mut self,
        on_update: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Self {
        self.on_update = Some(Box::new(on_update));
        self
    }

    /// Attaches a callback to be invoked when the session changes state.
    #[inline]
    pub fn on_state_change(
        mut self,
        on_state_change: impl Fn(ChatState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Box::new(on_state_change));
        self
    }

    /// Spawns the session task. Must be called within a tokio runtime.
    pub fn build(self) -> ChatSession {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ChatState::Idle);

        let driver = SessionDriver {
            transport: Arc::new(self.transport),
            machine: ChatMachine::new(),
            running: None,
            event_tx,
            state_tx,
            on_update: self.on_update,
            on_state_change: self.on_state_change,
        };
        tokio::spawn(
            driver
                .run(cmd_rx, event_rx)
                .instrument(trace_span!("chat session")),
        );

        ChatSession { cmd_tx, state_rx }
    }
}

/// A conversation with a chat endpoint.
///
/// The conversation lives in a background task that owns the in-flight
/// request. Handles are cheap to clone. When the last one is dropped the
/// task stops, aborting the request if there is one.
#[derive(Clone)]
pub struct ChatSession {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ChatState>,
}

impl ChatSession {
    /// Appends a user message and posts the conversation.
    ///
    /// The submission is made right away, the returned future resolves
    /// when the turn ends. It is refused while another turn is in flight.
    pub fn submit(
        &self,
        text: impl Into<String>,
    ) -> impl Future<Output = Result<TurnOutcome, SubmitError>> + Send + 'static
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self.cmd_tx.send(Command::Submit {
            text: text.into(),
            reply: reply_tx,
        });
        async move {
            sent.map_err(|_| SubmitError::Closed)?;
            reply_rx.await.map_err(|_| SubmitError::Closed)?
        }
    }

    /// Cancels the turn in flight, if any.
    ///
    /// What was already received stays in the conversation. Nothing from
    /// the cancelled request is applied afterwards.
    #[inline]
    pub fn cancel(&self) {
        self.cmd_tx.send(Command::Cancel).ok();
    }

    /// Returns a copy of the conversation.
    pub async fn snapshot(&self) -> Result<Conversation, SessionClosedError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| SessionClosedError)?;
        reply_rx.await.map_err(|_| SessionClosedError)
    }

    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> ChatState {
        *self.state_rx.borrow()
    }
}

enum Command {
    Submit {
        text: String,
        reply: oneshot::Sender<Result<TurnOutcome, SubmitError>>,
    },
    Cancel,
    Snapshot(oneshot::Sender<Conversation>),
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Submit { text, .. } => {
                f.debug_struct("Submit").field("text", text).finish()
            }
            Command::Cancel => f.write_str("Cancel"),
            Command::Snapshot(_) => f.write_str("Snapshot"),
        }
    }
}

struct RunningTurn {
    id: TurnId,
    task: JoinHandle<()>,
    reply: oneshot::Sender<Result<TurnOutcome, SubmitError>>,
}

struct SessionDriver<T> {
    transport: Arc<T>,
    machine: ChatMachine,
    running: Option<RunningTurn>,
    event_tx: mpsc::UnboundedSender<(TurnId, TurnEvent)>,
    state_tx: watch::Sender<ChatState>,
    on_update: Option<UpdateCallback>,
    on_state_change: Option<StateCallback>,
}

impl<T: Transport> SessionDriver<T> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut event_rx: mpsc::UnboundedReceiver<(TurnId, TurnEvent)>,
    ) {
        debug!("started");
        loop {
            select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        break;
                    };
                    trace!("received command: {cmd:?}");
                    self.handle_command(cmd);
                }
                // The driver holds a sender, so this never yields `None`.
                Some((turn, event)) = event_rx.recv() => {
                    self.handle_event(turn, event);
                }
            }
        }

        if let Some(running) = self.running.take() {
            debug!("all handles dropped, aborting the request in flight");
            running.task.abort();
        }
        debug!("will terminate");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { text, reply } => self.submit(text, reply),
            Command::Cancel => self.cancel(),
            Command::Snapshot(reply) => {
                reply.send(self.machine.conversation().clone()).ok();
            }
        }
    }

    fn submit(
        &mut self,
        text: String,
        reply: oneshot::Sender<Result<TurnOutcome, SubmitError>>,
    ) {
        let (turn, request) = match self.machine.submit(&text) {
            Ok(submitted) => submitted,
            Err(err) => {
                debug!("submission refused: {err}");
                reply.send(Err(err)).ok();
                return;
            }
        };
        if let (Some(on_update), Some(user_msg)) =
            (&self.on_update, self.machine.conversation().last())
        {
            on_update(user_msg);
        }
        self.notify_state();

        let open = self.transport.open(&request);
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(
            drive_turn::<T>(open, turn, event_tx)
                .instrument(trace_span!("turn", id = ?turn)),
        );
        self.running = Some(RunningTurn {
            id: turn,
            task,
            reply,
        });
    }

    fn cancel(&mut self) {
        let Some((turn, transition)) = self.machine.cancel() else {
            trace!("nothing to cancel");
            return;
        };
        debug!("cancelling turn {turn:?}");

        let partial = self.notify(transition);
        if let Some(running) = self.running.take() {
            debug_assert_eq!(running.id, turn);
            running.task.abort();
            running
                .reply
                .send(Ok(TurnOutcome::Cancelled { partial }))
                .ok();
        }
    }

    fn handle_event(&mut self, turn: TurnId, event: TurnEvent) {
        let ends_turn = !matches!(event, TurnEvent::Delta(_));
        let Some(transition) = self.machine.apply(turn, event) else {
            trace!("dropped event of stale turn {turn:?}");
            return;
        };
        let message = self.notify(transition);
        if !ends_turn {
            return;
        }

        let Some(running) = self.running.take() else {
            return;
        };
        let outcome = match (self.machine.last_error(), message) {
            (Some(error), partial) => TurnOutcome::Failed {
                error: error.clone(),
                partial,
            },
            (None, Some(message)) => TurnOutcome::Completed(message),
            (None, None) => {
                error!("turn finished without an assistant message");
                return;
            }
        };
        running.reply.send(Ok(outcome)).ok();
    }

    /// Reports a transition to the callbacks, returning the touched message.
    fn notify(&self, transition: Transition) -> Option<Message> {
        let message = transition
            .message
            .and_then(|id| self.machine.message(id))
            .cloned();
        if let (Some(on_update), Some(message)) = (&self.on_update, &message) {
            on_update(message);
        }
        if transition.state.is_some() {
            self.notify_state();
        }
        message
    }

    fn notify_state(&self) {
        let state = self.machine.state();
        trace!("state changed to {state:?}");
        self.state_tx.send_replace(state);
        if let Some(on_state_change) = &self.on_state_change {
            on_state_change(state);
        }
    }
}

async fn drive_turn<T: Transport>(
    open: impl Future<Output = Result<T::Stream, ChatError>>,
    turn: TurnId,
    event_tx: mpsc::UnboundedSender<(TurnId, TurnEvent)>,
) {
    let mut stream = match open.await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("request failed: {err}");
            event_tx.send((turn, TurnEvent::Failed(err))).ok();
            return;
        }
    };

    loop {
        let event = match stream.next_part().await {
            Ok(Some(StreamPart::Start { message_id })) => {
                debug!("reply started: {message_id}");
                continue;
            }
            Ok(Some(StreamPart::Text(delta))) => TurnEvent::Delta(delta),
            Ok(Some(StreamPart::Finish { finish_reason })) => {
                TurnEvent::Finished(finish_reason)
            }
            Ok(Some(StreamPart::Error(message))) => {
                TurnEvent::Failed(ChatError::Remote(message))
            }
            Ok(None) => TurnEvent::Failed(ChatError::UnexpectedEof),
            Err(err) => TurnEvent::Failed(err),
        };
        if let TurnEvent::Failed(err) = &event {
            warn!("turn failed: {err}");
        }

        let ends_turn = !matches!(event, TurnEvent::Delta(_));
        if event_tx.send((turn, event)).is_err() || ends_turn {
            break;
        }
    }
    trace!("finished");
}
