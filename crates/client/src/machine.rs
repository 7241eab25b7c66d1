//! The per-conversation state machine.
//!
//! Every input (a submission, a stream event, a cancellation) is one
//! transition. The machine does no I/O, the session feeds it.

use chat_relay_protocol::{ChatRequest, FinishReason, Role};

use crate::error::{ChatError, SubmitError};
use crate::message::{Conversation, Message, MessageId, MessageStatus};

/// State of a conversation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChatState {
    /// No request in flight.
    #[default]
    Idle,
    /// The request is out, nothing received yet.
    Sending,
    /// The reply is growing.
    Streaming,
    /// The last turn ended abnormally.
    Errored,
}

impl ChatState {
    /// Whether a request is in flight, new input must wait.
    #[inline]
    pub fn is_busy(self) -> bool {
        matches!(self, ChatState::Sending | ChatState::Streaming)
    }
}

/// Identifies one request/reply cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(u64);

/// What the transport reported for a turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TurnEvent {
    /// A piece of the reply.
    Delta(String),
    /// The reply is complete.
    Finished(FinishReason),
    /// The turn broke.
    Failed(ChatError),
}

/// The visible effect of a transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Transition {
    /// Message whose content or status changed.
    pub message: Option<MessageId>,
    /// The new state, if it changed.
    pub state: Option<ChatState>,
}

struct ActiveTurn {
    id: TurnId,
    assistant_idx: Option<usize>,
}

/// A conversation plus the state of its current turn.
#[derive(Default)]
pub struct ChatMachine {
    conversation: Conversation,
    state: ChatState,
    active: Option<ActiveTurn>,
    next_turn: u64,
    last_error: Option<ChatError>,
    last_finish_reason: Option<FinishReason>,
}

impl ChatMachine {
    /// Creates an idle machine with an empty conversation.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> ChatState {
        self.state
    }

    /// Returns the conversation so far.
    #[inline]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// The error that ended the last turn, cleared by the next submission.
    #[inline]
    pub fn last_error(&self) -> Option<&ChatError> {
        self.last_error.as_ref()
    }

    /// Why the last completed reply stopped.
    #[inline]
    pub fn last_finish_reason(&self) -> Option<FinishReason> {
        self.last_finish_reason
    }

    /// Returns the message with the given id.
    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.conversation.messages().iter().find(|msg| msg.id() == id)
    }

    /// Appends a user message and opens a turn for it.
    ///
    /// Returns the request to post, carrying the whole history.
    pub fn submit(
        &mut self,
        text: &str,
    ) -> Result<(TurnId, ChatRequest), SubmitError> {
        if self.state.is_busy() {
            return Err(SubmitError::Busy);
        }
        if text.trim().is_empty() {
            return Err(SubmitError::EmptyInput);
        }

        self.conversation.push(Message::new(
            Role::User,
            text.to_owned(),
            MessageStatus::Complete,
        ));
        self.next_turn += 1;
        let id = TurnId(self.next_turn);
        self.active = Some(ActiveTurn {
            id,
            assistant_idx: None,
        });
        self.state = ChatState::Sending;
        self.last_error = None;
        self.last_finish_reason = None;

        let request = ChatRequest {
            messages: self.conversation.to_wire(),
        };
        Ok((id, request))
    }

    /// Applies an event of the given turn.
    ///
    /// Events of a turn that is no longer active (finished, failed or
    /// cancelled) are dropped and `None` is returned.
    pub fn apply(&mut self, turn: TurnId, event: TurnEvent) -> Option<Transition> {
        let active = self.active.as_mut().filter(|active| active.id == turn)?;
        let mut transition = Transition::default();

        match event {
            TurnEvent::Delta(delta) => {
                let idx = match active.assistant_idx {
                    Some(idx) => idx,
                    None => {
                        let idx = self.conversation.push(Message::new(
                            Role::Assistant,
                            String::new(),
                            MessageStatus::Streaming,
                        ));
                        active.assistant_idx = Some(idx);
                        self.state = ChatState::Streaming;
                        transition.state = Some(ChatState::Streaming);
                        idx
                    }
                };
                let message = self.conversation.get_mut(idx);
                message.append(&delta);
                transition.message = Some(message.id());
            }
            TurnEvent::Finished(reason) => {
                // A reply without any text still answers the user message.
                let idx = active.assistant_idx.unwrap_or_else(|| {
                    self.conversation.push(Message::new(
                        Role::Assistant,
                        String::new(),
                        MessageStatus::Streaming,
                    ))
                });
                let message = self.conversation.get_mut(idx);
                message.freeze(MessageStatus::Complete);
                transition.message = Some(message.id());
                self.active = None;
                self.last_finish_reason = Some(reason);
                self.state = ChatState::Idle;
                transition.state = Some(ChatState::Idle);
            }
            TurnEvent::Failed(err) => {
                if let Some(idx) = active.assistant_idx {
                    let message = self.conversation.get_mut(idx);
                    message.freeze(MessageStatus::Failed);
                    transition.message = Some(message.id());
                }
                self.active = None;
                self.last_error = Some(err);
                self.state = ChatState::Errored;
                transition.state = Some(ChatState::Errored);
            }
        }

        Some(transition)
    }

    /// Ends the active turn on purpose.
    ///
    /// What already arrived is kept, frozen as cancelled. Returns the
    /// cancelled turn, or `None` if nothing was in flight.
    pub fn cancel(&mut self) -> Option<(TurnId, Transition)> {
        let active = self.active.take()?;
        let mut transition = Transition {
            message: None,
            state: Some(ChatState::Idle),
        };
        if let Some(idx) = active.assistant_idx {
            let message = self.conversation.get_mut(idx);
            message.freeze(MessageStatus::Cancelled);
            transition.message = Some(message.id());
        }
        self.state = ChatState::Idle;
        Some((active.id, transition))
    }
}

#[cfg(test)]
mod tests {
    use chat_relay_protocol::WireMessage;

    use super::*;

    fn contents(machine: &ChatMachine) -> Vec<(Role, &str, MessageStatus)> {
        machine
            .conversation()
            .messages()
            .iter()
            .map(|msg| (msg.role(), msg.content(), msg.status()))
            .collect()
    }

    #[test]
    fn test_round_trip() {
        let mut machine = ChatMachine::new();
        let mut states = vec![machine.state()];

        let (turn, request) = machine.submit("2+2=?").unwrap();
        states.push(machine.state());
        assert_eq!(
            request.messages,
            vec![WireMessage::new(Role::User, "2+2=?")]
        );

        let transition = machine
            .apply(turn, TurnEvent::Delta("4".to_owned()))
            .unwrap();
        states.push(machine.state());
        assert_eq!(transition.state, Some(ChatState::Streaming));

        machine
            .apply(turn, TurnEvent::Finished(FinishReason::Stop))
            .unwrap();
        states.push(machine.state());

        assert_eq!(
            states,
            vec![
                ChatState::Idle,
                ChatState::Sending,
                ChatState::Streaming,
                ChatState::Idle
            ]
        );
        assert_eq!(
            contents(&machine),
            vec![
                (Role::User, "2+2=?", MessageStatus::Complete),
                (Role::Assistant, "4", MessageStatus::Complete),
            ]
        );
        assert_eq!(machine.last_finish_reason(), Some(FinishReason::Stop));
    }

    #[test]
    fn test_deltas_append_in_order() {
        let mut machine = ChatMachine::new();
        let (turn, _) = machine.submit("tell me").unwrap();
        let deltas = ["# Title\n", "", "- item `a", "`\n", "$$x^2$$"];
        for delta in deltas {
            machine.apply(turn, TurnEvent::Delta(delta.to_owned()));
            // Exactly one assistant message grows.
            assert_eq!(machine.conversation().len(), 2);
        }
        machine.apply(turn, TurnEvent::Finished(FinishReason::Stop));
        assert_eq!(
            machine.conversation().last().unwrap().content(),
            deltas.concat()
        );
    }

    #[test]
    fn test_second_submission_is_refused() {
        let mut machine = ChatMachine::new();
        let (turn, _) = machine.submit("first").unwrap();
        assert_eq!(machine.submit("second"), Err(SubmitError::Busy));

        machine.apply(turn, TurnEvent::Delta("a".to_owned()));
        assert_eq!(machine.submit("second"), Err(SubmitError::Busy));
        assert_eq!(machine.conversation().len(), 2);

        machine.apply(turn, TurnEvent::Finished(FinishReason::Stop));
        let (_, request) = machine.submit("second").unwrap();
        assert_eq!(request.messages.len(), 3);
    }

    #[test]
    fn test_empty_input_is_refused() {
        let mut machine = ChatMachine::new();
        assert_eq!(machine.submit("  \n"), Err(SubmitError::EmptyInput));
        assert_eq!(machine.state(), ChatState::Idle);
        assert!(machine.conversation().is_empty());
    }

    #[test]
    fn test_failure_keeps_partial_content() {
        let mut machine = ChatMachine::new();
        let (turn, _) = machine.submit("hi").unwrap();
        machine.apply(turn, TurnEvent::Delta("Hel".to_owned()));
        let transition = machine
            .apply(turn, TurnEvent::Failed(ChatError::UnexpectedEof))
            .unwrap();

        assert_eq!(transition.state, Some(ChatState::Errored));
        assert_eq!(machine.state(), ChatState::Errored);
        assert_eq!(machine.last_error(), Some(&ChatError::UnexpectedEof));
        assert_eq!(
            contents(&machine)[1],
            (Role::Assistant, "Hel", MessageStatus::Failed)
        );

        // Late events of the failed turn change nothing.
        assert!(
            machine
                .apply(turn, TurnEvent::Finished(FinishReason::Stop))
                .is_none()
        );
        assert_eq!(machine.state(), ChatState::Errored);

        // The broken answer is not sent back.
        let (_, request) = machine.submit("again").unwrap();
        assert_eq!(
            request.messages,
            vec![
                WireMessage::new(Role::User, "hi"),
                WireMessage::new(Role::User, "again"),
            ]
        );
        assert_eq!(machine.last_error(), None);
    }

    #[test]
    fn test_failure_before_first_delta() {
        let mut machine = ChatMachine::new();
        let (turn, _) = machine.submit("hi").unwrap();
        machine.apply(
            turn,
            TurnEvent::Failed(ChatError::Rejected {
                status: 429,
                message: "slow down".to_owned(),
            }),
        );
        assert_eq!(machine.state(), ChatState::Errored);
        assert_eq!(machine.conversation().len(), 1);
    }

    #[test]
    fn test_finish_without_deltas() {
        let mut machine = ChatMachine::new();
        let (turn, _) = machine.submit("hi").unwrap();
        machine.apply(turn, TurnEvent::Finished(FinishReason::ContentFilter));
        assert_eq!(
            contents(&machine)[1],
            (Role::Assistant, "", MessageStatus::Complete)
        );
        assert_eq!(machine.state(), ChatState::Idle);
    }

    #[test]
    fn test_cancel_drops_late_events() {
        let mut machine = ChatMachine::new();
        assert!(machine.cancel().is_none());

        let (turn, _) = machine.submit("count").unwrap();
        for delta in ["1 ", "2 ", "3 "] {
            machine.apply(turn, TurnEvent::Delta(delta.to_owned()));
        }
        let (cancelled, _) = machine.cancel().unwrap();
        assert_eq!(cancelled, turn);
        assert_eq!(machine.state(), ChatState::Idle);

        for delta in ["4 ", "5 "] {
            assert!(
                machine
                    .apply(turn, TurnEvent::Delta(delta.to_owned()))
                    .is_none()
            );
        }
        assert_eq!(
            contents(&machine)[1],
            (Role::Assistant, "1 2 3 ", MessageStatus::Cancelled)
        );

        // Events of the old turn cannot leak into the next one either.
        let (next, _) = machine.submit("again").unwrap();
        assert_ne!(next, turn);
        assert!(
            machine
                .apply(turn, TurnEvent::Delta("stale".to_owned()))
                .is_none()
        );
        assert_eq!(machine.conversation().len(), 3);
    }
}
