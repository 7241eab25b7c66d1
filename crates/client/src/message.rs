//! Conversation types kept by the client.

use std::fmt::{self, Display};

use chat_relay_protocol::{Role, WireMessage};
use uuid::Uuid;

/// Identifier of a message, unique within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    #[inline]
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Where a message is in its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    /// Deltas are still being appended.
    Streaming,
    /// The message is final.
    Complete,
    /// The stream broke, the content is whatever arrived before that.
    Failed,
    /// The turn was cancelled, the content is whatever arrived before that.
    Cancelled,
}

/// One turn of a conversation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    role: Role,
    content: String,
    status: MessageStatus,
}

impl Message {
    pub(crate) fn new(role: Role, content: String, status: MessageStatus) -> Self {
        Self {
            id: MessageId::new(),
            role,
            content,
            status,
        }
    }

    /// Returns the identifier of the message.
    #[inline]
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Returns who wrote the message.
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the text received so far.
    #[inline]
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Returns where the message is in its lifetime.
    #[inline]
    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// Whether the content can still grow.
    #[inline]
    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    #[inline]
    pub(crate) fn append(&mut self, delta: &str) {
        debug_assert!(self.is_streaming(), "appending to a frozen message");
        self.content.push_str(delta);
    }

    #[inline]
    pub(crate) fn freeze(&mut self, status: MessageStatus) {
        self.status = status;
    }
}

/// An ordered list of messages. Messages are only ever appended.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    /// Returns all messages, oldest first.
    #[inline]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the newest message.
    #[inline]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Returns the number of messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing has been said yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn push(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Message {
        &mut self.messages[idx]
    }

    /// Builds the history sent with the next request.
    ///
    /// Answers that broke halfway are left out, they were never a valid
    /// reply and would mislead the model.
    pub(crate) fn to_wire(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .filter(|msg| msg.status != MessageStatus::Failed)
            .map(|msg| WireMessage::new(msg.role, msg.content.clone()))
            .collect()
    }
}
