//! Client side of the chat endpoint.
//!
//! [`ChatSession`] posts a conversation, grows the assistant reply chunk
//! by chunk and tracks the conversation state. The logic itself lives in
//! [`ChatMachine`], a plain state machine that can be driven by hand.

#![deny(missing_docs)]

#[macro_use]
extern crate tracing;

mod error;
mod machine;
mod message;
mod session;
mod transport;

pub use chat_relay_protocol::{ChatRequest, FinishReason, Role, StreamPart};
pub use error::{ChatError, SubmitError};
pub use machine::{ChatMachine, ChatState, Transition, TurnEvent, TurnId};
pub use message::{Conversation, Message, MessageId, MessageStatus};
pub use session::{
    ChatSession, ChatSessionBuilder, SessionClosedError, TurnOutcome,
};
pub use transport::{HttpPartStream, HttpTransport, PartStream, Transport};
