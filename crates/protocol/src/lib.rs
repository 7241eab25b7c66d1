//! Wire types shared by the chat endpoint and its clients.
//!
//! The request is a JSON body carrying the whole conversation. The
//! response is a "data stream": a sequence of `\n`-terminated lines, each
//! holding one [`StreamPart`] encoded as `<code>:<json>`. A well-formed
//! stream always ends with a finish part, so a client can tell a complete
//! answer from a connection that dropped halfway.

#![deny(missing_docs)]

mod frame;
mod message;

pub use frame::{FrameDecoder, FrameError, StreamPart};
pub use message::{ChatRequest, FinishReason, Role, WireMessage};

/// Path of the chat endpoint.
pub const CHAT_PATH: &str = "/api/chat";

/// Content type of a data stream response.
pub const STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Header that marks a response body as a data stream.
pub const STREAM_HEADER: &str = "x-data-stream";

/// Current value of [`STREAM_HEADER`].
pub const STREAM_VERSION: &str = "v1";
