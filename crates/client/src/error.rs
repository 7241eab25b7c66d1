use chat_relay_protocol::FrameError;
use thiserror::Error;

/// Why a turn ended abnormally.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ChatError {
    /// The endpoint answered with a non-success status before streaming.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code of the answer.
        status: u16,
        /// The error the endpoint reported, or the raw body.
        message: String,
    },
    /// The connection could not be made or broke while reading.
    #[error("network error: {0}")]
    Network(String),
    /// The endpoint answered with something that is not a data stream.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    /// The stream could not be decoded.
    #[error("malformed stream: {0}")]
    Framing(#[from] FrameError),
    /// The endpoint reported a failure through the stream.
    #[error("server error: {0}")]
    Remote(String),
    /// The stream stopped without its finish part.
    #[error("stream ended before the answer was complete")]
    UnexpectedEof,
}

/// Why a submission was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// A request is already in flight for this conversation.
    #[error("a reply is still in progress")]
    Busy,
    /// There is nothing to send.
    #[error("input is empty")]
    EmptyInput,
    /// The session has been closed.
    #[error("session is closed")]
    Closed,
}
