use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::FinishReason;

/// One unit of a data stream response.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamPart {
    /// The assistant message starts. Code `f`.
    Start {
        /// Identifier the endpoint assigned to the reply.
        message_id: String,
    },
    /// A piece of text to append to the reply. Code `0`.
    Text(String),
    /// The endpoint failed mid-stream. Code `3`.
    ///
    /// Nothing follows an error part, in particular no finish part.
    Error(String),
    /// The reply is complete. Code `d`.
    Finish {
        /// Why the model stopped.
        finish_reason: FinishReason,
    },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload<'a> {
    message_id: std::borrow::Cow<'a, str>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinishPayload {
    finish_reason: FinishReason,
}

impl StreamPart {
    /// Encodes the part as one line, the trailing line feed included.
    pub fn encode(&self) -> Bytes {
        let (code, payload) = match self {
            StreamPart::Start { message_id } => (
                'f',
                serde_json::to_string(&StartPayload {
                    message_id: message_id.as_str().into(),
                }),
            ),
            StreamPart::Text(text) => ('0', serde_json::to_string(text)),
            StreamPart::Error(message) => ('3', serde_json::to_string(message)),
            StreamPart::Finish { finish_reason } => (
                'd',
                serde_json::to_string(&FinishPayload {
                    finish_reason: *finish_reason,
                }),
            ),
        };
        // Serializing strings and these plain structs cannot fail, and JSON
        // escapes every line feed inside the payload.
        let payload = payload.unwrap_or_default();
        Bytes::from(format!("{code}:{payload}\n"))
    }

    /// Decodes one line, without its line feed.
    pub fn decode(line: &str) -> Result<Self, FrameError> {
        let Some((code, payload)) = line.split_once(':') else {
            return Err(FrameError::MissingSeparator(line.to_owned()));
        };
        let invalid = |err: serde_json::Error| FrameError::InvalidPayload {
            code: code.to_owned(),
            reason: err.to_string(),
        };
        let part = match code {
            "f" => {
                let start: StartPayload<'_> =
                    serde_json::from_str(payload).map_err(invalid)?;
                StreamPart::Start {
                    message_id: start.message_id.into_owned(),
                }
            }
            "0" => StreamPart::Text(
                serde_json::from_str(payload).map_err(invalid)?,
            ),
            "3" => StreamPart::Error(
                serde_json::from_str(payload).map_err(invalid)?,
            ),
            "d" => {
                let finish: FinishPayload =
                    serde_json::from_str(payload).map_err(invalid)?;
                StreamPart::Finish {
                    finish_reason: finish.finish_reason,
                }
            }
            _ => return Err(FrameError::UnknownCode(code.to_owned())),
        };
        Ok(part)
    }
}

/// Errors from decoding a data stream.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A line has no `<code>:` prefix.
    #[error("malformed frame: {0:?}")]
    MissingSeparator(String),
    /// A line uses a code this decoder does not know.
    #[error("unknown frame code: {0:?}")]
    UnknownCode(String),
    /// The payload of a line is not valid JSON for its code.
    #[error("invalid payload for frame {code:?}: {reason}")]
    InvalidPayload {
        /// Code of the offending line.
        code: String,
        /// What the JSON parser reported.
        reason: String,
    },
    /// A line is not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    /// The body ended in the middle of a line.
    #[error("stream ended inside a frame")]
    Truncated,
}

/// Incremental decoder turning network chunks into [`StreamPart`]s.
///
/// Chunk boundaries are arbitrary: a line, or a UTF-8 sequence, may be
/// split over several chunks. Parts come out in the order their lines
/// were received.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    #[inline]
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Takes the next complete part out of the buffer.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn next_part(&mut self) -> Result<Option<StreamPart>, FrameError> {
        loop {
            let Some(eol_idx) = self.buf.iter().position(|b| *b == b'\n')
            else {
                return Ok(None);
            };
            let line = self.buf.drain(..=eol_idx).collect::<Vec<_>>();
            let Ok(line) = str::from_utf8(&line[..eol_idx]) else {
                return Err(FrameError::InvalidUtf8);
            };
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            return StreamPart::decode(line).map(Some);
        }
    }

    /// Checks that the body did not stop halfway through a line.
    ///
    /// Call this once the underlying stream is exhausted and
    /// [`Self::next_part`] returns `Ok(None)`.
    #[inline]
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.iter().all(u8::is_ascii_whitespace) {
            Ok(())
        } else {
            Err(FrameError::Truncated)
        }
    }
}
