use super::{Chunks, ChunksError};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ChunksError(ChunksError),
    InvalidPayload,
    /// The body ended in the middle of an event.
    Truncated,
}

/// A type for reading server-sent events from a chunk stream.
///
/// Only the `data` field matters to the chat completion stream, other
/// fields and comments are skipped. Multiple `data` lines in one event
/// are joined with a line feed.
pub struct Sse {
    buf: Vec<u8>,
    chunks: Chunks,
    exhausted: bool,
}

impl Sse {
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: Vec::new(),
            chunks,
            exhausted: false,
        }
    }

    pub async fn next_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            // Drain what is already buffered before waiting on the network,
            // one network chunk may carry several events.
            if let Some(event) = self.try_parse_event()? {
                return Ok(Some(event));
            }
            if self.exhausted {
                if !self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Err(Error::Truncated);
                }
                return Ok(None);
            }

            match self.chunks.next_chunk().await.map_err(Error::ChunksError)? {
                Some(bytes) => self.buf.extend_from_slice(&bytes),
                None => self.exhausted = true,
            }
        }
    }

    fn try_parse_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            let Some((block_len, sep_len)) = find_event_boundary(&self.buf)
            else {
                return Ok(None);
            };

            let block = self.buf.drain(..block_len + sep_len).collect::<Vec<_>>();
            let Ok(block) = str::from_utf8(&block[..block_len]) else {
                return Err(Error::InvalidPayload);
            };

            let mut data: Option<String> = None;
            for line in block.lines() {
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                let (name, value) = match line.split_once(':') {
                    Some((name, value)) => {
                        (name, value.strip_prefix(' ').unwrap_or(value))
                    }
                    None => (line, ""),
                };
                match name {
                    "data" => {
                        let data = data.get_or_insert_default();
                        if !data.is_empty() {
                            data.push('\n');
                        }
                        data.push_str(value);
                    }
                    "event" | "id" | "retry" => {}
                    _ => return Err(Error::InvalidPayload),
                }
            }

            // Blocks with comments only carry no event, keep looking.
            if let Some(data) = data {
                return Ok(Some(data));
            }
        }
    }
}

/// Finds the first blank line, returns the event length and the length of
/// the separator that ends it.
fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|idx| (idx, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|idx| (idx, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_normal_events() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data: hello\n\n"),
                Bytes::from_static(b"data: bye\n\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hello");
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "bye");
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quirk_streaming() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data:"),
                Bytes::from_static(b" hello\n"),
                Bytes::from_static(b"\n: keep-alive\n\ndata: a\n\ndata: b\n\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hello");
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "a");
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "b");
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_split_utf8() {
        let text = "data: 你好\n\n".as_bytes();
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::copy_from_slice(&text[..8]),
                Bytes::copy_from_slice(&text[8..]),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "你好");
    }

    #[tokio::test]
    async fn test_invalid_data() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"xxxxxx: 1\n\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap_err(), Error::InvalidPayload);

        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"data: hello\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap_err(), Error::Truncated);
    }

    #[tokio::test]
    async fn test_trailing_blank_lines() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"data: hello\n\n\r\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hello");
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_broken_body() {
        let chunks = Chunks::from_results(
            vec![
                Ok(Bytes::from_static(b"data: hello\n\n")),
                Err(ChunksError("reset".to_owned())),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hello");
        assert!(matches!(
            sse.next_event().await,
            Err(Error::ChunksError(_))
        ));
    }
}
