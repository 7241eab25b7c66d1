#[cfg(test)]
use std::collections::VecDeque;

use bytes::Bytes;
use reqwest::Response;

#[derive(Debug, PartialEq, Eq)]
pub struct Error(pub String);

/// An adapter for streaming byte chunks.
pub enum Chunks {
    Response(Response),
    #[cfg(test)]
    VecDeque(VecDeque<Result<Bytes, Error>>),
}

impl Chunks {
    pub fn from_response(response: Response) -> Self {
        Chunks::Response(response)
    }

    #[cfg(test)]
    pub fn from_vec_deque(vec: VecDeque<Bytes>) -> Self {
        Chunks::VecDeque(vec.into_iter().map(Ok).collect())
    }

    #[cfg(test)]
    pub fn from_results(vec: VecDeque<Result<Bytes, Error>>) -> Self {
        Chunks::VecDeque(vec)
    }

    /// Reads the next chunk, `None` means the body has ended.
    ///
    /// # Cancel safety
    ///
    /// Dropping the returned future drops nothing but the pending read,
    /// the connection is released when `Chunks` itself is dropped.
    #[inline]
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, Error> {
        match self {
            Chunks::Response(response) => {
                response.chunk().await.map_err(|err| Error(err.to_string()))
            }
            #[cfg(test)]
            Chunks::VecDeque(vec) => vec.pop_front().transpose(),
        }
    }
}
