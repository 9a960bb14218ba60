//! Response initiation and lazily produced response bodies

use bytes::Bytes;
use serde::Serialize;

use crate::HandlerError;

/// One piece of a response body
pub type Chunk = Bytes;

/// Response-initiation callback.
///
/// Called once with the status and headers before the body is produced.
pub trait StartResponse {
    fn start(&mut self, status: u16, headers: Vec<(String, String)>);
}

impl<F> StartResponse for F
where
    F: FnMut(u16, Vec<(String, String)>),
{
    fn start(&mut self, status: u16, headers: Vec<(String, String)>) {
        self(status, headers)
    }
}

/// A lazy, finite, non-restartable sequence of body chunks.
///
/// The gateway pulls chunks until the iterator is exhausted, an error chunk is
/// produced, or the client goes away.
pub struct Body {
    chunks: Box<dyn Iterator<Item = Result<Chunk, HandlerError>> + Send>,
}

impl Body {
    /// Wrap any chunk iterator. Nothing is produced until the gateway pulls.
    pub fn new<I>(chunks: I) -> Self
    where
        I: Iterator<Item = Result<Chunk, HandlerError>> + Send + 'static,
    {
        Self { chunks: Box::new(chunks) }
    }

    /// A body made of already available pieces.
    ///
    /// # Example
    /// ```ignore
    /// Body::from_chunks(["Hello", ", ", "World"])
    /// ```
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        I::IntoIter: Send + 'static,
        C: Into<Chunk>,
    {
        Self::new(chunks.into_iter().map(|c| Ok(c.into())))
    }

    pub fn text(body: impl Into<String>) -> Self {
        let body: String = body.into();
        Self::from_chunks([body])
    }

    pub fn json<T: Serialize>(body: &T) -> Result<Self, HandlerError> {
        Ok(Self::from_chunks([serde_json::to_vec(body)?]))
    }

    pub fn empty() -> Self {
        Self::new(std::iter::empty())
    }
}

impl Iterator for Body {
    type Item = Result<Chunk, HandlerError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_body_is_lazy() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let mut body = Body::new((0..3).map(move |i| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Chunk::from(i.to_string()))
        }));

        assert_eq!(pulled.load(Ordering::SeqCst), 0);
        assert_eq!(body.next().unwrap().unwrap(), "0");
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
        assert_eq!(body.count(), 2);
    }

    #[test]
    fn test_closure_start_response() {
        let mut seen = None;
        let mut start = |status: u16, headers: Vec<(String, String)>| seen = Some((status, headers.len()));
        start.start(201, vec![("Content-Type".into(), "text/plain".into())]);
        assert_eq!(seen, Some((201, 1)));
    }
}
