//! Byte-chunk sequences: the finite, single-pass producer contract used
//! for request bodies and handler response bodies.

use std::collections::VecDeque;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};

use crate::error::HttpError;

/// A finite, single-pass asynchronous sequence of byte chunks.
///
/// `poll_chunk` yields `Some(Ok(chunk))` per chunk, `None` at the end of
/// the body, or `Some(Err(_))` once if production fails. After the end or
/// an error the source must not be polled again.
pub trait ChunkSource {
    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, HttpError>>>;
}

/// A boxed chunk source.
pub type BoxBody = Box<dyn ChunkSource>;

/// Await the next chunk from a source.
pub async fn next_chunk(source: &mut dyn ChunkSource) -> Option<Result<Bytes, HttpError>> {
    std::future::poll_fn(|cx| source.poll_chunk(cx)).await
}

/// Drain a source into a single buffer.
pub async fn collect(source: &mut dyn ChunkSource) -> Result<Bytes, HttpError> {
    let mut collected = BytesMut::new();
    while let Some(chunk) = next_chunk(source).await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected.freeze())
}

/// A body holding a fixed list of chunks, yielded one per poll.
pub struct ChunkList {
    chunks: VecDeque<Bytes>,
}

impl ChunkSource for ChunkList {
    fn poll_chunk(&mut self, _cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, HttpError>>> {
        Poll::Ready(self.chunks.pop_front().map(Ok))
    }
}

/// Build a body from a single buffer.
pub fn body_from(data: impl Into<Bytes>) -> BoxBody {
    let data: Bytes = data.into();
    let mut chunks = VecDeque::new();
    if !data.is_empty() {
        chunks.push_back(data);
    }
    Box::new(ChunkList { chunks })
}

/// Build a body from a list of chunks, preserving chunk boundaries.
pub fn body_from_chunks<I, T>(chunks: I) -> BoxBody
where
    I: IntoIterator<Item = T>,
    T: Into<Bytes>,
{
    Box::new(ChunkList {
        chunks: chunks.into_iter().map(Into::into).collect(),
    })
}

/// An empty body.
pub fn empty_body() -> BoxBody {
    Box::new(ChunkList {
        chunks: VecDeque::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::Wake;

    fn noop_waker() -> std::task::Waker {
        struct Noop;
        impl Wake for Noop {
            fn wake(self: std::sync::Arc<Self>) {}
        }
        std::task::Waker::from(std::sync::Arc::new(Noop))
    }

    fn poll_once<F: std::future::Future>(future: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        // SAFETY: the future is not moved for the duration of the poll.
        unsafe { Pin::new_unchecked(future) }.poll(&mut cx)
    }

    #[test]
    fn chunk_list_yields_in_order_then_ends() {
        let mut body = body_from_chunks(["hello ", "world"]);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        match body.poll_chunk(&mut cx) {
            Poll::Ready(Some(Ok(chunk))) => assert_eq!(&chunk[..], b"hello "),
            other => panic!("unexpected poll result: {other:?}"),
        }
        match body.poll_chunk(&mut cx) {
            Poll::Ready(Some(Ok(chunk))) => assert_eq!(&chunk[..], b"world"),
            other => panic!("unexpected poll result: {other:?}"),
        }
        assert!(matches!(body.poll_chunk(&mut cx), Poll::Ready(None)));
    }

    #[test]
    fn collect_concatenates_chunks() {
        let mut body = body_from_chunks(["a", "b", "c"]);
        let mut fut = collect(body.as_mut());
        match poll_once(&mut fut) {
            Poll::Ready(Ok(data)) => assert_eq!(&data[..], b"abc"),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[test]
    fn body_from_skips_empty() {
        let mut body = body_from("");
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(matches!(body.poll_chunk(&mut cx), Poll::Ready(None)));
    }
}
