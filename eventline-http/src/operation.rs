//! The pending fetch operation: an awaitable that resolves once headers
//! are complete (first body byte seen) or the transfer terminates.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use eventline::{EventLoop, UserEvent};

use crate::error::HttpError;
use crate::metrics;
use crate::mux::HandleRef;
use crate::response::Response;
use crate::streaming::BodyStream;

/// Shared state between the fetch future, the transfer callbacks, and
/// the multiplexer's completion dispatch.
pub(crate) struct OperationShared {
    pub(crate) status: Option<u16>,
    pub(crate) headers: Vec<(String, String)>,
    /// Body bytes buffered while the operation still owns the transfer.
    pub(crate) body_buf: BytesMut,
    /// First write callback seen; `headers_ready` fires once.
    pub(crate) body_started: bool,
    /// The transfer completed while operation-owned: close the body
    /// stream right after the buffered bytes.
    pub(crate) no_body: bool,
    /// A terminal outcome has been recorded; later ones lose the race.
    pub(crate) finished: bool,
    pub(crate) error: Option<HttpError>,
    pub(crate) waker: Option<Waker>,
    pub(crate) headers_ready: Option<UserEvent>,
    pub(crate) handle: Option<HandleRef>,
}

impl OperationShared {
    pub(crate) fn new() -> Self {
        OperationShared {
            status: None,
            headers: Vec::new(),
            body_buf: BytesMut::new(),
            body_started: false,
            no_body: false,
            finished: false,
            error: None,
            waker: None,
            headers_ready: None,
            handle: None,
        }
    }

    /// Record an error if no outcome was recorded first, returning the
    /// waker to resume. First recorded outcome wins.
    pub(crate) fn record_error(&mut self, error: HttpError) -> Option<Waker> {
        if self.finished || self.error.is_some() {
            return None;
        }
        self.finished = true;
        self.error = Some(error);
        self.waker.take()
    }

    /// Record successful completion with no further body bytes coming.
    pub(crate) fn record_done(&mut self, status: Option<u16>) -> Option<Waker> {
        if self.finished || self.error.is_some() {
            return None;
        }
        self.finished = true;
        match status {
            Some(status) => self.status = Some(status),
            None => {
                self.error = Some(HttpError::Protocol(
                    "transfer completed without a response head".into(),
                ));
            }
        }
        self.no_body = true;
        self.waker.take()
    }
}

/// Future returned by `HttpClient::fetch`.
///
/// Resolves with a streaming [`Response`] once headers are complete, or
/// with the transfer's error. Dropping it before completion unregisters
/// the transfer.
#[must_use = "futures do nothing unless awaited"]
pub struct FetchFuture {
    pub(crate) op: Rc<RefCell<OperationShared>>,
    pub(crate) event_loop: EventLoop,
    pub(crate) done: bool,
}

impl Future for FetchFuture {
    type Output = Result<Response<BodyStream>, HttpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        debug_assert!(!this.done, "fetch future polled after completion");

        enum Step {
            Fail(HttpError),
            Transition {
                status: u16,
                headers: Vec<(String, String)>,
                initial: bytes::Bytes,
                handle: Option<HandleRef>,
                no_body: bool,
            },
            Park,
        }

        let step = {
            let mut op = this.op.borrow_mut();
            if let Some(error) = op.error.take() {
                Step::Fail(error)
            } else if op.status.is_some() && (op.body_started || op.no_body) {
                Step::Transition {
                    status: op.status.unwrap_or_default(),
                    headers: std::mem::take(&mut op.headers),
                    initial: std::mem::take(&mut op.body_buf).freeze(),
                    handle: op.handle.take(),
                    no_body: op.no_body,
                }
            } else {
                op.waker = Some(cx.waker().clone());
                Step::Park
            }
        };

        match step {
            Step::Fail(error) => {
                this.done = true;
                metrics::FETCHES_FAILED.increment();
                Poll::Ready(Err(error))
            }
            Step::Transition {
                status,
                headers,
                initial,
                handle,
                no_body,
            } => {
                this.done = true;
                metrics::FETCHES_COMPLETED.increment();
                // Transfer ownership of the handle into the body stream;
                // transport callbacks now route there.
                let body = BodyStream::new(&this.event_loop, handle, initial, status, no_body);
                Poll::Ready(Ok(Response {
                    status,
                    headers,
                    body,
                }))
            }
            Step::Park => Poll::Pending,
        }
    }
}

impl Drop for FetchFuture {
    fn drop(&mut self) {
        // On the normal path the handle moved into the body stream; if it
        // is still here the operation owns the transfer and must remove
        // it from the multiplexer before going away.
        let handle = self.op.borrow_mut().handle.take();
        if let Some(handle) = handle {
            handle.unregister();
        }
    }
}
