//! Streaming response body with transport-driven flow control.
//!
//! A [`BodyStream`] is the finite, single-pass sequence of chunks a fetch
//! yields. The transport stages at most one chunk at a time; staging is
//! refused (a pause sentinel) while a previous chunk is staged or while
//! the consumer has unconsumed buffered bytes. Draining the buffer asks
//! the transport to resume receiving, closing the back-pressure loop.
//!
//! Termination is ordered: every delivered byte is observed by the
//! consumer strictly before the terminal close. If a chunk is staged when
//! the transfer finishes, the terminal signal is chained behind it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use eventline::{EventLoop, UserEvent};

use crate::body::ChunkSource;
use crate::error::HttpError;
use crate::mux::HandleRef;

/// Outcome of staging a chunk from the transport.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    Accepted,
    /// Refuse the bytes and pause receiving until `resume`.
    Pause,
}

pub(crate) struct BodyShared {
    /// Chunks delivered to the consumer but not yet taken.
    queue: VecDeque<Bytes>,
    buffered_bytes: usize,
    /// The transport-side staged chunk, moved into `queue` by the
    /// `chunk_ready` event.
    pending: Option<Bytes>,
    /// HTTP status captured when the response head was parsed.
    status: u16,
    /// Transfer completion observed (success or error).
    finished: bool,
    /// Transport error recorded at completion, delivered by `body_ready`.
    error: Option<HttpError>,
    /// Terminal close delivered.
    done: bool,
    /// Error the consumer has not observed yet.
    error_out: Option<HttpError>,
    body_ready_fired: bool,
    consumer_waker: Option<Waker>,
    chunk_ready: Option<UserEvent>,
    body_ready: Option<UserEvent>,
    handle: Option<HandleRef>,
}

impl BodyShared {
    /// Stage a chunk coming off the wire. Refuses while a chunk is
    /// already staged or the consumer is backed up.
    pub(crate) fn write_chunk(&mut self, chunk: Bytes) -> WriteOutcome {
        if self.pending.is_some() || self.buffered_bytes > 0 {
            return WriteOutcome::Pause;
        }
        self.pending = Some(chunk);
        if let Some(event) = &self.chunk_ready {
            event.trigger();
        }
        WriteOutcome::Accepted
    }

    pub(crate) fn buffered_byte_count(&self) -> usize {
        self.buffered_bytes
    }

    pub(crate) fn chunk_ready_armed(&self) -> bool {
        self.chunk_ready.as_ref().is_some_and(UserEvent::is_armed)
    }

    /// Record transfer completion. With no staged chunk the terminal
    /// fires immediately; otherwise the next `chunk_ready` dispatch
    /// chains it after the final chunk.
    pub(crate) fn finish(&mut self, error: Option<HttpError>) {
        self.finished = true;
        if let Some(e) = error {
            self.error = Some(e);
        }
        if !self.chunk_ready_armed() && !self.body_ready_fired {
            self.body_ready_fired = true;
            if let Some(event) = &self.body_ready {
                event.trigger();
            }
        }
    }

    /// Route an error straight to the consumer, bypassing the events.
    /// Used by cancellation and transport teardown.
    pub(crate) fn fail(&mut self, error: HttpError) {
        self.finished = true;
        self.close_with_error(error);
    }

    fn received_data(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.buffered_bytes += chunk.len();
            self.queue.push_back(chunk);
        }
        self.wake_consumer();
    }

    fn close_with_status(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        tracing::trace!(status = self.status, "body stream closed");
        self.wake_consumer();
    }

    fn close_with_error(&mut self, error: HttpError) {
        if self.done {
            return;
        }
        self.done = true;
        self.error_out = Some(error);
        self.wake_consumer();
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer_waker.take() {
            waker.wake();
        }
    }
}

/// A streaming response body. Dropping it unregisters the underlying
/// transfer and its event watchers.
pub struct BodyStream {
    shared: Rc<RefCell<BodyShared>>,
}

impl BodyStream {
    /// Bind a new stream to a transfer, rebinding the transfer's owner.
    ///
    /// `initial` carries bytes buffered while headers were being
    /// collected. `already_finished` marks a transfer that completed with
    /// the operation still owning it; the stream closes right after the
    /// initial bytes.
    pub(crate) fn new(
        event_loop: &EventLoop,
        handle: Option<HandleRef>,
        initial: Bytes,
        status: u16,
        already_finished: bool,
    ) -> Self {
        let shared = Rc::new(RefCell::new(BodyShared {
            queue: VecDeque::new(),
            buffered_bytes: 0,
            pending: None,
            status,
            finished: already_finished,
            error: None,
            done: false,
            error_out: None,
            body_ready_fired: false,
            consumer_waker: None,
            chunk_ready: None,
            body_ready: None,
            handle,
        }));

        let chunk_ready = event_loop.user_event({
            let shared = Rc::downgrade(&shared);
            move || on_chunk_ready(&shared)
        });
        let body_ready = event_loop.user_event({
            let shared = Rc::downgrade(&shared);
            move || on_body_ready(&shared)
        });

        {
            let mut state = shared.borrow_mut();
            state.chunk_ready = Some(chunk_ready);
            state.body_ready = Some(body_ready);
        }

        // Rebind transport callbacks to this stream.
        let transfer = shared
            .borrow()
            .handle
            .as_ref()
            .and_then(HandleRef::transfer);
        if let Some(transfer) = transfer {
            transfer.borrow_mut().owner = crate::transfer::Owner::Body(shared.clone());
        }

        {
            let mut state = shared.borrow_mut();
            state.received_data(initial);
            if already_finished {
                state.close_with_status();
            }
        }

        BodyStream { shared }
    }

    /// Total bytes delivered but not yet consumed.
    pub fn buffered_byte_count(&self) -> usize {
        self.shared.borrow().buffered_byte_count()
    }

    /// Yield the next body chunk, or `None` when the body is complete.
    /// A transfer error surfaces here once, after all delivered chunks.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, HttpError> {
        std::future::poll_fn(|cx| self.poll_next(cx)).await
    }

    fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Bytes>, HttpError>> {
        enum Step {
            Chunk(Bytes),
            Terminal(Option<HttpError>),
            Park,
        }

        let (step, resume) = {
            let mut state = self.shared.borrow_mut();
            if let Some(chunk) = state.queue.pop_front() {
                state.buffered_bytes -= chunk.len();
                // The consumer drained the buffer: hint the transport to
                // resume receiving.
                let resume = state.queue.is_empty() && !state.finished && !state.done;
                let handle = if resume { state.handle.clone() } else { None };
                (Step::Chunk(chunk), handle)
            } else if state.done {
                (Step::Terminal(state.error_out.take()), None)
            } else {
                state.consumer_waker = Some(cx.waker().clone());
                (Step::Park, None)
            }
        };

        // Resume outside the borrow: the transport may immediately stage
        // the next chunk, which borrows this state again.
        if let Some(handle) = resume {
            handle.unpause_recv();
        }

        match step {
            Step::Chunk(chunk) => Poll::Ready(Ok(Some(chunk))),
            Step::Terminal(Some(error)) => Poll::Ready(Err(error)),
            Step::Terminal(None) => Poll::Ready(Ok(None)),
            Step::Park => Poll::Pending,
        }
    }
}

impl ChunkSource for BodyStream {
    fn poll_chunk(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes, HttpError>>> {
        self.poll_next(cx).map(|result| match result {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        })
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        // The stream owns the transfer on the normal path; unregister it
        // from the multiplexer. Idempotent if already removed.
        let handle = self.shared.borrow_mut().handle.take();
        if let Some(handle) = handle {
            handle.unregister();
        }
    }
}

fn on_chunk_ready(shared: &Weak<RefCell<BodyShared>>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.borrow_mut();
    let chunk = state.pending.take();
    if state.finished && !state.body_ready_fired {
        // The transfer finished while this chunk was staged: chain the
        // terminal signal behind it.
        state.body_ready_fired = true;
        if let Some(event) = &state.body_ready {
            event.trigger();
        }
    }
    if let Some(chunk) = chunk {
        state.received_data(chunk);
    }
}

fn on_body_ready(shared: &Weak<RefCell<BodyShared>>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut state = shared.borrow_mut();
    match state.error.take() {
        Some(error) => state.close_with_error(error),
        None => state.close_with_status(),
    }
}
