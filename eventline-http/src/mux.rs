//! The client multiplexer: owns all in-flight transfers, translates
//! socket readiness and timer callbacks into transfer dispatch, and
//! drains completion messages.
//!
//! Completion dispatch is four-way by owner and outcome. An operation
//! owner has its status or error recorded and its awaiter resumed via a
//! deferred post; a body-stream owner has completion chained behind any
//! staged chunk so the consumer observes every byte before the terminal.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Instant;

use eventline::{EventLoop, Readiness, StopCallback, StopToken, TimerHandle};
use slab::Slab;

use crate::altsvc::AltSvcCache;
use crate::error::HttpError;
use crate::metrics;
use crate::operation::{FetchFuture, OperationShared};
use crate::request::{parse_url, Request};
use crate::transfer::{Owner, TlsClientConfig, Transfer};

pub(crate) struct MuxInner {
    event_loop: EventLoop,
    transfers: Slab<Rc<RefCell<Transfer>>>,
    /// The shared timeout event: one timer armed to the earliest
    /// transfer deadline, cancelled when none remain.
    timeout: Option<TimerHandle>,
    completions: VecDeque<(usize, Result<(), HttpError>)>,
    altsvc: Option<AltSvcCache>,
    tls: TlsClientConfig,
}

/// Handle to the multiplexer state. Cheap to clone.
#[derive(Clone)]
pub(crate) struct Mux {
    inner: Rc<RefCell<MuxInner>>,
}

/// A transfer's registration: weak links back to the multiplexer and the
/// transfer itself, used by owners for resume and removal.
#[derive(Clone)]
pub(crate) struct HandleRef {
    mux: Weak<RefCell<MuxInner>>,
    transfer: Weak<RefCell<Transfer>>,
    id: usize,
}

impl HandleRef {
    pub(crate) fn transfer(&self) -> Option<Rc<RefCell<Transfer>>> {
        self.transfer.upgrade()
    }

    /// Ask the transport to resume receiving (download back-pressure
    /// cleared).
    pub(crate) fn unpause_recv(&self) {
        // A dead weak ref means the transfer was already unregistered;
        // the slab slot may now belong to someone else.
        if self.transfer.upgrade().is_none() {
            return;
        }
        if let Some(inner) = self.mux.upgrade() {
            Mux { inner }.unpause_recv(self.id);
        }
    }

    /// Remove the transfer from the multiplexer. Idempotent.
    pub(crate) fn unregister(&self) {
        if self.transfer.upgrade().is_none() {
            return;
        }
        if let Some(inner) = self.mux.upgrade() {
            Mux { inner }.remove(self.id);
        }
    }
}

impl Mux {
    pub(crate) fn new(
        event_loop: EventLoop,
        cache_path: Option<PathBuf>,
        tls: TlsClientConfig,
    ) -> Mux {
        let inner = Rc::new(RefCell::new(MuxInner {
            event_loop: event_loop.clone(),
            transfers: Slab::new(),
            timeout: None,
            completions: VecDeque::new(),
            altsvc: cache_path.map(|dir| AltSvcCache::load(&dir)),
            tls,
        }));
        let timer = event_loop.timer({
            let weak = Rc::downgrade(&inner);
            move || {
                if let Some(inner) = weak.upgrade() {
                    Mux { inner }.on_timeout();
                }
            }
        });
        inner.borrow_mut().timeout = Some(timer);
        Mux { inner }
    }

    /// Start a transfer and return its pending operation.
    pub(crate) fn fetch(&self, request: Request, stop_token: StopToken) -> FetchFuture {
        metrics::FETCHES_STARTED.increment();
        let event_loop = self.inner.borrow().event_loop.clone();

        let op = Rc::new(RefCell::new(OperationShared::new()));
        let headers_ready = event_loop.user_event({
            let op = Rc::downgrade(&op);
            move || {
                if let Some(op) = op.upgrade() {
                    let waker = op.borrow_mut().waker.take();
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
            }
        });
        op.borrow_mut().headers_ready = Some(headers_ready);

        // Alternate-services cache: rewrite the connect target, not the
        // request itself.
        let connect_override = parse_url(&request.url).ok().and_then(|url| {
            let inner = self.inner.borrow();
            inner
                .altsvc
                .as_ref()
                .and_then(|cache| cache.lookup(&url.origin()))
        });

        let tls = self.inner.borrow().tls.clone();
        match Transfer::new(
            request,
            connect_override,
            stop_token.clone(),
            Owner::Operation(op.clone()),
            tls,
        ) {
            Ok(transfer) => {
                if let Err(e) = self.register(transfer, &op, &stop_token) {
                    let _ = op.borrow_mut().record_error(e);
                }
            }
            Err(e) => {
                let _ = op.borrow_mut().record_error(e);
            }
        }

        FetchFuture {
            op,
            event_loop,
            done: false,
        }
    }

    /// Register a configured transfer: slab slot, socket watcher,
    /// cancellation subscription, and the request-body pump.
    fn register(
        &self,
        transfer: Transfer,
        op: &Rc<RefCell<OperationShared>>,
        stop_token: &StopToken,
    ) -> Result<(), HttpError> {
        let event_loop = self.inner.borrow().event_loop.clone();
        let transfer = Rc::new(RefCell::new(transfer));
        let id = self.inner.borrow_mut().transfers.insert(transfer.clone());
        transfer.borrow_mut().id = id;

        op.borrow_mut().handle = Some(HandleRef {
            mux: Rc::downgrade(&self.inner),
            transfer: Rc::downgrade(&transfer),
            id,
        });

        let (fd, interest) = {
            let t = transfer.borrow();
            (t.fd, t.desired_interest())
        };
        let watch = event_loop.watch_fd(fd, interest, {
            let weak = Rc::downgrade(&self.inner);
            move |readiness| {
                if let Some(inner) = weak.upgrade() {
                    Mux { inner }.on_socket_ready(id, readiness);
                }
            }
        })?;
        transfer.borrow_mut().set_watch(watch);

        // The request-body pump: fetch the first chunk off the callback
        // stack, then resume sending.
        if transfer.borrow().body_source.is_some() {
            let next_chunk_event = event_loop.user_event({
                let weak = Rc::downgrade(&self.inner);
                move || {
                    if let Some(inner) = weak.upgrade() {
                        Mux { inner }.spawn_body_advance(id);
                    }
                }
            });
            transfer.borrow_mut().next_chunk_event = Some(next_chunk_event);
            self.spawn_body_advance(id);
        }

        // The cancellation subscription fires immediately when the token
        // is already stopped, so install it after the rest of the wiring.
        let stop_callback = StopCallback::new(stop_token, {
            let weak = Rc::downgrade(&self.inner);
            let weak_transfer = Rc::downgrade(&transfer);
            move || {
                if weak_transfer.upgrade().is_none() {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    Mux { inner }.fail_transfer(id, HttpError::Interrupted);
                }
            }
        });
        if !transfer.borrow().completed {
            transfer.borrow_mut()._stop_callback = Some(stop_callback);
        }

        self.recompute_deadline();
        Ok(())
    }

    /// Advance the request-body producer on a task of its own; the read
    /// path stays paused until the chunk is positioned.
    fn spawn_body_advance(&self, id: usize) {
        let (event_loop, transfer) = {
            let inner = self.inner.borrow();
            (inner.event_loop.clone(), inner.transfers.get(id).cloned())
        };
        let Some(transfer) = transfer else { return };
        let weak_inner = Rc::downgrade(&self.inner);
        let weak_transfer = Rc::downgrade(&transfer);
        drop(transfer);

        event_loop.spawn(async move {
            let step = std::future::poll_fn(|cx| {
                let Some(transfer) = weak_transfer.upgrade() else {
                    return std::task::Poll::Ready(None);
                };
                let mut transfer = transfer.borrow_mut();
                if transfer.completed {
                    return std::task::Poll::Ready(None);
                }
                match transfer.body_source.as_mut() {
                    Some(source) => source.poll_chunk(cx).map(Some),
                    None => std::task::Poll::Ready(None),
                }
            })
            .await;

            match step {
                None => {}
                Some(Some(Ok(chunk))) => {
                    if let Some(transfer) = weak_transfer.upgrade() {
                        transfer.borrow_mut().position_chunk(Some(chunk));
                    }
                }
                Some(None) => {
                    if let Some(transfer) = weak_transfer.upgrade() {
                        transfer.borrow_mut().position_chunk(None);
                    }
                }
                Some(Some(Err(error))) => {
                    // Producer failure aborts the upload. The slab slot
                    // may have been recycled; only act while our transfer
                    // is still the one registered there.
                    if weak_transfer.upgrade().is_some() {
                        if let Some(inner) = weak_inner.upgrade() {
                            Mux { inner }.fail_transfer(id, error);
                        }
                    }
                }
            }
        });
    }

    fn on_socket_ready(&self, id: usize, readiness: Readiness) {
        let transfer = self.inner.borrow().transfers.get(id).cloned();
        let Some(transfer) = transfer else { return };
        let completion = transfer.borrow_mut().on_io(readiness);
        if let Some(result) = completion {
            self.inner.borrow_mut().completions.push_back((id, result));
        }
        self.process_events();
    }

    fn on_timeout(&self) {
        let now = Instant::now();
        let expired: Vec<usize> = {
            let inner = self.inner.borrow();
            inner
                .transfers
                .iter()
                .filter(|(_, t)| t.borrow().deadline.is_some_and(|d| d <= now))
                .map(|(id, _)| id)
                .collect()
        };
        {
            let mut inner = self.inner.borrow_mut();
            for id in expired {
                inner.completions.push_back((id, Err(HttpError::Timeout)));
            }
        }
        self.process_events();
    }

    /// Drain completion messages, dispatching by owner variant.
    fn process_events(&self) {
        loop {
            let message = self.inner.borrow_mut().completions.pop_front();
            let Some((id, result)) = message else { break };
            let transfer = self.inner.borrow().transfers.get(id).cloned();
            let Some(transfer) = transfer else { continue };
            {
                let mut t = transfer.borrow_mut();
                if t.completed {
                    // Outcome already recorded; first one wins.
                    continue;
                }
                t.mark_completed();
            }

            if result.is_ok() {
                let (origin, alt_svc) = {
                    let t = transfer.borrow();
                    (t.origin.clone(), t.alt_svc.clone())
                };
                if let Some(alt_svc) = alt_svc {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(cache) = inner.altsvc.as_mut() {
                        cache.learn(&origin, &alt_svc);
                    }
                }
            }

            let owner = transfer.borrow().owner.clone();
            let event_loop = self.inner.borrow().event_loop.clone();
            match owner {
                Owner::Operation(op) => {
                    let waker = {
                        let mut op = op.borrow_mut();
                        match result {
                            Ok(()) => {
                                let status = transfer.borrow().http_status;
                                op.record_done(status)
                            }
                            Err(error) => op.record_error(error),
                        }
                    };
                    // Defer the resume so the recording frame unwinds
                    // before the awaiter runs.
                    if let Some(waker) = waker {
                        event_loop.post_resume(waker);
                    }
                }
                Owner::Body(shared) => {
                    // On success the stream keeps the HTTP status it
                    // captured at transition; a transport error carries
                    // only the error.
                    shared.borrow_mut().finish(result.err());
                }
            }
        }
        self.recompute_deadline();
    }

    /// Route an error to the transfer's owner and unregister it. This is
    /// the cancellation and teardown path; the first recorded outcome
    /// wins and later completions are dropped.
    pub(crate) fn fail_transfer(&self, id: usize, error: HttpError) {
        let transfer = self.inner.borrow_mut().transfers.try_remove(id);
        let Some(transfer) = transfer else { return };
        let already_done = {
            let mut t = transfer.borrow_mut();
            let already = t.completed;
            t.mark_completed();
            already
        };
        if !already_done {
            let owner = transfer.borrow().owner.clone();
            match owner {
                Owner::Operation(op) => {
                    let waker = op.borrow_mut().record_error(error);
                    if let Some(waker) = waker {
                        self.inner.borrow().event_loop.post_resume(waker);
                    }
                }
                Owner::Body(shared) => {
                    shared.borrow_mut().fail(error);
                }
            }
        }
        self.recompute_deadline();
    }

    /// Remove a transfer (owner dropped or finished with it). Idempotent.
    pub(crate) fn remove(&self, id: usize) {
        let transfer = self.inner.borrow_mut().transfers.try_remove(id);
        if let Some(transfer) = transfer {
            transfer.borrow_mut().mark_completed();
        }
        self.recompute_deadline();
    }

    fn unpause_recv(&self, id: usize) {
        let transfer = self.inner.borrow().transfers.get(id).cloned();
        let Some(transfer) = transfer else { return };
        let completion = transfer.borrow_mut().unpause_recv();
        if let Some(result) = completion {
            self.inner.borrow_mut().completions.push_back((id, result));
            self.process_events();
        }
    }

    fn recompute_deadline(&self) {
        let inner = self.inner.borrow();
        let next = inner
            .transfers
            .iter()
            .filter_map(|(_, t)| t.borrow().deadline)
            .min();
        if let Some(timer) = &inner.timeout {
            match next {
                Some(deadline) => {
                    timer.schedule(deadline.saturating_duration_since(Instant::now()));
                }
                None => timer.cancel(),
            }
        }
    }
}
