//! Server-side connection I/O: buffered non-blocking reads, queued
//! writes with per-flush acknowledgment, and peer-close detection.

use std::cell::RefCell;
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use eventline::{EventLoop, FdWatch, Interest, Readiness, Signal};
use socket2::Socket;

use crate::error::HttpError;
use crate::wire;

/// Stop reading once this much unconsumed input is buffered; the kernel
/// socket buffer then back-pressures the peer.
const IN_HIGH_WATER: usize = 1024 * 1024;
const READ_BUF: usize = 8 * 1024;

struct ConnShared {
    socket: Option<Socket>,
    fd: RawFd,
    watch: Option<FdWatch>,
    in_buf: BytesMut,
    eof: bool,
    io_error: bool,
    out: BytesMut,
    /// Single-use acknowledgment that the write buffer drained.
    flush_signal: Option<Signal>,
    read_waker: Option<Waker>,
    /// Fired once when the peer closes or the socket fails.
    close_hook: Option<Box<dyn FnOnce()>>,
    last_interest: (bool, bool),
}

/// One accepted connection. Lives for a single request/response cycle.
pub(crate) struct ServerConn {
    shared: Rc<RefCell<ConnShared>>,
}

impl ServerConn {
    pub(crate) fn new(event_loop: &EventLoop, socket: Socket) -> Result<ServerConn, HttpError> {
        socket.set_nonblocking(true)?;
        socket.set_nodelay(true)?;
        let fd = socket.as_raw_fd();

        let shared = Rc::new(RefCell::new(ConnShared {
            socket: Some(socket),
            fd,
            watch: None,
            in_buf: BytesMut::new(),
            eof: false,
            io_error: false,
            out: BytesMut::new(),
            flush_signal: None,
            read_waker: None,
            close_hook: None,
            last_interest: (true, false),
        }));

        let watch = event_loop.watch_fd(
            fd,
            Interest {
                readable: true,
                writable: false,
                persist: true,
            },
            {
                let weak = Rc::downgrade(&shared);
                move |readiness| on_ready(&weak, readiness)
            },
        )?;
        shared.borrow_mut().watch = Some(watch);

        Ok(ServerConn { shared })
    }

    /// Resolve when more input arrives (or the peer goes away).
    pub(crate) fn fill(&self) -> Fill {
        let baseline = self.shared.borrow().in_buf.len();
        Fill {
            shared: self.shared.clone(),
            baseline,
        }
    }

    pub(crate) fn find_header_end(&self) -> Option<usize> {
        wire::find_header_end(&self.shared.borrow().in_buf)
    }

    pub(crate) fn buffered_len(&self) -> usize {
        self.shared.borrow().in_buf.len()
    }

    /// Take the first `n` buffered bytes.
    pub(crate) fn split_to(&self, n: usize) -> Bytes {
        let taken = self.shared.borrow_mut().in_buf.split_to(n).freeze();
        update_interest(&self.shared);
        taken
    }

    /// Take everything buffered.
    pub(crate) fn split_all(&self) -> Bytes {
        let taken = {
            let mut shared = self.shared.borrow_mut();
            let len = shared.in_buf.len();
            shared.in_buf.split_to(len).freeze()
        };
        update_interest(&self.shared);
        taken
    }

    pub(crate) fn out_is_empty(&self) -> bool {
        self.shared.borrow().out.is_empty()
    }

    /// Peer closed or the socket failed.
    pub(crate) fn is_closed(&self) -> bool {
        let shared = self.shared.borrow();
        shared.eof || shared.io_error
    }

    /// Queue bytes and flush as much as the socket accepts.
    pub(crate) fn write(&self, data: &[u8]) {
        self.shared.borrow_mut().out.extend_from_slice(data);
        flush_some(&self.shared);
        update_interest(&self.shared);
    }

    /// Arrange for `signal` to fire once the write buffer has drained.
    /// Fires immediately if it already has (or the connection is dead).
    pub(crate) fn set_flush_signal(&self, signal: Signal) {
        let fire_now = {
            let mut shared = self.shared.borrow_mut();
            if shared.out.is_empty() || shared.io_error || shared.eof {
                true
            } else {
                shared.flush_signal = Some(signal.clone());
                false
            }
        };
        if fire_now {
            signal.notify();
        }
    }

    /// Install the connection-close callback. Fires immediately if the
    /// peer is already gone.
    pub(crate) fn set_close_hook(&self, hook: impl FnOnce() + 'static) {
        {
            let mut shared = self.shared.borrow_mut();
            if !shared.eof && !shared.io_error {
                shared.close_hook = Some(Box::new(hook));
                return;
            }
        }
        hook();
    }

    pub(crate) fn clear_close_hook(&self) {
        self.shared.borrow_mut().close_hook = None;
    }
}

/// Future returned by [`ServerConn::fill`].
pub(crate) struct Fill {
    shared: Rc<RefCell<ConnShared>>,
    baseline: usize,
}

impl Future for Fill {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut shared = self.shared.borrow_mut();
        if shared.in_buf.len() > self.baseline || shared.eof || shared.io_error {
            Poll::Ready(())
        } else {
            shared.read_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

fn on_ready(weak: &Weak<RefCell<ConnShared>>, readiness: Readiness) {
    let Some(shared) = weak.upgrade() else {
        return;
    };
    if readiness.readable {
        read_some(&shared);
    }
    if readiness.writable {
        flush_some(&shared);
    }
    update_interest(&shared);
}

fn read_some(shared: &Rc<RefCell<ConnShared>>) {
    let mut hook = None;
    let mut waker = None;
    {
        let state = &mut *shared.borrow_mut();
        if state.eof || state.io_error {
            return;
        }
        let Some(socket) = &state.socket else { return };
        let mut buf = [0u8; READ_BUF];
        loop {
            if state.in_buf.len() >= IN_HIGH_WATER {
                break;
            }
            match (&*socket).read(&mut buf) {
                Ok(0) => {
                    state.eof = true;
                    hook = state.close_hook.take();
                    break;
                }
                Ok(n) => state.in_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::trace!(fd = state.fd, error = %e, "connection read failed");
                    state.io_error = true;
                    hook = state.close_hook.take();
                    break;
                }
            }
        }
        waker = state.read_waker.take();
    }
    if let Some(hook) = hook {
        hook();
    }
    if let Some(waker) = waker {
        waker.wake();
    }
}

fn flush_some(shared: &Rc<RefCell<ConnShared>>) {
    let mut hook = None;
    let mut signal = None;
    {
        let state = &mut *shared.borrow_mut();
        if state.io_error || state.socket.is_none() {
            signal = state.flush_signal.take();
        } else {
            let Some(socket) = &state.socket else { return };
            while !state.out.is_empty() {
                match (&*socket).write(&state.out) {
                    Ok(0) => {
                        state.io_error = true;
                        hook = state.close_hook.take();
                        break;
                    }
                    Ok(n) => {
                        let _ = state.out.split_to(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::trace!(fd = state.fd, error = %e, "connection write failed");
                        state.io_error = true;
                        hook = state.close_hook.take();
                        break;
                    }
                }
            }
            if state.out.is_empty() || state.io_error {
                signal = state.flush_signal.take();
            }
        }
    }
    if let Some(hook) = hook {
        hook();
    }
    if let Some(signal) = signal {
        signal.notify();
    }
}

fn update_interest(shared: &Rc<RefCell<ConnShared>>) {
    let state = &mut *shared.borrow_mut();
    if state.watch.is_none() {
        return;
    }
    let want_read = !state.eof && !state.io_error && state.in_buf.len() < IN_HIGH_WATER;
    let want_write = !state.out.is_empty() && !state.io_error;
    if (want_read, want_write) == state.last_interest {
        return;
    }
    state.last_interest = (want_read, want_write);
    let interest = Interest {
        readable: want_read,
        writable: want_write,
        persist: true,
    };
    if let Some(watch) = &state.watch {
        if let Err(e) = watch.modify(interest) {
            tracing::warn!(fd = state.fd, error = %e, "failed to update connection interest");
        }
    }
}
