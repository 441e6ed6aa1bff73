//! One-shot signal: a latch a task can await and any callback can fire.
//!
//! Used for write-drained acknowledgments and shutdown handshakes. Once
//! notified, the signal stays set — later waits resolve immediately.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct SignalState {
    notified: bool,
    waker: Option<Waker>,
}

/// A clone-able one-shot signal.
#[derive(Clone)]
pub struct Signal {
    state: Rc<RefCell<SignalState>>,
}

impl Signal {
    pub fn new() -> Self {
        Signal {
            state: Rc::new(RefCell::new(SignalState {
                notified: false,
                waker: None,
            })),
        }
    }

    /// Fire the signal, waking the waiter if one is parked. Idempotent.
    pub fn notify(&self) {
        let waker = {
            let mut state = self.state.borrow_mut();
            state.notified = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    pub fn is_notified(&self) -> bool {
        self.state.borrow().notified
    }

    /// Await the signal. Resolves immediately if already notified.
    pub fn wait(&self) -> SignalWait {
        SignalWait {
            state: self.state.clone(),
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Signal::wait`].
pub struct SignalWait {
    state: Rc<RefCell<SignalState>>,
}

impl Future for SignalWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.state.borrow_mut();
        if state.notified {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::Wake;

    struct Flag(std::sync::atomic::AtomicBool);

    impl Wake for Flag {
        fn wake(self: std::sync::Arc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn test_waker() -> (std::sync::Arc<Flag>, Waker) {
        let flag = std::sync::Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        (flag.clone(), Waker::from(flag))
    }

    #[test]
    fn wait_after_notify_is_immediate() {
        let signal = Signal::new();
        signal.notify();

        let (_, waker) = test_waker();
        let mut cx = Context::from_waker(&waker);
        let mut wait = signal.wait();
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn notify_wakes_parked_waiter() {
        let signal = Signal::new();
        let (flag, waker) = test_waker();
        let mut cx = Context::from_waker(&waker);

        let mut wait = signal.wait();
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Pending);

        signal.notify();
        assert!(flag.0.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(Pin::new(&mut wait).poll(&mut cx), Poll::Ready(()));
    }

    #[test]
    fn notify_is_idempotent() {
        let signal = Signal::new();
        signal.notify();
        signal.notify();
        assert!(signal.is_notified());
    }
}
