//! Cooperative cancellation: a single-threaded stop source / token /
//! callback trio.
//!
//! A [`StopSource`] owns the stop state. [`StopToken`]s observe it and
//! keep it alive. A [`StopCallback`] fires exactly once when stop is
//! requested — immediately at registration if the token is already
//! stopped — and deregisters silently when dropped first.

use std::cell::RefCell;
use std::rc::Rc;

use slab::Slab;

type Callback = Box<dyn FnOnce()>;

struct StopState {
    stopped: bool,
    callbacks: Slab<Callback>,
}

/// Owner of a stop state. Dropping the source does not request stop.
pub struct StopSource {
    state: Rc<RefCell<StopState>>,
}

/// Observer handle for a stop state. Clone-able; keeps the state alive.
#[derive(Clone)]
pub struct StopToken {
    state: Rc<RefCell<StopState>>,
}

/// A callback registration that fires at most once on `request_stop`.
///
/// Callbacks run outside any internal borrow, so they may freely create
/// tokens, register further callbacks, or request stop on other sources.
pub struct StopCallback {
    state: Rc<RefCell<StopState>>,
    key: Option<usize>,
}

impl StopSource {
    pub fn new() -> Self {
        StopSource {
            state: Rc::new(RefCell::new(StopState {
                stopped: false,
                callbacks: Slab::new(),
            })),
        }
    }

    /// Request stop. Fires all registered callbacks once, in registration
    /// order. Returns true if this call performed the transition.
    pub fn request_stop(&self) -> bool {
        let callbacks: Vec<Callback> = {
            let mut state = self.state.borrow_mut();
            if state.stopped {
                return false;
            }
            state.stopped = true;
            state.callbacks.drain().collect()
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn stop_requested(&self) -> bool {
        self.state.borrow().stopped
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            state: self.state.clone(),
        }
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    /// A token that never reports stop (no associated source).
    pub fn never() -> Self {
        StopToken {
            state: Rc::new(RefCell::new(StopState {
                stopped: false,
                callbacks: Slab::new(),
            })),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.state.borrow().stopped
    }
}

impl StopCallback {
    /// Register `callback` to run when the token's source requests stop.
    /// If stop was already requested, the callback runs immediately,
    /// before `new` returns.
    pub fn new(token: &StopToken, callback: impl FnOnce() + 'static) -> Self {
        if token.state.borrow().stopped {
            callback();
            return StopCallback {
                state: token.state.clone(),
                key: None,
            };
        }
        let key = token.state.borrow_mut().callbacks.insert(Box::new(callback));
        StopCallback {
            state: token.state.clone(),
            key: Some(key),
        }
    }
}

impl Drop for StopCallback {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let mut state = self.state.borrow_mut();
            if state.callbacks.contains(key) {
                state.callbacks.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn request_stop_fires_callbacks_once() {
        let source = StopSource::new();
        let fired = Rc::new(Cell::new(0));

        let fired2 = fired.clone();
        let _cb = StopCallback::new(&source.token(), move || {
            fired2.set(fired2.get() + 1);
        });

        assert!(source.request_stop());
        assert_eq!(fired.get(), 1);

        // Second request is a no-op.
        assert!(!source.request_stop());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn late_subscribe_fires_immediately() {
        let source = StopSource::new();
        source.request_stop();

        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let _cb = StopCallback::new(&source.token(), move || fired2.set(true));
        assert!(fired.get());
    }

    #[test]
    fn dropped_callback_does_not_fire() {
        let source = StopSource::new();
        let fired = Rc::new(Cell::new(false));

        let fired2 = fired.clone();
        let cb = StopCallback::new(&source.token(), move || fired2.set(true));
        drop(cb);

        source.request_stop();
        assert!(!fired.get());
    }

    #[test]
    fn token_observes_stop() {
        let source = StopSource::new();
        let token = source.token();
        assert!(!token.stop_requested());
        source.request_stop();
        assert!(token.stop_requested());
    }

    #[test]
    fn token_outlives_source() {
        let token = {
            let source = StopSource::new();
            source.request_stop();
            source.token()
        };
        assert!(token.stop_requested());
    }

    #[test]
    fn never_token_never_stops() {
        let token = StopToken::never();
        assert!(!token.stop_requested());
    }

    #[test]
    fn chained_callbacks_propagate() {
        // Server-wide stop cancelling a per-connection source, the way
        // the HTTP server chains them.
        let server = StopSource::new();
        let conn = Rc::new(StopSource::new());

        let chained = conn.clone();
        let _chain = StopCallback::new(&server.token(), move || {
            chained.request_stop();
        });

        let fired = Rc::new(Cell::new(false));
        let fired2 = fired.clone();
        let _cb = StopCallback::new(&conn.token(), move || fired2.set(true));

        server.request_stop();
        assert!(fired.get());
        assert!(conn.token().stop_requested());
    }

    #[test]
    fn callback_may_register_another_callback() {
        let source = StopSource::new();
        let token = source.token();
        let fired = Rc::new(Cell::new(false));

        let fired2 = fired.clone();
        let inner_token = token.clone();
        let holder: Rc<RefCell<Option<StopCallback>>> = Rc::new(RefCell::new(None));
        let holder2 = holder.clone();
        let _cb = StopCallback::new(&token, move || {
            // Registering on an already-stopped token fires immediately.
            let cb = StopCallback::new(&inner_token, move || fired2.set(true));
            *holder2.borrow_mut() = Some(cb);
        });

        source.request_stop();
        assert!(fired.get());
    }
}
