//! eventline — a single-threaded, event-driven coroutine runtime.
//!
//! eventline drives async tasks from a poller-backed event loop: fd
//! readiness watchers, one-shot timers, user-triggered events, and
//! zero-delay posts, all dispatched serially on the loop thread. There is
//! no locking and no work-stealing; correctness rests on cooperative
//! scheduling and on callbacks never re-entering each other within a
//! single dispatch.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use eventline::EventLoop;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), eventline::Error> {
//!     let event_loop = EventLoop::new()?;
//!     let handle = event_loop.clone();
//!     event_loop.spawn(async move {
//!         handle.sleep(Duration::from_millis(10)).await;
//!         println!("tick");
//!     });
//!     event_loop.run()
//! }
//! ```
//!
//! # Building blocks
//!
//! - [`EventLoop`] — the loop handle: `spawn`, `watch_fd`, `timer`,
//!   `user_event`, `post`, `post_resume`, `sleep`, `run`.
//! - [`StopSource`] / [`StopToken`] / [`StopCallback`] — cooperative
//!   cancellation; callbacks fire at most once on `request_stop`.
//! - [`Signal`] — a one-shot latch a task can await and any callback can
//!   fire; used for write-drained acknowledgments and shutdown handshakes.

mod error;
mod event_loop;
mod signal;
mod stop;
mod task;
mod waker;

pub use error::Error;
pub use event_loop::{EventLoop, FdWatch, Interest, Readiness, Sleep, TimerHandle, UserEvent};
pub use signal::{Signal, SignalWait};
pub use stop::{StopCallback, StopSource, StopToken};
pub use task::TaskId;
