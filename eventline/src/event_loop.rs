//! The event loop: fd readiness watchers, one-shot timers, user-triggered
//! events, zero-delay posts, and the task executor, all dispatched serially
//! on one thread.
//!
//! Watchers and timers are registered in slabs; the poller key carries a
//! generation stamp so a recycled slot never receives a stale readiness
//! event. Callbacks are invoked with no internal borrow held, so a handler
//! may freely create, trigger, modify, or drop other registrations.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use polling::{Event as PollEvent, Poller};
use slab::Slab;

use crate::error::Error;
use crate::task::{TaskId, TaskSlab};
use crate::waker;

/// Readiness interest for an fd watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
    /// Re-arm automatically after each delivery. Non-persistent watchers
    /// disarm after one event and must be re-armed via [`FdWatch::modify`].
    pub persist: bool,
}

impl Interest {
    pub const fn readable() -> Self {
        Interest {
            readable: true,
            writable: false,
            persist: false,
        }
    }

    pub const fn writable() -> Self {
        Interest {
            readable: false,
            writable: true,
            persist: false,
        }
    }

    pub const fn none() -> Self {
        Interest {
            readable: false,
            writable: false,
            persist: false,
        }
    }

    pub const fn persistent(mut self) -> Self {
        self.persist = true;
        self
    }

    pub const fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub const fn with_readable(mut self, readable: bool) -> Self {
        self.readable = readable;
        self
    }
}

/// Readiness delivered to an fd watcher callback.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
}

type FdCallback = Rc<RefCell<dyn FnMut(Readiness)>>;
type FireCallback = Rc<RefCell<dyn FnMut()>>;

struct Watcher {
    fd: RawFd,
    interest: Interest,
    generation: u32,
    callback: FdCallback,
}

struct TimerEntry {
    generation: u64,
    deadline: Option<Instant>,
    callback: FireCallback,
}

struct UserEntry {
    armed: bool,
    callback: FireCallback,
}

struct LoopState {
    tasks: TaskSlab,
    watchers: Slab<Watcher>,
    watcher_generation: u32,
    timers: Slab<TimerEntry>,
    timer_generation: u64,
    timer_heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
    user_events: Slab<UserEntry>,
    armed_user_events: VecDeque<usize>,
    posts: VecDeque<Box<dyn FnOnce()>>,
    stopped: bool,
}

struct Inner {
    poller: Poller,
    state: RefCell<LoopState>,
}

/// Handle to a single-threaded event loop. Cheap to clone.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

fn encode_key(slot: usize, generation: u32) -> usize {
    slot | ((generation as usize) << 32)
}

fn decode_key(key: usize) -> (usize, u32) {
    (key & 0xffff_ffff, (key >> 32) as u32)
}

fn poll_event(key: usize, interest: Interest) -> PollEvent {
    let mut event = PollEvent::none(key);
    event.readable = interest.readable;
    event.writable = interest.writable;
    event
}

impl EventLoop {
    pub fn new() -> Result<Self, Error> {
        Ok(EventLoop {
            inner: Rc::new(Inner {
                poller: Poller::new()?,
                state: RefCell::new(LoopState {
                    tasks: TaskSlab::new(),
                    watchers: Slab::new(),
                    watcher_generation: 0,
                    timers: Slab::new(),
                    timer_generation: 0,
                    timer_heap: BinaryHeap::new(),
                    user_events: Slab::new(),
                    armed_user_events: VecDeque::new(),
                    posts: VecDeque::new(),
                    stopped: false,
                }),
            }),
        })
    }

    /// Spawn a task onto the loop's executor. The task is polled during
    /// the next dispatch pass.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) -> TaskId {
        let id = self.inner.state.borrow_mut().tasks.spawn(Box::pin(future));
        waker::push_ready(id);
        TaskId(id)
    }

    /// Drop a spawned task, cancelling it. No-op if already completed.
    pub fn cancel(&self, task: TaskId) {
        self.inner.state.borrow_mut().tasks.remove(task.0);
    }

    /// Create a user-triggered event. [`UserEvent::trigger`] schedules
    /// `callback` to run once on the loop thread; repeat triggers while
    /// armed collapse into one run.
    pub fn user_event(&self, callback: impl FnMut() + 'static) -> UserEvent {
        let slot = self
            .inner
            .state
            .borrow_mut()
            .user_events
            .insert(UserEntry {
                armed: false,
                callback: Rc::new(RefCell::new(callback)),
            });
        UserEvent {
            event_loop: self.clone(),
            slot,
        }
    }

    /// Watch `fd` for readiness. The watcher is removed when the returned
    /// [`FdWatch`] is dropped; the fd must stay open until then.
    pub fn watch_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(Readiness) + 'static,
    ) -> Result<FdWatch, Error> {
        let (slot, generation) = {
            let mut state = self.inner.state.borrow_mut();
            state.watcher_generation = state.watcher_generation.wrapping_add(1);
            let generation = state.watcher_generation;
            let slot = state.watchers.insert(Watcher {
                fd,
                interest,
                generation,
                callback: Rc::new(RefCell::new(callback)),
            });
            (slot, generation)
        };
        let key = encode_key(slot, generation);
        if let Err(e) = self.inner.poller.add(fd, poll_event(key, interest)) {
            let _ = self.inner.state.borrow_mut().watchers.try_remove(slot);
            return Err(e.into());
        }
        Ok(FdWatch {
            event_loop: self.clone(),
            slot,
        })
    }

    /// Create a one-shot timer. Disarmed until [`TimerHandle::schedule`].
    pub fn timer(&self, callback: impl FnMut() + 'static) -> TimerHandle {
        let slot = self.inner.state.borrow_mut().timers.insert(TimerEntry {
            generation: 0,
            deadline: None,
            callback: Rc::new(RefCell::new(callback)),
        });
        TimerHandle {
            event_loop: self.clone(),
            slot,
        }
    }

    /// Schedule a one-shot zero-delay callback.
    pub fn post(&self, callback: impl FnOnce() + 'static) {
        self.inner
            .state
            .borrow_mut()
            .posts
            .push_back(Box::new(callback));
    }

    /// Schedule `waker` to be woken from a later dispatch pass. This is
    /// the deferred-resumption primitive: an outcome recorded inside a
    /// transport callback must not resume its awaiter in the same frame.
    pub fn post_resume(&self, waker: Waker) {
        self.post(move || waker.wake());
    }

    /// Sleep for `duration` on the loop's timer wheel.
    pub fn sleep(&self, duration: Duration) -> Sleep {
        Sleep {
            event_loop: self.clone(),
            duration,
            armed: None,
        }
    }

    /// Stop the loop after the current dispatch pass.
    pub fn stop(&self) {
        self.inner.state.borrow_mut().stopped = true;
    }

    /// Number of fd watchers currently registered. Useful for asserting
    /// teardown released everything.
    pub fn watcher_count(&self) -> usize {
        self.inner.state.borrow().watchers.len()
    }

    /// Run until stopped or until no live work remains (no watchers, no
    /// armed timers, and no queued callbacks or wakeups). Parked tasks
    /// alone do not keep the loop alive: with nothing registered that
    /// could wake them, they can never make progress.
    pub fn run(&self) -> Result<(), Error> {
        let mut poll_events: Vec<PollEvent> = Vec::new();
        loop {
            self.dispatch_timers();
            self.dispatch_posts();
            self.dispatch_user_events();
            self.poll_tasks();

            let next_deadline = self.next_timer_deadline();
            let (live, timeout) = {
                let state = self.inner.state.borrow();
                if state.stopped {
                    break;
                }
                let pending = !state.posts.is_empty()
                    || !state.armed_user_events.is_empty()
                    || waker::ready_queue_len() > 0;
                let live = pending || !state.watchers.is_empty() || next_deadline.is_some();
                let timeout = if pending {
                    Some(Duration::ZERO)
                } else {
                    next_deadline.map(|d| d.saturating_duration_since(Instant::now()))
                };
                (live, timeout)
            };
            if !live {
                let parked = self.inner.state.borrow().tasks.len();
                if parked > 0 {
                    tracing::warn!(parked, "event loop idle with parked tasks; exiting");
                }
                break;
            }

            poll_events.clear();
            match self.inner.poller.wait(&mut poll_events, timeout) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            for event in &poll_events {
                self.dispatch_fd(event);
            }
        }
        Ok(())
    }

    fn dispatch_fd(&self, event: &PollEvent) {
        let (slot, generation) = decode_key(event.key);
        let callback = {
            let state = self.inner.state.borrow();
            match state.watchers.get(slot) {
                Some(watcher) if watcher.generation == generation => {
                    if watcher.interest.persist {
                        // The poller is one-shot; re-arm before the
                        // callback so it observes a live registration.
                        let _ = self
                            .inner
                            .poller
                            .modify(watcher.fd, poll_event(event.key, watcher.interest));
                    }
                    Some(watcher.callback.clone())
                }
                _ => None,
            }
        };
        if let Some(callback) = callback {
            (callback.borrow_mut())(Readiness {
                readable: event.readable,
                writable: event.writable,
            });
        }
    }

    /// Earliest armed deadline, discarding heap entries whose timer was
    /// cancelled or re-armed since they were pushed.
    fn next_timer_deadline(&self) -> Option<Instant> {
        let mut state = self.inner.state.borrow_mut();
        loop {
            let Some(&Reverse((deadline, slot, generation))) = state.timer_heap.peek() else {
                return None;
            };
            let armed = state
                .timers
                .get(slot)
                .is_some_and(|entry| entry.generation == generation && entry.deadline == Some(deadline));
            if armed {
                return Some(deadline);
            }
            state.timer_heap.pop();
        }
    }

    fn dispatch_timers(&self) {
        loop {
            let callback = {
                let mut state = self.inner.state.borrow_mut();
                let now = Instant::now();
                let Some(&Reverse((deadline, slot, generation))) = state.timer_heap.peek() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                state.timer_heap.pop();
                match state.timers.get_mut(slot) {
                    Some(entry) if entry.generation == generation && entry.deadline.is_some() => {
                        entry.deadline = None;
                        Some(entry.callback.clone())
                    }
                    // Cancelled, re-armed, or recycled slot.
                    _ => None,
                }
            };
            if let Some(callback) = callback {
                (callback.borrow_mut())();
            }
        }
    }

    fn dispatch_posts(&self) {
        let posts = std::mem::take(&mut self.inner.state.borrow_mut().posts);
        for post in posts {
            post();
        }
    }

    fn dispatch_user_events(&self) {
        let armed = std::mem::take(&mut self.inner.state.borrow_mut().armed_user_events);
        for slot in armed {
            let callback = {
                let mut state = self.inner.state.borrow_mut();
                match state.user_events.get_mut(slot) {
                    Some(entry) if entry.armed => {
                        entry.armed = false;
                        Some(entry.callback.clone())
                    }
                    _ => None,
                }
            };
            if let Some(callback) = callback {
                (callback.borrow_mut())();
            }
        }
    }

    fn poll_tasks(&self) {
        let mut ready: VecDeque<usize> = VecDeque::new();
        waker::drain_ready_queue(&mut ready);
        loop {
            let Some(id) = ready.pop_front() else {
                // Pick up wakes fired while polling (including self-wakes
                // queued before their task was parked).
                waker::drain_ready_queue(&mut ready);
                if ready.is_empty() {
                    break;
                }
                continue;
            };
            let future = {
                let mut state = self.inner.state.borrow_mut();
                state.tasks.wake(id);
                state.tasks.take_ready(id)
            };
            let Some(mut future) = future else { continue };
            let task_waker = waker::task_waker(id);
            let mut cx = Context::from_waker(&task_waker);
            match future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => self.inner.state.borrow_mut().tasks.remove(id),
                Poll::Pending => self.inner.state.borrow_mut().tasks.park(id, future),
            }
        }
    }
}

/// A user-triggered event registration. Dropping unregisters it.
pub struct UserEvent {
    event_loop: EventLoop,
    slot: usize,
}

impl UserEvent {
    /// Schedule the callback to run once on the loop thread. Triggers
    /// while already armed collapse into a single run.
    pub fn trigger(&self) {
        let mut guard = self.event_loop.inner.state.borrow_mut();
        let state = &mut *guard;
        if let Some(entry) = state.user_events.get_mut(self.slot) {
            if !entry.armed {
                entry.armed = true;
                state.armed_user_events.push_back(self.slot);
            }
        }
    }

    /// Whether a trigger is pending dispatch.
    pub fn is_armed(&self) -> bool {
        self.event_loop
            .inner
            .state
            .borrow()
            .user_events
            .get(self.slot)
            .is_some_and(|entry| entry.armed)
    }
}

impl Drop for UserEvent {
    fn drop(&mut self) {
        let _ = self
            .event_loop
            .inner
            .state
            .borrow_mut()
            .user_events
            .try_remove(self.slot);
    }
}

/// An fd readiness watcher. Dropping deletes the registration.
pub struct FdWatch {
    event_loop: EventLoop,
    slot: usize,
}

impl FdWatch {
    /// Replace the watcher's interest set.
    pub fn modify(&self, interest: Interest) -> Result<(), Error> {
        let (fd, key) = {
            let mut state = self.event_loop.inner.state.borrow_mut();
            let watcher = state
                .watchers
                .get_mut(self.slot)
                .ok_or(Error::StaleRegistration)?;
            watcher.interest = interest;
            (watcher.fd, encode_key(self.slot, watcher.generation))
        };
        self.event_loop
            .inner
            .poller
            .modify(fd, poll_event(key, interest))?;
        Ok(())
    }
}

impl Drop for FdWatch {
    fn drop(&mut self) {
        let fd = self
            .event_loop
            .inner
            .state
            .borrow_mut()
            .watchers
            .try_remove(self.slot)
            .map(|watcher| watcher.fd);
        if let Some(fd) = fd {
            if let Err(e) = self.event_loop.inner.poller.delete(fd) {
                tracing::trace!(fd, error = %e, "poller delete on drop failed");
            }
        }
    }
}

/// A one-shot timer. Dropping cancels and unregisters it.
pub struct TimerHandle {
    event_loop: EventLoop,
    slot: usize,
}

impl TimerHandle {
    /// Arm (or re-arm) the timer to fire once after `delay`.
    pub fn schedule(&self, delay: Duration) {
        let mut guard = self.event_loop.inner.state.borrow_mut();
        let state = &mut *guard;
        state.timer_generation += 1;
        let generation = state.timer_generation;
        let deadline = Instant::now() + delay;
        if let Some(entry) = state.timers.get_mut(self.slot) {
            entry.generation = generation;
            entry.deadline = Some(deadline);
            state
                .timer_heap
                .push(Reverse((deadline, self.slot, generation)));
        }
    }

    /// Disarm the timer. No-op if not armed.
    pub fn cancel(&self) {
        let mut state = self.event_loop.inner.state.borrow_mut();
        state.timer_generation += 1;
        let generation = state.timer_generation;
        if let Some(entry) = state.timers.get_mut(self.slot) {
            entry.generation = generation;
            entry.deadline = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.event_loop
            .inner
            .state
            .borrow()
            .timers
            .get(self.slot)
            .is_some_and(|entry| entry.deadline.is_some())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let _ = self
            .event_loop
            .inner
            .state
            .borrow_mut()
            .timers
            .try_remove(self.slot);
    }
}

struct SleepState {
    fired: bool,
    waker: Option<Waker>,
}

/// Future returned by [`EventLoop::sleep`].
pub struct Sleep {
    event_loop: EventLoop,
    duration: Duration,
    armed: Option<(TimerHandle, Rc<RefCell<SleepState>>)>,
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if let Some((_, state)) = &this.armed {
            let mut state = state.borrow_mut();
            if state.fired {
                return Poll::Ready(());
            }
            state.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let state = Rc::new(RefCell::new(SleepState {
            fired: false,
            waker: Some(cx.waker().clone()),
        }));
        let shared = state.clone();
        let timer = this.event_loop.timer(move || {
            let waker = {
                let mut state = shared.borrow_mut();
                state.fired = true;
                state.waker.take()
            };
            if let Some(waker) = waker {
                waker.wake();
            }
        });
        timer.schedule(this.duration);
        this.armed = Some((timer, state));
        Poll::Pending
    }
}
