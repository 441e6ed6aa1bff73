use std::future::Future;
use std::pin::Pin;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Opaque handle for a task spawned via [`EventLoop::spawn`](crate::EventLoop::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub(crate) usize);

/// State of a single task slot.
enum TaskSlot {
    /// Slot is empty (no task).
    Empty,
    /// Task is parked (waiting for a wakeup).
    Parked(BoxFuture),
    /// Task is ready to be polled.
    Ready(BoxFuture),
}

/// Growable slab of async tasks with a free list for O(1) slot reuse.
///
/// Tasks are spawned Ready, parked after returning `Poll::Pending`, and
/// marked Ready again when their waker fires.
pub(crate) struct TaskSlab {
    tasks: Vec<TaskSlot>,
    free_list: Vec<usize>,
    live: usize,
}

impl TaskSlab {
    pub(crate) fn new() -> Self {
        TaskSlab {
            tasks: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    /// Spawn a task, returning its slot index. The task is immediately
    /// in the Ready state for its first poll.
    pub(crate) fn spawn(&mut self, future: BoxFuture) -> usize {
        self.live += 1;
        match self.free_list.pop() {
            Some(idx) => {
                debug_assert!(matches!(self.tasks[idx], TaskSlot::Empty));
                self.tasks[idx] = TaskSlot::Ready(future);
                idx
            }
            None => {
                self.tasks.push(TaskSlot::Ready(future));
                self.tasks.len() - 1
            }
        }
    }

    /// Take a Ready task out for polling. Returns None if the slot is
    /// not in the Ready state.
    pub(crate) fn take_ready(&mut self, idx: usize) -> Option<BoxFuture> {
        if idx >= self.tasks.len() {
            return None;
        }
        match std::mem::replace(&mut self.tasks[idx], TaskSlot::Empty) {
            TaskSlot::Ready(fut) => Some(fut),
            other => {
                // Put it back — was not Ready.
                self.tasks[idx] = other;
                None
            }
        }
    }

    /// Park a task back after it returned `Poll::Pending`.
    pub(crate) fn park(&mut self, idx: usize, future: BoxFuture) {
        debug_assert!(idx < self.tasks.len());
        self.tasks[idx] = TaskSlot::Parked(future);
    }

    /// Mark a Parked task as Ready (called when its waker fires).
    /// Returns true if the task was parked and is now ready.
    pub(crate) fn wake(&mut self, idx: usize) -> bool {
        if idx >= self.tasks.len() {
            return false;
        }
        match std::mem::replace(&mut self.tasks[idx], TaskSlot::Empty) {
            TaskSlot::Parked(fut) => {
                self.tasks[idx] = TaskSlot::Ready(fut);
                true
            }
            TaskSlot::Ready(fut) => {
                // Already ready — put it back.
                self.tasks[idx] = TaskSlot::Ready(fut);
                false
            }
            TaskSlot::Empty => false,
        }
    }

    /// Remove a completed or cancelled task, returning its slot to the
    /// free list.
    pub(crate) fn remove(&mut self, idx: usize) {
        if idx < self.tasks.len() && !matches!(self.tasks[idx], TaskSlot::Empty) {
            self.tasks[idx] = TaskSlot::Empty;
            self.free_list.push(idx);
            self.live -= 1;
        }
    }

    /// Number of live (Ready or Parked) tasks.
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll};

    /// A future that resolves after being polled N times.
    struct CountdownFuture(u32);

    impl Future for CountdownFuture {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 == 0 {
                Poll::Ready(())
            } else {
                self.0 -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn spawn_and_take_ready() {
        let mut slab = TaskSlab::new();
        let idx = slab.spawn(Box::pin(CountdownFuture(2)));
        assert_eq!(slab.len(), 1);

        // Should be Ready immediately after spawn.
        assert!(slab.take_ready(idx).is_some());

        // After taking, the slot is no longer Ready.
        assert!(slab.take_ready(idx).is_none());
    }

    #[test]
    fn park_and_wake() {
        let mut slab = TaskSlab::new();
        let idx = slab.spawn(Box::pin(CountdownFuture(1)));
        let fut = slab.take_ready(idx).unwrap();

        slab.park(idx, fut);
        assert!(slab.take_ready(idx).is_none());

        assert!(slab.wake(idx));
        assert!(slab.take_ready(idx).is_some());
    }

    #[test]
    fn remove_returns_slot_to_free_list() {
        let mut slab = TaskSlab::new();
        let a = slab.spawn(Box::pin(CountdownFuture(0)));
        let _b = slab.spawn(Box::pin(CountdownFuture(0)));
        assert_eq!(slab.len(), 2);

        slab.remove(a);
        assert_eq!(slab.len(), 1);

        // The freed slot is reused.
        let c = slab.spawn(Box::pin(CountdownFuture(0)));
        assert_eq!(c, a);
    }

    #[test]
    fn wake_empty_slot() {
        let mut slab = TaskSlab::new();
        assert!(!slab.wake(3));
    }

    #[test]
    fn wake_already_ready() {
        let mut slab = TaskSlab::new();
        let idx = slab.spawn(Box::pin(CountdownFuture(0)));
        // Already ready — wake returns false (already queued).
        assert!(!slab.wake(idx));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut slab = TaskSlab::new();
        let idx = slab.spawn(Box::pin(CountdownFuture(0)));
        slab.remove(idx);
        slab.remove(idx);
        assert_eq!(slab.len(), 0);
    }
}
