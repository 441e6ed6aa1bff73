use std::cell::RefCell;
use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

thread_local! {
    /// Thread-local queue of task ids whose futures are ready to poll.
    /// Wakers push to this queue; the loop drains it between dispatches.
    static READY_QUEUE: RefCell<VecDeque<usize>> = const { RefCell::new(VecDeque::new()) };
}

/// Create a [`Waker`] for the given task id.
///
/// When woken, the waker pushes `task_id` onto the thread-local
/// `READY_QUEUE`. Zero allocation — the id is encoded as a raw
/// pointer (usize cast).
///
/// # Safety
///
/// Must only be used on the thread the event loop runs on (the runtime
/// is strictly single-threaded).
pub(crate) fn task_waker(task_id: usize) -> Waker {
    let data = task_id as *const ();
    // SAFETY: The vtable functions below follow the RawWaker contract.
    // The "data" is just a usize (task id) cast to a pointer — no heap
    // allocation, no lifetime concerns.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    // SAFETY: wake_by_ref_fn is safe to call with data from our vtable.
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    push_ready(data as usize);
}

unsafe fn drop_fn(_data: *const ()) {
    // No resources to free — data is just a usize.
}

/// Mark a task ready to poll. Used by wakers and by `spawn`.
pub(crate) fn push_ready(task_id: usize) {
    READY_QUEUE.with(|q| q.borrow_mut().push_back(task_id));
}

/// Drain the thread-local ready queue into the provided buffer.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<usize>) {
    READY_QUEUE.with(|q| buf.append(&mut q.borrow_mut()));
}

/// Number of queued wakeups that have not been drained yet.
pub(crate) fn ready_queue_len() -> usize {
    READY_QUEUE.with(|q| q.borrow().len())
}
