//! Prioritised wait lists
//!
//! Every blocking primitive queues its waiters on the same structure,
//! [`PrioList`]: an ordered sequence of threads keyed by current (dynamic)
//! priority, FIFO within a band. The scheduler's ready queue reuses it.
//!
//! The wake-upper completes the effect of a wait operation on behalf of the
//! woken thread wherever possible (ownership transfer, message handoff);
//! the woken thread merely reads the outcome out of its wait payload.
use arrayvec::ArrayVec;

use crate::{
    cfg,
    klock::CpuLockGuard,
    mutex, thread,
    thread::ThreadState,
    timeout, CondvarId, Kernel, KernelState, MutexId, PoolId, Port, QueueId, ResultCode,
    SemaphoreId, ThreadId,
};

/// One waiter: the priority it was enqueued with and which thread it is.
///
/// Carrying the priority in the entry keeps ordering decisions local to the
/// list; a priority change reorders the thread explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) priority: u8,
    pub(crate) thread: ThreadId,
}

/// Priority-ordered thread list: descending priority, FIFO within equal
/// priority. Insertion is O(n), removal O(n), pop-highest O(1) plus the
/// shift.
pub(crate) struct PrioList {
    entries: ArrayVec<Entry, { cfg::MAX_THREADS }>,
}

impl PrioList {
    pub(crate) const fn new() -> Self {
        Self {
            entries: ArrayVec::new_const(),
        }
    }

    /// Insert `thread` behind every entry of priority >= `priority`.
    pub(crate) fn insert(&mut self, priority: u8, thread: ThreadId) {
        debug_assert!(!self.contains(thread));
        let pos = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, Entry { priority, thread });
    }

    /// Remove `thread` from the list. Returns whether it was present.
    pub(crate) fn remove(&mut self, thread: ThreadId) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.thread == thread) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove and return the highest-priority thread.
    pub(crate) fn pop_highest(&mut self) -> Option<ThreadId> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).thread)
        }
    }

    /// The head of the list, without removing it.
    pub(crate) fn first(&self) -> Option<Entry> {
        self.entries.first().copied()
    }

    /// Reposition `thread` after a priority change. Returns whether it was
    /// present.
    pub(crate) fn reorder(&mut self, thread: ThreadId, new_priority: u8) -> bool {
        if self.remove(thread) {
            self.insert(new_priority, thread);
            true
        } else {
            false
        }
    }

    pub(crate) fn contains(&self, thread: ThreadId) -> bool {
        self.entries.iter().any(|e| e.thread == thread)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Entry> + '_ {
        self.entries.iter().copied()
    }
}

/// Why a thread is waiting, and the operation state its wake-upper may
/// fill in.
#[derive(Debug, Clone, Copy)]
pub(crate) enum WaitPayload {
    /// `sleep_for` or a timed wait with no object.
    Sleep,
    Semaphore(SemaphoreId),
    Mutex(MutexId),
    Condvar {
        condvar: CondvarId,
    },
    Join {
        target: ThreadId,
        /// Filled in by the exiting thread.
        exit_value: usize,
    },
    QueueSend {
        queue: QueueId,
        /// The pending message; consumed by the thread that makes space.
        msg: usize,
    },
    QueueRecv {
        queue: QueueId,
        /// The delivered message, valid when `filled`.
        msg: usize,
        filled: bool,
    },
    MailAlloc {
        pool: PoolId,
        /// Block address handed over by `free`, valid when nonzero.
        block: usize,
    },
}

/// The wait list a payload enqueues on, if any.
fn wait_list_of<'s, P: Port>(
    state: &'s mut KernelState<P>,
    payload: &WaitPayload,
) -> Option<&'s mut PrioList> {
    Some(match *payload {
        WaitPayload::Sleep => return None,
        WaitPayload::Semaphore(id) => &mut state[id].wait_queue,
        WaitPayload::Mutex(id) => &mut state[id].wait_queue,
        WaitPayload::Condvar { condvar } => &mut state[condvar].wait_queue,
        WaitPayload::Join { target, .. } => &mut state[target].join_queue,
        WaitPayload::QueueSend { queue, .. } => &mut state[queue].send_queue,
        WaitPayload::QueueRecv { queue, .. } => &mut state[queue].recv_queue,
        WaitPayload::MailAlloc { pool, .. } => &mut state[pool].wait_queue,
    })
}

/// Transition the current thread into the Waiting state and hand the CPU
/// over; returns when the thread is dispatched again.
///
/// `deadline` is an absolute tick; when it passes, the tick handler wakes
/// the thread with a timeout reason. The returned payload is the thread's
/// own, possibly updated by the wake-upper.
pub(crate) fn block_current<P: Port>(
    kernel: &'static Kernel<P>,
    mut lock: CpuLockGuard<'static, P>,
    payload: WaitPayload,
    deadline: Option<u64>,
) -> (CpuLockGuard<'static, P>, ResultCode, WaitPayload) {
    let tid = lock.running_thread.expect("no running thread at a wait");
    debug_assert_eq!(lock[tid].st, ThreadState::Running);

    let priority = lock[tid].effective_priority;
    if let Some(list) = wait_list_of(&mut lock, &payload) {
        list.insert(priority, tid);
    }
    {
        let cb = &mut lock[tid];
        cb.st = ThreadState::Waiting;
        cb.wakeup_reason = ResultCode::Success;
        cb.wait = Some(payload);
    }
    if let Some(at) = deadline {
        timeout::insert_event(&mut lock, at, timeout::TimedEventKind::WakeThread(tid));
    }

    let decision = thread::choose_next_running_thread(&mut lock);
    drop(lock);
    if let Some((from, to)) = decision {
        kernel.port().context_switch(kernel, from, to);
    }

    // Wait until the scheduler names this thread again. On ports with real
    // context switching the first iteration already observes Running.
    loop {
        kernel.port().settle(kernel);
        lock = crate::klock::lock_cpu(kernel);
        if lock[tid].st == ThreadState::Running {
            break;
        }
        drop(lock);
    }

    timeout::remove_thread_event(&mut lock, tid);
    let payload = lock[tid].wait.take().expect("wait payload vanished");
    let reason = lock[tid].wakeup_reason;

    // Deferred cancellation: a wait is a suspension point, so a pending
    // cancel terminates the thread here rather than returning to it.
    if lock[tid].cancel_pending {
        drop(lock);
        kernel.port().exit_thread(kernel);
    }

    (lock, reason, payload)
}

/// Wake `thread` after its wake-upper has already removed it from the wait
/// list (e.g. by [`PrioList::pop_highest`]).
pub(crate) fn complete_wake<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    thread: ThreadId,
    reason: ResultCode,
) {
    debug_assert_eq!(lock[thread].st, ThreadState::Waiting);
    timeout::remove_thread_event(lock, thread);
    lock[thread].wakeup_reason = reason;
    thread::make_ready(lock, thread);
}

/// Force `thread` out of the Waiting state with `reason`, cleaning up its
/// wait-list membership and any timed event. No-op (returning `false`) if
/// the thread isn't waiting.
///
/// Used by timeouts, `Thread::wakeup`, and cancellation.
pub(crate) fn interrupt_thread<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    thread: ThreadId,
    reason: ResultCode,
) -> bool {
    if lock[thread].st != ThreadState::Waiting {
        return false;
    }
    let payload = lock[thread].wait.expect("waiting thread has no payload");
    if let Some(list) = wait_list_of(&mut *lock, &payload) {
        list.remove(thread);
    }
    if let WaitPayload::Mutex(mutex) = payload {
        // The departing waiter may have been the reason for a priority
        // boost; let the mutex recompute the owner's priority.
        mutex::on_waiter_removed(lock, mutex);
    }
    complete_wake(lock, thread, reason);
    true
}

/// Reposition a waiting thread in its wait list after a priority change.
pub(crate) fn reorder_wait_of_thread<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    thread: ThreadId,
    new_priority: u8,
) {
    debug_assert_eq!(lock[thread].st, ThreadState::Waiting);
    let payload = lock[thread].wait.expect("waiting thread has no payload");
    if let Some(list) = wait_list_of(&mut *lock, &payload) {
        list.reorder(thread, new_priority);
    }
}
