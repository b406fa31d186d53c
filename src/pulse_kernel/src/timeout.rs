//! Timed events
//!
//! One deadline-ordered list carries every timed wait and every armed
//! software timer. The tick handler pops expired entries: timed waits are
//! released with a timeout reason, timer callbacks run in the tick (ISR)
//! context with the CPU lock released.
use crate::{
    klock::{self, CpuLockGuard},
    thread, timer, wait, Kernel, Port, ResultCode, ThreadId, TimerId,
};

/// An entry in the timed-event list.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimedEvent {
    /// Absolute deadline in ticks.
    pub(crate) at: u64,
    pub(crate) kind: TimedEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimedEventKind {
    /// Release a timed wait.
    WakeThread(ThreadId),
    /// Fire a software timer.
    Timer(TimerId),
}

/// Register a timed event, keeping the list ordered by deadline (FIFO among
/// equal deadlines).
pub(crate) fn insert_event<P: Port>(lock: &mut CpuLockGuard<'_, P>, at: u64, kind: TimedEventKind) {
    let pos = lock
        .timed_events
        .iter()
        .position(|e| e.at > at)
        .unwrap_or(lock.timed_events.len());
    lock.timed_events.insert(pos, TimedEvent { at, kind });
}

/// Drop the timed event of a thread's wait, if one is outstanding.
pub(crate) fn remove_thread_event<P: Port>(lock: &mut CpuLockGuard<'_, P>, thread: ThreadId) {
    lock.timed_events
        .retain(|e| e.kind != TimedEventKind::WakeThread(thread));
}

/// Drop a timer's pending expiry, if one is outstanding.
pub(crate) fn remove_timer_event<P: Port>(lock: &mut CpuLockGuard<'_, P>, timer: TimerId) {
    lock.timed_events
        .retain(|e| e.kind != TimedEventKind::Timer(timer));
}

/// The kernel half of the tick ISR; see [`Kernel::tick`].
pub(crate) fn handle_tick<P: Port>(kernel: &'static Kernel<P>) {
    let mut lock = klock::lock_cpu(kernel);
    lock.tick_count += 1;
    let now = lock.tick_count;

    loop {
        if lock.timed_events.is_empty() || lock.timed_events[0].at > now {
            break;
        }
        let due = lock.timed_events.remove(0);
        match due.kind {
            TimedEventKind::WakeThread(tid) => {
                if lock[tid].st == thread::ThreadState::Waiting {
                    log::trace!("tick {}: timing out {:?}", now, tid);
                    wait::interrupt_thread(&mut lock, tid, ResultCode::ErrorTimeoutResource);
                }
            }
            TimedEventKind::Timer(tim) => {
                if let Some((callback, arg)) = timer::expire(&mut lock, tim, now) {
                    // Callbacks run in the tick context and may only use the
                    // ISR-safe services, which re-enter the CPU lock on
                    // their own.
                    drop(lock);
                    callback(kernel, arg);
                    lock = klock::lock_cpu(kernel);
                }
            }
        }
    }

    thread::unlock_cpu_and_check_preemption(kernel, lock);
}
