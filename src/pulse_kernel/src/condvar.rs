//! Condition variables
//!
//! A condition variable is a wait list and nothing more. `wait` atomically
//! releases the associated mutex and blocks; the woken thread reacquires
//! the mutex before returning, including on timeout. Spurious wakeups are
//! permitted, so callers loop on their predicate.
use core::fmt;

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock, mutex, state, thread,
    wait::{self, PrioList, WaitPayload},
    CondvarId, Kernel, Port,
};

/// Creation attributes for a condition variable.
#[derive(Clone, Copy, Default)]
pub struct CondvarAttributes {
    pub name: &'static str,
}

/// *Condition variable control block* - a wait list only; no state.
pub(crate) struct CondvarCb {
    pub(crate) in_use: bool,
    pub(crate) name: &'static str,
    pub(crate) wait_queue: PrioList,
}

impl fmt::Debug for CondvarCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CondvarCb")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Handle to a condition variable.
pub struct Condvar<P: Port> {
    kernel: &'static Kernel<P>,
    id: CondvarId,
}

impl<P: Port> Clone for Condvar<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for Condvar<P> {}

impl<P: Port> fmt::Debug for Condvar<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Condvar").field(&self.id.0).finish()
    }
}

impl<P: Port> Condvar<P> {
    /// Create a condition variable.
    pub fn new(kernel: &'static Kernel<P>, attr: CondvarAttributes) -> Result<Self> {
        let mut lock = klock::lock_cpu(kernel);
        let id = if let Some(pos) = lock.condvars.iter().position(|cb| !cb.in_use) {
            CondvarId(pos)
        } else {
            if lock.condvars.is_full() {
                return Err(ResultCode::ErrorNoMemory);
            }
            let id = CondvarId(lock.condvars.len());
            lock.condvars.push(CondvarCb {
                in_use: false,
                name: "",
                wait_queue: PrioList::new(),
            });
            id
        };
        lock[id] = CondvarCb {
            in_use: true,
            name: attr.name,
            wait_queue: PrioList::new(),
        };
        Ok(Self { kernel, id })
    }

    /// Release `mutex` and block until signalled, then reacquire `mutex`.
    ///
    /// The caller must own `mutex` with a recursion count of one.
    pub fn wait(&self, mutex: &crate::Mutex<P>) -> Result {
        self.timed_wait(mutex, cfg::WAIT_FOREVER)
    }

    /// Like [`Condvar::wait`], but gives up after `ticks` tick periods with
    /// [`ResultCode::ETIMEDOUT`]. The mutex is reacquired even on timeout.
    pub fn timed_wait(&self, mutex: &crate::Mutex<P>, ticks: u64) -> Result {
        let mut lock = klock::lock_cpu_as_current(self.kernel);
        state::expect_waitable_context(self.kernel, &lock)?;
        lock = thread::cancellation_point(self.kernel, lock);
        let me = lock.running_thread.unwrap();
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let mutex_id = mutex.raw_id();
        if !lock[mutex_id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        if lock[mutex_id].owner != Some(me) || lock[mutex_id].count != 1 {
            return Err(ResultCode::ErrorResource);
        }

        // Atomically: drop the mutex (possibly handing it to a waiter) and
        // join this condition variable's wait list.
        mutex::release_for_condvar(&mut lock, mutex_id, me);
        let deadline = if ticks == cfg::WAIT_FOREVER {
            None
        } else {
            Some(lock.tick_count + ticks)
        };
        let (lock, reason, _payload) = wait::block_current(
            self.kernel,
            lock,
            WaitPayload::Condvar { condvar: self.id },
            deadline,
        );
        drop(lock);

        // Reacquire before reporting the wait's outcome, whatever it was.
        mutex.lock()?;
        match reason {
            ResultCode::Success => Ok(()),
            reason => Err(reason),
        }
    }

    /// Wake the highest-priority waiter, if any.
    ///
    /// ISR-safe.
    pub fn signal(&self) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        if let Some(next) = lock[self.id].wait_queue.pop_highest() {
            wait::complete_wake(&mut lock, next, ResultCode::Success);
            thread::unlock_cpu_and_check_preemption(self.kernel, lock);
        }
        Ok(())
    }

    /// Wake every waiter.
    ///
    /// ISR-safe.
    pub fn broadcast(&self) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let mut woke_any = false;
        while let Some(next) = lock[self.id].wait_queue.pop_highest() {
            wait::complete_wake(&mut lock, next, ResultCode::Success);
            woke_any = true;
        }
        if woke_any {
            thread::unlock_cpu_and_check_preemption(self.kernel, lock);
        }
        Ok(())
    }
}
