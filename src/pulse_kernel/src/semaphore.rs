//! Semaphores
//!
//! Counting semaphores with a configurable maximum; a maximum of one gives
//! binary semantics. `post` hands a token directly to the highest-priority
//! waiter, so the counter never moves while threads are queued.
use core::fmt;

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock::{self, CpuLockGuard},
    state, thread,
    wait::{self, PrioList, WaitPayload},
    Kernel, Port, SemaphoreId,
};

/// Creation attributes for a semaphore.
#[derive(Clone, Copy)]
pub struct SemaphoreAttributes {
    pub name: &'static str,
    pub initial_count: u32,
    pub max_count: u32,
}

impl Default for SemaphoreAttributes {
    fn default() -> Self {
        Self {
            name: "",
            initial_count: 0,
            max_count: u32::MAX,
        }
    }
}

/// *Semaphore control block* - the state data of a semaphore.
pub(crate) struct SemaphoreCb {
    pub(crate) in_use: bool,
    pub(crate) name: &'static str,
    pub(crate) count: u32,
    pub(crate) max_count: u32,
    pub(crate) wait_queue: PrioList,
    /// In-progress flag for ISR-level invocations on this object.
    pub(crate) isr_busy: bool,
}

impl fmt::Debug for SemaphoreCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphoreCb")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("max_count", &self.max_count)
            .finish_non_exhaustive()
    }
}

/// Handle to a semaphore.
pub struct Semaphore<P: Port> {
    kernel: &'static Kernel<P>,
    id: SemaphoreId,
}

impl<P: Port> Clone for Semaphore<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for Semaphore<P> {}

impl<P: Port> fmt::Debug for Semaphore<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Semaphore").field(&self.id.0).finish()
    }
}

impl<P: Port> Semaphore<P> {
    /// Create a counting semaphore.
    pub fn new(kernel: &'static Kernel<P>, attr: SemaphoreAttributes) -> Result<Self> {
        if attr.max_count == 0 || attr.initial_count > attr.max_count {
            return Err(ResultCode::ErrorParameter);
        }
        let mut lock = klock::lock_cpu(kernel);
        let id = if let Some(pos) = lock.semaphores.iter().position(|cb| !cb.in_use) {
            SemaphoreId(pos)
        } else {
            if lock.semaphores.is_full() {
                return Err(ResultCode::ErrorNoMemory);
            }
            let id = SemaphoreId(lock.semaphores.len());
            lock.semaphores.push(SemaphoreCb {
                in_use: false,
                name: "",
                count: 0,
                max_count: 0,
                wait_queue: PrioList::new(),
                isr_busy: false,
            });
            id
        };
        lock[id] = SemaphoreCb {
            in_use: true,
            name: attr.name,
            count: attr.initial_count,
            max_count: attr.max_count,
            wait_queue: PrioList::new(),
            isr_busy: false,
        };
        Ok(Self { kernel, id })
    }

    /// Create a binary semaphore: the counter saturates at one.
    pub fn binary(kernel: &'static Kernel<P>, name: &'static str, taken: bool) -> Result<Self> {
        Self::new(
            kernel,
            SemaphoreAttributes {
                name,
                initial_count: if taken { 0 } else { 1 },
                max_count: 1,
            },
        )
    }

    /// Release one token: wake the highest-priority waiter, or increment
    /// the counter. Incrementing past the maximum fails with
    /// [`ResultCode::Eoverflow`].
    ///
    /// ISR-safe.
    pub fn post(&self) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let id = self.id;
        let woke = with_isr_claim(self.kernel, &mut lock, id, |lock| {
            if let Some(next) = lock[id].wait_queue.pop_highest() {
                // The woken thread consumes the token; the counter is
                // untouched.
                wait::complete_wake(lock, next, ResultCode::Success);
                return Ok(true);
            }
            let cb = &mut lock[id];
            if cb.count == cb.max_count {
                return Err(ResultCode::Eoverflow);
            }
            cb.count += 1;
            Ok(false)
        })??;
        if woke {
            thread::unlock_cpu_and_check_preemption(self.kernel, lock);
        }
        Ok(())
    }

    /// Take one token, blocking while none is available.
    pub fn wait(&self) -> Result {
        self.timed_wait(cfg::WAIT_FOREVER)
    }

    /// Take one token or fail immediately with [`ResultCode::EAGAIN`].
    pub fn try_wait(&self) -> Result {
        self.timed_wait(0)
    }

    /// Take one token, giving up after `ticks` tick periods with
    /// [`ResultCode::ETIMEDOUT`]. `0` means non-blocking.
    pub fn timed_wait(&self, ticks: u64) -> Result {
        let mut lock = klock::lock_cpu_as_current(self.kernel);
        state::expect_waitable_context(self.kernel, &lock)?;
        lock = thread::cancellation_point(self.kernel, lock);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }

        if lock[self.id].count > 0 {
            lock[self.id].count -= 1;
            return Ok(());
        }
        if ticks == 0 {
            return Err(ResultCode::EAGAIN);
        }
        let deadline = if ticks == cfg::WAIT_FOREVER {
            None
        } else {
            Some(lock.tick_count + ticks)
        };
        let (_lock, reason, _payload) =
            wait::block_current(self.kernel, lock, WaitPayload::Semaphore(self.id), deadline);
        match reason {
            ResultCode::Success => Ok(()),
            reason => Err(reason),
        }
    }

    /// The current counter value.
    pub fn value(&self) -> u32 {
        let lock = klock::lock_cpu(self.kernel);
        if lock[self.id].in_use {
            lock[self.id].count
        } else {
            0
        }
    }
}

/// Run `f` with the semaphore's ISR in-progress flag claimed when the
/// caller is an interrupt handler; the flag is released on every path out
/// of `f`. A second interrupt-level call on the same object while one is
/// in progress fails with [`ResultCode::ErrorIsrRecursive`].
fn with_isr_claim<'a, P: Port, R>(
    kernel: &Kernel<P>,
    lock: &mut CpuLockGuard<'a, P>,
    id: SemaphoreId,
    f: impl FnOnce(&mut CpuLockGuard<'a, P>) -> R,
) -> Result<R> {
    let claimed = kernel.port().is_in_irq();
    if claimed {
        if lock[id].isr_busy {
            return Err(ResultCode::ErrorIsrRecursive);
        }
        lock[id].isr_busy = true;
    }
    let result = f(lock);
    if claimed {
        lock[id].isr_busy = false;
    }
    Ok(result)
}
