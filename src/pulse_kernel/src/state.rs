//! Calling-context predicates
use crate::{error::Result, klock::CpuLockGuard, Kernel, Port, ResultCode};

/// If the current context is not a thread context, return an error:
/// [`ResultCode::ErrorIsr`] from an ISR, [`ResultCode::ErrorOs`] before the
/// scheduler has dispatched a thread.
pub(crate) fn expect_task_context<P: Port>(
    kernel: &Kernel<P>,
    lock: &CpuLockGuard<'_, P>,
) -> Result {
    if kernel.port().is_in_irq() {
        return Err(ResultCode::ErrorIsr);
    }
    if lock.running_thread.is_none() {
        return Err(ResultCode::ErrorOs);
    }
    Ok(())
}

/// If the current context may not block, return an error. Blocking requires
/// a thread context with the scheduler unlocked.
pub(crate) fn expect_waitable_context<P: Port>(
    kernel: &Kernel<P>,
    lock: &CpuLockGuard<'_, P>,
) -> Result {
    expect_task_context(kernel, lock)?;
    if lock.sched_lock > 0 {
        return Err(ResultCode::ErrorOs);
    }
    Ok(())
}
