//! Kernel state locking
//!
//! Two disjoint critical-section facilities, both scoped and released on
//! every exit path:
//!
//! - The **CPU lock** ([`lock_cpu`]) masks interrupts through the port and
//!   takes the kernel state lock. All kernel data structures are mutated
//!   under it, and it is never held across a context switch. Applications
//!   get the masking half as [`IrqCriticalSection`].
//! - The **scheduler critical section** ([`SchedCriticalSection`]) defers
//!   preemption while leaving interrupts serviceable.
use core::marker::PhantomData;
use core::ops;

use crate::{thread, Kernel, KernelState, Port};

/// RAII guard for the CPU lock.
///
/// Dereferences to the kernel state. Dropping releases the state lock first
/// and only then restores the interrupt mask, so an interrupt taken at the
/// restore point can immediately re-acquire the lock.
pub(crate) struct CpuLockGuard<'a, P: Port> {
    kernel: &'a Kernel<P>,
    token: Option<P::IrqToken>,
    state: Option<spin::MutexGuard<'a, KernelState<P>>>,
}

/// Enter the CPU lock: raise the interrupt mask, then take the state lock.
pub(crate) fn lock_cpu<P: Port>(kernel: &Kernel<P>) -> CpuLockGuard<'_, P> {
    let token = kernel.port.irq_save();
    let state = kernel.state.lock();
    CpuLockGuard {
        kernel,
        token: Some(token),
        state: Some(state),
    }
}

/// Enter the CPU lock on behalf of the calling *thread*.
///
/// On ports whose preemption takes effect at scheduling points, the caller
/// may have been descheduled while executing user code; acting on
/// `running_thread` would then mutate another thread's state. This variant
/// parks such callers until the scheduler names them again, so that
/// `running_thread` is the caller whenever the guard is handed out.
pub(crate) fn lock_cpu_as_current<P: Port>(kernel: &'static Kernel<P>) -> CpuLockGuard<'static, P> {
    loop {
        let lock = lock_cpu(kernel);
        match kernel.port.current_thread() {
            None => return lock,
            Some(me) if lock.running_thread == Some(me) => return lock,
            Some(_) => {
                drop(lock);
                kernel.port.settle(kernel);
            }
        }
    }
}

impl<P: Port> ops::Deref for CpuLockGuard<'_, P> {
    type Target = KernelState<P>;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.state.as_ref().unwrap()
    }
}

impl<P: Port> ops::DerefMut for CpuLockGuard<'_, P> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.state.as_mut().unwrap()
    }
}

impl<P: Port> Drop for CpuLockGuard<'_, P> {
    fn drop(&mut self) {
        // Release order matters: state lock first, interrupt mask second.
        self.state = None;
        if let Some(token) = self.token.take() {
            self.kernel.port.irq_restore(token);
        }
    }
}

/// Scoped IRQ critical section.
///
/// On entry the current interrupt-priority mask is saved and raised to block
/// all maskable interrupts at or below the kernel's level; dropping restores
/// the saved mask. Sections nest: only the outermost exit re-enables
/// interrupts.
pub struct IrqCriticalSection<'a, P: Port> {
    kernel: &'a Kernel<P>,
    token: Option<P::IrqToken>,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, P: Port> IrqCriticalSection<'a, P> {
    /// Mask interrupts until the returned guard is dropped.
    pub fn enter(kernel: &'a Kernel<P>) -> Self {
        let token = kernel.port.irq_save();
        Self {
            kernel,
            token: Some(token),
            _not_send: PhantomData,
        }
    }
}

impl<P: Port> Drop for IrqCriticalSection<'_, P> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.kernel.port.irq_restore(token);
        }
    }
}

/// Scoped scheduler critical section.
///
/// While at least one section is alive, the scheduler keeps the current
/// thread on the CPU; wake-ups still happen but the dispatch they would
/// trigger is postponed to the outermost exit. Interrupts remain
/// serviceable throughout.
pub struct SchedCriticalSection<P: Port> {
    kernel: &'static Kernel<P>,
    was_locked: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<P: Port> SchedCriticalSection<P> {
    pub(crate) fn enter(kernel: &'static Kernel<P>) -> Self {
        let mut lock = lock_cpu(kernel);
        let was_locked = lock.sched_lock > 0;
        lock.sched_lock += 1;
        Self {
            kernel,
            was_locked,
            _not_send: PhantomData,
        }
    }

    /// Whether the scheduler was already locked when this section was
    /// entered.
    pub fn was_locked(&self) -> bool {
        self.was_locked
    }
}

impl<P: Port> Drop for SchedCriticalSection<P> {
    fn drop(&mut self) {
        let mut lock = lock_cpu(self.kernel);
        debug_assert!(lock.sched_lock > 0);
        lock.sched_lock -= 1;
        if lock.sched_lock == 0 && lock.reschedule_pending {
            lock.reschedule_pending = false;
            thread::unlock_cpu_and_check_preemption(self.kernel, lock);
        }
    }
}
