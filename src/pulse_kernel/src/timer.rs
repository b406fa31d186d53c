//! Software timers
//!
//! Timers fire in the tick ISR context: a callback must not block and may
//! only use the ISR-safe services (semaphore `post`, condition variable
//! `signal`/`broadcast`, queue operations with a zero timeout, timer
//! `start`/`stop`, `Thread::wakeup`). A callback written for this model is
//! not portable to kernels that dispatch timers from a service thread.
use core::fmt;

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock::{self, CpuLockGuard},
    timeout, Kernel, Port, TimerId,
};

/// A timer's callback. `arg` is the value given at creation.
pub type TimerCallback<P> = fn(&'static Kernel<P>, usize);

/// Whether a timer fires once or rearms itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerMode {
    Once,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerSt {
    Stopped,
    Running,
}

/// Creation attributes for a timer.
#[derive(Clone, Copy)]
pub struct TimerAttributes {
    pub name: &'static str,
    pub mode: TimerMode,
}

impl Default for TimerAttributes {
    fn default() -> Self {
        Self {
            name: "",
            mode: TimerMode::Once,
        }
    }
}

/// *Timer control block* - the state data of a timer.
pub(crate) struct TimerCb<P: Port> {
    pub(crate) in_use: bool,
    pub(crate) name: &'static str,
    pub(crate) callback: TimerCallback<P>,
    pub(crate) arg: usize,
    pub(crate) mode: TimerMode,
    pub(crate) st: TimerSt,
    /// Period in ticks; meaningful for periodic timers.
    pub(crate) period: u64,
    /// Absolute expiry tick while running.
    pub(crate) expiry: u64,
    /// In-progress flag for ISR-level invocations on this object.
    pub(crate) isr_busy: bool,
}

impl<P: Port> fmt::Debug for TimerCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerCb")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("st", &self.st)
            .field("period", &self.period)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Handle to a software timer.
pub struct Timer<P: Port> {
    kernel: &'static Kernel<P>,
    id: TimerId,
}

impl<P: Port> Clone for Timer<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for Timer<P> {}

impl<P: Port> fmt::Debug for Timer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Timer").field(&self.id.0).finish()
    }
}

impl<P: Port> Timer<P> {
    /// Create a timer. It starts out stopped.
    pub fn new(
        kernel: &'static Kernel<P>,
        attr: TimerAttributes,
        callback: TimerCallback<P>,
        arg: usize,
    ) -> Result<Self> {
        let mut lock = klock::lock_cpu(kernel);
        let id = if let Some(pos) = lock.timers.iter().position(|cb| !cb.in_use) {
            TimerId(pos)
        } else {
            if lock.timers.is_full() {
                return Err(ResultCode::ErrorNoMemory);
            }
            let id = TimerId(lock.timers.len());
            lock.timers.push(TimerCb {
                in_use: false,
                name: "",
                callback: |_, _| {},
                arg: 0,
                mode: TimerMode::Once,
                st: TimerSt::Stopped,
                period: 0,
                expiry: 0,
                isr_busy: false,
            });
            id
        };
        lock[id] = TimerCb {
            in_use: true,
            name: attr.name,
            callback,
            arg,
            mode: attr.mode,
            st: TimerSt::Stopped,
            period: 0,
            expiry: 0,
            isr_busy: false,
        };
        Ok(Self { kernel, id })
    }

    /// Arm the timer to expire after `ticks` tick periods. For a periodic
    /// timer, `ticks` also becomes the period. An already running timer is
    /// restarted.
    ///
    /// ISR-safe.
    pub fn start(&self, ticks: u64) -> Result {
        if ticks == 0 || ticks == cfg::WAIT_FOREVER {
            return Err(ResultCode::ErrorParameter);
        }
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let id = self.id;
        with_isr_claim(self.kernel, &mut lock, id, |lock| {
            if lock[id].st == TimerSt::Running {
                timeout::remove_timer_event(lock, id);
            }
            let expiry = lock.tick_count + ticks;
            {
                let cb = &mut lock[id];
                cb.expiry = expiry;
                if cb.mode == TimerMode::Periodic {
                    cb.period = ticks;
                }
                cb.st = TimerSt::Running;
            }
            timeout::insert_event(lock, expiry, timeout::TimedEventKind::Timer(id));
        })
    }

    /// Disarm the timer. Fails with [`ResultCode::EAGAIN`] if it is already
    /// stopped.
    ///
    /// ISR-safe.
    pub fn stop(&self) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let id = self.id;
        with_isr_claim(self.kernel, &mut lock, id, |lock| {
            if lock[id].st == TimerSt::Stopped {
                return Err(ResultCode::EAGAIN);
            }
            timeout::remove_timer_event(lock, id);
            lock[id].st = TimerSt::Stopped;
            Ok(())
        })?
    }

    /// Whether the timer is currently armed.
    pub fn is_running(&self) -> bool {
        let lock = klock::lock_cpu(self.kernel);
        lock[self.id].in_use && lock[self.id].st == TimerSt::Running
    }
}

/// Run `f` with the timer's ISR in-progress flag claimed when the caller
/// is an interrupt handler; the flag is released on every path out of `f`.
/// A second interrupt-level call on the same object while one is in
/// progress fails with [`ResultCode::ErrorIsrRecursive`].
fn with_isr_claim<'a, P: Port, R>(
    kernel: &Kernel<P>,
    lock: &mut CpuLockGuard<'a, P>,
    id: TimerId,
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

/// Process a timer's expiry inside the tick handler. Rearms periodic
/// timers; returns the callback to invoke, if the timer is still live.
pub(crate) fn expire<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    timer: TimerId,
    now: u64,
) -> Option<(TimerCallback<P>, usize)> {
    let (in_use, st, mode, period, callback, arg) = {
        let cb = &lock[timer];
        (cb.in_use, cb.st, cb.mode, cb.period, cb.callback, cb.arg)
    };
    if !in_use || st != TimerSt::Running {
        return None;
    }
    match mode {
        TimerMode::Once => {
            lock[timer].st = TimerSt::Stopped;
        }
        TimerMode::Periodic => {
            let expiry = now + period;
            lock[timer].expiry = expiry;
            timeout::insert_event(lock, expiry, timeout::TimedEventKind::Timer(timer));
        }
    }
    Some((callback, arg))
}
