//! The system clocks
//!
//! The tick clock is a 64-bit monotonic counter advanced by the tick ISR at
//! [`cfg::TICK_FREQUENCY_HZ`]. The real-time clock is read from the port
//! and counts seconds since the Unix epoch.
use crate::{
    cfg,
    error::{Result, ResultCode},
    klock, state, thread,
    wait::{self, WaitPayload},
    Kernel, Port,
};

/// An accurate sampling of the tick clock: the tick count plus the state of
/// the hardware down-counter, from which sub-tick time can be
/// reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentSample {
    /// Ticks since reset.
    pub ticks: u64,
    /// Timer cycles since the last reload.
    pub cycles: u32,
    /// The timer's reload divisor.
    pub divisor: u32,
    /// Core clock frequency in Hz.
    pub core_frequency_hz: u32,
}

/// Convert microseconds to ticks, rounding up. Integer arithmetic only.
pub const fn ticks_from_micros(micros: u64) -> u64 {
    (micros * cfg::TICK_FREQUENCY_HZ as u64 + 999_999) / 1_000_000
}

impl<P: Port> Kernel<P> {
    /// Ticks since reset. Non-decreasing across any sequence of calls.
    pub fn now(&self) -> u64 {
        let lock = klock::lock_cpu(self);
        lock.tick_count
    }

    /// Ticks since reset, with a sub-tick sample of the hardware
    /// down-counter.
    pub fn now_sample(&self) -> CurrentSample {
        let lock = klock::lock_cpu(self);
        let ticks = lock.tick_count;
        drop(lock);
        let (cycles, divisor, core_frequency_hz) = self.port().sub_tick_sample();
        CurrentSample {
            ticks,
            cycles,
            divisor,
            core_frequency_hz,
        }
    }

    /// Put the calling thread to sleep for `ticks` tick periods.
    ///
    /// Returns `Ok(())` when the full duration elapsed, or
    /// [`ResultCode::Eintr`] when the sleep was cut short by `wakeup` or
    /// cancellation. [`cfg::WAIT_FOREVER`] sleeps until woken.
    pub fn sleep_for(&'static self, ticks: u64) -> Result {
        let mut lock = klock::lock_cpu_as_current(self);
        state::expect_waitable_context(self, &lock)?;
        lock = thread::cancellation_point(self, lock);
        if ticks == 0 {
            return Ok(());
        }
        let deadline = if ticks == cfg::WAIT_FOREVER {
            None
        } else {
            Some(lock.tick_count + ticks)
        };
        let (_lock, reason, _payload) = wait::block_current(self, lock, WaitPayload::Sleep, deadline);
        match reason {
            ResultCode::ErrorTimeoutResource => Ok(()),
            _ => Err(ResultCode::Eintr),
        }
    }

    /// Seconds since 1970-01-01T00:00:00Z, from the port's real-time clock.
    pub fn rtc_now(&self) -> u64 {
        self.port().rtc_now()
    }

    /// Sleep for a number of whole seconds on the real-time clock's scale.
    pub fn rtc_sleep_for(&'static self, secs: u64) -> Result {
        self.sleep_for(secs.saturating_mul(cfg::TICK_FREQUENCY_HZ as u64))
    }
}
