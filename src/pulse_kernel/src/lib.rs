//! A preemptive, priority-based real-time kernel for resource-constrained
//! microcontrollers.
//!
//! The kernel schedules cooperating threads over a single CPU and provides
//! the classical synchronization and messaging primitives they need to
//! coordinate with each other and with interrupt service routines: mutexes
//! with optional priority protocols, condition variables, counting
//! semaphores, fixed-block memory pools, message and mail queues, and
//! software timers driven by a periodic tick.
//!
//! # Kernel instances
//!
//! All kernel state — the scheduler, the tick clock, and every object
//! registry — lives in a single [`Kernel`] record. Applications typically
//! create one static instance; tests may create several independent ones.
//! Object handles ([`Thread`], [`Mutex`], [`Semaphore`], …) are `Copy`
//! references into a kernel instance.
//!
//! # Ports
//!
//! Everything the kernel needs from the hardware is abstracted behind the
//! [`Port`] trait: interrupt masking, context switching, the periodic tick,
//! and the real-time clock. The kernel crate itself is freestanding
//! (`no_std`); a hosted simulation port suitable for testing lives in a
//! separate crate.
//!
//! # Contexts
//!
//! Services may be called from thread context or, for a documented subset,
//! from interrupt context. The ISR-safe subset is: semaphore `post`,
//! condition variable `signal`/`broadcast`, queue `put`/`get` with a zero
//! timeout, memory pool `alloc`/`free`, timer `start`/`stop`,
//! `Thread::wakeup`, and the context queries. Everything else returns
//! [`ResultCode::ErrorIsr`] when invoked from an ISR.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]

use arrayvec::ArrayVec;

pub mod cfg;
pub mod clock;
pub mod condvar;
pub mod error;
pub mod klock;
pub mod mailqueue;
pub mod mempool;
pub mod msgqueue;
pub mod mutex;
pub mod semaphore;
mod state;
pub mod thread;
mod timeout;
pub mod timer;
mod wait;

pub use crate::{
    cfg::WAIT_FOREVER,
    clock::CurrentSample,
    condvar::{Condvar, CondvarAttributes},
    error::{strerror, Result, ResultCode},
    mailqueue::{MailQueue, MailQueueAttributes},
    mempool::{Pool, PoolAttributes},
    msgqueue::{MessageQueue, MessageQueueAttributes},
    mutex::{Mutex, MutexAttributes, MutexProtocol, MutexRobustness, MutexType},
    semaphore::{Semaphore, SemaphoreAttributes},
    thread::{Thread, ThreadAttributes, ThreadEntry, ThreadState},
    timer::{Timer, TimerAttributes, TimerMode},
};

/// Identifies a thread within one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) usize);

impl ThreadId {
    /// The position of the thread's control block in the kernel's thread
    /// registry. Exposed so ports can key their own per-thread state.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

macro_rules! define_object_id {
    ( $( $(#[doc $($doc:tt)*])* $Name:ident, )* ) => {
        $(
            $(#[doc $($doc)*])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq)]
            pub(crate) struct $Name(pub(crate) usize);
        )*
    };
}

define_object_id! {
    MutexId,
    CondvarId,
    SemaphoreId,
    PoolId,
    QueueId,
    MailQueueId,
    TimerId,
}

/// The hardware abstraction the kernel runs on.
///
/// A port supplies interrupt masking, context switching, the periodic tick
/// source, and the wall clock. All methods are called by the kernel; an
/// implementation must not call back into the kernel while the kernel holds
/// its CPU lock, which the kernel guarantees by never invoking a port method
/// other than [`irq_save`], [`irq_restore`], and [`is_in_irq`] with the lock
/// held.
///
/// [`irq_save`]: Port::irq_save
/// [`irq_restore`]: Port::irq_restore
/// [`is_in_irq`]: Port::is_in_irq
pub trait Port: Send + Sync + Sized + 'static {
    /// Saved interrupt-priority mask, returned by [`irq_save`] and consumed
    /// by [`irq_restore`]. Nesting works because each section restores the
    /// exact mask it displaced.
    ///
    /// [`irq_save`]: Port::irq_save
    /// [`irq_restore`]: Port::irq_restore
    type IrqToken: Copy;

    /// Raise the interrupt-priority mask to block all maskable interrupts at
    /// or below the kernel's level, returning the previous mask.
    fn irq_save(&self) -> Self::IrqToken;

    /// Restore a mask previously returned by [`Port::irq_save`].
    fn irq_restore(&self, token: Self::IrqToken);

    /// Whether the CPU is currently executing an interrupt service routine.
    fn is_in_irq(&self) -> bool;

    /// Set up the periodic tick source. The port must arrange for
    /// [`Kernel::tick`] to be called once per tick period from interrupt
    /// context.
    fn tick_init(&self, tick_frequency_hz: u32);

    /// Seconds since 1970-01-01T00:00:00Z, from the real-time clock.
    fn rtc_now(&self) -> u64;

    /// Sample the tick timer's down-counter:
    /// `(cycles since last reload, reload divisor, core frequency in Hz)`.
    fn sub_tick_sample(&self) -> (u32, u32, u32);

    /// Prepare the execution state of a newly registered thread. The
    /// thread's entry function must not run before the kernel first names
    /// the thread as the running thread in a [`Port::context_switch`].
    fn initialize_thread(&self, kernel: &'static Kernel<Self>, thread: ThreadId);

    /// Perform a context switch. `from` is the thread losing the CPU (absent
    /// when dispatching from the boot context or on behalf of an exited
    /// thread), `to` the thread the kernel has selected to run.
    ///
    /// The kernel has already updated its own bookkeeping; the port only
    /// transfers execution.
    fn context_switch(
        &self,
        kernel: &'static Kernel<Self>,
        from: Option<ThreadId>,
        to: Option<ThreadId>,
    );

    /// Give the port an opportunity to stop executing the calling thread if
    /// a preemption decision taken in interrupt context has descheduled it.
    /// Ports with genuine asynchronous preemption leave this as a no-op.
    fn settle(&self, kernel: &'static Kernel<Self>) {
        let _ = kernel;
    }

    /// The kernel thread backing the calling execution context, or `None`
    /// from an ISR or the boot context.
    ///
    /// Ports with genuine asynchronous preemption return `None`: there the
    /// kernel's own notion of the running thread is authoritative, because
    /// a descheduled thread cannot keep executing. Simulation ports whose
    /// preemption is deferred to scheduling points must report the identity
    /// so the kernel can tell a descheduled caller from the running thread.
    fn current_thread(&self) -> Option<ThreadId> {
        None
    }

    /// Tear down the calling thread's execution state. Called by the kernel
    /// at every thread termination path; must divert control to the port's
    /// exit trampoline and never return.
    fn exit_thread(&self, kernel: &'static Kernel<Self>) -> !;

    /// Body of one idle-loop iteration; typically a wait-for-interrupt.
    fn idle_wait(&self);
}

/// The kernel record: scheduler, tick clock, and object registries.
///
/// See the [crate documentation](crate) for an overview.
pub struct Kernel<P: Port> {
    port: P,
    state: spin::Mutex<KernelState<P>>,
}

/// Everything guarded by the kernel's CPU lock.
///
/// Wait lists, counters, and free-list heads are only ever mutated through
/// [`klock::lock_cpu`], which masks interrupts and takes the spin lock; the
/// sections are kept brief so worst-case interrupt latency stays bounded.
pub(crate) struct KernelState<P: Port> {
    /// `true` once `start` has succeeded. Never cleared.
    pub(crate) running: bool,

    /// Scheduler critical-section depth. While nonzero, preemption is
    /// deferred and `reschedule_pending` records postponed wake-ups.
    pub(crate) sched_lock: u32,
    pub(crate) reschedule_pending: bool,

    /// The thread currently executing, when the scheduler has dispatched one.
    pub(crate) running_thread: Option<ThreadId>,
    pub(crate) idle_thread: Option<ThreadId>,

    pub(crate) ready_queue: wait::PrioList,

    /// Ticks since reset. 64 bits: does not wrap within the lifetime of any
    /// realistic deployment.
    pub(crate) tick_count: u64,

    /// Outstanding timed events, ordered by deadline.
    pub(crate) timed_events: ArrayVec<timeout::TimedEvent, { cfg::MAX_TIMED_EVENTS }>,

    pub(crate) threads: ArrayVec<thread::ThreadCb<P>, { cfg::MAX_THREADS }>,
    pub(crate) mutexes: ArrayVec<mutex::MutexCb, { cfg::MAX_MUTEXES }>,
    pub(crate) condvars: ArrayVec<condvar::CondvarCb, { cfg::MAX_CONDVARS }>,
    pub(crate) semaphores: ArrayVec<semaphore::SemaphoreCb, { cfg::MAX_SEMAPHORES }>,
    pub(crate) pools: ArrayVec<mempool::PoolCb, { cfg::MAX_POOLS }>,
    pub(crate) queues: ArrayVec<msgqueue::QueueCb, { cfg::MAX_MESSAGE_QUEUES }>,
    pub(crate) mail_queues: ArrayVec<mailqueue::MailQueueCb, { cfg::MAX_MAIL_QUEUES }>,
    pub(crate) timers: ArrayVec<timer::TimerCb<P>, { cfg::MAX_TIMERS }>,
}

// Safety: the raw pointers stored in control blocks (stack bases, pool and
// ring buffers) refer to caller-donated storage with `'static` lifetime that
// is owned exclusively by the kernel object once registered, and they are
// only dereferenced under the CPU lock.
unsafe impl<P: Port> Send for KernelState<P> {}

impl<P: Port> Kernel<P> {
    /// Initialize a kernel instance around the given port.
    ///
    /// The instance is inert until [`Kernel::start`] is called; object
    /// creation is allowed beforehand.
    pub const fn new(port: P) -> Self {
        Self {
            port,
            state: spin::Mutex::new(KernelState {
                running: false,
                sched_lock: 0,
                reschedule_pending: false,
                running_thread: None,
                idle_thread: None,
                ready_queue: wait::PrioList::new(),
                tick_count: 0,
                timed_events: ArrayVec::new_const(),
                threads: ArrayVec::new_const(),
                mutexes: ArrayVec::new_const(),
                condvars: ArrayVec::new_const(),
                semaphores: ArrayVec::new_const(),
                pools: ArrayVec::new_const(),
                queues: ArrayVec::new_const(),
                mail_queues: ArrayVec::new_const(),
                timers: ArrayVec::new_const(),
            }),
        }
    }

    /// The port this kernel runs on.
    #[inline]
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Start the scheduler: install the idle thread, mark the kernel
    /// running, and dispatch the highest-priority ready thread.
    ///
    /// Fails with [`ResultCode::ErrorOs`] if the kernel is already running.
    pub fn start(&'static self) -> Result {
        let mut lock = klock::lock_cpu(self);
        if lock.running {
            return Err(ResultCode::ErrorOs);
        }

        drop(lock);
        let idle = thread::spawn_idle(self)?;
        self.port.tick_init(cfg::TICK_FREQUENCY_HZ);

        lock = klock::lock_cpu(self);
        lock.idle_thread = Some(idle);
        lock.running = true;
        log::debug!("kernel started");

        let decision = thread::choose_next_running_thread(&mut lock);
        drop(lock);
        if let Some((from, to)) = decision {
            self.port.context_switch(self, from, to);
        }
        Ok(())
    }

    /// Whether [`Kernel::start`] has succeeded.
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether the caller executes in interrupt context.
    #[inline]
    pub fn is_in_irq(&self) -> bool {
        self.port.is_in_irq()
    }

    /// The thread currently holding the CPU, if any.
    ///
    /// Ports use this to decide whether the calling host context is still
    /// scheduled; applications can use it to identify themselves.
    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.state.lock().running_thread
    }

    /// Enter a scheduler critical section: preemption is deferred until the
    /// returned guard is dropped, while interrupts stay serviceable.
    ///
    /// Sections nest; the reschedule check runs when the outermost guard is
    /// released. The returned guard reports the scheduler's running status
    /// at the time of entry, mirroring the state machine's `lock()`
    /// contract.
    pub fn lock_scheduler(&'static self) -> klock::SchedCriticalSection<P> {
        klock::SchedCriticalSection::enter(self)
    }

    /// Run the entry function of `thread` to completion and return its exit
    /// value.
    ///
    /// Only meant to be called by a port, on the execution context it
    /// created for `thread`, after the kernel first dispatches it.
    pub fn run_thread_entry(&'static self, thread: ThreadId) -> usize {
        let lock = klock::lock_cpu(self);
        let cb = &lock[thread];
        let (entry, arg) = (cb.entry, cb.arg);
        drop(lock);
        entry(self, arg)
    }

    /// Retire `thread` after its entry function has finished or been exited:
    /// release held mutexes, record the exit value, wake joiners, and
    /// dispatch a successor.
    ///
    /// Only meant to be called by a port, from the execution context backing
    /// `thread`. `value` is the entry function's return value; `None` when
    /// the thread terminated through [`thread::exit`] and the value is
    /// already recorded.
    pub fn finalize_thread(&'static self, thread: ThreadId, value: Option<usize>) {
        thread::finalize_thread(self, thread, value)
    }

    /// The caller-donated stack region of a thread, as
    /// `(base, size in bytes)`. The base is null for threads whose
    /// execution stack is managed by the port.
    ///
    /// Ports use this when building the initial context of a thread.
    pub fn thread_stack(&self, thread: ThreadId) -> Option<(*mut u8, usize)> {
        let lock = klock::lock_cpu(self);
        lock.threads
            .get(thread.0)
            .filter(|cb| cb.in_use)
            .map(|cb| (cb.stack_base, cb.stack_size))
    }

    /// The name a thread was created with; `None` for an unknown or
    /// reaped id.
    pub fn thread_name(&self, thread: ThreadId) -> Option<&'static str> {
        let lock = klock::lock_cpu(self);
        lock.threads
            .get(thread.0)
            .filter(|cb| cb.in_use)
            .map(|cb| cb.name)
    }

    /// The kernel half of the tick interrupt service routine.
    ///
    /// Advances the tick counter, releases expired timed waits, runs due
    /// timer callbacks in the calling (interrupt) context, and requests a
    /// reschedule. Must be called from the port's tick ISR.
    pub fn tick(&'static self) {
        timeout::handle_tick(self)
    }
}

impl<P: Port> core::fmt::Debug for Kernel<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Kernel").finish_non_exhaustive()
    }
}

/// A do-nothing port for unit tests that never dispatch a thread.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::{Kernel, Port, ThreadId};

    pub(crate) struct NoopPort;

    impl Port for NoopPort {
        type IrqToken = ();

        fn irq_save(&self) {}
        fn irq_restore(&self, _token: ()) {}
        fn is_in_irq(&self) -> bool {
            false
        }
        fn tick_init(&self, _tick_frequency_hz: u32) {}
        fn rtc_now(&self) -> u64 {
            0
        }
        fn sub_tick_sample(&self) -> (u32, u32, u32) {
            (0, 1, 0)
        }
        fn initialize_thread(&self, _kernel: &'static Kernel<Self>, _thread: ThreadId) {}
        fn context_switch(
            &self,
            _kernel: &'static Kernel<Self>,
            _from: Option<ThreadId>,
            _to: Option<ThreadId>,
        ) {
        }
        fn exit_thread(&self, _kernel: &'static Kernel<Self>) -> ! {
            unreachable!("NoopPort never runs threads")
        }
        fn idle_wait(&self) {}
    }

    pub(crate) fn kernel() -> &'static Kernel<NoopPort> {
        Box::leak(Box::new(Kernel::new(NoopPort)))
    }

    pub(crate) fn leak_bytes(len: usize) -> &'static mut [u8] {
        Box::leak(vec![0u8; len].into_boxed_slice())
    }

    pub(crate) fn leak_words(len: usize) -> &'static mut [usize] {
        Box::leak(vec![0usize; len].into_boxed_slice())
    }
}

// Indexing sugar used pervasively by the kernel internals. Panics on a stale
// id are prevented by validating handles at the public API boundary.
macro_rules! impl_state_index {
    ( $( $Id:ty => $field:ident : $Cb:ty, )* ) => {
        $(
            impl<P: Port> core::ops::Index<$Id> for KernelState<P> {
                type Output = $Cb;
                #[inline]
                fn index(&self, id: $Id) -> &Self::Output {
                    &self.$field[id.0]
                }
            }

            impl<P: Port> core::ops::IndexMut<$Id> for KernelState<P> {
                #[inline]
                fn index_mut(&mut self, id: $Id) -> &mut Self::Output {
                    &mut self.$field[id.0]
                }
            }
        )*
    };
}

impl_state_index! {
    ThreadId => threads: thread::ThreadCb<P>,
    MutexId => mutexes: mutex::MutexCb,
    CondvarId => condvars: condvar::CondvarCb,
    SemaphoreId => semaphores: semaphore::SemaphoreCb,
    PoolId => pools: mempool::PoolCb,
    QueueId => queues: msgqueue::QueueCb,
    MailQueueId => mail_queues: mailqueue::MailQueueCb,
    TimerId => timers: timer::TimerCb<P>,
}
