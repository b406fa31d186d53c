//! Static kernel configuration
//!
//! These constants bound the kernel's storage. All object registries are
//! fixed-capacity arrays embedded in the kernel record, so the values here
//! determine its memory footprint.

/// Nominal tick rate of the system time base.
pub const TICK_FREQUENCY_HZ: u32 = 1000;

/// Number of discrete priority values honored by the scheduler.
pub const MAX_PRIORITY_BANDS: usize = 256;

/// Maximum number of threads, including the idle thread.
pub const MAX_THREADS: usize = 32;

/// Maximum number of mutexes.
pub const MAX_MUTEXES: usize = 16;

/// Maximum number of condition variables.
pub const MAX_CONDVARS: usize = 8;

/// Maximum number of semaphores.
pub const MAX_SEMAPHORES: usize = 16;

/// Maximum number of memory pools, including the pools embedded in mail
/// queues.
pub const MAX_POOLS: usize = 8;

/// Maximum number of message queues, including the rings embedded in mail
/// queues.
pub const MAX_MESSAGE_QUEUES: usize = 8;

/// Maximum number of mail queues.
pub const MAX_MAIL_QUEUES: usize = 4;

/// Maximum number of software timers.
pub const MAX_TIMERS: usize = 16;

/// Capacity of the deadline-ordered timed-event list. Every timed wait and
/// every armed timer occupies one entry.
pub const MAX_TIMED_EVENTS: usize = MAX_THREADS + MAX_TIMERS;

/// Stack size reserved for the idle thread. Only meaningful to ports that
/// execute threads on kernel-described stacks.
pub const IDLE_STACK_BYTES: usize = 1024;

/// Tick count that stands for "no deadline". Timed services treat it as an
/// unbounded wait.
pub const WAIT_FOREVER: u64 = u64::MAX;
