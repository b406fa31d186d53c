//! Simulated kernel port for hosted environments
//!
//! [`StdPort`] realizes the kernel's port contract on top of the host OS.
//! Each kernel thread is backed by a host thread gated so that it executes
//! only while the kernel names it the running thread; blocking and exiting
//! threads park on their gate. Thread exit unwinds the host thread with a
//! private panic payload caught by the entry trampoline.
//!
//! Interrupts are simulated: the test harness (or a background ticker
//! spawned with [`spawn_ticker`]) delivers tick interrupts with
//! [`pump_tick`], and arbitrary ISR bodies can be run with
//! [`with_simulated_irq`]. A preemption decided inside a simulated ISR
//! takes effect at the preempted thread's next scheduling point, not
//! asynchronously.
//!
//! The simulated tick timer has no sub-tick down-counter; clock samples
//! report a divisor of one.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Once};
use std::thread as host;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use pulse_kernel::{Kernel, Port, ThreadId};

/// Re-exported so test crates configure the same logger the port uses.
pub use env_logger;

thread_local! {
    /// The kernel thread backed by this host thread, if any.
    static CURRENT_THREAD: Cell<Option<ThreadId>> = Cell::new(None);
    /// Whether this host thread is currently executing a simulated ISR.
    static IN_IRQ: Cell<bool> = Cell::new(false);
    /// Interrupt-mask nesting depth of this simulated CPU context.
    static IRQ_DEPTH: Cell<usize> = Cell::new(0);
}

/// Panic payload used to unwind a host thread on kernel-initiated thread
/// exit.
struct ExitToken;

/// One kernel thread's scheduling gate. The truth lives in the kernel's
/// `running_thread`; the gate only provides the place to sleep on it.
#[derive(Default)]
struct Gate {
    m: Mutex<()>,
    cv: Condvar,
}

/// Simulated port backed by host threads.
pub struct StdPort {
    gates: Mutex<HashMap<ThreadId, Arc<Gate>>>,
    tick_initialized: AtomicBool,
}

impl StdPort {
    pub fn new() -> Self {
        install_exit_panic_hook();
        Self {
            gates: Mutex::new(HashMap::new()),
            tick_initialized: AtomicBool::new(false),
        }
    }

    fn gate(&self, thread: ThreadId) -> Option<Arc<Gate>> {
        self.gates.lock().unwrap().get(&thread).cloned()
    }

    /// Open `thread`'s gate: wake its host thread so it can re-check
    /// whether it is the running thread.
    fn resume(&self, thread: ThreadId) {
        if let Some(gate) = self.gate(thread) {
            let _guard = gate.m.lock().unwrap();
            gate.cv.notify_all();
        }
    }

    /// Park the calling host thread until the kernel names `thread` the
    /// running thread again.
    fn suspend_while_descheduled(&self, kernel: &'static Kernel<Self>, thread: ThreadId) {
        let Some(gate) = self.gate(thread) else {
            return;
        };
        let mut guard = gate.m.lock().unwrap();
        while kernel.current_thread_id() != Some(thread) {
            guard = gate.cv.wait(guard).unwrap();
        }
    }
}

impl Default for StdPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for StdPort {
    type IrqToken = usize;

    fn irq_save(&self) -> usize {
        // Masking is per simulated CPU context. Mutual exclusion of kernel
        // data is provided by the kernel's state lock; the depth is kept so
        // nesting behaves as on hardware.
        IRQ_DEPTH.with(|d| {
            let depth = d.get();
            d.set(depth + 1);
            depth
        })
    }

    fn irq_restore(&self, token: usize) {
        IRQ_DEPTH.with(|d| d.set(token));
    }

    fn is_in_irq(&self) -> bool {
        IN_IRQ.with(|c| c.get())
    }

    fn tick_init(&self, _tick_frequency_hz: u32) {
        // Ticks are delivered by the harness (`pump_tick`) or a ticker
        // thread (`spawn_ticker`); nothing to arm here.
        self.tick_initialized.store(true, Ordering::Relaxed);
    }

    fn rtc_now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    fn sub_tick_sample(&self) -> (u32, u32, u32) {
        // No simulated down-counter.
        (0, 1, 0)
    }

    fn initialize_thread(&self, kernel: &'static Kernel<Self>, thread: ThreadId) {
        let gate = Arc::new(Gate::default());
        self.gates.lock().unwrap().insert(thread, gate);

        let name = kernel.thread_name(thread).unwrap_or("");
        let host_name = if name.is_empty() {
            format!("kthread-{}", thread.index())
        } else {
            format!("kthread-{name}")
        };
        log::trace!("spawning host thread for {thread:?} ({name:?})");

        host::Builder::new()
            .name(host_name)
            .spawn(move || {
                let port = kernel.port();
                CURRENT_THREAD.with(|c| c.set(Some(thread)));

                // Wait for the first dispatch.
                port.suspend_while_descheduled(kernel, thread);
                log::trace!("{thread:?} dispatched for the first time");

                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| kernel.run_thread_entry(thread)));
                match result {
                    Ok(value) => kernel.finalize_thread(thread, Some(value)),
                    Err(payload) => {
                        if payload.downcast_ref::<ExitToken>().is_some() {
                            kernel.finalize_thread(thread, None);
                        } else {
                            kernel.port().gates.lock().unwrap().remove(&thread);
                            panic::resume_unwind(payload);
                        }
                    }
                }
                kernel.port().gates.lock().unwrap().remove(&thread);
                log::trace!("host thread for {thread:?} retiring");
            })
            .expect("failed to spawn a host thread");
    }

    fn context_switch(
        &self,
        kernel: &'static Kernel<Self>,
        from: Option<ThreadId>,
        to: Option<ThreadId>,
    ) {
        log::trace!("context_switch {from:?} -> {to:?}");
        if let Some(to) = to {
            self.resume(to);
        }
        let me = CURRENT_THREAD.with(|c| c.get());
        if from.is_some() && from == me {
            // The caller lost the CPU; stop here until rescheduled.
            self.suspend_while_descheduled(kernel, from.unwrap());
        }
    }

    fn current_thread(&self) -> Option<ThreadId> {
        if IN_IRQ.with(|c| c.get()) {
            return None;
        }
        CURRENT_THREAD.with(|c| c.get())
    }

    fn settle(&self, kernel: &'static Kernel<Self>) {
        if IN_IRQ.with(|c| c.get()) {
            return;
        }
        if let Some(me) = CURRENT_THREAD.with(|c| c.get()) {
            if kernel.current_thread_id() != Some(me) {
                self.suspend_while_descheduled(kernel, me);
            }
        }
    }

    fn exit_thread(&self, _kernel: &'static Kernel<Self>) -> ! {
        panic::panic_any(ExitToken)
    }

    fn idle_wait(&self) {
        host::sleep(Duration::from_micros(200));
    }
}

/// Leak a fresh kernel instance on this port. Tests create one per case;
/// the leak is what gives object handles their `'static` kernel reference.
pub fn build_kernel() -> &'static Kernel<StdPort> {
    Box::leak(Box::new(Kernel::new(StdPort::new())))
}

/// Deliver one tick interrupt: runs the kernel's tick handler in a
/// simulated ISR on the calling thread.
pub fn pump_tick(kernel: &'static Kernel<StdPort>) {
    with_simulated_irq(|| kernel.tick());
}

/// Deliver `n` consecutive tick interrupts.
pub fn pump_ticks(kernel: &'static Kernel<StdPort>, n: u64) {
    for _ in 0..n {
        pump_tick(kernel);
    }
}

/// Run `f` in a simulated interrupt context: `is_in_irq` reports `true`
/// for its duration.
pub fn with_simulated_irq<R>(f: impl FnOnce() -> R) -> R {
    IN_IRQ.with(|c| c.set(true));
    let result = f();
    IN_IRQ.with(|c| c.set(false));
    result
}

/// Handle to a background tick source started by [`spawn_ticker`].
pub struct TickerHandle {
    stop: Arc<AtomicBool>,
    join: Option<host::JoinHandle<()>>,
}

impl TickerHandle {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Drive the kernel's tick in real time from a background thread.
pub fn spawn_ticker(kernel: &'static Kernel<StdPort>, period: Duration) -> TickerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop2 = stop.clone();
    let join = host::Builder::new()
        .name("pulse-ticker".into())
        .spawn(move || {
            while !stop2.load(Ordering::Relaxed) {
                pump_tick(kernel);
                host::sleep(period);
            }
        })
        .expect("failed to spawn the ticker thread");
    TickerHandle {
        stop,
        join: Some(join),
    }
}

/// Poll `f` until it returns `true` or `timeout` elapses. Returns whether
/// the condition was met.
pub fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        host::sleep(Duration::from_millis(1));
    }
    f()
}

/// Initialize `env_logger` for a test binary. Safe to call repeatedly.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Thread exit travels as a panic; keep the default hook from reporting it
/// as a crash.
fn install_exit_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if info.payload().downcast_ref::<ExitToken>().is_none() {
                default(info);
            }
        }));
    });
}
