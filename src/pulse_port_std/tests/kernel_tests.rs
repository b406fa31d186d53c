//! Kernel behavior tests on the simulated port.
//!
//! Each test builds its own kernel instance; time is driven explicitly with
//! `pump_tick`, so the scenarios are deterministic.
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex as HostMutex, OnceLock};
use std::time::Duration;

use pulse_kernel::{
    thread, Condvar, CondvarAttributes, Kernel, MailQueue, MailQueueAttributes, MessageQueue,
    MessageQueueAttributes, Mutex, MutexAttributes, MutexProtocol, MutexRobustness, MutexType,
    Pool, PoolAttributes, ResultCode, Semaphore, SemaphoreAttributes, Thread, ThreadAttributes,
    ThreadState, Timer, TimerAttributes, TimerMode, WAIT_FOREVER,
};
use pulse_port_std::{
    build_kernel, init_logging, pump_tick, pump_ticks, wait_until, with_simulated_irq, StdPort,
};

type K = &'static Kernel<StdPort>;

const LONG: Duration = Duration::from_secs(10);

fn leak<T>(value: T) -> &'static T {
    Box::leak(Box::new(value))
}

fn leak_bytes(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

fn leak_words(len: usize) -> &'static mut [usize] {
    Box::leak(vec![0usize; len].into_boxed_slice())
}

fn ctx_arg<T>(ctx: &'static T) -> usize {
    ctx as *const T as usize
}

fn ctx_of<T>(arg: usize) -> &'static T {
    // Safety: `arg` always carries a pointer produced by `ctx_arg` on a
    // leaked context.
    unsafe { &*(arg as *const T) }
}

fn spawn(kernel: K, name: &'static str, priority: u8, entry: thread::ThreadEntry<StdPort>, arg: usize) -> Thread<StdPort> {
    Thread::new(
        kernel,
        ThreadAttributes {
            name,
            priority,
            ..Default::default()
        },
        entry,
        arg,
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Scenario: priority preemption at start

struct PreemptCtx {
    sem: OnceLock<Semaphore<StdPort>>,
    events: HostMutex<Vec<&'static str>>,
    done: AtomicBool,
}

fn preempt_low(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<PreemptCtx>(arg);
    ctx.events.lock().unwrap().push("low: running");
    // The higher-priority thread must already have posted.
    assert_eq!(ctx.sem.get().unwrap().try_wait(), Ok(()));
    let _ = kernel;
    ctx.done.store(true, Ordering::SeqCst);
    0
}

fn preempt_high(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<PreemptCtx>(arg);
    ctx.events.lock().unwrap().push("high: posting");
    ctx.sem.get().unwrap().post().unwrap();
    0
}

#[test]
fn higher_priority_thread_runs_first() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(PreemptCtx {
        sem: OnceLock::new(),
        events: HostMutex::new(Vec::new()),
        done: AtomicBool::new(false),
    });
    ctx.sem
        .set(Semaphore::new(kernel, SemaphoreAttributes::default()).unwrap())
        .unwrap();

    spawn(kernel, "low", thread::priority::LOW, preempt_low, ctx_arg(ctx));
    spawn(kernel, "high", thread::priority::HIGH, preempt_high, ctx_arg(ctx));
    kernel.start().unwrap();

    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(
        *ctx.events.lock().unwrap(),
        ["high: posting", "low: running"]
    );
    assert_eq!(kernel.start(), Err(ResultCode::ErrorOs));
}

// ---------------------------------------------------------------------------
// Scenario: timed wait wakes on its deadline

struct SleepCtx {
    slept_at: AtomicU64,
    woke_at: AtomicU64,
    outcome_ok: AtomicBool,
    done: AtomicBool,
}

fn sleeper(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<SleepCtx>(arg);
    ctx.slept_at.store(kernel.now(), Ordering::SeqCst);
    let result = kernel.sleep_for(100);
    ctx.outcome_ok.store(result.is_ok(), Ordering::SeqCst);
    ctx.woke_at.store(kernel.now(), Ordering::SeqCst);
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn sleep_wakes_at_the_deadline() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(SleepCtx {
        slept_at: AtomicU64::new(0),
        woke_at: AtomicU64::new(0),
        outcome_ok: AtomicBool::new(false),
        done: AtomicBool::new(false),
    });

    let t = spawn(kernel, "sleeper", thread::priority::NORMAL, sleeper, ctx_arg(ctx));
    kernel.start().unwrap();
    assert!(wait_until(LONG, || t.state() == ThreadState::Waiting));

    pump_ticks(kernel, 99);
    assert!(!ctx.done.load(Ordering::SeqCst));
    pump_tick(kernel);
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));

    assert!(ctx.outcome_ok.load(Ordering::SeqCst));
    let slept_at = ctx.slept_at.load(Ordering::SeqCst);
    let woke_at = ctx.woke_at.load(Ordering::SeqCst);
    assert_eq!(woke_at - slept_at, 100);
    assert_eq!(t.wakeup_reason(), Ok(ResultCode::ETIMEDOUT));
}

// ---------------------------------------------------------------------------
// Scenario: priority inheritance

struct InheritCtx {
    mutex: OnceLock<Mutex<StdPort>>,
    locked: AtomicBool,
    release: AtomicBool,
    high_got_it: AtomicBool,
    low_done: AtomicBool,
}

fn inherit_low(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<InheritCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    mutex.lock().unwrap();
    ctx.locked.store(true, Ordering::SeqCst);
    while !ctx.release.load(Ordering::SeqCst) {
        thread::yield_now(kernel).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    mutex.unlock().unwrap();
    ctx.low_done.store(true, Ordering::SeqCst);
    0
}

fn inherit_high(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<InheritCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    mutex.lock().unwrap();
    ctx.high_got_it.store(true, Ordering::SeqCst);
    mutex.unlock().unwrap();
    0
}

#[test]
fn blocked_high_priority_waiter_boosts_the_owner() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(InheritCtx {
        mutex: OnceLock::new(),
        locked: AtomicBool::new(false),
        release: AtomicBool::new(false),
        high_got_it: AtomicBool::new(false),
        low_done: AtomicBool::new(false),
    });
    ctx.mutex
        .set(
            Mutex::new(
                kernel,
                MutexAttributes {
                    protocol: MutexProtocol::Inherit,
                    ..Default::default()
                },
            )
            .unwrap(),
        )
        .unwrap();

    let low = spawn(kernel, "low", thread::priority::LOW, inherit_low, ctx_arg(ctx));
    kernel.start().unwrap();
    assert!(wait_until(LONG, || ctx.locked.load(Ordering::SeqCst)));
    assert_eq!(low.get_sched_prio(), Ok(thread::priority::LOW));

    spawn(kernel, "high", thread::priority::HIGH, inherit_high, ctx_arg(ctx));
    // While the high-priority thread is queued on the mutex, the owner
    // runs at the waiter's priority.
    assert!(wait_until(LONG, || low.get_sched_prio()
        == Ok(thread::priority::HIGH)));
    assert!(!ctx.high_got_it.load(Ordering::SeqCst));

    ctx.release.store(true, Ordering::SeqCst);
    assert!(wait_until(LONG, || ctx.high_got_it.load(Ordering::SeqCst)));
    assert!(wait_until(LONG, || ctx.low_done.load(Ordering::SeqCst)));
    assert_eq!(low.get_sched_prio(), Ok(thread::priority::LOW));
}

// ---------------------------------------------------------------------------
// Scenario: robust mutex recovery after owner death

struct RobustCtx {
    mutex: OnceLock<Mutex<StdPort>>,
    results: HostMutex<Vec<(&'static str, ResultCode)>>,
    done: AtomicBool,
}

fn robust_owner(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<RobustCtx>(arg);
    ctx.mutex.get().unwrap().lock().unwrap();
    // Terminate while holding the lock.
    0
}

fn robust_recoverer(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<RobustCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    let mut results = Vec::new();

    let lock_result = mutex.lock();
    results.push(("lock", lock_result.err().unwrap_or(ResultCode::Success)));
    results.push((
        "consistent",
        mutex.consistent().err().unwrap_or(ResultCode::Success),
    ));
    results.push(("unlock", mutex.unlock().err().unwrap_or(ResultCode::Success)));
    results.push(("relock", mutex.lock().err().unwrap_or(ResultCode::Success)));
    mutex.unlock().unwrap();

    *ctx.results.lock().unwrap() = results;
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn robust_mutex_surfaces_owner_death_once() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(RobustCtx {
        mutex: OnceLock::new(),
        results: HostMutex::new(Vec::new()),
        done: AtomicBool::new(false),
    });
    ctx.mutex
        .set(
            Mutex::new(
                kernel,
                MutexAttributes {
                    robustness: MutexRobustness::Robust,
                    ..Default::default()
                },
            )
            .unwrap(),
        )
        .unwrap();

    let owner = spawn(kernel, "owner", thread::priority::NORMAL, robust_owner, ctx_arg(ctx));
    kernel.start().unwrap();
    assert!(wait_until(LONG, || owner.state() == ThreadState::Inactive));

    spawn(
        kernel,
        "recoverer",
        thread::priority::NORMAL,
        robust_recoverer,
        ctx_arg(ctx),
    );
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(
        *ctx.results.lock().unwrap(),
        [
            ("lock", ResultCode::ErrorOs),
            ("consistent", ResultCode::Success),
            ("unlock", ResultCode::Success),
            ("relock", ResultCode::Success),
        ]
    );
}

// ---------------------------------------------------------------------------
// Scenario: pool over-allocation

#[test]
fn pool_runs_dry_and_recovers() {
    init_logging();
    let kernel = build_kernel();
    let storage = leak_bytes(3 * 16);
    let base = storage.as_ptr() as usize;
    let pool = Pool::new(kernel, PoolAttributes { name: "blocks" }, 16, 3, storage).unwrap();

    assert_eq!(pool.capacity(), 3);
    assert_eq!(pool.free_count(), 3);

    let a = pool.alloc().unwrap();
    let b = pool.calloc().unwrap();
    let c = pool.alloc().unwrap();
    assert_ne!(a, b);
    assert_ne!(b, c);
    assert_ne!(a, c);
    assert!(pool.alloc().is_none());
    assert_eq!(pool.free_count(), 0);

    pool.free(b).unwrap();
    assert_eq!(pool.free_count(), 1);
    assert!(pool.alloc().is_some());
    assert_eq!(pool.free_count(), 0);

    // A pointer off the block grid is rejected.
    let bogus = core::ptr::NonNull::new((base + 1) as *mut u8).unwrap();
    assert_eq!(pool.free(bogus), Err(ResultCode::ErrorValue));
    pool.free(a).unwrap();
    pool.free(c).unwrap();
}

// ---------------------------------------------------------------------------
// Scenario: the ISR contract

struct IsrCtx {
    sem: OnceLock<Semaphore<StdPort>>,
    got_token: AtomicBool,
    sleep_result: HostMutex<Option<Result<(), ResultCode>>>,
    done: AtomicBool,
}

fn isr_waiter(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<IsrCtx>(arg);
    ctx.sem.get().unwrap().wait().unwrap();
    ctx.got_token.store(true, Ordering::SeqCst);

    let slept = kernel.sleep_for(WAIT_FOREVER);
    *ctx.sleep_result.lock().unwrap() = Some(slept);
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn isr_level_services_and_rejections() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(IsrCtx {
        sem: OnceLock::new(),
        got_token: AtomicBool::new(false),
        sleep_result: HostMutex::new(None),
        done: AtomicBool::new(false),
    });
    let sem = Semaphore::new(kernel, SemaphoreAttributes::default()).unwrap();
    ctx.sem.set(sem).unwrap();

    let t = spawn(kernel, "waiter", thread::priority::NORMAL, isr_waiter, ctx_arg(ctx));
    kernel.start().unwrap();
    assert!(wait_until(LONG, || t.state() == ThreadState::Waiting));

    with_simulated_irq(|| {
        assert!(kernel.is_in_irq());
        // Blocking services are rejected in interrupt context.
        assert_eq!(sem.wait(), Err(ResultCode::ErrorIsr));
        // The non-blocking post is fine.
        assert_eq!(sem.post(), Ok(()));
    });
    assert!(wait_until(LONG, || ctx.got_token.load(Ordering::SeqCst)));

    // The waiter is now in an unbounded sleep; an ISR wakeup with an
    // explicit reason releases it.
    assert!(wait_until(LONG, || t.state() == ThreadState::Waiting));
    with_simulated_irq(|| t.wakeup_with(ResultCode::Success));
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(t.wakeup_reason(), Ok(ResultCode::Success));
    assert_eq!(
        *ctx.sleep_result.lock().unwrap(),
        Some(Err(ResultCode::Eintr))
    );
}

// ---------------------------------------------------------------------------
// Threads: join, detach, cancel

struct JoinCtx {
    results: HostMutex<Vec<&'static str>>,
    done: AtomicBool,
}

fn join_child(_kernel: K, _arg: usize) -> usize {
    42
}

fn exiting_child(kernel: K, _arg: usize) -> usize {
    thread::exit(kernel, 17)
}

fn join_parent(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<JoinCtx>(arg);
    let mut results = Vec::new();

    let child = spawn(kernel, "child", thread::priority::LOW, join_child, 0);
    if child.join() == Ok(42) {
        results.push("join value");
    }
    if child.join() == Err(ResultCode::Einval) {
        results.push("join twice rejected");
    }

    let exiting = spawn(kernel, "exiting", thread::priority::LOW, exiting_child, 0);
    if exiting.join() == Ok(17) {
        results.push("explicit exit value");
    }

    let detached = spawn(kernel, "detached", thread::priority::LOW, join_child, 0);
    detached.detach().unwrap();
    if detached.join() == Err(ResultCode::Einval) {
        results.push("detached join rejected");
    }

    let me = thread::current(kernel).unwrap();
    if me.join() == Err(ResultCode::Einval) {
        results.push("self join rejected");
    }

    *ctx.results.lock().unwrap() = results;
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn join_detach_and_exit_values() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(JoinCtx {
        results: HostMutex::new(Vec::new()),
        done: AtomicBool::new(false),
    });
    spawn(kernel, "parent", thread::priority::NORMAL, join_parent, ctx_arg(ctx));
    kernel.start().unwrap();
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(
        *ctx.results.lock().unwrap(),
        [
            "join value",
            "join twice rejected",
            "explicit exit value",
            "detached join rejected",
            "self join rejected",
        ]
    );
}

fn forever_sleeper(kernel: K, _arg: usize) -> usize {
    let _ = kernel.sleep_for(WAIT_FOREVER);
    // Unreachable when cancelled: the wait is a suspension point.
    panic!("survived cancellation");
}

#[test]
fn cancel_terminates_a_blocked_thread() {
    init_logging();
    let kernel = build_kernel();
    let t = spawn(
        kernel,
        "sleepy",
        thread::priority::NORMAL,
        forever_sleeper,
        0,
    );
    kernel.start().unwrap();
    assert!(wait_until(LONG, || t.state() == ThreadState::Waiting));

    assert_eq!(t.cancel(), Ok(()));
    assert!(wait_until(LONG, || t.state() == ThreadState::Inactive));
    // Cancelling a terminated thread still reports success.
    assert_eq!(t.cancel(), Ok(()));
}

// ---------------------------------------------------------------------------
// Mutex flavors

struct FlavorCtx {
    done: AtomicBool,
    ok: AtomicBool,
}

fn mutex_flavors(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<FlavorCtx>(arg);
    let mut all_ok = true;

    let recursive = Mutex::new(
        kernel,
        MutexAttributes {
            mutex_type: MutexType::Recursive,
            ..Default::default()
        },
    )
    .unwrap();
    all_ok &= recursive.lock() == Ok(());
    all_ok &= recursive.lock() == Ok(());
    all_ok &= recursive.unlock() == Ok(());
    all_ok &= recursive.is_locked();
    all_ok &= recursive.unlock() == Ok(());
    all_ok &= !recursive.is_locked();

    let errorcheck = Mutex::new(
        kernel,
        MutexAttributes {
            mutex_type: MutexType::Errorcheck,
            ..Default::default()
        },
    )
    .unwrap();
    all_ok &= errorcheck.lock() == Ok(());
    all_ok &= errorcheck.lock() == Err(ResultCode::ErrorResource);
    all_ok &= errorcheck.unlock() == Ok(());
    all_ok &= errorcheck.unlock() == Err(ResultCode::ErrorResource);

    let normal = Mutex::new(kernel, MutexAttributes::default()).unwrap();
    all_ok &= normal.lock() == Ok(());
    // Self-relock is reported rather than deadlocking.
    all_ok &= normal.lock() == Err(ResultCode::ErrorResource);
    all_ok &= normal.unlock() == Ok(());

    ctx.ok.store(all_ok, Ordering::SeqCst);
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn mutex_types_behave_per_contract() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(FlavorCtx {
        done: AtomicBool::new(false),
        ok: AtomicBool::new(false),
    });
    spawn(kernel, "flavors", thread::priority::NORMAL, mutex_flavors, ctx_arg(ctx));
    kernel.start().unwrap();
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert!(ctx.ok.load(Ordering::SeqCst));
}

struct ContendCtx {
    mutex: OnceLock<Mutex<StdPort>>,
    locked: AtomicBool,
    release: AtomicBool,
    try_result: HostMutex<Option<Result<(), ResultCode>>>,
    timed_result: HostMutex<Option<Result<(), ResultCode>>>,
    done: AtomicBool,
}

fn contend_holder(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<ContendCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    mutex.lock().unwrap();
    ctx.locked.store(true, Ordering::SeqCst);
    while !ctx.release.load(Ordering::SeqCst) {
        thread::yield_now(kernel).unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    mutex.unlock().unwrap();
    0
}

fn contend_challenger(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<ContendCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    *ctx.try_result.lock().unwrap() = Some(mutex.try_lock());
    // Non-owner unlock is rejected.
    assert_eq!(mutex.unlock(), Err(ResultCode::ErrorResource));
    *ctx.timed_result.lock().unwrap() = Some(mutex.timed_lock(50));
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn contended_mutex_try_and_timeout() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(ContendCtx {
        mutex: OnceLock::new(),
        locked: AtomicBool::new(false),
        release: AtomicBool::new(false),
        try_result: HostMutex::new(None),
        timed_result: HostMutex::new(None),
        done: AtomicBool::new(false),
    });
    ctx.mutex
        .set(Mutex::new(kernel, MutexAttributes::default()).unwrap())
        .unwrap();

    let holder = spawn(
        kernel,
        "holder",
        thread::priority::NORMAL,
        contend_holder,
        ctx_arg(ctx),
    );
    kernel.start().unwrap();
    assert!(wait_until(LONG, || ctx.locked.load(Ordering::SeqCst)));

    let challenger = spawn(
        kernel,
        "challenger",
        thread::priority::NORMAL,
        contend_challenger,
        ctx_arg(ctx),
    );
    assert!(wait_until(LONG, || challenger.state() == ThreadState::Waiting));
    assert_eq!(
        *ctx.try_result.lock().unwrap(),
        Some(Err(ResultCode::EAGAIN))
    );

    pump_ticks(kernel, 50);
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(
        *ctx.timed_result.lock().unwrap(),
        Some(Err(ResultCode::ETIMEDOUT))
    );

    ctx.release.store(true, Ordering::SeqCst);
    assert!(wait_until(LONG, || holder.state() == ThreadState::Inactive));
}

struct CeilingCtx {
    mutex: OnceLock<Mutex<StdPort>>,
    boosted_to: AtomicUsize,
    too_high: HostMutex<Option<Result<(), ResultCode>>>,
    done_low: AtomicBool,
    done_rt: AtomicBool,
}

fn ceiling_low(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<CeilingCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    mutex.lock().unwrap();
    let me = thread::current(kernel).unwrap();
    ctx.boosted_to
        .store(me.get_sched_prio().unwrap() as usize, Ordering::SeqCst);
    mutex.unlock().unwrap();
    ctx.done_low.store(true, Ordering::SeqCst);
    0
}

fn ceiling_realtime(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<CeilingCtx>(arg);
    *ctx.too_high.lock().unwrap() = Some(ctx.mutex.get().unwrap().lock());
    ctx.done_rt.store(true, Ordering::SeqCst);
    0
}

#[test]
fn priority_ceiling_boosts_and_rejects() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(CeilingCtx {
        mutex: OnceLock::new(),
        boosted_to: AtomicUsize::new(0),
        too_high: HostMutex::new(None),
        done_low: AtomicBool::new(false),
        done_rt: AtomicBool::new(false),
    });
    ctx.mutex
        .set(
            Mutex::new(
                kernel,
                MutexAttributes {
                    protocol: MutexProtocol::Protect,
                    priority_ceiling: thread::priority::HIGH,
                    ..Default::default()
                },
            )
            .unwrap(),
        )
        .unwrap();

    spawn(kernel, "low", thread::priority::LOW, ceiling_low, ctx_arg(ctx));
    spawn(
        kernel,
        "realtime",
        thread::priority::REALTIME,
        ceiling_realtime,
        ctx_arg(ctx),
    );
    kernel.start().unwrap();

    assert!(wait_until(LONG, || ctx.done_low.load(Ordering::SeqCst)
        && ctx.done_rt.load(Ordering::SeqCst)));
    // While holding the mutex the owner ran at the ceiling.
    assert_eq!(
        ctx.boosted_to.load(Ordering::SeqCst),
        thread::priority::HIGH as usize
    );
    // A base priority above the ceiling may not take the lock at all.
    assert_eq!(
        *ctx.too_high.lock().unwrap(),
        Some(Err(ResultCode::ErrorPriority))
    );
}

// ---------------------------------------------------------------------------
// Condition variables

struct CondvarCtx {
    mutex: OnceLock<Mutex<StdPort>>,
    condvar: OnceLock<Condvar<StdPort>>,
    flag: AtomicBool,
    waiter_done: AtomicBool,
    timed_out: HostMutex<Option<Result<(), ResultCode>>>,
    relock_held: AtomicBool,
    timed_done: AtomicBool,
}

fn condvar_waiter(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<CondvarCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    let condvar = ctx.condvar.get().unwrap();
    mutex.lock().unwrap();
    while !ctx.flag.load(Ordering::SeqCst) {
        condvar.wait(mutex).unwrap();
    }
    mutex.unlock().unwrap();
    ctx.waiter_done.store(true, Ordering::SeqCst);
    0
}

fn condvar_signaler(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<CondvarCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    let condvar = ctx.condvar.get().unwrap();
    mutex.lock().unwrap();
    ctx.flag.store(true, Ordering::SeqCst);
    mutex.unlock().unwrap();
    condvar.signal().unwrap();
    0
}

fn condvar_timed(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<CondvarCtx>(arg);
    let mutex = ctx.mutex.get().unwrap();
    let condvar = ctx.condvar.get().unwrap();
    mutex.lock().unwrap();
    let result = condvar.timed_wait(mutex, 50);
    *ctx.timed_out.lock().unwrap() = Some(result);
    // The mutex is held again even after a timeout.
    ctx.relock_held
        .store(mutex.unlock().is_ok(), Ordering::SeqCst);
    ctx.timed_done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn condvar_signal_and_timeout() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(CondvarCtx {
        mutex: OnceLock::new(),
        condvar: OnceLock::new(),
        flag: AtomicBool::new(false),
        waiter_done: AtomicBool::new(false),
        timed_out: HostMutex::new(None),
        relock_held: AtomicBool::new(false),
        timed_done: AtomicBool::new(false),
    });
    ctx.mutex
        .set(Mutex::new(kernel, MutexAttributes::default()).unwrap())
        .unwrap();
    ctx.condvar
        .set(Condvar::new(kernel, CondvarAttributes { name: "cv" }).unwrap())
        .unwrap();

    let waiter = spawn(
        kernel,
        "cv-waiter",
        thread::priority::NORMAL,
        condvar_waiter,
        ctx_arg(ctx),
    );
    kernel.start().unwrap();
    assert!(wait_until(LONG, || waiter.state() == ThreadState::Waiting));

    spawn(
        kernel,
        "cv-signaler",
        thread::priority::NORMAL,
        condvar_signaler,
        ctx_arg(ctx),
    );
    assert!(wait_until(LONG, || ctx.waiter_done.load(Ordering::SeqCst)));

    let timed = spawn(
        kernel,
        "cv-timed",
        thread::priority::NORMAL,
        condvar_timed,
        ctx_arg(ctx),
    );
    assert!(wait_until(LONG, || timed.state() == ThreadState::Waiting));
    pump_ticks(kernel, 50);
    assert!(wait_until(LONG, || ctx.timed_done.load(Ordering::SeqCst)));
    assert_eq!(
        *ctx.timed_out.lock().unwrap(),
        Some(Err(ResultCode::ETIMEDOUT))
    );
    assert!(ctx.relock_held.load(Ordering::SeqCst));
}

// ---------------------------------------------------------------------------
// Scheduler critical section

struct SchedLockCtx {
    observed_early: AtomicBool,
    high_ran: AtomicBool,
    was_locked: AtomicBool,
    done: AtomicBool,
}

fn sched_lock_high(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<SchedLockCtx>(arg);
    ctx.high_ran.store(true, Ordering::SeqCst);
    0
}

fn sched_lock_low(kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<SchedLockCtx>(arg);
    {
        let section = kernel.lock_scheduler();
        ctx.was_locked.store(section.was_locked(), Ordering::SeqCst);
        spawn(
            kernel,
            "deferred-high",
            thread::priority::HIGH,
            sched_lock_high,
            ctx_arg(ctx),
        );
        // Preemption is deferred while the section is held.
        std::thread::sleep(Duration::from_millis(20));
        ctx.observed_early
            .store(ctx.high_ran.load(Ordering::SeqCst), Ordering::SeqCst);
    }
    // Leaving the outermost section dispatches the pending thread.
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn scheduler_critical_section_defers_preemption() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(SchedLockCtx {
        observed_early: AtomicBool::new(false),
        high_ran: AtomicBool::new(false),
        was_locked: AtomicBool::new(false),
        done: AtomicBool::new(false),
    });
    spawn(kernel, "locker", thread::priority::LOW, sched_lock_low, ctx_arg(ctx));
    kernel.start().unwrap();

    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert!(!ctx.observed_early.load(Ordering::SeqCst));
    assert!(!ctx.was_locked.load(Ordering::SeqCst));
    assert!(wait_until(LONG, || ctx.high_ran.load(Ordering::SeqCst)));
}

// ---------------------------------------------------------------------------
// Message queues

#[test]
fn message_queue_round_trip_preserves_order() {
    init_logging();
    let kernel = build_kernel();
    let queue = MessageQueue::new(
        kernel,
        MessageQueueAttributes { name: "ring" },
        leak_words(4),
    )
    .unwrap();

    for msg in 10..14 {
        queue.put(msg, 0).unwrap();
    }
    assert_eq!(queue.put(99, 0), Err(ResultCode::EAGAIN));
    assert_eq!(queue.len(), 4);
    for msg in 10..14 {
        assert_eq!(queue.get(0), Ok(msg));
    }
    assert_eq!(queue.get(0), Err(ResultCode::EAGAIN));
    assert!(queue.is_empty());
}

struct QueueCtx {
    queue: OnceLock<MessageQueue<StdPort>>,
    done: AtomicBool,
}

fn queue_producer(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<QueueCtx>(arg);
    let queue = ctx.queue.get().unwrap();
    queue.put(1, 0).unwrap();
    queue.put(2, 0).unwrap();
    // The ring is full; this blocks until a consumer makes room.
    queue.put(3, WAIT_FOREVER).unwrap();
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn blocked_producer_is_drained_in_order() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(QueueCtx {
        queue: OnceLock::new(),
        done: AtomicBool::new(false),
    });
    ctx.queue
        .set(
            MessageQueue::new(kernel, MessageQueueAttributes { name: "q" }, leak_words(2)).unwrap(),
        )
        .unwrap();
    let queue = *ctx.queue.get().unwrap();

    let producer = spawn(
        kernel,
        "producer",
        thread::priority::NORMAL,
        queue_producer,
        ctx_arg(ctx),
    );
    kernel.start().unwrap();
    assert!(wait_until(LONG, || producer.state() == ThreadState::Waiting));

    // Draining one slot also moves the blocked producer's message in.
    assert_eq!(queue.get(0), Ok(1));
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(queue.get(0), Ok(2));
    assert_eq!(queue.get(0), Ok(3));

    // ISR rules: zero-timeout transfers work, blocking forms are rejected.
    with_simulated_irq(|| {
        assert_eq!(queue.put(7, 0), Ok(()));
        assert_eq!(queue.get(0), Ok(7));
        assert_eq!(queue.put(8, 10), Err(ResultCode::ErrorIsr));
        assert_eq!(queue.get(10), Err(ResultCode::ErrorIsr));
    });
}

// ---------------------------------------------------------------------------
// Mail queues

struct MailCtx {
    mail: OnceLock<MailQueue<StdPort>>,
    first: AtomicUsize,
    second: AtomicUsize,
    granted: AtomicUsize,
    done: AtomicBool,
}

fn mail_allocator(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<MailCtx>(arg);
    let mail = ctx.mail.get().unwrap();
    let a = mail.alloc(0).unwrap();
    let b = mail.calloc(0).unwrap();
    ctx.first.store(a.as_ptr() as usize, Ordering::SeqCst);
    ctx.second.store(b.as_ptr() as usize, Ordering::SeqCst);
    assert_eq!(mail.alloc(0), Err(ResultCode::EAGAIN));
    // Blocks until the harness frees a block.
    let c = mail.alloc(WAIT_FOREVER).unwrap();
    ctx.granted.store(c.as_ptr() as usize, Ordering::SeqCst);
    ctx.done.store(true, Ordering::SeqCst);
    0
}

#[test]
fn mail_blocks_pass_ownership_and_reject_bad_frees() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(MailCtx {
        mail: OnceLock::new(),
        first: AtomicUsize::new(0),
        second: AtomicUsize::new(0),
        granted: AtomicUsize::new(0),
        done: AtomicBool::new(false),
    });
    ctx.mail
        .set(
            MailQueue::new(
                kernel,
                MailQueueAttributes { name: "mail" },
                2,
                32,
                leak_bytes(2 * 32),
                leak_words(2),
            )
            .unwrap(),
        )
        .unwrap();
    let mail = *ctx.mail.get().unwrap();

    let allocator = spawn(
        kernel,
        "allocator",
        thread::priority::NORMAL,
        mail_allocator,
        ctx_arg(ctx),
    );
    kernel.start().unwrap();
    assert!(wait_until(LONG, || allocator.state() == ThreadState::Waiting));

    let first = core::ptr::NonNull::new(ctx.first.load(Ordering::SeqCst) as *mut u8).unwrap();
    let second = core::ptr::NonNull::new(ctx.second.load(Ordering::SeqCst) as *mut u8).unwrap();

    // Send the first block through the queue and receive it back.
    mail.put(first).unwrap();
    let received = mail.get(0).unwrap();
    assert_eq!(received, first);

    // Freeing hands the block straight to the blocked allocator.
    mail.free(received).unwrap();
    assert!(wait_until(LONG, || ctx.done.load(Ordering::SeqCst)));
    assert_eq!(ctx.granted.load(Ordering::SeqCst), first.as_ptr() as usize);

    // The second block is still owned by the application; a double free of
    // a returned block and a foreign pointer are both rejected.
    mail.put(second).unwrap();
    let second_back = mail.get(0).unwrap();
    mail.free(second_back).unwrap();
    assert_eq!(mail.free(second_back), Err(ResultCode::ErrorValue));
    let foreign = core::ptr::NonNull::new(0x1000 as *mut u8).unwrap();
    assert_eq!(mail.free(foreign), Err(ResultCode::ErrorValue));
}

// ---------------------------------------------------------------------------
// Timers

struct TimerCtx {
    fired: AtomicUsize,
    in_irq: AtomicBool,
    sem: OnceLock<Semaphore<StdPort>>,
}

fn periodic_callback(kernel: K, arg: usize) {
    let ctx = ctx_of::<TimerCtx>(arg);
    ctx.fired.fetch_add(1, Ordering::SeqCst);
    ctx.in_irq.store(kernel.is_in_irq(), Ordering::SeqCst);
}

fn post_callback(_kernel: K, arg: usize) {
    let ctx = ctx_of::<TimerCtx>(arg);
    ctx.sem.get().unwrap().post().unwrap();
}

fn timer_waiter(_kernel: K, arg: usize) -> usize {
    let ctx = ctx_of::<TimerCtx>(arg);
    ctx.sem.get().unwrap().wait().unwrap();
    ctx.fired.fetch_add(100, Ordering::SeqCst);
    0
}

#[test]
fn timers_fire_in_tick_context() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(TimerCtx {
        fired: AtomicUsize::new(0),
        in_irq: AtomicBool::new(false),
        sem: OnceLock::new(),
    });

    let periodic = Timer::new(
        kernel,
        TimerAttributes {
            name: "beat",
            mode: TimerMode::Periodic,
        },
        periodic_callback,
        ctx_arg(ctx),
    )
    .unwrap();

    assert_eq!(periodic.start(0), Err(ResultCode::ErrorParameter));
    periodic.start(10).unwrap();
    pump_ticks(kernel, 35);
    assert_eq!(ctx.fired.load(Ordering::SeqCst), 3);
    assert!(ctx.in_irq.load(Ordering::SeqCst));
    periodic.stop().unwrap();
    assert_eq!(periodic.stop(), Err(ResultCode::EAGAIN));
    pump_ticks(kernel, 20);
    assert_eq!(ctx.fired.load(Ordering::SeqCst), 3);

    // A one-shot timer fires exactly once.
    let once = Timer::new(
        kernel,
        TimerAttributes {
            name: "once",
            mode: TimerMode::Once,
        },
        periodic_callback,
        ctx_arg(ctx),
    )
    .unwrap();
    once.start(5).unwrap();
    assert!(once.is_running());
    pump_ticks(kernel, 4);
    assert_eq!(ctx.fired.load(Ordering::SeqCst), 3);
    pump_tick(kernel);
    assert_eq!(ctx.fired.load(Ordering::SeqCst), 4);
    assert!(!once.is_running());
    pump_ticks(kernel, 10);
    assert_eq!(ctx.fired.load(Ordering::SeqCst), 4);
}

#[test]
fn timer_callback_wakes_a_thread() {
    init_logging();
    let kernel = build_kernel();
    let ctx = leak(TimerCtx {
        fired: AtomicUsize::new(0),
        in_irq: AtomicBool::new(false),
        sem: OnceLock::new(),
    });
    ctx.sem
        .set(Semaphore::new(kernel, SemaphoreAttributes::default()).unwrap())
        .unwrap();

    let waiter = spawn(
        kernel,
        "timer-waiter",
        thread::priority::NORMAL,
        timer_waiter,
        ctx_arg(ctx),
    );
    kernel.start().unwrap();
    assert!(wait_until(LONG, || waiter.state() == ThreadState::Waiting));

    let timer = Timer::new(
        kernel,
        TimerAttributes {
            name: "poster",
            mode: TimerMode::Once,
        },
        post_callback,
        ctx_arg(ctx),
    )
    .unwrap();
    timer.start(3).unwrap();
    pump_ticks(kernel, 3);
    assert!(wait_until(LONG, || ctx.fired.load(Ordering::SeqCst) == 100));
    assert!(wait_until(LONG, || waiter.state() == ThreadState::Inactive));
}

// ---------------------------------------------------------------------------
// Clock queries

#[test]
fn tick_counter_is_monotonic() {
    init_logging();
    let kernel = build_kernel();
    assert_eq!(kernel.now(), 0);
    pump_ticks(kernel, 7);
    assert_eq!(kernel.now(), 7);
    let sample = kernel.now_sample();
    assert_eq!(sample.ticks, 7);
    assert_eq!(sample.divisor, 1);
    let mut last = 0;
    for _ in 0..100 {
        pump_tick(kernel);
        let now = kernel.now();
        assert!(now > last);
        last = now;
    }
    assert!(kernel.rtc_now() > 1_600_000_000);
}
