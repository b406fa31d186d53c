//! Threads and the scheduler
//!
//! The thread state machine:
//!
//! ```text
//!            register            dispatch
//! inactive ────────────▶ ready ─────────▶ running
//!    ▲                    ▲ ▲               │
//!    │ terminate          │ └───────────────┘ preempt
//!    │                    │      block
//!    │                    └───────────────── waiting
//!    │                         wakeup
//!    └─────────────────────────────────── (terminate)
//! ```
//!
//! Of all ready threads, the one with the highest dynamic priority runs;
//! ties dispatch in FIFO order and are not time-sliced. Scheduling decisions
//! happen at return from ISR, at every blocking call, at `yield_now`, at
//! priority changes, and when the outermost scheduler critical section is
//! released.
use core::fmt;
use core::ptr;

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock::{self, CpuLockGuard},
    mutex, state,
    wait::{self, WaitPayload},
    Kernel, Port, ThreadId,
};

/// Thread priority values.
///
/// Priorities are plain numbers in `0..=255`; higher runs first. The named
/// constants mark the conventional bands.
pub mod priority {
    /// Lowest band, reserved for the idle thread.
    pub const IDLE: u8 = 1;
    pub const LOW: u8 = 0x40;
    pub const BELOW_NORMAL: u8 = 0x60;
    /// Default for new threads.
    pub const NORMAL: u8 = 0x80;
    pub const ABOVE_NORMAL: u8 = 0xa0;
    pub const HIGH: u8 = 0xc0;
    pub const REALTIME: u8 = 0xe0;
    pub const MAX: u8 = 0xff;
}

/// Thread state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Not registered with the scheduler, or terminated.
    Inactive,
    Ready,
    Running,
    Waiting,
}

/// A thread's entry function. The returned value becomes the thread's exit
/// value, observable through [`Thread::join`].
pub type ThreadEntry<P> = fn(&'static Kernel<P>, usize) -> usize;

/// Creation attributes for a thread.
///
/// `stack` is caller-donated storage exclusively owned by the thread for its
/// lifetime. Ports that execute threads on host-provided stacks may ignore
/// it.
pub struct ThreadAttributes {
    pub name: &'static str,
    pub priority: u8,
    pub stack: Option<&'static mut [u8]>,
}

impl Default for ThreadAttributes {
    fn default() -> Self {
        Self {
            name: "",
            priority: priority::NORMAL,
            stack: None,
        }
    }
}

/// *Thread control block* - the state data of a thread.
pub(crate) struct ThreadCb<P: Port> {
    /// Whether this registry slot is allocated. Cleared when the thread is
    /// reaped (joined, or terminated while detached).
    pub(crate) in_use: bool,

    pub(crate) name: &'static str,
    pub(crate) entry: ThreadEntry<P>,
    pub(crate) arg: usize,
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,

    /// The static priority assigned by the application.
    pub(crate) base_priority: u8,

    /// The scheduling priority: `base_priority` plus any boost applied by a
    /// mutex locking protocol. Determines the position in the ready queue
    /// and in wait lists.
    pub(crate) effective_priority: u8,

    pub(crate) st: ThreadState,

    /// Why the last wait ended.
    pub(crate) wakeup_reason: ResultCode,

    /// Present exactly while the thread is in the Waiting state.
    pub(crate) wait: Option<WaitPayload>,

    pub(crate) detached: bool,
    pub(crate) cancel_pending: bool,
    pub(crate) exit_value: usize,

    /// Threads blocked in `join` on this one.
    pub(crate) join_queue: wait::PrioList,

    /// Head of the singly linked list of mutexes this thread holds, most
    /// recently locked first. The links live in the mutex control blocks.
    pub(crate) last_mutex_held: Option<crate::MutexId>,
}

impl<P: Port> fmt::Debug for ThreadCb<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadCb")
            .field("name", &self.name)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("st", &self.st)
            .field("wakeup_reason", &self.wakeup_reason)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

/// Handle to a thread in a kernel instance.
pub struct Thread<P: Port> {
    kernel: &'static Kernel<P>,
    id: ThreadId,
}

impl<P: Port> Clone for Thread<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for Thread<P> {}

impl<P: Port> PartialEq for Thread<P> {
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.kernel, other.kernel) && self.id == other.id
    }
}
impl<P: Port> Eq for Thread<P> {}

impl<P: Port> fmt::Debug for Thread<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Thread").field(&self.id.0).finish()
    }
}

impl<P: Port> Thread<P> {
    /// Create a thread and register it with the scheduler.
    ///
    /// The thread starts in the Ready state and is dispatched whenever it
    /// becomes the highest-priority ready thread; if the kernel is already
    /// running and the new thread outranks the caller, that happens before
    /// this function returns.
    pub fn new(
        kernel: &'static Kernel<P>,
        mut attr: ThreadAttributes,
        entry: ThreadEntry<P>,
        arg: usize,
    ) -> Result<Self> {
        if attr.priority < priority::IDLE || (attr.priority as usize) >= cfg::MAX_PRIORITY_BANDS {
            return Err(ResultCode::Einval);
        }
        let (stack_base, stack_size) = match attr.stack.take() {
            Some(stack) => (stack.as_mut_ptr(), stack.len()),
            None => (ptr::null_mut(), 0),
        };

        let mut lock = klock::lock_cpu(kernel);
        let id = alloc_slot(&mut lock)?;
        lock[id] = ThreadCb {
            in_use: true,
            name: attr.name,
            entry,
            arg,
            stack_base,
            stack_size,
            base_priority: attr.priority,
            effective_priority: attr.priority,
            st: ThreadState::Inactive,
            wakeup_reason: ResultCode::Success,
            wait: None,
            detached: false,
            cancel_pending: false,
            exit_value: 0,
            join_queue: wait::PrioList::new(),
            last_mutex_held: None,
        };
        drop(lock);

        // Let the port prepare the execution state before the thread can be
        // selected to run.
        kernel.port().initialize_thread(kernel, id);

        let mut lock = klock::lock_cpu(kernel);
        register_thread(&mut lock, id);
        unlock_cpu_and_check_preemption(kernel, lock);

        Ok(Self { kernel, id })
    }

    /// The thread's identifier within its kernel.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        let lock = klock::lock_cpu(self.kernel);
        lock[self.id].name
    }

    /// The thread's position in the state machine.
    pub fn state(&self) -> ThreadState {
        let lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return ThreadState::Inactive;
        }
        lock[self.id].st
    }

    /// Request termination. The target observes the request at its next
    /// suspension point; if it is currently blocked, it wakes with
    /// [`ResultCode::Eintr`] and terminates there.
    ///
    /// Cancelling a thread that has already terminated is a no-op reporting
    /// success.
    pub fn cancel(&self) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use || lock[self.id].st == ThreadState::Inactive {
            return Ok(());
        }
        lock[self.id].cancel_pending = true;
        if wait::interrupt_thread(&mut lock, self.id, ResultCode::Eintr) {
            unlock_cpu_and_check_preemption(self.kernel, lock);
        }
        Ok(())
    }

    /// Block until the thread terminates and return its exit value.
    ///
    /// Fails with [`ResultCode::Einval`] for a detached thread, a self-join,
    /// or a thread that was already joined.
    pub fn join(&self) -> Result<usize> {
        let mut lock = klock::lock_cpu_as_current(self.kernel);
        state::expect_waitable_context(self.kernel, &lock)?;
        lock = cancellation_point(self.kernel, lock);

        let me = lock.running_thread.unwrap();
        if self.id == me || !lock[self.id].in_use || lock[self.id].detached {
            return Err(ResultCode::Einval);
        }
        if lock[self.id].st == ThreadState::Inactive {
            // Already terminated: collect the exit value and reap.
            let value = lock[self.id].exit_value;
            lock[self.id].in_use = false;
            return Ok(value);
        }

        let (_lock, reason, payload) = wait::block_current(
            self.kernel,
            lock,
            WaitPayload::Join {
                target: self.id,
                exit_value: 0,
            },
            None,
        );
        match reason {
            ResultCode::Success => match payload {
                WaitPayload::Join { exit_value, .. } => Ok(exit_value),
                _ => Err(ResultCode::ErrorOs),
            },
            reason => Err(reason),
        }
    }

    /// Mark the thread self-reaping: its resources are released on
    /// termination and `join` is no longer allowed.
    pub fn detach(&self) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::Einval);
        }
        if lock[self.id].st == ThreadState::Inactive {
            lock[self.id].in_use = false;
        } else {
            lock[self.id].detached = true;
        }
        Ok(())
    }

    /// Update the thread's base priority, recomputing the dynamic priority
    /// under the locking protocols of any held mutexes.
    pub fn set_sched_prio(&self, prio: u8) -> Result {
        if prio < priority::IDLE || (prio as usize) >= cfg::MAX_PRIORITY_BANDS {
            return Err(ResultCode::Einval);
        }
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use || lock[self.id].st == ThreadState::Inactive {
            return Err(ResultCode::Einval);
        }
        let old_base = lock[self.id].base_priority;
        if old_base == prio {
            return Ok(());
        }

        #[cfg(feature = "mutex-protect")]
        if prio > old_base && !mutex::held_mutexes_allow_base_priority(&mut lock, self.id, prio) {
            // Raising the priority above a held or contended ceiling would
            // invalidate the protocol's precondition.
            return Err(ResultCode::ErrorPriority);
        }

        lock[self.id].base_priority = prio;
        let effective = mutex::evaluate_effective_priority(&mut lock, self.id, prio);
        let old_effective = lock[self.id].effective_priority;
        lock[self.id].effective_priority = effective;
        if effective == old_effective {
            return Ok(());
        }

        match lock[self.id].st {
            ThreadState::Ready => {
                lock.ready_queue.reorder(self.id, effective);
            }
            ThreadState::Waiting => {
                wait::reorder_wait_of_thread(&mut lock, self.id, effective);
                #[cfg(feature = "mutex-inherit")]
                if let Some(WaitPayload::Mutex(m)) = lock[self.id].wait {
                    mutex::boost_owner_chain(&mut lock, m, effective);
                }
            }
            ThreadState::Running | ThreadState::Inactive => {}
        }

        // A lowered running thread can be preempted; a raised ready thread
        // can preempt.
        unlock_cpu_and_check_preemption(self.kernel, lock);
        Ok(())
    }

    /// The thread's current dynamic priority, including any protocol boost.
    pub fn get_sched_prio(&self) -> Result<u8> {
        let lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::Einval);
        }
        Ok(lock[self.id].effective_priority)
    }

    /// Force a blocked thread back to Ready with the default reason,
    /// [`ResultCode::Eintr`]. No-op in any other state.
    pub fn wakeup(&self) {
        self.wakeup_with(ResultCode::Eintr)
    }

    /// Force a blocked thread back to Ready with an explicit wakeup reason.
    pub fn wakeup_with(&self, reason: ResultCode) {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return;
        }
        if wait::interrupt_thread(&mut lock, self.id, reason) {
            unlock_cpu_and_check_preemption(self.kernel, lock);
        }
    }

    /// Why the thread's last wait ended.
    pub fn wakeup_reason(&self) -> Result<ResultCode> {
        let lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::Einval);
        }
        Ok(lock[self.id].wakeup_reason)
    }
}

/// The currently running thread, if the caller is one.
pub fn current<P: Port>(kernel: &'static Kernel<P>) -> Option<Thread<P>> {
    if kernel.port().is_in_irq() {
        return None;
    }
    let lock = klock::lock_cpu_as_current(kernel);
    lock.running_thread.map(|id| Thread { kernel, id })
}

/// Yield the CPU: the calling thread goes behind every ready thread of its
/// own priority and the scheduler dispatches the head of the ready queue.
pub fn yield_now<P: Port>(kernel: &'static Kernel<P>) -> Result {
    let mut lock = klock::lock_cpu_as_current(kernel);
    state::expect_task_context(kernel, &lock)?;
    lock = cancellation_point(kernel, lock);
    if lock.sched_lock > 0 {
        return Ok(());
    }

    let me = lock.running_thread.unwrap();
    make_ready(&mut lock, me);
    let next = lock.ready_queue.pop_highest().expect("ready queue empty at yield");
    lock[next].st = ThreadState::Running;
    if next == me {
        return Ok(());
    }
    lock.running_thread = Some(next);
    log::trace!("yield: dispatching {:?}", next);
    drop(lock);
    kernel.port().context_switch(kernel, Some(me), Some(next));

    loop {
        kernel.port().settle(kernel);
        let lock = klock::lock_cpu(kernel);
        if lock[me].st == ThreadState::Running {
            break;
        }
        drop(lock);
    }
    Ok(())
}

/// Terminate the calling thread, recording `value` as its exit value. Any
/// joiner observes the value; this function never returns.
pub fn exit<P: Port>(kernel: &'static Kernel<P>, value: usize) -> ! {
    debug_assert!(!kernel.port().is_in_irq());
    let mut lock = klock::lock_cpu_as_current(kernel);
    if let Some(tid) = lock.running_thread {
        lock[tid].exit_value = value;
    }
    drop(lock);
    kernel.port().exit_thread(kernel)
}

/// Find a free registry slot for a new thread.
fn alloc_slot<P: Port>(lock: &mut CpuLockGuard<'_, P>) -> Result<ThreadId> {
    if let Some(pos) = lock.threads.iter().position(|cb| !cb.in_use) {
        return Ok(ThreadId(pos));
    }
    if lock.threads.is_full() {
        return Err(ResultCode::ErrorNoMemory);
    }
    let id = ThreadId(lock.threads.len());
    lock.threads.push(ThreadCb {
        in_use: false,
        name: "",
        entry: |_, _| 0,
        arg: 0,
        stack_base: ptr::null_mut(),
        stack_size: 0,
        base_priority: priority::NORMAL,
        effective_priority: priority::NORMAL,
        st: ThreadState::Inactive,
        wakeup_reason: ResultCode::Success,
        wait: None,
        detached: false,
        cancel_pending: false,
        exit_value: 0,
        join_queue: wait::PrioList::new(),
        last_mutex_held: None,
    });
    Ok(id)
}

/// Register a constructed thread with the scheduler: Inactive → Ready.
pub(crate) fn register_thread<P: Port>(lock: &mut CpuLockGuard<'_, P>, thread: ThreadId) {
    debug_assert_eq!(lock[thread].st, ThreadState::Inactive);
    log::debug!(
        "registering thread {:?} ({:?}) at priority {}",
        thread,
        lock[thread].name,
        lock[thread].base_priority
    );
    make_ready(lock, thread);
}

/// Transition `thread` into the Ready state and queue it for dispatch.
pub(crate) fn make_ready<P: Port>(lock: &mut CpuLockGuard<'_, P>, thread: ThreadId) {
    let prio = lock[thread].effective_priority;
    lock[thread].st = ThreadState::Ready;
    lock.ready_queue.insert(prio, thread);
}

/// Elect the thread that should own the CPU.
///
/// Returns `Some((from, to))` when the running thread changes; the caller
/// must release the CPU lock and then hand the pair to
/// [`Port::context_switch`]. `from` is absent when no thread loses the CPU
/// (boot dispatch, exit).
pub(crate) fn choose_next_running_thread<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
) -> Option<(Option<ThreadId>, Option<ThreadId>)> {
    if !lock.running {
        return None;
    }
    if lock.sched_lock > 0 {
        lock.reschedule_pending = true;
        return None;
    }

    let prev = lock.running_thread;
    let prev_running_prio = match prev {
        Some(t) if lock[t].st == ThreadState::Running => Some(lock[t].effective_priority),
        _ => None,
    };

    let must_switch = match (prev_running_prio, lock.ready_queue.first()) {
        // Preempt only on strictly higher priority; equal priority keeps
        // the incumbent (FIFO, no time slicing).
        (Some(p), Some(head)) => head.priority > p,
        (Some(_), None) => false,
        // No runnable incumbent: a new thread must be elected.
        (None, _) => true,
    };
    if !must_switch {
        return None;
    }

    let next = lock.ready_queue.pop_highest();
    if let Some(t) = next {
        lock[t].st = ThreadState::Running;
    }
    if let Some(pt) = prev {
        if lock[pt].st == ThreadState::Running {
            // The incumbent was preempted; it stays runnable.
            let prio = lock[pt].effective_priority;
            lock[pt].st = ThreadState::Ready;
            lock.ready_queue.insert(prio, pt);
        }
    }
    lock.running_thread = next;
    log::trace!("dispatch: {:?} -> {:?}", prev, next);
    Some((prev, next))
}

/// Release the CPU lock and, if a higher-priority thread became ready,
/// perform the context switch. Services that wake threads call this before
/// returning to the caller.
pub(crate) fn unlock_cpu_and_check_preemption<P: Port>(
    kernel: &'static Kernel<P>,
    mut lock: CpuLockGuard<'_, P>,
) {
    let decision = choose_next_running_thread(&mut lock);
    drop(lock);
    if let Some((from, to)) = decision {
        kernel.port().context_switch(kernel, from, to);
    }
    kernel.port().settle(kernel);
}

/// Terminate the thread here if termination was requested. Called at every
/// suspension point.
pub(crate) fn cancellation_point<P: Port>(
    kernel: &'static Kernel<P>,
    lock: CpuLockGuard<'static, P>,
) -> CpuLockGuard<'static, P> {
    if let Some(tid) = lock.running_thread {
        if lock[tid].cancel_pending {
            drop(lock);
            kernel.port().exit_thread(kernel);
        }
    }
    lock
}

/// Retire a terminated thread: release held mutexes, wake joiners, and
/// elect a successor. Called by the port's exit trampoline.
pub(crate) fn finalize_thread<P: Port>(
    kernel: &'static Kernel<P>,
    thread: ThreadId,
    value: Option<usize>,
) {
    let mut lock = klock::lock_cpu(kernel);
    debug_assert_ne!(lock.idle_thread, Some(thread), "the idle thread terminated");

    // Owner death: release every held mutex, marking robust ones
    // inconsistent.
    mutex::abandon_held_mutexes(&mut lock, thread);

    // The thread normally retires as the running thread, but a tick taken
    // between its last kernel call and the exit trampoline may have
    // preempted it back to Ready.
    match lock[thread].st {
        ThreadState::Running => {
            debug_assert_eq!(lock.running_thread, Some(thread));
            lock.running_thread = None;
        }
        ThreadState::Ready => {
            lock.ready_queue.remove(thread);
        }
        ThreadState::Waiting | ThreadState::Inactive => {
            debug_assert!(false, "exiting thread in state {:?}", lock[thread].st);
        }
    }
    {
        let cb = &mut lock[thread];
        if let Some(v) = value {
            cb.exit_value = v;
        }
        cb.st = ThreadState::Inactive;
        cb.wait = None;
        cb.cancel_pending = false;
    }

    let exit_value = lock[thread].exit_value;
    let mut had_joiner = false;
    while let Some(joiner) = lock[thread].join_queue.pop_highest() {
        had_joiner = true;
        if let Some(WaitPayload::Join { exit_value: slot, .. }) = lock[joiner].wait.as_mut() {
            *slot = exit_value;
        }
        wait::complete_wake(&mut lock, joiner, ResultCode::Success);
    }
    unregister_thread(&mut lock, thread, had_joiner);

    let decision = choose_next_running_thread(&mut lock);
    drop(lock);
    if let Some((from, to)) = decision {
        kernel.port().context_switch(kernel, from, to);
    }
}

/// Remove a terminated thread from the scheduler's books. The slot is
/// reclaimed immediately when the thread was detached or already joined;
/// otherwise it stays allocated so a later `join` can read the exit value.
fn unregister_thread<P: Port>(lock: &mut CpuLockGuard<'_, P>, thread: ThreadId, joined: bool) {
    log::debug!("thread {:?} ({:?}) terminated", thread, lock[thread].name);
    if joined || lock[thread].detached {
        lock[thread].in_use = false;
    }
}

/// Install the idle thread. It runs at the reserved lowest band and never
/// blocks, so the ready queue is never empty once the kernel is started.
pub(crate) fn spawn_idle<P: Port>(kernel: &'static Kernel<P>) -> Result<ThreadId> {
    let thread = Thread::new(
        kernel,
        ThreadAttributes {
            name: "idle",
            priority: priority::IDLE,
            stack: None,
        },
        idle_entry,
        0,
    )?;
    Ok(thread.id)
}

fn idle_entry<P: Port>(kernel: &'static Kernel<P>, _arg: usize) -> usize {
    loop {
        kernel.port().idle_wait();
    }
}
