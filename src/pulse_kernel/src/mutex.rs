//! Mutexes
//!
//! Ownership transfers directly from the unlocking thread to the
//! highest-priority waiter, so a mutex is never observably free while
//! threads are queued on it.
//!
//! Two optional locking protocols bound priority inversion: `Inherit`
//! raises the owner to the priority of its highest waiter (propagating
//! through chains of held mutexes), `Protect` raises the owner to a fixed
//! ceiling for the duration of ownership. Robust mutexes surface owner
//! death as a recoverable error.
use core::fmt;

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock::{self, CpuLockGuard},
    state, thread,
    thread::ThreadState,
    wait::{self, PrioList, WaitPayload},
    Kernel, MutexId, Port, ThreadId,
};

/// Behavior on a relock by the owner and on a non-owner unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexType {
    /// Relock by the owner is rejected with [`ResultCode::ErrorResource`]
    /// rather than deadlocking.
    Normal,
    /// Like `Normal`, but the error reporting is part of the contract.
    Errorcheck,
    /// Relock by the owner increments a count; the same number of unlocks
    /// releases the mutex.
    Recursive,
}

/// Priority protocol applied while the mutex is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexProtocol {
    None,
    /// Priority inheritance: the owner runs at the priority of its highest
    /// waiter.
    Inherit,
    /// Priority ceiling: the owner runs at the configured ceiling.
    Protect,
}

/// Behavior when the owner terminates while holding the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexRobustness {
    /// Ownership passes on silently.
    Stalled,
    /// The mutex becomes inconsistent; the next acquirer is told via
    /// [`ResultCode::ErrorOs`] and must call [`Mutex::consistent`].
    Robust,
}

/// Creation attributes for a mutex.
#[derive(Clone, Copy)]
pub struct MutexAttributes {
    pub name: &'static str,
    pub mutex_type: MutexType,
    pub protocol: MutexProtocol,
    pub robustness: MutexRobustness,
    /// Ceiling priority for the `Protect` protocol.
    pub priority_ceiling: u8,
}

impl Default for MutexAttributes {
    fn default() -> Self {
        Self {
            name: "",
            mutex_type: MutexType::Normal,
            protocol: MutexProtocol::None,
            robustness: MutexRobustness::Stalled,
            priority_ceiling: thread::priority::MAX,
        }
    }
}

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb {
    pub(crate) in_use: bool,
    pub(crate) name: &'static str,
    pub(crate) mutex_type: MutexType,
    pub(crate) protocol: MutexProtocol,
    pub(crate) robustness: MutexRobustness,
    pub(crate) ceiling: u8,

    /// The thread that currently owns the lock. `count > 0` iff this is
    /// present.
    pub(crate) owner: Option<ThreadId>,

    /// Recursion count. Never exceeds 1 for non-recursive types.
    pub(crate) count: u32,

    /// Owner died while holding a robust mutex; cleared by `consistent`.
    pub(crate) inconsistent: bool,

    pub(crate) wait_queue: PrioList,

    /// The next mutex in the list of mutexes held by `owner`, headed by the
    /// thread's `last_mutex_held`.
    pub(crate) prev_mutex_held: Option<MutexId>,
}

impl fmt::Debug for MutexCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexCb")
            .field("name", &self.name)
            .field("mutex_type", &self.mutex_type)
            .field("protocol", &self.protocol)
            .field("owner", &self.owner)
            .field("count", &self.count)
            .field("inconsistent", &self.inconsistent)
            .finish_non_exhaustive()
    }
}

/// Handle to a mutex.
pub struct Mutex<P: Port> {
    kernel: &'static Kernel<P>,
    id: MutexId,
}

impl<P: Port> Clone for Mutex<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for Mutex<P> {}

impl<P: Port> fmt::Debug for Mutex<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Mutex").field(&self.id.0).finish()
    }
}

impl<P: Port> Mutex<P> {
    /// Create a mutex.
    pub fn new(kernel: &'static Kernel<P>, attr: MutexAttributes) -> Result<Self> {
        #[cfg(not(feature = "mutex-inherit"))]
        if attr.protocol == MutexProtocol::Inherit {
            return Err(ResultCode::ErrorParameter);
        }
        #[cfg(not(feature = "mutex-protect"))]
        if attr.protocol == MutexProtocol::Protect {
            return Err(ResultCode::ErrorParameter);
        }
        #[cfg(not(feature = "robust-mutex"))]
        if attr.robustness == MutexRobustness::Robust {
            return Err(ResultCode::ErrorParameter);
        }
        if attr.protocol == MutexProtocol::Protect
            && (attr.priority_ceiling as usize) >= cfg::MAX_PRIORITY_BANDS
        {
            return Err(ResultCode::ErrorValue);
        }

        let mut lock = klock::lock_cpu(kernel);
        let id = if let Some(pos) = lock.mutexes.iter().position(|cb| !cb.in_use) {
            MutexId(pos)
        } else {
            if lock.mutexes.is_full() {
                return Err(ResultCode::ErrorNoMemory);
            }
            let id = MutexId(lock.mutexes.len());
            lock.mutexes.push(MutexCb::unused());
            id
        };
        lock[id] = MutexCb {
            in_use: true,
            name: attr.name,
            mutex_type: attr.mutex_type,
            protocol: attr.protocol,
            robustness: attr.robustness,
            ceiling: attr.priority_ceiling,
            owner: None,
            count: 0,
            inconsistent: false,
            wait_queue: PrioList::new(),
            prev_mutex_held: None,
        };
        Ok(Self { kernel, id })
    }

    /// Acquire the mutex, blocking while another thread owns it.
    pub fn lock(&self) -> Result {
        self.timed_lock(cfg::WAIT_FOREVER)
    }

    /// Acquire the mutex or fail immediately with [`ResultCode::EAGAIN`].
    pub fn try_lock(&self) -> Result {
        self.timed_lock(0)
    }

    /// Acquire the mutex, giving up after `ticks` tick periods with
    /// [`ResultCode::ETIMEDOUT`]. `0` means non-blocking.
    pub fn timed_lock(&self, ticks: u64) -> Result {
        let mut lock = klock::lock_cpu_as_current(self.kernel);
        state::expect_waitable_context(self.kernel, &lock)?;
        lock = thread::cancellation_point(self.kernel, lock);
        let me = lock.running_thread.unwrap();
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }

        if lock[self.id].owner == Some(me) {
            return match lock[self.id].mutex_type {
                MutexType::Recursive => {
                    lock[self.id].count = lock[self.id].count.saturating_add(1);
                    Ok(())
                }
                // A relock would self-deadlock; report it instead.
                MutexType::Normal | MutexType::Errorcheck => Err(ResultCode::ErrorResource),
            };
        }

        if lock[self.id].protocol == MutexProtocol::Protect
            && lock[me].base_priority > lock[self.id].ceiling
        {
            return Err(ResultCode::ErrorPriority);
        }

        if lock[self.id].owner.is_none() {
            lock_core(&mut lock, self.id, me);
            return consume_inconsistent(&mut lock, self.id);
        }

        // Contended.
        if ticks == 0 {
            return Err(ResultCode::EAGAIN);
        }
        #[cfg(feature = "mutex-inherit")]
        if lock[self.id].protocol == MutexProtocol::Inherit {
            let priority = lock[me].effective_priority;
            boost_owner_chain(&mut lock, self.id, priority);
        }
        let deadline = if ticks == cfg::WAIT_FOREVER {
            None
        } else {
            Some(lock.tick_count + ticks)
        };
        let (mut lock, reason, _payload) =
            wait::block_current(self.kernel, lock, WaitPayload::Mutex(self.id), deadline);
        match reason {
            // Ownership was transferred to us by the unlocking thread.
            ResultCode::Success => consume_inconsistent(&mut lock, self.id),
            reason => Err(reason),
        }
    }

    /// Release the mutex. For a recursive mutex, the lock is released when
    /// the count returns to zero; ownership then passes to the
    /// highest-priority waiter.
    pub fn unlock(&self) -> Result {
        let mut lock = klock::lock_cpu_as_current(self.kernel);
        state::expect_task_context(self.kernel, &lock)?;
        let me = lock.running_thread.unwrap();
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        if lock[self.id].owner != Some(me) {
            return Err(ResultCode::ErrorResource);
        }
        if lock[self.id].count > 1 {
            lock[self.id].count -= 1;
            return Ok(());
        }

        unlink_held(&mut lock, me, self.id);
        lock[self.id].count = 0;

        // Revert any protocol boost contributed by this mutex.
        let base = lock[me].base_priority;
        let effective = evaluate_effective_priority(&mut lock, me, base);
        lock[me].effective_priority = effective;

        transfer_or_release(&mut lock, self.id);
        thread::unlock_cpu_and_check_preemption(self.kernel, lock);
        Ok(())
    }

    /// Restore a robust mutex to service after owner-death recovery.
    ///
    /// Fails with [`ResultCode::ErrorResource`] unless the mutex is in the
    /// inconsistent state and owned by the caller.
    pub fn consistent(&self) -> Result {
        let mut lock = klock::lock_cpu_as_current(self.kernel);
        state::expect_task_context(self.kernel, &lock)?;
        let me = lock.running_thread.unwrap();
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let cb = &mut lock[self.id];
        if !cb.inconsistent || cb.owner != Some(me) {
            return Err(ResultCode::ErrorResource);
        }
        cb.inconsistent = false;
        Ok(())
    }

    /// Whether some thread currently owns the mutex.
    pub fn is_locked(&self) -> bool {
        let lock = klock::lock_cpu(self.kernel);
        lock[self.id].in_use && lock[self.id].owner.is_some()
    }

    pub(crate) fn raw_id(&self) -> MutexId {
        self.id
    }
}

/// Release a mutex on behalf of a condition-variable wait: unlink it from
/// the owner, revert the protocol boost, and hand it to the next waiter.
/// The caller has already validated ownership.
pub(crate) fn release_for_condvar<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    mutex: MutexId,
    owner: ThreadId,
) {
    debug_assert_eq!(lock[mutex].owner, Some(owner));
    unlink_held(lock, owner, mutex);
    lock[mutex].count = 0;
    let base = lock[owner].base_priority;
    let effective = evaluate_effective_priority(lock, owner, base);
    lock[owner].effective_priority = effective;
    transfer_or_release(lock, mutex);
}

impl MutexCb {
    fn unused() -> Self {
        Self {
            in_use: false,
            name: "",
            mutex_type: MutexType::Normal,
            protocol: MutexProtocol::None,
            robustness: MutexRobustness::Stalled,
            ceiling: thread::priority::MAX,
            owner: None,
            count: 0,
            inconsistent: false,
            wait_queue: PrioList::new(),
            prev_mutex_held: None,
        }
    }
}

/// Give the ownership of the mutex to `to`, pushing it onto the thread's
/// held list and applying the locking protocol's boost.
///
/// `to` must be Running (direct acquisition) or Waiting (transfer by the
/// unlocking thread, before the wake).
fn lock_core<P: Port>(lock: &mut CpuLockGuard<'_, P>, mutex: MutexId, to: ThreadId) {
    debug_assert!(matches!(
        lock[to].st,
        ThreadState::Running | ThreadState::Waiting
    ));
    let prev = lock[to].last_mutex_held.replace(mutex);
    lock[mutex].prev_mutex_held = prev;
    lock[mutex].owner = Some(to);
    lock[mutex].count = 1;

    let boost = match lock[mutex].protocol {
        MutexProtocol::Protect => Some(lock[mutex].ceiling),
        // Remaining waiters keep boosting the new owner.
        MutexProtocol::Inherit => lock[mutex].wait_queue.first().map(|e| e.priority),
        MutexProtocol::None => None,
    };
    if let Some(boost) = boost {
        if boost > lock[to].effective_priority {
            lock[to].effective_priority = boost;
        }
    }
}

/// Wake the next waiter as the new owner, or mark the mutex free.
fn transfer_or_release<P: Port>(lock: &mut CpuLockGuard<'_, P>, mutex: MutexId) {
    if let Some(next) = lock[mutex].wait_queue.pop_highest() {
        lock_core(lock, mutex, next);
        wait::complete_wake(lock, next, ResultCode::Success);
    } else {
        lock[mutex].owner = None;
        lock[mutex].count = 0;
    }
}

/// Report the inconsistent state of a robust mutex to its (new) owner.
fn consume_inconsistent<P: Port>(lock: &mut CpuLockGuard<'_, P>, mutex: MutexId) -> Result {
    if lock[mutex].inconsistent {
        Err(ResultCode::ErrorOs)
    } else {
        Ok(())
    }
}

/// Unlink `mutex` from `owner`'s held list, wherever it sits.
fn unlink_held<P: Port>(lock: &mut CpuLockGuard<'_, P>, owner: ThreadId, mutex: MutexId) {
    let after = lock[mutex].prev_mutex_held.take();
    if lock[owner].last_mutex_held == Some(mutex) {
        lock[owner].last_mutex_held = after;
        return;
    }
    let mut cursor = lock[owner].last_mutex_held;
    while let Some(c) = cursor {
        let next = lock[c].prev_mutex_held;
        if next == Some(mutex) {
            lock[c].prev_mutex_held = after;
            return;
        }
        cursor = next;
    }
    debug_assert!(false, "mutex not on the owner's held list");
}

/// Recompute a thread's dynamic priority from its base priority and the
/// locking protocols of every mutex it holds.
pub(crate) fn evaluate_effective_priority<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    thread: ThreadId,
    base_priority: u8,
) -> u8 {
    let mut effective = base_priority;
    let mut cursor = lock[thread].last_mutex_held;
    while let Some(id) = cursor {
        let cb = &lock[id];
        match cb.protocol {
            MutexProtocol::Protect => effective = effective.max(cb.ceiling),
            MutexProtocol::Inherit => {
                if let Some(head) = cb.wait_queue.first() {
                    effective = effective.max(head.priority);
                }
            }
            MutexProtocol::None => {}
        }
        cursor = cb.prev_mutex_held;
    }
    effective
}

/// Check that raising a thread's base priority to `new_base` does not
/// violate the ceiling of any mutex it holds or is waiting for.
#[cfg(feature = "mutex-protect")]
pub(crate) fn held_mutexes_allow_base_priority<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    thread: ThreadId,
    new_base: u8,
) -> bool {
    let ceiling_ok = |cb: &MutexCb| cb.protocol != MutexProtocol::Protect || cb.ceiling >= new_base;

    if let Some(WaitPayload::Mutex(waited)) = lock[thread].wait {
        if !ceiling_ok(&lock[waited]) {
            return false;
        }
    }
    let mut cursor = lock[thread].last_mutex_held;
    while let Some(id) = cursor {
        if !ceiling_ok(&lock[id]) {
            return false;
        }
        cursor = lock[id].prev_mutex_held;
    }
    true
}

/// Propagate a waiter's priority to the owner of `mutex`, walking through
/// the chain of mutexes the owners themselves are blocked on.
///
/// The walk is bounded by the number of mutexes held chain-wise and
/// terminates on cycle detection; a cycle implies a mutex deadlock and is
/// logged as such.
#[cfg(feature = "mutex-inherit")]
pub(crate) fn boost_owner_chain<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    mutex: MutexId,
    priority: u8,
) {
    let origin = mutex;
    let mut current = mutex;
    let mut depth = 0;
    loop {
        if lock[current].protocol != MutexProtocol::Inherit {
            break;
        }
        let Some(owner) = lock[current].owner else {
            break;
        };
        if lock[owner].effective_priority >= priority {
            break;
        }
        lock[owner].effective_priority = priority;
        match lock[owner].st {
            ThreadState::Ready => {
                lock.ready_queue.reorder(owner, priority);
                break;
            }
            ThreadState::Waiting => {
                wait::reorder_wait_of_thread(lock, owner, priority);
                if let Some(WaitPayload::Mutex(next)) = lock[owner].wait {
                    depth += 1;
                    if next == origin || depth >= cfg::MAX_MUTEXES {
                        log::error!(
                            "priority inheritance cycle through {:?}: {}",
                            next,
                            crate::strerror(ResultCode::ErrorOs)
                        );
                        break;
                    }
                    current = next;
                    continue;
                }
                break;
            }
            ThreadState::Running | ThreadState::Inactive => break,
        }
    }
}

/// Release every mutex held by a terminating thread, marking robust ones
/// inconsistent and handing each to its next waiter.
pub(crate) fn abandon_held_mutexes<P: Port>(lock: &mut CpuLockGuard<'_, P>, thread: ThreadId) {
    let mut cursor = lock[thread].last_mutex_held.take();
    while let Some(id) = cursor {
        cursor = lock[id].prev_mutex_held.take();
        lock[id].count = 0;
        lock[id].owner = None;
        if lock[id].robustness == MutexRobustness::Robust {
            lock[id].inconsistent = true;
        }
        transfer_or_release(lock, id);
    }
}

/// Recompute the owner's boost after a waiter left the wait queue without
/// acquiring the mutex (timeout, interruption, or cancellation).
pub(crate) fn on_waiter_removed<P: Port>(lock: &mut CpuLockGuard<'_, P>, mutex: MutexId) {
    if lock[mutex].protocol != MutexProtocol::Inherit {
        return;
    }
    let Some(owner) = lock[mutex].owner else {
        return;
    };
    let base = lock[owner].base_priority;
    let effective = evaluate_effective_priority(lock, owner, base);
    if effective != lock[owner].effective_priority {
        lock[owner].effective_priority = effective;
        match lock[owner].st {
            ThreadState::Ready => {
                lock.ready_queue.reorder(owner, effective);
            }
            ThreadState::Waiting => wait::reorder_wait_of_thread(lock, owner, effective),
            ThreadState::Running | ThreadState::Inactive => {}
        }
    }
}
