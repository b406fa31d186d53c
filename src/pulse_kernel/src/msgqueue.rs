//! Message queues
//!
//! A bounded ring of word-sized messages (a pointer or a 32-bit value).
//! Messages are FIFO; blocked producers and consumers are released in
//! priority order, FIFO within a band. When a consumer is already waiting,
//! `put` hands the message over directly without touching the ring.
use core::fmt;
use core::ptr;

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock::{self, CpuLockGuard},
    state, thread,
    wait::{self, PrioList, WaitPayload},
    Kernel, Port, QueueId,
};

/// Creation attributes for a message queue.
#[derive(Clone, Copy, Default)]
pub struct MessageQueueAttributes {
    pub name: &'static str,
}

/// *Message queue control block* - the state data of a message queue.
pub(crate) struct QueueCb {
    pub(crate) in_use: bool,
    pub(crate) name: &'static str,

    pub(crate) buf: *mut usize,
    pub(crate) capacity: usize,
    pub(crate) head: usize,
    pub(crate) len: usize,

    /// Producers blocked on a full ring.
    pub(crate) send_queue: PrioList,
    /// Consumers blocked on an empty ring.
    pub(crate) recv_queue: PrioList,

    /// In-progress flag for ISR-level invocations on this object.
    pub(crate) isr_busy: bool,
}

impl fmt::Debug for QueueCb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueCb")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl QueueCb {
    fn push(&mut self, msg: usize) {
        debug_assert!(self.len < self.capacity);
        let slot = (self.head + self.len) % self.capacity;
        // Safety: `slot < capacity`, and `buf` spans `capacity` words.
        unsafe { *self.buf.add(slot) = msg };
        self.len += 1;
    }

    fn pop(&mut self) -> usize {
        debug_assert!(self.len > 0);
        // Safety: `head < capacity`, and `buf` spans `capacity` words.
        let msg = unsafe { *self.buf.add(self.head) };
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        msg
    }
}

/// Handle to a message queue.
pub struct MessageQueue<P: Port> {
    kernel: &'static Kernel<P>,
    id: QueueId,
}

impl<P: Port> Clone for MessageQueue<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for MessageQueue<P> {}

impl<P: Port> fmt::Debug for MessageQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MessageQueue").field(&self.id.0).finish()
    }
}

impl<P: Port> MessageQueue<P> {
    pub(crate) fn from_raw(kernel: &'static Kernel<P>, id: QueueId) -> Self {
        Self { kernel, id }
    }

    /// Create a message queue over `storage`; its length is the queue's
    /// capacity.
    pub fn new(
        kernel: &'static Kernel<P>,
        attr: MessageQueueAttributes,
        storage: &'static mut [usize],
    ) -> Result<Self> {
        let mut lock = klock::lock_cpu(kernel);
        let id = register_queue(&mut lock, attr.name, storage.as_mut_ptr(), storage.len())?;
        Ok(Self { kernel, id })
    }

    /// Enqueue a message, blocking up to `ticks` tick periods while the
    /// ring is full. `0` means non-blocking ([`ResultCode::EAGAIN`] when
    /// full) and is the only form permitted from an ISR.
    pub fn put(&self, msg: usize, ticks: u64) -> Result {
        if self.kernel.port().is_in_irq() && ticks != 0 {
            return Err(ResultCode::ErrorIsr);
        }
        let mut lock = if ticks != 0 {
            klock::lock_cpu_as_current(self.kernel)
        } else {
            klock::lock_cpu(self.kernel)
        };
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        if ticks != 0 {
            state::expect_waitable_context(self.kernel, &lock)?;
            lock = thread::cancellation_point(self.kernel, lock);
        }
        let outcome = with_isr_claim(self.kernel, &mut lock, self.id, |lock| {
            put_core(lock, self.id, msg)
        })?;
        match outcome {
            PutOutcome::Delivered { woke_consumer } => {
                if woke_consumer {
                    thread::unlock_cpu_and_check_preemption(self.kernel, lock);
                }
                Ok(())
            }
            PutOutcome::Full => {
                if ticks == 0 {
                    return Err(ResultCode::EAGAIN);
                }
                let deadline = if ticks == cfg::WAIT_FOREVER {
                    None
                } else {
                    Some(lock.tick_count + ticks)
                };
                let (_lock, reason, _payload) = wait::block_current(
                    self.kernel,
                    lock,
                    WaitPayload::QueueSend {
                        queue: self.id,
                        msg,
                    },
                    deadline,
                );
                match reason {
                    // A consumer moved our message into the ring.
                    ResultCode::Success => Ok(()),
                    reason => Err(reason),
                }
            }
        }
    }

    /// Dequeue a message, blocking up to `ticks` tick periods while the
    /// ring is empty. `0` means non-blocking ([`ResultCode::EAGAIN`] when
    /// empty) and is the only form permitted from an ISR.
    pub fn get(&self, ticks: u64) -> Result<usize> {
        if self.kernel.port().is_in_irq() && ticks != 0 {
            return Err(ResultCode::ErrorIsr);
        }
        let mut lock = if ticks != 0 {
            klock::lock_cpu_as_current(self.kernel)
        } else {
            klock::lock_cpu(self.kernel)
        };
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        if ticks != 0 {
            state::expect_waitable_context(self.kernel, &lock)?;
            lock = thread::cancellation_point(self.kernel, lock);
        }
        let taken = with_isr_claim(self.kernel, &mut lock, self.id, |lock| {
            get_core(lock, self.id)
        })?;
        if let Some((msg, woke_producer)) = taken {
            if woke_producer {
                thread::unlock_cpu_and_check_preemption(self.kernel, lock);
            }
            return Ok(msg);
        }
        if ticks == 0 {
            return Err(ResultCode::EAGAIN);
        }
        let deadline = if ticks == cfg::WAIT_FOREVER {
            None
        } else {
            Some(lock.tick_count + ticks)
        };
        let (_lock, reason, payload) = wait::block_current(
            self.kernel,
            lock,
            WaitPayload::QueueRecv {
                queue: self.id,
                msg: 0,
                filled: false,
            },
            deadline,
        );
        match reason {
            ResultCode::Success => match payload {
                WaitPayload::QueueRecv { msg, filled: true, .. } => Ok(msg),
                _ => Err(ResultCode::ErrorOs),
            },
            reason => Err(reason),
        }
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        let lock = klock::lock_cpu(self.kernel);
        lock[self.id].len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        let lock = klock::lock_cpu(self.kernel);
        lock[self.id].capacity
    }
}

pub(crate) enum PutOutcome {
    Delivered { woke_consumer: bool },
    Full,
}

/// Deliver a message: directly to a waiting consumer, else into the ring.
pub(crate) fn put_core<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    queue: QueueId,
    msg: usize,
) -> PutOutcome {
    if let Some(consumer) = lock[queue].recv_queue.pop_highest() {
        // A waiting consumer implies an empty ring; hand the message over.
        debug_assert_eq!(lock[queue].len, 0);
        match lock[consumer].wait.as_mut() {
            Some(WaitPayload::QueueRecv { msg: slot, filled, .. }) => {
                *slot = msg;
                *filled = true;
            }
            _ => unreachable!("consumer queued without a receive payload"),
        }
        wait::complete_wake(lock, consumer, ResultCode::Success);
        return PutOutcome::Delivered { woke_consumer: true };
    }
    if lock[queue].len < lock[queue].capacity {
        lock[queue].push(msg);
        PutOutcome::Delivered {
            woke_consumer: false,
        }
    } else {
        PutOutcome::Full
    }
}

/// Take a message from the ring; if a producer was blocked, move its
/// message in behind and wake it.
pub(crate) fn get_core<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    queue: QueueId,
) -> Option<(usize, bool)> {
    if lock[queue].len == 0 {
        return None;
    }
    let msg = lock[queue].pop();
    let mut woke_producer = false;
    if let Some(producer) = lock[queue].send_queue.pop_highest() {
        let pending = match lock[producer].wait {
            Some(WaitPayload::QueueSend { msg, .. }) => msg,
            _ => unreachable!("producer queued without a send payload"),
        };
        lock[queue].push(pending);
        wait::complete_wake(lock, producer, ResultCode::Success);
        woke_producer = true;
    }
    Some((msg, woke_producer))
}

/// Register a queue over `base..base+capacity` words.
pub(crate) fn register_queue<P: Port>(
    lock: &mut CpuLockGuard<'_, P>,
    name: &'static str,
    base: *mut usize,
    capacity: usize,
) -> Result<QueueId> {
    if capacity == 0 {
        return Err(ResultCode::ErrorParameter);
    }
    let id = if let Some(pos) = lock.queues.iter().position(|cb| !cb.in_use) {
        QueueId(pos)
    } else {
        if lock.queues.is_full() {
            return Err(ResultCode::ErrorNoMemory);
        }
        let id = QueueId(lock.queues.len());
        lock.queues.push(QueueCb {
            in_use: false,
            name: "",
            buf: ptr::null_mut(),
            capacity: 0,
            head: 0,
            len: 0,
            send_queue: PrioList::new(),
            recv_queue: PrioList::new(),
            isr_busy: false,
        });
        id
    };
    lock[id] = QueueCb {
        in_use: true,
        name,
        buf: base,
        capacity,
        head: 0,
        len: 0,
        send_queue: PrioList::new(),
        recv_queue: PrioList::new(),
        isr_busy: false,
    };
    Ok(id)
}

/// Run `f` with the queue's ISR in-progress flag claimed when the caller
/// is an interrupt handler; the flag is released on every path out of `f`.
/// A second interrupt-level call on the same object while one is in
/// progress fails with [`ResultCode::ErrorIsrRecursive`].
fn with_isr_claim<'a, P: Port, R>(
    kernel: &Kernel<P>,
    lock: &mut CpuLockGuard<'a, P>,
    id: QueueId,
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
