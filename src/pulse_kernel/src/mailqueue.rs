//! Mail queues
//!
//! A mail queue composes a message queue with a memory pool: a *mail* is a
//! fixed-size block allocated from the pool, passed through the queue by
//! address. Ownership of a block rests with the allocator until `put`,
//! then with the receiver until `free`; there is no automatic transfer
//! back, and `free` rejects double-frees and foreign blocks.
use core::fmt;
use core::ptr::{self, NonNull};

use crate::{
    cfg,
    error::{Result, ResultCode},
    klock,
    mempool, msgqueue, state, thread,
    wait::{self, WaitPayload},
    Kernel, MailQueueId, PoolId, Port,
};

/// Creation attributes for a mail queue.
#[derive(Clone, Copy, Default)]
pub struct MailQueueAttributes {
    pub name: &'static str,
}

/// *Mail queue control block* - a pool and a ring, created together.
#[derive(Debug)]
pub(crate) struct MailQueueCb {
    pub(crate) in_use: bool,
    pub(crate) name: &'static str,
    pub(crate) pool: PoolId,
    pub(crate) queue: crate::QueueId,
}

/// Handle to a mail queue.
pub struct MailQueue<P: Port> {
    kernel: &'static Kernel<P>,
    id: MailQueueId,
}

impl<P: Port> Clone for MailQueue<P> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<P: Port> Copy for MailQueue<P> {}

impl<P: Port> fmt::Debug for MailQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MailQueue").field(&self.id.0).finish()
    }
}

impl<P: Port> MailQueue<P> {
    /// Create a mail queue of `count` mails of `mail_size` bytes.
    ///
    /// `pool_storage` backs the mail blocks (sized like a [`Pool`] of
    /// `count` × `mail_size`), `ring_storage` backs the queue and must hold
    /// at least `count` words.
    ///
    /// [`Pool`]: crate::mempool::Pool
    pub fn new(
        kernel: &'static Kernel<P>,
        attr: MailQueueAttributes,
        count: usize,
        mail_size: usize,
        pool_storage: &'static mut [u8],
        ring_storage: &'static mut [usize],
    ) -> Result<Self> {
        if ring_storage.len() < count {
            return Err(ResultCode::ErrorValue);
        }
        let mut lock = klock::lock_cpu(kernel);
        let pool = mempool::register_pool(
            &mut lock,
            attr.name,
            mail_size,
            count,
            pool_storage.as_mut_ptr(),
            pool_storage.len(),
        )?;
        let queue = msgqueue::register_queue(&mut lock, attr.name, ring_storage.as_mut_ptr(), count)?;

        let id = if let Some(pos) = lock.mail_queues.iter().position(|cb| !cb.in_use) {
            MailQueueId(pos)
        } else {
            if lock.mail_queues.is_full() {
                return Err(ResultCode::ErrorNoMemory);
            }
            let id = MailQueueId(lock.mail_queues.len());
            lock.mail_queues.push(MailQueueCb {
                in_use: false,
                name: "",
                pool,
                queue,
            });
            id
        };
        lock[id] = MailQueueCb {
            in_use: true,
            name: attr.name,
            pool,
            queue,
        };
        Ok(Self { kernel, id })
    }

    /// Obtain a mail block, blocking up to `ticks` tick periods while the
    /// pool is exhausted. `0` means non-blocking and is the only form
    /// permitted from an ISR.
    pub fn alloc(&self, ticks: u64) -> Result<NonNull<u8>> {
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
        let pool = lock[self.id].pool;
        if let Some(block) = mempool::alloc_block(&mut lock, pool) {
            return NonNull::new(block).ok_or(ResultCode::ErrorOs);
        }
        if ticks == 0 {
            return Err(ResultCode::EAGAIN);
        }
        state::expect_waitable_context(self.kernel, &lock)?;
        lock = thread::cancellation_point(self.kernel, lock);

        let deadline = if ticks == cfg::WAIT_FOREVER {
            None
        } else {
            Some(lock.tick_count + ticks)
        };
        let (_lock, reason, payload) =
            wait::block_current(self.kernel, lock, WaitPayload::MailAlloc { pool, block: 0 }, deadline);
        match reason {
            // `free` handed its block straight to us.
            ResultCode::Success => match payload {
                WaitPayload::MailAlloc { block, .. } if block != 0 => {
                    Ok(NonNull::new(block as *mut u8).unwrap())
                }
                _ => Err(ResultCode::ErrorOs),
            },
            reason => Err(reason),
        }
    }

    /// Like [`MailQueue::alloc`], but the block is zero-filled.
    pub fn calloc(&self, ticks: u64) -> Result<NonNull<u8>> {
        let block = self.alloc(ticks)?;
        let lock = klock::lock_cpu(self.kernel);
        let size = lock[lock[self.id].pool].block_size;
        drop(lock);
        // Safety: the block is ours until `put` and spans `block_size`
        // bytes.
        unsafe { ptr::write_bytes(block.as_ptr(), 0, size) };
        Ok(block)
    }

    /// Send a mail block previously obtained from [`MailQueue::alloc`].
    /// Ownership passes to the eventual receiver.
    ///
    /// ISR-safe: the ring always has room for every block of the pool, so
    /// this never blocks.
    pub fn put(&self, block: NonNull<u8>) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let (pool, queue) = (lock[self.id].pool, lock[self.id].queue);
        mempool::validate_block(&lock, pool, block.as_ptr())?;

        match msgqueue::put_core(&mut lock, queue, block.as_ptr() as usize) {
            msgqueue::PutOutcome::Delivered { woke_consumer } => {
                if woke_consumer {
                    thread::unlock_cpu_and_check_preemption(self.kernel, lock);
                }
                Ok(())
            }
            // Unreachable by construction: ring capacity == pool capacity.
            msgqueue::PutOutcome::Full => Err(ResultCode::ErrorOs),
        }
    }

    /// Receive a mail block, blocking up to `ticks` tick periods while the
    /// queue is empty. The receiver owns the block and must pass it to
    /// [`MailQueue::free`] when done.
    pub fn get(&self, ticks: u64) -> Result<NonNull<u8>> {
        let lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let queue = lock[self.id].queue;
        drop(lock);
        let queue_handle = msgqueue::MessageQueue::from_raw(self.kernel, queue);
        let msg = queue_handle.get(ticks)?;
        NonNull::new(msg as *mut u8).ok_or(ResultCode::ErrorOs)
    }

    /// Return a received mail block to the pool. Double-frees and blocks
    /// foreign to this mail queue fail with [`ResultCode::ErrorValue`].
    ///
    /// ISR-safe.
    pub fn free(&self, block: NonNull<u8>) -> Result {
        let mut lock = klock::lock_cpu(self.kernel);
        if !lock[self.id].in_use {
            return Err(ResultCode::ErrorParameter);
        }
        let pool = lock[self.id].pool;
        mempool::validate_block(&lock, pool, block.as_ptr())?;
        if mempool::is_on_free_list(&lock, pool, block.as_ptr()) {
            return Err(ResultCode::ErrorValue);
        }

        // A blocked allocator takes the block directly; otherwise it goes
        // back on the free list.
        if let Some(waiter) = lock[pool].wait_queue.pop_highest() {
            match lock[waiter].wait.as_mut() {
                Some(WaitPayload::MailAlloc { block: slot, .. }) => {
                    *slot = block.as_ptr() as usize;
                }
                _ => unreachable!("allocator queued without a mail payload"),
            }
            wait::complete_wake(&mut lock, waiter, ResultCode::Success);
            thread::unlock_cpu_and_check_preemption(self.kernel, lock);
            return Ok(());
        }
        mempool::free_block(&mut lock, pool, block.as_ptr())
    }

    /// The size of each mail block in bytes.
    pub fn mail_size(&self) -> usize {
        let lock = klock::lock_cpu(self.kernel);
        lock[lock[self.id].pool].block_size
    }
}
