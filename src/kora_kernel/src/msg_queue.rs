//! Message queues: fixed-size items with blocking producers and consumers.
//!
//! Reading is split into `front` (copy out without removing) and `pop`
//! (remove and wake a writer), so a consumer can parse an item in place
//! before committing to its removal.
//!
//! `waitfor_push` exists for the shared-buffer pattern: when the payload is
//! a pointer into a buffer that is filled in under a critical section, the
//! producer first waits for space, then prepares the buffer and publishes
//! the pointer with `overwrite` without a second blocking point.
use core::ptr::NonNull;

use crate::{
    cfg,
    error::{
        BadIdError, CreateMsgQueueError, DeleteMsgQueueError, OverwriteMsgQueueError,
        PopMsgQueueError, RecvMsgQueueError, SendMsgQueueError, TryRecvMsgQueueError,
        TrySendMsgQueueError,
    },
    heap, itemq::ItemQueue, klock,
    klock::{CpuLockCell, CpuLockGuard},
    list::ListRef,
    state, task, wait,
    wait::Deadline,
    utils::Init,
    Id, PortThreading,
};

pub type MsgQueueId = Id;

/// *Message queue control block*.
pub(crate) struct MsgQueueCb<Traits> {
    pub(crate) active: CpuLockCell<Traits, bool>,
    pub(crate) queue: CpuLockCell<Traits, ItemQueue>,
    pub(crate) buf_heap_backed: CpuLockCell<Traits, bool>,
}

impl<Traits> Init for MsgQueueCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        active: Init::INIT,
        queue: Init::INIT,
        buf_heap_backed: Init::INIT,
    };
}

struct Lists {
    readers: ListRef,
    writers: ListRef,
}

fn msg_queue_cb<Traits: PortThreading>(
    lock: &CpuLockGuard<Traits>,
    queue: MsgQueueId,
) -> Result<(&'static MsgQueueCb<Traits>, Lists), BadIdError> {
    let index = queue.get() - 1;
    let cb = Traits::state()
        .msg_queues
        .get(index)
        .ok_or(BadIdError::BadId)?;
    if !cb.active.get(&**lock) {
        return Err(BadIdError::BadId);
    }
    Ok((
        cb,
        Lists {
            readers: ListRef::msgq_readers(index),
            writers: ListRef::msgq_writers(index),
        },
    ))
}

/// Create a message queue of `capacity` items of `item_size` bytes, with
/// storage carved from the kernel heap.
pub fn create<Traits: PortThreading>(
    capacity: usize,
    item_size: usize,
) -> Result<MsgQueueId, CreateMsgQueueError> {
    if capacity == 0 || item_size == 0 {
        return Err(CreateMsgQueueError::Invalid);
    }

    let storage = heap::allocate::<Traits>(capacity * item_size)?;
    // Safety: the storage region is freshly allocated and exclusively ours
    let result = unsafe {
        create_in::<Traits>(storage.as_ptr(), capacity, item_size, true)
    };
    if result.is_err() {
        let _ = heap::free::<Traits>(storage);
    }
    result
}

/// Create a message queue over a caller-provided storage region of
/// `capacity * item_size` bytes.
///
/// # Safety
///
/// The region must stay valid and unaliased for the queue's lifetime.
pub unsafe fn create_with_buffer<Traits: PortThreading>(
    storage: *mut u8,
    capacity: usize,
    item_size: usize,
) -> Result<MsgQueueId, CreateMsgQueueError> {
    if capacity == 0 || item_size == 0 {
        return Err(CreateMsgQueueError::Invalid);
    }
    unsafe { create_in::<Traits>(storage, capacity, item_size, false) }
}

unsafe fn create_in<Traits: PortThreading>(
    storage: *mut u8,
    capacity: usize,
    item_size: usize,
    heap_backed: bool,
) -> Result<MsgQueueId, CreateMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    crate::init_state_if_needed::<Traits>(lock.borrow_mut());
    let kernel = Traits::state();

    let index = (0..cfg::NUM_MSG_QUEUES)
        .find(|&i| !kernel.msg_queues[i].active.get(&*lock))
        .ok_or(CreateMsgQueueError::OutOfMemory)?;
    let cb = &kernel.msg_queues[index];

    cb.active.replace(&mut *lock, true);
    // Safety: per this function's contract
    cb.queue
        .replace(&mut *lock, unsafe { ItemQueue::new(storage, capacity, item_size) });
    cb.buf_heap_backed.replace(&mut *lock, heap_backed);

    Ok(MsgQueueId::new(index + 1).unwrap())
}

/// Delete a message queue. Fails with `Busy` while it holds items or has
/// blocked readers or writers.
pub fn delete<Traits: PortThreading>(queue: MsgQueueId) -> Result<(), DeleteMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = msg_queue_cb(&lock, queue)?;
    let kernel = Traits::state();

    if cb.queue.read(&*lock).len() != 0
        || !kernel.lists.is_empty(lock.borrow_mut(), lists.readers)
        || !kernel.lists.is_empty(lock.borrow_mut(), lists.writers)
    {
        return Err(DeleteMsgQueueError::Busy);
    }

    if cb.buf_heap_backed.get(&*lock) {
        let base = cb.queue.read(&*lock).base() as *mut u8;
        let _ = heap::queue_free_with_lock::<Traits>(
            lock.borrow_mut(),
            NonNull::new(base).unwrap(),
        );
    }

    cb.active.replace(&mut *lock, false);
    Ok(())
}

/// Copy `item` into the queue, blocking while it is full.
pub fn send<Traits: PortThreading>(
    queue: MsgQueueId,
    item: &[u8],
) -> Result<(), SendMsgQueueError> {
    send_general::<Traits>(queue, item, None)
}

/// [`send`] with a deadline.
pub fn send_timeout<Traits: PortThreading>(
    queue: MsgQueueId,
    item: &[u8],
    ticks: u32,
) -> Result<(), SendMsgQueueError> {
    send_general::<Traits>(queue, item, Some(ticks))
}

fn send_general<Traits: PortThreading>(
    queue: MsgQueueId,
    item: &[u8],
    mut budget: Option<u32>,
) -> Result<(), SendMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, lists) = msg_queue_cb(&lock, queue)?;

    if item.len() != cb.queue.read(&*lock).item_size() {
        return Err(SendMsgQueueError::Invalid);
    }

    loop {
        if !cb.queue.read(&*lock).is_full() {
            cb.queue.write(&mut *lock).push_overwrite(item);
            wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.readers);
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        if budget == Some(0) {
            return Err(SendMsgQueueError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            lists.writers,
            Deadline::from_budget(budget),
            0,
        ) {
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(SendMsgQueueError::Timeout),
        }
    }
}

/// Copy `item` in only if the queue has room right now.
pub fn try_send<Traits: PortThreading>(
    queue: MsgQueueId,
    item: &[u8],
) -> Result<(), TrySendMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = msg_queue_cb(&lock, queue)?;

    if item.len() != cb.queue.read(&*lock).item_size() {
        return Err(TrySendMsgQueueError::Invalid);
    }
    if cb.queue.read(&*lock).is_full() {
        return Err(TrySendMsgQueueError::Full);
    }

    cb.queue.write(&mut *lock).push_overwrite(item);
    wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.readers);
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Block until the queue has room, without writing anything.
pub fn waitfor_push<Traits: PortThreading>(queue: MsgQueueId) -> Result<(), SendMsgQueueError> {
    waitfor_push_general::<Traits>(queue, None)
}

/// [`waitfor_push`] with a deadline.
pub fn waitfor_push_timeout<Traits: PortThreading>(
    queue: MsgQueueId,
    ticks: u32,
) -> Result<(), SendMsgQueueError> {
    waitfor_push_general::<Traits>(queue, Some(ticks))
}

fn waitfor_push_general<Traits: PortThreading>(
    queue: MsgQueueId,
    mut budget: Option<u32>,
) -> Result<(), SendMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, lists) = msg_queue_cb(&lock, queue)?;

    loop {
        if !cb.queue.read(&*lock).is_full() {
            return Ok(());
        }

        if budget == Some(0) {
            return Err(SendMsgQueueError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            lists.writers,
            Deadline::from_budget(budget),
            0,
        ) {
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(SendMsgQueueError::Timeout),
        }
    }
}

fn overwrite_core<Traits: PortThreading>(
    lock: &mut CpuLockGuard<Traits>,
    queue: MsgQueueId,
    item: &[u8],
) -> Result<(), OverwriteMsgQueueError> {
    let (cb, lists) = msg_queue_cb(lock, queue)?;

    if item.len() != cb.queue.read(&**lock).item_size() {
        return Err(OverwriteMsgQueueError::Invalid);
    }

    cb.queue.write(&mut **lock).push_overwrite(item);
    // the reader is woken even when the write replaced an unread item
    wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.readers);
    Ok(())
}

/// Write `item`, dropping the oldest unread item when the queue is full.
/// Never blocks.
pub fn overwrite<Traits: PortThreading>(
    queue: MsgQueueId,
    item: &[u8],
) -> Result<(), OverwriteMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    overwrite_core::<Traits>(&mut lock, queue, item)?;
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Interrupt-safe variant of [`overwrite`].
pub fn overwrite_isr<Traits: PortThreading>(
    queue: MsgQueueId,
    item: &[u8],
) -> Result<(), OverwriteMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    overwrite_core::<Traits>(&mut lock, queue, item)?;
    task::pend_switch_if_preempting::<Traits>(lock.borrow_mut());
    Ok(())
}

/// Copy the front item into `out` without removing it, blocking while the
/// queue is empty.
pub fn front<Traits: PortThreading>(
    queue: MsgQueueId,
    out: &mut [u8],
) -> Result<(), RecvMsgQueueError> {
    front_general::<Traits>(queue, out, None)
}

/// [`front`] with a deadline.
pub fn front_timeout<Traits: PortThreading>(
    queue: MsgQueueId,
    out: &mut [u8],
    ticks: u32,
) -> Result<(), RecvMsgQueueError> {
    front_general::<Traits>(queue, out, Some(ticks))
}

fn front_general<Traits: PortThreading>(
    queue: MsgQueueId,
    out: &mut [u8],
    mut budget: Option<u32>,
) -> Result<(), RecvMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, lists) = msg_queue_cb(&lock, queue)?;

    if out.len() != cb.queue.read(&*lock).item_size() {
        return Err(RecvMsgQueueError::Invalid);
    }

    loop {
        if cb.queue.read(&*lock).front(out) {
            return Ok(());
        }

        if budget == Some(0) {
            return Err(RecvMsgQueueError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            lists.readers,
            Deadline::from_budget(budget),
            0,
        ) {
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(RecvMsgQueueError::Timeout),
        }
    }
}

/// Copy the front item out only if one is immediately available.
pub fn try_front<Traits: PortThreading>(
    queue: MsgQueueId,
    out: &mut [u8],
) -> Result<(), TryRecvMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = msg_queue_cb(&lock, queue)?;

    if out.len() != cb.queue.read(&*lock).item_size() {
        return Err(TryRecvMsgQueueError::Invalid);
    }
    if cb.queue.read(&*lock).front(out) {
        Ok(())
    } else {
        Err(TryRecvMsgQueueError::Empty)
    }
}

/// Remove the front item and wake the longest-waiting writer.
pub fn pop<Traits: PortThreading>(queue: MsgQueueId) -> Result<(), PopMsgQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = msg_queue_cb(&lock, queue)?;

    if cb.queue.read(&*lock).len() > 0 {
        cb.queue.write(&mut *lock).pop();
        wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.writers);
        task::unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

/// Number of items currently queued.
pub fn len<Traits: PortThreading>(queue: MsgQueueId) -> Result<usize, PopMsgQueueError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = msg_queue_cb(&lock, queue)?;
    Ok(cb.queue.read(&*lock).len())
}
