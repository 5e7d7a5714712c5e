//! Stream queues: variable-length byte records with blocking producers and
//! consumers, built on the segmented byte buffer.
//!
//! Like the message queue, reading is split into `front`/`front_ptr` and
//! `pop`. `front_ptr` is the zero-copy path: it returns the record's
//! in-buffer address and length, valid until `pop`.
use core::ptr::NonNull;

use crate::{
    bytebuffer::{ByteBuffer, MAX_RECORD_LEN, RECORD_HEADER},
    cfg,
    error::{
        BadIdError, CreateStreamQueueError, DeleteStreamQueueError, FrontStreamQueueError,
        PopStreamQueueError, PushStreamQueueError, TryFrontStreamQueueError,
        TryPushStreamQueueError,
    },
    heap, klock,
    klock::{CpuLockCell, CpuLockGuard},
    list::ListRef,
    state, task, wait,
    wait::Deadline,
    utils::Init,
    Id, PortThreading,
};

pub type StreamQueueId = Id;

/// *Stream queue control block*.
pub(crate) struct StreamQueueCb<Traits> {
    pub(crate) active: CpuLockCell<Traits, bool>,
    pub(crate) buffer: CpuLockCell<Traits, ByteBuffer>,
    pub(crate) buf_heap_backed: CpuLockCell<Traits, bool>,
}

impl<Traits> Init for StreamQueueCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        active: Init::INIT,
        buffer: Init::INIT,
        buf_heap_backed: Init::INIT,
    };
}

struct Lists {
    readers: ListRef,
    writers: ListRef,
}

fn stream_queue_cb<Traits: PortThreading>(
    lock: &CpuLockGuard<Traits>,
    queue: StreamQueueId,
) -> Result<(&'static StreamQueueCb<Traits>, Lists), BadIdError> {
    let index = queue.get() - 1;
    let cb = Traits::state()
        .stream_queues
        .get(index)
        .ok_or(BadIdError::BadId)?;
    if !cb.active.get(&**lock) {
        return Err(BadIdError::BadId);
    }
    Ok((
        cb,
        Lists {
            readers: ListRef::sq_readers(index),
            writers: ListRef::sq_writers(index),
        },
    ))
}

/// Create a stream queue over `buf_size` bytes carved from the kernel
/// heap.
pub fn create<Traits: PortThreading>(
    buf_size: usize,
) -> Result<StreamQueueId, CreateStreamQueueError> {
    if buf_size <= RECORD_HEADER {
        return Err(CreateStreamQueueError::Invalid);
    }

    let storage = heap::allocate::<Traits>(buf_size)?;
    // Safety: the storage region is freshly allocated and exclusively ours
    let result = unsafe { create_in::<Traits>(storage.as_ptr(), buf_size, true) };
    if result.is_err() {
        let _ = heap::free::<Traits>(storage);
    }
    result
}

/// Create a stream queue over a caller-provided storage region.
///
/// # Safety
///
/// The region must stay valid and unaliased for the queue's lifetime.
pub unsafe fn create_with_buffer<Traits: PortThreading>(
    storage: *mut u8,
    buf_size: usize,
) -> Result<StreamQueueId, CreateStreamQueueError> {
    if buf_size <= RECORD_HEADER {
        return Err(CreateStreamQueueError::Invalid);
    }
    unsafe { create_in::<Traits>(storage, buf_size, false) }
}

unsafe fn create_in<Traits: PortThreading>(
    storage: *mut u8,
    buf_size: usize,
    heap_backed: bool,
) -> Result<StreamQueueId, CreateStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    crate::init_state_if_needed::<Traits>(lock.borrow_mut());
    let kernel = Traits::state();

    let index = (0..cfg::NUM_STREAM_QUEUES)
        .find(|&i| !kernel.stream_queues[i].active.get(&*lock))
        .ok_or(CreateStreamQueueError::OutOfMemory)?;
    let cb = &kernel.stream_queues[index];

    cb.active.replace(&mut *lock, true);
    // Safety: per this function's contract
    cb.buffer
        .replace(&mut *lock, unsafe { ByteBuffer::new(storage, buf_size) });
    cb.buf_heap_backed.replace(&mut *lock, heap_backed);

    Ok(StreamQueueId::new(index + 1).unwrap())
}

/// Delete a stream queue. Fails with `Busy` while it holds records or has
/// blocked readers or writers.
pub fn delete<Traits: PortThreading>(queue: StreamQueueId) -> Result<(), DeleteStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;
    let kernel = Traits::state();

    if cb.buffer.read(&*lock).count() != 0
        || !kernel.lists.is_empty(lock.borrow_mut(), lists.readers)
        || !kernel.lists.is_empty(lock.borrow_mut(), lists.writers)
    {
        return Err(DeleteStreamQueueError::Busy);
    }

    if cb.buf_heap_backed.get(&*lock) {
        let base = cb.buffer.read(&*lock).base() as *mut u8;
        let _ = heap::queue_free_with_lock::<Traits>(
            lock.borrow_mut(),
            NonNull::new(base).unwrap(),
        );
    }

    cb.active.replace(&mut *lock, false);
    Ok(())
}

/// Append a record, blocking while the buffer cannot take it.
pub fn push<Traits: PortThreading>(
    queue: StreamQueueId,
    data: &[u8],
) -> Result<(), PushStreamQueueError> {
    push_general::<Traits>(queue, data, None)
}

/// [`push`] with a deadline.
pub fn push_timeout<Traits: PortThreading>(
    queue: StreamQueueId,
    data: &[u8],
    ticks: u32,
) -> Result<(), PushStreamQueueError> {
    push_general::<Traits>(queue, data, Some(ticks))
}

fn push_general<Traits: PortThreading>(
    queue: StreamQueueId,
    data: &[u8],
    mut budget: Option<u32>,
) -> Result<(), PushStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;

    // a record that cannot fit even in an empty buffer would block
    // forever; one longer than the length prefix can encode never fits
    if data.len() > MAX_RECORD_LEN || data.len() + RECORD_HEADER > cb.buffer.read(&*lock).size() {
        return Err(PushStreamQueueError::Invalid);
    }

    loop {
        if cb.buffer.write(&mut *lock).push(data).is_ok() {
            wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.readers);
            task::unlock_cpu_and_check_preemption(lock);
            return Ok(());
        }

        if budget == Some(0) {
            return Err(PushStreamQueueError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            lists.writers,
            Deadline::from_budget(budget),
            0,
        ) {
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(PushStreamQueueError::Timeout),
        }
    }
}

/// Append a record only if it fits right now.
pub fn try_push<Traits: PortThreading>(
    queue: StreamQueueId,
    data: &[u8],
) -> Result<(), TryPushStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;

    if data.len() > MAX_RECORD_LEN || data.len() + RECORD_HEADER > cb.buffer.read(&*lock).size() {
        return Err(TryPushStreamQueueError::Invalid);
    }
    if cb.buffer.write(&mut *lock).push(data).is_err() {
        return Err(TryPushStreamQueueError::Full);
    }

    wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.readers);
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Interrupt-safe variant of [`try_push`].
pub fn push_isr<Traits: PortThreading>(
    queue: StreamQueueId,
    data: &[u8],
) -> Result<(), TryPushStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;

    if data.len() > MAX_RECORD_LEN || data.len() + RECORD_HEADER > cb.buffer.read(&*lock).size() {
        return Err(TryPushStreamQueueError::Invalid);
    }
    if cb.buffer.write(&mut *lock).push(data).is_err() {
        return Err(TryPushStreamQueueError::Full);
    }

    wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.readers);
    task::pend_switch_if_preempting::<Traits>(lock.borrow_mut());
    Ok(())
}

/// Copy the front record into `out`, blocking while the queue is empty.
/// Returns the record length.
pub fn front<Traits: PortThreading>(
    queue: StreamQueueId,
    out: &mut [u8],
) -> Result<usize, FrontStreamQueueError> {
    front_general::<Traits>(queue, out, None)
}

/// [`front`] with a deadline.
pub fn front_timeout<Traits: PortThreading>(
    queue: StreamQueueId,
    out: &mut [u8],
    ticks: u32,
) -> Result<usize, FrontStreamQueueError> {
    front_general::<Traits>(queue, out, Some(ticks))
}

fn front_general<Traits: PortThreading>(
    queue: StreamQueueId,
    out: &mut [u8],
    mut budget: Option<u32>,
) -> Result<usize, FrontStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;

    loop {
        if let Ok((ptr, len)) = cb.buffer.write(&mut *lock).front_ptr() {
            if out.len() < len {
                return Err(FrontStreamQueueError::Invalid);
            }
            // Safety: the record stays in place until `pop`
            unsafe { core::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
            return Ok(len);
        }

        if budget == Some(0) {
            return Err(FrontStreamQueueError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            lists.readers,
            Deadline::from_budget(budget),
            0,
        ) {
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(FrontStreamQueueError::Timeout),
        }
    }
}

/// Zero-copy read of the front record: its in-buffer address and length,
/// blocking while the queue is empty. The pointer is invalidated by
/// [`pop`].
pub fn front_ptr<Traits: PortThreading>(
    queue: StreamQueueId,
) -> Result<(NonNull<u8>, usize), FrontStreamQueueError> {
    front_ptr_general::<Traits>(queue, None)
}

/// [`front_ptr`] with a deadline.
pub fn front_ptr_timeout<Traits: PortThreading>(
    queue: StreamQueueId,
    ticks: u32,
) -> Result<(NonNull<u8>, usize), FrontStreamQueueError> {
    front_ptr_general::<Traits>(queue, Some(ticks))
}

fn front_ptr_general<Traits: PortThreading>(
    queue: StreamQueueId,
    mut budget: Option<u32>,
) -> Result<(NonNull<u8>, usize), FrontStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;

    loop {
        if let Ok((ptr, len)) = cb.buffer.write(&mut *lock).front_ptr() {
            return Ok((NonNull::new(ptr as *mut u8).unwrap(), len));
        }

        if budget == Some(0) {
            return Err(FrontStreamQueueError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            lists.readers,
            Deadline::from_budget(budget),
            0,
        ) {
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(FrontStreamQueueError::Timeout),
        }
    }
}

/// Copy the front record out only if one is immediately available.
pub fn try_front<Traits: PortThreading>(
    queue: StreamQueueId,
    out: &mut [u8],
) -> Result<usize, TryFrontStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = stream_queue_cb(&lock, queue)?;

    match cb.buffer.write(&mut *lock).front_ptr() {
        Ok((ptr, len)) => {
            if out.len() < len {
                return Err(TryFrontStreamQueueError::Invalid);
            }
            // Safety: the record stays in place until `pop`
            unsafe { core::ptr::copy_nonoverlapping(ptr, out.as_mut_ptr(), len) };
            Ok(len)
        }
        Err(_) => Err(TryFrontStreamQueueError::Empty),
    }
}

/// Remove the front record and wake the longest-waiting writer.
pub fn pop<Traits: PortThreading>(queue: StreamQueueId) -> Result<(), PopStreamQueueError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, lists) = stream_queue_cb(&lock, queue)?;

    if cb.buffer.read(&*lock).count() > 0 {
        cb.buffer.write(&mut *lock).pop();
        wait::wake_up_one::<Traits>(lock.borrow_mut(), lists.writers);
        task::unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

/// Number of records currently buffered.
pub fn count<Traits: PortThreading>(queue: StreamQueueId) -> Result<usize, PopStreamQueueError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = stream_queue_cb(&lock, queue)?;
    Ok(cb.buffer.read(&*lock).count())
}

/// Bytes available for new records (length prefixes included).
pub fn free_space<Traits: PortThreading>(
    queue: StreamQueueId,
) -> Result<usize, PopStreamQueueError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = stream_queue_cb(&lock, queue)?;
    Ok(cb.buffer.read(&*lock).free_space())
}
