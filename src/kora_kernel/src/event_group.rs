//! Event flag groups.
//!
//! A group holds 24 event bits. A waiter encodes its predicate - the
//! required mask plus the AND/OR mode in bit 30 - into its event node's
//! value, so `set` can re-evaluate every blocked waiter with one list walk.
use bitflags::bitflags;

use crate::{
    cfg,
    error::{
        BadIdError, CreateEventGroupError, DeleteEventGroupError, GetEventGroupError,
        PollEventGroupError, UpdateEventGroupError, WaitEventGroupError,
    },
    klock,
    klock::{CpuLockCell, CpuLockGuard},
    list::ListRef,
    state, task, wait,
    wait::Deadline,
    utils::Init,
    Id, PortThreading,
};

pub type EventGroupId = Id;

/// The set of bits an event group can carry.
pub type EventBits = u32;

/// Number of usable event bits; the mode encoding lives above them.
pub const EVENT_BITS: u32 = 24;

const BITS_MASK: EventBits = (1 << EVENT_BITS) - 1;
const MODE_AND: u32 = 1 << 30;

bitflags! {
    /// Options for [`wait`].
    pub struct EventGroupWaitFlags: u32 {
        /// Succeed only when every requested bit is set (AND mode); the
        /// default is any-bit (OR mode).
        const ALL = 1 << 0;
        /// Clear the requested bits on a successful wait.
        const CLEAR = 1 << 1;
    }
}

/// *Event group control block* - the state data of an event group.
pub(crate) struct EventGroupCb<Traits> {
    pub(crate) active: CpuLockCell<Traits, bool>,
    pub(crate) bits: CpuLockCell<Traits, EventBits>,
}

impl<Traits> Init for EventGroupCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        active: Init::INIT,
        bits: Init::INIT,
    };
}

fn event_group_cb<Traits: PortThreading>(
    lock: &CpuLockGuard<Traits>,
    group: EventGroupId,
) -> Result<(&'static EventGroupCb<Traits>, ListRef), BadIdError> {
    let index = group.get() - 1;
    let cb = Traits::state()
        .event_groups
        .get(index)
        .ok_or(BadIdError::BadId)?;
    if !cb.active.get(&**lock) {
        return Err(BadIdError::BadId);
    }
    Ok((cb, ListRef::evt_block(index)))
}

/// Encode a wait predicate into an event node value.
fn encode(bits: EventBits, flags: EventGroupWaitFlags) -> u32 {
    let mode = if flags.contains(EventGroupWaitFlags::ALL) {
        MODE_AND
    } else {
        0
    };
    mode | bits
}

/// Given a wait predicate encoded by [`encode`], check whether `current`
/// satisfies it.
fn is_satisfied(current: EventBits, encoded: u32) -> bool {
    let required = encoded & BITS_MASK;
    if encoded & MODE_AND != 0 {
        current & required == required
    } else {
        current & required != 0
    }
}

/// Check the predicate against the group's bits, clearing them on success
/// when requested.
fn poll_core(bits: &mut EventBits, required: EventBits, flags: EventGroupWaitFlags) -> bool {
    if !is_satisfied(*bits, encode(required, flags)) {
        return false;
    }
    if flags.contains(EventGroupWaitFlags::CLEAR) {
        *bits &= !required;
    }
    true
}

pub fn create<Traits: PortThreading>(
    initial_bits: EventBits,
) -> Result<EventGroupId, CreateEventGroupError> {
    if initial_bits & !BITS_MASK != 0 {
        return Err(CreateEventGroupError::Invalid);
    }

    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    crate::init_state_if_needed::<Traits>(lock.borrow_mut());
    let kernel = Traits::state();

    let index = (0..cfg::NUM_EVENT_GROUPS)
        .find(|&i| !kernel.event_groups[i].active.get(&*lock))
        .ok_or(CreateEventGroupError::OutOfMemory)?;
    let cb = &kernel.event_groups[index];

    cb.active.replace(&mut *lock, true);
    cb.bits.replace(&mut *lock, initial_bits);

    Ok(EventGroupId::new(index + 1).unwrap())
}

/// Delete an event group. Fails with `Busy` while tasks are blocked on it.
pub fn delete<Traits: PortThreading>(group: EventGroupId) -> Result<(), DeleteEventGroupError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, block_list) = event_group_cb(&lock, group)?;

    if !Traits::state().lists.is_empty(lock.borrow_mut(), block_list) {
        return Err(DeleteEventGroupError::Busy);
    }

    cb.active.replace(&mut *lock, false);
    Ok(())
}

fn wait_general<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
    flags: EventGroupWaitFlags,
    budget: Option<u32>,
) -> Result<(), WaitEventGroupError> {
    if bits == 0 || bits & !BITS_MASK != 0 {
        return Err(WaitEventGroupError::Invalid);
    }

    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, block_list) = event_group_cb(&lock, group)?;
    let kernel = Traits::state();

    // publish the predicate through the TCB's event-flag register
    let encoded = encode(bits, flags);
    let current = kernel.running_task.get(&*lock).unwrap();
    task::task_cb::<Traits>(current)
        .unwrap()
        .evt_flags
        .replace(&mut *lock, encoded);

    if poll_core(cb.bits.write(&mut *lock), bits, flags) {
        return Ok(());
    }

    if budget == Some(0) {
        return Err(WaitEventGroupError::Timeout);
    }

    match wait::block_current::<Traits>(
        lock.borrow_mut(),
        block_list,
        Deadline::from_budget(budget),
        encoded,
    ) {
        // a setter found the predicate satisfied; the clear side effect is
        // ours to apply
        Ok(()) => {
            if flags.contains(EventGroupWaitFlags::CLEAR) {
                cb.bits.replace_with(&mut *lock, |b| *b & !bits);
            }
            Ok(())
        }
        Err(_) => Err(WaitEventGroupError::Timeout),
    }
}

/// Wait until the predicate over `bits` holds, for as long as it takes.
pub fn wait<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
    flags: EventGroupWaitFlags,
) -> Result<(), WaitEventGroupError> {
    wait_general::<Traits>(group, bits, flags, None)
}

/// [`wait`] with a deadline.
pub fn wait_timeout<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
    flags: EventGroupWaitFlags,
    ticks: u32,
) -> Result<(), WaitEventGroupError> {
    wait_general::<Traits>(group, bits, flags, Some(ticks))
}

/// Check the predicate without blocking.
pub fn poll<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
    flags: EventGroupWaitFlags,
) -> Result<(), PollEventGroupError> {
    match wait_general::<Traits>(group, bits, flags, Some(0)) {
        Ok(()) => Ok(()),
        Err(WaitEventGroupError::BadId) => Err(PollEventGroupError::BadId),
        Err(WaitEventGroupError::Invalid) => Err(PollEventGroupError::Invalid),
        Err(WaitEventGroupError::Timeout) => Err(PollEventGroupError::Timeout),
        Err(WaitEventGroupError::BadContext) => Err(PollEventGroupError::BadContext),
    }
}

fn set_core<Traits: PortThreading>(
    lock: &mut CpuLockGuard<Traits>,
    group: EventGroupId,
    bits: EventBits,
) -> Result<bool, BadIdError> {
    let (cb, block_list) = event_group_cb(lock, group)?;

    let value = cb.bits.get(&**lock) | (bits & BITS_MASK);
    cb.bits.replace(&mut **lock, value);

    // one walk over the waiters enqueued so far; each woken waiter applies
    // its own clear request when it resumes
    let woke_any = wait::wake_up_all_conditional::<Traits>(
        lock.borrow_mut(),
        block_list,
        |encoded| is_satisfied(value, encoded),
    );
    Ok(woke_any)
}

/// OR `bits` into the group and wake every waiter whose predicate holds.
pub fn set<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
) -> Result<(), UpdateEventGroupError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let woke_any = set_core::<Traits>(&mut lock, group, bits)?;
    if woke_any {
        task::unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

/// Interrupt-safe variant of [`set`].
pub fn set_isr<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
) -> Result<(), UpdateEventGroupError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    if set_core::<Traits>(&mut lock, group, bits)? {
        task::pend_switch_if_preempting::<Traits>(lock.borrow_mut());
    }
    Ok(())
}

/// Clear `bits` in the group.
pub fn clear<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
) -> Result<(), UpdateEventGroupError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = event_group_cb(&lock, group)?;
    cb.bits.replace_with(&mut *lock, |b| *b & !bits);
    Ok(())
}

/// Interrupt-safe variant of [`clear`] (identical; present for symmetry
/// with the other IPC objects' interrupt entry points).
pub fn clear_isr<Traits: PortThreading>(
    group: EventGroupId,
    bits: EventBits,
) -> Result<(), UpdateEventGroupError> {
    clear::<Traits>(group, bits)
}

/// The group's current bits.
pub fn get<Traits: PortThreading>(group: EventGroupId) -> Result<EventBits, GetEventGroupError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = event_group_cb(&lock, group)?;
    Ok(cb.bits.get(&*lock))
}
