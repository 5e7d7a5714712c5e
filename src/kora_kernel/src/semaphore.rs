//! Counting semaphores.
use crate::{
    cfg,
    error::{
        BadIdError, CreateSemaphoreError, DeleteSemaphoreError, GetSemaphoreError,
        PollSemaphoreError, SignalSemaphoreError, WaitSemaphoreError,
    },
    klock,
    klock::{CpuLockCell, CpuLockGuard},
    list::ListRef,
    state, task, wait,
    wait::Deadline,
    utils::Init,
    Id, PortThreading,
};

pub type SemaphoreId = Id;

/// *Semaphore control block* - the state data of a counting semaphore.
pub(crate) struct SemaphoreCb<Traits> {
    pub(crate) active: CpuLockCell<Traits, bool>,
    pub(crate) count: CpuLockCell<Traits, u32>,
    pub(crate) max: CpuLockCell<Traits, u32>,
}

impl<Traits> Init for SemaphoreCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        active: Init::INIT,
        count: Init::INIT,
        max: Init::INIT,
    };
}

fn semaphore_cb<Traits: PortThreading>(
    lock: &CpuLockGuard<Traits>,
    sem: SemaphoreId,
) -> Result<(&'static SemaphoreCb<Traits>, ListRef), BadIdError> {
    let index = sem.get() - 1;
    let cb = Traits::state()
        .semaphores
        .get(index)
        .ok_or(BadIdError::BadId)?;
    if !cb.active.get(&**lock) {
        return Err(BadIdError::BadId);
    }
    Ok((cb, ListRef::sem_block(index)))
}

/// Create a semaphore with the given maximum and initial count.
pub fn create<Traits: PortThreading>(
    max_count: u32,
    initial_count: u32,
) -> Result<SemaphoreId, CreateSemaphoreError> {
    if max_count == 0 || initial_count > max_count {
        return Err(CreateSemaphoreError::Invalid);
    }

    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    crate::init_state_if_needed::<Traits>(lock.borrow_mut());
    let kernel = Traits::state();

    let index = (0..cfg::NUM_SEMAPHORES)
        .find(|&i| !kernel.semaphores[i].active.get(&*lock))
        .ok_or(CreateSemaphoreError::OutOfMemory)?;
    let cb = &kernel.semaphores[index];

    cb.active.replace(&mut *lock, true);
    cb.count.replace(&mut *lock, initial_count);
    cb.max.replace(&mut *lock, max_count);

    Ok(SemaphoreId::new(index + 1).unwrap())
}

/// Delete a semaphore. Fails with `Busy` while tasks are blocked on it.
pub fn delete<Traits: PortThreading>(sem: SemaphoreId) -> Result<(), DeleteSemaphoreError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, block_list) = semaphore_cb(&lock, sem)?;

    if !Traits::state().lists.is_empty(lock.borrow_mut(), block_list) {
        return Err(DeleteSemaphoreError::Busy);
    }

    cb.active.replace(&mut *lock, false);
    Ok(())
}

/// Check the semaphore's counter; take one permit if any is available.
#[inline]
fn poll_core(count: &mut u32) -> bool {
    if *count > 0 {
        *count -= 1;
        true
    } else {
        false
    }
}

fn acquire<Traits: PortThreading>(
    sem: SemaphoreId,
    mut budget: Option<u32>,
    take: bool,
) -> Result<(), WaitSemaphoreError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, block_list) = semaphore_cb(&lock, sem)?;

    loop {
        let acquired = if take {
            poll_core(cb.count.write(&mut *lock))
        } else {
            cb.count.get(&*lock) > 0
        };
        if acquired {
            return Ok(());
        }

        if budget == Some(0) {
            return Err(WaitSemaphoreError::Timeout);
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            block_list,
            Deadline::from_budget(budget),
            0,
        ) {
            // woken by a signal; re-poll, as a more urgent task may have
            // taken the permit first
            Ok(()) => budget = wait::remaining_budget::<Traits>(lock.borrow_mut(), budget),
            Err(_) => return Err(WaitSemaphoreError::Timeout),
        }
    }
}

/// Take one permit, waiting for as long as it takes.
pub fn wait<Traits: PortThreading>(sem: SemaphoreId) -> Result<(), WaitSemaphoreError> {
    acquire::<Traits>(sem, None, true)
}

/// Take one permit, waiting at most `ticks`.
pub fn wait_timeout<Traits: PortThreading>(
    sem: SemaphoreId,
    ticks: u32,
) -> Result<(), WaitSemaphoreError> {
    acquire::<Traits>(sem, Some(ticks), true)
}

/// Take one permit only if it is immediately available.
pub fn poll<Traits: PortThreading>(sem: SemaphoreId) -> Result<(), PollSemaphoreError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = semaphore_cb(&lock, sem)?;

    if poll_core(cb.count.write(&mut *lock)) {
        Ok(())
    } else {
        Err(PollSemaphoreError::Timeout)
    }
}

/// Wait until a permit is available without taking it.
pub fn peek<Traits: PortThreading>(sem: SemaphoreId) -> Result<(), WaitSemaphoreError> {
    acquire::<Traits>(sem, None, false)
}

/// [`peek`] with a deadline.
pub fn peek_timeout<Traits: PortThreading>(
    sem: SemaphoreId,
    ticks: u32,
) -> Result<(), WaitSemaphoreError> {
    acquire::<Traits>(sem, Some(ticks), false)
}

fn signal_core<Traits: PortThreading>(
    lock: &mut CpuLockGuard<Traits>,
    sem: SemaphoreId,
) -> Result<(), SignalSemaphoreError> {
    let (cb, block_list) = semaphore_cb(lock, sem)?;

    if cb.count.get(&**lock) >= cb.max.get(&**lock) {
        return Err(SignalSemaphoreError::Full);
    }

    cb.count.replace_with(&mut **lock, |c| *c + 1);
    wait::wake_up_one::<Traits>(lock.borrow_mut(), block_list);
    Ok(())
}

/// Release one permit and wake the longest-waiting task, if any.
pub fn signal<Traits: PortThreading>(sem: SemaphoreId) -> Result<(), SignalSemaphoreError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    signal_core::<Traits>(&mut lock, sem)?;
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// Interrupt-safe variant of [`signal`]: schedules the switch for interrupt
/// exit instead of yielding.
pub fn signal_isr<Traits: PortThreading>(sem: SemaphoreId) -> Result<(), SignalSemaphoreError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    signal_core::<Traits>(&mut lock, sem)?;
    task::pend_switch_if_preempting::<Traits>(lock.borrow_mut());
    Ok(())
}

/// The semaphore's current count.
pub fn count<Traits: PortThreading>(sem: SemaphoreId) -> Result<u32, GetSemaphoreError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = semaphore_cb(&lock, sem)?;
    Ok(cb.count.get(&*lock))
}
