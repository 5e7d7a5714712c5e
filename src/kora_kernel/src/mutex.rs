//! Mutexes with single-step priority inheritance.
//!
//! When a more urgent task blocks on a held mutex, the owner is boosted to
//! the blocker's priority and its pre-boost priority is parked in the
//! control block. The boost is recorded once per lock cycle and undone by
//! `unlock`. Boosts never propagate across a chain of mutexes; see the
//! repository design notes for the recorded limitation.
use crate::{
    cfg,
    error::{
        BadIdError, CreateMutexError, DeleteMutexError, LockMutexError, UnlockMutexError,
    },
    klock,
    klock::{CpuLockCell, CpuLockGuard},
    list::ListRef,
    state, task, wait,
    wait::Deadline,
    utils::Init,
    Id, PortThreading, TaskId,
};

pub type MutexId = Id;

/// *Mutex control block* - the state data of a mutex.
pub(crate) struct MutexCb<Traits> {
    pub(crate) active: CpuLockCell<Traits, bool>,
    pub(crate) owner: CpuLockCell<Traits, Option<TaskId>>,
    /// The owner's priority at the moment of the first boost of this lock
    /// cycle; `None` while unboosted.
    pub(crate) bkp_prio: CpuLockCell<Traits, Option<usize>>,
}

impl<Traits> Init for MutexCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        active: Init::INIT,
        owner: Init::INIT,
        bkp_prio: Init::INIT,
    };
}

fn mutex_cb<Traits: PortThreading>(
    lock: &CpuLockGuard<Traits>,
    mutex: MutexId,
) -> Result<(&'static MutexCb<Traits>, ListRef), BadIdError> {
    let index = mutex.get() - 1;
    let cb = Traits::state()
        .mutexes
        .get(index)
        .ok_or(BadIdError::BadId)?;
    if !cb.active.get(&**lock) {
        return Err(BadIdError::BadId);
    }
    Ok((cb, ListRef::mutex_block(index)))
}

pub fn create<Traits: PortThreading>() -> Result<MutexId, CreateMutexError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    crate::init_state_if_needed::<Traits>(lock.borrow_mut());
    let kernel = Traits::state();

    let index = (0..cfg::NUM_MUTEXES)
        .find(|&i| !kernel.mutexes[i].active.get(&*lock))
        .ok_or(CreateMutexError::OutOfMemory)?;
    let cb = &kernel.mutexes[index];

    cb.active.replace(&mut *lock, true);
    cb.owner.replace(&mut *lock, None);
    cb.bkp_prio.replace(&mut *lock, None);

    Ok(MutexId::new(index + 1).unwrap())
}

/// Delete a mutex. Fails with `Busy` while it is held or contended.
pub fn delete<Traits: PortThreading>(mutex: MutexId) -> Result<(), DeleteMutexError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, block_list) = mutex_cb(&lock, mutex)?;

    // an unowned mutex can still have contenders queued: `unlock` wakes
    // only the head, and the ownerless window lasts until that task runs
    // and claims. Deleting then would strand the rest on a dead slot's
    // block list.
    if cb.owner.get(&*lock).is_some()
        || !Traits::state().lists.is_empty(lock.borrow_mut(), block_list)
    {
        return Err(DeleteMutexError::Busy);
    }

    cb.active.replace(&mut *lock, false);
    Ok(())
}

/// Acquire the mutex, waiting for as long as it takes. Boosts a less
/// urgent owner to the caller's priority before blocking.
pub fn lock<Traits: PortThreading>(mutex: MutexId) -> Result<(), LockMutexError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;
    let (cb, block_list) = mutex_cb(&lock, mutex)?;
    let kernel = Traits::state();

    loop {
        let current = kernel.running_task.get(&*lock).unwrap();

        let Some(owner) = cb.owner.get(&*lock) else {
            cb.owner.replace(&mut *lock, Some(current));
            return Ok(());
        };

        // handle priority inversion: promote the owner to the more urgent
        // waiter's priority
        let owner_cb = task::task_cb::<Traits>(owner).unwrap();
        let owner_prio = owner_cb.priority.get(&*lock);
        let cur_prio = task::task_cb::<Traits>(current)
            .unwrap()
            .priority
            .get(&*lock);

        if cur_prio < owner_prio {
            let old = task::modify_priority_with_lock::<Traits>(
                lock.borrow_mut(),
                owner,
                cur_prio,
            )
            .unwrap_or(owner_prio);
            // only the first boost of a lock cycle records the restore
            // point
            if cb.bkp_prio.get(&*lock).is_none() {
                cb.bkp_prio.replace(&mut *lock, Some(old));
            }
        }

        match wait::block_current::<Traits>(
            lock.borrow_mut(),
            block_list,
            Deadline::Forever,
            0,
        ) {
            // woken by `unlock`; retry the claim
            Ok(()) => {}
            Err(_) => return Err(LockMutexError::Timeout),
        }
    }
}

/// Release the mutex, restoring a boosted priority and waking the
/// longest-waiting contender.
pub fn unlock<Traits: PortThreading>(mutex: MutexId) -> Result<(), UnlockMutexError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, block_list) = mutex_cb(&lock, mutex)?;
    let kernel = Traits::state();

    let owner = cb.owner.get(&*lock);
    if owner.is_none() || owner != kernel.running_task.get(&*lock) {
        return Err(UnlockMutexError::Invalid);
    }
    let owner = owner.unwrap();

    cb.owner.replace(&mut *lock, None);

    if let Some(original) = cb.bkp_prio.replace(&mut *lock, None) {
        let _ = task::modify_priority_with_lock::<Traits>(lock.borrow_mut(), owner, original);
    }

    wait::wake_up_one::<Traits>(lock.borrow_mut(), block_list);
    task::unlock_cpu_and_check_preemption(lock);
    Ok(())
}

/// The current owner, if any.
pub fn owner<Traits: PortThreading>(mutex: MutexId) -> Result<Option<TaskId>, LockMutexError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let (cb, _) = mutex_cb(&lock, mutex)?;
    Ok(cb.owner.get(&*lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{with_state_unlocked, StubPort};
    use crate::PortThreading as _;

    fn noop(_: usize) {}

    #[test]
    fn delete_is_busy_while_unowned_but_contended() {
        with_state_unlocked(|| {
            let m = create::<StubPort>().unwrap();
            let waiter = task::create::<StubPort>(noop, "waiter", 0, 3, 512).unwrap();

            // model the ownerless window after `unlock` woke the head
            // contender but another one is still queued
            let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
            let kernel = StubPort::state();
            let block_list = ListRef::mutex_block(m.get() - 1);
            kernel
                .lists
                .insert_back(lock.borrow_mut(), block_list, task::event_node_of(waiter))
                .unwrap();
            assert!(mutex_cb(&lock, m).unwrap().0.owner.get(&*lock).is_none());
            drop(lock);

            assert_eq!(delete::<StubPort>(m), Err(DeleteMutexError::Busy));

            // the contender leaves the queue; now the delete goes through
            let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
            kernel
                .lists
                .remove(lock.borrow_mut(), task::event_node_of(waiter));
            drop(lock);

            assert_eq!(delete::<StubPort>(m), Ok(()));
            assert_eq!(delete::<StubPort>(m), Err(DeleteMutexError::BadId));
        });
    }
}
