//! Blocking and waking on IPC objects.
//!
//! A blocked task parks its event node on the owning object's block list
//! (FIFO) and, when the wait carries a deadline, its state node on the
//! sleep list. The wake-upper records the outcome in the TCB's wait-result
//! slot before making the task runnable again.
use crate::{
    klock::CpuLockTokenRefMut,
    list::ListRef,
    task,
    task::TaskSt,
    timeout, PortThreading,
};

/// Why a wait ended without acquiring the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitCancelled {
    /// The deadline passed.
    Timeout,
    /// The wait was cut short from outside (`task::suspend`, `task::ready`,
    /// or task deletion).
    Interrupted,
}

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    /// Wait at most this many ticks (> 0).
    Ticks(u32),
    Forever,
}

impl Deadline {
    /// Convert a remaining-tick budget. `None` means no deadline.
    pub(crate) fn from_budget(budget: Option<u32>) -> Self {
        match budget {
            Some(t) => Self::Ticks(t),
            None => Self::Forever,
        }
    }
}

/// Transition the running task into `Blocking` on `block_list` and hand the
/// CPU over until a wake-upper (or the tick handler) makes it runnable
/// again.
///
/// `node_value` is published through the task's event node; the event group
/// stores its encoded predicate there.
///
/// The caller must have verified the context is waitable.
pub(crate) fn block_current<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    block_list: ListRef,
    deadline: Deadline,
    node_value: u32,
) -> Result<(), WaitCancelled> {
    let kernel = Traits::state();
    let current = kernel.running_task.get(&*lock).unwrap();
    let cb = task::task_cb::<Traits>(current).unwrap();

    debug_assert_eq!(cb.st.get(&*lock), TaskSt::Running);
    cb.st.replace(&mut *lock, TaskSt::Blocking);
    cb.wait_result.replace(&mut *lock, Ok(()));

    task::remove_from_ready::<Traits>(lock.borrow_mut(), current);

    let state_node = task::state_node_of(current);
    match deadline {
        Deadline::Ticks(t) if t != u32::MAX => {
            timeout::add_to_sleep::<Traits>(lock.borrow_mut(), current, t);
        }
        _ => {
            // no deadline: the state node stays detached, marked so that a
            // remaining-budget query reads "forever"
            kernel.lists.set_value(lock.borrow_mut(), state_node, u32::MAX);
        }
    }

    let event_node = task::event_node_of(current);
    kernel.lists.set_value(lock.borrow_mut(), event_node, node_value);
    kernel
        .lists
        .insert_back(lock.borrow_mut(), block_list, event_node)
        .expect("event node already linked");

    task::wait_until_woken_up::<Traits>(lock.borrow_mut());

    // both nodes were detached by whoever woke us
    debug_assert!(kernel.lists.leader(lock.borrow_mut(), event_node).is_none());
    debug_assert!(kernel.lists.leader(lock.borrow_mut(), state_node).is_none());

    cb.wait_result.get(&*lock)
}

/// Remaining tick budget of the running task after an unsuccessful wake,
/// recomputed from its (now stale) sleep deadline. `None` = no deadline.
pub(crate) fn remaining_budget<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    budget: Option<u32>,
) -> Option<u32> {
    budget?;
    let current = Traits::state().running_task.get(&*lock).unwrap();
    let left = task::left_sleep_ticks_with_lock::<Traits>(lock.borrow_mut(), current);
    Some(left)
}

/// Wake the longest-waiting task on `block_list`, giving it a completed
/// wait result. Returns `true` if a task was woken.
///
/// This may make a task Ready but does not yield; run a preemption check
/// before returning to the caller.
pub(crate) fn wake_up_one<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    block_list: ListRef,
) -> bool {
    let kernel = Traits::state();
    let Some(first) = kernel.lists.first(lock.borrow_mut(), block_list) else {
        return false;
    };

    kernel.lists.remove(lock.borrow_mut(), first);
    task::wake_with_lock::<Traits>(lock.borrow_mut(), task::task_of_node(first));
    true
}

/// Walk `block_list` once, waking every task whose published node value
/// satisfies `cond`. Tasks enqueued during the walk are not considered.
///
/// Returns `true` if any task was woken.
pub(crate) fn wake_up_all_conditional<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    block_list: ListRef,
    mut cond: impl FnMut(u32) -> bool,
) -> bool {
    let kernel = Traits::state();
    let mut woke_any = false;

    let mut cursor = kernel.lists.first(lock.borrow_mut(), block_list);
    while let Some(node) = cursor {
        // find the next entry before possibly unlinking this one
        cursor = kernel.lists.next_in(lock.borrow_mut(), block_list, node);

        if !cond(kernel.lists.value(lock.borrow_mut(), node)) {
            continue;
        }

        kernel.lists.remove(lock.borrow_mut(), node);
        task::wake_with_lock::<Traits>(lock.borrow_mut(), task::task_of_node(node));
        woke_any = true;
    }

    woke_any
}
