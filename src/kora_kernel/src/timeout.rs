//! The kernel tick: sleep deadlines, the tick handler, and the counter
//! rebase that keeps deadlines from overflowing.
use core::sync::atomic::Ordering;

use crate::{
    error::BadContextError,
    hooks, klock,
    klock::CpuLockTokenRefMut,
    list::ListRef,
    task,
    task::TaskSt,
    wait::WaitCancelled,
    PortThreading, TaskId,
};

/// Current tick count.
pub fn tick_count<Traits: PortThreading>() -> Result<u32, BadContextError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    Ok(Traits::state().tick_count.get(&*lock))
}

/// Park `task`'s state node on the sleep list, `ticks` from now.
///
/// The deadline is absolute. When it would overflow the counter, every
/// outstanding deadline and the counter itself are rebased first.
pub(crate) fn add_to_sleep<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
    ticks: u32,
) {
    let kernel = Traits::state();

    if ticks > u32::MAX - kernel.tick_count.get(&*lock) {
        tick_reset::<Traits>(lock.borrow_mut());
    }

    let deadline = kernel.tick_count.get(&*lock) + ticks;
    let node = task::state_node_of(task);
    kernel.lists.set_value(lock.borrow_mut(), node, deadline);
    kernel
        .lists
        .insert_sorted(lock.borrow_mut(), ListRef::sleep(), node)
        .expect("state node already linked");
}

/// Rebase every sleeper's deadline and zero the tick counter.
fn tick_reset<Traits: PortThreading>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let kernel = Traits::state();
    hooks::fire0(lock.borrow_mut(), &kernel.hooks.tick_reset);

    let now = kernel.tick_count.get(&*lock);
    let sleep = ListRef::sleep();
    let mut cursor = kernel.lists.first(lock.borrow_mut(), sleep);
    while let Some(node) = cursor {
        let value = kernel.lists.value(lock.borrow_mut(), node);
        kernel
            .lists
            .set_value(lock.borrow_mut(), node, value.saturating_sub(now));
        cursor = kernel.lists.next_in(lock.borrow_mut(), sleep, node);
    }

    kernel.tick_count.replace(&mut *lock, 0);
}

/// Promote every sleeper whose deadline has passed back to its ready list.
/// A task that was blocking with a timeout gets a `Timeout` wait result and
/// leaves its IPC block list.
fn wake_expired<Traits: PortThreading>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let kernel = Traits::state();
    let sleep = ListRef::sleep();

    while let Some(head) = kernel.lists.first(lock.borrow_mut(), sleep) {
        let now = kernel.tick_count.get(&*lock);
        if kernel.lists.value(lock.borrow_mut(), head) > now {
            break;
        }

        let woken = task::task_of_node(head);
        let cb = task::task_cb::<Traits>(woken).unwrap();

        kernel.lists.remove(lock.borrow_mut(), head);
        kernel
            .lists
            .remove(lock.borrow_mut(), task::event_node_of(woken));
        if cb.st.get(&*lock) == TaskSt::Blocking {
            cb.wait_result
                .replace(&mut *lock, Err(WaitCancelled::Timeout));
        }
        task::add_to_ready::<Traits>(lock.borrow_mut(), woken);
    }
}

/// The kernel half of the tick interrupt. The port's tick ISR calls this
/// once per tick with interrupts at the tick handler's priority.
pub fn tick_handler<Traits: PortThreading>() {
    let Ok(mut lock) = klock::CpuLockGuard::<Traits>::acquire() else {
        // tick raced a critical section; the port retries next tick
        return;
    };
    let kernel = Traits::state();

    let now = kernel.tick_count.get(&*lock);
    hooks::fire(lock.borrow_mut(), &kernel.hooks.systick, now);

    let Some(current) = kernel.running_task.get(&*lock) else {
        return;
    };

    kernel.tick_count.replace(&mut *lock, now.wrapping_add(1));
    task::task_cb::<Traits>(current)
        .unwrap()
        .occupied_ticks
        .replace_with(&mut *lock, |t| t.wrapping_add(1));

    wake_expired::<Traits>(lock.borrow_mut());

    // a held dispatch gate or a fresh cooperative yield suppresses the
    // tick-driven switch
    if kernel.dispatch_disable.load(Ordering::Relaxed) != 0
        || kernel.actively_scheduled.swap(false, Ordering::Relaxed)
    {
        return;
    }

    // nothing to rotate to: the running task is alone at the top
    let cb = task::task_cb::<Traits>(current).unwrap();
    let highest = kernel.highest_prio.get(&*lock);
    if cb.priority.get(&*lock) == highest
        && kernel.lists.len(lock.borrow_mut(), ListRef::ready(highest)) == 1
    {
        return;
    }

    // Safety: pending the switch is always safe; it fires at interrupt exit
    unsafe { Traits::pend_dispatch() };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{with_state_unlocked, StubPort};
    use crate::{hooks::Hook, task::TaskSt, PortThreading as _};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop(_: usize) {}

    fn spawn(name: &str, prio: usize) -> TaskId {
        crate::task::create::<StubPort>(noop, name, 0, prio, 512).unwrap()
    }

    static RESETS: AtomicU32 = AtomicU32::new(0);

    fn count_reset() {
        RESETS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn deadline_overflow_triggers_exactly_one_reset() {
        with_state_unlocked(|| {
            RESETS.store(0, Ordering::Relaxed);
            crate::hooks::register::<StubPort>(Hook::TickReset(count_reset)).unwrap();

            let early = spawn("early", 3);
            let late = spawn("late", 3);
            let runner = spawn("runner", 2);

            let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
            let kernel = StubPort::state();

            // pretend the kernel has been up for a while
            kernel.tick_count.replace(&mut *lock, 1000);

            task::remove_from_ready::<StubPort>(lock.borrow_mut(), early);
            task::task_cb::<StubPort>(early)
                .unwrap()
                .st
                .replace(&mut *lock, TaskSt::Sleeping);
            add_to_sleep::<StubPort>(lock.borrow_mut(), early, 500);
            assert_eq!(
                kernel
                    .lists
                    .value(lock.borrow_mut(), task::state_node_of(early)),
                1500
            );

            // this deadline would overflow the counter: everything rebases
            task::remove_from_ready::<StubPort>(lock.borrow_mut(), late);
            task::task_cb::<StubPort>(late)
                .unwrap()
                .st
                .replace(&mut *lock, TaskSt::Sleeping);
            add_to_sleep::<StubPort>(lock.borrow_mut(), late, u32::MAX - 500);

            assert_eq!(RESETS.load(Ordering::Relaxed), 1);
            assert_eq!(kernel.tick_count.get(&*lock), 0);
            assert_eq!(
                kernel
                    .lists
                    .value(lock.borrow_mut(), task::state_node_of(early)),
                500
            );
            assert_eq!(
                kernel
                    .lists
                    .value(lock.borrow_mut(), task::state_node_of(late)),
                u32::MAX - 500
            );

            // the tick handler needs a running task to attribute time to
            kernel.running_task.replace(&mut *lock, Some(runner));
            task::task_cb::<StubPort>(runner)
                .unwrap()
                .st
                .replace(&mut *lock, TaskSt::Running);
            drop(lock);

            // the rebased sleeper still wakes at the intended moment
            for _ in 0..499 {
                tick_handler::<StubPort>();
            }
            assert_eq!(crate::task::state_of::<StubPort>(early).unwrap(), TaskSt::Sleeping);
            tick_handler::<StubPort>();
            assert_eq!(crate::task::state_of::<StubPort>(early).unwrap(), TaskSt::Ready);
            assert_eq!(crate::task::state_of::<StubPort>(late).unwrap(), TaskSt::Sleeping);
            assert_eq!(RESETS.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn expired_sleepers_drain_in_deadline_order() {
        with_state_unlocked(|| {
            let s1 = spawn("s1", 3);
            let s2 = spawn("s2", 3);
            let runner = spawn("runner", 2);

            let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
            let kernel = StubPort::state();

            for (t, ticks) in [(s1, 3), (s2, 1)] {
                task::remove_from_ready::<StubPort>(lock.borrow_mut(), t);
                task::task_cb::<StubPort>(t)
                    .unwrap()
                    .st
                    .replace(&mut *lock, TaskSt::Sleeping);
                add_to_sleep::<StubPort>(lock.borrow_mut(), t, ticks);
            }

            kernel.running_task.replace(&mut *lock, Some(runner));
            task::task_cb::<StubPort>(runner)
                .unwrap()
                .st
                .replace(&mut *lock, TaskSt::Running);
            drop(lock);

            tick_handler::<StubPort>();
            assert_eq!(crate::task::state_of::<StubPort>(s2).unwrap(), TaskSt::Ready);
            assert_eq!(crate::task::state_of::<StubPort>(s1).unwrap(), TaskSt::Sleeping);

            // both expire by tick 3; one tick drains every overdue sleeper
            tick_handler::<StubPort>();
            tick_handler::<StubPort>();
            assert_eq!(crate::task::state_of::<StubPort>(s1).unwrap(), TaskSt::Ready);
        });
    }
}
