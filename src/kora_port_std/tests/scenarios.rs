//! End-to-end scheduling and IPC scenarios on the simulated port.
//!
//! The simulator never executes a task's entry function; the test body
//! plays the running task's role, and the yield callback plays everything
//! that runs while that task is blocked.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use kora_kernel::{
    event_group,
    event_group::EventGroupWaitFlags,
    heap, msg_queue, mutex, semaphore, stream_queue, task,
    task::TaskSt,
    timeout, TaskId,
};
use kora_port_std::{
    advance_ticks, current_task, dispatch, dispatch_pending, set_yield_hook, with_sim, SimPort,
};

type P = SimPort;

fn noop(_: usize) {}

fn spawn(name: &str, prio: usize) -> TaskId {
    task::create::<P>(noop, name, 0, prio, 512).unwrap()
}

#[test]
fn s1_high_priority_waiter_preempts_busy_loop() {
    with_sim(|| {
        let sem = semaphore::create::<P>(1, 0).unwrap();
        let busy = spawn("busy", 5);
        let waiter = spawn("waiter", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(waiter));

        // the signaler's role: let the busy loop run for 100 ticks, then
        // post the semaphore from interrupt context
        let elapsed = Arc::new(AtomicU32::new(0));
        let counter = elapsed.clone();
        set_yield_hook(move || {
            dispatch();
            if counter.fetch_add(1, Ordering::Relaxed) < 100 {
                // the busy loop occupies the CPU while the waiter blocks
                assert_eq!(current_task(), Some(busy));
                advance_ticks(1);
            } else {
                semaphore::signal_isr::<P>(sem).unwrap();
                dispatch_pending();
            }
        });

        semaphore::wait::<P>(sem).unwrap();

        // the waiter came back before the busy loop, after >= 100 ticks
        assert_eq!(current_task(), Some(waiter));
        assert!(timeout::tick_count::<P>().unwrap() >= 100);
        assert_eq!(task::state_of::<P>(busy).unwrap(), TaskSt::Ready);
    });
}

#[test]
fn s2_mutex_priority_inheritance_defeats_the_middle_task() {
    with_sim(|| {
        let m = mutex::create::<P>().unwrap();
        let low = spawn("low", 10);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(low));
        mutex::lock::<P>(m).unwrap();

        let middle = spawn("middle", 5);
        let high = spawn("high", 2);
        dispatch();
        assert_eq!(current_task(), Some(high));

        let scheduled = Arc::new(Mutex::new(Vec::new()));
        let log = scheduled.clone();
        set_yield_hook(move || {
            dispatch();
            let cur = current_task().unwrap();
            log.lock().unwrap().push(cur);

            if cur == low {
                // the owner runs at the blocked waiter's priority
                assert_eq!(task::priority::<P>(low).unwrap(), 2);
                mutex::unlock::<P>(m).unwrap();
            }
        });

        mutex::lock::<P>(m).unwrap();

        assert_eq!(mutex::owner::<P>(m).unwrap(), Some(high));
        assert_eq!(current_task(), Some(high));
        // the boost is gone and the middle task never got the CPU
        assert_eq!(task::priority::<P>(low).unwrap(), 10);
        assert!(!scheduled.lock().unwrap().contains(&middle));
        assert!(scheduled.lock().unwrap().contains(&low));

        mutex::unlock::<P>(m).unwrap();
    });
}

#[test]
fn s3_overwrite_drops_the_oldest_item() {
    with_sim(|| {
        let q = msg_queue::create::<P>(3, 4).unwrap();

        for item in 1u32..=4 {
            msg_queue::overwrite::<P>(q, &item.to_le_bytes()).unwrap();
        }

        let mut seen = Vec::new();
        let mut out = [0u8; 4];
        while msg_queue::try_front::<P>(q, &mut out).is_ok() {
            seen.push(u32::from_le_bytes(out));
            msg_queue::pop::<P>(q).unwrap();
        }

        assert_eq!(seen, [2, 3, 4]);
        assert_eq!(msg_queue::len::<P>(q).unwrap(), 0);
    });
}

#[test]
fn s4_stream_queue_wraps_through_the_sentinel() {
    with_sim(|| {
        let q = stream_queue::create::<P>(32).unwrap();

        stream_queue::try_push::<P>(q, &[0x11; 10]).unwrap();
        stream_queue::try_push::<P>(q, &[0x22; 10]).unwrap();
        stream_queue::pop::<P>(q).unwrap();

        // 8 bytes cannot fit at the tail; the record wraps via the sentinel
        stream_queue::try_push::<P>(q, &[0x33; 8]).unwrap();
        assert_eq!(stream_queue::count::<P>(q).unwrap(), 2);

        let mut out = [0u8; 16];
        let len = stream_queue::try_front::<P>(q, &mut out).unwrap();
        assert_eq!(&out[..len], &[0x22; 10]);
        stream_queue::pop::<P>(q).unwrap();

        let len = stream_queue::try_front::<P>(q, &mut out).unwrap();
        assert_eq!(&out[..len], &[0x33; 8]);
        stream_queue::pop::<P>(q).unwrap();

        assert_eq!(stream_queue::count::<P>(q).unwrap(), 0);
    });
}

#[test]
fn s5_event_group_and_mode_needs_every_bit() {
    with_sim(|| {
        let grp = event_group::create::<P>(0).unwrap();
        let t = spawn("t", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(t));

        let sets = Arc::new(AtomicU32::new(0));
        let counter = sets.clone();
        set_yield_hook(move || {
            match counter.fetch_add(1, Ordering::Relaxed) {
                0 => event_group::set::<P>(grp, 0b0001).unwrap(),
                _ => event_group::set::<P>(grp, 0b0010).unwrap(),
            }
            dispatch_pending();
        });

        event_group::wait::<P>(
            grp,
            0b0011,
            EventGroupWaitFlags::ALL | EventGroupWaitFlags::CLEAR,
        )
        .unwrap();

        // the first set alone did not wake the waiter
        assert_eq!(sets.load(Ordering::Relaxed), 2);
        // the successful wait consumed the bits
        assert_eq!(event_group::get::<P>(grp).unwrap(), 0);
    });
}

#[test]
fn s6_isr_released_memory_returns_after_an_idle_window() {
    with_sim(|| {
        let before = heap::remain_size::<P>().unwrap();

        let block = heap::allocate::<P>(256).unwrap();
        // an interrupt handler cannot walk the free list; it queues the
        // block instead
        heap::queue_free::<P>(block).unwrap();
        assert!(heap::remain_size::<P>().unwrap() < before);

        // one pass of the idle task reclaims it
        task::idle_step::<P>();
        assert_eq!(heap::remain_size::<P>().unwrap(), before);
    });
}

#[test]
fn round_robin_rotates_equal_priorities_each_tick() {
    with_sim(|| {
        let a = spawn("a", 3);
        let b = spawn("b", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(a));

        advance_ticks(1);
        assert_eq!(current_task(), Some(b));
        advance_ticks(1);
        assert_eq!(current_task(), Some(a));
        advance_ticks(1);
        assert_eq!(current_task(), Some(b));
    });
}

#[test]
fn cooperative_yield_suppresses_the_next_tick_switch() {
    with_sim(|| {
        let a = spawn("a", 3);
        let b = spawn("b", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(a));

        // a voluntary reschedule hands over immediately...
        task::yield_now::<P>().unwrap();
        assert_eq!(current_task(), Some(b));

        // ...and eats the next tick-driven rotation
        advance_ticks(1);
        assert_eq!(current_task(), Some(b));
        advance_ticks(1);
        assert_eq!(current_task(), Some(a));
    });
}

#[test]
fn suspending_a_blocked_task_cancels_its_wait() {
    with_sim(|| {
        let sem = semaphore::create::<P>(1, 0).unwrap();
        let t = spawn("t", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(t));

        set_yield_hook(move || {
            dispatch();
            if task::state_of::<P>(t).unwrap() == TaskSt::Blocking {
                task::suspend::<P>(t).unwrap();
                assert_eq!(task::state_of::<P>(t).unwrap(), TaskSt::Suspended);
                // resuming makes the task runnable directly; the original
                // wait does not resume
                task::ready::<P>(t).unwrap();
            }
        });

        let result = semaphore::wait_timeout::<P>(sem, 1_000);
        assert_eq!(
            result,
            Err(kora_kernel::error::WaitSemaphoreError::Timeout)
        );
        // nothing was consumed from the semaphore
        assert_eq!(semaphore::count::<P>(sem).unwrap(), 0);
        assert_eq!(current_task(), Some(t));
    });
}

#[test]
fn blocked_wait_times_out_at_the_deadline() {
    with_sim(|| {
        let sem = semaphore::create::<P>(1, 0).unwrap();
        let t = spawn("t", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(t));

        set_yield_hook(|| advance_ticks(1));

        let start = timeout::tick_count::<P>().unwrap();
        let result = semaphore::wait_timeout::<P>(sem, 10);
        let end = timeout::tick_count::<P>().unwrap();

        assert_eq!(
            result,
            Err(kora_kernel::error::WaitSemaphoreError::Timeout)
        );
        assert!(end - start >= 10);
    });
}

#[test]
fn deleting_contended_objects_reports_busy() {
    with_sim(|| {
        let sem = semaphore::create::<P>(1, 0).unwrap();
        let t = spawn("t", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(t));

        set_yield_hook(move || {
            assert_eq!(
                semaphore::delete::<P>(sem),
                Err(kora_kernel::error::DeleteSemaphoreError::Busy)
            );
            advance_ticks(1);
        });

        let _ = semaphore::wait_timeout::<P>(sem, 3);

        // unblocked now; the delete goes through
        semaphore::delete::<P>(sem).unwrap();
        assert_eq!(
            semaphore::count::<P>(sem),
            Err(kora_kernel::error::GetSemaphoreError::BadId)
        );
    });
}

#[test]
fn deleted_task_stack_returns_to_the_heap() {
    with_sim(|| {
        let before = heap::remain_size::<P>().unwrap();
        let t = spawn("doomed", 3);

        task::delete::<P>(t).unwrap();
        task::idle_step::<P>();

        assert_eq!(heap::remain_size::<P>().unwrap(), before);
    });
}

#[test]
fn mutex_delete_while_held_is_busy() {
    with_sim(|| {
        let m = mutex::create::<P>().unwrap();
        let t = spawn("t", 3);
        kora_kernel::startup::<P>().unwrap();
        assert_eq!(current_task(), Some(t));

        mutex::lock::<P>(m).unwrap();
        assert_eq!(
            mutex::delete::<P>(m),
            Err(kora_kernel::error::DeleteMutexError::Busy)
        );

        mutex::unlock::<P>(m).unwrap();
        mutex::delete::<P>(m).unwrap();
    });
}
