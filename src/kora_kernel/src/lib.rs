//! Kora: a small preemptive real-time kernel for single-core 32-bit
//! microcontrollers.
//!
//! The kernel provides fixed-priority preemptive scheduling with
//! round-robin among equal priorities, a family of inter-task
//! synchronization primitives (counting semaphore, priority-inheriting
//! mutex, message queue, event group, stream queue), a next-fit heap with
//! deferred free, and the segmented byte buffer underpinning the stream
//! queue.
//!
//! Everything CPU-specific lives behind [`PortThreading`]: critical
//! sections, the context switch, stack-frame priming, and the tick timer.
//! The kernel publishes scheduling decisions ([`task::schedule`]) and
//! switch requests (`pend_dispatch`); the port moves the registers.
//!
//! # Contexts
//!
//! Public APIs are marked for one of three contexts: task context
//! (blocking allowed), interrupt context (the `*_isr` entry points), or
//! either. Kernel state is only ever mutated with CPU Lock held; the
//! type-level token in [`klock`] enforces this.
#![cfg_attr(not(test), no_std)]

#[cfg(test)]
extern crate std;

pub mod cfg;
pub mod error;
pub mod event_group;
pub mod heap;
pub mod hooks;
pub mod msg_queue;
pub mod mutex;
pub mod semaphore;
pub mod stream_queue;
pub mod task;
pub mod timeout;

mod bytebuffer;
mod itemq;
mod klock;
mod list;
mod state;
mod utils;
mod wait;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    error::{BadContextError, CreateTaskError},
    klock::{CpuLockCell, CpuLockTokenRefMut},
    list::{ListRef, NodeRef},
    task::{TaskCb, TaskSt},
    utils::{Init, PrioBitmap, RawCell},
};

pub use crate::state::is_scheduler_running;
pub use crate::utils::Init as KernelInit;

/// Object identifier. Ids are arena slot numbers offset by one, so zero
/// never names a live object.
pub type Id = core::num::NonZeroUsize;

/// Task identifier.
pub type TaskId = Id;

/// Unrecoverable kernel failures handed to `PortThreading::trap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    /// A heap block header lost its magic word: double free or overflow.
    HeapCorruption,
    /// A TCB lost its magic word: stack overflow into the control block.
    TcbCorruption,
    /// A task's free stack fell below the redline.
    StackOverflow,
    /// The kernel could not bring up the idle task.
    StartupFailed,
}

/// The interface a port supplies to the kernel.
///
/// # Safety
///
/// Implementations must uphold every method's contract; the kernel builds
/// its memory-safety argument (the CPU Lock token) on them.
pub unsafe trait PortThreading: Sized + 'static {
    /// The kernel's state instance.
    fn state() -> &'static KernelState<Self>;

    /// Enter CPU Lock if it is inactive. Returns `false` when it was
    /// already active.
    ///
    /// # Safety
    ///
    /// Only the kernel may call this.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Enter CPU Lock unconditionally.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive.
    unsafe fn enter_cpu_lock();

    /// Leave CPU Lock.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active, controlled by the kernel.
    unsafe fn leave_cpu_lock();

    fn is_cpu_lock_active() -> bool;

    /// Whether the CPU is executing a task (as opposed to an interrupt
    /// handler or the boot path).
    fn is_task_context() -> bool;

    /// Cooperative yield: record the voluntary reschedule (see
    /// [`task::note_cooperative_yield`]) and run the dispatcher
    /// synchronously.
    ///
    /// # Safety
    ///
    /// CPU Lock must be inactive; task context only.
    unsafe fn yield_cpu();

    /// Request the deferred-switch interrupt. Fires when interrupt
    /// processing unwinds.
    ///
    /// # Safety
    ///
    /// Only the kernel may call this.
    unsafe fn pend_dispatch();

    /// Prime the task's initial stack frame so the first dispatch into it
    /// starts `entry(param)` and a return from `entry` reaches
    /// [`task::exit`].
    ///
    /// # Safety
    ///
    /// The task's TCB (stack fields included) is fully initialized; CPU
    /// Lock is active.
    unsafe fn initialize_task_state(task: TaskId);

    /// Drop into the first task's context. Called once, at the end of
    /// [`start`].
    ///
    /// # Safety
    ///
    /// The scheduler state must be primed ([`startup`] has run).
    unsafe fn start_first_task() -> !;

    /// Sink for unrecoverable kernel failures.
    fn trap(reason: Fatal) -> !;
}

/// Umbrella trait for everything a port provides.
pub trait Port: PortThreading {}
impl<T: PortThreading> Port for T {}

#[repr(align(8))]
struct IdleStack([u8; cfg::IDLE_STACK_SIZE]);

impl Init for IdleStack {
    const INIT: Self = Self([0; cfg::IDLE_STACK_SIZE]);
}

/// The kernel's entire mutable state. Ports hold one instance in a static
/// and return it from [`PortThreading::state`].
pub struct KernelState<Traits> {
    pub(crate) lists: list::ListArena<Traits>,
    pub(crate) tasks: [TaskCb<Traits>; cfg::NUM_TASKS],

    pub(crate) running_task: CpuLockCell<Traits, Option<TaskId>>,
    pub(crate) prio_bitmap: CpuLockCell<Traits, PrioBitmap>,
    pub(crate) highest_prio: CpuLockCell<Traits, usize>,
    /// Round-robin cursors, one per priority level.
    pub(crate) task_iter: [CpuLockCell<Traits, NodeRef>; cfg::MAX_PRIOS],

    pub(crate) tick_count: CpuLockCell<Traits, u32>,
    /// Task-dispatch gate; non-zero suppresses switching. Atomic so the
    /// gate can be queried and released without taking CPU Lock.
    pub(crate) dispatch_disable: AtomicU32,
    /// Set by a cooperative yield; the next tick skips its forced switch.
    pub(crate) actively_scheduled: AtomicBool,

    pub(crate) cpu_usage: CpuLockCell<Traits, u32>,
    pub(crate) usage_begin_tick: CpuLockCell<Traits, u32>,
    pub(crate) usage_idle_ticks: CpuLockCell<Traits, u32>,
    pub(crate) usage_last_tick: CpuLockCell<Traits, u32>,

    pub(crate) hooks: hooks::HookTable<Traits>,
    pub(crate) heap: heap::Heap<Traits>,

    pub(crate) semaphores: [semaphore::SemaphoreCb<Traits>; cfg::NUM_SEMAPHORES],
    pub(crate) mutexes: [mutex::MutexCb<Traits>; cfg::NUM_MUTEXES],
    pub(crate) event_groups: [event_group::EventGroupCb<Traits>; cfg::NUM_EVENT_GROUPS],
    pub(crate) msg_queues: [msg_queue::MsgQueueCb<Traits>; cfg::NUM_MSG_QUEUES],
    pub(crate) stream_queues: [stream_queue::StreamQueueCb<Traits>; cfg::NUM_STREAM_QUEUES],

    idle_stack: RawCell<IdleStack>,
    inited: CpuLockCell<Traits, bool>,
}

// Safety: every field is either atomic or only reachable while holding the
// CPU Lock token
unsafe impl<Traits> Sync for KernelState<Traits> {}

impl<Traits> Init for KernelState<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        lists: Init::INIT,
        tasks: Init::INIT,
        running_task: Init::INIT,
        prio_bitmap: Init::INIT,
        highest_prio: Init::INIT,
        task_iter: Init::INIT,
        tick_count: Init::INIT,
        dispatch_disable: AtomicU32::new(1),
        actively_scheduled: Init::INIT,
        cpu_usage: Init::INIT,
        usage_begin_tick: Init::INIT,
        usage_idle_ticks: Init::INIT,
        usage_last_tick: Init::INIT,
        hooks: Init::INIT,
        heap: Init::INIT,
        semaphores: Init::INIT,
        mutexes: Init::INIT,
        event_groups: Init::INIT,
        msg_queues: Init::INIT,
        stream_queues: Init::INIT,
        idle_stack: Init::INIT,
        inited: Init::INIT,
    };
}

impl<Traits> KernelState<Traits> {
    /// A `KernelState` ready to be placed in a port's static.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const INIT: Self = <Self as Init>::INIT;
}

fn init_state_with_lock<Traits: PortThreading>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let kernel = Traits::state();

    kernel.lists.init(lock.borrow_mut());
    kernel.heap.init(lock.borrow_mut());
    kernel.hooks.clear(lock.borrow_mut());

    for prio in 0..cfg::MAX_PRIOS {
        kernel.task_iter[prio].replace(&mut *lock, NodeRef::head_of(ListRef::ready(prio)));
    }
    kernel.prio_bitmap.replace(&mut *lock, PrioBitmap::INIT);
    kernel.highest_prio.replace(&mut *lock, cfg::MAX_PRIOS - 1);
    kernel.running_task.replace(&mut *lock, None);
    kernel.tick_count.replace(&mut *lock, 0);
    kernel.dispatch_disable.store(1, Ordering::Relaxed);
    kernel.actively_scheduled.store(false, Ordering::Relaxed);

    kernel.cpu_usage.replace(&mut *lock, 0);
    kernel.usage_begin_tick.replace(&mut *lock, 0);
    kernel.usage_idle_ticks.replace(&mut *lock, 0);
    kernel.usage_last_tick.replace(&mut *lock, 0);

    for cb in kernel.tasks.iter() {
        cb.st.replace(&mut *lock, TaskSt::Dormant);
        cb.magic.replace(&mut *lock, 0);
    }
    for cb in kernel.semaphores.iter() {
        cb.active.replace(&mut *lock, false);
    }
    for cb in kernel.mutexes.iter() {
        cb.active.replace(&mut *lock, false);
    }
    for cb in kernel.event_groups.iter() {
        cb.active.replace(&mut *lock, false);
    }
    for cb in kernel.msg_queues.iter() {
        cb.active.replace(&mut *lock, false);
    }
    for cb in kernel.stream_queues.iter() {
        cb.active.replace(&mut *lock, false);
    }

    kernel.inited.replace(&mut *lock, true);
}

pub(crate) fn init_state_if_needed<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
) {
    if !Traits::state().inited.get(&*lock) {
        init_state_with_lock::<Traits>(lock.borrow_mut());
    }
}

/// Initialize (or wipe and reinitialize) the kernel state. Every existing
/// kernel object is forgotten. Object creation also triggers this lazily,
/// so calling it is only required to reset a running kernel.
pub fn init<Traits: PortThreading>() -> Result<(), BadContextError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    init_state_with_lock::<Traits>(lock.borrow_mut());
    Ok(())
}

/// Bring up the scheduler: create the idle task, open the dispatch gate,
/// and elect the first running task. After this returns, the tick handler
/// and dispatch requests are live; the port still has to enter the first
/// task's context ([`start`] does both).
pub fn startup<Traits: PortThreading>() -> Result<(), CreateTaskError> {
    {
        let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
        init_state_if_needed::<Traits>(lock.borrow_mut());
    }

    let kernel = Traits::state();
    let idle_stack = kernel.idle_stack.get() as *mut u8;
    // Safety: the idle stack region is kernel-owned and lives as long as
    // the kernel state
    let idle = unsafe {
        task::init_with_stack::<Traits>(
            task::idle_entry::<Traits>,
            "idle",
            0,
            cfg::MAX_PRIOS - 1,
            idle_stack,
            cfg::IDLE_STACK_SIZE,
        )?
    };

    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    kernel.tick_count.replace(&mut *lock, 0);
    kernel.running_task.replace(&mut *lock, Some(idle));
    task::task_cb::<Traits>(idle)
        .unwrap()
        .st
        .replace(&mut *lock, TaskSt::Running);
    kernel.dispatch_disable.store(0, Ordering::Relaxed);

    // elect the real first task (the idle task loses immediately when
    // anything else is ready)
    task::schedule_inner::<Traits>(lock.borrow_mut());
    Ok(())
}

/// Bring up the scheduler and drop into the first task. Does not return.
pub fn start<Traits: PortThreading>() -> ! {
    if startup::<Traits>().is_err() {
        Traits::trap(Fatal::StartupFailed);
    }
    // Safety: the scheduler state is primed
    unsafe { Traits::start_first_task() }
}

#[cfg(test)]
pub(crate) mod test_stub {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A do-nothing port: enough to exercise the kernel's data structures
    /// from unit tests. Dispatch never actually happens; tests drive the
    /// scheduler by hand.
    pub(crate) struct StubPort;

    static LOCK_ACTIVE: AtomicBool = AtomicBool::new(false);
    static STATE: KernelState<StubPort> = KernelState::INIT;

    unsafe impl PortThreading for StubPort {
        fn state() -> &'static KernelState<Self> {
            &STATE
        }

        unsafe fn try_enter_cpu_lock() -> bool {
            !LOCK_ACTIVE.swap(true, Ordering::Acquire)
        }

        unsafe fn enter_cpu_lock() {
            let was = LOCK_ACTIVE.swap(true, Ordering::Acquire);
            assert!(!was, "nested CPU Lock");
        }

        unsafe fn leave_cpu_lock() {
            LOCK_ACTIVE.store(false, Ordering::Release);
        }

        fn is_cpu_lock_active() -> bool {
            LOCK_ACTIVE.load(Ordering::Relaxed)
        }

        fn is_task_context() -> bool {
            true
        }

        unsafe fn yield_cpu() {}

        unsafe fn pend_dispatch() {}

        unsafe fn initialize_task_state(_task: TaskId) {}

        unsafe fn start_first_task() -> ! {
            unreachable!()
        }

        fn trap(reason: Fatal) -> ! {
            panic!("fatal kernel error: {reason:?}")
        }
    }

    static TEST_GUARD: Mutex<()> = Mutex::new(());

    /// Serialize tests sharing the stub kernel state; hand the body a
    /// freshly reset state with CPU Lock held.
    pub(crate) fn with_state(f: impl FnOnce(klock::CpuLockGuard<StubPort>)) {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        init::<StubPort>().unwrap();
        let lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
        f(lock);
    }

    /// Like [`with_state`], for tests that take CPU Lock themselves.
    pub(crate) fn with_state_unlocked(f: impl FnOnce()) {
        let _guard = TEST_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        init::<StubPort>().unwrap();
        f();
    }
}
