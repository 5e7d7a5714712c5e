//! Kernel hooks: optional observer callbacks registered at runtime.
//!
//! Each hook is a single function pointer. Invocation is best-effort and
//! happens with CPU Lock held, so hooks must not block and must return
//! promptly.
use crate::{
    error::BadContextError,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    PortThreading, TaskId,
};

/// A hook registration passed to [`register`].
#[derive(Clone, Copy)]
pub enum Hook {
    /// The scheduler picked a new running task. Called with the outgoing
    /// task from the dispatch path.
    TaskSwitched(fn(TaskId)),
    /// A task is about to be deleted.
    TaskDelete(fn(TaskId)),
    /// One iteration of the idle task.
    Idle(fn()),
    /// A task's free stack fell below the redline. The kernel traps right
    /// after the hook returns.
    StackOverflow(fn(TaskId)),
    /// A kernel tick was processed; the argument is the new tick count.
    SysTick(fn(u32)),
    /// The tick counter was rebased to avoid deadline overflow.
    TickReset(fn()),
    /// `heap::allocate` failed; the argument is the requested size.
    AllocFailed(fn(usize)),
    /// `heap::free` rejected an address; the argument is that address.
    FreeFailed(fn(usize)),
}

pub(crate) struct HookTable<Traits> {
    pub(crate) task_switched: CpuLockCell<Traits, Option<fn(TaskId)>>,
    pub(crate) task_delete: CpuLockCell<Traits, Option<fn(TaskId)>>,
    pub(crate) idle: CpuLockCell<Traits, Option<fn()>>,
    pub(crate) stack_overflow: CpuLockCell<Traits, Option<fn(TaskId)>>,
    pub(crate) systick: CpuLockCell<Traits, Option<fn(u32)>>,
    pub(crate) tick_reset: CpuLockCell<Traits, Option<fn()>>,
    pub(crate) alloc_failed: CpuLockCell<Traits, Option<fn(usize)>>,
    pub(crate) free_failed: CpuLockCell<Traits, Option<fn(usize)>>,
}

impl<Traits> Init for HookTable<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        task_switched: Init::INIT,
        task_delete: Init::INIT,
        idle: Init::INIT,
        stack_overflow: Init::INIT,
        systick: Init::INIT,
        tick_reset: Init::INIT,
        alloc_failed: Init::INIT,
        free_failed: Init::INIT,
    };
}

impl<Traits> HookTable<Traits> {
    /// Deregister everything. Part of the kernel-state reset.
    pub(crate) fn clear(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.task_switched.replace(&mut *lock, None);
        self.task_delete.replace(&mut *lock, None);
        self.idle.replace(&mut *lock, None);
        self.stack_overflow.replace(&mut *lock, None);
        self.systick.replace(&mut *lock, None);
        self.tick_reset.replace(&mut *lock, None);
        self.alloc_failed.replace(&mut *lock, None);
        self.free_failed.replace(&mut *lock, None);
    }
}

/// Register (or replace) a hook.
pub fn register<Traits: PortThreading>(hook: Hook) -> Result<(), BadContextError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let table = &Traits::state().hooks;
    match hook {
        Hook::TaskSwitched(f) => {
            table.task_switched.replace(&mut *lock, Some(f));
        }
        Hook::TaskDelete(f) => {
            table.task_delete.replace(&mut *lock, Some(f));
        }
        Hook::Idle(f) => {
            table.idle.replace(&mut *lock, Some(f));
        }
        Hook::StackOverflow(f) => {
            table.stack_overflow.replace(&mut *lock, Some(f));
        }
        Hook::SysTick(f) => {
            table.systick.replace(&mut *lock, Some(f));
        }
        Hook::TickReset(f) => {
            table.tick_reset.replace(&mut *lock, Some(f));
        }
        Hook::AllocFailed(f) => {
            table.alloc_failed.replace(&mut *lock, Some(f));
        }
        Hook::FreeFailed(f) => {
            table.free_failed.replace(&mut *lock, Some(f));
        }
    }
    Ok(())
}

/// Invoke a hook cell if one is registered.
pub(crate) fn fire<Traits: PortThreading, A>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    cell: &CpuLockCell<Traits, Option<fn(A)>>,
    arg: A,
) {
    if let Some(f) = cell.get(&*lock) {
        f(arg);
    }
}

/// Invoke an argument-less hook cell if one is registered.
pub(crate) fn fire0<Traits: PortThreading>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    cell: &CpuLockCell<Traits, Option<fn()>>,
) {
    if let Some(f) = cell.get(&*lock) {
        f();
    }
}
