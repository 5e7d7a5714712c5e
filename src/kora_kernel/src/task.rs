//! Tasks: the TCB arena, the ready structure, and the dispatcher.
use core::sync::atomic::Ordering;

use crate::{
    cfg,
    error::{
        BadContextError, BadIdError, CreateTaskError, DeleteTaskError, GetTaskInfoError,
        ReadyTaskError, SetTaskPriorityError, SleepError, SuspendTaskError,
    },
    heap, hooks, klock,
    klock::{CpuLockCell, CpuLockGuard, CpuLockTokenRefMut},
    list::{ListRef, NodeRef},
    state, timeout,
    utils::Init,
    wait::WaitCancelled,
    Fatal, PortThreading, TaskId,
};

/// Magic word stored in every live TCB; checked on each dispatch.
const TCB_MAGIC: u32 = 0x0F98_4F1C;

/// A task name: a bounded counted string.
pub type TaskName = arrayvec::ArrayString<{ cfg::TASK_NAME_LEN }>;

/// Task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The TCB slot is free.
    Dormant,
    /// On a ready list, waiting to be picked.
    Ready,
    /// The task the scheduler last picked. Indistinguishable from `Ready`
    /// in the list structures.
    Running,
    /// On the sleep list with a wake deadline.
    Sleeping,
    /// Waiting on an IPC object's block list.
    Blocking,
    /// Detached from every scheduling structure until `task::ready`.
    Suspended,
}

impl Init for TaskSt {
    const INIT: Self = Self::Dormant;
}

/// *Task control block* - the per-task kernel record.
pub(crate) struct TaskCb<Traits> {
    /// Saved stack pointer. Maintained by the port during context save.
    pub(crate) top_of_stack: CpuLockCell<Traits, usize>,
    /// Corruption canary, `TCB_MAGIC` while the slot is live.
    pub(crate) magic: CpuLockCell<Traits, u32>,
    pub(crate) st: CpuLockCell<Traits, TaskSt>,
    pub(crate) priority: CpuLockCell<Traits, usize>,
    pub(crate) name: CpuLockCell<Traits, TaskName>,
    pub(crate) stack_base: CpuLockCell<Traits, usize>,
    pub(crate) stack_size: CpuLockCell<Traits, usize>,
    /// Whether the stack came from the kernel heap (deleted through the
    /// deferred-free queue) or from the caller.
    pub(crate) stack_heap_backed: CpuLockCell<Traits, bool>,
    /// Smallest free-stack headroom ever observed.
    pub(crate) min_stack: CpuLockCell<Traits, usize>,
    /// CPU-time attribution, in ticks.
    pub(crate) occupied_ticks: CpuLockCell<Traits, u32>,
    /// The event-flag predicate last published by `event_group::wait`.
    pub(crate) evt_flags: CpuLockCell<Traits, u32>,
    /// Outcome of the task's current/last wait, set by its wake-upper.
    pub(crate) wait_result: CpuLockCell<Traits, Result<(), WaitCancelled>>,
    pub(crate) entry: CpuLockCell<Traits, Option<fn(usize)>>,
    pub(crate) entry_param: CpuLockCell<Traits, usize>,
}

impl<Traits> Init for TaskCb<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        top_of_stack: Init::INIT,
        magic: Init::INIT,
        st: CpuLockCell::new(TaskSt::Dormant),
        priority: Init::INIT,
        name: Init::INIT,
        stack_base: Init::INIT,
        stack_size: Init::INIT,
        stack_heap_backed: Init::INIT,
        min_stack: Init::INIT,
        occupied_ticks: Init::INIT,
        evt_flags: Init::INIT,
        wait_result: CpuLockCell::new(Ok(())),
        entry: Init::INIT,
        entry_param: Init::INIT,
    };
}

/// Get the `TaskCb` for the given id.
pub(crate) fn task_cb<Traits: PortThreading>(
    task: TaskId,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    Traits::state()
        .tasks
        .get(task.get() - 1)
        .ok_or(BadIdError::BadId)
}

/// Like [`task_cb`], but also rejects dormant slots.
pub(crate) fn live_task_cb<Traits: PortThreading>(
    lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) -> Result<&'static TaskCb<Traits>, BadIdError> {
    let cb = task_cb::<Traits>(task)?;
    if *cb.st.read(&*lock) == TaskSt::Dormant {
        Err(BadIdError::BadId)
    } else {
        Ok(cb)
    }
}

pub(crate) fn state_node_of(task: TaskId) -> NodeRef {
    NodeRef::state_node(task.get() - 1)
}

pub(crate) fn event_node_of(task: TaskId) -> NodeRef {
    NodeRef::event_node(task.get() - 1)
}

pub(crate) fn link_node_of(task: TaskId) -> NodeRef {
    NodeRef::link_node(task.get() - 1)
}

/// The task owning a node on a ready list, the sleep list, or a block list.
pub(crate) fn task_of_node(node: NodeRef) -> TaskId {
    TaskId::new(node.task_index().unwrap() + 1).unwrap()
}

// Ready structure
// ---------------------------------------------------------------------------

/// Put the task on the ready list of its priority and update the bitmap.
/// Returns `true` if the task became the new highest-priority runnable.
pub(crate) fn add_to_ready<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) -> bool {
    let kernel = Traits::state();
    let cb = task_cb::<Traits>(task).unwrap();
    let prio = cb.priority.get(&*lock);

    kernel.prio_bitmap.write(&mut *lock).set(prio);
    cb.st.replace(&mut *lock, TaskSt::Ready);
    kernel
        .lists
        .insert_back(lock.borrow_mut(), ListRef::ready(prio), state_node_of(task))
        .expect("state node already linked");

    if prio < kernel.highest_prio.get(&*lock) {
        kernel.highest_prio.replace(&mut *lock, prio);
        true
    } else {
        false
    }
}

/// Take the task off its ready list, fixing the bitmap, the cached highest
/// priority, and the round-robin cursor resting on its node.
pub(crate) fn remove_from_ready<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    let kernel = Traits::state();
    let cb = task_cb::<Traits>(task).unwrap();
    let prio = cb.priority.get(&*lock);
    let node = state_node_of(task);

    if kernel.lists.len(lock.borrow_mut(), ListRef::ready(prio)) == 1 {
        kernel.prio_bitmap.write(&mut *lock).clear(prio);
    }

    let prev = kernel.lists.remove(lock.borrow_mut(), node);
    if let Some(prev) = prev {
        let iter_cell = &kernel.task_iter[prio];
        if iter_cell.get(&*lock) == node {
            iter_cell.replace(&mut *lock, prev);
        }
    }

    update_highest_prio::<Traits>(lock);
}

/// Detach the state node wherever it is: via the ready bookkeeping when the
/// task is runnable, directly otherwise (sleep list, or already detached).
pub(crate) fn remove_ready_node<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    let cb = task_cb::<Traits>(task).unwrap();
    match cb.st.get(&*lock) {
        TaskSt::Ready | TaskSt::Running => remove_from_ready::<Traits>(lock, task),
        _ => {
            Traits::state().lists.remove(lock.borrow_mut(), state_node_of(task));
        }
    }
}

fn update_highest_prio<Traits: PortThreading>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let kernel = Traits::state();
    let highest = kernel
        .prio_bitmap
        .read(&*lock)
        .find_set()
        .unwrap_or(cfg::MAX_PRIOS - 1);
    kernel.highest_prio.replace(&mut *lock, highest);
}

// Dispatch
// ---------------------------------------------------------------------------

/// Pick the next task to run: advance the round-robin cursor of the highest
/// non-empty priority level and make its task `Running`.
///
/// This is the decision half of a context switch. The port calls it from the
/// deferred-switch interrupt between saving the outgoing task's registers
/// and restoring the incoming task's.
///
/// # Safety
///
/// All maskable interrupts must be disabled (the dispatch interrupt runs
/// that way); no `CpuLockGuard` may be live.
pub unsafe fn schedule<Traits: PortThreading>() {
    // Safety: the caller masked interrupts and owns no guard
    let mut lock = unsafe { klock::CpuLockGuard::<Traits>::assume() };
    schedule_inner(lock.borrow_mut());
    // the interrupt mask is the caller's business
    core::mem::forget(lock);
}

pub(crate) fn schedule_inner<Traits: PortThreading>(mut lock: CpuLockTokenRefMut<'_, Traits>) {
    let kernel = Traits::state();

    if let Some(prev) = kernel.running_task.get(&*lock) {
        let cb = task_cb::<Traits>(prev).unwrap();
        if cb.st.get(&*lock) != TaskSt::Dormant {
            if cb.magic.get(&*lock) != TCB_MAGIC {
                Traits::trap(Fatal::TcbCorruption);
            }
            stack_safety_check::<Traits>(lock.borrow_mut(), prev);
            hooks::fire(lock.borrow_mut(), &kernel.hooks.task_switched, prev);

            if cb.st.get(&*lock) == TaskSt::Running {
                cb.st.replace(&mut *lock, TaskSt::Ready);
            }
        }
    }

    let hp = kernel.highest_prio.get(&*lock);
    let ready = ListRef::ready(hp);
    let head = NodeRef::head_of(ready);
    debug_assert!(
        !kernel.lists.is_empty(lock.borrow_mut(), ready),
        "dispatch with no runnable task"
    );

    let iter_cell = &kernel.task_iter[hp];
    let mut cursor = iter_cell.get(&*lock);
    cursor = kernel.lists.raw_next(lock.borrow_mut(), cursor);
    if cursor == head {
        cursor = kernel.lists.raw_next(lock.borrow_mut(), cursor);
    }
    iter_cell.replace(&mut *lock, cursor);

    let next = task_of_node(cursor);
    task_cb::<Traits>(next)
        .unwrap()
        .st
        .replace(&mut *lock, TaskSt::Running);
    kernel.running_task.replace(&mut *lock, Some(next));
}

/// Watchdog run on every dispatch: trap when the outgoing task's stack
/// headroom fell below the redline, and keep the low-water mark current.
fn stack_safety_check<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) {
    let cb = task_cb::<Traits>(task).unwrap();
    let free = cb
        .top_of_stack
        .get(&*lock)
        .saturating_sub(cb.stack_base.get(&*lock));

    if free < cfg::STACK_REDLINE {
        hooks::fire(lock.borrow_mut(), &Traits::state().hooks.stack_overflow, task);
        Traits::trap(Fatal::StackOverflow);
    }

    if free < cb.min_stack.get(&*lock) {
        cb.min_stack.replace(&mut *lock, free);
    }
}

/// Gate task dispatch off without masking interrupts. Nests.
pub fn disable_task_switch<Traits: PortThreading>() {
    Traits::state()
        .dispatch_disable
        .fetch_add(1, Ordering::Relaxed);
}

/// Undo one [`disable_task_switch`]. When the gate fully opens and a more
/// urgent task became ready in the meantime, yield to it.
pub fn enable_task_switch<Traits: PortThreading>() {
    let kernel = Traits::state();
    let prev = kernel.dispatch_disable.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0);

    if prev == 1 && Traits::is_task_context() {
        if let Ok(lock) = klock::CpuLockGuard::<Traits>::acquire() {
            unlock_cpu_and_check_preemption(lock);
        }
    }
}

/// Relinquish CPU Lock. After that, if a task more urgent than the running
/// one is ready, call `Port::yield_cpu`.
///
/// System services that make a task Ready call this before returning.
pub(crate) fn unlock_cpu_and_check_preemption<Traits: PortThreading>(
    mut lock: CpuLockGuard<Traits>,
) {
    let kernel = Traits::state();

    if kernel.dispatch_disable.load(Ordering::Relaxed) != 0 {
        return;
    }

    let prev_task_priority = match kernel.running_task.get(&*lock) {
        Some(running) => {
            let cb = task_cb::<Traits>(running).unwrap();
            if cb.st.get(&*lock) == TaskSt::Running {
                cb.priority.get(&*lock)
            } else {
                usize::MAX
            }
        }
        // the scheduler has not started; nothing to preempt
        None => return,
    };

    let has_preempting_task = kernel.highest_prio.get(&*lock) < prev_task_priority;

    // Relinquish CPU Lock
    drop(lock);

    if has_preempting_task {
        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };
    }
}

/// Interrupt-side counterpart of [`unlock_cpu_and_check_preemption`]: pend
/// the deferred-switch interrupt instead of yielding synchronously.
pub(crate) fn pend_switch_if_preempting<Traits: PortThreading>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let kernel = Traits::state();

    if kernel.dispatch_disable.load(Ordering::Relaxed) != 0 {
        return;
    }

    let prev_task_priority = match kernel.running_task.get(&*lock) {
        Some(running) => {
            let cb = task_cb::<Traits>(running).unwrap();
            if cb.st.get(&*lock) == TaskSt::Running {
                cb.priority.get(&*lock)
            } else {
                usize::MAX
            }
        }
        None => return,
    };

    if kernel.highest_prio.get(&*lock) < prev_task_priority {
        // Safety: pending the switch is always safe; it fires at interrupt
        // exit
        unsafe { Traits::pend_dispatch() };
    }
}

/// Spin until the current task is `Running` again. The caller has moved it
/// to some waiting state; each loop iteration hands the CPU over.
pub(crate) fn wait_until_woken_up<Traits: PortThreading>(
    lock: CpuLockTokenRefMut<'_, Traits>,
) {
    let running = Traits::state().running_task.get(&*lock).unwrap();
    let cb = task_cb::<Traits>(running).unwrap();
    debug_assert_ne!(cb.st.get(&*lock), TaskSt::Running);

    loop {
        // Temporarily release CPU Lock before calling `yield_cpu`.
        // Safety: (1) no cell is touched until the lock is re-entered,
        //         (2) CPU Lock is currently active, and (3) it is re-entered
        //         before this function returns.
        unsafe { Traits::leave_cpu_lock() };

        // Safety: CPU Lock inactive
        unsafe { Traits::yield_cpu() };

        unsafe { Traits::enter_cpu_lock() };

        if cb.st.get(&*lock) == TaskSt::Running {
            break;
        }
    }
}

/// Cooperative yield: hand the CPU to the next ready task of the same
/// priority and suppress the next tick-driven switch.
pub fn yield_now<Traits: PortThreading>() -> Result<(), BadContextError> {
    state::expect_waitable_context::<Traits>()?;
    // Safety: CPU Lock inactive (checked above via task context)
    unsafe { Traits::yield_cpu() };
    Ok(())
}

/// Record that the running task scheduled voluntarily; the next tick will
/// not force a round-robin switch. Ports call this from their `yield_cpu`.
pub fn note_cooperative_yield<Traits: PortThreading>() {
    Traits::state()
        .actively_scheduled
        .store(true, Ordering::Relaxed);
}

// Creation and deletion
// ---------------------------------------------------------------------------

fn truncate_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// Create a task with a stack carved from the kernel heap.
pub fn create<Traits: PortThreading>(
    entry: fn(usize),
    name: &str,
    param: usize,
    priority: usize,
    stack_size: usize,
) -> Result<TaskId, CreateTaskError> {
    if priority >= cfg::MAX_PRIOS || stack_size < cfg::MIN_STACK_SIZE {
        return Err(CreateTaskError::Invalid);
    }

    let stack = heap::allocate::<Traits>(stack_size)?;

    // Safety: the stack region is freshly allocated and exclusively ours
    let result = unsafe {
        spawn::<Traits>(entry, name, param, priority, stack.as_ptr() as usize, stack_size, true)
    };
    if result.is_err() {
        let _ = heap::free::<Traits>(stack);
    }
    result
}

/// Create a task on a caller-provided stack.
///
/// # Safety
///
/// `stack .. stack + stack_size` must be valid for reads and writes for the
/// task's whole lifetime and must not be used for anything else.
pub unsafe fn init_with_stack<Traits: PortThreading>(
    entry: fn(usize),
    name: &str,
    param: usize,
    priority: usize,
    stack: *mut u8,
    stack_size: usize,
) -> Result<TaskId, CreateTaskError> {
    if priority >= cfg::MAX_PRIOS || stack_size < cfg::MIN_STACK_SIZE {
        return Err(CreateTaskError::Invalid);
    }
    unsafe { spawn::<Traits>(entry, name, param, priority, stack as usize, stack_size, false) }
}

unsafe fn spawn<Traits: PortThreading>(
    entry: fn(usize),
    name: &str,
    param: usize,
    priority: usize,
    stack_base: usize,
    stack_size: usize,
    stack_heap_backed: bool,
) -> Result<TaskId, CreateTaskError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();
    crate::init_state_if_needed::<Traits>(lock.borrow_mut());

    let index = (0..cfg::NUM_TASKS)
        .find(|&i| kernel.tasks[i].st.get(&*lock) == TaskSt::Dormant)
        .ok_or(CreateTaskError::OutOfMemory)?;
    let task = TaskId::new(index + 1).unwrap();
    let cb = &kernel.tasks[index];

    cb.name.replace(&mut *lock, truncate_name(name));
    cb.priority.replace(&mut *lock, priority);
    cb.stack_base.replace(&mut *lock, stack_base);
    cb.stack_size.replace(&mut *lock, stack_size);
    cb.stack_heap_backed.replace(&mut *lock, stack_heap_backed);
    cb.top_of_stack.replace(&mut *lock, stack_base + stack_size);
    cb.magic.replace(&mut *lock, TCB_MAGIC);
    cb.min_stack.replace(&mut *lock, usize::MAX);
    cb.occupied_ticks.replace(&mut *lock, 0);
    cb.evt_flags.replace(&mut *lock, 0);
    cb.wait_result.replace(&mut *lock, Ok(()));
    cb.entry.replace(&mut *lock, Some(entry));
    cb.entry_param.replace(&mut *lock, param);

    kernel
        .lists
        .insert_back(lock.borrow_mut(), ListRef::all_tasks(), link_node_of(task))
        .expect("link node already linked");

    // Safety: the stack region is valid per this function's contract and
    // the TCB is fully initialized
    unsafe { Traits::initialize_task_state(task) };

    add_to_ready::<Traits>(lock.borrow_mut(), task);
    Ok(task)
}

/// Delete a task: detach it from every kernel structure and release its
/// heap-backed stack through the deferred-free queue.
pub fn delete<Traits: PortThreading>(task: TaskId) -> Result<(), DeleteTaskError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;

    hooks::fire(lock.borrow_mut(), &kernel.hooks.task_delete, task);

    remove_ready_node::<Traits>(lock.borrow_mut(), task);
    kernel.lists.remove(lock.borrow_mut(), event_node_of(task));
    kernel.lists.remove(lock.borrow_mut(), link_node_of(task));

    if cb.stack_heap_backed.get(&*lock) {
        let stack = cb.stack_base.get(&*lock) as *mut u8;
        let _ = heap::queue_free_with_lock::<Traits>(
            lock.borrow_mut(),
            core::ptr::NonNull::new(stack).unwrap(),
        );
    }

    cb.st.replace(&mut *lock, TaskSt::Dormant);
    cb.magic.replace(&mut *lock, 0);

    let was_current = kernel.running_task.get(&*lock) == Some(task);
    if was_current {
        kernel.running_task.replace(&mut *lock, None);
        drop(lock);
        // Safety: CPU Lock inactive; the dispatch picks a successor
        unsafe { Traits::yield_cpu() };
    }

    Ok(())
}

/// Delete the calling task. The port's initial stack frame routes a task
/// entry function's return here.
pub fn exit<Traits: PortThreading>() -> ! {
    if let Ok(lock) = klock::CpuLockGuard::<Traits>::acquire() {
        if let Some(current) = Traits::state().running_task.get(&*lock) {
            drop(lock);
            let _ = delete::<Traits>(current);
        }
    }

    loop {
        // Safety: CPU Lock inactive; a successor takes over for good
        unsafe { Traits::yield_cpu() };
    }
}

// State transitions
// ---------------------------------------------------------------------------

/// Make a suspended, sleeping, or blocked task runnable. Readying a task
/// that is blocked on an IPC object cancels that wait.
pub fn ready<Traits: PortThreading>(task: TaskId) -> Result<(), ReadyTaskError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    if ready_with_lock::<Traits>(lock.borrow_mut(), task)? {
        unlock_cpu_and_check_preemption(lock);
    }
    Ok(())
}

/// Interrupt-safe variant of [`ready`].
pub fn ready_isr<Traits: PortThreading>(task: TaskId) -> Result<(), ReadyTaskError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    if ready_with_lock::<Traits>(lock.borrow_mut(), task)? {
        pend_switch_if_preempting::<Traits>(lock.borrow_mut());
    }
    Ok(())
}

/// Core of [`ready`]: detach both scheduling nodes and put the task on its
/// ready list. Returns whether the caller should run a preemption check.
pub(crate) fn ready_with_lock<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) -> Result<bool, BadIdError> {
    let kernel = Traits::state();
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;

    match cb.st.get(&*lock) {
        TaskSt::Ready | TaskSt::Running => return Ok(false),
        TaskSt::Blocking => {
            // an out-of-band wake cancels the wait in progress
            cb.wait_result
                .replace(&mut *lock, Err(WaitCancelled::Interrupted));
        }
        TaskSt::Sleeping | TaskSt::Suspended => {}
        TaskSt::Dormant => unreachable!(),
    }

    kernel.lists.remove(lock.borrow_mut(), state_node_of(task));
    kernel.lists.remove(lock.borrow_mut(), event_node_of(task));
    Ok(add_to_ready::<Traits>(lock.borrow_mut(), task))
}

/// Wake a blocked task with a completed wait result. Internal wake path of
/// the IPC objects; the block-list node has already been unlinked.
pub(crate) fn wake_with_lock<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) -> bool {
    let cb = task_cb::<Traits>(task).unwrap();
    debug_assert_eq!(cb.st.get(&*lock), TaskSt::Blocking);

    cb.wait_result.replace(&mut *lock, Ok(()));
    Traits::state()
        .lists
        .remove(lock.borrow_mut(), state_node_of(task));
    add_to_ready::<Traits>(lock.borrow_mut(), task)
}

/// Suspend a task: detach it from the ready/sleep structures and from any
/// IPC block list. A blocked task's wait is cancelled.
pub fn suspend<Traits: PortThreading>(task: TaskId) -> Result<(), SuspendTaskError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;

    if cb.st.get(&*lock) == TaskSt::Blocking {
        cb.wait_result
            .replace(&mut *lock, Err(WaitCancelled::Interrupted));
    }

    let is_current = kernel.running_task.get(&*lock) == Some(task);
    if is_current {
        // self-suspension parks below, which needs a waitable context
        state::expect_waitable_context::<Traits>()?;
    }

    remove_ready_node::<Traits>(lock.borrow_mut(), task);
    kernel.lists.remove(lock.borrow_mut(), event_node_of(task));
    cb.st.replace(&mut *lock, TaskSt::Suspended);

    if is_current {
        // parked here until `task::ready`
        wait_until_woken_up::<Traits>(lock.borrow_mut());
    }

    Ok(())
}

/// Interrupt-safe variant of [`suspend`]; never parks, pends a switch when
/// the running task was the target.
pub fn suspend_isr<Traits: PortThreading>(task: TaskId) -> Result<(), SuspendTaskError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;

    if cb.st.get(&*lock) == TaskSt::Blocking {
        cb.wait_result
            .replace(&mut *lock, Err(WaitCancelled::Interrupted));
    }

    remove_ready_node::<Traits>(lock.borrow_mut(), task);
    kernel.lists.remove(lock.borrow_mut(), event_node_of(task));
    cb.st.replace(&mut *lock, TaskSt::Suspended);

    if kernel.running_task.get(&*lock) == Some(task) {
        // Safety: pending the switch is always safe
        unsafe { Traits::pend_dispatch() };
    }

    Ok(())
}

/// Put the calling task to sleep for at least `ticks` whole ticks.
pub fn sleep<Traits: PortThreading>(ticks: u32) -> Result<(), SleepError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    state::expect_waitable_context::<Traits>()?;

    let kernel = Traits::state();
    let Some(current) = kernel.running_task.get(&*lock) else {
        return Err(SleepError::BadContext);
    };
    let cb = task_cb::<Traits>(current).unwrap();

    cb.st.replace(&mut *lock, TaskSt::Sleeping);
    remove_from_ready::<Traits>(lock.borrow_mut(), current);
    // +1 so the task is not woken by the tick edge already in flight
    timeout::add_to_sleep::<Traits>(lock.borrow_mut(), current, ticks.saturating_add(1));

    wait_until_woken_up::<Traits>(lock.borrow_mut());
    Ok(())
}

/// Change a task's priority, relocating it between ready lists when it is
/// runnable. Returns the previous priority. This is also the primitive the
/// mutex uses for priority inheritance.
pub fn modify_priority<Traits: PortThreading>(
    task: TaskId,
    new_priority: usize,
) -> Result<usize, SetTaskPriorityError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let old = modify_priority_with_lock::<Traits>(lock.borrow_mut(), task, new_priority)?;
    unlock_cpu_and_check_preemption(lock);
    Ok(old)
}

pub(crate) fn modify_priority_with_lock<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
    new_priority: usize,
) -> Result<usize, SetTaskPriorityError> {
    if new_priority >= cfg::MAX_PRIOS {
        return Err(SetTaskPriorityError::Invalid);
    }

    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;
    let old = cb.priority.get(&*lock);
    if old == new_priority {
        return Ok(old);
    }

    match cb.st.get(&*lock) {
        TaskSt::Ready | TaskSt::Running => {
            let st = cb.st.get(&*lock);
            remove_from_ready::<Traits>(lock.borrow_mut(), task);
            cb.priority.replace(&mut *lock, new_priority);
            add_to_ready::<Traits>(lock.borrow_mut(), task);
            // `add_to_ready` leaves the task `Ready`; the running task is
            // still running
            if st == TaskSt::Running {
                cb.st.replace(&mut *lock, TaskSt::Running);
            }
        }
        _ => {
            // not on a ready list; the new priority takes effect on wake
            cb.priority.replace(&mut *lock, new_priority);
        }
    }

    Ok(old)
}

// Introspection
// ---------------------------------------------------------------------------

/// The identifier of the running task, or `None` before the scheduler
/// starts.
pub fn current<Traits: PortThreading>() -> Result<Option<TaskId>, BadContextError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    Ok(Traits::state().running_task.get(&*lock))
}

pub fn name<Traits: PortThreading>(task: TaskId) -> Result<TaskName, GetTaskInfoError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;
    Ok(cb.name.get(&*lock))
}

pub fn state_of<Traits: PortThreading>(task: TaskId) -> Result<TaskSt, GetTaskInfoError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let cb = task_cb::<Traits>(task)?;
    Ok(cb.st.get(&*lock))
}

/// The task's current (possibly boosted) priority.
pub fn priority<Traits: PortThreading>(task: TaskId) -> Result<usize, GetTaskInfoError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;
    Ok(cb.priority.get(&*lock))
}

/// Ticks during which the task was the running task.
pub fn occupied_ticks<Traits: PortThreading>(task: TaskId) -> Result<u32, GetTaskInfoError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;
    Ok(cb.occupied_ticks.get(&*lock))
}

/// Smallest stack headroom the dispatcher ever observed for the task.
pub fn min_stack<Traits: PortThreading>(task: TaskId) -> Result<usize, GetTaskInfoError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let cb = live_task_cb::<Traits>(lock.borrow_mut(), task)?;
    Ok(cb.min_stack.get(&*lock))
}

/// Ticks remaining until the task's sleep deadline; `u32::MAX` when it is
/// blocked without a deadline. Also used internally to re-arm a wait after
/// an unsuccessful wake.
pub fn left_sleep_ticks<Traits: PortThreading>(task: TaskId) -> Result<u32, GetTaskInfoError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let _ = live_task_cb::<Traits>(lock.borrow_mut(), task)?;
    Ok(left_sleep_ticks_with_lock::<Traits>(lock.borrow_mut(), task))
}

pub(crate) fn left_sleep_ticks_with_lock<Traits: PortThreading>(
    mut lock: CpuLockTokenRefMut<'_, Traits>,
    task: TaskId,
) -> u32 {
    let kernel = Traits::state();
    let deadline = kernel.lists.value(lock.borrow_mut(), state_node_of(task));
    if deadline == u32::MAX {
        return u32::MAX;
    }

    let now = kernel.tick_count.get(&*lock);
    deadline.saturating_sub(now)
}

/// Find a task by name. The first match on the all-tasks list wins.
pub fn find<Traits: PortThreading>(name: &str) -> Result<Option<TaskId>, BadContextError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();

    let list = ListRef::all_tasks();
    let mut cursor = kernel.lists.first(lock.borrow_mut(), list);
    while let Some(node) = cursor {
        let task = task_of_node(node);
        let cb = task_cb::<Traits>(task).unwrap();
        if &*cb.name.read(&*lock) == name {
            return Ok(Some(task));
        }
        cursor = kernel.lists.next_in(lock.borrow_mut(), list, node);
    }
    Ok(None)
}

/// Visit every existing task.
pub fn for_each<Traits: PortThreading>(
    mut f: impl FnMut(TaskId),
) -> Result<(), BadContextError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();

    let list = ListRef::all_tasks();
    let mut cursor = kernel.lists.first(lock.borrow_mut(), list);
    while let Some(node) = cursor {
        f(task_of_node(node));
        cursor = kernel.lists.next_in(lock.borrow_mut(), list, node);
    }
    Ok(())
}

/// Number of existing tasks, in whatever state.
pub fn count<Traits: PortThreading>() -> Result<usize, BadContextError> {
    let mut lock = klock::CpuLockGuard::<Traits>::acquire()?;
    Ok(Traits::state()
        .lists
        .len(lock.borrow_mut(), ListRef::all_tasks()))
}

// Idle services
// ---------------------------------------------------------------------------

/// The idle task body: never blocks.
pub fn idle_entry<Traits: PortThreading>(_: usize) {
    loop {
        idle_step::<Traits>();
    }
}

/// One iteration of the idle task: reclaim deferred frees, refresh the
/// CPU-utilization estimate, run the idle hook.
pub fn idle_step<Traits: PortThreading>() {
    let _ = heap::drain_deferred::<Traits>();

    if let Ok(mut lock) = klock::CpuLockGuard::<Traits>::acquire() {
        let kernel = Traits::state();
        let now = kernel.tick_count.get(&*lock);

        // count each tick during which the idle task got to run
        if kernel.usage_last_tick.get(&*lock) != now {
            kernel.usage_last_tick.replace(&mut *lock, now);
            kernel
                .usage_idle_ticks
                .replace_with(&mut *lock, |t| *t + 1);
        }

        let begin = kernel.usage_begin_tick.get(&*lock);
        if now.wrapping_sub(begin) >= cfg::CPU_USAGE_WINDOW {
            let idle = kernel.usage_idle_ticks.get(&*lock).min(cfg::CPU_USAGE_WINDOW);
            let usage = 100 - idle * 100 / cfg::CPU_USAGE_WINDOW;
            kernel.cpu_usage.replace(&mut *lock, usage);
            kernel.usage_begin_tick.replace(&mut *lock, now);
            kernel.usage_idle_ticks.replace(&mut *lock, 0);
        }

        hooks::fire0(lock.borrow_mut(), &kernel.hooks.idle);
    }
}

/// CPU utilization over the last completed window, in percent. Coarse: the
/// estimate counts the ticks during which the idle task never ran.
pub fn cpu_utilization<Traits: PortThreading>() -> Result<u32, BadContextError> {
    let lock = klock::CpuLockGuard::<Traits>::acquire()?;
    let kernel = Traits::state();
    let now = kernel.tick_count.get(&*lock);
    let begin = kernel.usage_begin_tick.get(&*lock);

    // the window has gone stale: the idle task has not run at all
    if now.wrapping_sub(begin) > cfg::CPU_USAGE_WINDOW {
        return Ok(100);
    }
    Ok(kernel.cpu_usage.get(&*lock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_stub::{with_state_unlocked, StubPort};
    use crate::PortThreading as _;

    fn noop(_: usize) {}

    fn spawn(name: &str, prio: usize) -> TaskId {
        create::<StubPort>(noop, name, 0, prio, 512).unwrap()
    }

    /// Bitmap bit p is set iff ready[p] is non-empty, and the cached
    /// highest priority is the lowest set bit (or the idle level).
    fn check_ready_invariants() {
        let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
        let kernel = StubPort::state();
        let mut lowest = None;
        for prio in 0..cfg::MAX_PRIOS {
            let non_empty = !kernel
                .lists
                .is_empty(lock.borrow_mut(), ListRef::ready(prio));
            assert_eq!(kernel.prio_bitmap.read(&*lock).get(prio), non_empty);
            if non_empty && lowest.is_none() {
                lowest = Some(prio);
            }
        }
        assert_eq!(
            kernel.highest_prio.get(&*lock),
            lowest.unwrap_or(cfg::MAX_PRIOS - 1)
        );
    }

    #[test]
    fn create_find_and_count() {
        with_state_unlocked(|| {
            let a = spawn("alpha", 4);
            let b = spawn("beta", 6);
            check_ready_invariants();

            assert_eq!(count::<StubPort>().unwrap(), 2);
            assert_eq!(find::<StubPort>("alpha").unwrap(), Some(a));
            assert_eq!(find::<StubPort>("beta").unwrap(), Some(b));
            assert_eq!(find::<StubPort>("gamma").unwrap(), None);
            assert_eq!(&*name::<StubPort>(a).unwrap(), "alpha");
            assert_eq!(state_of::<StubPort>(a).unwrap(), TaskSt::Ready);

            let mut visited = std::vec::Vec::new();
            for_each::<StubPort>(|t| visited.push(t)).unwrap();
            assert_eq!(visited, [a, b]);
        });
    }

    #[test]
    fn long_names_are_truncated() {
        with_state_unlocked(|| {
            let t = spawn("a-name-too-long-to-fit-in-a-tcb", 4);
            let stored = name::<StubPort>(t).unwrap();
            assert_eq!(stored.len(), cfg::TASK_NAME_LEN);
            assert!("a-name-too-long-to-fit-in-a-tcb".starts_with(&*stored));
        });
    }

    #[test]
    fn bad_arguments_are_rejected() {
        with_state_unlocked(|| {
            assert_eq!(
                create::<StubPort>(noop, "t", 0, cfg::MAX_PRIOS, 512),
                Err(CreateTaskError::Invalid)
            );
            assert_eq!(
                create::<StubPort>(noop, "t", 0, 1, cfg::MIN_STACK_SIZE - 1),
                Err(CreateTaskError::Invalid)
            );
        });
    }

    #[test]
    fn modify_priority_relocates_ready_tasks() {
        with_state_unlocked(|| {
            let a = spawn("a", 8);
            let b = spawn("b", 8);
            check_ready_invariants();

            let old = modify_priority::<StubPort>(a, 2).unwrap();
            assert_eq!(old, 8);
            assert_eq!(priority::<StubPort>(a).unwrap(), 2);
            check_ready_invariants();

            // `b` stays behind at its old level
            assert_eq!(priority::<StubPort>(b).unwrap(), 8);
            let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
            assert_eq!(
                StubPort::state()
                    .lists
                    .len(lock.borrow_mut(), ListRef::ready(8)),
                1
            );
        });
    }

    #[test]
    fn delete_releases_the_slot_and_the_list_entry() {
        with_state_unlocked(|| {
            let a = spawn("a", 8);
            let before = heap::remain_size::<StubPort>().unwrap();

            delete::<StubPort>(a).unwrap();
            check_ready_invariants();
            assert_eq!(count::<StubPort>().unwrap(), 0);
            assert_eq!(state_of::<StubPort>(a).unwrap(), TaskSt::Dormant);
            assert_eq!(delete::<StubPort>(a), Err(DeleteTaskError::BadId));

            // the stack comes back once the idle task drains the queue
            heap::drain_deferred::<StubPort>().unwrap();
            assert!(heap::remain_size::<StubPort>().unwrap() > before);
        });
    }

    #[test]
    fn suspend_detaches_and_ready_requeues() {
        with_state_unlocked(|| {
            let a = spawn("a", 3);
            let b = spawn("b", 3);

            suspend::<StubPort>(a).unwrap();
            assert_eq!(state_of::<StubPort>(a).unwrap(), TaskSt::Suspended);
            check_ready_invariants();

            ready::<StubPort>(a).unwrap();
            assert_eq!(state_of::<StubPort>(a).unwrap(), TaskSt::Ready);
            check_ready_invariants();

            // FIFO within the level: `a` re-entered at the back
            let mut lock = klock::CpuLockGuard::<StubPort>::acquire().unwrap();
            let kernel = StubPort::state();
            let first = kernel
                .lists
                .first(lock.borrow_mut(), ListRef::ready(3))
                .unwrap();
            assert_eq!(task_of_node(first), b);
        });
    }
}
