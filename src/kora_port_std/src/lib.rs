//! Simulation environment for running the Kora kernel on a hosted
//! environment.
//!
//! The simulator runs the kernel's state machine deterministically in one
//! thread:
//!
//! - CPU Lock is a process-local flag.
//! - The deferred-switch interrupt is a latched flag; [`dispatch_pending`]
//!   plays the interrupt's role and runs the dispatcher when it is set.
//! - The tick timer is [`advance_ticks`], which feeds the kernel's tick
//!   handler and then drains any pended switch.
//! - Everything that would execute *while the calling task is blocked* -
//!   other tasks, interrupt handlers - is played by a test-installed yield
//!   callback. Each pass through the kernel's blocking loop invokes it
//!   once, so a callback that signals, ticks, or resumes eventually wakes
//!   the caller.
//!
//! Task entry functions are never executed: the test body plays each
//! task's role, checking with [`current_task`] whose role it is playing.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use kora_kernel::{task, timeout, Fatal, KernelState, PortThreading, TaskId};

/// The simulated port.
pub struct SimPort;

static STATE: KernelState<SimPort> = KernelState::INIT;
static LOCK_ACTIVE: AtomicBool = AtomicBool::new(false);
static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);
static IN_YIELD_HOOK: AtomicBool = AtomicBool::new(false);

type YieldHook = Box<dyn FnMut() + Send>;
static YIELD_HOOK: Mutex<Option<YieldHook>> = Mutex::new(None);

// Safety: the simulator upholds the port contract for a single-threaded
// harness; the scenario suite serializes kernel access through `with_sim`
unsafe impl PortThreading for SimPort {
    fn state() -> &'static KernelState<Self> {
        &STATE
    }

    unsafe fn try_enter_cpu_lock() -> bool {
        !LOCK_ACTIVE.swap(true, Ordering::Acquire)
    }

    unsafe fn enter_cpu_lock() {
        let was_active = LOCK_ACTIVE.swap(true, Ordering::Acquire);
        assert!(!was_active, "nested CPU Lock");
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

    unsafe fn yield_cpu() {
        task::note_cooperative_yield::<SimPort>();
        run_yield_hook();
        dispatch();
    }

    unsafe fn pend_dispatch() {
        SWITCH_PENDING.store(true, Ordering::Relaxed);
    }

    unsafe fn initialize_task_state(task: TaskId) {
        // nothing to prime: the simulator never enters a task's frame
        log::trace!("initialize_task_state({task})");
    }

    unsafe fn start_first_task() -> ! {
        panic!("the simulator drives tasks explicitly; use kora_kernel::startup");
    }

    fn trap(reason: Fatal) -> ! {
        panic!("fatal kernel error: {reason:?}");
    }
}

fn run_yield_hook() {
    // a wake path inside the callback can yield again; don't recurse into
    // the callback
    if IN_YIELD_HOOK.swap(true, Ordering::Acquire) {
        return;
    }

    let hook = YIELD_HOOK.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(mut f) = hook {
        f();
        let mut slot = YIELD_HOOK.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(f);
        }
    }

    IN_YIELD_HOOK.store(false, Ordering::Release);
}

/// Run the dispatcher, as the deferred-switch interrupt would.
pub fn dispatch() {
    SWITCH_PENDING.store(false, Ordering::Relaxed);
    // Safety: interrupts are "masked" for the duration, as the dispatch
    // interrupt would have them
    unsafe {
        SimPort::enter_cpu_lock();
        task::schedule::<SimPort>();
        SimPort::leave_cpu_lock();
    }

    if log::log_enabled!(log::Level::Trace) {
        if let Ok(Some(current)) = task::current::<SimPort>() {
            log::trace!("dispatch -> task {current}");
        }
    }
}

/// Run the dispatcher only if a switch was pended since the last dispatch.
pub fn dispatch_pending() {
    if SWITCH_PENDING.swap(false, Ordering::Relaxed) {
        dispatch();
    }
}

/// Feed `n` tick interrupts to the kernel, dispatching after each one.
pub fn advance_ticks(n: u32) {
    for _ in 0..n {
        timeout::tick_handler::<SimPort>();
        dispatch_pending();
    }
}

/// Install the callback standing in for the contexts that run while the
/// calling task is blocked. Replaces any previous callback.
pub fn set_yield_hook(f: impl FnMut() + Send + 'static) {
    *YIELD_HOOK.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(f));
}

pub fn clear_yield_hook() {
    *YIELD_HOOK.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

/// The task the kernel currently considers running.
pub fn current_task() -> Option<TaskId> {
    task::current::<SimPort>().unwrap()
}

/// Serialize simulator use and hand the body a freshly reset kernel.
pub fn with_sim(f: impl FnOnce()) {
    static GUARD: Mutex<()> = Mutex::new(());
    let _guard = GUARD.lock().unwrap_or_else(|e| e.into_inner());

    let _ = env_logger::builder().is_test(true).try_init();

    clear_yield_hook();
    SWITCH_PENDING.store(false, Ordering::Relaxed);
    LOCK_ACTIVE.store(false, Ordering::Relaxed);
    IN_YIELD_HOOK.store(false, Ordering::Relaxed);
    kora_kernel::init::<SimPort>().unwrap();

    f();

    clear_yield_hook();
}
