//! Build-time kernel configuration.
//!
//! These constants play the role of the configuration header of a classic
//! embedded kernel: they size every kernel-resident arena and fix the few
//! numeric policies that must be known at compile time. Applications that
//! need different limits edit this module (or patch it with a build script)
//! and rebuild the kernel.

/// Number of priority levels. Priority 0 is the most urgent; priority
/// `MAX_PRIOS - 1` is reserved for the idle task.
pub const MAX_PRIOS: usize = 16;

/// Maximum number of concurrently existing tasks, the idle task included.
pub const NUM_TASKS: usize = 16;

/// Capacity of the counting-semaphore arena.
pub const NUM_SEMAPHORES: usize = 16;

/// Capacity of the mutex arena.
pub const NUM_MUTEXES: usize = 16;

/// Capacity of the event-group arena.
pub const NUM_EVENT_GROUPS: usize = 8;

/// Capacity of the message-queue arena.
pub const NUM_MSG_QUEUES: usize = 8;

/// Capacity of the stream-queue arena.
pub const NUM_STREAM_QUEUES: usize = 8;

/// Size in bytes of the kernel heap region.
pub const HEAP_SIZE: usize = 64 * 1024;

/// Capacity in bytes of a task name, excluding no terminator (names are
/// counted strings, not C strings).
pub const TASK_NAME_LEN: usize = 16;

/// Smallest accepted task stack size in bytes.
pub const MIN_STACK_SIZE: usize = 256;

/// Stack size of the kernel-owned idle task.
pub const IDLE_STACK_SIZE: usize = 512;

/// Kernel tick frequency in Hz. The kernel itself only counts ticks; this
/// constant is for ports programming their tick timer and for applications
/// converting ticks to wall time.
pub const TICK_HZ: u32 = 1000;

/// Free stack headroom below which the scheduler declares a stack overflow.
pub const STACK_REDLINE: usize = 40;

/// Window length, in ticks, of the idle task's CPU-utilization estimate.
pub const CPU_USAGE_WINDOW: u32 = 400;

const _: () = assert!(MAX_PRIOS >= 2 && MAX_PRIOS <= u32::BITS as usize);
const _: () = assert!(NUM_TASKS >= 2, "need room for the idle task and one more");
const _: () = assert!(IDLE_STACK_SIZE >= MIN_STACK_SIZE);
