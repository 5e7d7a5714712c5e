//! Error types for the kernel API.
//!
//! Every fallible operation gets its own error enum listing exactly the
//! failure kinds it can produce. All variants are drawn from the
//! [`ResultCode`] catalogue, and every operation error converts into it.
use core::fmt;

/// The catalogue of failure kinds used across the kernel API.
#[repr(i8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ResultCode {
    /// A blocking operation reached its deadline, a polling operation found
    /// the resource unavailable, or a wait was cancelled from outside.
    Timeout = -1,
    /// A counting or storage capacity was already at its maximum.
    Full = -2,
    /// Nothing to read.
    Empty = -3,
    /// The object still has users (a waiter, an owner, or queued data) and
    /// cannot be deleted.
    Busy = -4,
    /// The address is not inside the kernel heap region.
    NotOnHeap = -5,
    /// The kernel heap or a kernel object arena is exhausted.
    OutOfMemory = -6,
    /// The identifier does not refer to a live kernel object.
    BadId = -7,
    /// The operation is not allowed in the current context (CPU Lock active,
    /// or a blocking call outside task context).
    BadContext = -8,
    /// A malformed argument (zero size, out-of-range priority, payload size
    /// mismatch, reserved bits).
    Invalid = -9,
}

macro_rules! define_error {
    (
        $( #[doc $( $doc:tt )*] )*
        $( #[into( $Super:ident )] )*
        $vis:vis enum $Name:ident {
            $( $Variant:ident, )*
        }
    ) => {
        $( #[doc $( $doc )*] )*
        #[repr(i8)]
        #[derive(PartialEq, Eq, Copy, Clone)]
        $vis enum $Name {
            $( $Variant = ResultCode::$Variant as i8 ),*
        }

        impl fmt::Debug for $Name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<$Name> for ResultCode {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error_into! { $Name; $( $Super )*; $( $Variant )* }
    };
}

macro_rules! define_error_into {
    ($Name:ident; ; $( $Variant:ident )*) => {};
    ($Name:ident; $Super:ident $( $SuperRest:ident )*; $( $Variant:ident )*) => {
        impl From<$Name> for $Super {
            #[inline]
            fn from(x: $Name) -> Self {
                match x {
                    $( $Name::$Variant => Self::$Variant ),*
                }
            }
        }

        define_error_into! { $Name; $( $SuperRest )*; $( $Variant )* }
    };
}

// Task operations

define_error! {
    /// Error type for task creation.
    pub enum CreateTaskError {
        OutOfMemory,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for task deletion.
    pub enum DeleteTaskError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for readying a suspended or blocked task.
    pub enum ReadyTaskError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for suspending a task.
    pub enum SuspendTaskError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for `task::sleep`.
    pub enum SleepError {
        BadContext,
    }
}

define_error! {
    /// Error type for `task::modify_priority`.
    pub enum SetTaskPriorityError {
        BadId,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for task introspection queries.
    pub enum GetTaskInfoError {
        BadId,
        BadContext,
    }
}

// Semaphore operations

define_error! {
    /// Error type for semaphore creation.
    pub enum CreateSemaphoreError {
        OutOfMemory,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for semaphore deletion.
    pub enum DeleteSemaphoreError {
        BadId,
        Busy,
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking semaphore acquisition operations.
    pub enum WaitSemaphoreError {
        BadId,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for the polling semaphore acquisition operations.
    pub enum PollSemaphoreError {
        BadId,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for `semaphore::signal` and `semaphore::signal_isr`.
    pub enum SignalSemaphoreError {
        BadId,
        Full,
        BadContext,
    }
}

define_error! {
    /// Error type for reading a semaphore's count.
    pub enum GetSemaphoreError {
        BadId,
        BadContext,
    }
}

// Mutex operations

define_error! {
    /// Error type for mutex creation.
    pub enum CreateMutexError {
        OutOfMemory,
        BadContext,
    }
}

define_error! {
    /// Error type for mutex deletion.
    pub enum DeleteMutexError {
        BadId,
        Busy,
        BadContext,
    }
}

define_error! {
    /// Error type for `mutex::lock`.
    pub enum LockMutexError {
        BadId,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for `mutex::unlock`.
    pub enum UnlockMutexError {
        BadId,
        Invalid,
        BadContext,
    }
}

// Event group operations

define_error! {
    /// Error type for event group creation.
    pub enum CreateEventGroupError {
        OutOfMemory,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for event group deletion.
    pub enum DeleteEventGroupError {
        BadId,
        Busy,
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking event group wait operations.
    pub enum WaitEventGroupError {
        BadId,
        Invalid,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for the polling event group wait operation.
    pub enum PollEventGroupError {
        BadId,
        Invalid,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for `event_group::set` and `event_group::clear`.
    pub enum UpdateEventGroupError {
        BadId,
        BadContext,
    }
}

define_error! {
    /// Error type for reading an event group's bits.
    pub enum GetEventGroupError {
        BadId,
        BadContext,
    }
}

// Message queue operations

define_error! {
    /// Error type for message queue creation.
    pub enum CreateMsgQueueError {
        OutOfMemory,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for message queue deletion.
    pub enum DeleteMsgQueueError {
        BadId,
        Busy,
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking message push operations, including
    /// `msg_queue::waitfor_push`.
    pub enum SendMsgQueueError {
        BadId,
        Invalid,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for the strict non-blocking message push.
    pub enum TrySendMsgQueueError {
        BadId,
        Invalid,
        Full,
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking message read operations.
    pub enum RecvMsgQueueError {
        BadId,
        Invalid,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for the non-blocking message read operations.
    pub enum TryRecvMsgQueueError {
        BadId,
        Invalid,
        Empty,
        BadContext,
    }
}

define_error! {
    /// Error type for `msg_queue::overwrite` and `msg_queue::overwrite_isr`.
    pub enum OverwriteMsgQueueError {
        BadId,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for `msg_queue::pop`.
    pub enum PopMsgQueueError {
        BadId,
        BadContext,
    }
}

// Stream queue operations

define_error! {
    /// Error type for stream queue creation.
    pub enum CreateStreamQueueError {
        OutOfMemory,
        Invalid,
        BadContext,
    }
}

define_error! {
    /// Error type for stream queue deletion.
    pub enum DeleteStreamQueueError {
        BadId,
        Busy,
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking stream push operations.
    pub enum PushStreamQueueError {
        BadId,
        Invalid,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for the non-blocking stream push operations.
    pub enum TryPushStreamQueueError {
        BadId,
        Invalid,
        Full,
        BadContext,
    }
}

define_error! {
    /// Error type for the blocking stream read operations.
    pub enum FrontStreamQueueError {
        BadId,
        Invalid,
        Timeout,
        BadContext,
    }
}

define_error! {
    /// Error type for the non-blocking stream read operations.
    pub enum TryFrontStreamQueueError {
        BadId,
        Invalid,
        Empty,
        BadContext,
    }
}

define_error! {
    /// Error type for `stream_queue::pop`.
    pub enum PopStreamQueueError {
        BadId,
        BadContext,
    }
}

// Allocator operations

define_error! {
    /// Error type for `heap::allocate`.
    #[into(CreateTaskError)]
    #[into(CreateMsgQueueError)]
    #[into(CreateStreamQueueError)]
    pub enum AllocError {
        OutOfMemory,
        BadContext,
    }
}

define_error! {
    /// Error type for `heap::free` and `heap::queue_free`. A corrupted
    /// block header is not an error but a fatal trap.
    pub enum FreeError {
        NotOnHeap,
        BadContext,
    }
}

// Shared suberrors. A function that can only fail in one of these ways
// returns the suberror itself; `?` widens it at the API boundary.

define_error! {
    /// `BadContext`
    #[into(CreateTaskError)]
    #[into(DeleteTaskError)]
    #[into(ReadyTaskError)]
    #[into(SuspendTaskError)]
    #[into(SleepError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskInfoError)]
    #[into(CreateSemaphoreError)]
    #[into(DeleteSemaphoreError)]
    #[into(WaitSemaphoreError)]
    #[into(PollSemaphoreError)]
    #[into(SignalSemaphoreError)]
    #[into(GetSemaphoreError)]
    #[into(CreateMutexError)]
    #[into(DeleteMutexError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(CreateEventGroupError)]
    #[into(DeleteEventGroupError)]
    #[into(WaitEventGroupError)]
    #[into(PollEventGroupError)]
    #[into(UpdateEventGroupError)]
    #[into(GetEventGroupError)]
    #[into(CreateMsgQueueError)]
    #[into(DeleteMsgQueueError)]
    #[into(SendMsgQueueError)]
    #[into(TrySendMsgQueueError)]
    #[into(RecvMsgQueueError)]
    #[into(TryRecvMsgQueueError)]
    #[into(OverwriteMsgQueueError)]
    #[into(PopMsgQueueError)]
    #[into(CreateStreamQueueError)]
    #[into(DeleteStreamQueueError)]
    #[into(PushStreamQueueError)]
    #[into(TryPushStreamQueueError)]
    #[into(FrontStreamQueueError)]
    #[into(TryFrontStreamQueueError)]
    #[into(PopStreamQueueError)]
    #[into(AllocError)]
    #[into(FreeError)]
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    /// `BadId`
    #[into(DeleteTaskError)]
    #[into(ReadyTaskError)]
    #[into(SuspendTaskError)]
    #[into(SetTaskPriorityError)]
    #[into(GetTaskInfoError)]
    #[into(DeleteSemaphoreError)]
    #[into(WaitSemaphoreError)]
    #[into(PollSemaphoreError)]
    #[into(SignalSemaphoreError)]
    #[into(GetSemaphoreError)]
    #[into(DeleteMutexError)]
    #[into(LockMutexError)]
    #[into(UnlockMutexError)]
    #[into(DeleteEventGroupError)]
    #[into(WaitEventGroupError)]
    #[into(PollEventGroupError)]
    #[into(UpdateEventGroupError)]
    #[into(GetEventGroupError)]
    #[into(DeleteMsgQueueError)]
    #[into(SendMsgQueueError)]
    #[into(TrySendMsgQueueError)]
    #[into(RecvMsgQueueError)]
    #[into(TryRecvMsgQueueError)]
    #[into(OverwriteMsgQueueError)]
    #[into(PopMsgQueueError)]
    #[into(DeleteStreamQueueError)]
    #[into(PushStreamQueueError)]
    #[into(TryPushStreamQueueError)]
    #[into(FrontStreamQueueError)]
    #[into(TryFrontStreamQueueError)]
    #[into(PopStreamQueueError)]
    pub enum BadIdError {
        BadId,
    }
}
