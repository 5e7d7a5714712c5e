//! Execution-context checks shared by the system-call entry points.
use core::sync::atomic::Ordering;

use crate::{error::BadContextError, PortThreading};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(crate) fn expect_task_context<Traits: PortThreading>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable (not a task, or task dispatch is
/// gated off), return `Err(BadContext)`.
pub(crate) fn expect_waitable_context<Traits: PortThreading>() -> Result<(), BadContextError> {
    if !Traits::is_task_context()
        || Traits::state().dispatch_disable.load(Ordering::Relaxed) != 0
    {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// Whether the scheduler has been started and task dispatch is currently
/// permitted.
pub fn is_scheduler_running<Traits: PortThreading>() -> bool {
    Traits::state().dispatch_disable.load(Ordering::Relaxed) == 0
}
