//! Queued work item representation.

use crate::error::Error;
use crate::executor::handle::TaskId;
use std::time::Instant;

/// What a dequeued task should do with itself.
pub(crate) enum RunMode {
    /// Execute the captured callable and complete the handle.
    Execute,
    /// Fail the handle without executing, e.g. during shutdown drain.
    Abort(Error),
}

/// A callable plus its completer, captured at submission time and consumed
/// exactly once.
pub(crate) struct Task {
    pub(crate) id: TaskId,
    payload: Box<dyn FnOnce(RunMode) + Send>,
    pub(crate) enqueue_time: Instant,
}

impl Task {
    pub fn new<F>(id: TaskId, payload: F) -> Self
    where
        F: FnOnce(RunMode) + Send + 'static,
    {
        Task {
            id,
            payload: Box::new(payload),
            enqueue_time: Instant::now(),
        }
    }

    pub fn execute(self) {
        (self.payload)(RunMode::Execute);
    }

    pub fn abort(self, err: Error) {
        (self.payload)(RunMode::Abort(err));
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("enqueue_time", &self.enqueue_time)
            .finish()
    }
}

/// Best-effort rendering of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
