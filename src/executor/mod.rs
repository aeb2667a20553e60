//! Execution substrates.
//!
//! Three adapters — a worker-thread pool, a worker-process pool, and the
//! cooperative event loop in [`crate::coop`] — accept units of work behind
//! the same lifecycle contract and report back through [`TaskHandle`].
//! Submission signatures stay on the concrete types because the shape of a
//! work item differs per substrate (a closure, a named serializable job, a
//! future).

pub mod handle;
pub mod process_pool;
pub(crate) mod process_worker;
pub(crate) mod task;
pub mod thread_pool;
pub(crate) mod worker;

pub use handle::{TaskHandle, TaskId, TaskState};
pub use process_pool::ProcessPool;
pub use thread_pool::ThreadPool;

use crate::config::ShutdownMode;

/// Lifecycle contract shared by every substrate adapter.
pub trait Adapter {
    /// Configured concurrency width: the in-flight count never exceeds it.
    fn width(&self) -> usize;

    /// Submitted-but-not-terminal work items, queued plus in-flight.
    fn pending(&self) -> usize;

    /// Shut the adapter down. Idempotent.
    fn shutdown(&self, mode: ShutdownMode);

    fn is_shut_down(&self) -> bool;
}
