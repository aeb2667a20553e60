//! STRAND - Substrate-Transparent Asynchronous N-Dispatch
//!
//! A unified concurrency layer: ordinary synchronous code launches work on
//! background threads, background processes, or a cooperative event loop,
//! and retrieves results through a single handle type — without picking or
//! managing an executor explicitly.
//!
//! # Quick Start
//!
//! ```no_run
//! use strand::prelude::*;
//!
//! // Initialize the runtime
//! strand::init().unwrap();
//!
//! // Launch work in the background and collect it later
//! let handle = strand::submit_to_thread_pool(|| 21 * 2).unwrap();
//! assert_eq!(handle.result(None).unwrap(), 42);
//!
//! // Or run a whole sequence through a parallel pipeline
//! let doubled = Chain::<i32, i32>::new()
//!     .map(|x| x * 2)
//!     .execute_eager(vec![1, 2, 3, 4])
//!     .unwrap();
//! assert_eq!(doubled, vec![2, 4, 6, 8]);
//!
//! strand::shutdown();
//! ```
//!
//! # Features
//!
//! - **Task Handles**: one future-like handle for every execution substrate
//! - **Thread Pool**: bounded FIFO worker threads for blocking or I/O work
//! - **Process Pool**: named serializable jobs across worker processes
//! - **Cooperative Loop**: single-threaded task multiplexing with explicit
//!   suspension points
//! - **Bridge**: await pool work from the loop, or block a foreign thread
//!   on loop work
//! - **Chains**: ordered parallel map/filter pipelines with bounded
//!   windows, fail-fast error propagation, and input-order output

// Lint configuration
#![warn(missing_debug_implementations)]

pub mod bridge;
pub mod chain;
pub mod config;
pub mod coop;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod runtime;
pub mod subprocess;
pub mod telemetry;
pub mod util;

// Re-export key types at crate root
pub use chain::Chain;
pub use config::{Config, ConfigBuilder, ShutdownMode};
pub use error::{Error, Result};
pub use executor::{Adapter, ProcessPool, TaskHandle, TaskId, TaskState, ThreadPool};
pub use runtime::{
    init, init_with_config, run_in_loop, shutdown, submit_to_process_pool, submit_to_thread_pool,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submit_and_result() {
        runtime::init_thread_local().unwrap();

        let handle = submit_to_thread_pool(|| (0..100).sum::<i32>()).unwrap();
        assert_eq!(handle.result(None).unwrap(), 4950);

        shutdown();
    }

    #[test]
    fn test_chain_round_trip() {
        let result = Chain::<i32, i32>::new()
            .map(|n| n * 10)
            .map(|n| n.to_string())
            .execute_eager(vec![1, 2, 3])
            .unwrap();

        assert_eq!(result, vec!["10", "20", "30"]);
    }
}
