pub use crate::chain::{Chain, StageOptions};
pub use crate::config::{Config, ConfigBuilder, ShutdownMode};
pub use crate::coop::{block_on, EventLoop, LoopHandle};
pub use crate::error::{Error, Result};
pub use crate::executor::{Adapter, ProcessPool, TaskHandle, TaskState, ThreadPool};
pub use crate::{init, init_with_config, shutdown};
pub use crate::{run_in_loop, submit_to_process_pool, submit_to_thread_pool};
