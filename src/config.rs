use crate::error::{Error, Result};
use std::path::PathBuf;
use std::time::Duration;

/// How an adapter treats outstanding work when it is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Let in-flight work finish; queued-but-unstarted items fail with
    /// [`Error::Shutdown`]; new submissions are rejected.
    Graceful,
    /// Additionally cancel queued items and attempt (best-effort)
    /// cancellation of in-flight work.
    Immediate,
}

impl Default for ShutdownMode {
    fn default() -> Self {
        ShutdownMode::Graceful
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads in a thread pool. `None` means one per CPU.
    pub thread_width: Option<usize>,
    /// Worker processes in a process pool. `None` means one per CPU.
    pub process_width: Option<usize>,
    /// Deadline applied to the blocking convenience waits when the caller
    /// does not pass one explicitly. `None` waits forever.
    pub default_timeout: Option<Duration>,
    pub shutdown_mode: ShutdownMode,
    pub thread_name_prefix: String,
    pub stack_size: Option<usize>,
    /// Executable re-invoked as a process-pool worker. `None` resolves to
    /// the current executable, which must call
    /// [`process_pool::init_worker`](crate::executor::process_pool::init_worker)
    /// early in `main`.
    pub worker_program: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thread_width: None,
            process_width: None,
            default_timeout: None,
            shutdown_mode: ShutdownMode::default(),
            thread_name_prefix: "strand-worker".to_string(),
            stack_size: Some(2 * 1024 * 1024),
            worker_program: None,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        for (name, width) in [
            ("thread_width", self.thread_width),
            ("process_width", self.process_width),
        ] {
            if let Some(n) = width {
                if n == 0 {
                    return Err(Error::config(format!("{} must be > 0", name)));
                }
                if n > 1024 {
                    return Err(Error::config(format!("{} too large (max 1024)", name)));
                }
            }
        }

        if let Some(t) = self.default_timeout {
            if t.is_zero() {
                return Err(Error::config("default_timeout must be > 0"));
            }
        }

        Ok(())
    }

    pub fn worker_threads(&self) -> usize {
        self.thread_width.unwrap_or_else(num_cpus::get)
    }

    pub fn worker_processes(&self) -> usize {
        self.process_width.unwrap_or_else(num_cpus::get)
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn thread_width(mut self, n: usize) -> Self {
        self.config.thread_width = Some(n);
        self
    }

    pub fn process_width(mut self, n: usize) -> Self {
        self.config.process_width = Some(n);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = Some(timeout);
        self
    }

    pub fn shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.config.shutdown_mode = mode;
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn worker_program<P: Into<PathBuf>>(mut self, program: P) -> Self {
        self.config.worker_program = Some(program.into());
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
