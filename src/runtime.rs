use crate::bridge;
use crate::config::Config;
use crate::coop::{EventLoop, LoopHandle};
use crate::error::{Error, Result};
use crate::executor::{ProcessPool, TaskHandle, ThreadPool};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, OnceLock};
use std::sync::Arc;
use std::thread::ThreadId;

/// Process-wide execution state: the default thread pool plus lazily
/// created default process pool and background event loop.
pub struct Runtime {
    pub(crate) thread_pool: Arc<ThreadPool>,
    process_pool: OnceCell<Arc<ProcessPool>>,
    event_loop: OnceCell<LoopHandle>,
    config: Config,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let thread_pool = ThreadPool::new(&config)?;

        Ok(Self {
            thread_pool: Arc::new(thread_pool),
            process_pool: OnceCell::new(),
            event_loop: OnceCell::new(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn thread_pool(&self) -> &Arc<ThreadPool> {
        &self.thread_pool
    }

    /// The default process pool, created on first use.
    pub fn process_pool(&self) -> Result<&Arc<ProcessPool>> {
        self.process_pool
            .get_or_try_init(|| ProcessPool::new(&self.config).map(Arc::new))
    }

    /// The default background event loop, started on first use.
    pub fn event_loop(&self) -> Result<&LoopHandle> {
        self.event_loop.get_or_try_init(EventLoop::start)
    }

    fn shutdown_all(&self) {
        let mode = self.config.shutdown_mode;
        self.thread_pool.shutdown(mode);
        if let Some(pool) = self.process_pool.get() {
            pool.shutdown(mode);
        }
        if let Some(event_loop) = self.event_loop.get() {
            event_loop.shutdown(mode);
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("thread_pool", &self.thread_pool)
            .finish()
    }
}

// Global runtime for the simple API
static GLOBAL_RUNTIME: RwLock<Option<Arc<Runtime>>> = RwLock::new(None);

// Thread-local runtime for isolated tests
thread_local! {
    static THREAD_RUNTIME: std::cell::RefCell<Option<Arc<Runtime>>> =
        const { std::cell::RefCell::new(None) };
}

// Track which threads opted into a thread-local runtime
static THREAD_RUNTIME_MAP: OnceLock<Mutex<HashMap<ThreadId, bool>>> = OnceLock::new();

fn thread_runtime_map() -> &'static Mutex<HashMap<ThreadId, bool>> {
    THREAD_RUNTIME_MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

fn uses_thread_runtime() -> bool {
    let thread_id = std::thread::current().id();
    thread_runtime_map()
        .lock()
        .expect("thread runtime map poisoned")
        .get(&thread_id)
        .copied()
        .unwrap_or(false)
}

pub fn init() -> Result<()> {
    init_with_config(Config::default())
}

pub fn init_with_config(config: Config) -> Result<()> {
    if uses_thread_runtime() {
        let has_existing = THREAD_RUNTIME.with(|rt| rt.borrow().is_some());
        if has_existing {
            return Err(Error::AlreadyInitialized);
        }
        let runtime = Runtime::new(config)?;
        THREAD_RUNTIME.with(|rt| *rt.borrow_mut() = Some(Arc::new(runtime)));
        Ok(())
    } else {
        let mut runtime = GLOBAL_RUNTIME.write();
        if runtime.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        *runtime = Some(Arc::new(Runtime::new(config)?));
        Ok(())
    }
}

/// Initialize a runtime visible only to the calling thread. Meant for
/// tests, which get an injectable runtime instead of fighting over the
/// process-wide one.
pub fn init_thread_local() -> Result<()> {
    init_thread_local_with_config(Config::default())
}

pub fn init_thread_local_with_config(config: Config) -> Result<()> {
    let thread_id = std::thread::current().id();
    thread_runtime_map()
        .lock()
        .expect("thread runtime map poisoned")
        .insert(thread_id, true);

    let has_existing = THREAD_RUNTIME.with(|rt| rt.borrow().is_some());
    if has_existing {
        return Err(Error::AlreadyInitialized);
    }
    let runtime = Runtime::new(config)?;
    THREAD_RUNTIME.with(|rt| *rt.borrow_mut() = Some(Arc::new(runtime)));
    Ok(())
}

/// The runtime governing the calling thread.
pub fn current_runtime() -> Result<Arc<Runtime>> {
    if uses_thread_runtime() {
        THREAD_RUNTIME.with(|rt| rt.borrow().clone().ok_or(Error::NotInitialized))
    } else {
        GLOBAL_RUNTIME.read().clone().ok_or(Error::NotInitialized)
    }
}

/// Tear down the calling thread's runtime (or the global one), shutting its
/// pools down with the configured shutdown mode.
pub fn shutdown() {
    if uses_thread_runtime() {
        let thread_id = std::thread::current().id();
        THREAD_RUNTIME.with(|rt| *rt.borrow_mut() = None);
        thread_runtime_map()
            .lock()
            .expect("thread runtime map poisoned")
            .remove(&thread_id);
    } else {
        *GLOBAL_RUNTIME.write() = None;
    }
}

pub(crate) fn default_process_pool() -> Result<Arc<ProcessPool>> {
    let runtime = current_runtime()?;
    Ok(Arc::clone(runtime.process_pool()?))
}

/// Submit a callable to the default thread pool.
pub fn submit_to_thread_pool<T, F>(f: F) -> Result<TaskHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    current_runtime()?.thread_pool.submit(f)
}

/// Submit a named job to the default process pool.
pub fn submit_to_process_pool<A, R>(job: &str, arg: &A) -> Result<TaskHandle<R>>
where
    A: Serialize + ?Sized,
    R: DeserializeOwned + Send + 'static,
{
    current_runtime()?.process_pool()?.submit(job, arg)
}

/// Run a future on the default background event loop and block for its
/// outcome, honoring the configured default timeout. Fails fast with
/// [`Error::ReentrantCall`] when called from the loop's own thread.
pub fn run_in_loop<F, T>(future: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let runtime = current_runtime()?;
    let timeout = runtime.config.default_timeout;
    bridge::run_in_loop_timeout(runtime.event_loop()?, future, timeout)
}
