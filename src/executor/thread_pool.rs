use super::handle::{self, TaskHandle};
use super::task::{panic_message, RunMode, Task};
use super::worker::{PoolShared, Worker, WorkerId};
use super::Adapter;
use crate::config::{Config, ShutdownMode};
use crate::error::{Error, Result};
use crate::telemetry::MetricsSnapshot;
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Bounded pool of worker threads draining one shared FIFO queue.
///
/// Submission is always non-blocking and queued items start in submission
/// order. The only synchronous submission failure is [`Error::Shutdown`].
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<WorkerHandle>>,
    shut_down: AtomicBool,
    next_unpark: AtomicUsize,
    num_threads: usize,
}

struct WorkerHandle {
    id: WorkerId,
    thread: Option<JoinHandle<()>>,
    unparker: thread::Thread,
}

impl ThreadPool {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let num_threads = config.worker_threads();
        if num_threads == 0 {
            return Err(Error::config("need at least 1 thread"));
        }

        let shared = Arc::new(PoolShared::new());
        let mut handles = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let worker = Worker::new(id);
            let shared_clone = Arc::clone(&shared);
            let name = format!("{}-{}", config.thread_name_prefix, id);

            let mut builder = thread::Builder::new().name(name);
            if let Some(stack_size) = config.stack_size {
                builder = builder.stack_size(stack_size);
            }

            let thread = builder
                .spawn(move || worker.run(shared_clone))
                .map_err(|e| Error::config(format!("spawn failed: {}", e)))?;
            let unparker = thread.thread().clone();

            handles.push(WorkerHandle {
                id,
                thread: Some(thread),
                unparker,
            });
        }

        tracing::debug!(width = num_threads, "thread pool started");

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            shut_down: AtomicBool::new(false),
            next_unpark: AtomicUsize::new(0),
            num_threads,
        })
    }

    pub fn with_width(width: usize) -> Result<Self> {
        let config = Config::builder().thread_width(width).build()?;
        Self::new(&config)
    }

    /// Submit an infallible callable. Panics inside `f` become
    /// [`Error::Panic`] on the handle.
    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.submit_fallible(move || Ok(f()))
    }

    /// Submit a callable that may fail; its error is stored verbatim and
    /// re-delivered to every holder of the handle.
    pub fn submit_fallible<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }

        let (handle, completer) = handle::pair::<T>();
        let id = handle.id();
        let shared = Arc::clone(&self.shared);
        let submitted = Instant::now();

        let task = Task::new(id, move |mode| match mode {
            RunMode::Execute => {
                if !completer.start() {
                    // cancelled while queued
                    shared.metrics.record_cancelled();
                    return;
                }
                match catch_unwind(AssertUnwindSafe(f)) {
                    Ok(Ok(value)) => {
                        shared
                            .metrics
                            .record_completed(submitted.elapsed().as_nanos() as u64);
                        completer.complete(Ok(value));
                    }
                    Ok(Err(err)) => {
                        shared.metrics.record_failed();
                        completer.complete(Err(err));
                    }
                    Err(payload) => {
                        let msg = panic_message(payload);
                        tracing::error!(task = id.as_u64(), panic = %msg, "task panicked");
                        shared.metrics.record_failed();
                        completer.complete(Err(Error::Panic(msg)));
                    }
                }
            }
            RunMode::Abort(err) => {
                if matches!(err, Error::Cancelled) {
                    shared.metrics.record_cancelled();
                } else {
                    shared.metrics.record_failed();
                }
                completer.complete(Err(err));
            }
        });

        self.shared.metrics.record_submitted();
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        self.shared.injector.push(task);
        self.unpark_one();

        tracing::trace!(task = id.as_u64(), "task submitted");
        Ok(handle)
    }

    fn unpark_one(&self) {
        let workers = self.workers.lock();
        if workers.is_empty() {
            return;
        }
        let idx = self.next_unpark.fetch_add(1, Ordering::Relaxed) % workers.len();
        workers[idx].unparker.unpark();
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.pending()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Shut the pool down. Idempotent; the second call is a no-op.
    ///
    /// In-flight work finishes in both modes (a preemptive thread cannot be
    /// stopped); queued-but-unstarted items fail with [`Error::Shutdown`]
    /// under [`ShutdownMode::Graceful`] and are cancelled under
    /// [`ShutdownMode::Immediate`].
    pub fn shutdown(&self, mode: ShutdownMode) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(?mode, "thread pool shutting down");

        self.shared.shutdown.store(true, Ordering::Release);

        let mut workers = self.workers.lock();
        for worker in workers.iter() {
            worker.unparker.unpark();
        }
        for worker in workers.iter_mut() {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
                tracing::trace!(worker = worker.id, "worker joined");
            }
        }

        // Workers are gone; whatever is still queued never started.
        loop {
            match self.shared.injector.steal() {
                crossbeam_deque::Steal::Success(task) => {
                    self.shared.queued.fetch_sub(1, Ordering::Relaxed);
                    match mode {
                        ShutdownMode::Graceful => task.abort(Error::Shutdown),
                        ShutdownMode::Immediate => task.abort(Error::Cancelled),
                    }
                }
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Adapter for ThreadPool {
    fn width(&self) -> usize {
        self.num_threads
    }

    fn pending(&self) -> usize {
        self.pending_tasks()
    }

    fn shutdown(&self, mode: ShutdownMode) {
        ThreadPool::shutdown(self, mode);
    }

    fn is_shut_down(&self) -> bool {
        ThreadPool::is_shut_down(self)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Graceful);
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("num_threads", &self.num_threads)
            .field("pending", &self.pending_tasks())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
