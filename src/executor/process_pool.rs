//! Worker-process pool.
//!
//! Work items are *named jobs*: a function registered under a string name
//! (see [`register_job`]) plus a serde-serializable payload. Payloads and
//! results cross the process boundary as JSON frames; anything that cannot
//! be serialized fails submission immediately with
//! [`Error::Unserializable`], before any worker process is involved.
//!
//! Worker processes are re-invocations of a worker program: either the
//! current executable (which must call [`init_worker`] early in `main`) or
//! an explicit program configured through
//! [`Config::worker_program`](crate::config::Config).

use super::handle::{self, TaskHandle};
use super::process_worker::{self, JobRequest, JobResponse};
use super::Adapter;
use crate::config::{Config, ShutdownMode};
use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub use super::process_worker::{is_registered, register_job, JobFn, ECHO_JOB, RUN_COMMAND_JOB};

/// Environment variable marking a process as a pool worker.
pub const WORKER_ENV: &str = "STRAND_PROCESS_WORKER";

/// Serve jobs forever on stdin/stdout, then exit. The body of every worker
/// program.
pub fn worker_main() -> ! {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let code = match process_worker::serve(stdin.lock(), stdout.lock()) {
        Ok(()) => 0,
        Err(_) => 1,
    };
    std::process::exit(code)
}

/// Call early in `main`: turns this invocation into a worker process when
/// the pool spawned it, and returns immediately otherwise.
pub fn init_worker() {
    if std::env::var_os(WORKER_ENV).is_some() {
        worker_main();
    }
}

type FinishFn = Box<dyn FnOnce(Result<Value>) + Send>;
/// `start(None)` begins execution and yields the finish half;
/// `start(Some(err))` aborts a queued item without running it.
type StartFn = Box<dyn FnOnce(Option<Error>) -> Option<FinishFn> + Send>;

struct ProcTask {
    job: String,
    payload: Value,
    start: StartFn,
}

struct ProcShared {
    width: usize,
    program: Option<PathBuf>,
    rx: Receiver<ProcTask>,
    pending: AtomicUsize,
    spawned_workers: AtomicUsize,
    shut_down: AtomicBool,
    draining: AtomicBool,
    immediate: AtomicBool,
    children: Mutex<Vec<Arc<Mutex<Option<Child>>>>>,
}

/// Bounded pool of worker processes, spawned lazily on the first accepted
/// submission.
pub struct ProcessPool {
    shared: Arc<ProcShared>,
    tx: Mutex<Option<Sender<ProcTask>>>,
    attendants: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ProcessPool {
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        let width = config.worker_processes();
        if width == 0 {
            return Err(Error::config("need at least 1 worker process"));
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(ProcShared {
            width,
            program: config.worker_program.clone(),
            rx,
            pending: AtomicUsize::new(0),
            spawned_workers: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            immediate: AtomicBool::new(false),
            children: Mutex::new(Vec::new()),
        });

        Ok(Self {
            shared,
            tx: Mutex::new(Some(tx)),
            attendants: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn with_width(width: usize) -> Result<Self> {
        let config = Config::builder().process_width(width).build()?;
        Self::new(&config)
    }

    /// Submit `arg` to the job registered under `job` in the worker
    /// program. Serialization happens here, synchronously; failure is
    /// [`Error::Unserializable`] with no worker involvement.
    pub fn submit<A, R>(&self, job: &str, arg: &A) -> Result<TaskHandle<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let payload =
            serde_json::to_value(arg).map_err(|e| Error::unserializable(e.to_string()))?;
        self.submit_inner(job, payload)
    }

    /// Submit an already-serialized payload.
    pub fn submit_value(&self, job: &str, payload: Value) -> Result<TaskHandle<Value>> {
        self.submit_inner(job, payload)
    }

    fn submit_inner<R>(&self, job: &str, payload: Value) -> Result<TaskHandle<R>>
    where
        R: DeserializeOwned + Send + 'static,
    {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        self.ensure_workers()?;

        let (handle, completer) = handle::pair::<R>();
        let id = handle.id();
        let start: StartFn = Box::new(move |abort| {
            if let Some(err) = abort {
                completer.complete(Err(err));
                return None;
            }
            if !completer.start() {
                // cancelled while queued
                return None;
            }
            Some(Box::new(move |outcome: Result<Value>| {
                let typed = outcome.and_then(|value| {
                    serde_json::from_value::<R>(value)
                        .map_err(|e| Error::unserializable(e.to_string()))
                });
                completer.complete(typed);
            }) as FinishFn)
        });

        let task = ProcTask {
            job: job.to_string(),
            payload,
            start,
        };

        self.shared.pending.fetch_add(1, Ordering::Relaxed);
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.pending.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Shutdown);
        }

        tracing::trace!(task = id.as_u64(), job, "process job submitted");
        Ok(handle)
    }

    fn ensure_workers(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut attendants = self.attendants.lock();
        for index in 0..self.shared.width {
            let shared = Arc::clone(&self.shared);
            let slot = Arc::new(Mutex::new(None));
            self.shared.children.lock().push(Arc::clone(&slot));
            let thread = thread::Builder::new()
                .name(format!("strand-proc-{}", index))
                .spawn(move || attendant_loop(shared, slot, index))
                .map_err(|e| Error::config(format!("spawn failed: {}", e)))?;
            attendants.push(thread);
        }
        Ok(())
    }

    /// Worker processes actually spawned so far. Zero until the first
    /// accepted submission reaches an attendant.
    pub fn spawned_workers(&self) -> usize {
        self.shared.spawned_workers.load(Ordering::Relaxed)
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// Shut the pool down. Idempotent. `Graceful` lets in-flight jobs
    /// finish and fails queued ones with [`Error::Shutdown`]; `Immediate`
    /// kills the worker processes and cancels everything outstanding.
    pub fn shutdown(&self, mode: ShutdownMode) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(?mode, "process pool shutting down");
        self.shared.draining.store(true, Ordering::Release);

        if mode == ShutdownMode::Immediate {
            self.shared.immediate.store(true, Ordering::Release);
            for slot in self.shared.children.lock().iter() {
                if let Some(child) = slot.lock().as_mut() {
                    let _ = child.kill();
                }
            }
        }

        // Closing the channel wakes idle attendants; queued items drain
        // through the abort path here and in the attendants.
        let tx = self.tx.lock().take();
        drop(tx);
        let abort_err = match mode {
            ShutdownMode::Graceful => Error::Shutdown,
            ShutdownMode::Immediate => Error::Cancelled,
        };
        while let Ok(task) = self.shared.rx.try_recv() {
            (task.start)(Some(abort_err.clone()));
            self.shared.pending.fetch_sub(1, Ordering::Relaxed);
        }

        for attendant in self.attendants.lock().drain(..) {
            let _ = attendant.join();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Adapter for ProcessPool {
    fn width(&self) -> usize {
        self.shared.width
    }

    fn pending(&self) -> usize {
        self.pending_jobs()
    }

    fn shutdown(&self, mode: ShutdownMode) {
        ProcessPool::shutdown(self, mode);
    }

    fn is_shut_down(&self) -> bool {
        ProcessPool::is_shut_down(self)
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        self.shutdown(ShutdownMode::Graceful);
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("width", &self.shared.width)
            .field("pending", &self.pending_jobs())
            .field("spawned_workers", &self.spawned_workers())
            .finish()
    }
}

struct ChildIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

fn spawn_child(
    shared: &ProcShared,
    slot: &Arc<Mutex<Option<Child>>>,
    index: usize,
) -> Result<ChildIo> {
    let program = match &shared.program {
        Some(program) => program.clone(),
        None => std::env::current_exe()?,
    };

    let mut child = Command::new(&program)
        .env(WORKER_ENV, "1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::protocol("worker stdin unavailable"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::protocol("worker stdout unavailable"))?;

    shared.spawned_workers.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(worker = index, program = %program.display(), "worker process spawned");
    *slot.lock() = Some(child);

    Ok(ChildIo {
        stdin,
        stdout: BufReader::new(stdout),
    })
}

fn exchange(io: &mut ChildIo, seq: u64, job: &str, payload: Value) -> Result<Value> {
    let request = JobRequest {
        id: seq,
        job: job.to_string(),
        payload,
    };
    let frame = serde_json::to_string(&request)
        .map_err(|e| Error::protocol(format!("request encoding: {}", e)))?;
    io.stdin.write_all(frame.as_bytes())?;
    io.stdin.write_all(b"\n")?;
    io.stdin.flush()?;

    let mut line = String::new();
    let read = io.stdout.read_line(&mut line)?;
    if read == 0 {
        return Err(Error::protocol("worker process exited unexpectedly"));
    }

    let response: JobResponse = serde_json::from_str(line.trim_end())
        .map_err(|e| Error::protocol(format!("response decoding: {}", e)))?;
    if response.id != seq {
        return Err(Error::protocol(format!(
            "response id {} does not match request id {}",
            response.id, seq
        )));
    }

    match (response.ok, response.err) {
        (Some(value), None) => Ok(value),
        (None, Some(err)) => Err(match err.kind.as_str() {
            "unknown_job" => Error::UnknownJob(err.message),
            "panic" => Error::Panic(err.message),
            _ => Error::work_message(err.message),
        }),
        _ => Err(Error::protocol("response carries neither value nor error")),
    }
}

fn attendant_loop(shared: Arc<ProcShared>, slot: Arc<Mutex<Option<Child>>>, index: usize) {
    let mut io: Option<ChildIo> = None;
    let mut seq: u64 = 0;

    while let Ok(task) = shared.rx.recv() {
        if shared.draining.load(Ordering::Acquire) {
            let err = if shared.immediate.load(Ordering::Acquire) {
                Error::Cancelled
            } else {
                Error::Shutdown
            };
            (task.start)(Some(err));
            shared.pending.fetch_sub(1, Ordering::Relaxed);
            continue;
        }

        let finish = match (task.start)(None) {
            Some(finish) => finish,
            None => {
                // cancelled while queued; never reaches a worker
                shared.pending.fetch_sub(1, Ordering::Relaxed);
                continue;
            }
        };

        if io.is_none() {
            match spawn_child(&shared, &slot, index) {
                Ok(child_io) => io = Some(child_io),
                Err(err) => {
                    finish(Err(err));
                    shared.pending.fetch_sub(1, Ordering::Relaxed);
                    continue;
                }
            }
        }

        seq += 1;
        let outcome = exchange(io.as_mut().expect("child io present"), seq, &task.job, task.payload);
        if matches!(&outcome, Err(Error::Io(_) | Error::Protocol(_))) {
            // the child is gone; a fresh one is spawned for the next job
            io = None;
            *slot.lock() = None;
        }
        let outcome = match outcome {
            Err(_) if shared.immediate.load(Ordering::Acquire) => Err(Error::Cancelled),
            other => other,
        };
        finish(outcome);
        shared.pending.fetch_sub(1, Ordering::Relaxed);
    }

    // channel closed: retire the worker
    if let Some(child_io) = io.take() {
        drop(child_io.stdin);
        if let Some(mut child) = slot.lock().take() {
            let _ = child.wait();
        }
    }
    tracing::trace!(worker = index, "attendant exited");
}
