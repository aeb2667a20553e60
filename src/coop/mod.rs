//! Cooperative event loop.
//!
//! A single logical thread multiplexing many suspended tasks. Tasks yield
//! only at `.await` points and are never preempted mid-computation; true
//! parallelism never happens here. Cross-thread interaction — spawning from
//! a foreign thread, wakeups from pool workers — goes through a thread-safe
//! mailbox feeding the loop's own run queue.

pub(crate) mod waker;

use crate::config::ShutdownMode;
use crate::error::{Error, Result};
use crate::executor::handle::{self, TaskHandle};
use crate::executor::task::panic_message;
use crate::executor::Adapter;
use crossbeam_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};

use self::waker::LoopWaker;

pub(crate) enum LoopMsg {
    Wake(u64),
    Spawn(NewTask),
    /// A suspended task was preemptively cancelled; reap it.
    Sweep,
    Shutdown(ShutdownMode),
}

pub(crate) struct NewTask {
    future: BoxFuture<'static, ()>,
    probe: TaskProbe,
}

/// Type-erased hooks into a spawned task's handle, so the loop can observe
/// cancellation and deliver reap/panic outcomes without knowing `T`.
struct TaskProbe {
    is_cancelled: Box<dyn Fn() -> bool + Send>,
    reap: Box<dyn Fn() + Send>,
    fail: Box<dyn Fn(Error) + Send>,
}

struct LoopTask {
    future: BoxFuture<'static, ()>,
    probe: TaskProbe,
}

struct LoopShared {
    loop_thread: Mutex<Option<ThreadId>>,
    shut_down: AtomicBool,
    task_count: AtomicUsize,
}

/// The loop itself. Created on whatever thread will drive it, either
/// inline through [`EventLoop::run_until`] or on a dedicated thread through
/// [`EventLoop::start`].
pub struct EventLoop {
    tasks: HashMap<u64, LoopTask>,
    ready: VecDeque<u64>,
    mailbox_tx: Sender<LoopMsg>,
    mailbox_rx: Receiver<LoopMsg>,
    next_slot: u64,
    draining: Option<ShutdownMode>,
    shared: Arc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Self {
        let (mailbox_tx, mailbox_rx) = crossbeam_channel::unbounded();
        Self {
            tasks: HashMap::new(),
            ready: VecDeque::new(),
            mailbox_tx,
            mailbox_rx,
            next_slot: 0,
            draining: None,
            shared: Arc::new(LoopShared {
                loop_thread: Mutex::new(None),
                shut_down: AtomicBool::new(false),
                task_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Run the loop on a dedicated thread until shut down.
    pub fn start() -> Result<LoopHandle> {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.handle();
        let join = thread::Builder::new()
            .name("strand-loop".to_string())
            .spawn(move || event_loop.run_forever())
            .map_err(|e| Error::config(format!("spawn failed: {}", e)))?;
        *handle.join.lock() = Some(join);
        Ok(handle)
    }

    /// A cloneable, `Send` handle for foreign-thread interaction.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.mailbox_tx.clone(),
            shared: Arc::clone(&self.shared),
            join: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule a task on this loop. It starts running once the loop runs.
    pub fn spawn<F, T>(&mut self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (handle, task) = make_task(future);
        let mailbox = self.mailbox_tx.clone();
        handle.set_cancel_hook(move || {
            let _ = mailbox.send(LoopMsg::Sweep);
        });
        self.shared.task_count.fetch_add(1, Ordering::Relaxed);
        self.insert_task(task);
        handle
    }

    /// Drive the loop until `future` resolves, servicing every other
    /// scheduled task along the way. Errs with [`Error::Shutdown`] if the
    /// loop is shut down first.
    pub fn run_until<F, T>(&mut self, future: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.spawn(future);
        self.run_while(|| !handle.is_done());
        if !handle.is_done() {
            return Err(Error::Shutdown);
        }
        handle.take_outcome()
    }

    /// Run until shut down through a [`LoopHandle`].
    pub fn run_forever(&mut self) {
        self.run_while(|| true);
    }

    fn insert_task(&mut self, task: NewTask) {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.tasks.insert(
            slot,
            LoopTask {
                future: task.future,
                probe: task.probe,
            },
        );
        self.ready.push_back(slot);
    }

    fn run_while(&mut self, mut keep_going: impl FnMut() -> bool) {
        *self.shared.loop_thread.lock() = Some(thread::current().id());

        loop {
            while let Ok(msg) = self.mailbox_rx.try_recv() {
                self.handle_msg(msg);
            }

            match self.draining {
                Some(ShutdownMode::Immediate) => {
                    self.reap_all();
                    break;
                }
                Some(ShutdownMode::Graceful) if self.tasks.is_empty() => break,
                _ => {}
            }

            if !keep_going() {
                break;
            }

            if let Some(slot) = self.ready.pop_front() {
                self.poll_task(slot);
                continue;
            }

            // idle until something arrives
            match self.mailbox_rx.recv() {
                Ok(msg) => self.handle_msg(msg),
                Err(_) => break,
            }
        }

        *self.shared.loop_thread.lock() = None;
    }

    fn handle_msg(&mut self, msg: LoopMsg) {
        match msg {
            LoopMsg::Wake(slot) => {
                if self.tasks.contains_key(&slot) {
                    self.ready.push_back(slot);
                }
            }
            LoopMsg::Spawn(task) => {
                if self.draining.is_some() {
                    (task.probe.reap)();
                    self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
                } else {
                    self.insert_task(task);
                }
            }
            LoopMsg::Sweep => self.sweep(),
            LoopMsg::Shutdown(mode) => {
                tracing::debug!(?mode, "event loop shutting down");
                self.shared.shut_down.store(true, Ordering::Release);
                // immediate wins if both arrive
                if self.draining != Some(ShutdownMode::Immediate) {
                    self.draining = Some(mode);
                }
            }
        }
    }

    fn poll_task(&mut self, slot: u64) {
        let Some(mut task) = self.tasks.remove(&slot) else {
            // duplicate wake for a finished task
            return;
        };

        if (task.probe.is_cancelled)() {
            // preemption point: the future is dropped before its next poll
            (task.probe.reap)();
            self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        let waker = LoopWaker::waker(slot, self.mailbox_tx.clone());
        let mut cx = Context::from_waker(&waker);

        match catch_unwind(AssertUnwindSafe(|| task.future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(())) => {
                self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
            }
            Ok(Poll::Pending) => {
                self.tasks.insert(slot, task);
            }
            Err(payload) => {
                let msg = panic_message(payload);
                tracing::error!(slot, panic = %msg, "loop task panicked");
                (task.probe.fail)(Error::Panic(msg));
                self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn sweep(&mut self) {
        let dead: Vec<u64> = self
            .tasks
            .iter()
            .filter(|(_, task)| (task.probe.is_cancelled)())
            .map(|(slot, _)| *slot)
            .collect();
        for slot in dead {
            if let Some(task) = self.tasks.remove(&slot) {
                (task.probe.reap)();
                self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn reap_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            (task.probe.reap)();
            self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
        }
        self.ready.clear();
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("tasks", &self.tasks.len())
            .field("ready", &self.ready.len())
            .finish()
    }
}

fn make_task<F, T>(future: F) -> (TaskHandle<T>, NewTask)
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (handle, completer) = handle::pair_preemptible::<T>();

    let wrapped = async move {
        if !completer.start() {
            return;
        }
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(value) => completer.complete(Ok(value)),
            Err(payload) => {
                completer.complete(Err(Error::Panic(panic_message(payload))));
            }
        }
    }
    .boxed();

    let cancelled_probe = handle.clone();
    let reap_probe = handle.clone();
    let fail_probe = handle.clone();
    let probe = TaskProbe {
        is_cancelled: Box::new(move || cancelled_probe.cancel_requested()),
        reap: Box::new(move || reap_probe.force_cancel()),
        fail: Box::new(move |err| fail_probe.force_fail(err)),
    };

    (
        handle,
        NewTask {
            future: wrapped,
            probe,
        },
    )
}

/// Run a future to completion on a fresh single-use loop. The synchronous
/// entry point for calling async code from ordinary code.
pub fn block_on<F, T>(future: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    EventLoop::new().run_until(future)
}

/// Foreign-thread face of a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<LoopMsg>,
    shared: Arc<LoopShared>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LoopHandle {
    /// Schedule `future` on the loop from any thread.
    pub fn spawn<F, T>(&self, future: F) -> Result<TaskHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        let (handle, task) = make_task(future);
        let mailbox = self.tx.clone();
        handle.set_cancel_hook(move || {
            let _ = mailbox.send(LoopMsg::Sweep);
        });
        self.shared.task_count.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(LoopMsg::Spawn(task)).is_err() {
            self.shared.task_count.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::Shutdown);
        }
        Ok(handle)
    }

    /// Whether the calling thread is the thread currently driving the loop.
    pub fn is_loop_thread(&self) -> bool {
        *self.shared.loop_thread.lock() == Some(thread::current().id())
    }

    pub fn pending_tasks(&self) -> usize {
        self.shared.task_count.load(Ordering::Relaxed)
    }

    /// Shut the loop down. Idempotent. `Graceful` lets scheduled tasks
    /// finish; `Immediate` cancels them at the next suspension point.
    pub fn shutdown(&self, mode: ShutdownMode) {
        let first = !self.shared.shut_down.swap(true, Ordering::AcqRel);
        if first || mode == ShutdownMode::Immediate {
            let _ = self.tx.send(LoopMsg::Shutdown(mode));
        }
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }
}

impl Adapter for LoopHandle {
    fn width(&self) -> usize {
        1
    }

    fn pending(&self) -> usize {
        self.pending_tasks()
    }

    fn shutdown(&self, mode: ShutdownMode) {
        LoopHandle::shutdown(self, mode);
    }

    fn is_shut_down(&self) -> bool {
        LoopHandle::is_shut_down(self)
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("pending", &self.pending_tasks())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskState;
    use std::time::Duration;

    #[test]
    fn test_run_until_returns_value() {
        let mut event_loop = EventLoop::new();
        let value = event_loop.run_until(async { 2 + 2 }).unwrap();
        assert_eq!(value, 4);
    }

    #[test]
    fn test_block_on() {
        assert_eq!(block_on(async { "done" }).unwrap(), "done");
    }

    #[test]
    fn test_spawned_tasks_interleave() {
        let mut event_loop = EventLoop::new();
        let (tx, rx) = futures::channel::oneshot::channel::<i32>();

        let side = event_loop.spawn(async move {
            let value = rx.await.unwrap();
            value * 10
        });

        let main = event_loop
            .run_until(async move {
                tx.send(7).unwrap();
                1
            })
            .unwrap();
        assert_eq!(main, 1);

        // the side task got its wakeup while the main future ran
        let value = event_loop.run_until(async move { side.await }).unwrap();
        assert_eq!(value.unwrap(), 70);
    }

    #[test]
    fn test_loop_task_panic_fails_handle() {
        let mut event_loop = EventLoop::new();
        let handle = event_loop.spawn(async {
            panic!("loop task exploded");
        });
        let _ = event_loop.run_until(async {});
        // handle is polled before the trivial main future finishes
        let err = handle.result(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, Error::Panic(ref msg) if msg.contains("exploded")));
    }

    #[test]
    fn test_remote_spawn_and_shutdown() {
        let handle = EventLoop::start().unwrap();
        let task = handle.spawn(async { 5 }).unwrap();
        assert_eq!(task.result(Some(Duration::from_secs(2))).unwrap(), 5);

        handle.shutdown(ShutdownMode::Graceful);
        assert!(handle.is_shut_down());
        assert!(matches!(handle.spawn(async { 1 }), Err(Error::Shutdown)));
        // idempotent
        handle.shutdown(ShutdownMode::Graceful);
    }

    #[test]
    fn test_cancel_between_suspension_points() {
        let handle = EventLoop::start().unwrap();
        let task = handle
            .spawn(async {
                futures::future::pending::<()>().await;
                1
            })
            .unwrap();

        // wait until the first poll suspended it
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while task.state() == TaskState::Pending {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        assert!(task.cancel());
        assert!(matches!(
            task.result(Some(Duration::from_secs(2))),
            Err(Error::Cancelled)
        ));
        handle.shutdown(ShutdownMode::Immediate);
    }

    #[test]
    fn test_immediate_shutdown_cancels_scheduled() {
        let handle = EventLoop::start().unwrap();
        let stuck = handle
            .spawn(async {
                futures::future::pending::<()>().await;
            })
            .unwrap();
        handle.shutdown(ShutdownMode::Immediate);
        assert!(matches!(
            stuck.result(Some(Duration::from_secs(2))),
            Err(Error::Cancelled)
        ));
    }
}
