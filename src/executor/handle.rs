//! Task handles: the common currency between every execution substrate.
//!
//! A [`TaskHandle`] is created in `Pending` state by the adapter that accepts
//! a unit of work, moves through `Running`, and lands in exactly one terminal
//! state. Only the owning adapter holds the [`Completer`] half of the pair
//! and may perform that transition; everyone else observes.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

static HANDLE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a submitted unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(HANDLE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

type DoneCallback<T> = Box<dyn FnOnce(&TaskHandle<T>) + Send>;

struct Inner<T> {
    state: TaskState,
    outcome: Option<Result<T>>,
    callbacks: Vec<DoneCallback<T>>,
    waker: Option<Waker>,
    cancel_requested: bool,
    // whether the owning adapter can honor cancellation of running work
    preemptible: bool,
    // one-shot notification to the owning adapter that a preemptive
    // cancellation happened, e.g. so the loop sweeps the dead task
    cancel_hook: Option<Box<dyn Fn() + Send>>,
}

struct Shared<T> {
    id: TaskId,
    inner: Mutex<Inner<T>>,
    done: Condvar,
}

/// Observer side of one unit of work. Cheap to clone; all clones watch the
/// same outcome.
pub struct TaskHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Owner side of one unit of work, held by the adapter that runs it.
/// Consumed by the single terminal transition; dropping it without
/// completing fails the handle so waiters can never hang.
pub(crate) struct Completer<T> {
    shared: Arc<Shared<T>>,
}

pub(crate) fn pair<T: Send>() -> (TaskHandle<T>, Completer<T>) {
    pair_with(false)
}

/// A pair whose `cancel()` reports success for running work; used by the
/// cooperative loop, which can actually stop a task between suspension
/// points.
pub(crate) fn pair_preemptible<T: Send>() -> (TaskHandle<T>, Completer<T>) {
    pair_with(true)
}

fn pair_with<T: Send>(preemptible: bool) -> (TaskHandle<T>, Completer<T>) {
    let shared = Arc::new(Shared {
        id: TaskId::next(),
        inner: Mutex::new(Inner {
            state: TaskState::Pending,
            outcome: None,
            callbacks: Vec::new(),
            waker: None,
            cancel_requested: false,
            preemptible,
            cancel_hook: None,
        }),
        done: Condvar::new(),
    });
    (
        TaskHandle {
            shared: Arc::clone(&shared),
        },
        Completer { shared },
    )
}

impl<T: Send> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.inner.lock().state
    }

    pub fn is_done(&self) -> bool {
        self.state().is_terminal()
    }

    /// Block until the handle reaches a terminal state or the deadline
    /// elapses. A timeout leaves the handle untouched, so a later wait (or a
    /// callback) can still observe the real outcome.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<TaskState> {
        let mut inner = self.shared.inner.lock();
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !inner.state.is_terminal() {
                    if self.shared.done.wait_until(&mut inner, deadline).timed_out()
                        && !inner.state.is_terminal()
                    {
                        return Err(Error::Timeout);
                    }
                }
            }
            None => {
                while !inner.state.is_terminal() {
                    self.shared.done.wait(&mut inner);
                }
            }
        }
        Ok(inner.state)
    }

    /// Block for the outcome: the produced value on `Completed`, the stored
    /// error on `Failed`, [`Error::Cancelled`] on `Cancelled`, and
    /// [`Error::Timeout`] if the deadline elapses first.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T>
    where
        T: Clone,
    {
        self.wait(timeout)?;
        let inner = self.shared.inner.lock();
        match inner.outcome.as_ref() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(stateless_error(inner.state)),
        }
    }

    /// Request cancellation. Returns true only when the work was still
    /// queued (`Pending`, guaranteed cancellable) or when the owning
    /// adapter can preempt running work, as the cooperative loop can
    /// between suspension points. Running thread- or process-pool work
    /// cannot be stopped; those requests return false and the work runs to
    /// completion.
    pub fn cancel(&self) -> bool {
        enum Action {
            Finish,
            Preempt(Option<Box<dyn Fn() + Send>>),
            Refuse,
        }

        let action = {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                TaskState::Pending => Action::Finish,
                TaskState::Running => {
                    inner.cancel_requested = true;
                    if inner.preemptible {
                        Action::Preempt(inner.cancel_hook.take())
                    } else {
                        Action::Refuse
                    }
                }
                _ => Action::Refuse,
            }
        };

        match action {
            Action::Finish => {
                finish(&self.shared, Err(Error::Cancelled));
                true
            }
            Action::Preempt(hook) => {
                finish(&self.shared, Err(Error::Cancelled));
                if let Some(hook) = hook {
                    hook();
                }
                true
            }
            Action::Refuse => false,
        }
    }

    /// Register `f` to run once the handle is terminal. Callbacks fire in
    /// registration order, in the completing adapter's context; registering
    /// after completion fires immediately on the calling thread.
    pub fn add_done_callback<F>(&self, f: F)
    where
        F: FnOnce(&TaskHandle<T>) + Send + 'static,
    {
        {
            let mut inner = self.shared.inner.lock();
            if !inner.state.is_terminal() {
                inner.callbacks.push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Remove the stored outcome. Used by single-consumer owners (the chain
    /// engine, the `Future` impl); `result()` on another clone afterwards
    /// reports the terminal state without the value.
    pub(crate) fn take_outcome(&self) -> Result<T> {
        let mut inner = self.shared.inner.lock();
        debug_assert!(inner.state.is_terminal());
        match inner.outcome.take() {
            Some(outcome) => outcome,
            None => Err(stateless_error(inner.state)),
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.cancel_requested || inner.state == TaskState::Cancelled
    }

    pub(crate) fn set_cancel_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + 'static,
    {
        self.shared.inner.lock().cancel_hook = Some(Box::new(hook));
    }

    /// Terminalize as cancelled, used by the loop when it reaps a task
    /// between suspension points. No-op once terminal.
    pub(crate) fn force_cancel(&self) {
        finish(&self.shared, Err(Error::Cancelled));
    }

    /// Terminalize with `err`, used by the loop when polling a task
    /// panicked. No-op once terminal.
    pub(crate) fn force_fail(&self, err: Error) {
        finish(&self.shared, Err(err));
    }
}

fn stateless_error(state: TaskState) -> Error {
    match state {
        TaskState::Cancelled => Error::Cancelled,
        _ => Error::protocol("task outcome already consumed"),
    }
}

/// Perform the single terminal transition, then notify waiters, fire
/// callbacks in order, and wake a parked future, all outside the lock.
fn finish<T>(shared: &Arc<Shared<T>>, outcome: Result<T>) {
    let (callbacks, waker) = {
        let mut inner = shared.inner.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.state = match &outcome {
            Ok(_) => TaskState::Completed,
            Err(Error::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        inner.outcome = Some(outcome);
        shared.done.notify_all();
        (std::mem::take(&mut inner.callbacks), inner.waker.take())
    };

    if !callbacks.is_empty() {
        let handle = TaskHandle {
            shared: Arc::clone(shared),
        };
        for callback in callbacks {
            callback(&handle);
        }
    }
    if let Some(waker) = waker {
        waker.wake();
    }
}

impl<T: Send> Completer<T> {
    /// Mark the work as running. Returns false if the handle was cancelled
    /// while still queued, in which case the work must not be executed.
    pub fn start(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state == TaskState::Pending {
            inner.state = TaskState::Running;
            true
        } else {
            false
        }
    }

    pub fn complete(self, outcome: Result<T>) {
        finish(&self.shared, outcome);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let lost = !self.shared.inner.lock().state.is_terminal();
        if lost {
            // The work was dropped without completing: unwinding poll or a
            // discarded queue entry. Fail the handle so waiters wake up.
            let err = if std::thread::panicking() {
                Error::Panic("task dropped while panicking".to_string())
            } else {
                Error::Shutdown
            };
            finish(&self.shared, Err(err));
        }
    }
}

/// Awaiting a handle suspends the calling task until the terminal
/// transition, which relays the wake across threads. This is the
/// loop-facing face of the bridge.
impl<T: Send> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.shared.inner.lock();
        if inner.state.is_terminal() {
            let outcome = match inner.outcome.take() {
                Some(outcome) => outcome,
                None => Err(stateless_error(inner.state)),
            };
            Poll::Ready(outcome)
        } else {
            match inner.waker.as_mut() {
                Some(waker) => waker.clone_from(cx.waker()),
                None => inner.waker = Some(cx.waker().clone()),
            }
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_complete_delivers_value() {
        let (handle, completer) = pair::<i32>();
        assert_eq!(handle.state(), TaskState::Pending);

        assert!(completer.start());
        assert_eq!(handle.state(), TaskState::Running);

        completer.complete(Ok(42));
        assert_eq!(handle.state(), TaskState::Completed);
        assert_eq!(handle.result(None).unwrap(), 42);
        // observable again by another holder
        assert_eq!(handle.clone().result(None).unwrap(), 42);
    }

    #[test]
    fn test_failure_redelivers_error() {
        let (handle, completer) = pair::<i32>();
        completer.complete(Err(Error::work_message("boom")));

        assert_eq!(handle.state(), TaskState::Failed);
        let err = handle.result(None).unwrap_err();
        assert_eq!(err.to_string(), "task failed: boom");
    }

    #[test]
    fn test_cancel_pending_is_guaranteed() {
        let (handle, completer) = pair::<i32>();
        assert!(handle.cancel());
        assert_eq!(handle.state(), TaskState::Cancelled);
        assert!(matches!(handle.result(None), Err(Error::Cancelled)));

        // The adapter learns about it at dequeue time.
        assert!(!completer.start());
        // A second cancel is a no-op.
        assert!(!handle.cancel());
    }

    #[test]
    fn test_cancel_running_is_best_effort() {
        let (handle, completer) = pair::<i32>();
        assert!(completer.start());
        assert!(!handle.cancel());
        completer.complete(Ok(7));
        assert_eq!(handle.result(None).unwrap(), 7);
    }

    #[test]
    fn test_timeout_leaves_state_untouched() {
        let (handle, completer) = pair::<i32>();
        assert!(matches!(
            handle.result(Some(Duration::from_millis(20))),
            Err(Error::Timeout)
        ));
        assert_eq!(handle.state(), TaskState::Pending);

        completer.start();
        completer.complete(Ok(5));
        assert_eq!(handle.result(Some(Duration::from_millis(20))).unwrap(), 5);
    }

    #[test]
    fn test_callbacks_fire_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (handle, completer) = pair::<i32>();

        for i in 0..3 {
            let order = Arc::clone(&order);
            handle.add_done_callback(move |_| order.lock().push(i));
        }
        completer.complete(Ok(1));
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_late_callback_fires_immediately() {
        let fired = Arc::new(AtomicUsize::new(0));
        let (handle, completer) = pair::<i32>();
        completer.complete(Ok(1));

        let fired2 = Arc::clone(&fired);
        handle.add_done_callback(move |h| {
            assert_eq!(h.state(), TaskState::Completed);
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_completer_fails_handle() {
        let (handle, completer) = pair::<i32>();
        drop(completer);
        assert!(matches!(handle.result(None), Err(Error::Shutdown)));
    }

    #[test]
    fn test_handle_is_a_future() {
        let (handle, completer) = pair::<i32>();
        let waiter = handle.clone();

        let t = std::thread::spawn(move || futures::executor::block_on(waiter));
        std::thread::sleep(Duration::from_millis(10));
        completer.start();
        completer.complete(Ok(99));

        assert_eq!(t.join().unwrap().unwrap(), 99);
    }
}
