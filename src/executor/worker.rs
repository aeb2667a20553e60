// worker thread loop
use super::task::Task;
use crate::telemetry::Metrics;
use crate::util::Backoff;
use crossbeam_deque::{Injector, Steal};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub type WorkerId = usize;

/// State shared between the pool handle and its workers.
pub(crate) struct PoolShared {
    pub(crate) injector: Injector<Task>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) queued: AtomicUsize,
    pub(crate) running: AtomicUsize,
    pub(crate) metrics: Metrics,
}

impl PoolShared {
    pub fn new() -> Self {
        Self {
            injector: Injector::new(),
            shutdown: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            metrics: Metrics::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.queued.load(Ordering::Relaxed) + self.running.load(Ordering::Relaxed)
    }
}

pub(crate) struct Worker {
    pub id: WorkerId,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self { id }
    }

    // main loop: single-task steals keep the start order strictly FIFO
    pub fn run(&self, shared: Arc<PoolShared>) {
        let backoff = Backoff::new();

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }

            match shared.injector.steal() {
                Steal::Success(task) => {
                    backoff.reset();
                    self.execute_task(task, &shared);
                }
                Steal::Empty => backoff.idle(),
                Steal::Retry => continue,
            }
        }
    }

    fn execute_task(&self, task: Task, shared: &PoolShared) {
        shared.queued.fetch_sub(1, Ordering::Relaxed);
        shared.running.fetch_add(1, Ordering::Relaxed);
        let tid = task.id;

        // User panics are caught inside the task payload; this guard only
        // protects the worker thread from payload infrastructure.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.execute();
        }));
        if result.is_err() {
            tracing::error!(worker = self.id, task = tid.as_u64(), "task wrapper panicked");
        }

        shared.running.fetch_sub(1, Ordering::Relaxed);
    }
}
