//! Crossings between the cooperative loop and the preemptive pools.
//!
//! Both directions preserve failure context: an error raised by the work is
//! re-delivered in the caller's own model — as an `Err` on the synchronous
//! side, as a `Failed` handle on the loop side — never printed and
//! swallowed.

use crate::coop::LoopHandle;
use crate::error::{Error, Result};
use crate::executor::ThreadPool;
use std::future::Future;
use std::time::Duration;

/// Run `f` on the thread pool and suspend the calling cooperative task
/// until it finishes. The loop stays free to run other tasks in the
/// meantime: the pool worker's completion is relayed through the handle's
/// waker into the loop's mailbox.
pub async fn run_in_pool<T, F>(pool: &ThreadPool, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    pool.submit(f)?.await
}

/// Fallible-work variant of [`run_in_pool`].
pub async fn try_run_in_pool<T, F>(pool: &ThreadPool, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    pool.submit_fallible(f)?.await
}

/// Schedule `future` on a running loop owned by another thread and block
/// the calling thread until it produces a value or an error.
///
/// Calling this from the loop's own thread can never complete — the thread
/// that would produce the result is the one blocking — so it fails fast
/// with [`Error::ReentrantCall`] instead of deadlocking.
pub fn run_in_loop<F, T>(loop_handle: &LoopHandle, future: F) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    run_in_loop_timeout(loop_handle, future, None)
}

/// [`run_in_loop`] with a wait deadline. On expiry the scheduled task is
/// left untouched and keeps running on the loop.
pub fn run_in_loop_timeout<F, T>(
    loop_handle: &LoopHandle,
    future: F,
    timeout: Option<Duration>,
) -> Result<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    if loop_handle.is_loop_thread() {
        return Err(Error::ReentrantCall);
    }
    let handle = loop_handle.spawn(future)?;
    handle.wait(timeout)?;
    handle.take_outcome()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coop::EventLoop;
    use crate::config::ShutdownMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_loop_awaits_pool_work() {
        let pool = ThreadPool::with_width(2).unwrap();
        let mut event_loop = EventLoop::new();

        let value = event_loop
            .run_until(async move {
                run_in_pool(&pool, || {
                    thread::sleep(Duration::from_millis(50));
                    7
                })
                .await
            })
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_loop_stays_responsive_during_pool_work() {
        let pool = ThreadPool::with_width(1).unwrap();
        let mut event_loop = EventLoop::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let ticker_ticks = Arc::clone(&ticks);
        event_loop.spawn(async move {
            loop {
                ticker_ticks.fetch_add(1, Ordering::SeqCst);
                yield_once().await;
            }
        });

        let value = event_loop
            .run_until(async move {
                run_in_pool(&pool, || {
                    thread::sleep(Duration::from_millis(50));
                    7
                })
                .await
            })
            .unwrap()
            .unwrap();

        assert_eq!(value, 7);
        // the ticker kept running while the pool job slept
        assert!(ticks.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn test_pool_error_reaches_the_loop() {
        let pool = ThreadPool::with_width(1).unwrap();
        let mut event_loop = EventLoop::new();

        let outcome = event_loop
            .run_until(async move {
                try_run_in_pool::<i32, _>(&pool, || Err(Error::work_message("bridge boom"))).await
            })
            .unwrap();
        assert_eq!(outcome.unwrap_err().to_string(), "task failed: bridge boom");
    }

    #[test]
    fn test_thread_blocks_on_loop_work() {
        let loop_handle = EventLoop::start().unwrap();
        let value: i32 = run_in_loop(&loop_handle, async { 6 * 7 }).unwrap();
        assert_eq!(value, 42);
        loop_handle.shutdown(ShutdownMode::Graceful);
    }

    #[test]
    fn test_reentrant_call_fails_fast() {
        let loop_handle = EventLoop::start().unwrap();
        let probe = loop_handle.clone();

        let result: Result<i32> = run_in_loop(&loop_handle, async move {
            // now on the loop thread: a nested blocking call must refuse
            match run_in_loop(&probe, async { 1 }) {
                Err(Error::ReentrantCall) => 0,
                other => panic!("expected ReentrantCall, got {other:?}"),
            }
        });
        assert_eq!(result.unwrap(), 0);
        loop_handle.shutdown(ShutdownMode::Graceful);
    }

    async fn yield_once() {
        struct YieldOnce(bool);
        impl Future for YieldOnce {
            type Output = ();
            fn poll(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
            ) -> std::task::Poll<()> {
                if self.0 {
                    std::task::Poll::Ready(())
                } else {
                    self.0 = true;
                    cx.waker().wake_by_ref();
                    std::task::Poll::Pending
                }
            }
        }
        YieldOnce(false).await
    }
}
