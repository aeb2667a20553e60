use strand::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_test_writer()
            .try_init();
    });
}

#[test]
fn test_result_matches_produced_value() {
    init_tracing();
    let pool = ThreadPool::with_width(4).unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| pool.submit(move || i * i).unwrap())
        .collect();
    for (i, handle) in handles.iter().enumerate() {
        assert_eq!(handle.result(None).unwrap(), (i * i) as i32);
    }
}

#[test]
fn test_error_is_reraised_verbatim() {
    let pool = ThreadPool::with_width(2).unwrap();
    let handle = pool
        .submit_fallible::<i32, _>(|| Err(Error::work_message("original failure text")))
        .unwrap();

    match handle.result(None) {
        Err(Error::Work(source)) => {
            assert_eq!(source.to_string(), "original failure text");
        }
        other => panic!("expected a work error, got {other:?}"),
    }
}

#[test]
fn test_pending_cancel_never_runs() {
    let pool = ThreadPool::with_width(1).unwrap();
    let ran = Arc::new(AtomicUsize::new(0));

    let blocker = pool
        .submit(|| thread::sleep(Duration::from_millis(150)))
        .unwrap();
    // wait for the blocker to occupy the single worker
    while blocker.state() != TaskState::Running {
        thread::sleep(Duration::from_millis(1));
    }

    let ran_clone = Arc::clone(&ran);
    let queued = pool
        .submit(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    assert!(queued.cancel());
    assert_eq!(queued.state(), TaskState::Cancelled);

    blocker.wait(None).unwrap();
    pool.shutdown(ShutdownMode::Graceful);
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(queued.state(), TaskState::Cancelled);
}

#[test]
fn test_timeout_then_real_outcome() {
    let pool = ThreadPool::with_width(1).unwrap();
    let handle = pool
        .submit(|| {
            thread::sleep(Duration::from_millis(120));
            "late but fine"
        })
        .unwrap();

    assert!(matches!(
        handle.result(Some(Duration::from_millis(10))),
        Err(Error::Timeout)
    ));
    // the timeout did not corrupt the handle
    assert!(!handle.state().is_terminal());
    assert_eq!(handle.result(Some(Duration::from_secs(5))).unwrap(), "late but fine");
}

#[test]
fn test_done_callbacks_see_the_outcome() {
    let pool = ThreadPool::with_width(2).unwrap();
    let observed = Arc::new(AtomicUsize::new(0));

    let handle = pool.submit(|| 7usize).unwrap();
    let observed_clone = Arc::clone(&observed);
    handle.add_done_callback(move |h| {
        observed_clone.store(h.result(None).unwrap(), Ordering::SeqCst);
    });

    handle.wait(None).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while observed.load(Ordering::SeqCst) != 7 {
        assert!(Instant::now() < deadline, "callback never delivered the result");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_loop_awaits_pool_without_blocking() {
    init_tracing();
    let pool = ThreadPool::with_width(2).unwrap();
    let mut event_loop = EventLoop::new();
    let ticks = Arc::new(AtomicUsize::new(0));

    // a side task that keeps counting while the bridged job sleeps
    let ticker = Arc::clone(&ticks);
    event_loop.spawn(async move {
        for _ in 0..1_000_000 {
            ticker.fetch_add(1, Ordering::SeqCst);
            support::pending_once().await;
        }
    });

    let value = event_loop
        .run_until(async move {
            strand::bridge::run_in_pool(&pool, || {
                thread::sleep(Duration::from_millis(50));
                7
            })
            .await
        })
        .unwrap()
        .unwrap();

    assert_eq!(value, 7);
    assert!(ticks.load(Ordering::SeqCst) > 1, "the loop was blocked");
}

mod support {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    pub fn pending_once() -> PendingOnce {
        PendingOnce(false)
    }

    pub struct PendingOnce(bool);

    impl Future for PendingOnce {
        type Output = ();

        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

#[test]
fn test_foreign_thread_blocks_on_loop() {
    let loop_handle = EventLoop::start().unwrap();

    let results: Vec<i32> = (0..4)
        .map(|i| {
            let handle = loop_handle.clone();
            thread::spawn(move || strand::bridge::run_in_loop(&handle, async move { i * 2 }).unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();

    assert_eq!(results, vec![0, 2, 4, 6]);
    loop_handle.shutdown(ShutdownMode::Graceful);
}

#[test]
fn test_adapter_contract_is_uniform() {
    let thread_pool = ThreadPool::with_width(3).unwrap();
    let process_pool = ProcessPool::with_width(2).unwrap();
    let loop_handle = EventLoop::start().unwrap();

    let adapters: Vec<&dyn Adapter> = vec![&thread_pool, &process_pool, &loop_handle];
    assert_eq!(
        adapters.iter().map(|a| a.width()).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
    for adapter in &adapters {
        assert!(!adapter.is_shut_down());
    }

    for adapter in &adapters {
        adapter.shutdown(ShutdownMode::Graceful);
        adapter.shutdown(ShutdownMode::Graceful); // idempotent
        assert!(adapter.is_shut_down());
    }
}

#[test]
fn test_submission_is_non_blocking() {
    let pool = ThreadPool::with_width(1).unwrap();

    let start = Instant::now();
    let handles: Vec<_> = (0..10)
        .map(|_| {
            pool.submit(|| thread::sleep(Duration::from_millis(20)))
                .unwrap()
        })
        .collect();
    // ten 20ms jobs queued on one worker, yet submission returned at once
    assert!(start.elapsed() < Duration::from_millis(100));

    for handle in handles {
        handle.wait(Some(Duration::from_secs(5))).unwrap();
    }
}
