//! Integration tests for the rescheduling timer.
//!
//! Each test owns a multi-thread runtime and drives the timer from the test
//! thread, the way the engine does from producer threads.

use batchq::timer::ReschedulingTimer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Poll `condition` until it holds or `timeout` passes.
fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(ms(5));
    }
    condition()
}

const PATIENCE: Duration = Duration::from_secs(5);

/// Timer whose tick counts invocations, tracks overlap and sleeps `work`.
struct TickStats {
    runs: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    finished: AtomicBool,
}

fn counting_timer(rt: &Runtime, work: Duration) -> (ReschedulingTimer, Arc<TickStats>) {
    let stats = Arc::new(TickStats {
        runs: AtomicUsize::new(0),
        active: AtomicUsize::new(0),
        max_active: AtomicUsize::new(0),
        finished: AtomicBool::new(false),
    });
    let p = Arc::clone(&stats);
    let timer = ReschedulingTimer::new(rt.handle().clone(), move || {
        let p = Arc::clone(&p);
        async move {
            let now = p.active.fetch_add(1, Ordering::SeqCst) + 1;
            p.max_active.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(work).await;
            p.runs.fetch_add(1, Ordering::SeqCst);
            p.active.fetch_sub(1, Ordering::SeqCst);
            p.finished.store(true, Ordering::SeqCst);
        }
    });
    (timer, stats)
}

// ---------------------------------------------------------------------------
// Arming
// ---------------------------------------------------------------------------

#[test]
fn fires_once_per_start() {
    let rt = runtime();
    let (timer, stats) = counting_timer(&rt, Duration::ZERO);

    timer.start(ms(10));
    assert!(wait_until(PATIENCE, || stats.runs.load(Ordering::SeqCst) == 1));
    sleep(ms(50));
    assert_eq!(stats.runs.load(Ordering::SeqCst), 1);

    timer.start(ms(10));
    assert!(wait_until(PATIENCE, || stats.runs.load(Ordering::SeqCst) == 2));
}

#[test]
fn restart_replaces_pending_firing() {
    let rt = runtime();
    let (timer, stats) = counting_timer(&rt, Duration::ZERO);

    timer.start(ms(50));
    timer.start(ms(50));
    timer.start(ms(50));
    assert!(wait_until(PATIENCE, || stats.runs.load(Ordering::SeqCst) == 1));
    sleep(ms(150));
    assert_eq!(stats.runs.load(Ordering::SeqCst), 1);
}

#[test]
fn firings_during_a_tick_are_coalesced_not_overlapped() {
    let rt = runtime();
    let (timer, stats) = counting_timer(&rt, ms(100));

    timer.start(Duration::ZERO);
    assert!(wait_until(PATIENCE, || stats.active.load(Ordering::SeqCst) == 1));

    // Two more firings come due while the first tick is still running.
    timer.start(Duration::ZERO);
    sleep(ms(20));
    timer.start(Duration::ZERO);

    assert!(wait_until(PATIENCE, || {
        stats.runs.load(Ordering::SeqCst) == 2 && !timer.is_running()
    }));
    sleep(ms(150));
    assert_eq!(stats.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(stats.runs.load(Ordering::SeqCst), 2);
}

#[test]
fn tick_can_rearm_itself() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let slot: Arc<std::sync::OnceLock<ReschedulingTimer>> = Arc::new(std::sync::OnceLock::new());

    let (r, s) = (Arc::clone(&runs), Arc::clone(&slot));
    let timer = ReschedulingTimer::new(rt.handle().clone(), move || {
        let (r, s) = (Arc::clone(&r), Arc::clone(&s));
        async move {
            if r.fetch_add(1, Ordering::SeqCst) + 1 < 3 {
                if let Some(timer) = s.get() {
                    timer.start(ms(5));
                }
            }
        }
    });
    assert!(slot.set(timer).is_ok());

    slot.get().unwrap().start(ms(5));
    assert!(wait_until(PATIENCE, || runs.load(Ordering::SeqCst) == 3));
    sleep(ms(50));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Disposal
// ---------------------------------------------------------------------------

#[test]
fn dispose_waits_for_running_tick() {
    let rt = runtime();
    let (timer, stats) = counting_timer(&rt, ms(150));

    timer.start(Duration::ZERO);
    assert!(wait_until(PATIENCE, || stats.active.load(Ordering::SeqCst) == 1));

    timer.dispose();
    assert!(stats.finished.load(Ordering::SeqCst));
    assert!(!timer.is_running());
    assert!(timer.is_disposed());
}

#[test]
fn dispose_cancels_pending_firing() {
    let rt = runtime();
    let (timer, stats) = counting_timer(&rt, Duration::ZERO);

    timer.start(ms(50));
    timer.dispose();
    sleep(ms(200));
    assert_eq!(stats.runs.load(Ordering::SeqCst), 0);
}

#[test]
fn start_after_dispose_is_ignored() {
    let rt = runtime();
    let (timer, stats) = counting_timer(&rt, Duration::ZERO);

    timer.dispose();
    timer.start(Duration::ZERO);
    sleep(ms(100));
    assert_eq!(stats.runs.load(Ordering::SeqCst), 0);
}

#[test]
fn dispose_on_idle_timer_returns_immediately() {
    let rt = runtime();
    let (timer, _stats) = counting_timer(&rt, Duration::ZERO);
    timer.dispose();
    timer.dispose();
    assert!(timer.is_disposed());
}

#[test]
fn panicking_tick_does_not_wedge_the_timer() {
    let rt = runtime();
    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    let timer = ReschedulingTimer::new(rt.handle().clone(), move || {
        let r = Arc::clone(&r);
        async move {
            if r.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("tick failure");
            }
        }
    });

    // Printing the panic can be slow (backtraces), so poll rather than sleep.
    timer.start(Duration::ZERO);
    assert!(wait_until(PATIENCE, || {
        runs.load(Ordering::SeqCst) == 1 && !timer.is_running()
    }));

    // Still usable after the panic.
    timer.start(Duration::ZERO);
    assert!(wait_until(PATIENCE, || {
        runs.load(Ordering::SeqCst) == 2 && !timer.is_running()
    }));

    timer.dispose();
}
