//! Self-rescheduling one-shot timer.
//!
//! Each `start` arms a single firing on the tokio runtime. The timer tracks
//! an explicit `idle -> running -> idle` state under a mutex so that ticks
//! never overlap, and so `dispose` can park the calling thread on a condvar
//! until the in-flight tick has finished.

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{error, warn};

type Tick = Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct ReschedulingTimer {
    shared: Arc<Shared>,
}

struct Shared {
    runtime: Handle,
    tick: Tick,
    state: Mutex<TimerState>,
    idle: Condvar,
}

#[derive(Default)]
struct TimerState {
    /// Bumped on every arm and on dispose; a sleeper only fires if its
    /// generation is still current.
    generation: u64,
    /// Sleeper that has not fired yet.
    armed: Option<JoinHandle<()>>,
    running: bool,
    /// A firing came due while a tick was running.
    deferred: bool,
    disposed: bool,
}

impl ReschedulingTimer {
    /// Create an idle timer. `tick` is invoked once per firing.
    pub fn new<F, Fut>(runtime: Handle, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let tick: Tick = Box::new(move || Box::pin(tick()));
        Self {
            shared: Arc::new(Shared {
                runtime,
                tick,
                state: Mutex::new(TimerState::default()),
                idle: Condvar::new(),
            }),
        }
    }

    /// Arm a single firing after `interval`, replacing any arming that has
    /// not fired yet. Safe to call from inside the tick. Ignored once the
    /// timer is disposed.
    pub fn start(&self, interval: Duration) {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return;
        }

        state.generation = state.generation.wrapping_add(1);
        if let Some(pending) = state.armed.take() {
            pending.abort();
        }

        let generation = state.generation;
        let shared = Arc::clone(&self.shared);
        state.armed = Some(self.shared.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            shared.fire(generation).await;
        }));
    }

    /// Cancel pending firings and block until any running tick completes.
    ///
    /// Must not be called from inside the tick itself, and must not be called
    /// on a thread the tick needs in order to make progress (for example the
    /// only thread of a current-thread runtime).
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock();
        state.disposed = true;
        state.generation = state.generation.wrapping_add(1);
        if let Some(pending) = state.armed.take() {
            pending.abort();
        }
        while state.running {
            self.shared.idle.wait(&mut state);
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }
}

impl Drop for ReschedulingTimer {
    fn drop(&mut self) {
        // Non-blocking: a tick that is already running finishes on its own.
        let mut state = self.shared.state.lock();
        state.disposed = true;
        if let Some(pending) = state.armed.take() {
            pending.abort();
        }
    }
}

impl Shared {
    async fn fire(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.generation != generation {
                return;
            }
            state.armed = None;
            if state.running {
                state.deferred = true;
                return;
            }
            state.running = true;
        }

        let mut guard = RunningGuard {
            shared: self,
            active: true,
        };

        loop {
            // The tick runs as its own task so a panic surfaces as a JoinError
            // here instead of leaving the timer stuck in `running`.
            if let Err(e) = self.runtime.spawn((self.tick)()).await {
                if e.is_panic() {
                    error!(error = %e, "timer tick panicked");
                } else {
                    warn!(error = %e, "timer tick cancelled");
                }
            }

            let again = {
                let mut state = self.state.lock();
                if state.deferred && !state.disposed {
                    state.deferred = false;
                    true
                } else {
                    state.running = false;
                    state.deferred = false;
                    guard.active = false;
                    self.idle.notify_all();
                    false
                }
            };
            if !again {
                break;
            }
        }
    }
}

/// Returns the timer to idle if the firing future is dropped mid-tick
/// (runtime shutdown), so `dispose` never waits on a tick that is gone.
struct RunningGuard<'a> {
    shared: &'a Shared,
    active: bool,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if self.active {
            let mut state = self.shared.state.lock();
            state.running = false;
            state.deferred = false;
            self.shared.idle.notify_all();
        }
    }
}
