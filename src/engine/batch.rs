//! Batch engine: accepts items, flushes them in bounded batches on a timer,
//! backs off and sheds load while the sink is failing.

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info};
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::queue::BoundedWorkQueue;
use crate::telemetry::batch::{record_flush_result, start_flush_span};
use crate::telemetry::metrics;
use crate::timer::ReschedulingTimer;

use super::incident::{Incident, IncidentObserver, log_incident};
use super::sink::BatchSink;

type Include<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Point-in-time view of an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStatus {
    /// Items waiting in the queue (not counting a staged batch).
    pub queued: usize,
    pub consecutive_failures: u32,
    pub started: bool,
    pub unloading: bool,
}

/// Batching delivery engine.
///
/// Any number of threads may [`submit`](Self::submit); a single
/// timer-driven cycle drains the queue and calls the sink, so the sink is
/// never invoked concurrently. Cloning is cheap and shares the engine.
pub struct BatchEngine<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for BatchEngine<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T, S> {
    id: Uuid,
    config: EngineConfig,
    queue: BoundedWorkQueue<T>,
    sink: S,
    include: Option<Include<T>>,
    on_incident: IncidentObserver,
    runtime: Handle,
    timer: ReschedulingTimer,
    /// Guards the started/unloading transitions. The flags are also atomics
    /// so the steady-state submit path takes no lock.
    boundary: Mutex<()>,
    started: AtomicBool,
    unloading: AtomicBool,
    /// Owned by the flush cycle; the async mutex is never contended because
    /// ticks do not overlap and the final flush runs after the timer is
    /// disposed.
    cycle: tokio::sync::Mutex<CycleState<T>>,
    /// Mirror of the backoff failure count for `status()`.
    failures: AtomicU32,
    cancel: CancellationToken,
}

struct CycleState<T> {
    staging: Vec<T>,
    backoff: BackoffPolicy,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`BatchEngine`]. Only the sink is required.
pub struct BatchEngineBuilder<T, S> {
    config: EngineConfig,
    sink: S,
    include: Option<Include<T>>,
    on_incident: Option<IncidentObserver>,
    runtime: Option<Handle>,
}

impl<T, S> BatchEngineBuilder<T, S>
where
    T: Send + Sync + 'static,
    S: BatchSink<T>,
{
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Only items for which `include` returns true are flushed; the rest are
    /// discarded when dequeued.
    pub fn include(mut self, include: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.include = Some(Box::new(include));
        self
    }

    pub fn on_incident(mut self, observer: impl Fn(&Incident) + Send + Sync + 'static) -> Self {
        self.on_incident = Some(Arc::new(observer));
        self
    }

    /// Runtime that drives the timer and the sink. Defaults to the runtime
    /// the builder is called from.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Validate the configuration and build the engine.
    pub fn build(self) -> Result<BatchEngine<T, S>> {
        self.config.validate()?;

        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|e| {
                Error::Runtime(format!("batch engine needs a tokio runtime: {e}"))
            })?,
        };

        let config = self.config;
        let backoff = BackoffPolicy::new(config.period, config.min_backoff, config.max_backoff);
        let queue = BoundedWorkQueue::new(config.queue_limit);
        let on_incident = self.on_incident.unwrap_or_else(|| Arc::new(log_incident));

        let inner = Arc::new_cyclic(|weak: &Weak<Inner<T, S>>| {
            let weak = weak.clone();
            let timer = ReschedulingTimer::new(runtime.clone(), move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_tick().await;
                    }
                }
            });

            Inner {
                id: Uuid::new_v4(),
                config,
                queue,
                sink: self.sink,
                include: self.include,
                on_incident,
                runtime,
                timer,
                boundary: Mutex::new(()),
                started: AtomicBool::new(false),
                unloading: AtomicBool::new(false),
                cycle: tokio::sync::Mutex::new(CycleState {
                    staging: Vec::new(),
                    backoff,
                }),
                failures: AtomicU32::new(0),
                cancel: CancellationToken::new(),
            }
        });

        debug!(engine_id = %inner.id, config = ?inner.config, "batch engine created");
        Ok(BatchEngine { inner })
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl<T, S> BatchEngine<T, S>
where
    T: Send + Sync + 'static,
    S: BatchSink<T>,
{
    pub fn builder(sink: S) -> BatchEngineBuilder<T, S> {
        BatchEngineBuilder {
            config: EngineConfig::default(),
            sink,
            include: None,
            on_incident: None,
            runtime: None,
        }
    }

    /// Build an engine on the current tokio runtime.
    pub fn new(config: EngineConfig, sink: S) -> Result<Self> {
        Self::builder(sink).config(config).build()
    }

    /// Build an engine on an explicit runtime; usable from outside it.
    pub fn with_runtime(config: EngineConfig, sink: S, runtime: Handle) -> Result<Self> {
        Self::builder(sink).config(config).runtime(runtime).build()
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Queue an item for delivery. Never blocks and never fails: items are
    /// silently dropped when the queue is full or the engine is shutting
    /// down. The first item starts the flush timer.
    pub fn submit(&self, item: T) {
        let inner = &self.inner;

        if inner.unloading.load(Ordering::Acquire) {
            return;
        }

        if !inner.started.load(Ordering::Acquire) {
            let _boundary = inner.boundary.lock();
            if inner.unloading.load(Ordering::Acquire) {
                return;
            }
            if !inner.started.load(Ordering::Acquire) {
                inner.enqueue(item);
                inner.started.store(true, Ordering::Release);
                // No flush has run yet, so the backoff interval is the period.
                let first = if inner.config.eagerly_emit_first_item {
                    Duration::ZERO
                } else {
                    inner.config.period
                };
                inner.timer.start(first);
                debug!(engine_id = %inner.id, first_flush_in = ?first, "batch engine started");
                return;
            }
        }

        inner.enqueue(item);
    }

    /// Stop accepting items, wait for an in-flight flush, then run one final
    /// flush of whatever is left.
    ///
    /// Blocks the calling thread until the final flush returns. The final
    /// flush runs on a dedicated thread, so a sink that resumes on some
    /// other executor cannot deadlock against the caller. Do not call this
    /// from a current-thread runtime's own thread; use
    /// [`close_async`](Self::close_async) there. Idempotent; a no-op if no
    /// item was ever submitted.
    pub fn close(&self) {
        let inner = &self.inner;
        {
            let _boundary = inner.boundary.lock();
            if !inner.started.load(Ordering::Acquire) || inner.unloading.load(Ordering::Acquire) {
                return;
            }
            inner.unloading.store(true, Ordering::Release);
        }

        info!(engine_id = %inner.id, queued = inner.queue.len(), "closing batch engine");
        inner.cancel.cancel();
        inner.timer.dispose();

        let drain = Arc::clone(inner);
        let runtime = inner.runtime.clone();
        let worker = std::thread::Builder::new()
            .name("batchq-final-flush".to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    drain.run_cycle(&CancellationToken::new(), true).await;
                })
            });

        match worker {
            Ok(handle) => {
                if handle.join().is_err() {
                    error!(engine_id = %inner.id, "final flush panicked");
                }
            }
            Err(e) => error!(engine_id = %inner.id, error = %e, "failed to spawn final flush thread"),
        }

        info!(engine_id = %inner.id, "batch engine closed");
    }

    /// [`close`](Self::close) on the blocking pool, for async callers.
    pub async fn close_async(&self) {
        let engine = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || engine.close()).await {
            error!(engine_id = %self.inner.id, error = %e, "close task failed");
        }
    }

    pub fn status(&self) -> EngineStatus {
        let inner = &self.inner;
        EngineStatus {
            queued: inner.queue.len(),
            consecutive_failures: inner.failures.load(Ordering::Acquire),
            started: inner.started.load(Ordering::Acquire),
            unloading: inner.unloading.load(Ordering::Acquire),
        }
    }
}

impl<T, S> Inner<T, S>
where
    T: Send + Sync + 'static,
    S: BatchSink<T>,
{
    fn enqueue(&self, item: T) {
        if self.queue.try_enqueue(item) {
            metrics::items_submitted().add(1, &[]);
            return;
        }

        metrics::items_dropped().add(1, &[KeyValue::new("reason", "queue_full")]);
        if let Some(capacity) = self.queue.capacity() {
            self.report(&Incident::QueueOverflow { capacity });
        }
    }

    fn report(&self, incident: &Incident) {
        (self.on_incident)(incident);
    }

    async fn on_tick(&self) {
        let next = self.run_cycle(&self.cancel, false).await;

        let _boundary = self.boundary.lock();
        if !self.unloading.load(Ordering::Acquire) {
            self.timer.start(next);
        }
    }

    /// One flush cycle. Returns the interval until the next one.
    ///
    /// Keeps flushing back-to-back while batches come out full and the sink
    /// keeps succeeding; a partial batch or a failure ends the cycle.
    async fn run_cycle(&self, cancel: &CancellationToken, during_shutdown: bool) -> Duration {
        let mut cycle = self.cycle.lock().await;
        let CycleState { staging, backoff } = &mut *cycle;

        loop {
            self.fill(staging);
            if staging.is_empty() {
                break;
            }

            let batch_size = staging.len();
            let span = start_flush_span(&self.id, batch_size, backoff.consecutive_failures());
            let started = Instant::now();
            let result = self
                .sink
                .flush(staging.as_slice(), cancel)
                .instrument(span.clone())
                .await;
            metrics::flush_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

            let succeeded = match result {
                Ok(()) => {
                    record_flush_result(&span, "ok");
                    metrics::batches_flushed().add(1, &[KeyValue::new("result", "ok")]);
                    staging.clear();
                    backoff.mark_success();
                    true
                }
                Err(e) => {
                    record_flush_result(&span, "error");
                    metrics::batches_flushed().add(1, &[KeyValue::new("result", "error")]);
                    backoff.mark_failure();
                    self.report(&Incident::FlushFailed {
                        error: e.to_string(),
                        batch_size,
                        consecutive_failures: backoff.consecutive_failures(),
                        retry_in: backoff.next_interval(),
                        during_shutdown,
                    });
                    false
                }
            };

            // Batch first, then backlog.
            if backoff.should_drop_batch() && !staging.is_empty() {
                let items = staging.len();
                staging.clear();
                metrics::items_dropped()
                    .add(items as u64, &[KeyValue::new("reason", "batch_dropped")]);
                self.report(&Incident::BatchDropped {
                    items,
                    consecutive_failures: backoff.consecutive_failures(),
                });
            }
            if backoff.should_drop_queue() {
                let items = self.queue.drain_discard();
                if items > 0 {
                    metrics::items_dropped()
                        .add(items as u64, &[KeyValue::new("reason", "queue_dropped")]);
                    self.report(&Incident::QueueDropped {
                        items,
                        consecutive_failures: backoff.consecutive_failures(),
                    });
                }
            }

            self.failures
                .store(backoff.consecutive_failures(), Ordering::Release);

            if !succeeded || batch_size < self.config.batch_size_limit {
                break;
            }
        }

        backoff.next_interval()
    }

    /// Top the staging batch up from the queue, discarding excluded items.
    fn fill(&self, staging: &mut Vec<T>) {
        let mut excluded = 0u64;
        while staging.len() < self.config.batch_size_limit {
            let Some(item) = self.queue.try_dequeue() else {
                break;
            };
            let keep = match &self.include {
                Some(include) => include(&item),
                None => true,
            };
            if keep {
                staging.push(item);
            } else {
                excluded += 1;
            }
        }
        if excluded > 0 {
            metrics::items_dropped().add(excluded, &[KeyValue::new("reason", "excluded")]);
        }
    }
}
