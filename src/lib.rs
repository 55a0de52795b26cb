//! # batchq
//!
//! Reliable batching and delivery engine.
//!
//! Producers submit items one at a time; the engine flushes them to a sink in
//! bounded batches on a timer, backs off exponentially while the sink fails,
//! and sheds load (the staged batch, then the backlog) instead of growing
//! without bound. Also provides per-item retry scheduling (nearest-key delay
//! tables and outcome transition validation) for at-least-once dispatchers.

pub mod backoff;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod queue;
pub mod retry;
pub mod telemetry;
pub mod timer;
