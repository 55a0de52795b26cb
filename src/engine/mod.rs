//! Batching delivery engine: submission, flush cycle, shutdown.

pub mod batch;
pub mod incident;
pub mod shared;
pub mod sink;

pub use batch::{BatchEngine, BatchEngineBuilder, EngineStatus};
pub use incident::{Incident, IncidentObserver, log_incident};
pub use shared::SharedEngine;
pub use sink::{BatchSink, FnSink, sink_fn};
pub use tokio_util::sync::CancellationToken;
