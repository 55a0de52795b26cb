//! Incidents: the only channel through which delivery trouble is visible.
//!
//! Producers never see failures or drops synchronously. Hosts that care
//! install an observer; the default one logs through `tracing`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Something the host may want to know about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incident {
    /// The sink returned an error. The batch is kept for the next attempt
    /// unless a drop follows.
    FlushFailed {
        error: String,
        batch_size: usize,
        consecutive_failures: u32,
        retry_in: Duration,
        /// The final flush during shutdown; it is not retried.
        during_shutdown: bool,
    },
    /// The staged batch was discarded after repeated failures.
    BatchDropped { items: usize, consecutive_failures: u32 },
    /// The backlog was discarded after repeated failures.
    QueueDropped { items: usize, consecutive_failures: u32 },
    /// An item was rejected because the queue was full.
    QueueOverflow { capacity: usize },
}

impl fmt::Display for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Incident::FlushFailed {
                error,
                batch_size,
                consecutive_failures,
                retry_in,
                during_shutdown: false,
            } => write!(
                f,
                "failed to flush {batch_size} item(s) ({consecutive_failures} consecutive failures), retrying in {retry_in:?}: {error}"
            ),
            Incident::FlushFailed {
                error,
                batch_size,
                during_shutdown: true,
                ..
            } => write!(f, "final flush of {batch_size} item(s) failed during shutdown: {error}"),
            Incident::BatchDropped {
                items,
                consecutive_failures,
            } => write!(
                f,
                "dropped batch of {items} item(s) after {consecutive_failures} consecutive failures"
            ),
            Incident::QueueDropped {
                items,
                consecutive_failures,
            } => write!(
                f,
                "dropped {items} queued item(s) after {consecutive_failures} consecutive failures"
            ),
            Incident::QueueOverflow { capacity } => {
                write!(f, "queue full at {capacity} item(s), dropping item")
            }
        }
    }
}

/// Callback receiving every incident. Must not block for long: it runs on
/// the flush cycle (and on producer threads for overflow).
pub type IncidentObserver = Arc<dyn Fn(&Incident) + Send + Sync>;

/// Default observer: structured `tracing` logs.
pub fn log_incident(incident: &Incident) {
    match incident {
        Incident::FlushFailed {
            error,
            batch_size,
            consecutive_failures,
            retry_in,
            during_shutdown,
        } => error!(
            error = %error,
            batch_size,
            consecutive_failures,
            retry_in_ms = retry_in.as_millis() as u64,
            during_shutdown,
            "flush failed"
        ),
        Incident::BatchDropped {
            items,
            consecutive_failures,
        } => warn!(items, consecutive_failures, "dropping staged batch"),
        Incident::QueueDropped {
            items,
            consecutive_failures,
        } => warn!(items, consecutive_failures, "dropping queued backlog"),
        Incident::QueueOverflow { capacity } => debug!(capacity, "queue full, item dropped"),
    }
}
