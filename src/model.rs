//! Per-item retry bookkeeping.
//!
//! A retry record tracks one work item through at-least-once processing:
//! how often it has failed, when it may next be picked up, and where it is
//! in its lifecycle. Records are owned by the caller's storage layer; this
//! module only decides which updates are legal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::retry::{DelayTable, find_delay, validate_transition};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item under retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Created, not yet picked up.
    Pending,
    /// A consumer is working on it.
    InProcess,
    /// Done. Terminal.
    Consumed,
    /// Failed, will be retried after `delayed_to`.
    Error,
    /// Parked by the consumer; not re-dispatched automatically.
    Suspended,
    /// Unprocessable payload. Terminal.
    Corrupted,
}

impl ItemState {
    /// Can an item move from `self` to `to`? Field constraints are checked
    /// separately by [`validate_transition`].
    pub fn can_transition_to(self, to: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, to),
            (Pending, InProcess)
                | (Error, InProcess) // re-dispatch
                | (InProcess | Error, Consumed | Error | Suspended | Corrupted)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemState::Consumed | ItemState::Corrupted)
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemState::Pending => "pending",
            ItemState::InProcess => "in_process",
            ItemState::Consumed => "consumed",
            ItemState::Error => "error",
            ItemState::Suspended => "suspended",
            ItemState::Corrupted => "corrupted",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ItemState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ItemState::Pending),
            "in_process" => Ok(ItemState::InProcess),
            "consumed" => Ok(ItemState::Consumed),
            "error" => Ok(ItemState::Error),
            "suspended" => Ok(ItemState::Suspended),
            "corrupted" => Ok(ItemState::Corrupted),
            other => Err(Error::Config(format!("unknown item state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Concurrency token
// ---------------------------------------------------------------------------

/// Opaque version stamp from the caller's storage layer, used to detect lost
/// updates. Never interpreted here beyond equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyToken(pub String);

impl ConcurrencyToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConcurrencyToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConcurrencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Retry record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub retry_count: u32,
    /// Earliest time the item may be picked up again.
    pub delayed_to: Option<DateTime<Utc>>,
    pub state: ItemState,
    pub token: ConcurrencyToken,
}

impl RetryRecord {
    /// A fresh record in `Pending`.
    pub fn new(token: ConcurrencyToken) -> Self {
        Self {
            retry_count: 0,
            delayed_to: None,
            state: ItemState::Pending,
            token,
        }
    }

    /// `Pending`/`Error` -> `InProcess`.
    pub fn begin_processing(&self) -> Result<RetryRecord> {
        self.commit(ItemState::InProcess, self.retry_count, self.delayed_to, self.token.clone())
    }

    /// Mark consumed. Retry count, delay and token pass through unchanged.
    pub fn consume(&self) -> Result<RetryRecord> {
        self.commit(ItemState::Consumed, self.retry_count, self.delayed_to, self.token.clone())
    }

    /// Record a failed attempt: bump the retry count and delay the item by
    /// the nearest-key delay for its current retry count.
    pub fn fail(
        &self,
        now: DateTime<Utc>,
        table: Option<&DelayTable>,
        default_delay: Duration,
        new_token: ConcurrencyToken,
    ) -> Result<RetryRecord> {
        self.require_new_token(ItemState::Error, &new_token)?;
        let delay = find_delay(self.retry_count, table, default_delay);
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| Error::Config(format!("retry delay out of range: {e}")))?;
        let out_of_range = || Error::Config(format!("retry delay {delay} from {now} is out of range"));
        let mut delayed_to = now.checked_add_signed(delay).ok_or_else(out_of_range)?;
        // Delays must move strictly forward even if the clock did not.
        if let Some(current) = self.delayed_to {
            if delayed_to <= current {
                delayed_to = current
                    .checked_add_signed(chrono::Duration::milliseconds(1))
                    .ok_or_else(out_of_range)?;
            }
        }
        self.commit(
            ItemState::Error,
            self.retry_count.saturating_add(1),
            Some(delayed_to),
            new_token,
        )
    }

    /// Park the item. Counts as an attempt; the delay is left as is.
    pub fn suspend(&self, new_token: ConcurrencyToken) -> Result<RetryRecord> {
        self.require_new_token(ItemState::Suspended, &new_token)?;
        self.commit(
            ItemState::Suspended,
            self.retry_count.saturating_add(1),
            self.delayed_to,
            new_token,
        )
    }

    /// Mark the payload unprocessable.
    pub fn corrupt(&self) -> Result<RetryRecord> {
        self.commit(ItemState::Corrupted, self.retry_count, self.delayed_to, self.token.clone())
    }

    fn require_new_token(&self, to: ItemState, new_token: &ConcurrencyToken) -> Result<()> {
        if *new_token == self.token {
            return Err(Error::StaleToken(to));
        }
        Ok(())
    }

    fn commit(
        &self,
        to: ItemState,
        retry_count: u32,
        delayed_to: Option<DateTime<Utc>>,
        token: ConcurrencyToken,
    ) -> Result<RetryRecord> {
        validate_transition(self, to, retry_count, delayed_to)?;
        Ok(RetryRecord {
            retry_count,
            delayed_to,
            state: to,
            token,
        })
    }
}
