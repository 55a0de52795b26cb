//! Retry scheduling for individually processed work items.
//!
//! Two side-effect-free building blocks for at-least-once dispatchers:
//! a nearest-key lookup from retry count to delay, and validation of
//! outcome transitions on a [`RetryRecord`].

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{ItemState, RetryRecord};

// ---------------------------------------------------------------------------
// Delay table
// ---------------------------------------------------------------------------

/// Sparse mapping from retry count to delay, queried by nearest key.
///
/// `{0: 1s, 3: 30s, 10: 5m}` defines three tiers without an entry per retry
/// count. Negative keys are accepted but never match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, u64>")]
pub struct DelayTable(BTreeMap<i64, Duration>);

impl DelayTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, retry_count: i64, delay: Duration) -> Option<Duration> {
        self.0.insert(retry_count, delay)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, Duration)> + '_ {
        self.0.iter().map(|(&key, &delay)| (key, delay))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(i64, Duration)> for DelayTable {
    fn from_iter<I: IntoIterator<Item = (i64, Duration)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Keys are retry counts, values are milliseconds (TOML/JSON map keys are
/// always strings).
impl TryFrom<BTreeMap<String, u64>> for DelayTable {
    type Error = Error;

    fn try_from(raw: BTreeMap<String, u64>) -> Result<Self> {
        raw.into_iter()
            .map(|(key, ms)| Ok((parse_retry_count(&key)?, Duration::from_millis(ms))))
            .collect()
    }
}

/// Parses `"0=1000,3=30000"` (retry count = milliseconds).
impl std::str::FromStr for DelayTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (key, ms) = entry.split_once('=').ok_or_else(|| {
                    Error::Config(format!("delay entry '{entry}' must look like count=ms"))
                })?;
                let ms: u64 = ms.trim().parse().map_err(|e| {
                    Error::Config(format!("bad delay in '{entry}': {e}"))
                })?;
                Ok((parse_retry_count(key)?, Duration::from_millis(ms)))
            })
            .collect()
    }
}

fn parse_retry_count(key: &str) -> Result<i64> {
    key.trim()
        .parse()
        .map_err(|e| Error::Config(format!("bad retry count '{key}': {e}")))
}

/// Delay before the next retry of an item that has failed
/// `current_retry_count` times.
///
/// Picks the entry whose key is closest to `current_retry_count`; on equal
/// distance the smaller delay wins. Falls back to `default_delay` when there
/// is no table or no usable entry.
pub fn find_delay(
    current_retry_count: u32,
    table: Option<&DelayTable>,
    default_delay: Duration,
) -> Duration {
    let Some(table) = table else {
        return default_delay;
    };

    let current = i64::from(current_retry_count);
    let mut best: Option<(u64, Duration)> = None;
    for (key, delay) in table.iter().filter(|(key, _)| *key >= 0) {
        let distance = key.abs_diff(current);
        best = match best {
            Some((best_distance, best_delay))
                if best_distance < distance
                    || (best_distance == distance && best_delay <= delay) =>
            {
                Some((best_distance, best_delay))
            }
            _ => Some((distance, delay)),
        };
    }

    best.map_or(default_delay, |(_, delay)| delay)
}

// ---------------------------------------------------------------------------
// Transition validation
// ---------------------------------------------------------------------------

/// Check that `current` may be replaced by a record in state `to` with the
/// given retry count and delay.
///
/// Outcomes are only legal from `InProcess` or `Error`:
/// - `Consumed`: retry count and delay unchanged.
/// - `Error`: retry count is exactly `current + 1` and the delay moves
///   strictly forward (or is set for the first time).
/// - `Suspended`: retry count is exactly `current + 1`.
/// - `Corrupted`: no field constraints.
///
/// `InProcess` is reachable from `Pending` and `Error` with unchanged fields.
pub fn validate_transition(
    current: &RetryRecord,
    to: ItemState,
    new_retry_count: u32,
    new_delayed_to: Option<DateTime<Utc>>,
) -> Result<()> {
    let from = current.state;
    let invalid = |reason: String| Error::InvalidTransition { from, to, reason };

    if !from.can_transition_to(to) {
        return Err(invalid(format!("{to} is not reachable from {from}")));
    }

    let unchanged = || {
        if new_retry_count != current.retry_count {
            return Err(invalid(format!(
                "retry count must stay {}, got {new_retry_count}",
                current.retry_count
            )));
        }
        if new_delayed_to != current.delayed_to {
            return Err(invalid("delay must not change".to_string()));
        }
        Ok(())
    };

    let incremented = || match current.retry_count.checked_add(1) {
        Some(expected) if expected == new_retry_count => Ok(()),
        _ => Err(invalid(format!(
            "retry count must be {} + 1, got {new_retry_count}",
            current.retry_count
        ))),
    };

    match to {
        ItemState::InProcess | ItemState::Consumed => unchanged(),
        ItemState::Error => {
            incremented()?;
            match (current.delayed_to, new_delayed_to) {
                (_, None) => Err(invalid("an error outcome must set a delay".to_string())),
                (Some(old), Some(new)) if new <= old => Err(invalid(format!(
                    "delay must move forward from {old}, got {new}"
                ))),
                _ => Ok(()),
            }
        }
        ItemState::Suspended => incremented(),
        ItemState::Corrupted => Ok(()),
        ItemState::Pending => Err(invalid("items never return to pending".to_string())),
    }
}
