//! Batch engine parameters and their validation.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::backoff::{DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF};
use crate::error::{Error, Result};
use crate::queue::QueueLimit;
use crate::retry::DelayTable;

use super::{optional_var, parse_var};

/// Tunables for a [`BatchEngine`](crate::engine::BatchEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum items per flush call.
    pub batch_size_limit: usize,
    /// Nominal interval between flushes.
    pub period: Duration,
    /// Backoff floor once the sink fails repeatedly.
    pub min_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    pub queue_limit: QueueLimit,
    /// Flush right after the first submitted item so a broken sink shows up
    /// immediately instead of one period later.
    pub eagerly_emit_first_item: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_limit: 50,
            period: Duration::from_secs(2),
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            queue_limit: QueueLimit::Unbounded,
            eagerly_emit_first_item: false,
        }
    }
}

impl EngineConfig {
    /// Reject out-of-range values. Called by the engine constructor.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_limit == 0 {
            return Err(Error::Config("batch_size_limit must be greater than 0".to_string()));
        }
        if self.period.is_zero() {
            return Err(Error::Config("period must be greater than 0".to_string()));
        }
        if self.min_backoff.is_zero() {
            return Err(Error::Config("min_backoff must be greater than 0".to_string()));
        }
        if self.max_backoff.is_zero() {
            return Err(Error::Config("max_backoff must be greater than 0".to_string()));
        }
        if self.queue_limit == QueueLimit::Bounded(0) {
            return Err(Error::Config("queue_limit must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Overlay `BATCHQ_*` environment variables on the defaults.
    ///
    /// Unset variables keep their default; malformed ones fail fast.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            batch_size_limit: parse_var("BATCHQ_BATCH_SIZE")?.unwrap_or(defaults.batch_size_limit),
            period: millis_var("BATCHQ_PERIOD_MS")?.unwrap_or(defaults.period),
            min_backoff: millis_var("BATCHQ_MIN_BACKOFF_MS")?.unwrap_or(defaults.min_backoff),
            max_backoff: millis_var("BATCHQ_MAX_BACKOFF_MS")?.unwrap_or(defaults.max_backoff),
            queue_limit: match optional_var("BATCHQ_QUEUE_LIMIT").as_deref() {
                None | Some("unbounded") => QueueLimit::Unbounded,
                Some(_) => QueueLimit::from_option(parse_var("BATCHQ_QUEUE_LIMIT")?),
            },
            eagerly_emit_first_item: parse_var("BATCHQ_EAGER_FIRST_ITEM")?
                .unwrap_or(defaults.eagerly_emit_first_item),
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse the engine keys of a TOML document (durations in milliseconds).
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(FileConfig::from_toml_str(s)?.engine)
    }
}

fn millis_var(name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_millis))
}

// ---------------------------------------------------------------------------
// Retry settings
// ---------------------------------------------------------------------------

/// Delay lookup settings for per-item retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub table: Option<DelayTable>,
    pub default_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            table: None,
            default_delay: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// TOML file
// ---------------------------------------------------------------------------

/// Everything a batchq TOML file can hold.
///
/// ```toml
/// batch_size_limit = 100
/// period_ms = 2000
/// queue_limit = 10000
///
/// [retry]
/// default_delay_ms = 5000
/// delays_ms = { "0" = 1000, "3" = 30000, "10" = 300000 }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub engine: EngineConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFileConfig {
    batch_size_limit: Option<usize>,
    period_ms: Option<u64>,
    min_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    queue_limit: Option<usize>,
    eagerly_emit_first_item: Option<bool>,
    #[serde(default)]
    retry: Option<RawRetryConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetryConfig {
    default_delay_ms: Option<u64>,
    delays_ms: Option<DelayTable>,
}

impl FileConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let raw: RawFileConfig = toml::from_str(s)?;
        let defaults = EngineConfig::default();

        let engine = EngineConfig {
            batch_size_limit: raw.batch_size_limit.unwrap_or(defaults.batch_size_limit),
            period: raw.period_ms.map_or(defaults.period, Duration::from_millis),
            min_backoff: raw.min_backoff_ms.map_or(defaults.min_backoff, Duration::from_millis),
            max_backoff: raw.max_backoff_ms.map_or(defaults.max_backoff, Duration::from_millis),
            queue_limit: QueueLimit::from_option(raw.queue_limit),
            eagerly_emit_first_item: raw
                .eagerly_emit_first_item
                .unwrap_or(defaults.eagerly_emit_first_item),
        };
        engine.validate()?;

        let retry = match raw.retry {
            Some(r) => RetryConfig {
                table: r.delays_ms,
                default_delay: r
                    .default_delay_ms
                    .map_or(RetryConfig::default().default_delay, Duration::from_millis),
            },
            None => RetryConfig::default(),
        };

        Ok(Self { engine, retry })
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
