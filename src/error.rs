//! Error types for batchq.

use thiserror::Error;

use crate::model::ItemState;

/// Error type returned by sinks. The engine never inspects it beyond logging.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("invalid state transition: {from} -> {to}: {reason}")]
    InvalidTransition {
        from: ItemState,
        to: ItemState,
        reason: String,
    },

    #[error("concurrency token must change on {0}")]
    StaleToken(ItemState),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
