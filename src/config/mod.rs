//! Typed configuration from environment variables and TOML files.
//!
//! Loads once at startup, fails fast on malformed values. Every setting has
//! a default, so an empty environment is a valid configuration.

mod engine;

pub use engine::{EngineConfig, FileConfig, RetryConfig};

use crate::error::{Error, Result};
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            engine: EngineConfig::from_env()?,
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional_var(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e| {
                Error::Config(format!("environment variable {name}={raw} is invalid: {e}"))
            })
        })
        .transpose()
}
