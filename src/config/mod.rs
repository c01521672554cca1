//! Typed configuration from TOML files and environment variables.
//!
//! Engine tunables default to the values the engine was designed around
//! (100-slot delivery buffers, a 16-slot creation feed, a one second expiry
//! sweep). A TOML file named by `QUEUEHUB_CONFIG` replaces the defaults and
//! `QUEUEHUB_*` variables override individual fields.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tunables for an [`Engine`](crate::engine::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Delivery buffer slots per queue.
    pub queue_capacity: usize,
    /// Slots in the queue-creation notification buffer.
    pub notification_capacity: usize,
    /// How often idle queues are swept.
    pub sweep_interval_ms: u64,
    /// Items a queue may hold back while its delivery buffer is full.
    pub backlog_capacity: usize,
    /// Expiration applied to newly created queues. 0 = never.
    pub default_expiration_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            notification_capacity: 16,
            sweep_interval_ms: 1_000,
            backlog_capacity: 10_000,
            default_expiration_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| Error::Config(format!("invalid engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Defaults overlaid with `QUEUEHUB_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlay any `QUEUEHUB_*` environment variables onto `self`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = parsed_var("QUEUEHUB_QUEUE_CAPACITY")? {
            self.queue_capacity = v;
        }
        if let Some(v) = parsed_var("QUEUEHUB_NOTIFICATION_CAPACITY")? {
            self.notification_capacity = v;
        }
        if let Some(v) = parsed_var("QUEUEHUB_SWEEP_INTERVAL_MS")? {
            self.sweep_interval_ms = v;
        }
        if let Some(v) = parsed_var("QUEUEHUB_BACKLOG_CAPACITY")? {
            self.backlog_capacity = v;
        }
        if let Some(v) = parsed_var("QUEUEHUB_DEFAULT_EXPIRATION_MS")? {
            self.default_expiration_ms = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("queue_capacity", self.queue_capacity == 0),
            ("notification_capacity", self.notification_capacity == 0),
            ("sweep_interval_ms", self.sweep_interval_ms == 0),
            ("backlog_capacity", self.backlog_capacity == 0),
        ];
        match zero.iter().find(|(_, is_zero)| *is_zero) {
            Some((field, _)) => Err(Error::Config(format!("{field} must be greater than zero"))),
            None => Ok(()),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn default_expiration(&self) -> Duration {
        Duration::from_millis(self.default_expiration_ms)
    }
}

/// Process-level configuration for the `queuehub` binary.
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
        let engine = match std::env::var("QUEUEHUB_CONFIG") {
            Ok(path) => EngineConfig::load(path)?,
            Err(_) => EngineConfig::default(),
        };
        Ok(Self {
            engine: engine.with_env_overrides()?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{name}={raw:?} is not valid: {e}"))),
        Err(_) => Ok(None),
    }
}
