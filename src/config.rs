//! # Configuration Management
//!
//! This module provides configuration for the upload engine. Configuration is
//! read from a JSON file and overlaid with environment variables, with
//! defaults for every setting.
//!
//! ## Configuration Sources
//!
//! 1. **JSON file**: Primary configuration source (`Config::load`)
//! 2. **Environment**: `VAULT_*` overrides applied by `Config::apply_env`
//! 3. **Defaults**: Fallback values when no file exists
//!
//! ## Configuration Options
//!
//! - `broker_url`: Base URL of the storage broker
//! - `bucket`: Destination bucket for every operation
//! - `chunk_size`: Part size for multipart uploads (default: 5 MiB)
//! - `grant_ttl_secs`: Lifetime requested for signed URLs (default: 900s)
//! - `concurrency_limit`: Cap on in-flight batch items (default: unbounded)
//!
//! ## Example
//!
//! ```no_run
//! use media_vault_uploads::config::Config;
//!
//! let mut config = Config::load("vault.json").unwrap();
//! config.apply_env();
//! config.validate().unwrap();
//! println!("Chunk size: {} bytes", config.chunk_size);
//! ```

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::constants::{
    CHUNK_SIZE, DEFAULT_BROKER_URL, DEFAULT_BUCKET, DEFAULT_EXPIRY_MARGIN_SECS,
    DEFAULT_GRANT_TTL_SECS, DEFAULT_PART_CONCURRENCY, DEFAULT_REQUEST_TIMEOUT_SECS,
    ENV_BROKER_URL, ENV_BUCKET, ENV_CHUNK_SIZE, ENV_CONCURRENCY_LIMIT, MAX_GRANT_TTL_SECS,
    MAX_PART_SIZE, MIN_PART_SIZE,
};
use crate::errors::{AppError, AppResult};
use crate::retry::RetryPolicy;

/// Configuration structure for the upload engine.
///
/// All fields are public so callers can adjust a loaded configuration before
/// handing it to the coordinator or the orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the storage broker exposing `/put`, `/get`, `/delete`,
    /// `/search`, `/s3-batch` and `/s3-multipart`.
    pub broker_url: String,

    /// Bucket every operation targets.
    pub bucket: String,

    /// Base URL for public object links, used when the backend's completion
    /// response carries no location.
    pub public_base_url: Option<String>,

    /// Size of each multipart part in bytes. Every part but the last has
    /// exactly this size.
    pub chunk_size: u64,

    /// Lifetime requested for per-operation grants.
    pub grant_ttl_secs: u64,

    /// Upper bound for any single network call.
    pub request_timeout_secs: u64,

    /// Grants with less than this lifetime left are treated as expired.
    pub expiry_margin_secs: u64,

    /// Maximum in-flight batch items. `None` fans out one future per item.
    pub concurrency_limit: Option<usize>,

    /// Parts transferred concurrently for a single object.
    pub part_concurrency: usize,

    /// Backoff policy for transient failures.
    pub retry: RetryPolicy,

    /// Whether the broker signs a whole batch in one round-trip.
    pub supports_batch_signing: bool,

    /// Whether the broker deletes a whole batch natively.
    pub supports_native_batch_delete: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            public_base_url: None,
            chunk_size: CHUNK_SIZE,
            grant_ttl_secs: DEFAULT_GRANT_TTL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            expiry_margin_secs: DEFAULT_EXPIRY_MARGIN_SECS,
            concurrency_limit: None,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            retry: RetryPolicy::default(),
            supports_batch_signing: true,
            supports_native_batch_delete: true,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file with fallback to defaults.
    ///
    /// # Arguments
    ///
    /// * `path` - Location of the JSON configuration file
    ///
    /// # Error Handling
    ///
    /// - A missing file yields `Config::default()`
    /// - Unreadable files and invalid JSON are propagated
    /// - Fields absent from the file keep their default values
    ///
    /// # Configuration Format
    ///
    /// ```json
    /// {
    ///   "broker_url": "https://media.example.com/api",
    ///   "bucket": "media",
    ///   "chunk_size": 5242880,
    ///   "concurrency_limit": 8
    /// }
    /// ```
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let config = Self::from_json(&raw)?;
                tracing::info!(path = %path.display(), "configuration loaded from file");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn from_json(raw: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Overlays `VAULT_*` environment variables. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_BROKER_URL) {
            self.broker_url = url;
        }
        if let Some(bucket) = lookup(ENV_BUCKET) {
            self.bucket = bucket;
        }
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            match raw.parse() {
                Ok(size) => self.chunk_size = size,
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_CHUNK_SIZE),
            }
        }
        if let Some(raw) = lookup(ENV_CONCURRENCY_LIMIT) {
            match raw.parse::<usize>() {
                Ok(0) => self.concurrency_limit = None,
                Ok(limit) => self.concurrency_limit = Some(limit),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {}", ENV_CONCURRENCY_LIMIT),
            }
        }
    }

    /// Rejects settings the engine cannot operate with.
    pub fn validate(&self) -> AppResult<()> {
        url::Url::parse(&self.broker_url)
            .map_err(|e| AppError::Config(format!("broker_url '{}': {}", self.broker_url, e)))?;
        if self.bucket.trim().is_empty() {
            return Err(AppError::Config("bucket must not be empty".into()));
        }
        if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&self.chunk_size) {
            return Err(AppError::Config(format!(
                "chunk_size {} outside [{}, {}]",
                self.chunk_size, MIN_PART_SIZE, MAX_PART_SIZE
            )));
        }
        if self.grant_ttl_secs == 0 || self.grant_ttl_secs > MAX_GRANT_TTL_SECS {
            return Err(AppError::Config(format!(
                "grant_ttl_secs must be in 1..={}",
                MAX_GRANT_TTL_SECS
            )));
        }
        if self.expiry_margin_secs >= self.grant_ttl_secs {
            return Err(AppError::Config(
                "expiry_margin_secs must be shorter than grant_ttl_secs".into(),
            ));
        }
        if self.part_concurrency == 0 || self.concurrency_limit == Some(0) {
            return Err(AppError::Config("concurrency limits must be positive".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn expiry_margin(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.expiry_margin_secs as i64)
    }
}
