//! # Structured Logging
//!
//! Operation-scoped log records on top of `tracing`.
//!
//! ## Records
//!
//! A [`Logger`] stamps every record with its `request_id` and an optional
//! JSON `data` payload built with [`log_data!`](crate::log_data).
//!
//! ## Subscriber
//!
//! [`init_tracing`] installs a compact or JSON formatter filtered by
//! `RUST_LOG`, defaulting to `info`.

use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::utils::generate_request_id;

/// Operation-scoped structured logger.
///
/// Every record carries the logger's `request_id` so the lines produced by one
/// upload or batch run can be correlated. Callers must never pass credentials
/// or signed URLs in `data`.
#[derive(Clone, Debug)]
pub struct Logger {
    request_id: String,
}

impl Logger {
    /// Create a new Logger instance
    ///
    /// # Arguments
    ///
    /// * `request_id` - A unique identifier for the current operation
    pub fn new(request_id: String) -> Self {
        Self { request_id }
    }

    /// Create a Logger with a freshly generated request id
    pub fn generate() -> Self {
        Self::new(generate_request_id())
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Log an info message
    ///
    /// # Arguments
    ///
    /// * `message` - The log message
    /// * `data` - Optional additional data to include in the log
    pub fn info(&self, message: &str, data: Option<Value>) {
        let data = render(data);
        tracing::info!(request_id = %self.request_id, data = %data, "{}", message);
    }

    /// Log a warning message
    pub fn warn(&self, message: &str, data: Option<Value>) {
        let data = render(data);
        tracing::warn!(request_id = %self.request_id, data = %data, "{}", message);
    }

    /// Log an error message
    pub fn error(&self, message: &str, data: Option<Value>) {
        let data = render(data);
        tracing::error!(request_id = %self.request_id, data = %data, "{}", message);
    }

    pub fn debug(&self, message: &str, data: Option<Value>) {
        let data = render(data);
        tracing::debug!(request_id = %self.request_id, data = %data, "{}", message);
    }
}

fn render(data: Option<Value>) -> String {
    data.map(|v| v.to_string()).unwrap_or_default()
}

/// `RUST_LOG` controls the level; INFO otherwise.
pub fn get_env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::default()
            .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
    })
}

/// Installs the global subscriber, JSON lines when `structured` is set.
pub fn init_tracing(structured: bool) {
    let layer = if structured {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_filter(get_env_filter())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .compact()
            .with_filter(get_env_filter())
            .boxed()
    };
    let subscriber = tracing_subscriber::registry().with(layer);
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("logger was already initiated, continuing: {:?}", e);
    }
}

/// Macro to create a JSON object for additional log data
///
/// Usage: `log_data!("key1" => "value1", "key2" => 42)`
#[macro_export]
macro_rules! log_data {
    ($($key:expr => $value:expr),* $(,)?) => {
        Some(serde_json::json!({ $($key: $value),* }))
    };
}
