//! Configuration for the delivery core. Loading and schema documentation are
//! the caller's concern; these structs only carry the knobs with their
//! defaults.

use std::time::Duration;

use serde::Deserialize;

use backoff::Exponential;

const DEFAULT_MAX_INFLIGHT: usize = 1;
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const DEFAULT_CONN_BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const DEFAULT_CONN_BACKOFF_MAX: Duration = Duration::from_secs(1);
const DEFAULT_RETRY_BACKOFF_INITIAL: Duration = Duration::from_micros(500);
const DEFAULT_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_CONN_BACKOFF_INITIAL,
            max_interval: DEFAULT_CONN_BACKOFF_MAX,
            factor: DEFAULT_BACKOFF_FACTOR,
            jitter: 0.0,
        }
    }
}

impl BackoffConfig {
    pub(crate) fn strategy(&self) -> Exponential {
        Exponential::new(
            self.initial_interval,
            self.max_interval,
            self.factor,
            self.jitter,
            None,
        )
    }
}

/// Configuration for the pooled async sink driver.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkWriterConfig {
    /// Sink type name used in logs and metric labels. The special name
    /// `reject` demotes write failures to debug logging.
    pub name: String,
    /// Number of parallel writer workers. Writes across workers are not
    /// ordered.
    pub max_inflight: usize,
    /// Skip deriving a cancellable context per write. Reserved for
    /// exceptionally fast sinks; shutdown then waits for the write to finish
    /// on its own.
    pub no_cancel: bool,
    /// How long the wrapped sink gets to close once the workers have exited.
    pub shutdown_grace: Duration,
    /// Backoff applied while (re)connecting to the sink.
    pub connection_backoff: BackoffConfig,
}

impl Default for SinkWriterConfig {
    fn default() -> Self {
        Self {
            name: "sink".to_string(),
            max_inflight: DEFAULT_MAX_INFLIGHT,
            no_cancel: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            connection_backoff: BackoffConfig::default(),
        }
    }
}

impl SinkWriterConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Configuration for the auto-retry nack buffer at the source boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryBufferConfig {
    /// Backoff applied before re-serving a nacked message, to keep a sink
    /// that rejects everything from spinning the read loop hot.
    pub retry_backoff: BackoffConfig,
}

impl Default for RetryBufferConfig {
    fn default() -> Self {
        Self {
            retry_backoff: BackoffConfig {
                initial_interval: DEFAULT_RETRY_BACKOFF_INITIAL,
                max_interval: DEFAULT_RETRY_BACKOFF_MAX,
                factor: DEFAULT_BACKOFF_FACTOR,
                jitter: 0.0,
            },
        }
    }
}
