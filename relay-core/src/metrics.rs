//! Prometheus metrics for the delivery core, registered once into a global
//! registry. Exposing the registry over HTTP (or anywhere else) is the
//! embedder's concern; [encode_text] renders the current state in the
//! text exposition format.

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

const SINK_REGISTRY_PREFIX: &str = "sink";

pub(crate) const SINK_NAME_LABEL: &str = "sink";

// counters (the _total suffix is appended by the client library)
const SENT: &str = "sent";
const BATCH_SENT: &str = "batch_sent";
const WRITE_ERROR: &str = "error";
const CONNECTION_UP: &str = "connection_up";
const CONNECTION_FAILED: &str = "connection_failed";
const CONNECTION_LOST: &str = "connection_lost";

// write latency histogram, in microseconds
const WRITE_LATENCY: &str = "latency";

/// The global register of all metrics.
#[derive(Default)]
struct GlobalRegistry {
    // It is okay to block here because each metric is registered only once.
    registry: parking_lot::Mutex<Registry>,
}

static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(GlobalRegistry::default)
}

/// Renders every registered metric in the Prometheus text exposition format.
pub fn encode_text() -> String {
    let mut buffer = String::new();
    let registry = global_registry().registry.lock();
    let _ = encode(&mut buffer, &registry);
    buffer
}

type LabelSet = Vec<(String, String)>;

/// Metrics emitted by the async sink driver, labelled by sink type name.
pub(crate) struct SinkMetrics {
    pub(crate) sent: Family<LabelSet, Counter>,
    pub(crate) batch_sent: Family<LabelSet, Counter>,
    pub(crate) write_error: Family<LabelSet, Counter>,
    pub(crate) write_latency: Family<LabelSet, Histogram>,
    pub(crate) connection_up: Family<LabelSet, Counter>,
    pub(crate) connection_failed: Family<LabelSet, Counter>,
    pub(crate) connection_lost: Family<LabelSet, Counter>,
}

impl SinkMetrics {
    fn new() -> Self {
        Self {
            sent: Family::default(),
            batch_sent: Family::default(),
            write_error: Family::default(),
            write_latency: Family::new_with_constructor(|| {
                Histogram::new(exponential_buckets(100.0, 4.0, 10))
            }),
            connection_up: Family::default(),
            connection_failed: Family::default(),
            connection_lost: Family::default(),
        }
    }
}

static SINK_METRICS: OnceLock<SinkMetrics> = OnceLock::new();

pub(crate) fn sink_metrics() -> &'static SinkMetrics {
    SINK_METRICS.get_or_init(|| {
        let metrics = SinkMetrics::new();
        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(SINK_REGISTRY_PREFIX);
        registry.register(
            SENT,
            "Total number of messages written to the sink",
            metrics.sent.clone(),
        );
        registry.register(
            BATCH_SENT,
            "Total number of batches written to the sink",
            metrics.batch_sent.clone(),
        );
        registry.register(
            WRITE_ERROR,
            "Total number of write failures",
            metrics.write_error.clone(),
        );
        registry.register(
            WRITE_LATENCY,
            "Write latency in microseconds",
            metrics.write_latency.clone(),
        );
        registry.register(
            CONNECTION_UP,
            "Total number of connections established",
            metrics.connection_up.clone(),
        );
        registry.register(
            CONNECTION_FAILED,
            "Total number of connection attempts that failed",
            metrics.connection_failed.clone(),
        );
        registry.register(
            CONNECTION_LOST,
            "Total number of times an established connection was lost",
            metrics.connection_lost.clone(),
        );
        metrics
    })
}

pub(crate) fn sink_labels(name: &str) -> LabelSet {
    vec![(SINK_NAME_LABEL.to_string(), name.to_string())]
}
