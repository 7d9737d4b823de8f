//! Node-level metrics on the default Prometheus registry.

use prometheus::{
    register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram, TextEncoder,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub struct Metrics {
    /// Connected peer count as reported by the transport.
    pub connected_peers: Gauge,
    /// Inbound peer messages shed because a mailbox was full.
    pub messages_dropped: Counter,
    /// Decided QBFT instances.
    pub instances_decided: Counter,
    /// Highest observed consensus round across running instances.
    pub qbft_round: Gauge,
    /// Beacon request latency.
    pub beacon_request_latency: Histogram,
}

impl Metrics {
    fn new() -> Self {
        Metrics {
            connected_peers: register_gauge!("dv_connected_peers", "Connected peer count")
                .expect("metric registers"),
            messages_dropped: register_counter!(
                "dv_messages_dropped_total",
                "Peer messages dropped due to backpressure"
            )
            .expect("metric registers"),
            instances_decided: register_counter!(
                "dv_instances_decided_total",
                "Decided consensus instances"
            )
            .expect("metric registers"),
            qbft_round: register_gauge!("dv_qbft_round", "Current consensus round")
                .expect("metric registers"),
            beacon_request_latency: register_histogram!(
                "dv_beacon_request_seconds",
                "Beacon request latency",
                vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
            )
            .expect("metric registers"),
        }
    }
}

pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Gather the default registry in Prometheus text format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
