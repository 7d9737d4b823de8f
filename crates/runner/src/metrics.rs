//! Duty-phase metrics.
//!
//! Domain-specific histograms registered on the default Prometheus registry;
//! the node's metrics endpoint exports them.

use prometheus::{register_histogram_vec, HistogramVec};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub(crate) struct Metrics {
    /// Duty start to consensus decision, per role.
    pub consensus_duration: HistogramVec,
    /// Decision to post-consensus quorum, per role.
    pub post_consensus_duration: HistogramVec,
    /// Beacon submission latency, per role.
    pub submission_duration: HistogramVec,
}

impl Metrics {
    fn new() -> Self {
        let buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 4.0, 8.0, 12.0];
        Metrics {
            consensus_duration: register_histogram_vec!(
                "dv_duty_consensus_seconds",
                "Time from duty start to consensus decision",
                &["role"],
                buckets.clone()
            )
            .expect("metric registers"),
            post_consensus_duration: register_histogram_vec!(
                "dv_duty_post_consensus_seconds",
                "Time from decision to post-consensus quorum",
                &["role"],
                buckets.clone()
            )
            .expect("metric registers"),
            submission_duration: register_histogram_vec!(
                "dv_duty_submission_seconds",
                "Beacon submission latency",
                &["role"],
                buckets
            )
            .expect("metric registers"),
        }
    }
}

pub(crate) fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
