//! Node HTTP surface.
//!
//! `GET /v1/node/identity`, `/v1/node/peers`, `/v1/node/topics`,
//! `/v1/node/health`, plus `/metrics` in Prometheus text format.

use crate::metrics;
use crate::prober::Prober;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use dv_types::Network;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Static identity the node reports.
#[derive(Debug, Clone, Serialize)]
pub struct Identity {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub version: String,
}

pub struct ApiState {
    pub identity: Identity,
    pub network: Arc<dyn Network>,
    pub prober: Prober,
}

/// Peer threshold below which the node reports itself unhealthy.
const MIN_HEALTHY_PEERS: usize = 5;

#[derive(Debug, Serialize)]
struct PeersJson {
    peers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct TopicsJson {
    all_peers: Vec<String>,
    peers_by_topic: HashMap<String, Vec<String>>,
}

#[derive(Debug, Serialize)]
struct HealthJson {
    healthy: bool,
    peers_status: String,
    beacon_health_status: String,
    execution_health_status: String,
    event_sync_health_status: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/node/identity", get(identity))
        .route("/v1/node/peers", get(peers))
        .route("/v1/node/topics", get(topics))
        .route("/v1/node/health", get(health))
        .route("/metrics", get(|| async { metrics::gather() }))
        .with_state(state)
}

async fn identity(State(state): State<Arc<ApiState>>) -> Json<Identity> {
    Json(state.identity.clone())
}

async fn peers(State(state): State<Arc<ApiState>>) -> Json<PeersJson> {
    Json(PeersJson {
        peers: state.network.peers(),
    })
}

async fn topics(State(state): State<Arc<ApiState>>) -> Json<TopicsJson> {
    Json(TopicsJson {
        all_peers: state.network.peers(),
        peers_by_topic: state.network.peers_by_topic(),
    })
}

async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthJson> {
    let peer_count = state.network.peers().len();
    metrics::metrics().connected_peers.set(peer_count as f64);

    let peers_ok = peer_count >= MIN_HEALTHY_PEERS;
    let peers_status = if peers_ok {
        format!("Healthy: {peer_count} peers are connected")
    } else {
        format!("NotHealthy: less than {MIN_HEALTHY_PEERS} peers are connected")
    };

    let beacon = probe_status(state.prober.beacon.check().await);
    let execution = probe_status(state.prober.execution.check().await);
    let event_sync = probe_status(state.prober.event_sync.check().await);

    let healthy = peers_ok
        && beacon.starts_with("Healthy")
        && execution.starts_with("Healthy")
        && event_sync.starts_with("Healthy");

    Json(HealthJson {
        healthy,
        peers_status,
        beacon_health_status: beacon,
        execution_health_status: execution,
        event_sync_health_status: event_sync,
    })
}

fn probe_status(result: Result<(), String>) -> String {
    match result {
        Ok(()) => "Healthy".to_string(),
        Err(err) => format!("NotHealthy: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::{AlwaysHealthy, HealthProbe};
    use async_trait::async_trait;
    use dv_types::{NetworkError, PeerId};
    use tokio::sync::mpsc;

    struct FakeNetwork {
        peer_count: usize,
    }

    impl Network for FakeNetwork {
        fn broadcast(&self, _: &str, _: Vec<u8>) -> Result<(), NetworkError> {
            Ok(())
        }

        fn subscribe(&self, _: &str) -> mpsc::Receiver<(PeerId, Vec<u8>)> {
            mpsc::channel(1).1
        }

        fn peers(&self) -> Vec<PeerId> {
            (0..self.peer_count).map(|i| format!("peer-{i}")).collect()
        }

        fn peers_by_topic(&self) -> HashMap<String, Vec<PeerId>> {
            HashMap::new()
        }
    }

    struct FailingProbe;

    #[async_trait]
    impl HealthProbe for FailingProbe {
        async fn check(&self) -> Result<(), String> {
            Err("not synced".into())
        }
    }

    fn state(peer_count: usize, event_sync_ok: bool) -> Arc<ApiState> {
        let event_sync: Arc<dyn HealthProbe> = if event_sync_ok {
            Arc::new(AlwaysHealthy)
        } else {
            Arc::new(FailingProbe)
        };
        Arc::new(ApiState {
            identity: Identity {
                peer_id: "16Uiu2HAm".into(),
                addresses: vec!["/ip4/0.0.0.0/tcp/13001".into()],
                version: "0.1.0".into(),
            },
            network: Arc::new(FakeNetwork { peer_count }),
            prober: Prober::new(Arc::new(AlwaysHealthy), Arc::new(AlwaysHealthy), event_sync),
        })
    }

    #[tokio::test]
    async fn healthy_with_enough_peers_and_probes() {
        let response = health(State(state(6, true))).await;
        assert!(response.0.healthy);
        assert!(response.0.peers_status.starts_with("Healthy"));
    }

    #[tokio::test]
    async fn unhealthy_below_peer_threshold() {
        let response = health(State(state(4, true))).await;
        assert!(!response.0.healthy);
        assert!(response.0.peers_status.starts_with("NotHealthy"));
    }

    #[tokio::test]
    async fn event_sync_probe_error_means_unhealthy() {
        // A failing event-sync probe must report NotHealthy, same polarity
        // as the other probes.
        let response = health(State(state(6, false))).await;
        assert!(!response.0.healthy);
        assert!(response.0.event_sync_health_status.starts_with("NotHealthy"));
    }
}
