//! Node assembly and lifecycle.

use crate::api::{self, ApiState, Identity};
use crate::cluster::{ClusterConfig, ClusterHandle, ClusterService, DutyCommand};
use crate::config::{Config, ConfigError};
use crate::prober::Prober;
use async_trait::async_trait;
use dv_beacon::{AttestationDataCache, BeaconClient};
use dv_duties::{DutiesExecutor, DutyStore, ExitRequest, Scheduler, SchedulerConfig};
use dv_runner::{LocalShareSigner, ShareSigner, SlashingOracle};
use dv_storage::Database;
use dv_types::{
    BlsPublicKey, BlsSecretKey, CommitteeDuty, Duty, Hash, Network, Share, ValidatorStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no validator shares loaded")]
    NoShares,
    #[error("failed to bind API port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Injected collaborators the node is wired with.
pub struct NodeDeps {
    pub db: Arc<dyn Database>,
    pub network: Arc<dyn Network>,
    pub beacon: Arc<dyn BeaconClient>,
    pub prober: Prober,
    pub identity: Identity,
    /// This operator's shares with their share secrets.
    pub shares: Vec<(Share, BlsSecretKey)>,
    pub slashing_oracle: Arc<dyn SlashingOracle>,
}

/// Routes scheduler output to cluster services by validator public key.
struct Dispatcher {
    by_pubkey: HashMap<BlsPublicKey, Hash>,
    clusters: HashMap<Hash, ClusterHandle>,
}

#[async_trait]
impl DutiesExecutor for Dispatcher {
    async fn execute_committee_duty(&self, duty: CommitteeDuty) {
        let Some(first) = duty.duties.first() else {
            return;
        };
        let Some(handle) = self
            .by_pubkey
            .get(&first.pubkey)
            .and_then(|id| self.clusters.get(id))
        else {
            warn!(slot = duty.slot, "committee duty for unknown cluster");
            return;
        };
        if handle.duty_tx.send(DutyCommand::Committee(duty)).await.is_err() {
            warn!("cluster service gone, dropping committee duty");
        }
    }

    async fn execute_duty(&self, duty: Duty) {
        let Some(handle) = self
            .by_pubkey
            .get(&duty.pubkey)
            .and_then(|id| self.clusters.get(id))
        else {
            warn!(slot = duty.slot, role = %duty.role, "duty for unknown cluster");
            return;
        };
        if handle.duty_tx.send(DutyCommand::Single(duty)).await.is_err() {
            warn!("cluster service gone, dropping duty");
        }
    }
}

/// A running operator node.
pub struct Node {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    exit_tx: mpsc::Sender<ExitRequest>,
}

impl Node {
    /// Wire and start every subsystem: validator store, attestation cache,
    /// cluster services, scheduler, HTTP surface.
    pub async fn start(config: Config, deps: NodeDeps) -> Result<Node, NodeError> {
        if deps.shares.is_empty() {
            return Err(NodeError::NoShares);
        }
        let network_config = config.network_config()?;
        let fee_recipient = config.fee_recipient_bytes()?;
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        // Shares: validator store, share signer, cluster grouping.
        let validators = Arc::new(ValidatorStore::new());
        let mut signer = LocalShareSigner::new();
        let mut cluster_shares: HashMap<Hash, HashMap<u64, Arc<Share>>> = HashMap::new();
        let mut cluster_keys: HashMap<Hash, HashMap<u64, Arc<BlsSecretKey>>> = HashMap::new();
        let mut by_pubkey = HashMap::new();
        for (share, key) in deps.shares {
            let share = Arc::new(share);
            validators.insert((*share).clone());
            signer.add_share(share.validator_pubkey, key.clone());
            by_pubkey.insert(share.validator_pubkey, share.cluster_id);
            cluster_keys
                .entry(share.cluster_id)
                .or_default()
                .insert(share.validator_index, Arc::new(key));
            cluster_shares
                .entry(share.cluster_id)
                .or_default()
                .insert(share.validator_index, share);
        }
        let signer: Arc<dyn ShareSigner> = Arc::new(signer);

        let attestation_data = Arc::new(AttestationDataCache::new(deps.beacon.clone()));
        handles.push(
            attestation_data
                .clone()
                .spawn_pruner(network_config.slots_per_epoch, shutdown.clone()),
        );

        // One service per cluster.
        let mut clusters = HashMap::new();
        for (cluster_id, shares) in cluster_shares {
            let consensus_keys = cluster_keys.remove(&cluster_id).unwrap_or_default();
            let (handle, join) = ClusterService::spawn(
                ClusterConfig {
                    network_config: network_config.clone(),
                    shares,
                    consensus_keys,
                    signer: signer.clone(),
                    slashing_oracle: deps.slashing_oracle.clone(),
                    fee_recipient,
                },
                deps.beacon.clone(),
                deps.network.clone(),
                deps.db.clone(),
                attestation_data.clone(),
                shutdown.clone(),
            );
            clusters.insert(cluster_id, handle);
            handles.push(join);
        }
        info!(clusters = clusters.len(), validators = validators.len(), "clusters started");

        // Scheduler over the dispatcher.
        let dispatcher = Arc::new(Dispatcher {
            by_pubkey,
            clusters,
        });
        let duty_store = Arc::new(DutyStore::new());
        let scheduler = Scheduler::new(
            SchedulerConfig {
                network: network_config.clone(),
            },
            deps.beacon.clone(),
            validators.clone(),
            duty_store,
            dispatcher,
            shutdown.clone(),
        );
        let (exit_tx, exit_rx) = mpsc::channel(16);
        handles.extend(scheduler.start(exit_rx));

        // HTTP surface.
        let api_state = Arc::new(ApiState {
            identity: deps.identity,
            network: deps.network.clone(),
            prober: deps.prober,
        });
        let router = api::router(api_state);
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", config.ws_api_port)).await?;
        info!(port = config.ws_api_port, "API listening");
        let server_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
            if let Err(err) = result {
                error!(%err, "API server exited");
            }
        }));

        Ok(Node {
            shutdown,
            handles,
            exit_tx,
        })
    }

    /// Submit a voluntary-exit request into the duty pipeline.
    pub fn exit_requests(&self) -> mpsc::Sender<ExitRequest> {
        self.exit_tx.clone()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the root token and wait for every task to drain, bounded by
    /// the shutdown deadline.
    pub async fn shutdown(self) {
        info!("shutting down");
        self.shutdown.cancel();
        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(std::time::Duration::from_secs(5), drain)
            .await
            .is_err()
        {
            warn!("shutdown deadline exceeded, abandoning remaining tasks");
        }
    }
}
