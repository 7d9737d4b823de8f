//! Per-cluster service: controllers and runners for one operator committee.
//!
//! One cluster service task owns every runner of its cluster. Duties arrive
//! from the scheduler, decided events from the role controllers, partial
//! signatures from the gossip pumps — all on the service's own channels, so
//! runner state is mutated from a single task.

use crate::metrics;
use dv_beacon::{AttestationDataCache, BeaconClient};
use dv_qbft::{
    Controller, ControllerConfig, ControllerHandle, DecidedEvent, InstanceConfig, QbftStore,
};
use dv_runner::{
    beacon_block_value_check, beacon_vote_value_check, AggregatorRunner, CommitteeRunner,
    ProposerRunner, RunnerBase, ShareSigner, SlashingOracle, SyncContributionRunner,
    ValidatorRegistrationRunner, VoluntaryExitRunner,
};
use dv_storage::Database;
use dv_types::{
    topic_for, AggregateAndProof, BeaconRole, BlsSecretKey, CommitteeDuty, ContributionAndProof,
    Duty, Hash, MessageId, Network, NetworkConfig, PartialSignatureMessages, Share,
    ValidatorIndex, WireMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Work dispatched from the scheduler into a cluster.
#[derive(Debug)]
pub enum DutyCommand {
    Committee(CommitteeDuty),
    Single(Duty),
}

/// Handle the dispatcher uses to feed a cluster service.
#[derive(Clone)]
pub struct ClusterHandle {
    pub cluster_id: Hash,
    pub duty_tx: mpsc::Sender<DutyCommand>,
}

/// Everything needed to assemble one cluster's runners.
pub struct ClusterConfig {
    pub network_config: NetworkConfig,
    /// Shares of this cluster's validators, keyed by validator index.
    pub shares: HashMap<ValidatorIndex, Arc<Share>>,
    /// This operator's share secrets for consensus signing, keyed by
    /// validator index.
    pub consensus_keys: HashMap<ValidatorIndex, Arc<BlsSecretKey>>,
    pub signer: Arc<dyn ShareSigner>,
    pub slashing_oracle: Arc<dyn SlashingOracle>,
    pub fee_recipient: [u8; 20],
}

/// A single-validator role runner.
enum RoleRunner {
    Proposer(ProposerRunner),
    Aggregator(AggregatorRunner),
    SyncContribution(SyncContributionRunner),
    Registration(ValidatorRegistrationRunner),
    VoluntaryExit(VoluntaryExitRunner),
}

pub struct ClusterService {
    cluster_id: Hash,
    committee_runner: CommitteeRunner,
    role_runners: HashMap<(BeaconRole, ValidatorIndex), RoleRunner>,
    duty_rx: mpsc::Receiver<DutyCommand>,
    decided_rx: mpsc::Receiver<DecidedEvent>,
    partial_rx: mpsc::Receiver<(BeaconRole, PartialSignatureMessages)>,
    shutdown: CancellationToken,
}

impl ClusterService {
    /// Assemble and spawn the service: one controller per consensus role,
    /// gossip pumps for every role topic, runners for every validator.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: ClusterConfig,
        beacon: Arc<dyn BeaconClient>,
        network: Arc<dyn Network>,
        db: Arc<dyn Database>,
        attestation_data: Arc<AttestationDataCache>,
        shutdown: CancellationToken,
    ) -> (ClusterHandle, JoinHandle<()>) {
        // The cluster's consensus streams sign with the share of its
        // lowest-index validator; every operator derives the same choice.
        let anchor_index = config
            .shares
            .keys()
            .min()
            .copied()
            .unwrap_or_default();
        let anchor_share = config.shares[&anchor_index].clone();
        let cluster_id = anchor_share.cluster_id;
        let anchor_key = config.consensus_keys[&anchor_index].clone();
        let domain = config.network_config.message_domain();

        let (duty_tx, duty_rx) = mpsc::channel(64);
        let (decided_tx, decided_rx) = mpsc::channel(64);
        let (partial_tx, partial_rx) = mpsc::channel(256);

        let mut controllers: HashMap<BeaconRole, ControllerHandle> = HashMap::new();
        let consensus_roles = [
            (
                BeaconRole::Attester,
                beacon_vote_value_check(config.slashing_oracle.clone()),
            ),
            (
                BeaconRole::Proposer,
                beacon_block_value_check(config.slashing_oracle.clone()),
            ),
            (
                BeaconRole::Aggregator,
                Arc::new(|_, value: &[u8]| {
                    AggregateAndProof::decode(value)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }) as dv_qbft::ValueCheck,
            ),
            (
                BeaconRole::SyncCommitteeContribution,
                Arc::new(|_, value: &[u8]| {
                    ContributionAndProof::decode(value)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }) as dv_qbft::ValueCheck,
            ),
        ];

        for (role, value_check) in consensus_roles {
            let message_id = MessageId::new(config.network_config.domain_type, role, cluster_id);
            let instance_config = InstanceConfig {
                share: anchor_share.clone(),
                signer: anchor_key.clone(),
                domain,
                value_check,
            };
            let (handle, _join) = Controller::spawn(
                ControllerConfig::new(message_id, instance_config),
                QbftStore::new(db.clone()),
                network.clone(),
                decided_tx.clone(),
                shutdown.clone(),
            );
            controllers.insert(role, handle);
        }

        // Gossip pumps: one per role topic, decoding wire messages into the
        // controller mailbox or the partial-signature channel.
        let all_roles = [
            BeaconRole::Attester,
            BeaconRole::Proposer,
            BeaconRole::Aggregator,
            BeaconRole::SyncCommitteeContribution,
            BeaconRole::ValidatorRegistration,
            BeaconRole::VoluntaryExit,
        ];
        for role in all_roles {
            let message_id = MessageId::new(config.network_config.domain_type, role, cluster_id);
            let mut inbound = network.subscribe(&topic_for(&message_id));
            let controller = controllers.get(&role).cloned();
            let partial_tx = partial_tx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        msg = inbound.recv() => {
                            let Some((peer, data)) = msg else { break };
                            match WireMessage::decode(&data) {
                                Ok(WireMessage::Consensus(signed)) => {
                                    if let Some(controller) = &controller {
                                        if !controller.try_enqueue(signed) {
                                            metrics::metrics().messages_dropped.inc();
                                        }
                                    }
                                }
                                Ok(WireMessage::PartialSignatures(batch)) => {
                                    if partial_tx.try_send((role, batch)).is_err() {
                                        metrics::metrics().messages_dropped.inc();
                                    }
                                }
                                Err(err) => {
                                    debug!(%peer, %err, "undecodable gossip message");
                                }
                            }
                        }
                    }
                }
            });
        }

        let base_for = |role: BeaconRole| RunnerBase {
            role,
            network_config: config.network_config.clone(),
            message_id: MessageId::new(config.network_config.domain_type, role, cluster_id),
            cluster_share: anchor_share.clone(),
            signer: config.signer.clone(),
            network: network.clone(),
            beacon: beacon.clone(),
            // Roles without consensus never start instances; the committee
            // controller handle is a safe filler for them.
            controller: controllers
                .get(&role)
                .unwrap_or(&controllers[&BeaconRole::Attester])
                .clone(),
        };

        let committee_runner = CommitteeRunner::new(
            base_for(BeaconRole::Attester),
            config.shares.clone(),
            attestation_data.clone(),
        );

        let mut role_runners = HashMap::new();
        for (index, share) in &config.shares {
            role_runners.insert(
                (BeaconRole::Proposer, *index),
                RoleRunner::Proposer(ProposerRunner::new(
                    base_for(BeaconRole::Proposer),
                    share.clone(),
                )),
            );
            role_runners.insert(
                (BeaconRole::Aggregator, *index),
                RoleRunner::Aggregator(AggregatorRunner::new(
                    base_for(BeaconRole::Aggregator),
                    share.clone(),
                    attestation_data.clone(),
                )),
            );
            role_runners.insert(
                (BeaconRole::SyncCommitteeContribution, *index),
                RoleRunner::SyncContribution(SyncContributionRunner::new(
                    base_for(BeaconRole::SyncCommitteeContribution),
                    share.clone(),
                    attestation_data.clone(),
                )),
            );
            role_runners.insert(
                (BeaconRole::ValidatorRegistration, *index),
                RoleRunner::Registration(ValidatorRegistrationRunner::new(
                    base_for(BeaconRole::ValidatorRegistration),
                    share.clone(),
                    config.fee_recipient,
                )),
            );
            role_runners.insert(
                (BeaconRole::VoluntaryExit, *index),
                RoleRunner::VoluntaryExit(VoluntaryExitRunner::new(
                    base_for(BeaconRole::VoluntaryExit),
                    share.clone(),
                )),
            );
        }

        let service = ClusterService {
            cluster_id,
            committee_runner,
            role_runners,
            duty_rx,
            decided_rx,
            partial_rx,
            shutdown,
        };
        let handle = ClusterHandle {
            cluster_id,
            duty_tx,
        };
        let join = tokio::spawn(service.run());
        (handle, join)
    }

    async fn run(mut self) {
        info!(cluster = %self.cluster_id, "cluster service started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = self.duty_rx.recv() => self.on_duty(cmd).await,
                Some(event) = self.decided_rx.recv() => self.on_decided(event).await,
                Some((role, batch)) = self.partial_rx.recv() => self.on_partials(role, batch).await,
                else => break,
            }
        }
        info!(cluster = %self.cluster_id, "cluster service stopped");
    }

    async fn on_duty(&mut self, cmd: DutyCommand) {
        match cmd {
            DutyCommand::Committee(duty) => {
                if let Err(err) = self.committee_runner.execute_duty(duty).await {
                    warn!(%err, "committee duty failed to start");
                }
            }
            DutyCommand::Single(duty) => {
                let key = (duty.role, duty.validator_index);
                let Some(runner) = self.role_runners.get_mut(&key) else {
                    debug!(role = %duty.role, validator = duty.validator_index, "no runner for duty");
                    return;
                };
                let result = match runner {
                    RoleRunner::Proposer(r) => r.execute_duty(duty).await,
                    RoleRunner::Aggregator(r) => r.execute_duty(duty).await,
                    RoleRunner::SyncContribution(r) => r.execute_duty(duty).await,
                    RoleRunner::Registration(r) => r.execute_duty(duty).await,
                    RoleRunner::VoluntaryExit(r) => r.execute_duty(duty).await,
                };
                if let Err(err) = result {
                    warn!(%err, "duty failed to start");
                }
            }
        }
    }

    async fn on_decided(&mut self, event: DecidedEvent) {
        metrics::metrics().instances_decided.inc();
        let Some(role) = event.identifier.role() else {
            return;
        };
        match role {
            BeaconRole::Attester => {
                if let Err(err) = self.committee_runner.on_decided(event).await {
                    warn!(%err, "committee decided handling failed");
                }
            }
            _ => {
                // Single-validator runners ignore decisions for heights they
                // are not running; try each of the role's runners.
                for ((runner_role, _), runner) in self.role_runners.iter_mut() {
                    if *runner_role != role {
                        continue;
                    }
                    let result = match runner {
                        RoleRunner::Proposer(r) => r.on_decided(event.clone()).await,
                        RoleRunner::Aggregator(r) => r.on_decided(event.clone()).await,
                        RoleRunner::SyncContribution(r) => r.on_decided(event.clone()).await,
                        // No consensus round for these roles.
                        RoleRunner::Registration(_) | RoleRunner::VoluntaryExit(_) => Ok(()),
                    };
                    if let Err(err) = result {
                        debug!(%err, "decided event not consumed");
                    }
                }
            }
        }
    }

    async fn on_partials(&mut self, role: BeaconRole, batch: PartialSignatureMessages) {
        match role {
            BeaconRole::Attester => {
                if let Err(err) = self.committee_runner.on_partial_signatures(batch).await {
                    debug!(%err, "partial signatures not consumed");
                }
            }
            _ => {
                for ((runner_role, _), runner) in self.role_runners.iter_mut() {
                    if *runner_role != role {
                        continue;
                    }
                    let result = match runner {
                        RoleRunner::Proposer(r) => r.on_partial_signatures(batch.clone()).await,
                        RoleRunner::Aggregator(r) => r.on_partial_signatures(batch.clone()).await,
                        RoleRunner::SyncContribution(r) => {
                            r.on_partial_signatures(batch.clone()).await
                        }
                        RoleRunner::Registration(r) => {
                            r.on_partial_signatures(batch.clone()).await
                        }
                        RoleRunner::VoluntaryExit(r) => {
                            r.on_partial_signatures(batch.clone()).await
                        }
                    };
                    if let Err(err) = result {
                        debug!(%err, "partial signatures not consumed");
                    }
                }
            }
        }
    }
}
