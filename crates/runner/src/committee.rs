//! Committee runner: one consensus instance per slot covering every
//! attester and sync-committee duty of the cluster.

use crate::base::RunnerBase;
use crate::error::RunnerError;
use crate::metrics::metrics;
use crate::partial_container::PartialSigContainer;
use crate::reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
use dv_beacon::AttestationDataCache;
use dv_qbft::DecidedEvent;
use dv_types::{
    compute_signing_root, AggregationBits, Attestation, BeaconRole, BeaconVote, CommitteeDuty,
    Hash, PartialSignatureKind, PartialSignatureMessages, Share, SyncCommitteeMessage,
    ValidatorIndex, DOMAIN_ATTESTER, DOMAIN_SYNC_COMMITTEE,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A beacon object awaiting its reconstructed signature.
enum ExpectedObject {
    Attestation {
        validator_index: ValidatorIndex,
        attestation: Attestation,
    },
    SyncMessage {
        validator_index: ValidatorIndex,
        message: SyncCommitteeMessage,
    },
}

struct CommitteeState {
    duty: CommitteeDuty,
    decided: Option<BeaconVote>,
    post: PartialSigContainer,
    expected: HashMap<Hash, ExpectedObject>,
    submitted: HashSet<Hash>,
    finished: bool,
    started: Instant,
    consensus_done: Option<Instant>,
    post_started: Option<Instant>,
}

/// Drives attester + sync-committee duties through consensus and
/// post-consensus signing.
pub struct CommitteeRunner {
    base: RunnerBase,
    shares: HashMap<ValidatorIndex, Arc<Share>>,
    attestation_data: Arc<AttestationDataCache>,
    state: Option<CommitteeState>,
}

impl CommitteeRunner {
    pub fn new(
        base: RunnerBase,
        shares: HashMap<ValidatorIndex, Arc<Share>>,
        attestation_data: Arc<AttestationDataCache>,
    ) -> Self {
        CommitteeRunner {
            base,
            shares,
            attestation_data,
            state: None,
        }
    }

    pub fn has_running_duty(&self) -> bool {
        self.state.as_ref().is_some_and(|s| !s.finished)
    }

    /// Mark every duty of a removed validator as stopped; it is skipped at
    /// signing time.
    pub fn stop_validator(&mut self, pubkey: &dv_types::BlsPublicKey) {
        if let Some(state) = &mut self.state {
            state.duty.stop_validator(pubkey);
        }
    }

    /// Start the duty: fetch attestation data, form the beacon vote, begin
    /// consensus at `height = slot`.
    pub async fn execute_duty(&mut self, duty: CommitteeDuty) -> Result<(), RunnerError> {
        if let Some(state) = &self.state {
            if !state.finished && state.duty.slot == duty.slot {
                return Err(RunnerError::DutyAlreadyRunning(duty.slot));
            }
            // A duty still running at the next slot boundary is abandoned.
            if !state.finished {
                warn!(
                    slot = state.duty.slot,
                    next = duty.slot,
                    "abandoning unfinished committee duty"
                );
            }
        }

        let slot = duty.slot;
        // The committee index only tags the local copy; the cache is keyed
        // by slot, so the first sub-duty's index is as good as any.
        let committee_index = duty
            .active()
            .find(|d| d.role == BeaconRole::Attester)
            .map(|d| d.committee_index)
            .unwrap_or(0);
        let data = self
            .attestation_data
            .get_or_fetch(slot, committee_index)
            .await?;

        let vote = BeaconVote {
            block_root: data.beacon_block_root,
            source: data.source,
            target: data.target,
        };

        info!(slot, duties = duty.duties.len(), "starting committee duty");
        self.state = Some(CommitteeState {
            duty,
            decided: None,
            post: PartialSigContainer::new(),
            expected: HashMap::new(),
            submitted: HashSet::new(),
            finished: false,
            started: Instant::now(),
            consensus_done: None,
            post_started: None,
        });

        if !self.base.controller.start_instance(slot, vote.encode()).await {
            return Err(RunnerError::ConsensusNotStarted);
        }
        Ok(())
    }

    /// Consensus decided: sign every sub-duty's beacon object with the
    /// operator's partial key and broadcast the batch.
    pub async fn on_decided(&mut self, event: DecidedEvent) -> Result<(), RunnerError> {
        let role = self.base.role;
        let base = self.base.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if state.duty.slot != event.height || state.decided.is_some() {
            return Ok(());
        }

        let vote = BeaconVote::decode(&event.value)
            .map_err(|e| RunnerError::MalformedDecidedValue(e.to_string()))?;
        let now = Instant::now();
        state.consensus_done = Some(now);
        state.post_started = Some(now);
        metrics()
            .consensus_duration
            .with_label_values(&[&role.to_string()])
            .observe((now - state.started).as_secs_f64());

        let slot = state.duty.slot;
        let epoch = base.network_config.epoch_at_slot(slot);
        let mut partials = Vec::new();

        let attester_domain = base.domain(epoch, DOMAIN_ATTESTER).await?;
        let sync_domain = base.domain(epoch, DOMAIN_SYNC_COMMITTEE).await?;

        for duty in state.duty.active() {
            match duty.role {
                BeaconRole::Attester => {
                    let data = vote.attestation_data(duty);
                    let root = compute_signing_root(data.tree_root(), attester_domain);
                    let mut bits = AggregationBits::new(duty.committee_length);
                    bits.set(duty.committee_position);

                    // Per-sub-duty isolation: a missing share key skips this
                    // validator, not the batch.
                    let partial = match base.sign_partial(&duty.pubkey, duty.validator_index, root)
                    {
                        Ok(partial) => partial,
                        Err(err) => {
                            error!(validator = duty.validator_index, %err, "attestation signing failed");
                            continue;
                        }
                    };
                    debug!(
                        validator = duty.validator_index,
                        signing_root = %root,
                        "signed attestation data"
                    );
                    // The partial stands in until reconstruction replaces it.
                    let placeholder = partial.partial_signature;
                    partials.push(partial);
                    state.expected.insert(
                        root,
                        ExpectedObject::Attestation {
                            validator_index: duty.validator_index,
                            attestation: Attestation {
                                aggregation_bits: bits,
                                data,
                                signature: placeholder,
                            },
                        },
                    );
                }
                BeaconRole::SyncCommittee => {
                    let root = compute_signing_root(vote.block_root, sync_domain);
                    let partial = match base.sign_partial(&duty.pubkey, duty.validator_index, root)
                    {
                        Ok(partial) => partial,
                        Err(err) => {
                            error!(validator = duty.validator_index, %err, "sync message signing failed");
                            continue;
                        }
                    };
                    let placeholder = partial.partial_signature;
                    partials.push(partial);
                    state.expected.insert(
                        root,
                        ExpectedObject::SyncMessage {
                            validator_index: duty.validator_index,
                            message: SyncCommitteeMessage {
                                slot,
                                beacon_block_root: vote.block_root,
                                validator_index: duty.validator_index,
                                signature: placeholder,
                            },
                        },
                    );
                }
                _ => {}
            }
        }
        state.decided = Some(vote);

        debug!(slot, sigs = partials.len(), "broadcasting post-consensus partials");
        let batch = base.broadcast_partials(PartialSignatureKind::PostConsensus, slot, partials)?;
        // Our own partials count toward the quorum immediately.
        self.on_partial_signatures(batch).await
    }

    /// Inbound partial signatures. On quorum per signing root, reconstruct
    /// and submit in bulk.
    pub async fn on_partial_signatures(
        &mut self,
        batch: PartialSignatureMessages,
    ) -> Result<(), RunnerError> {
        let committee = self.base.cluster_share.committee.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if batch.kind != PartialSignatureKind::PostConsensus || batch.slot != state.duty.slot {
            return Ok(());
        }

        for msg in &batch.messages {
            if let Err(err) = state.post.verify_and_add(&committee, msg) {
                warn!(signer = msg.signer, %err, "rejecting partial signature");
            }
        }

        let mut attestations = Vec::new();
        let mut sync_messages = Vec::new();
        for (root, expected) in &state.expected {
            if state.submitted.contains(root) || !state.post.has_quorum(&committee, root) {
                continue;
            }
            let validator_index = match expected {
                ExpectedObject::Attestation {
                    validator_index, ..
                }
                | ExpectedObject::SyncMessage {
                    validator_index, ..
                } => *validator_index,
            };
            let Some(share) = self.shares.get(&validator_index) else {
                warn!(validator = validator_index, "no share for decided validator");
                continue;
            };

            match reconstruct_valid_signature(&state.post, root, &share.validator_pubkey)? {
                ReconstructOutcome::Valid(signature) => {
                    state.submitted.insert(*root);
                    match expected {
                        ExpectedObject::Attestation { attestation, .. } => {
                            let mut att = attestation.clone();
                            att.signature = signature;
                            attestations.push(att);
                        }
                        ExpectedObject::SyncMessage { message, .. } => {
                            let mut msg = message.clone();
                            msg.signature = signature;
                            sync_messages.push(msg);
                        }
                    }
                }
                ReconstructOutcome::Invalid { partial_ids } => {
                    // Fall back to per-share verification to name the bad
                    // share; other roots proceed unaffected.
                    let bad_shares = verify_each_signature(&state.post, &committee, root);
                    error!(
                        validator = validator_index,
                        ?partial_ids,
                        ?bad_shares,
                        "post-consensus quorum with invalid signatures"
                    );
                }
            }
        }

        if attestations.is_empty() && sync_messages.is_empty() {
            return Ok(());
        }
        self.submit(attestations, sync_messages).await
    }

    async fn submit(
        &mut self,
        attestations: Vec<Attestation>,
        sync_messages: Vec<SyncCommitteeMessage>,
    ) -> Result<(), RunnerError> {
        let role = self.base.role.to_string();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        let slot = state.duty.slot;
        let submission_start = Instant::now();

        if !attestations.is_empty() {
            let count = attestations.len();
            match self.base.beacon.submit_attestations(attestations).await {
                Ok(()) => info!(slot, count, "submitted attestations"),
                Err(err) => error!(slot, %err, "could not submit attestations"),
            }
        }
        if !sync_messages.is_empty() {
            let count = sync_messages.len();
            match self
                .base
                .beacon
                .submit_sync_committee_messages(sync_messages)
                .await
            {
                Ok(()) => info!(slot, count, "submitted sync committee messages"),
                Err(err) => error!(slot, %err, "could not submit sync committee messages"),
            }
        }

        let now = Instant::now();
        metrics()
            .submission_duration
            .with_label_values(&[&role])
            .observe((now - submission_start).as_secs_f64());
        if let Some(post_started) = state.post_started {
            metrics()
                .post_consensus_duration
                .with_label_values(&[&role])
                .observe((submission_start - post_started).as_secs_f64());
        }

        if state.submitted.len() == state.expected.len() {
            state.finished = true;
            let consensus = state
                .consensus_done
                .map(|t| (t - state.started).as_secs_f64())
                .unwrap_or_default();
            info!(
                slot,
                consensus_time = consensus,
                total_time = (now - state.started).as_secs_f64(),
                "committee duty finished"
            );
        }
        Ok(())
    }
}
