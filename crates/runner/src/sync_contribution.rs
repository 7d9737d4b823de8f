//! Sync-committee contribution runner.

use crate::base::RunnerBase;
use crate::error::RunnerError;
use crate::partial_container::PartialSigContainer;
use crate::reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
use dv_beacon::AttestationDataCache;
use dv_qbft::DecidedEvent;
use dv_types::{
    compute_signing_root, BlsSignature, ContributionAndProof, Duty, Hash, PartialSignatureKind,
    PartialSignatureMessages, Share, SignedContributionAndProof, Slot,
    DOMAIN_CONTRIBUTION_AND_PROOF, DOMAIN_SYNC_COMMITTEE_SELECTION_PROOF,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Sync aggregators are elected per subcommittee with this modulus.
const SYNC_COMMITTEE_AGGREGATOR_MODULO: u64 = 8;

/// Object root for a sync selection proof: slot and subcommittee packed
/// little-endian.
fn sync_selection_root(slot: Slot, subcommittee_index: u64) -> Hash {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&slot.to_le_bytes());
    bytes[8..].copy_from_slice(&subcommittee_index.to_le_bytes());
    Hash::digest(&bytes)
}

fn is_sync_aggregator(proof: &BlsSignature) -> bool {
    let digest = Hash::digest(&proof.to_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(word) % SYNC_COMMITTEE_AGGREGATOR_MODULO == 0
}

struct ContributionState {
    duty: Duty,
    subcommittee_index: u64,
    pre: PartialSigContainer,
    post: PartialSigContainer,
    selection_root: Hash,
    selection_proof: Option<BlsSignature>,
    proof_root: Option<Hash>,
    contribution: Option<ContributionAndProof>,
    finished: bool,
}

/// Runs the sync-committee contribution duty for one validator.
pub struct SyncContributionRunner {
    base: RunnerBase,
    share: Arc<Share>,
    attestation_data: Arc<AttestationDataCache>,
    state: Option<ContributionState>,
}

impl SyncContributionRunner {
    pub fn new(
        base: RunnerBase,
        share: Arc<Share>,
        attestation_data: Arc<AttestationDataCache>,
    ) -> Self {
        SyncContributionRunner {
            base,
            share,
            attestation_data,
            state: None,
        }
    }

    pub async fn execute_duty(&mut self, duty: Duty) -> Result<(), RunnerError> {
        let subcommittee_index = duty.committee_index;
        let domain = self
            .base
            .domain(duty.epoch, DOMAIN_SYNC_COMMITTEE_SELECTION_PROOF)
            .await?;
        let selection_root = compute_signing_root(
            sync_selection_root(duty.slot, subcommittee_index),
            domain,
        );
        let partial = self
            .base
            .sign_partial(&duty.pubkey, duty.validator_index, selection_root)?;

        debug!(
            slot = duty.slot,
            validator = duty.validator_index,
            subcommittee = subcommittee_index,
            "starting sync-contribution duty"
        );
        let slot = duty.slot;
        self.state = Some(ContributionState {
            duty,
            subcommittee_index,
            pre: PartialSigContainer::new(),
            post: PartialSigContainer::new(),
            selection_root,
            selection_proof: None,
            proof_root: None,
            contribution: None,
            finished: false,
        });

        let batch =
            self.base
                .broadcast_partials(PartialSignatureKind::PreConsensus, slot, vec![partial])?;
        self.on_partial_signatures(batch).await
    }

    pub async fn on_partial_signatures(
        &mut self,
        batch: PartialSignatureMessages,
    ) -> Result<(), RunnerError> {
        match batch.kind {
            PartialSignatureKind::PreConsensus => self.on_pre_consensus(batch).await,
            PartialSignatureKind::PostConsensus => self.on_post_consensus(batch).await,
        }
    }

    async fn on_pre_consensus(
        &mut self,
        batch: PartialSignatureMessages,
    ) -> Result<(), RunnerError> {
        let committee = self.base.cluster_share.committee.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if batch.slot != state.duty.slot || state.selection_proof.is_some() || state.finished {
            return Ok(());
        }
        for msg in &batch.messages {
            if let Err(err) = state.pre.verify_and_add(&committee, msg) {
                debug!(signer = msg.signer, %err, "rejecting sync selection partial");
            }
        }
        if !state.pre.has_quorum(&committee, &state.selection_root) {
            return Ok(());
        }

        let selection_root = state.selection_root;
        let proof = match reconstruct_valid_signature(
            &state.pre,
            &selection_root,
            &self.share.validator_pubkey,
        )? {
            ReconstructOutcome::Valid(sig) => sig,
            ReconstructOutcome::Invalid { .. } => {
                let bad = verify_each_signature(&state.pre, &committee, &selection_root);
                error!(?bad, "sync selection proof reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };
        state.selection_proof = Some(proof);

        if !is_sync_aggregator(&proof) {
            debug!(
                slot = state.duty.slot,
                validator = state.duty.validator_index,
                "not selected as sync aggregator"
            );
            state.finished = true;
            return Ok(());
        }

        let slot: Slot = state.duty.slot;
        let subcommittee = state.subcommittee_index;
        let validator_index = state.duty.validator_index;
        // The head root the contribution covers; the cache already holds it
        // for this slot.
        let data = self.attestation_data.get_or_fetch(slot, 0).await?;
        let contribution = self
            .base
            .beacon
            .sync_committee_contribution(slot, subcommittee, data.beacon_block_root)
            .await?;
        let message = ContributionAndProof {
            aggregator_index: validator_index,
            contribution,
            selection_proof: proof,
        };
        let encoded = message.encode();
        if !self.base.controller.start_instance(slot, encoded).await {
            return Err(RunnerError::ConsensusNotStarted);
        }
        Ok(())
    }

    pub async fn on_decided(&mut self, event: DecidedEvent) -> Result<(), RunnerError> {
        let base = self.base.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if state.duty.slot != event.height || state.proof_root.is_some() || state.finished {
            return Ok(());
        }

        let message = ContributionAndProof::decode(&event.value)
            .map_err(|e| RunnerError::MalformedDecidedValue(e.to_string()))?;
        let domain = base
            .domain(state.duty.epoch, DOMAIN_CONTRIBUTION_AND_PROOF)
            .await?;
        let root = compute_signing_root(message.tree_root(), domain);
        state.proof_root = Some(root);
        state.contribution = Some(message);

        let partial = base.sign_partial(&state.duty.pubkey, state.duty.validator_index, root)?;
        let slot = state.duty.slot;
        let batch =
            base.broadcast_partials(PartialSignatureKind::PostConsensus, slot, vec![partial])?;
        self.on_partial_signatures(batch).await
    }

    async fn on_post_consensus(
        &mut self,
        batch: PartialSignatureMessages,
    ) -> Result<(), RunnerError> {
        let committee = self.base.cluster_share.committee.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        let Some(root) = state.proof_root else {
            return Ok(());
        };
        if batch.slot != state.duty.slot || state.finished {
            return Ok(());
        }
        for msg in &batch.messages {
            if let Err(err) = state.post.verify_and_add(&committee, msg) {
                debug!(signer = msg.signer, %err, "rejecting contribution partial");
            }
        }
        if !state.post.has_quorum(&committee, &root) {
            return Ok(());
        }

        let signature = match reconstruct_valid_signature(
            &state.post,
            &root,
            &self.share.validator_pubkey,
        )? {
            ReconstructOutcome::Valid(sig) => sig,
            ReconstructOutcome::Invalid { .. } => {
                let bad = verify_each_signature(&state.post, &committee, &root);
                error!(?bad, "contribution reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };

        let message = state.contribution.clone().ok_or(RunnerError::NoRunningDuty)?;
        let slot = state.duty.slot;
        state.finished = true;
        self.base
            .beacon
            .submit_contributions(vec![SignedContributionAndProof { message, signature }])
            .await?;
        info!(slot, "submitted signed contribution");
        Ok(())
    }
}
