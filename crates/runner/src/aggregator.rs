//! Aggregator runner: selection proof, aggregate consensus, proof signing.

use crate::base::RunnerBase;
use crate::error::RunnerError;
use crate::partial_container::PartialSigContainer;
use crate::reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
use dv_beacon::AttestationDataCache;
use dv_qbft::DecidedEvent;
use dv_types::{
    compute_signing_root, uint_tree_root, AggregateAndProof, BlsSignature, Duty, Hash,
    PartialSignatureKind, PartialSignatureMessages, Share, SignedAggregateAndProof,
    DOMAIN_AGGREGATE_AND_PROOF, DOMAIN_SELECTION_PROOF,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// One aggregator per committee slice of this many validators.
const TARGET_AGGREGATORS_PER_COMMITTEE: u64 = 16;

/// Whether a reconstructed selection proof elects this validator as the
/// slot's aggregator.
fn is_aggregator(proof: &BlsSignature, committee_length: u64) -> bool {
    let digest = Hash::digest(&proof.to_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest.as_bytes()[..8]);
    let modulo = (committee_length / TARGET_AGGREGATORS_PER_COMMITTEE).max(1);
    u64::from_le_bytes(word) % modulo == 0
}

struct AggregatorState {
    duty: Duty,
    pre: PartialSigContainer,
    post: PartialSigContainer,
    selection_root: Hash,
    selection_proof: Option<BlsSignature>,
    proof_root: Option<Hash>,
    aggregate: Option<AggregateAndProof>,
    finished: bool,
}

/// Runs the attestation-aggregation duty.
pub struct AggregatorRunner {
    base: RunnerBase,
    share: Arc<Share>,
    attestation_data: Arc<AttestationDataCache>,
    state: Option<AggregatorState>,
}

impl AggregatorRunner {
    pub fn new(
        base: RunnerBase,
        share: Arc<Share>,
        attestation_data: Arc<AttestationDataCache>,
    ) -> Self {
        AggregatorRunner {
            base,
            share,
            attestation_data,
            state: None,
        }
    }

    /// Pre-consensus: threshold-sign the slot selection proof.
    pub async fn execute_duty(&mut self, duty: Duty) -> Result<(), RunnerError> {
        let domain = self.base.domain(duty.epoch, DOMAIN_SELECTION_PROOF).await?;
        let selection_root = compute_signing_root(uint_tree_root(duty.slot), domain);
        let partial = self
            .base
            .sign_partial(&duty.pubkey, duty.validator_index, selection_root)?;

        debug!(slot = duty.slot, validator = duty.validator_index, "starting aggregator duty");
        let slot = duty.slot;
        self.state = Some(AggregatorState {
            duty,
            pre: PartialSigContainer::new(),
            post: PartialSigContainer::new(),
            selection_root,
            selection_proof: None,
            proof_root: None,
            aggregate: None,
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
                debug!(signer = msg.signer, %err, "rejecting selection-proof partial");
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
                error!(?bad, "selection proof reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };
        state.selection_proof = Some(proof);

        if !is_aggregator(&proof, state.duty.committee_length) {
            debug!(
                slot = state.duty.slot,
                validator = state.duty.validator_index,
                "not selected as aggregator"
            );
            state.finished = true;
            return Ok(());
        }

        let slot = state.duty.slot;
        let committee_index = state.duty.committee_index;
        let validator_index = state.duty.validator_index;
        let data = self
            .attestation_data
            .get_or_fetch(slot, committee_index)
            .await?;
        let aggregate = self
            .base
            .beacon
            .aggregate_attestation(slot, data.tree_root())
            .await?;
        let message = AggregateAndProof {
            aggregator_index: validator_index,
            aggregate,
            selection_proof: proof,
        };
        if !self
            .base
            .controller
            .start_instance(slot, message.encode())
            .await
        {
            return Err(RunnerError::ConsensusNotStarted);
        }
        Ok(())
    }

    /// Consensus decided on the aggregate-and-proof: threshold-sign it.
    pub async fn on_decided(&mut self, event: DecidedEvent) -> Result<(), RunnerError> {
        let base = self.base.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if state.duty.slot != event.height || state.proof_root.is_some() || state.finished {
            return Ok(());
        }

        let message = AggregateAndProof::decode(&event.value)
            .map_err(|e| RunnerError::MalformedDecidedValue(e.to_string()))?;
        let domain = base
            .domain(state.duty.epoch, DOMAIN_AGGREGATE_AND_PROOF)
            .await?;
        let root = compute_signing_root(message.tree_root(), domain);
        state.proof_root = Some(root);
        state.aggregate = Some(message);

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
                debug!(signer = msg.signer, %err, "rejecting aggregate-proof partial");
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
                error!(?bad, "aggregate proof reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };

        let message = state.aggregate.clone().ok_or(RunnerError::NoRunningDuty)?;
        let slot = state.duty.slot;
        state.finished = true;
        self.base
            .beacon
            .submit_aggregates(vec![SignedAggregateAndProof { message, signature }])
            .await?;
        info!(slot, "submitted signed aggregate");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::BlsSecretKey;

    #[test]
    fn small_committees_always_aggregate() {
        let sig = BlsSecretKey::generate().unwrap().sign(b"proof");
        // committee_length / 16 == 0 clamps the modulo to 1.
        assert!(is_aggregator(&sig, 8));
    }
}
