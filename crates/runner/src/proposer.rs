//! Proposer runner: randao reveal, block consensus, block signing.

use crate::base::RunnerBase;
use crate::error::RunnerError;
use crate::metrics::metrics;
use crate::partial_container::PartialSigContainer;
use crate::reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
use dv_qbft::DecidedEvent;
use dv_types::{
    compute_signing_root, uint_tree_root, BeaconBlock, Duty, Hash, PartialSignatureKind,
    PartialSignatureMessages, Share, SignedBeaconBlock, DOMAIN_PROPOSER, DOMAIN_RANDAO,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

struct ProposerState {
    duty: Duty,
    pre: PartialSigContainer,
    post: PartialSigContainer,
    randao_root: Hash,
    block_root: Option<Hash>,
    block: Option<BeaconBlock>,
    submitted: bool,
    started: Instant,
}

/// Runs one block proposal through its three signing rounds.
pub struct ProposerRunner {
    base: RunnerBase,
    share: Arc<Share>,
    state: Option<ProposerState>,
}

impl ProposerRunner {
    pub fn new(base: RunnerBase, share: Arc<Share>) -> Self {
        ProposerRunner {
            base,
            share,
            state: None,
        }
    }

    /// Pre-consensus: threshold-sign the randao reveal for the duty epoch.
    pub async fn execute_duty(&mut self, duty: Duty) -> Result<(), RunnerError> {
        let epoch = duty.epoch;
        let domain = self.base.domain(epoch, DOMAIN_RANDAO).await?;
        let randao_root = compute_signing_root(uint_tree_root(epoch), domain);

        let partial = self
            .base
            .sign_partial(&duty.pubkey, duty.validator_index, randao_root)?;
        info!(slot = duty.slot, validator = duty.validator_index, "starting proposer duty");
        let slot = duty.slot;
        self.state = Some(ProposerState {
            duty,
            pre: PartialSigContainer::new(),
            post: PartialSigContainer::new(),
            randao_root,
            block_root: None,
            block: None,
            submitted: false,
            started: Instant::now(),
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

    /// Randao quorum: reconstruct the reveal, fetch the block, start
    /// consensus on it.
    async fn on_pre_consensus(
        &mut self,
        batch: PartialSignatureMessages,
    ) -> Result<(), RunnerError> {
        let committee = self.base.cluster_share.committee.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if batch.slot != state.duty.slot || state.block.is_some() {
            return Ok(());
        }
        for msg in &batch.messages {
            if let Err(err) = state.pre.verify_and_add(&committee, msg) {
                debug!(signer = msg.signer, %err, "rejecting randao partial");
            }
        }
        if !state.pre.has_quorum(&committee, &state.randao_root) {
            return Ok(());
        }

        let randao_root = state.randao_root;
        let randao = match reconstruct_valid_signature(
            &state.pre,
            &randao_root,
            &self.share.validator_pubkey,
        )? {
            ReconstructOutcome::Valid(sig) => sig,
            ReconstructOutcome::Invalid { .. } => {
                let bad = verify_each_signature(&state.pre, &committee, &randao_root);
                error!(?bad, "randao reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };

        let slot = state.duty.slot;
        let block = self.base.beacon.produce_block(slot, randao).await?;
        let encoded = block.encode();
        if let Some(state) = &mut self.state {
            state.block = Some(block);
        }
        if !self.base.controller.start_instance(slot, encoded).await {
            return Err(RunnerError::ConsensusNotStarted);
        }
        Ok(())
    }

    /// Consensus decided on a block: threshold-sign it.
    pub async fn on_decided(&mut self, event: DecidedEvent) -> Result<(), RunnerError> {
        let base = self.base.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if state.duty.slot != event.height || state.block_root.is_some() {
            return Ok(());
        }

        let block = BeaconBlock::decode(&event.value)
            .map_err(|e| RunnerError::MalformedDecidedValue(e.to_string()))?;
        metrics()
            .consensus_duration
            .with_label_values(&[&base.role.to_string()])
            .observe(state.started.elapsed().as_secs_f64());

        let domain = base.domain(state.duty.epoch, DOMAIN_PROPOSER).await?;
        let root = compute_signing_root(block.tree_root(), domain);
        state.block_root = Some(root);
        state.block = Some(block);

        let partial = base.sign_partial(
            &state.duty.pubkey,
            state.duty.validator_index,
            root,
        )?;
        let slot = state.duty.slot;
        let batch =
            base.broadcast_partials(PartialSignatureKind::PostConsensus, slot, vec![partial])?;
        self.on_partial_signatures(batch).await
    }

    /// Block-signature quorum: reconstruct and submit the signed block.
    async fn on_post_consensus(
        &mut self,
        batch: PartialSignatureMessages,
    ) -> Result<(), RunnerError> {
        let committee = self.base.cluster_share.committee.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        let Some(root) = state.block_root else {
            return Ok(());
        };
        if batch.slot != state.duty.slot || state.submitted {
            return Ok(());
        }
        for msg in &batch.messages {
            if let Err(err) = state.post.verify_and_add(&committee, msg) {
                debug!(signer = msg.signer, %err, "rejecting block-signature partial");
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
                error!(?bad, "block signature reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };

        let block = state
            .block
            .clone()
            .ok_or(RunnerError::NoRunningDuty)?;
        let slot = state.duty.slot;
        state.submitted = true;

        let submit_start = Instant::now();
        self.base
            .beacon
            .submit_block(SignedBeaconBlock {
                message: block,
                signature,
            })
            .await?;
        metrics()
            .submission_duration
            .with_label_values(&[&self.base.role.to_string()])
            .observe(submit_start.elapsed().as_secs_f64());
        info!(slot, "submitted signed block");
        Ok(())
    }
}
