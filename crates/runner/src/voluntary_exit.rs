//! Voluntary-exit runner. Like registration, the exit message is
//! deterministic, so there is no consensus round: threshold-sign, submit.

use crate::base::RunnerBase;
use crate::error::RunnerError;
use crate::partial_container::PartialSigContainer;
use crate::reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
use dv_types::{
    compute_signing_root, Duty, Hash, PartialSignatureKind, PartialSignatureMessages, Share,
    SignedVoluntaryExit, VoluntaryExit, DOMAIN_VOLUNTARY_EXIT,
};
use std::sync::Arc;
use tracing::{debug, error, info};

struct ExitState {
    duty: Duty,
    exit: VoluntaryExit,
    root: Hash,
    partials: PartialSigContainer,
    submitted: bool,
}

/// Threshold-signs and submits voluntary exits.
pub struct VoluntaryExitRunner {
    base: RunnerBase,
    share: Arc<Share>,
    state: Option<ExitState>,
}

impl VoluntaryExitRunner {
    pub fn new(base: RunnerBase, share: Arc<Share>) -> Self {
        VoluntaryExitRunner {
            base,
            share,
            state: None,
        }
    }

    pub async fn execute_duty(&mut self, duty: Duty) -> Result<(), RunnerError> {
        let exit = VoluntaryExit {
            epoch: duty.epoch,
            validator_index: duty.validator_index,
        };
        let domain = self.base.domain(duty.epoch, DOMAIN_VOLUNTARY_EXIT).await?;
        let root = compute_signing_root(exit.tree_root(), domain);
        let partial = self
            .base
            .sign_partial(&duty.pubkey, duty.validator_index, root)?;

        info!(
            validator = duty.validator_index,
            epoch = duty.epoch,
            "starting voluntary-exit duty"
        );
        let slot = duty.slot;
        self.state = Some(ExitState {
            duty,
            exit,
            root,
            partials: PartialSigContainer::new(),
            submitted: false,
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
        let committee = self.base.cluster_share.committee.clone();
        let state = self.state.as_mut().ok_or(RunnerError::NoRunningDuty)?;
        if batch.kind != PartialSignatureKind::PreConsensus
            || batch.slot != state.duty.slot
            || state.submitted
        {
            return Ok(());
        }
        for msg in &batch.messages {
            if let Err(err) = state.partials.verify_and_add(&committee, msg) {
                debug!(signer = msg.signer, %err, "rejecting exit partial");
            }
        }
        if !state.partials.has_quorum(&committee, &state.root) {
            return Ok(());
        }

        let root = state.root;
        let signature = match reconstruct_valid_signature(
            &state.partials,
            &root,
            &self.share.validator_pubkey,
        )? {
            ReconstructOutcome::Valid(sig) => sig,
            ReconstructOutcome::Invalid { .. } => {
                let bad = verify_each_signature(&state.partials, &committee, &root);
                error!(?bad, "exit reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };

        let message = state.exit.clone();
        let validator = state.duty.validator_index;
        state.submitted = true;

        self.base
            .beacon
            .submit_voluntary_exit(SignedVoluntaryExit { message, signature })
            .await?;
        info!(validator, "submitted voluntary exit");
        Ok(())
    }
}
