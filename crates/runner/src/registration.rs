//! Validator-registration runner. No consensus round: the registration is
//! deterministic from configuration, so operators threshold-sign it
//! directly and submit on quorum.

use crate::base::RunnerBase;
use crate::error::RunnerError;
use crate::partial_container::PartialSigContainer;
use crate::reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
use dv_types::{
    compute_signing_root, Duty, Hash, PartialSignatureKind, PartialSignatureMessages, Share,
    SignedValidatorRegistration, ValidatorRegistration, DOMAIN_APPLICATION_BUILDER,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

const DEFAULT_GAS_LIMIT: u64 = 30_000_000;

struct RegistrationState {
    duty: Duty,
    registration: ValidatorRegistration,
    root: Hash,
    partials: PartialSigContainer,
    submitted: bool,
}

/// Threshold-signs and submits builder registrations.
pub struct ValidatorRegistrationRunner {
    base: RunnerBase,
    share: Arc<Share>,
    fee_recipient: [u8; 20],
    state: Option<RegistrationState>,
}

impl ValidatorRegistrationRunner {
    pub fn new(base: RunnerBase, share: Arc<Share>, fee_recipient: [u8; 20]) -> Self {
        ValidatorRegistrationRunner {
            base,
            share,
            fee_recipient,
            state: None,
        }
    }

    pub async fn execute_duty(&mut self, duty: Duty) -> Result<(), RunnerError> {
        let timestamp = self.base.network_config.genesis_time
            + duty.slot * self.base.network_config.slot_duration.as_secs();
        let registration = ValidatorRegistration {
            fee_recipient: self.fee_recipient,
            gas_limit: DEFAULT_GAS_LIMIT,
            timestamp,
            pubkey: duty.pubkey,
        };
        let domain = self
            .base
            .domain(duty.epoch, DOMAIN_APPLICATION_BUILDER)
            .await?;
        let root = compute_signing_root(registration.tree_root(), domain);
        let partial = self
            .base
            .sign_partial(&duty.pubkey, duty.validator_index, root)?;

        debug!(slot = duty.slot, validator = duty.validator_index, "starting registration duty");
        let slot = duty.slot;
        self.state = Some(RegistrationState {
            duty,
            registration,
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
                debug!(signer = msg.signer, %err, "rejecting registration partial");
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
                error!(?bad, "registration reconstruction failed");
                return Err(RunnerError::ReconstructionFailed { bad_shares: bad });
            }
        };

        let message = state.registration.clone();
        let slot = state.duty.slot;
        state.submitted = true;

        let start = Instant::now();
        self.base
            .beacon
            .submit_registrations(vec![SignedValidatorRegistration { message, signature }])
            .await?;
        info!(slot, elapsed = ?start.elapsed(), "submitted validator registration");
        Ok(())
    }
}
