//! Shared runner plumbing.

use crate::error::RunnerError;
use crate::signer::ShareSigner;
use dv_beacon::BeaconClient;
use dv_qbft::ControllerHandle;
use dv_types::{
    topic_for, BeaconRole, BlsPublicKey, Domain, DomainType, Epoch, Hash, MessageId, Network,
    NetworkConfig, PartialSignatureKind, PartialSignatureMessage, PartialSignatureMessages, Share,
    Slot, ValidatorIndex, WireMessage,
};
use std::sync::Arc;

/// Dependencies every role runner carries.
#[derive(Clone)]
pub struct RunnerBase {
    pub role: BeaconRole,
    pub network_config: NetworkConfig,
    /// Identifier of this runner's consensus stream (cluster × role).
    pub message_id: MessageId,
    /// Cluster membership as seen by this operator.
    pub cluster_share: Arc<Share>,
    pub signer: Arc<dyn ShareSigner>,
    pub network: Arc<dyn Network>,
    pub beacon: Arc<dyn BeaconClient>,
    pub controller: ControllerHandle,
}

impl RunnerBase {
    pub fn operator_id(&self) -> u64 {
        self.cluster_share.operator_id
    }

    /// Sign `root` with the share key for one validator, producing a partial
    /// signature message ready for broadcast.
    pub fn sign_partial(
        &self,
        validator_pubkey: &BlsPublicKey,
        validator_index: ValidatorIndex,
        root: Hash,
    ) -> Result<PartialSignatureMessage, RunnerError> {
        let partial_signature = self
            .signer
            .sign(validator_pubkey, &root)
            .ok_or(RunnerError::UnknownValidator(validator_index))?;
        Ok(PartialSignatureMessage {
            partial_signature,
            signing_root: root,
            signer: self.operator_id(),
            validator_index,
        })
    }

    /// Broadcast a batch of partial signatures on the cluster topic and
    /// return the batch for local processing (gossip loopback is not
    /// guaranteed by the transport contract).
    pub fn broadcast_partials(
        &self,
        kind: PartialSignatureKind,
        slot: Slot,
        messages: Vec<PartialSignatureMessage>,
    ) -> Result<PartialSignatureMessages, RunnerError> {
        let batch = PartialSignatureMessages {
            kind,
            slot,
            messages,
        };
        let wire = WireMessage::PartialSignatures(batch.clone());
        self.network
            .broadcast(&topic_for(&self.message_id), wire.encode())
            .map_err(|e| RunnerError::Network(e.to_string()))?;
        Ok(batch)
    }

    /// Signing domain for an epoch and domain type, from the beacon node.
    pub async fn domain(&self, epoch: Epoch, domain_type: DomainType) -> Result<Domain, RunnerError> {
        Ok(self.beacon.domain_data(epoch, domain_type).await?)
    }
}
