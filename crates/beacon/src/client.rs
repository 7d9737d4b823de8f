//! The injected beacon-node client contract.

use async_trait::async_trait;
use dv_types::{
    Attestation, AttestationData, BeaconBlock, BlsPublicKey, BlsSignature, Domain, DomainType,
    Epoch, Hash, SignedAggregateAndProof, SignedBeaconBlock, SignedContributionAndProof,
    SignedValidatorRegistration, SignedVoluntaryExit, Slot, SyncCommitteeContribution,
    SyncCommitteeMessage, ValidatorIndex,
};
use tokio::sync::mpsc;

/// Errors surfaced by the beacon client.
#[derive(Debug, thiserror::Error)]
pub enum BeaconError {
    /// The node was unreachable or answered 5xx; retried with backoff.
    #[error("beacon node unavailable: {0}")]
    Unavailable(String),
    /// The request itself was rejected; retrying will not help.
    #[error("beacon request rejected: {0}")]
    Rejected(String),
    /// The response could not be interpreted.
    #[error("malformed beacon response: {0}")]
    Malformed(String),
}

impl BeaconError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BeaconError::Unavailable(_))
    }
}

/// An attester duty as returned by the beacon node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttesterDutyInfo {
    pub pubkey: BlsPublicKey,
    pub validator_index: ValidatorIndex,
    pub slot: Slot,
    pub committee_index: u64,
    pub committee_length: u64,
    pub validator_committee_index: u64,
}

/// A proposer duty as returned by the beacon node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerDutyInfo {
    pub pubkey: BlsPublicKey,
    pub validator_index: ValidatorIndex,
    pub slot: Slot,
}

/// A sync-committee duty as returned by the beacon node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncDutyInfo {
    pub pubkey: BlsPublicKey,
    pub validator_index: ValidatorIndex,
    pub sync_committee_indices: Vec<u64>,
}

/// Chain events the scheduler reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeaconEvent {
    /// The head reorganized; duties for the affected epoch are suspect.
    HeadReorg { slot: Slot, epoch: Epoch },
    /// A checkpoint finalized; older duty-store epochs can be evicted.
    FinalizedCheckpoint { epoch: Epoch },
}

/// Beacon-node operations the duty pipeline needs.
///
/// Implementations wrap the HTTP API; every call carries the configured
/// request timeout (5 s default).
#[async_trait]
pub trait BeaconClient: Send + Sync {
    async fn attester_duties(
        &self,
        epoch: Epoch,
        indices: &[ValidatorIndex],
    ) -> Result<Vec<AttesterDutyInfo>, BeaconError>;

    async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerDutyInfo>, BeaconError>;

    async fn sync_committee_duties(
        &self,
        epoch: Epoch,
        indices: &[ValidatorIndex],
    ) -> Result<Vec<SyncDutyInfo>, BeaconError>;

    /// Attestation data for a slot. The `index` field of the result is
    /// unspecified; callers go through the cache which tags their copy.
    async fn attestation_data(&self, slot: Slot) -> Result<AttestationData, BeaconError>;

    async fn submit_attestations(&self, attestations: Vec<Attestation>)
        -> Result<(), BeaconError>;

    async fn submit_sync_committee_messages(
        &self,
        messages: Vec<SyncCommitteeMessage>,
    ) -> Result<(), BeaconError>;

    /// Signing domain for an epoch and domain type.
    async fn domain_data(&self, epoch: Epoch, domain: DomainType) -> Result<Domain, BeaconError>;

    async fn produce_block(
        &self,
        slot: Slot,
        randao_reveal: BlsSignature,
    ) -> Result<BeaconBlock, BeaconError>;

    async fn submit_block(&self, block: SignedBeaconBlock) -> Result<(), BeaconError>;

    /// The aggregate attestation for a slot and attestation-data root.
    async fn aggregate_attestation(
        &self,
        slot: Slot,
        attestation_data_root: Hash,
    ) -> Result<Attestation, BeaconError>;

    async fn submit_aggregates(
        &self,
        aggregates: Vec<SignedAggregateAndProof>,
    ) -> Result<(), BeaconError>;

    async fn sync_committee_contribution(
        &self,
        slot: Slot,
        subcommittee_index: u64,
        beacon_block_root: Hash,
    ) -> Result<SyncCommitteeContribution, BeaconError>;

    async fn submit_contributions(
        &self,
        contributions: Vec<SignedContributionAndProof>,
    ) -> Result<(), BeaconError>;

    async fn submit_registrations(
        &self,
        registrations: Vec<SignedValidatorRegistration>,
    ) -> Result<(), BeaconError>;

    async fn submit_voluntary_exit(&self, exit: SignedVoluntaryExit) -> Result<(), BeaconError>;

    /// Subscribe to head/finality events. The channel is bounded; slow
    /// consumers lose events rather than stalling the client.
    fn subscribe_events(&self) -> mpsc::Receiver<BeaconEvent>;
}
