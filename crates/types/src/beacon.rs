//! Beacon-chain data objects the runners sign and submit.
//!
//! These mirror the consensus-spec containers closely enough for signing-root
//! computation and submission; fields the duty pipeline never touches are
//! omitted.

use crate::bls::{BlsPublicKey, BlsSignature};
use crate::duty::Duty;
use crate::hash::Hash;
use crate::identifiers::{CommitteeIndex, Epoch, Slot, ValidatorIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 4-byte tag separating signatures by role and fork.
pub type DomainType = [u8; 4];

/// Full 32-byte signing domain (domain type || fork digest).
pub type Domain = [u8; 32];

pub const DOMAIN_ATTESTER: DomainType = [1, 0, 0, 0];
pub const DOMAIN_PROPOSER: DomainType = [0, 0, 0, 0];
pub const DOMAIN_RANDAO: DomainType = [2, 0, 0, 0];
pub const DOMAIN_SELECTION_PROOF: DomainType = [5, 0, 0, 0];
pub const DOMAIN_AGGREGATE_AND_PROOF: DomainType = [6, 0, 0, 0];
pub const DOMAIN_SYNC_COMMITTEE: DomainType = [7, 0, 0, 0];
pub const DOMAIN_SYNC_COMMITTEE_SELECTION_PROOF: DomainType = [8, 0, 0, 0];
pub const DOMAIN_CONTRIBUTION_AND_PROOF: DomainType = [9, 0, 0, 0];
pub const DOMAIN_VOLUNTARY_EXIT: DomainType = [4, 0, 0, 0];
pub const DOMAIN_APPLICATION_BUILDER: DomainType = [0, 0, 0, 1];

/// Mix a domain into an object root: `sha256(object_root || domain)`.
pub fn compute_signing_root(object_root: Hash, domain: Domain) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(object_root.as_bytes());
    hasher.update(domain);
    Hash(hasher.finalize().into())
}

/// Tree root of a bare unsigned integer (epoch for randao, slot for
/// selection proofs): the value little-endian in the first eight bytes of a
/// zeroed word.
pub fn uint_tree_root(value: u64) -> Hash {
    let mut root = [0u8; 32];
    root[..8].copy_from_slice(&value.to_le_bytes());
    Hash(root)
}

/// Source/target checkpoint of an attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Hash,
}

/// The data every member of an attestation committee signs.
///
/// The beacon node returns identical data for every committee at a given
/// slot; `index` is a local tag the caller overwrites.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: CommitteeIndex,
    pub beacon_block_root: Hash,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

impl AttestationData {
    /// Deterministic object root over the JSON encoding.
    pub fn tree_root(&self) -> Hash {
        // Struct field order is fixed, so the encoding is canonical.
        Hash::digest(&serde_json::to_vec(self).expect("attestation data serializes"))
    }
}

/// Bitlist marking which committee members an attestation covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationBits {
    bits: Vec<u8>,
    len: u64,
}

impl AggregationBits {
    pub fn new(len: u64) -> Self {
        AggregationBits {
            bits: vec![0u8; len.div_ceil(8) as usize],
            len,
        }
    }

    pub fn set(&mut self, index: u64) {
        if index < self.len {
            self.bits[(index / 8) as usize] |= 1 << (index % 8);
        }
    }

    pub fn is_set(&self, index: u64) -> bool {
        index < self.len && self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A signed attestation ready for submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub aggregation_bits: AggregationBits,
    pub data: AttestationData,
    pub signature: BlsSignature,
}

/// A sync-committee vote for the head block root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitteeMessage {
    pub slot: Slot,
    pub beacon_block_root: Hash,
    pub validator_index: ValidatorIndex,
    pub signature: BlsSignature,
}

/// The committee-agreed value: one vote subsuming every attestation and
/// sync-committee commitment for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconVote {
    pub block_root: Hash,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

impl BeaconVote {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("beacon vote serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Expand the vote into attestation data for one attester duty.
    pub fn attestation_data(&self, duty: &Duty) -> AttestationData {
        AttestationData {
            slot: duty.slot,
            index: duty.committee_index,
            beacon_block_root: self.block_root,
            source: self.source,
            target: self.target,
        }
    }
}

/// Simplified beacon block header fields the proposer pipeline signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Hash,
    pub state_root: Hash,
    pub body_root: Hash,
}

impl BeaconBlock {
    pub fn tree_root(&self) -> Hash {
        Hash::digest(&serde_json::to_vec(self).expect("beacon block serializes"))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("beacon block serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
    pub signature: BlsSignature,
}

/// An aggregated attestation plus the proof the sender was selected to
/// aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateAndProof {
    pub aggregator_index: ValidatorIndex,
    pub aggregate: Attestation,
    pub selection_proof: BlsSignature,
}

impl AggregateAndProof {
    pub fn tree_root(&self) -> Hash {
        Hash::digest(&serde_json::to_vec(self).expect("aggregate and proof serializes"))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("aggregate and proof serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAggregateAndProof {
    pub message: AggregateAndProof,
    pub signature: BlsSignature,
}

/// A sync-committee contribution over one subcommittee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitteeContribution {
    pub slot: Slot,
    pub beacon_block_root: Hash,
    pub subcommittee_index: u64,
    pub aggregation_bits: AggregationBits,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionAndProof {
    pub aggregator_index: ValidatorIndex,
    pub contribution: SyncCommitteeContribution,
    pub selection_proof: BlsSignature,
}

impl ContributionAndProof {
    pub fn tree_root(&self) -> Hash {
        Hash::digest(&serde_json::to_vec(self).expect("contribution and proof serializes"))
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("contribution and proof serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedContributionAndProof {
    pub message: ContributionAndProof,
    pub signature: BlsSignature,
}

/// Registration of a validator's fee recipient with builders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRegistration {
    pub fee_recipient: [u8; 20],
    pub gas_limit: u64,
    pub timestamp: u64,
    pub pubkey: BlsPublicKey,
}

impl ValidatorRegistration {
    pub fn tree_root(&self) -> Hash {
        Hash::digest(&serde_json::to_vec(self).expect("registration serializes"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedValidatorRegistration {
    pub message: ValidatorRegistration,
    pub signature: BlsSignature,
}

/// A voluntary exit request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoluntaryExit {
    pub epoch: Epoch,
    pub validator_index: ValidatorIndex,
}

impl VoluntaryExit {
    pub fn tree_root(&self) -> Hash {
        Hash::digest(&serde_json::to_vec(self).expect("voluntary exit serializes"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    pub signature: BlsSignature,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::duty::BeaconRole;
    use crate::test_utils::test_pubkey;

    #[test]
    fn beacon_vote_codec_round_trip() {
        let vote = BeaconVote {
            block_root: Hash::digest(b"head"),
            source: Checkpoint {
                epoch: 9,
                root: Hash::digest(b"source"),
            },
            target: Checkpoint {
                epoch: 10,
                root: Hash::digest(b"target"),
            },
        };
        assert_eq!(BeaconVote::decode(&vote.encode()).unwrap(), vote);
    }

    #[test]
    fn vote_expands_with_duty_committee_index() {
        let vote = BeaconVote {
            block_root: Hash::digest(b"head"),
            source: Checkpoint::default(),
            target: Checkpoint::default(),
        };
        let duty = Duty {
            role: BeaconRole::Attester,
            slot: 320,
            epoch: 10,
            validator_index: 1,
            committee_index: 42,
            committee_length: 64,
            committee_position: 0,
            pubkey: test_pubkey(),
            stopped: false,
        };
        let data = vote.attestation_data(&duty);
        assert_eq!(data.slot, 320);
        assert_eq!(data.index, 42);
        assert_eq!(data.beacon_block_root, vote.block_root);
    }

    #[test]
    fn aggregation_bits_set_and_query() {
        let mut bits = AggregationBits::new(12);
        bits.set(0);
        bits.set(11);
        assert!(bits.is_set(0));
        assert!(bits.is_set(11));
        assert!(!bits.is_set(5));
        // Out-of-range sets are ignored.
        bits.set(64);
        assert!(!bits.is_set(64));
    }

    #[test]
    fn signing_root_depends_on_domain() {
        let root = Hash::digest(b"object");
        let a = compute_signing_root(root, [0u8; 32]);
        let mut domain = [0u8; 32];
        domain[..4].copy_from_slice(&DOMAIN_ATTESTER);
        let b = compute_signing_root(root, domain);
        assert_ne!(a, b);
    }
}
