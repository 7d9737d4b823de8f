//! Core types for the distributed validator node.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Primitives**: hashes, BLS threshold keys and signatures
//! - **Identifiers**: operator ids, validator indices, slots, rounds, heights
//! - **Consensus types**: QBFT messages, signed-message aggregation
//! - **Duty types**: beacon duties, committee duties, beacon votes
//! - **Registry types**: committees, validator shares
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod beacon;
mod bls;
mod config;
mod duty;
mod hash;
mod identifiers;
mod message;
mod network;
mod partial_sig;
mod share;

pub use beacon::{
    compute_signing_root, uint_tree_root, AggregateAndProof, AggregationBits, Attestation,
    AttestationData,
    BeaconBlock, BeaconVote, Checkpoint, ContributionAndProof, Domain, DomainType,
    SignedAggregateAndProof, SignedBeaconBlock, SignedContributionAndProof,
    SignedValidatorRegistration, SignedVoluntaryExit, SyncCommitteeContribution,
    SyncCommitteeMessage, ValidatorRegistration, VoluntaryExit, DOMAIN_AGGREGATE_AND_PROOF,
    DOMAIN_APPLICATION_BUILDER, DOMAIN_ATTESTER, DOMAIN_CONTRIBUTION_AND_PROOF, DOMAIN_PROPOSER,
    DOMAIN_RANDAO, DOMAIN_SELECTION_PROOF, DOMAIN_SYNC_COMMITTEE,
    DOMAIN_SYNC_COMMITTEE_SELECTION_PROOF, DOMAIN_VOLUNTARY_EXIT,
};
pub use bls::{reconstruct_signature, BlsError, BlsPublicKey, BlsSecretKey, BlsSignature};
pub use config::NetworkConfig;
pub use duty::{BeaconRole, CommitteeDuty, Duty};
pub use hash::{Hash, HexError};
pub use identifiers::{
    CommitteeIndex, Epoch, Height, MessageId, OperatorId, Round, Slot, ValidatorIndex,
};
pub use message::{MessageError, MessageKind, QbftMessage, SignedQbftMessage, WireMessage};
pub use network::{topic_for, Network, NetworkError, PeerId};
pub use partial_sig::{PartialSignatureKind, PartialSignatureMessage, PartialSignatureMessages};
pub use share::{Committee, CommitteeMember, Operator, Share, ValidatorStore};

/// Test utilities: deterministic committees and threshold key shares.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
