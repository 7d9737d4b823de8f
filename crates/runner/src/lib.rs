//! Per-role duty runners.
//!
//! A runner orchestrates the signing rounds of one role: optional
//! pre-consensus partial signing (randao, selection proofs), consensus on
//! the agreed value through the QBFT controller, post-consensus partial
//! signing over the decided beacon objects, threshold reconstruction, and
//! bulk submission to the beacon node.

mod aggregator;
mod base;
mod committee;
mod error;
mod metrics;
mod partial_container;
mod proposer;
mod reconstruct;
mod registration;
mod signer;
mod sync_contribution;
mod value_check;
mod voluntary_exit;

pub use aggregator::AggregatorRunner;
pub use base::RunnerBase;
pub use committee::CommitteeRunner;
pub use error::RunnerError;
pub use partial_container::PartialSigContainer;
pub use proposer::ProposerRunner;
pub use reconstruct::{reconstruct_valid_signature, verify_each_signature, ReconstructOutcome};
pub use registration::ValidatorRegistrationRunner;
pub use signer::{LocalShareSigner, ShareSigner};
pub use sync_contribution::SyncContributionRunner;
pub use value_check::{
    beacon_block_value_check, beacon_vote_value_check, PermissiveSlashingOracle, SlashingOracle,
};
pub use voluntary_exit::VoluntaryExitRunner;
