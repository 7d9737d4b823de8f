//! Beacon-node boundary.
//!
//! The [`BeaconClient`] trait is the injected contract to the consensus
//! client; the [`AttestationDataCache`] sits in front of it so that many
//! concurrent duty runners share a single `attestation_data` request per
//! slot.

mod attestation_cache;
mod client;
mod retry;

pub use attestation_cache::AttestationDataCache;
pub use client::{
    AttesterDutyInfo, BeaconClient, BeaconError, BeaconEvent, ProposerDutyInfo, SyncDutyInfo,
};
pub use retry::{retry_with_backoff, RetryPolicy};
