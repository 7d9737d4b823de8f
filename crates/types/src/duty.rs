//! Beacon duties and the committee consensus unit.

use crate::bls::BlsPublicKey;
use crate::identifiers::{CommitteeIndex, Epoch, Slot, ValidatorIndex};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a duty obliges a validator to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum BeaconRole {
    Attester = 0,
    Proposer = 1,
    Aggregator = 2,
    SyncCommittee = 3,
    SyncCommitteeContribution = 4,
    ValidatorRegistration = 5,
    VoluntaryExit = 6,
}

impl BeaconRole {
    /// Inverse of the `as u32` cast used in message identifiers.
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => BeaconRole::Attester,
            1 => BeaconRole::Proposer,
            2 => BeaconRole::Aggregator,
            3 => BeaconRole::SyncCommittee,
            4 => BeaconRole::SyncCommitteeContribution,
            5 => BeaconRole::ValidatorRegistration,
            6 => BeaconRole::VoluntaryExit,
            _ => return None,
        })
    }
}

impl fmt::Display for BeaconRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BeaconRole::Attester => "ATTESTER",
            BeaconRole::Proposer => "PROPOSER",
            BeaconRole::Aggregator => "AGGREGATOR",
            BeaconRole::SyncCommittee => "SYNC_COMMITTEE",
            BeaconRole::SyncCommitteeContribution => "SYNC_COMMITTEE_CONTRIBUTION",
            BeaconRole::ValidatorRegistration => "VALIDATOR_REGISTRATION",
            BeaconRole::VoluntaryExit => "VOLUNTARY_EXIT",
        };
        write!(f, "{s}")
    }
}

/// One validator's obligation at one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duty {
    pub role: BeaconRole,
    pub slot: Slot,
    pub epoch: Epoch,
    pub validator_index: ValidatorIndex,
    /// Which attestation committee within the slot.
    pub committee_index: CommitteeIndex,
    /// Number of validators in the attestation committee.
    pub committee_length: u64,
    /// This validator's position within the committee (aggregation bit).
    pub committee_position: u64,
    pub pubkey: BlsPublicKey,
    /// Set when the validator was removed/exited mid-flight; stopped duties
    /// are skipped at signing time but kept in the batch.
    pub stopped: bool,
}

impl Duty {
    pub fn slot(&self) -> Slot {
        self.slot
    }
}

/// Several attester and sync-committee duties sharing one slot for the same
/// operator committee. This is the consensus unit: one QBFT instance decides
/// one beacon vote for the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeDuty {
    pub slot: Slot,
    pub duties: Vec<Duty>,
}

impl CommitteeDuty {
    pub fn new(slot: Slot) -> Self {
        CommitteeDuty {
            slot,
            duties: Vec::new(),
        }
    }

    /// Active (non-stopped) duties in the batch.
    pub fn active(&self) -> impl Iterator<Item = &Duty> {
        self.duties.iter().filter(|d| !d.stopped)
    }

    /// Mark every duty for the given validator as stopped.
    pub fn stop_validator(&mut self, pubkey: &BlsPublicKey) {
        for duty in &mut self.duties {
            if &duty.pubkey == pubkey {
                duty.stopped = true;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.duties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::BlsSecretKey;

    fn duty(role: BeaconRole, pubkey: BlsPublicKey) -> Duty {
        Duty {
            role,
            slot: 100,
            epoch: 3,
            validator_index: 7,
            committee_index: 2,
            committee_length: 128,
            committee_position: 5,
            pubkey,
            stopped: false,
        }
    }

    #[test]
    fn stop_validator_marks_all_roles() {
        let pk = BlsSecretKey::generate().unwrap().public_key();
        let other = BlsSecretKey::generate().unwrap().public_key();
        let mut batch = CommitteeDuty::new(100);
        batch.duties.push(duty(BeaconRole::Attester, pk));
        batch.duties.push(duty(BeaconRole::SyncCommittee, pk));
        batch.duties.push(duty(BeaconRole::Attester, other));

        batch.stop_validator(&pk);
        assert_eq!(batch.active().count(), 1);
        assert_eq!(batch.active().next().unwrap().pubkey, other);
    }
}
