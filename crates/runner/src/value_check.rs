//! Proposed-value checks.

use dv_qbft::ValueCheck;
use dv_types::{AttestationData, BeaconVote, Slot};
use std::sync::Arc;

/// Slashing-protection oracle. Policy lives outside this crate; runners
/// only honor the verdict.
pub trait SlashingOracle: Send + Sync {
    /// Would signing this attestation data be slashable for our validators?
    fn is_slashable_attestation(&self, data: &AttestationData) -> bool;
    /// Would proposing at this slot be slashable?
    fn is_slashable_proposal(&self, slot: Slot) -> bool;
}

/// Oracle that never objects. Used in tests and for setups that delegate
/// slashing protection to the signer.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveSlashingOracle;

impl SlashingOracle for PermissiveSlashingOracle {
    fn is_slashable_attestation(&self, _data: &AttestationData) -> bool {
        false
    }

    fn is_slashable_proposal(&self, _slot: Slot) -> bool {
        false
    }
}

/// Value check for committee consensus: the value must decode to a beacon
/// vote whose checkpoints pass the slashing oracle for the duty slot (the
/// instance height). The committee index is a local tag and irrelevant to
/// slashing, so zero is used.
pub fn beacon_vote_value_check(oracle: Arc<dyn SlashingOracle>) -> ValueCheck {
    Arc::new(move |height, value: &[u8]| {
        let vote = BeaconVote::decode(value).map_err(|e| format!("undecodable beacon vote: {e}"))?;
        if vote.source.epoch >= vote.target.epoch {
            return Err("source epoch not below target epoch".to_string());
        }
        let data = AttestationData {
            slot: height,
            index: 0,
            beacon_block_root: vote.block_root,
            source: vote.source,
            target: vote.target,
        };
        if oracle.is_slashable_attestation(&data) {
            return Err("slashable attestation data".to_string());
        }
        Ok(())
    })
}

/// Value check for proposer consensus: a decodable block at the instance
/// height that the slashing oracle does not object to.
pub fn beacon_block_value_check(oracle: Arc<dyn SlashingOracle>) -> ValueCheck {
    Arc::new(move |height, value: &[u8]| {
        let block = dv_types::BeaconBlock::decode(value)
            .map_err(|e| format!("undecodable block: {e}"))?;
        if block.slot != height {
            return Err("block slot does not match duty slot".to_string());
        }
        if oracle.is_slashable_proposal(block.slot) {
            return Err("slashable proposal".to_string());
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::{Checkpoint, Hash};

    fn vote(source_epoch: u64, target_epoch: u64) -> BeaconVote {
        BeaconVote {
            block_root: Hash::digest(b"head"),
            source: Checkpoint {
                epoch: source_epoch,
                root: Hash::digest(b"source"),
            },
            target: Checkpoint {
                epoch: target_epoch,
                root: Hash::digest(b"target"),
            },
        }
    }

    #[test]
    fn accepts_well_formed_vote() {
        let check = beacon_vote_value_check(Arc::new(PermissiveSlashingOracle));
        assert!(check(320, &vote(9, 10).encode()).is_ok());
    }

    #[test]
    fn rejects_garbage_and_bad_checkpoint_order() {
        let check = beacon_vote_value_check(Arc::new(PermissiveSlashingOracle));
        assert!(check(320, b"not json").is_err());
        assert!(check(320, &vote(10, 10).encode()).is_err());
    }

    #[test]
    fn honors_slashing_oracle() {
        struct AlwaysSlashable;
        impl SlashingOracle for AlwaysSlashable {
            fn is_slashable_attestation(&self, _: &AttestationData) -> bool {
                true
            }
            fn is_slashable_proposal(&self, _: Slot) -> bool {
                true
            }
        }
        let check = beacon_vote_value_check(Arc::new(AlwaysSlashable));
        assert!(check(320, &vote(9, 10).encode()).is_err());
    }
}
