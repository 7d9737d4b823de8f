//! Identifier types shared across the node.

use crate::duty::BeaconRole;
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use std::fmt;

/// Operator identifier assigned by the registry. Always positive.
pub type OperatorId = u64;

/// Index of a validator on the beacon chain.
pub type ValidatorIndex = u64;

/// Beacon-chain slot (12 seconds on mainnet).
pub type Slot = u64;

/// Beacon-chain epoch (32 slots on mainnet).
pub type Epoch = u64;

/// QBFT instance height. For duty consensus, the height is the duty slot.
pub type Height = u64;

/// QBFT round within an instance. Rounds start at 1.
pub type Round = u64;

/// Index of an attestation committee within a slot.
pub type CommitteeIndex = u64;

/// Identifies a consensus stream: which cluster and role a message belongs to.
///
/// Layout: domain type (4 bytes) | role (4 bytes, big-endian) | cluster id
/// (32 bytes) | reserved (16 bytes, zero).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(#[serde(with = "BigArray")] pub [u8; 56]);

impl MessageId {
    pub const SIZE: usize = 56;

    /// Build a message id for a cluster/role pair under the given domain.
    pub fn new(domain_type: [u8; 4], role: BeaconRole, cluster_id: Hash) -> Self {
        let mut id = [0u8; Self::SIZE];
        id[0..4].copy_from_slice(&domain_type);
        id[4..8].copy_from_slice(&(role as u32).to_be_bytes());
        id[8..40].copy_from_slice(cluster_id.as_bytes());
        MessageId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 56] {
        &self.0
    }

    /// The cluster id embedded in this message id.
    pub fn cluster_id(&self) -> Hash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[8..40]);
        Hash(out)
    }

    /// The role embedded in this message id.
    pub fn role(&self) -> Option<BeaconRole> {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.0[4..8]);
        BeaconRole::from_u32(u32::from_be_bytes(word))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_embeds_cluster() {
        let cluster = Hash::digest(b"cluster");
        let id = MessageId::new([0, 0, 0x30, 0x1], BeaconRole::Attester, cluster);
        assert_eq!(id.cluster_id(), cluster);
    }

    #[test]
    fn message_id_differs_by_role() {
        let cluster = Hash::digest(b"cluster");
        let a = MessageId::new([0, 0, 0x30, 0x1], BeaconRole::Attester, cluster);
        let b = MessageId::new([0, 0, 0x30, 0x1], BeaconRole::Proposer, cluster);
        assert_ne!(a, b);
    }
}
