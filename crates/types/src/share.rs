//! Operator committees and validator key shares.

use crate::bls::BlsPublicKey;
use crate::hash::Hash;
use crate::identifiers::{OperatorId, ValidatorIndex};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// A registered operator: identifier plus its long-term registry key
/// (RSA or secp256k1, opaque to the duty pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: OperatorId,
    pub public_key: Vec<u8>,
}

/// One member of a cluster committee: the operator and the public key of its
/// partial share for the cluster's validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub operator_id: OperatorId,
    pub share_pubkey: BlsPublicKey,
}

/// An ordered set of operators of size `n = 3f + 1` with threshold
/// `t = 2f + 1`. Members are kept sorted by operator id; the order defines
/// leader rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    members: Vec<CommitteeMember>,
}

impl Committee {
    pub fn new(mut members: Vec<CommitteeMember>) -> Self {
        members.sort_by_key(|m| m.operator_id);
        members.dedup_by_key(|m| m.operator_id);
        Committee { members }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// Maximum number of Byzantine operators tolerated.
    pub fn f(&self) -> usize {
        (self.size().saturating_sub(1)) / 3
    }

    /// Signers needed for a quorum (2f + 1).
    pub fn quorum_threshold(&self) -> usize {
        2 * self.f() + 1
    }

    /// Signers needed for a partial (round-change fast-forward) quorum (f + 1).
    pub fn partial_quorum_threshold(&self) -> usize {
        self.f() + 1
    }

    /// Quorum predicate: `count * 3 >= size * 2`.
    pub fn has_quorum(&self, count: usize) -> bool {
        count * 3 >= self.size() * 2
    }

    pub fn has_partial_quorum(&self, count: usize) -> bool {
        count >= self.partial_quorum_threshold()
    }

    pub fn members(&self) -> &[CommitteeMember] {
        &self.members
    }

    pub fn operator_ids(&self) -> Vec<OperatorId> {
        self.members.iter().map(|m| m.operator_id).collect()
    }

    pub fn member(&self, id: OperatorId) -> Option<&CommitteeMember> {
        self.members.iter().find(|m| m.operator_id == id)
    }

    pub fn contains(&self, id: OperatorId) -> bool {
        self.member(id).is_some()
    }

    /// Member at the given rotation position.
    pub fn member_at(&self, position: usize) -> &CommitteeMember {
        &self.members[position % self.members.len()]
    }

    /// Cluster identifier: hash over the ordered operator ids.
    pub fn cluster_id(&self) -> Hash {
        let mut bytes = Vec::with_capacity(self.members.len() * 8);
        for m in &self.members {
            bytes.extend_from_slice(&m.operator_id.to_be_bytes());
        }
        Hash::digest(&bytes)
    }
}

/// Per-validator record tying a validator key to its operator committee.
/// Shares are never mutated in place; a replacement share supersedes the old
/// one atomically in the [`ValidatorStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub validator_pubkey: BlsPublicKey,
    pub validator_index: ValidatorIndex,
    pub committee: Committee,
    /// The operator this node runs as.
    pub operator_id: OperatorId,
    pub cluster_id: Hash,
}

impl Share {
    pub fn new(
        validator_pubkey: BlsPublicKey,
        validator_index: ValidatorIndex,
        committee: Committee,
        operator_id: OperatorId,
    ) -> Self {
        let cluster_id = committee.cluster_id();
        Share {
            validator_pubkey,
            validator_index,
            committee,
            operator_id,
            cluster_id,
        }
    }
}

/// Maps validator public keys to their shares. Reads dominate; shares are
/// shared-immutable behind `Arc` and replaced wholesale on registry updates.
#[derive(Debug, Default)]
pub struct ValidatorStore {
    by_pubkey: RwLock<HashMap<BlsPublicKey, Arc<Share>>>,
}

impl ValidatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pubkey: &BlsPublicKey) -> Option<Arc<Share>> {
        self.by_pubkey.read().get(pubkey).cloned()
    }

    pub fn get_by_index(&self, index: ValidatorIndex) -> Option<Arc<Share>> {
        self.by_pubkey
            .read()
            .values()
            .find(|s| s.validator_index == index)
            .cloned()
    }

    /// Insert or replace a share. The previous share (if any) is returned so
    /// callers can observe supersession.
    pub fn insert(&self, share: Share) -> Option<Arc<Share>> {
        self.by_pubkey
            .write()
            .insert(share.validator_pubkey, Arc::new(share))
    }

    pub fn remove(&self, pubkey: &BlsPublicKey) -> Option<Arc<Share>> {
        self.by_pubkey.write().remove(pubkey)
    }

    /// Indices of every known validator, for duty fetches.
    pub fn validator_indices(&self) -> Vec<ValidatorIndex> {
        let mut indices: Vec<_> = self
            .by_pubkey
            .read()
            .values()
            .map(|s| s.validator_index)
            .collect();
        indices.sort_unstable();
        indices
    }

    pub fn all(&self) -> Vec<Arc<Share>> {
        self.by_pubkey.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_pubkey.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pubkey.read().is_empty()
    }
}
