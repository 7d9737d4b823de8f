//! Accumulates partial signatures per signing root.

use crate::error::RunnerError;
use dv_types::{BlsSignature, Committee, Hash, OperatorId, PartialSignatureMessage};
use std::collections::{BTreeMap, HashMap};

/// `signing_root → operator → partial signature`. Used for both the
/// pre-consensus and post-consensus rounds.
#[derive(Debug, Default)]
pub struct PartialSigContainer {
    by_root: HashMap<Hash, BTreeMap<OperatorId, BlsSignature>>,
}

impl PartialSigContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify one partial against the signer's share public key and store
    /// it. Re-adding the same (root, signer) pair is a no-op.
    pub fn verify_and_add(
        &mut self,
        committee: &Committee,
        msg: &PartialSignatureMessage,
    ) -> Result<(), RunnerError> {
        let member = committee
            .member(msg.signer)
            .ok_or(RunnerError::NotAuthorized {
                operator: msg.signer,
            })?;
        if !member
            .share_pubkey
            .verify(msg.signing_root.as_bytes(), &msg.partial_signature)
        {
            return Err(RunnerError::InvalidPartialSignature {
                operator: msg.signer,
            });
        }
        self.by_root
            .entry(msg.signing_root)
            .or_default()
            .entry(msg.signer)
            .or_insert(msg.partial_signature);
        Ok(())
    }

    /// Number of distinct operators that signed `root`.
    pub fn count(&self, root: &Hash) -> usize {
        self.by_root.get(root).map(BTreeMap::len).unwrap_or(0)
    }

    /// Quorum when at least `t = 2f + 1` verified partials accumulated.
    pub fn has_quorum(&self, committee: &Committee, root: &Hash) -> bool {
        self.count(root) >= committee.quorum_threshold()
    }

    /// The collected partials for a root, ordered by operator id.
    pub fn partials(&self, root: &Hash) -> Vec<(OperatorId, BlsSignature)> {
        self.by_root
            .get(root)
            .map(|m| m.iter().map(|(op, sig)| (*op, *sig)).collect())
            .unwrap_or_default()
    }

    /// Roots currently holding at least one partial.
    pub fn roots(&self) -> Vec<Hash> {
        self.by_root.keys().copied().collect()
    }

    /// Store a partial without verification. Tests use this to model a
    /// compromised share whose partial passes no check.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&mut self, msg: &PartialSignatureMessage) {
        self.by_root
            .entry(msg.signing_root)
            .or_default()
            .insert(msg.signer, msg.partial_signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::test_utils::test_committee;
    use dv_types::PartialSignatureMessage;

    #[test]
    fn quorum_after_threshold_verified_partials() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let root = Hash::digest(b"signing root");
        let mut container = PartialSigContainer::new();

        for id in [1u64, 2] {
            let msg = PartialSignatureMessage {
                partial_signature: fixture.share_keys[&id].sign(root.as_bytes()),
                signing_root: root,
                signer: id,
                validator_index: 1,
            };
            container.verify_and_add(&fixture.committee, &msg).unwrap();
        }
        assert!(!container.has_quorum(&fixture.committee, &root));

        let msg = PartialSignatureMessage {
            partial_signature: fixture.share_keys[&3].sign(root.as_bytes()),
            signing_root: root,
            signer: 3,
            validator_index: 1,
        };
        container.verify_and_add(&fixture.committee, &msg).unwrap();
        assert!(container.has_quorum(&fixture.committee, &root));
        assert_eq!(container.count(&root), 3);
    }

    #[test]
    fn rejects_bad_partial_and_foreign_signer() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let root = Hash::digest(b"signing root");
        let mut container = PartialSigContainer::new();

        // Signature over the wrong root fails verification.
        let bad = PartialSignatureMessage {
            partial_signature: fixture.share_keys[&2].sign(b"other root"),
            signing_root: root,
            signer: 2,
            validator_index: 1,
        };
        assert!(matches!(
            container.verify_and_add(&fixture.committee, &bad),
            Err(RunnerError::InvalidPartialSignature { operator: 2 })
        ));

        let foreign = PartialSignatureMessage {
            partial_signature: fixture.share_keys[&2].sign(root.as_bytes()),
            signing_root: root,
            signer: 9,
            validator_index: 1,
        };
        assert!(matches!(
            container.verify_and_add(&fixture.committee, &foreign),
            Err(RunnerError::NotAuthorized { operator: 9 })
        ));
        assert_eq!(container.count(&root), 0);
    }

    #[test]
    fn duplicate_partial_is_idempotent() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let root = Hash::digest(b"signing root");
        let mut container = PartialSigContainer::new();
        let msg = PartialSignatureMessage {
            partial_signature: fixture.share_keys[&1].sign(root.as_bytes()),
            signing_root: root,
            signer: 1,
            validator_index: 1,
        };
        container.verify_and_add(&fixture.committee, &msg).unwrap();
        container.verify_and_add(&fixture.committee, &msg).unwrap();
        assert_eq!(container.count(&root), 1);
    }
}
