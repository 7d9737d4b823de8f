//! Partial-signature messages exchanged around consensus.

use crate::bls::BlsSignature;
use crate::hash::Hash;
use crate::identifiers::{OperatorId, Slot, ValidatorIndex};
use serde::{Deserialize, Serialize};

/// Which signing round a batch of partial signatures belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartialSignatureKind {
    /// Before consensus: randao reveals, selection proofs.
    PreConsensus,
    /// After consensus: signatures over the decided beacon objects.
    PostConsensus,
}

/// One operator's partial signature over one signing root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatureMessage {
    pub partial_signature: BlsSignature,
    pub signing_root: Hash,
    pub signer: OperatorId,
    pub validator_index: ValidatorIndex,
}

/// A batch of partial signatures one operator broadcasts for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSignatureMessages {
    pub kind: PartialSignatureKind,
    pub slot: Slot,
    pub messages: Vec<PartialSignatureMessage>,
}

impl PartialSignatureMessages {
    pub fn new(kind: PartialSignatureKind, slot: Slot) -> Self {
        PartialSignatureMessages {
            kind,
            slot,
            messages: Vec::new(),
        }
    }

    /// The operator that produced this batch. Batches are single-signer;
    /// returns `None` when empty or mixed.
    pub fn signer(&self) -> Option<OperatorId> {
        let first = self.messages.first()?.signer;
        self.messages
            .iter()
            .all(|m| m.signer == first)
            .then_some(first)
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("partial signature messages serialize")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bls::BlsSecretKey;

    #[test]
    fn signer_requires_consistent_batch() {
        let key = BlsSecretKey::generate().unwrap();
        let mut batch = PartialSignatureMessages::new(PartialSignatureKind::PostConsensus, 10);
        assert_eq!(batch.signer(), None);

        let root = Hash::digest(b"root");
        batch.messages.push(PartialSignatureMessage {
            partial_signature: key.sign(root.as_bytes()),
            signing_root: root,
            signer: 3,
            validator_index: 1,
        });
        assert_eq!(batch.signer(), Some(3));

        batch.messages.push(PartialSignatureMessage {
            partial_signature: key.sign(root.as_bytes()),
            signing_root: root,
            signer: 4,
            validator_index: 1,
        });
        assert_eq!(batch.signer(), None);
    }
}
