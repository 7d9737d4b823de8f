//! Persistence of decided instances and participation records.
//!
//! Namespaces: `instances/{identifier}/highest` holds the most recent
//! decided instance, `instances/{identifier}/history` keyed by big-endian
//! height holds the archive, and `participants/{identifier}` keyed by
//! big-endian slot holds the operator ids that signed the decided message.

use crate::instance::InstanceState;
use dv_storage::{Database, StorageError};
use dv_types::{Height, MessageId, OperatorId, SignedQbftMessage, Slot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Instance state alongside its decided message (aggregated commits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredInstance {
    pub state: InstanceState,
    pub decided_message: SignedQbftMessage,
}

impl StoredInstance {
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        serde_json::to_vec(self).map_err(|e| StorageError::Fatal(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, StorageError> {
        serde_json::from_slice(data).map_err(|e| StorageError::Fatal(e.to_string()))
    }
}

/// Encode operator ids as concatenated fixed 8-byte big-endian words.
pub fn encode_operators(operators: &[OperatorId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(operators.len() * 8);
    for op in operators {
        out.extend_from_slice(&op.to_be_bytes());
    }
    out
}

/// Decode the fixed-width operator encoding. Trailing bytes that do not
/// fill a full word are ignored.
pub fn decode_operators(data: &[u8]) -> Vec<OperatorId> {
    data.chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            OperatorId::from_be_bytes(word)
        })
        .collect()
}

/// Store used by the QBFT controller.
pub struct QbftStore {
    db: Arc<dyn Database>,
}

impl QbftStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        QbftStore { db }
    }

    fn highest_ns(identifier: &MessageId) -> String {
        format!("instances/{identifier}/highest")
    }

    fn history_ns(identifier: &MessageId) -> String {
        format!("instances/{identifier}/history")
    }

    fn participants_ns(identifier: &MessageId) -> String {
        format!("participants/{identifier}")
    }

    /// Persist a decided instance as both the highest and a historical entry.
    pub fn save_highest_and_historical(
        &self,
        identifier: &MessageId,
        instance: &StoredInstance,
    ) -> Result<(), StorageError> {
        let encoded = instance.encode()?;
        let height_key = instance.state.height.to_be_bytes();
        let highest_ns = Self::highest_ns(identifier);
        let history_ns = Self::history_ns(identifier);
        self.db.update(&mut |txn| {
            txn.put(&highest_ns, b"", encoded.clone());
            txn.put(&history_ns, &height_key, encoded.clone());
            Ok(())
        })?;
        debug!(height = instance.state.height, "stored decided instance");
        Ok(())
    }

    pub fn highest_instance(
        &self,
        identifier: &MessageId,
    ) -> Result<Option<StoredInstance>, StorageError> {
        self.db
            .get(&Self::highest_ns(identifier), b"")?
            .map(|data| StoredInstance::decode(&data))
            .transpose()
    }

    pub fn instance(
        &self,
        identifier: &MessageId,
        height: Height,
    ) -> Result<Option<StoredInstance>, StorageError> {
        self.db
            .get(&Self::history_ns(identifier), &height.to_be_bytes())?
            .map(|data| StoredInstance::decode(&data))
            .transpose()
    }

    /// Historical instances with `from <= height <= to`.
    pub fn instances_in_range(
        &self,
        identifier: &MessageId,
        from: Height,
        to: Height,
    ) -> Result<Vec<StoredInstance>, StorageError> {
        let mut out = Vec::new();
        for (key, value) in self.db.range(&Self::history_ns(identifier), b"")? {
            if key.len() != 8 {
                continue;
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(&key);
            let height = Height::from_be_bytes(word);
            if height >= from && height <= to {
                out.push(StoredInstance::decode(&value)?);
            }
        }
        Ok(out)
    }

    /// Record the operators that participated in a decided slot, merged with
    /// any previously recorded set.
    pub fn save_participants(
        &self,
        identifier: &MessageId,
        slot: Slot,
        operators: &[OperatorId],
    ) -> Result<(), StorageError> {
        let ns = Self::participants_ns(identifier);
        let key = slot.to_be_bytes();
        let mut merged: Vec<OperatorId> = operators.to_vec();
        self.db.update(&mut |txn| {
            if let Some(existing) = txn.get(&ns, &key)? {
                merged.extend(decode_operators(&existing));
            }
            merged.sort_unstable();
            merged.dedup();
            txn.put(&ns, &key, encode_operators(&merged));
            Ok(())
        })?;
        Ok(())
    }

    pub fn participants(
        &self,
        identifier: &MessageId,
        slot: Slot,
    ) -> Result<Vec<OperatorId>, StorageError> {
        Ok(self
            .db
            .get(&Self::participants_ns(identifier), &slot.to_be_bytes())?
            .map(|data| decode_operators(&data))
            .unwrap_or_default())
    }

    /// Participation records with `from <= slot <= to`.
    pub fn participants_in_range(
        &self,
        identifier: &MessageId,
        from: Slot,
        to: Slot,
    ) -> Result<Vec<(Slot, Vec<OperatorId>)>, StorageError> {
        let mut out = Vec::new();
        for (key, value) in self.db.range(&Self::participants_ns(identifier), b"")? {
            if key.len() != 8 {
                continue;
            }
            let mut word = [0u8; 8];
            word.copy_from_slice(&key);
            let slot = Slot::from_be_bytes(word);
            if slot >= from && slot <= to {
                out.push((slot, decode_operators(&value)));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceState, Stage};
    use dv_storage::MemDb;
    use dv_types::test_utils::{test_committee, test_message_id};
    use dv_types::{MessageKind, QbftMessage};

    fn store() -> QbftStore {
        QbftStore::new(Arc::new(MemDb::new()))
    }

    fn stored_instance(height: Height) -> StoredInstance {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let msg = QbftMessage::new(
            MessageKind::Commit,
            height,
            1,
            test_message_id(),
            b"decided".to_vec(),
        );
        let decided = SignedQbftMessage::sign(msg, 1, &fixture.share_keys[&1], fixture.domain);
        StoredInstance {
            state: InstanceState {
                identifier: test_message_id(),
                height,
                round: 1,
                stage: Stage::Decided,
                input_value: b"decided".to_vec(),
                prepared_round: Some(1),
                prepared_value: Some(b"decided".to_vec()),
                decided_value: Some(b"decided".to_vec()),
                proposal_accepted_for_round: Some(1),
            },
            decided_message: decided,
        }
    }

    #[test]
    fn stored_instance_json_round_trip() {
        let instance = stored_instance(42);
        let decoded = StoredInstance::decode(&instance.encode().unwrap()).unwrap();
        assert_eq!(decoded, instance);
    }

    #[test]
    fn operator_encoding_vectors() {
        // Committee of 4 with sentinel patterns.
        let xs = [
            0x0123_4567_89AB_CDEF,
            0xFEDC_BA98_7654_3210,
            0x1122_3344_5566_7788,
            0x8877_6655_4433_2211,
        ];
        let encoded = encode_operators(&xs);
        assert_eq!(
            encoded,
            vec![
                0x01, 0x23, 0x45, 0x67, 0x89, 0xAB, 0xCD, 0xEF, 0xFE, 0xDC, 0xBA, 0x98, 0x76,
                0x54, 0x32, 0x10, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x88, 0x77,
                0x66, 0x55, 0x44, 0x33, 0x22, 0x11
            ]
        );
        assert_eq!(decode_operators(&encoded), xs);

        // Committee of 7: seven big-endian words, 56 bytes.
        let seven: Vec<OperatorId> = (1..=7).collect();
        let encoded = encode_operators(&seven);
        assert_eq!(encoded.len(), 56);
        for (i, op) in seven.iter().enumerate() {
            assert_eq!(encoded[i * 8 + 7], *op as u8);
            assert_eq!(&encoded[i * 8..i * 8 + 7], &[0u8; 7]);
        }
        assert_eq!(decode_operators(&encoded), seven);

        // Committee of 13.
        let thirteen: Vec<OperatorId> = (0..13).collect();
        assert_eq!(decode_operators(&encode_operators(&thirteen)), thirteen);
    }

    #[test]
    fn highest_and_history_round_trip() {
        let store = store();
        let id = test_message_id();
        let early = stored_instance(10);
        let late = stored_instance(11);

        store.save_highest_and_historical(&id, &early).unwrap();
        store.save_highest_and_historical(&id, &late).unwrap();

        assert_eq!(store.highest_instance(&id).unwrap().unwrap(), late);
        assert_eq!(store.instance(&id, 10).unwrap().unwrap(), early);
        assert_eq!(store.instance(&id, 12).unwrap(), None);
        assert_eq!(store.instances_in_range(&id, 10, 11).unwrap().len(), 2);
    }

    #[test]
    fn participants_merge_and_sort() {
        let store = store();
        let id = test_message_id();
        store.save_participants(&id, 100, &[3, 1]).unwrap();
        store.save_participants(&id, 100, &[2, 3]).unwrap();
        assert_eq!(store.participants(&id, 100).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.participants(&id, 101).unwrap(), Vec::<OperatorId>::new());
    }
}
