//! Per-round store of signed QBFT messages.

use crate::error::QbftError;
use dv_types::{Committee, Hash, OperatorId, Round, SignedQbftMessage};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Holds the signed messages of one type (prepare, commit, ...) for an
/// instance, grouped by round.
///
/// `add` deduplicates by (signers, value) and rejects a signer that already
/// contributed a *different* value for the same round — that is the
/// equivocation trap.
#[derive(Debug, Default)]
pub struct MessageContainer {
    by_round: BTreeMap<Round, Vec<SignedQbftMessage>>,
    /// (round, signer) -> value root the signer committed to.
    seen_values: HashMap<(Round, OperatorId), Hash>,
}

impl MessageContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message. Returns `Ok(false)` for duplicates, `Ok(true)` when
    /// stored, and `EquivocationDetected` when a signer flips value within
    /// a round.
    pub fn add(&mut self, msg: SignedQbftMessage) -> Result<bool, QbftError> {
        let round = msg.message.round;
        let value_root = msg.message.value_root();

        for signer in &msg.signers {
            match self.seen_values.get(&(round, *signer)) {
                Some(existing) if *existing != value_root => {
                    return Err(QbftError::EquivocationDetected { operator: *signer });
                }
                _ => {}
            }
        }

        let entries = self.by_round.entry(round).or_default();
        let duplicate = entries
            .iter()
            .any(|m| m.signers == msg.signers && m.message.value == msg.message.value);
        if duplicate {
            return Ok(false);
        }

        for signer in &msg.signers {
            self.seen_values.insert((round, *signer), value_root);
        }
        entries.push(msg);
        Ok(true)
    }

    /// All messages stored for a round.
    pub fn by_round(&self, round: Round) -> &[SignedQbftMessage] {
        self.by_round.get(&round).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Messages for `round` carrying exactly `value`.
    pub fn by_round_and_value(&self, round: Round, value: &[u8]) -> Vec<&SignedQbftMessage> {
        self.by_round(round)
            .iter()
            .filter(|m| m.message.value == value)
            .collect()
    }

    /// Distinct signers across all messages for (round, value).
    pub fn signers_for(&self, round: Round, value: &[u8]) -> HashSet<OperatorId> {
        let mut signers = HashSet::new();
        for msg in self.by_round(round) {
            if msg.message.value == value {
                signers.extend(msg.signers.iter().copied());
            }
        }
        signers
    }

    /// Quorum query: `(has_quorum, count, committee_size)` where quorum means
    /// `count * 3 >= committee_size * 2`.
    pub fn quorum_for(&self, round: Round, value: &[u8], committee: &Committee) -> (bool, usize, usize) {
        let count = self.signers_for(round, value).len();
        (committee.has_quorum(count), count, committee.size())
    }

    /// Distinct signers for a round regardless of value (round changes carry
    /// no agreed value).
    pub fn signer_count(&self, round: Round) -> usize {
        let mut signers = HashSet::new();
        for msg in self.by_round(round) {
            signers.extend(msg.signers.iter().copied());
        }
        signers.len()
    }

    /// Rounds above `round` that currently hold messages, ascending.
    pub fn rounds_above(&self, round: Round) -> Vec<Round> {
        self.by_round.range(round + 1..).map(|(r, _)| *r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::test_utils::{test_committee, test_message_id};
    use dv_types::{MessageKind, QbftMessage};

    fn signed(fixture: &dv_types::test_utils::TestCommittee, signer: OperatorId, round: Round, value: &[u8]) -> SignedQbftMessage {
        let msg = QbftMessage::new(MessageKind::Prepare, 100, round, test_message_id(), value.to_vec());
        SignedQbftMessage::sign(msg, signer, &fixture.share_keys[&signer], fixture.domain)
    }

    #[test]
    fn dedup_by_signers_and_value() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let mut container = MessageContainer::new();
        assert!(container.add(signed(&fixture, 1, 1, b"v")).unwrap());
        assert!(!container.add(signed(&fixture, 1, 1, b"v")).unwrap());
        assert_eq!(container.by_round(1).len(), 1);
    }

    #[test]
    fn equivocation_rejected() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let mut container = MessageContainer::new();
        container.add(signed(&fixture, 1, 1, b"v")).unwrap();
        let err = container.add(signed(&fixture, 1, 1, b"w")).unwrap_err();
        match err {
            QbftError::EquivocationDetected { operator } => assert_eq!(operator, 1),
            other => panic!("unexpected error: {other:?}"),
        }
        // Same signer, different round is fine.
        assert!(container.add(signed(&fixture, 1, 2, b"w")).unwrap());
    }

    #[test]
    fn quorum_counts_distinct_signers() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let committee = &fixture.committee;
        let mut container = MessageContainer::new();

        container.add(signed(&fixture, 1, 1, b"v")).unwrap();
        container.add(signed(&fixture, 2, 1, b"v")).unwrap();
        let (quorum, count, size) = container.quorum_for(1, b"v", committee);
        assert!(!quorum);
        assert_eq!((count, size), (2, 4));

        container.add(signed(&fixture, 3, 1, b"v")).unwrap();
        let (quorum, count, _) = container.quorum_for(1, b"v", committee);
        assert!(quorum);
        assert_eq!(count, 3);

        // A different value shares the round but not the quorum.
        let (quorum_other, count_other, _) = container.quorum_for(1, b"w", committee);
        assert!(!quorum_other);
        assert_eq!(count_other, 0);
    }

    #[test]
    fn quorum_is_arrival_order_independent() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let committee = &fixture.committee;

        let mut forward = MessageContainer::new();
        let mut reverse = MessageContainer::new();
        let msgs: Vec<_> = [1u64, 2, 3].iter().map(|s| signed(&fixture, *s, 1, b"v")).collect();
        for m in &msgs {
            forward.add(m.clone()).unwrap();
        }
        for m in msgs.iter().rev() {
            reverse.add(m.clone()).unwrap();
        }
        assert_eq!(
            forward.quorum_for(1, b"v", committee),
            reverse.quorum_for(1, b"v", committee)
        );
    }
}
