//! QBFT consensus messages and signed-message aggregation.

use crate::bls::{BlsSignature, BlsSecretKey};
use crate::beacon::{compute_signing_root, Domain};
use crate::hash::Hash;
use crate::identifiers::{Height, MessageId, OperatorId, Round};
use serde::{Deserialize, Serialize};

/// Errors from signed-message validation and aggregation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("signer set is empty")]
    NoSigners,
    #[error("signer set is not strictly ascending")]
    UnsortedSigners,
    #[error("cannot aggregate messages with different contents")]
    ContentMismatch,
    #[error("signer sets overlap on operator {0}")]
    OverlappingSigners(OperatorId),
    #[error("bls error: {0}")]
    Bls(#[from] crate::bls::BlsError),
}

/// QBFT message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Preprepare,
    Prepare,
    Commit,
    RoundChange,
}

/// A QBFT consensus message for one instance.
///
/// `prepared_round`/`prepared_value` carry the round-change payload; the
/// justification vectors carry the supporting signed messages (round changes
/// on a Preprepare for round > 1, prepares on a RoundChange claiming a
/// prepared value). Justifications are excluded from the signing payload
/// because they carry their own signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QbftMessage {
    pub kind: MessageKind,
    pub height: Height,
    pub round: Round,
    pub identifier: MessageId,
    pub value: Vec<u8>,
    pub prepared_round: Option<Round>,
    pub prepared_value: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub round_change_justification: Vec<SignedQbftMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepare_justification: Vec<SignedQbftMessage>,
}

/// The fields covered by a message signature.
#[derive(Serialize)]
struct SigningPayload<'a> {
    kind: MessageKind,
    height: Height,
    round: Round,
    identifier: &'a MessageId,
    value: &'a [u8],
    prepared_round: Option<Round>,
    prepared_value: Option<&'a [u8]>,
}

impl QbftMessage {
    pub fn new(
        kind: MessageKind,
        height: Height,
        round: Round,
        identifier: MessageId,
        value: Vec<u8>,
    ) -> Self {
        QbftMessage {
            kind,
            height,
            round,
            identifier,
            value,
            prepared_round: None,
            prepared_value: None,
            round_change_justification: Vec::new(),
            prepare_justification: Vec::new(),
        }
    }

    /// Root of the value this message carries.
    pub fn value_root(&self) -> Hash {
        Hash::digest(&self.value)
    }

    /// The root an operator signs: domain mixed into the hash of the
    /// justification-free payload.
    pub fn signing_root(&self, domain: Domain) -> Hash {
        let payload = SigningPayload {
            kind: self.kind,
            height: self.height,
            round: self.round,
            identifier: &self.identifier,
            value: &self.value,
            prepared_round: self.prepared_round,
            prepared_value: self.prepared_value.as_deref(),
        };
        let encoded = serde_json::to_vec(&payload).expect("signing payload serializes");
        compute_signing_root(Hash::digest(&encoded), domain)
    }
}

/// A QBFT message with the signatures of one or more operators.
///
/// Invariant: `signers` is strictly ascending with no duplicates; the
/// signature is the BLS sum of each signer's signature over the message's
/// signing root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedQbftMessage {
    pub message: QbftMessage,
    pub signers: Vec<OperatorId>,
    pub signature: BlsSignature,
}

impl SignedQbftMessage {
    /// Sign a message as a single operator.
    pub fn sign(
        message: QbftMessage,
        operator_id: OperatorId,
        key: &BlsSecretKey,
        domain: Domain,
    ) -> Self {
        let root = message.signing_root(domain);
        let signature = key.sign(root.as_bytes());
        SignedQbftMessage {
            message,
            signers: vec![operator_id],
            signature,
        }
    }

    /// Validate the signer-set invariant.
    pub fn validate_signers(&self) -> Result<(), MessageError> {
        if self.signers.is_empty() {
            return Err(MessageError::NoSigners);
        }
        if !self.signers.windows(2).all(|w| w[0] < w[1]) {
            return Err(MessageError::UnsortedSigners);
        }
        Ok(())
    }

    /// Merge another signed message carrying the same content into this one:
    /// signer sets must be disjoint; they are united (kept sorted) and the
    /// signatures BLS-summed.
    pub fn aggregate(&mut self, other: &SignedQbftMessage) -> Result<(), MessageError> {
        if self.message.kind != other.message.kind
            || self.message.height != other.message.height
            || self.message.round != other.message.round
            || self.message.identifier != other.message.identifier
            || self.message.value != other.message.value
        {
            return Err(MessageError::ContentMismatch);
        }
        self.validate_signers()?;
        other.validate_signers()?;
        if let Some(dup) = self.signers.iter().find(|s| other.signers.contains(s)) {
            return Err(MessageError::OverlappingSigners(*dup));
        }

        let mut merged = Vec::with_capacity(self.signers.len() + other.signers.len());
        merged.extend_from_slice(&self.signers);
        merged.extend_from_slice(&other.signers);
        merged.sort_unstable();

        self.signature = BlsSignature::aggregate(&[self.signature, other.signature])?;
        self.signers = merged;
        Ok(())
    }

    /// Whether this message was signed by exactly one operator.
    pub fn is_single_signer(&self) -> bool {
        self.signers.len() == 1
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("signed message serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Everything that travels on a cluster's gossip topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Consensus(SignedQbftMessage),
    PartialSignatures(crate::partial_sig::PartialSignatureMessages),
}

impl WireMessage {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("wire message serializes")
    }

    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_committee, test_message_id};

    fn message(kind: MessageKind, value: &[u8]) -> QbftMessage {
        QbftMessage::new(kind, 100, 1, test_message_id(), value.to_vec())
    }

    #[test]
    fn sign_and_verify_single_signer() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let msg = message(MessageKind::Prepare, b"value");
        let signed =
            SignedQbftMessage::sign(msg.clone(), 1, &fixture.share_keys[&1], fixture.domain);
        let root = msg.signing_root(fixture.domain);
        let member = fixture.committee.member(1).unwrap();
        assert!(member.share_pubkey.verify(root.as_bytes(), &signed.signature));
    }

    #[test]
    fn aggregation_unites_disjoint_signers() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let msg = message(MessageKind::Commit, b"value");
        let mut a = SignedQbftMessage::sign(msg.clone(), 1, &fixture.share_keys[&1], fixture.domain);
        let c = SignedQbftMessage::sign(msg.clone(), 3, &fixture.share_keys[&3], fixture.domain);
        a.aggregate(&c).unwrap();
        assert_eq!(a.signers, vec![1, 3]);

        // The summed signature verifies against the summed share keys.
        let pk = crate::bls::BlsPublicKey::aggregate(&[
            fixture.committee.member(1).unwrap().share_pubkey,
            fixture.committee.member(3).unwrap().share_pubkey,
        ])
        .unwrap();
        let root = msg.signing_root(fixture.domain);
        assert!(pk.verify(root.as_bytes(), &a.signature));
    }

    #[test]
    fn aggregation_is_commutative_up_to_signers() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let msg = message(MessageKind::Commit, b"value");
        let one = SignedQbftMessage::sign(msg.clone(), 1, &fixture.share_keys[&1], fixture.domain);
        let two = SignedQbftMessage::sign(msg.clone(), 2, &fixture.share_keys[&2], fixture.domain);

        let mut ab = one.clone();
        ab.aggregate(&two).unwrap();
        let mut ba = two.clone();
        ba.aggregate(&one).unwrap();

        assert_eq!(ab.signers, ba.signers);
        assert_eq!(ab.signature, ba.signature);
    }

    #[test]
    fn aggregation_rejects_overlap() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let msg = message(MessageKind::Commit, b"value");
        let mut a = SignedQbftMessage::sign(msg.clone(), 2, &fixture.share_keys[&2], fixture.domain);
        let b = a.clone();
        assert_eq!(
            a.aggregate(&b).unwrap_err(),
            MessageError::OverlappingSigners(2)
        );
    }

    #[test]
    fn aggregation_rejects_different_values() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let mut a = SignedQbftMessage::sign(
            message(MessageKind::Commit, b"value"),
            1,
            &fixture.share_keys[&1],
            fixture.domain,
        );
        let b = SignedQbftMessage::sign(
            message(MessageKind::Commit, b"other"),
            2,
            &fixture.share_keys[&2],
            fixture.domain,
        );
        assert_eq!(a.aggregate(&b).unwrap_err(), MessageError::ContentMismatch);
    }

    #[test]
    fn signer_invariant_enforced() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let msg = message(MessageKind::Prepare, b"value");
        let mut signed =
            SignedQbftMessage::sign(msg, 1, &fixture.share_keys[&1], fixture.domain);
        signed.signers = vec![3, 1];
        assert_eq!(
            signed.validate_signers().unwrap_err(),
            MessageError::UnsortedSigners
        );
        signed.signers = vec![2, 2];
        assert_eq!(
            signed.validate_signers().unwrap_err(),
            MessageError::UnsortedSigners
        );
        signed.signers = vec![];
        assert_eq!(signed.validate_signers().unwrap_err(), MessageError::NoSigners);
    }

    #[test]
    fn signing_root_ignores_justifications() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let mut msg = message(MessageKind::RoundChange, b"");
        let bare_root = msg.signing_root(fixture.domain);
        msg.prepare_justification.push(SignedQbftMessage::sign(
            message(MessageKind::Prepare, b"value"),
            1,
            &fixture.share_keys[&1],
            fixture.domain,
        ));
        assert_eq!(msg.signing_root(fixture.domain), bare_root);
    }
}
