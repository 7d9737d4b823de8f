//! Deterministic fixtures for consensus and signing tests.

use crate::bls::{BlsPublicKey, BlsSecretKey};
use crate::duty::BeaconRole;
use crate::hash::Hash;
use crate::identifiers::{MessageId, OperatorId};
use crate::share::{Committee, CommitteeMember, Share};
use bls12_381_plus::Scalar;
use ff::Field;
use std::collections::HashMap;

/// Split a fresh validator secret into shares for the given operator ids
/// using a random polynomial of degree `threshold - 1`. Returns the master
/// key and each operator's share key.
pub fn split_secret(
    ids: &[OperatorId],
    threshold: usize,
) -> (BlsSecretKey, Vec<(OperatorId, BlsSecretKey)>) {
    assert!(threshold >= 1 && threshold <= ids.len());

    let master = BlsSecretKey::generate().expect("keygen");
    let mut coefficients = vec![*master.scalar()];
    for _ in 1..threshold {
        coefficients.push(*BlsSecretKey::generate().expect("keygen").scalar());
    }

    let shares = ids
        .iter()
        .map(|&id| {
            assert!(id > 0, "operator ids are positive");
            let x = Scalar::from(id);
            // Horner evaluation of the polynomial at x.
            let mut acc = Scalar::ZERO;
            for c in coefficients.iter().rev() {
                acc = acc * x + c;
            }
            (id, BlsSecretKey::from_scalar(acc).expect("non-zero share"))
        })
        .collect();

    (master, shares)
}

/// A committee of operators with freshly split share keys for one validator.
pub struct TestCommittee {
    pub committee: Committee,
    pub share_keys: HashMap<OperatorId, BlsSecretKey>,
    pub validator_key: BlsSecretKey,
    pub domain: [u8; 32],
}

impl TestCommittee {
    /// The share record as seen by `operator_id`.
    pub fn share_for(&self, operator_id: OperatorId) -> Share {
        Share::new(
            self.validator_key.public_key(),
            1,
            self.committee.clone(),
            operator_id,
        )
    }

    pub fn validator_pubkey(&self) -> BlsPublicKey {
        self.validator_key.public_key()
    }

    pub fn message_id(&self) -> MessageId {
        MessageId::new(
            [0, 0, 0x30, 0x1],
            BeaconRole::Attester,
            self.committee.cluster_id(),
        )
    }
}

/// Build a committee over the given operator ids with threshold `2f + 1`.
pub fn test_committee(ids: &[OperatorId]) -> TestCommittee {
    let f = (ids.len() - 1) / 3;
    let threshold = 2 * f + 1;
    let (validator_key, shares) = split_secret(ids, threshold);

    let members = shares
        .iter()
        .map(|(id, key)| CommitteeMember {
            operator_id: *id,
            share_pubkey: key.public_key(),
        })
        .collect();

    TestCommittee {
        committee: Committee::new(members),
        share_keys: shares.into_iter().collect(),
        validator_key,
        domain: {
            let mut d = [0u8; 32];
            d[..4].copy_from_slice(&[0, 0, 0x30, 0x1]);
            d
        },
    }
}

/// An arbitrary valid public key for tests that only need one.
pub fn test_pubkey() -> BlsPublicKey {
    BlsSecretKey::from_bytes(&{
        let mut b = [0u8; 32];
        b[0] = 42;
        b
    })
    .expect("valid key")
    .public_key()
}

/// A fixed message id for tests that only need one.
pub fn test_message_id() -> MessageId {
    MessageId::new([0, 0, 0x30, 0x1], BeaconRole::Attester, Hash::digest(b"test"))
}
