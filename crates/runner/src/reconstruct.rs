//! Threshold reconstruction with bad-share isolation.

use crate::partial_container::PartialSigContainer;
use dv_types::{reconstruct_signature, BlsPublicKey, BlsSignature, Committee, Hash, OperatorId};
use tracing::warn;

/// Result of a reconstruction attempt.
#[derive(Debug)]
pub enum ReconstructOutcome {
    /// The reconstructed signature verified against the validator key.
    Valid(BlsSignature),
    /// Reconstruction assembled but the signature did not verify; the
    /// partials it was built from are listed for fallback verification.
    Invalid { partial_ids: Vec<OperatorId> },
}

/// Reconstruct the validator signature over `root` from the container's
/// partials and verify it against the validator public key.
pub fn reconstruct_valid_signature(
    container: &PartialSigContainer,
    root: &Hash,
    validator_pubkey: &BlsPublicKey,
) -> Result<ReconstructOutcome, dv_types::BlsError> {
    let partials = container.partials(root);
    let signature = reconstruct_signature(&partials)?;
    if validator_pubkey.verify(root.as_bytes(), &signature) {
        Ok(ReconstructOutcome::Valid(signature))
    } else {
        Ok(ReconstructOutcome::Invalid {
            partial_ids: partials.into_iter().map(|(id, _)| id).collect(),
        })
    }
}

/// Fallback after a failed reconstruction: verify each partial against its
/// operator's share key and return the operators whose partials are bad.
/// No retaliation here beyond logging; the caller decides what to submit.
pub fn verify_each_signature(
    container: &PartialSigContainer,
    committee: &Committee,
    root: &Hash,
) -> Vec<OperatorId> {
    let mut bad = Vec::new();
    for (operator, partial) in container.partials(root) {
        let Some(member) = committee.member(operator) else {
            bad.push(operator);
            continue;
        };
        if !member.share_pubkey.verify(root.as_bytes(), &partial) {
            warn!(operator, root = %root, "share produced an invalid partial signature");
            bad.push(operator);
        }
    }
    bad
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::test_utils::test_committee;
    use dv_types::{BlsSecretKey, PartialSignatureMessage};

    fn filled_container(
        fixture: &dv_types::test_utils::TestCommittee,
        root: &Hash,
        signers: &[u64],
    ) -> PartialSigContainer {
        let mut container = PartialSigContainer::new();
        for id in signers {
            let msg = PartialSignatureMessage {
                partial_signature: fixture.share_keys[id].sign(root.as_bytes()),
                signing_root: *root,
                signer: *id,
                validator_index: 1,
            };
            container.verify_and_add(&fixture.committee, &msg).unwrap();
        }
        container
    }

    #[test]
    fn quorum_of_partials_reconstructs_validator_signature() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let root = Hash::digest(b"attestation root");
        let container = filled_container(&fixture, &root, &[1, 3, 4]);

        match reconstruct_valid_signature(&container, &root, &fixture.validator_pubkey()).unwrap()
        {
            ReconstructOutcome::Valid(sig) => {
                assert!(fixture.validator_pubkey().verify(root.as_bytes(), &sig));
            }
            other => panic!("expected valid reconstruction, got {other:?}"),
        }
    }

    #[test]
    fn bad_share_is_isolated_by_fallback() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let root = Hash::digest(b"attestation root");

        // Operator 2's partial is garbage. The container cannot verify it
        // against the share key either, so inject it behind verification.
        // Simulate a compromised share: the forged partial bypasses the
        // container's verification, which is exactly what the fallback
        // pass exists to isolate.
        let mut container = filled_container(&fixture, &root, &[1, 3]);
        let rogue = BlsSecretKey::generate().unwrap();
        let forged = PartialSignatureMessage {
            partial_signature: rogue.sign(root.as_bytes()),
            signing_root: root,
            signer: 2,
            validator_index: 1,
        };
        container.insert_unchecked(&forged);

        let outcome =
            reconstruct_valid_signature(&container, &root, &fixture.validator_pubkey()).unwrap();
        let partial_ids = match outcome {
            ReconstructOutcome::Invalid { partial_ids } => partial_ids,
            other => panic!("expected invalid reconstruction, got {other:?}"),
        };
        assert_eq!(partial_ids, vec![1, 2, 3]);

        let bad = verify_each_signature(&container, &fixture.committee, &root);
        assert_eq!(bad, vec![2]);
    }
}
