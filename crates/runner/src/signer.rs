//! Share signing.

use dv_types::{BlsPublicKey, BlsSecretKey, BlsSignature, Hash};
use std::collections::HashMap;

/// Signs signing roots with this operator's partial key for a validator.
/// Key material stays behind this trait; remote signers implement it too.
pub trait ShareSigner: Send + Sync {
    /// Sign `root` with the share key for `validator_pubkey`.
    fn sign(&self, validator_pubkey: &BlsPublicKey, root: &Hash) -> Option<BlsSignature>;
}

/// In-process signer over locally held share keys.
#[derive(Default)]
pub struct LocalShareSigner {
    keys: HashMap<BlsPublicKey, BlsSecretKey>,
}

impl LocalShareSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_share(&mut self, validator_pubkey: BlsPublicKey, share_key: BlsSecretKey) {
        self.keys.insert(validator_pubkey, share_key);
    }

    pub fn contains(&self, validator_pubkey: &BlsPublicKey) -> bool {
        self.keys.contains_key(validator_pubkey)
    }
}

impl ShareSigner for LocalShareSigner {
    fn sign(&self, validator_pubkey: &BlsPublicKey, root: &Hash) -> Option<BlsSignature> {
        self.keys
            .get(validator_pubkey)
            .map(|key| key.sign(root.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dv_types::test_utils::test_committee;

    #[test]
    fn signs_only_known_validators() {
        let fixture = test_committee(&[1, 2, 3, 4]);
        let mut signer = LocalShareSigner::new();
        signer.add_share(fixture.validator_pubkey(), fixture.share_keys[&1].clone());

        let root = Hash::digest(b"root");
        let sig = signer.sign(&fixture.validator_pubkey(), &root).unwrap();
        assert!(fixture.share_keys[&1]
            .public_key()
            .verify(root.as_bytes(), &sig));

        let other = dv_types::test_utils::test_pubkey();
        assert!(signer.sign(&other, &root).is_none());
    }
}
