//! BLS12-381 threshold signatures.
//!
//! Keys and signatures follow the Ethereum orientation: public keys are
//! compressed G1 points (48 bytes), signatures are compressed G2 points
//! (96 bytes). Partial signatures produced by operator shares live in the
//! same groups, so aggregation and threshold reconstruction are plain
//! point sums.
//!
//! # Threshold reconstruction
//!
//! A validator key is split with a degree-`t-1` polynomial `a` where
//! `a(0)` is the validator secret and share `i` holds `a(i)` (operator ids
//! are the evaluation points). Any `t` partial signatures reconstruct the
//! full signature by Lagrange interpolation at zero in the scalar field:
//!
//! ```text
//! sigma = sum_i lambda_i * sigma_i,   lambda_i = prod_{j != i} j / (j - i)
//! ```

use bls12_381_plus::{
    multi_miller_loop, G1Affine, G1Projective, G2Affine, G2Prepared, G2Projective, Gt, Scalar,
};
use ff::Field;
use group::{Curve, Group};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::ops::Neg;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::identifiers::OperatorId;

/// Errors from BLS operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlsError {
    #[error("key generation failed")]
    KeyGenerationFailed,
    #[error("secret key must be non-zero")]
    ZeroSecretKey,
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("empty signer set")]
    EmptySignerSet,
    #[error("duplicate share id {0}")]
    DuplicateShareId(OperatorId),
    #[error("share id must be non-zero")]
    ZeroShareId,
    #[error("reconstructed signature did not verify")]
    ReconstructionFailed,
}

/// Hash a message to a point on G2.
///
/// Deterministic map via wide scalar reduction; the domain separation tag is
/// mixed into the digest so signatures from different contexts never collide.
fn hash_to_g2(message: &[u8], dst: &[u8]) -> G2Projective {
    let mut hasher = Sha256::new();
    hasher.update(dst);
    hasher.update((message.len() as u64).to_le_bytes());
    hasher.update(message);
    let hash1 = hasher.finalize();

    let mut hasher2 = Sha256::new();
    hasher2.update(hash1);
    hasher2.update(b"_expand");
    let hash2 = hasher2.finalize();

    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&hash1);
    wide[32..].copy_from_slice(&hash2);

    let scalar = Scalar::from_bytes_wide(&wide);
    G2Projective::generator() * scalar
}

/// Default domain separation tag for beacon-object and consensus signing.
const DST_SIGNATURE: &[u8] = b"DV_BLS_SIG_";

/// BLS secret key (scalar).
///
/// Zeroized on drop. Never serialized; only the public key is.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlsSecretKey {
    #[zeroize(skip)]
    scalar: Scalar,
    bytes: [u8; 32],
}

impl BlsSecretKey {
    /// Generate a new random secret key from OS entropy.
    pub fn generate() -> Result<Self, BlsError> {
        let mut wide = [0u8; 64];
        getrandom::getrandom(&mut wide).map_err(|_| BlsError::KeyGenerationFailed)?;
        let scalar = Scalar::from_bytes_wide(&wide);
        wide.zeroize();
        Self::from_scalar(scalar)
    }

    pub(crate) fn from_scalar(scalar: Scalar) -> Result<Self, BlsError> {
        if bool::from(scalar.is_zero()) {
            return Err(BlsError::ZeroSecretKey);
        }
        Ok(BlsSecretKey {
            scalar,
            bytes: scalar.to_le_bytes(),
        })
    }

    /// Create from 32 little-endian bytes.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, BlsError> {
        let scalar_opt = Scalar::from_le_bytes(bytes);
        if bool::from(scalar_opt.is_none()) {
            return Err(BlsError::ZeroSecretKey);
        }
        Self::from_scalar(scalar_opt.unwrap())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// The corresponding public key (G1 point).
    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey {
            point: (G1Projective::generator() * self.scalar).to_affine(),
        }
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> BlsSignature {
        let h = hash_to_g2(message, DST_SIGNATURE);
        BlsSignature {
            point: (h * self.scalar).to_affine(),
        }
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.scalar
    }
}

impl fmt::Debug for BlsSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSecretKey([REDACTED])")
    }
}

/// BLS public key (compressed G1 point, 48 bytes).
#[derive(Clone, Copy)]
pub struct BlsPublicKey {
    point: G1Affine,
}

impl BlsPublicKey {
    pub const BYTES: usize = 48;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        if bytes.len() != Self::BYTES {
            return Err(BlsError::InvalidPublicKey);
        }
        let mut arr = [0u8; Self::BYTES];
        arr.copy_from_slice(bytes);
        let point_opt = G1Affine::from_compressed(&arr);
        if bool::from(point_opt.is_none()) {
            return Err(BlsError::InvalidPublicKey);
        }
        let point = point_opt.unwrap();
        if bool::from(point.is_identity()) {
            return Err(BlsError::InvalidPublicKey);
        }
        Ok(BlsPublicKey { point })
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        self.point.to_compressed()
    }

    /// Verify a signature via pairing: `e(g1, sig) == e(pk, H(m))`.
    pub fn verify(&self, message: &[u8], signature: &BlsSignature) -> bool {
        let h = hash_to_g2(message, DST_SIGNATURE).to_affine();
        let g1_neg = G1Affine::generator().neg();

        let sig_prepared = G2Prepared::from(signature.point);
        let h_prepared = G2Prepared::from(h);

        let result = multi_miller_loop(&[(&g1_neg, &sig_prepared), (&self.point, &h_prepared)])
            .final_exponentiation();

        result == Gt::identity()
    }

    /// Aggregate public keys by point sum.
    pub fn aggregate(pubkeys: &[BlsPublicKey]) -> Result<Self, BlsError> {
        let mut iter = pubkeys.iter();
        let first = iter.next().ok_or(BlsError::EmptySignerSet)?;
        let mut sum = G1Projective::from(first.point);
        for pk in iter {
            sum += G1Projective::from(pk.point);
        }
        Ok(BlsPublicKey {
            point: sum.to_affine(),
        })
    }
}

impl PartialEq for BlsPublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point
    }
}

impl Eq for BlsPublicKey {}

impl std::hash::Hash for BlsPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey(0x{}..)", hex::encode(&self.to_bytes()[..4]))
    }
}

impl fmt::Display for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_bytes()))
    }
}

impl Serialize for BlsPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for BlsPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        BlsPublicKey::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// BLS signature (compressed G2 point, 96 bytes).
#[derive(Clone, Copy)]
pub struct BlsSignature {
    point: G2Affine,
}

impl BlsSignature {
    pub const BYTES: usize = 96;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlsError> {
        if bytes.len() != Self::BYTES {
            return Err(BlsError::InvalidSignature);
        }
        let mut arr = [0u8; Self::BYTES];
        arr.copy_from_slice(bytes);
        let point_opt = G2Affine::from_compressed(&arr);
        if bool::from(point_opt.is_none()) {
            return Err(BlsError::InvalidSignature);
        }
        Ok(BlsSignature {
            point: point_opt.unwrap(),
        })
    }

    pub fn to_bytes(&self) -> [u8; 96] {
        self.point.to_compressed()
    }

    /// Aggregate signatures by point sum.
    pub fn aggregate(signatures: &[BlsSignature]) -> Result<Self, BlsError> {
        let mut iter = signatures.iter();
        let first = iter.next().ok_or(BlsError::EmptySignerSet)?;
        let mut sum = G2Projective::from(first.point);
        for sig in iter {
            sum += G2Projective::from(sig.point);
        }
        Ok(BlsSignature {
            point: sum.to_affine(),
        })
    }
}

impl PartialEq for BlsSignature {
    fn eq(&self, other: &Self) -> bool {
        self.point == other.point
    }
}

impl Eq for BlsSignature {}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature(0x{}..)", hex::encode(&self.to_bytes()[..4]))
    }
}

impl Serialize for BlsSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for BlsSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        BlsSignature::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Reconstruct a full signature from partial signatures by Lagrange
/// interpolation at zero. `partials` pairs each operator id (the evaluation
/// point) with that operator's partial signature; ids must be unique and
/// non-zero. The caller is responsible for supplying at least the threshold
/// count and for verifying the result against the validator public key.
pub fn reconstruct_signature(
    partials: &[(OperatorId, BlsSignature)],
) -> Result<BlsSignature, BlsError> {
    if partials.is_empty() {
        return Err(BlsError::EmptySignerSet);
    }
    for (i, (id, _)) in partials.iter().enumerate() {
        if *id == 0 {
            return Err(BlsError::ZeroShareId);
        }
        if partials[..i].iter().any(|(other, _)| other == id) {
            return Err(BlsError::DuplicateShareId(*id));
        }
    }

    let mut sum = G2Projective::identity();
    for (id_i, sig_i) in partials {
        let x_i = Scalar::from(*id_i);
        let mut numerator = Scalar::ONE;
        let mut denominator = Scalar::ONE;
        for (id_j, _) in partials {
            if id_j == id_i {
                continue;
            }
            let x_j = Scalar::from(*id_j);
            numerator *= x_j;
            denominator *= x_j - x_i;
        }
        // Denominator is a product of non-zero differences of distinct ids.
        let inverse =
            Option::<Scalar>::from(denominator.invert()).ok_or(BlsError::ReconstructionFailed)?;
        sum += G2Projective::from(sig_i.point) * (numerator * inverse);
    }

    Ok(BlsSignature {
        point: sum.to_affine(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::split_secret;

    #[test]
    fn sign_verify_round_trip() {
        let sk = BlsSecretKey::generate().unwrap();
        let pk = sk.public_key();
        let sig = sk.sign(b"message");
        assert!(pk.verify(b"message", &sig));
        assert!(!pk.verify(b"other message", &sig));
    }

    #[test]
    fn rejects_wrong_key() {
        let sk1 = BlsSecretKey::generate().unwrap();
        let sk2 = BlsSecretKey::generate().unwrap();
        let sig = sk1.sign(b"message");
        assert!(!sk2.public_key().verify(b"message", &sig));
    }

    #[test]
    fn encoding_round_trips() {
        let sk = BlsSecretKey::generate().unwrap();
        let pk = sk.public_key();
        let sig = sk.sign(b"payload");
        assert_eq!(BlsPublicKey::from_bytes(&pk.to_bytes()).unwrap(), pk);
        assert_eq!(BlsSignature::from_bytes(&sig.to_bytes()).unwrap(), sig);
        assert_eq!(BlsSecretKey::from_bytes(&sk.to_bytes()).unwrap().to_bytes(), sk.to_bytes());
    }

    #[test]
    fn aggregate_verifies_against_aggregate_key() {
        let sk1 = BlsSecretKey::generate().unwrap();
        let sk2 = BlsSecretKey::generate().unwrap();
        let sig = BlsSignature::aggregate(&[sk1.sign(b"m"), sk2.sign(b"m")]).unwrap();
        let pk = BlsPublicKey::aggregate(&[sk1.public_key(), sk2.public_key()]).unwrap();
        assert!(pk.verify(b"m", &sig));
    }

    #[test]
    fn threshold_reconstruction_any_quorum() {
        // Committee of 4, threshold 3.
        let (master, shares) = split_secret(&[1, 2, 3, 4], 3);
        let master_pk = master.public_key();
        let msg = b"duty signing root";

        let partials: Vec<_> = shares
            .iter()
            .map(|(id, share)| (*id, share.sign(msg)))
            .collect();

        // Any 3-of-4 subset reconstructs the master signature.
        for skip in 0..4 {
            let subset: Vec<_> = partials
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, p)| *p)
                .collect();
            let sig = reconstruct_signature(&subset).unwrap();
            assert!(master_pk.verify(msg, &sig));
        }
    }

    #[test]
    fn reconstruction_with_bad_partial_fails_verification() {
        let (master, shares) = split_secret(&[1, 2, 3, 4], 3);
        let msg = b"duty signing root";

        let mut partials: Vec<_> = shares
            .iter()
            .take(3)
            .map(|(id, share)| (*id, share.sign(msg)))
            .collect();
        // Operator 2 contributes garbage.
        let rogue = BlsSecretKey::generate().unwrap();
        partials[1] = (partials[1].0, rogue.sign(msg));

        let sig = reconstruct_signature(&partials).unwrap();
        assert!(!master.public_key().verify(msg, &sig));
    }

    #[test]
    fn reconstruction_rejects_duplicates() {
        let sk = BlsSecretKey::generate().unwrap();
        let sig = sk.sign(b"m");
        let err = reconstruct_signature(&[(1, sig), (1, sig)]).unwrap_err();
        assert_eq!(err, BlsError::DuplicateShareId(1));
    }
}
