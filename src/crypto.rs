//! The cryptographic capability surface consumed by the coordination core.
//!
//! The server is protocol plumbing around an existing FROST/ROAST
//! cryptosystem: it never holds secret material and never produces a
//! signature itself. Everything in this module is either a public value
//! routed between participants (commitments, opaque ciphertexts), an
//! identity-signature wrapper over participants' long-term keys, or a
//! verification/aggregation entry point delegated to the FROST
//! implementation.

use std::collections::BTreeMap;

use ed25519_dalek::{Signer, Verifier};
use frost_secp256k1_tr as frost;
use k256::elliptic_curve::PrimeField;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey as SecpPublicKey, Scalar};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Long-term participant identity key types.
pub use ed25519_dalek::{
    Signature as IdentitySignature, SigningKey as IdentityKeypair,
    VerifyingKey as IdentityPublicKey,
};

/// FROST participant identifier (non-zero scalar derived from a `u16`).
pub type FrostIdentifier = frost::Identifier;

/// Public DKG round-1 commitment package.
pub type DkgCommitment = frost::keys::dkg::round1::Package;

/// One participant's nonce commitment for a signing round.
pub type SigningCommitment = frost::round1::SigningCommitments;

/// One participant's signature share for a signing round.
pub type SignatureShare = frost::round2::SignatureShare;

/// An aggregated Taproot-compatible Schnorr signature.
pub type SchnorrSignature = frost::Signature;

/// Per-participant public verifying share.
pub type VerifyingShare = frost::keys::VerifyingShare;

/// Failures inside the capability layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad identity signature")]
    BadSignature,

    #[error("malformed key material: {0}")]
    MalformedKey(String),

    #[error("FROST error: {0}")]
    Frost(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Canonical byte form of a serializable value, used as the message for
/// identity signatures and fingerprints.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CryptoError> {
    bincode::serialize(value).map_err(|e| CryptoError::Serialization(e.to_string()))
}

/// A value together with an identity signature over its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signed<T> {
    pub obj: T,
    signature: IdentitySignature,
}

impl<T: Serialize> Signed<T> {
    /// Sign a value with a participant's long-term key.
    pub fn sign(obj: T, key: &IdentityKeypair) -> Result<Self, CryptoError> {
        let bytes = canonical_bytes(&obj)?;
        let signature = key.sign(&bytes);
        Ok(Self { obj, signature })
    }

    /// Verify the signature under the given long-term public key.
    pub fn verify(&self, key: &IdentityPublicKey) -> Result<(), CryptoError> {
        let bytes = canonical_bytes(&self.obj)?;
        key.verify(&bytes, &self.signature)
            .map_err(|_| CryptoError::BadSignature)
    }

    pub fn signature(&self) -> &IdentitySignature {
        &self.signature
    }
}

/// Verify a detached identity signature over raw bytes (used for the round-2
/// commitment-set hash, which is signed as-is rather than re-serialized).
pub fn verify_detached(
    key: &IdentityPublicKey,
    message: &[u8],
    signature: &IdentitySignature,
) -> Result<(), CryptoError> {
    key.verify(message, signature)
        .map_err(|_| CryptoError::BadSignature)
}

/// Serialized group public key bytes; the opaque identity of a FROST key set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey(pub Vec<u8>);

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

/// ECDH-encrypted DKG round-2 secret, routed verbatim to its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkgEncryptedSecret(pub Vec<u8>);

/// ECDH-encrypted recovery key share, routed verbatim to its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedKeyShare(pub Vec<u8>);

/// Hash binding a DKG's details to its full ordered round-1 commitment set.
///
/// Round-2 submissions sign this hash, proving the sender saw the same
/// commitment set as everyone else.
pub fn hash_with_commitments<'a, D, I>(details: &D, commitments: I) -> Result<[u8; 32], CryptoError>
where
    D: Serialize,
    I: IntoIterator<Item = (u16, &'a DkgCommitment)>,
{
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(details)?);
    for (id, commitment) in commitments {
        hasher.update(id.to_be_bytes());
        hasher.update(canonical_bytes(commitment)?);
    }
    Ok(hasher.finalize().into())
}

/// Recover the `u16` index a FROST identifier was built from.
///
/// Identifiers serialize as big-endian scalars; the index occupies the last
/// two bytes.
pub fn identifier_index(id: &FrostIdentifier) -> u16 {
    let bytes = id.serialize();
    let len = bytes.len();
    if len >= 2 {
        u16::from_be_bytes([bytes[len - 2], bytes[len - 1]])
    } else {
        0
    }
}

/// Public half of an aggregate FROST key, HD-capable.
///
/// Carries everything the server needs to verify signature shares against a
/// derived child key: the group verifying key, the per-participant verifying
/// shares, the signing threshold, and the chain code for unhardened
/// derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateKeyInfo {
    /// Serialized group verifying key; identifies the key set.
    pub group_key: GroupKey,
    /// Signing threshold for this key set.
    pub threshold: u16,
    /// Serialized verifying share per participant index.
    pub verifying_shares: BTreeMap<u16, Vec<u8>>,
    /// Chain code for unhardened derivation.
    pub chain_code: [u8; 32],
}

impl AggregateKeyInfo {
    /// Build from a FROST public key package.
    pub fn from_public_key_package(
        package: &frost::keys::PublicKeyPackage,
        threshold: u16,
        chain_code: [u8; 32],
    ) -> Result<Self, CryptoError> {
        let group_key = GroupKey(
            package
                .verifying_key()
                .serialize()
                .map_err(|e| CryptoError::Frost(e.to_string()))?,
        );
        let mut verifying_shares = BTreeMap::new();
        for (id, share) in package.verifying_shares() {
            let bytes = share
                .serialize()
                .map_err(|e| CryptoError::Frost(e.to_string()))?;
            verifying_shares.insert(identifier_index(id), bytes);
        }
        Ok(Self {
            group_key,
            threshold,
            verifying_shares,
            chain_code,
        })
    }

    /// Derive the child key set along an unhardened path.
    ///
    /// Each level adds `t_i * G` to the group key and to every verifying
    /// share, where `t_i = SHA-256(chain code ‖ parent group key ‖ index)`
    /// reduced to a scalar; a constant-term shift of the underlying secret
    /// polynomial moves all shares by the same amount.
    pub fn derive(&self, path: &[u32]) -> Result<DerivedKey, CryptoError> {
        let (group_key_bytes, share_bytes) = if path.is_empty() {
            (self.group_key.0.clone(), self.verifying_shares.clone())
        } else {
            let mut group_point = parse_point(&self.group_key.0)?;
            let mut share_points: BTreeMap<u16, ProjectivePoint> = BTreeMap::new();
            for (&index, bytes) in &self.verifying_shares {
                share_points.insert(index, parse_point(bytes)?);
            }

            let mut parent = self.group_key.0.clone();
            for &index in path {
                let tweak = derive_tweak(&self.chain_code, &parent, index)?;
                let delta = ProjectivePoint::GENERATOR * tweak;
                group_point += delta;
                for point in share_points.values_mut() {
                    *point += delta;
                }
                parent = encode_point(&group_point);
            }

            let shares = share_points
                .iter()
                .map(|(index, point)| (*index, encode_point(point)))
                .collect();
            (encode_point(&group_point), shares)
        };

        let group_key = frost::VerifyingKey::deserialize(&group_key_bytes)
            .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;

        let mut verifying_shares = BTreeMap::new();
        let mut frost_shares = BTreeMap::new();
        for (index, bytes) in &share_bytes {
            let share = VerifyingShare::deserialize(bytes)
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
            let id = FrostIdentifier::try_from(*index)
                .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
            frost_shares.insert(id, share.clone());
            verifying_shares.insert(*index, share);
        }

        let public_key_package = frost::keys::PublicKeyPackage::new(frost_shares, group_key.clone());

        Ok(DerivedKey {
            group_key,
            verifying_shares,
            public_key_package,
            threshold: self.threshold,
        })
    }
}

/// A key set derived from an [`AggregateKeyInfo`] along an HD path.
#[derive(Debug, Clone)]
pub struct DerivedKey {
    pub group_key: frost::VerifyingKey,
    pub verifying_shares: BTreeMap<u16, VerifyingShare>,
    pub public_key_package: frost::keys::PublicKeyPackage,
    pub threshold: u16,
}

fn parse_point(bytes: &[u8]) -> Result<ProjectivePoint, CryptoError> {
    let key = SecpPublicKey::from_sec1_bytes(bytes)
        .map_err(|e| CryptoError::MalformedKey(e.to_string()))?;
    Ok(key.to_projective())
}

fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

fn derive_tweak(chain_code: &[u8; 32], parent: &[u8], index: u32) -> Result<Scalar, CryptoError> {
    let mut hasher = Sha256::new();
    hasher.update(chain_code);
    hasher.update(parent);
    hasher.update(index.to_be_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    Option::<Scalar>::from(Scalar::from_repr(digest.into()))
        .ok_or_else(|| CryptoError::MalformedKey("derived tweak is not a valid scalar".to_string()))
}

/// Verify one participant's signature share against a signing round.
///
/// Returns `false` for any failure, including malformed inputs; the caller
/// treats a non-verifying share as misbehaviour.
pub fn verify_signature_share(
    id: FrostIdentifier,
    verifying_share: &VerifyingShare,
    share: &SignatureShare,
    commitments: &BTreeMap<FrostIdentifier, SigningCommitment>,
    message: &[u8],
    group_key: &frost::VerifyingKey,
) -> bool {
    let signing_package = frost::SigningPackage::new(commitments.clone(), message);
    frost_core::verify_signature_share(id, verifying_share, share, &signing_package, group_key)
        .is_ok()
}

/// Aggregate a full set of verified shares into a Schnorr signature.
pub fn aggregate_signature(
    commitments: &BTreeMap<FrostIdentifier, SigningCommitment>,
    message: &[u8],
    shares: &BTreeMap<FrostIdentifier, SignatureShare>,
    public_key_package: &frost::keys::PublicKeyPackage,
) -> Result<SchnorrSignature, CryptoError> {
    let signing_package = frost::SigningPackage::new(commitments.clone(), message);
    frost::aggregate(&signing_package, shares, public_key_package)
        .map_err(|e| CryptoError::Frost(e.to_string()))
}
