//! ECDSA P-256 signature operations.
//!
//! The certificate profile admits exactly one suite: ECDSA over NIST P-256
//! with SHA-256. Public keys travel as uncompressed SEC1 points (65 bytes,
//! leading `0x04`); signatures as the raw `(r, s)` scalar pair.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::rand_core::OsRng;
use zeroize::Zeroizing;

use crate::status::Status;

/// Length of an uncompressed SEC1 P-256 point.
pub const PUBLIC_KEY_LEN: usize = 65;
/// Length of a P-256 scalar (private key, and each signature component).
pub const SCALAR_LEN: usize = 32;

/// Algorithm tag for ECDSA with SHA-256 (the only registered algorithm).
pub const ALGORITHM_ECDSA_SHA_256: u8 = 0;
/// Curve tag for NIST P-256 (the only registered curve).
pub const CURVE_NIST_P256: u8 = 0;

/// An ECDSA P-256 signature as its raw scalar pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EccSignature {
    /// The `r` component, big-endian.
    pub r: [u8; SCALAR_LEN],
    /// The `s` component, big-endian.
    pub s: [u8; SCALAR_LEN],
}

impl Default for EccSignature {
    fn default() -> Self {
        Self {
            r: [0; SCALAR_LEN],
            s: [0; SCALAR_LEN],
        }
    }
}

/// A P-256 public key in uncompressed point form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EccPublicKey {
    point: [u8; PUBLIC_KEY_LEN],
}

impl EccPublicKey {
    /// Builds a public key from an uncompressed SEC1 point.
    ///
    /// # Errors
    ///
    /// Returns [`Status::InvalidData`] if the bytes are not a valid
    /// uncompressed P-256 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Status> {
        if bytes.len() != PUBLIC_KEY_LEN || bytes[0] != 0x04 {
            return Err(Status::InvalidData);
        }
        // Round-trip through the arithmetic type so off-curve points are
        // rejected here rather than at verify time.
        VerifyingKey::from_sec1_bytes(bytes).map_err(|_| Status::InvalidData)?;
        let mut point = [0u8; PUBLIC_KEY_LEN];
        point.copy_from_slice(bytes);
        Ok(Self { point })
    }

    /// The uncompressed SEC1 point, `0x04 || x || y`.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.point
    }

    /// The 64-byte coordinate pair without the `0x04` prefix.
    #[must_use]
    pub fn coordinates(&self) -> &[u8] {
        &self.point[1..]
    }

    /// Verifies an ECDSA-SHA-256 signature over `data`.
    ///
    /// # Errors
    ///
    /// Returns [`Status::DecryptionFailed`] when the signature does not
    /// verify, [`Status::InvalidData`] if the key or signature is malformed.
    pub fn verify_sha256(&self, data: &[u8], sig: &EccSignature) -> Result<(), Status> {
        let key = VerifyingKey::from_sec1_bytes(&self.point).map_err(|_| Status::InvalidData)?;
        let signature =
            Signature::from_scalars(sig.r, sig.s).map_err(|_| Status::InvalidData)?;
        key.verify(data, &signature)
            .map_err(|_| Status::DecryptionFailed)
    }
}

/// A P-256 private key.
pub struct EccPrivateKey {
    key: SigningKey,
}

impl EccPrivateKey {
    /// Builds a private key from a big-endian scalar.
    ///
    /// # Errors
    ///
    /// Returns [`Status::InvalidData`] if the scalar is out of range.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Status> {
        let key = SigningKey::from_slice(bytes).map_err(|_| Status::InvalidData)?;
        Ok(Self { key })
    }

    /// Exports the big-endian scalar in a zeroizing container.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; SCALAR_LEN]> {
        let mut out = Zeroizing::new([0u8; SCALAR_LEN]);
        out.copy_from_slice(&self.key.to_bytes());
        out
    }

    /// The corresponding public key.
    #[must_use]
    pub fn public_key(&self) -> EccPublicKey {
        let point = self.key.verifying_key().to_encoded_point(false);
        let mut bytes = [0u8; PUBLIC_KEY_LEN];
        bytes.copy_from_slice(point.as_bytes());
        EccPublicKey { point: bytes }
    }

    /// Signs `data` with ECDSA-SHA-256 and returns the scalar pair.
    #[must_use]
    pub fn sign_sha256(&self, data: &[u8]) -> EccSignature {
        let signature: Signature = self.key.sign(data);
        let (r, s) = signature.split_bytes();
        let mut sig = EccSignature::default();
        sig.r.copy_from_slice(&r);
        sig.s.copy_from_slice(&s);
        sig
    }
}

impl Clone for EccPrivateKey {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
        }
    }
}

impl std::fmt::Debug for EccPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("EccPrivateKey").finish_non_exhaustive()
    }
}

/// A freshly generated P-256 key pair.
pub struct EccKeyPair {
    /// The private half.
    pub private_key: EccPrivateKey,
    /// The public half.
    pub public_key: EccPublicKey,
}

impl EccKeyPair {
    /// Generates a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let private_key = EccPrivateKey { key };
        let public_key = private_key.public_key();
        Self {
            private_key,
            public_key,
        }
    }
}

/// Binds a public key to its algorithm and curve tags plus an optional key
/// identifier, the form exchanged in application-state signals and claim
/// ceremonies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    /// Algorithm tag; always [`ALGORITHM_ECDSA_SHA_256`].
    pub algorithm: u8,
    /// Curve tag; always [`CURVE_NIST_P256`].
    pub curve: u8,
    /// Optional key identifier (issuer-assigned).
    pub key_id: Vec<u8>,
    /// The public key.
    pub public_key: EccPublicKey,
}

impl KeyInfo {
    /// Builds a key info record for a public key with no key id.
    #[must_use]
    pub fn new(public_key: EccPublicKey) -> Self {
        Self {
            algorithm: ALGORITHM_ECDSA_SHA_256,
            curve: CURVE_NIST_P256,
            key_id: Vec::new(),
            public_key,
        }
    }

    /// Sets the key identifier.
    #[must_use]
    pub fn with_key_id(mut self, key_id: Vec<u8>) -> Self {
        self.key_id = key_id;
        self
    }
}
