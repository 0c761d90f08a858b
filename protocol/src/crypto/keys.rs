//! # Validator Keys
//!
//! Ed25519 keypairs and the identities derived from them.
//!
//! A validator is identified on the wire by its 32-byte Ed25519 public key
//! ([`ValidatorId`]). Every consensus message carries the sender's id and a
//! signature over the rest of the message, and every commit carries a
//! committed seal: the sender's signature over the proposal hash.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (ed25519-dalek does this for us).
//! - Key generation uses `OsRng`.
//! - Secret key bytes are never logged or printed in `Debug` output.

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors that can occur during key operations.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not a valid scalar")]
    InvalidSecretKey,

    #[error("invalid public key bytes: not a valid Ed25519 point")]
    InvalidPublicKey,
}

// ---------------------------------------------------------------------------
// ValidatorId
// ---------------------------------------------------------------------------

/// The public identity of a validator: its raw Ed25519 public key.
///
/// Ordering is plain byte ordering. The validator manager sorts the set by
/// id, which makes proposer rotation identical on every node regardless of
/// the order in which voting powers were reported.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValidatorId([u8; 32]);

impl ValidatorId {
    /// Wraps raw public key bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded representation. 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verifies an Ed25519 signature made by this validator.
    ///
    /// Returns `false` for malformed keys or signatures instead of erroring:
    /// every caller only needs a yes/no answer.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig_bytes: [u8; 64] = match signature.as_bytes().try_into() {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let dalek_sig = DalekSignature::from_bytes(&sig_bytes);
        verifying_key.verify(message, &dalek_sig).is_ok()
    }
}

impl fmt::Display for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ValidatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first four bytes are plenty to tell validators apart in logs.
        write!(f, "ValidatorId({})", hex::encode(&self.0[..4]))
    }
}

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// An Ed25519 signature. Always 64 bytes when produced by [`ValidatorKeypair`];
/// anything else simply fails verification.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Wraps raw signature bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether no signature has been attached.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..self.0.len().min(8)]))
    }
}

// ---------------------------------------------------------------------------
// ValidatorKeypair
// ---------------------------------------------------------------------------

/// A validator's signing keypair.
///
/// Intentionally not `Serialize`: exporting a private key must be an explicit
/// call to [`secret_key_bytes`](Self::secret_key_bytes).
pub struct ValidatorKeypair {
    signing_key: SigningKey,
}

impl ValidatorKeypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Builds a keypair deterministically from a 32-byte seed.
    ///
    /// Used by the devnet runner and tests, where reproducible identities
    /// make logs comparable across runs.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Loads a keypair from a hex-encoded secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// The validator id (public key) of this keypair.
    pub fn id(&self) -> ValidatorId {
        ValidatorId(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs arbitrary bytes.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes().to_vec())
    }

    /// Exports the raw secret key. Handle with care.
    pub fn secret_key_bytes(&self) -> [u8; SECRET_KEY_LENGTH] {
        self.signing_key.to_bytes()
    }
}

impl Clone for ValidatorKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for ValidatorKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorKeypair(id={})", self.id().to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let kp = ValidatorKeypair::generate();
        let sig = kp.sign(b"prepare");
        assert!(kp.id().verify(b"prepare", &sig));
        assert!(!kp.id().verify(b"commit", &sig));
    }

    #[test]
    fn verification_rejects_foreign_key() {
        let alice = ValidatorKeypair::generate();
        let bob = ValidatorKeypair::generate();
        let sig = alice.sign(b"round change");
        assert!(!bob.id().verify(b"round change", &sig));
    }

    #[test]
    fn malformed_signature_fails_without_panicking() {
        let kp = ValidatorKeypair::generate();
        assert!(!kp.id().verify(b"x", &Signature::from_bytes(vec![1, 2, 3])));
        assert!(!kp.id().verify(b"x", &Signature::default()));
    }

    #[test]
    fn seeded_keys_are_deterministic() {
        let a = ValidatorKeypair::from_seed(&[7u8; 32]);
        let b = ValidatorKeypair::from_seed(&[7u8; 32]);
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn hex_round_trip_preserves_identity() {
        let kp = ValidatorKeypair::generate();
        let restored = ValidatorKeypair::from_hex(&hex::encode(kp.secret_key_bytes())).unwrap();
        assert_eq!(kp.id(), restored.id());
        assert!(ValidatorKeypair::from_hex("abcd").is_err());
    }

    #[test]
    fn debug_output_never_contains_secret() {
        let kp = ValidatorKeypair::from_seed(&[0xAB; 32]);
        let debug = format!("{:?}", kp);
        assert!(!debug.contains(&hex::encode([0xAB; 32])));
    }
}
