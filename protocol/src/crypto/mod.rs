//! # Cryptographic Primitives
//!
//! Thin, type-safe wrappers around audited implementations:
//!
//! - **Ed25519** (`ed25519-dalek`) for message signatures and committed seals.
//! - **BLAKE3** for proposal hashes and seal digests.
//!
//! The consensus core never calls into this module directly. It only sees
//! opaque ids, signatures, and hashes, and asks the `Backend` to check them.
//! The reference backend in `local` is the one consumer.

pub mod hash;
pub mod keys;

pub use hash::{blake3_hash, proposal_hash, seal_digest, Hash};
pub use keys::{KeyError, Signature, ValidatorId, ValidatorKeypair};
