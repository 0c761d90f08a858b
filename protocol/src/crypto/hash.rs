//! # Hashing Utilities
//!
//! BLAKE3 is the only hash function the engine's reference collaborators
//! use: proposal hashes, parent links, and the digest signed in committed
//! seals are all 32-byte BLAKE3 outputs.
//!
//! Proposal hashing is domain separated from committed-seal hashing so a
//! signature over one can never be replayed as the other.

/// A 32-byte digest.
pub type Hash = [u8; 32];

/// Domain tag for proposal hashes.
const PROPOSAL_DOMAIN: &str = "ibft-protocol 2026 proposal hash";

/// Domain tag for the digest a committed seal signs.
const SEAL_DOMAIN: &str = "ibft-protocol 2026 committed seal";

/// Compute the BLAKE3 hash of the input data.
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute a domain-separated hash using BLAKE3's `derive_key` mode.
pub fn domain_separated_hash(context: &str, data: &[u8]) -> Hash {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    hasher.update(data);
    *hasher.finalize().as_bytes()
}

/// Hash of a raw proposal.
///
/// Depends only on the proposal bytes, not on the round it was proposed in,
/// so a proposal re-proposed in a later round keeps its hash.
pub fn proposal_hash(raw_proposal: &[u8]) -> Hash {
    domain_separated_hash(PROPOSAL_DOMAIN, raw_proposal)
}

/// The digest a validator signs to produce a committed seal.
pub fn seal_digest(proposal_hash: &Hash) -> Hash {
    domain_separated_hash(SEAL_DOMAIN, proposal_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"block"), blake3_hash(b"block"));
        assert_ne!(blake3_hash(b"block"), blake3_hash(b"blocks"));
    }

    #[test]
    fn proposal_and_seal_domains_do_not_collide() {
        let data = [0x11u8; 32];
        assert_ne!(proposal_hash(&data), seal_digest(&data));
        assert_ne!(proposal_hash(&data), blake3_hash(&data));
    }
}
