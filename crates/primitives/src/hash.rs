//! Tree hashes and the long-hash accumulator.
//!
//! A node's hash is the fold of its children's contributions in a
//! fixed-width accumulator: each contribution is added into the low
//! (high-index) end with byte-wise carry propagated upward. The fold
//! is commutative, so the hash depends only on the multiset of
//! contributions; the arithmetic is part of the observable protocol
//! and peers must agree on it bit for bit.

use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::name::Name;

/// Width of the accumulator window: a 32-byte digest plus headroom
/// for carries out of repeated additions.
pub const MAX_HASH_BYTES: usize = 40;

/// Final hash of a tree node, or of a whole tree (its root node).
///
/// Variable length: the tail of the accumulator from the lowest
/// touched byte. The empty hash names the empty tree.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TreeHash(Vec<u8>);

impl TreeHash {
    /// The hash of the empty tree (zero bytes).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Small probe hash: the leading bytes folded into a `u32`.
    /// Collisions are resolved with the full hash.
    pub fn small(&self) -> u32 {
        self.0
            .iter()
            .take(4)
            .fold(0u32, |acc, b| (acc << 8) | u32::from(*b))
    }
}

impl AsRef<[u8]> for TreeHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(empty)");
        }
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({self})")
    }
}

/// Fixed-width accumulator for combining child hashes.
///
/// `pos` is the lowest index of a valid byte; bytes fill from high
/// index toward low as carries propagate.
#[derive(Clone)]
pub struct LongHash {
    pos: usize,
    bytes: [u8; MAX_HASH_BYTES],
}

impl Default for LongHash {
    fn default() -> Self {
        Self {
            pos: MAX_HASH_BYTES,
            bytes: [0; MAX_HASH_BYTES],
        }
    }
}

impl LongHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a contribution with carry propagated toward index 0.
    pub fn accumulate(&mut self, contribution: &[u8]) {
        debug_assert!(contribution.len() >= 2, "degenerate hash contribution");
        let mut xs = contribution.len();
        let mut pos = MAX_HASH_BYTES;
        let mut carry: u32 = 0;
        while xs > 0 && pos > 0 {
            xs -= 1;
            pos -= 1;
            let sum = carry + u32::from(self.bytes[pos]) + u32::from(contribution[xs]);
            carry = (sum >> 8) & 0xff;
            self.bytes[pos] = (sum & 0xff) as u8;
        }
        while carry > 0 && pos > 0 {
            pos -= 1;
            let sum = carry + u32::from(self.bytes[pos]);
            self.bytes[pos] = (sum & 0xff) as u8;
            carry = (sum >> 8) & 0xff;
        }
        if pos < self.pos {
            self.pos = pos;
        }
    }

    /// The accumulated hash: the tail from the lowest touched byte.
    /// Untouched (`pos == MAX_HASH_BYTES`) yields the empty hash.
    pub fn finish(&self) -> TreeHash {
        TreeHash(self.bytes[self.pos..].to_vec())
    }
}

impl fmt::Debug for LongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LongHash({})", self.finish())
    }
}

/// Contribution a leaf name makes to its node's hash: the SHA-256
/// digest of the name's canonical encoding.
pub fn leaf_digest(name: &Name) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.encode());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_accumulator_is_empty_hash() {
        assert!(LongHash::new().finish().is_empty());
        assert_eq!(LongHash::new().finish(), TreeHash::empty());
    }

    #[test]
    fn accumulation_is_order_independent() {
        let a = [0x10u8; 32];
        let b = [0xEEu8; 32];
        let c = [0x07u8; 32];

        let mut fwd = LongHash::new();
        fwd.accumulate(&a);
        fwd.accumulate(&b);
        fwd.accumulate(&c);

        let mut rev = LongHash::new();
        rev.accumulate(&c);
        rev.accumulate(&a);
        rev.accumulate(&b);

        assert_eq!(fwd.finish(), rev.finish());
    }

    #[test]
    fn carry_propagates_upward() {
        let mut acc = LongHash::new();
        acc.accumulate(&[0xFF, 0xFF]);
        acc.accumulate(&[0x00, 0x01]);
        // 0xFFFF + 0x0001 = 0x1_0000: three valid bytes now
        let hash = acc.finish();
        assert_eq!(hash.as_bytes(), &[0x01, 0x00, 0x00]);
    }

    #[test]
    fn width_grows_only_downward() {
        let mut acc = LongHash::new();
        acc.accumulate(&[0x01, 0x02, 0x03]);
        assert_eq!(acc.finish().len(), 3);
        acc.accumulate(&[0x04, 0x05]);
        assert_eq!(acc.finish().len(), 3);
        assert_eq!(acc.finish().as_bytes(), &[0x01, 0x06, 0x08]);
    }

    #[test]
    fn small_hash_uses_leading_bytes() {
        let h = TreeHash::from_bytes(vec![0xDE, 0xAD, 0xBE, 0xEF, 0x99]);
        assert_eq!(h.small(), 0xDEADBEEF);
        assert_eq!(TreeHash::empty().small(), 0);
    }

    #[test]
    fn leaf_digest_is_stable() {
        let name: Name = "/a/b".parse().unwrap();
        assert_eq!(leaf_digest(&name), leaf_digest(&name.clone()));
        let other: Name = "/a/c".parse().unwrap();
        assert_ne!(leaf_digest(&name), leaf_digest(&other));
    }
}
