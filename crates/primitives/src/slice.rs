//! Slice descriptors.
//!
//! A slice names the namespace subset two peers reconcile: a topology
//! prefix used to route protocol requests, a naming prefix deciding
//! which names belong, and an optional filter of name patterns. The
//! slice's identity is the SHA-256 digest of its canonical encoding;
//! descriptors that encode to the same bytes are the same slice.

use core::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::name::{pattern_match, Name};
use crate::wire::{tag, Reader, Writer};

/// Format version carried in every slice encoding.
pub const SLICE_VERSION: u64 = 20_110_614;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SliceError {
    #[error("unsupported slice version {0}")]
    Version(u64),

    #[error("unsupported filter clause op {0}")]
    ClauseOp(u64),

    #[error("malformed slice encoding: {0}")]
    Wire(#[from] crate::wire::WireError),
}

/// Digest identifying a slice.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SliceHash([u8; 32]);

impl SliceHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for SliceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for SliceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SliceHash({})", hex::encode(self.0))
    }
}

/// Description of a namespace subset to reconcile.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Slice {
    version: u64,
    topo_prefix: Name,
    naming_prefix: Name,
    filter: Vec<Name>,
}

impl Slice {
    pub fn new() -> Self {
        Self {
            version: SLICE_VERSION,
            ..Self::default()
        }
    }

    pub fn with_prefixes(topo_prefix: Name, naming_prefix: Name) -> Self {
        let mut slice = Self::new();
        slice.set_prefixes(topo_prefix, naming_prefix);
        slice
    }

    pub fn set_prefixes(&mut self, topo_prefix: Name, naming_prefix: Name) {
        self.topo_prefix = topo_prefix;
        self.naming_prefix = naming_prefix;
    }

    /// Appends a filter clause. Clause order is significant for the
    /// slice identity, so callers add clauses in a fixed order.
    pub fn add_clause(&mut self, pattern: Name) {
        self.filter.push(pattern);
    }

    pub fn topo_prefix(&self) -> &Name {
        &self.topo_prefix
    }

    pub fn naming_prefix(&self) -> &Name {
        &self.naming_prefix
    }

    pub fn filter(&self) -> &[Name] {
        &self.filter
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// A name belongs to the slice when the naming prefix applies and
    /// either the filter is empty or some pattern matches the tail
    /// after the prefix.
    pub fn contains(&self, name: &Name) -> bool {
        if !name.starts_with(&self.naming_prefix) {
            return false;
        }
        if self.filter.is_empty() {
            return true;
        }
        let start = self.naming_prefix.component_count();
        self.filter
            .iter()
            .any(|pattern| pattern_match(pattern, name, start))
    }

    /// Canonical encoding: version, topo prefix, naming prefix, then
    /// one `(op = 0, pattern)` pair per filter clause.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.nested(tag::CONFIG_SLICE, |s| {
            s.uint(tag::SYNC_VERSION, self.version);
            self.topo_prefix.encode_into(s);
            self.naming_prefix.encode_into(s);
            s.nested(tag::CONFIG_SLICE_LIST, |list| {
                for clause in &self.filter {
                    list.uint(tag::CONFIG_SLICE_OP, 0);
                    clause.encode_into(list);
                }
            });
        });
        w.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SliceError> {
        let mut outer = Reader::new(bytes);
        let mut r = outer.nested(tag::CONFIG_SLICE)?;
        let version = r.uint(tag::SYNC_VERSION)?;
        if version != SLICE_VERSION {
            return Err(SliceError::Version(version));
        }
        let topo_prefix = Name::decode_from(&mut r)?;
        let naming_prefix = Name::decode_from(&mut r)?;
        let mut list = r.nested(tag::CONFIG_SLICE_LIST)?;
        let mut filter = Vec::new();
        while !list.at_end() {
            let op = list.uint(tag::CONFIG_SLICE_OP)?;
            if op != 0 {
                return Err(SliceError::ClauseOp(op));
            }
            filter.push(Name::decode_from(&mut list)?);
        }
        r.finish()?;
        outer.finish()?;
        Ok(Self {
            version,
            topo_prefix,
            naming_prefix,
            filter,
        })
    }

    /// The slice identity: digest of the canonical encoding.
    pub fn hash(&self) -> SliceHash {
        let mut hasher = Sha256::new();
        hasher.update(self.encode());
        SliceHash(hasher.finalize().into())
    }
}
