//! Cache of recent update deltas.
//!
//! Each completed update may leave behind the ordered list of names
//! that turned one root into the next, together with its wire coding.
//! When a peer advises the old root, the reply is the delta list
//! instead of forcing the peer through a full differencing pass.

use std::collections::VecDeque;
use std::time::Instant;

use namesync_primitives::wire::{tag, Reader, Writer};
use namesync_primitives::{Name, TreeHash, DELTAS_VERSION};
use tracing::trace;

use crate::error::CodecError;

/// Retained delta records per slice.
pub const N_DELTAS_LIMIT: usize = 4;

/// One closed (old root → new root) name list.
#[derive(Debug, Clone)]
pub struct DeltaRecord {
    pub old_root: TreeHash,
    pub new_root: TreeHash,
    pub names: Vec<Name>,
    /// Canonical wire coding, ready to serve as an advise reply.
    pub coding: Vec<u8>,
    pub when_made: Instant,
    pub when_sent: Option<Instant>,
}

/// An update run's delta list under construction.
#[derive(Debug)]
pub struct DeltaDraft {
    old_root: TreeHash,
    names: Vec<Name>,
    body: Writer,
    byte_budget: usize,
    overflowed: bool,
}

impl DeltaDraft {
    fn new(old_root: TreeHash, byte_budget: usize) -> Self {
        let mut body = Writer::new();
        body.uint(tag::SYNC_VERSION, DELTAS_VERSION);
        Self {
            old_root,
            names: Vec::new(),
            body,
            byte_budget,
            overflowed: false,
        }
    }

    /// Adds one name; once the budget is blown the draft is dead and
    /// the peer will fall back to node fetches.
    pub fn push(&mut self, name: &Name) {
        if self.overflowed {
            return;
        }
        if self.body.len() + name.encoded_len() > self.byte_budget {
            self.overflowed = true;
            self.names.clear();
            return;
        }
        name.encode_into(&mut self.body);
        self.names.push(name.clone());
    }

    pub fn is_usable(&self) -> bool {
        !self.overflowed && !self.names.is_empty()
    }
}

/// Encodes a closed delta list.
fn close_coding(body: Writer) -> Vec<u8> {
    let mut w = Writer::new();
    w.element(tag::NODE_DELTAS, &body.into_bytes());
    w.into_bytes()
}

/// Parses a delta reply; returns the carried names.
pub fn decode_deltas(bytes: &[u8]) -> Result<Vec<Name>, CodecError> {
    let mut outer = Reader::new(bytes);
    let mut r = outer.nested(tag::NODE_DELTAS)?;
    outer.finish()?;
    let version = r.uint(tag::SYNC_VERSION)?;
    if version != DELTAS_VERSION {
        return Err(CodecError::VersionMismatch(version));
    }
    let mut names = Vec::new();
    while !r.at_end() {
        names.push(Name::decode_from(&mut r)?);
    }
    Ok(names)
}

/// True when `bytes` parse as a delta reply rather than a node.
pub fn is_deltas_coding(bytes: &[u8]) -> bool {
    Reader::new(bytes).peek_tag() == Some(tag::NODE_DELTAS)
}

/// Bounded list of recent delta records, oldest first.
#[derive(Debug, Default)]
pub struct DeltasCache {
    records: VecDeque<DeltaRecord>,
    /// Byte budget per coding; zero disables delta replies entirely.
    byte_budget: usize,
}

impl DeltasCache {
    pub fn new(byte_budget: usize) -> Self {
        Self {
            records: VecDeque::new(),
            byte_budget,
        }
    }

    pub fn enabled(&self) -> bool {
        self.byte_budget > 0
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Opens a draft for an update starting at `old_root`, or `None`
    /// when delta replies are disabled.
    pub fn begin(&self, old_root: TreeHash) -> Option<DeltaDraft> {
        self.enabled()
            .then(|| DeltaDraft::new(old_root, self.byte_budget))
    }

    /// Closes a draft against the root the update produced. Empty,
    /// overflowed, and no-op drafts are dropped.
    pub fn close(&mut self, draft: DeltaDraft, new_root: TreeHash) -> bool {
        if !draft.is_usable() || draft.old_root == new_root {
            return false;
        }
        trace!(
            old = %draft.old_root,
            new = %new_root,
            names = draft.names.len(),
            "delta record closed"
        );
        self.records.push_back(DeltaRecord {
            old_root: draft.old_root,
            new_root,
            names: draft.names,
            coding: close_coding(draft.body),
            when_made: Instant::now(),
            when_sent: None,
        });
        while self.records.len() > N_DELTAS_LIMIT {
            self.records.pop_front();
        }
        true
    }

    /// Finds the record transforming `old_root`, marking it sent.
    pub fn find(&mut self, old_root: &TreeHash) -> Option<&DeltaRecord> {
        let idx = self
            .records
            .iter()
            .position(|r| &r.old_root == old_root)?;
        self.records[idx].when_sent = Some(Instant::now());
        Some(&self.records[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn hash(byte: u8) -> TreeHash {
        TreeHash::from_bytes(vec![byte; 8])
    }

    #[test]
    fn disabled_cache_yields_no_drafts() {
        let cache = DeltasCache::new(0);
        assert!(!cache.enabled());
        assert!(cache.begin(hash(1)).is_none());
    }

    #[test]
    fn coding_round_trip() {
        let mut cache = DeltasCache::new(4000);
        let mut draft = cache.begin(hash(1)).unwrap();
        draft.push(&name("/a"));
        draft.push(&name("/b"));
        assert!(cache.close(draft, hash(2)));

        let record = cache.find(&hash(1)).unwrap();
        assert_eq!(record.new_root, hash(2));
        assert!(is_deltas_coding(&record.coding));
        assert_eq!(
            decode_deltas(&record.coding).unwrap(),
            vec![name("/a"), name("/b")]
        );
        assert!(record.when_sent.is_some());
    }

    #[test]
    fn overflowed_draft_is_dropped() {
        let mut cache = DeltasCache::new(16);
        let mut draft = cache.begin(hash(1)).unwrap();
        for i in 0..10 {
            draft.push(&name(&format!("/very/long/name/{i}")));
        }
        assert!(!draft.is_usable());
        assert!(!cache.close(draft, hash(2)));
        assert!(cache.find(&hash(1)).is_none());
    }

    #[test]
    fn noop_updates_leave_no_record() {
        let mut cache = DeltasCache::new(4000);
        let mut draft = cache.begin(hash(3)).unwrap();
        draft.push(&name("/a"));
        assert!(!cache.close(draft, hash(3)), "old == new");
    }

    #[test]
    fn oldest_records_evict_first() {
        let mut cache = DeltasCache::new(4000);
        for i in 0..(N_DELTAS_LIMIT as u8 + 2) {
            let mut draft = cache.begin(hash(i)).unwrap();
            draft.push(&name("/x"));
            assert!(cache.close(draft, hash(i + 100)));
        }
        assert_eq!(cache.len(), N_DELTAS_LIMIT);
        assert!(cache.find(&hash(0)).is_none(), "evicted");
        assert!(cache.find(&hash(5)).is_some());
    }
}
