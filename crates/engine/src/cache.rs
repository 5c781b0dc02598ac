//! The per-slice hash cache.
//!
//! Canonical in-memory index of every tree node the slice knows
//! about, keyed by node hash. Entries carry up to two bodies for the
//! same hash (one we authored or loaded locally, one received from a
//! peer), OR-only state bits, and a busy count pinning the entry
//! while a walker stands on it.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use namesync_primitives::TreeHash;
use tracing::trace;

use crate::node::NodeArc;

/// Which side first produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    None,
    Local,
    Remote,
}

/// State bits of a cache entry. Bits are only ever set (except
/// `fetching` and `marked`, which the owner clears explicitly).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryState {
    /// A local node with this hash exists (authored or repo-loaded).
    pub local: bool,
    /// The hash has been seen from a peer.
    pub remote: bool,
    /// A node fetch is in flight.
    pub fetching: bool,
    /// Nothing under this remote hash is missing locally.
    pub covered: bool,
    /// Queued for persistent storage.
    pub storing: bool,
    /// Persisted through the repo hook.
    pub stored: bool,
    /// Reachability mark used by the purge sweep.
    pub marked: bool,
}

/// One entry of the hash cache.
#[derive(Debug)]
pub struct CacheEntry {
    hash: TreeHash,
    small: u32,
    /// Assigned in creation order; diagnostic only.
    pub index: u64,
    pub state: EntryState,
    busy: u32,
    local_node: Option<NodeArc>,
    remote_node: Option<NodeArc>,
    pub last_used: Instant,
}

impl CacheEntry {
    pub fn hash(&self) -> &TreeHash {
        &self.hash
    }

    pub fn small(&self) -> u32 {
        self.small
    }

    pub fn busy(&self) -> u32 {
        self.busy
    }

    /// Preferred body: the local node, falling back to the remote one.
    pub fn node(&self) -> Option<&NodeArc> {
        self.local_node.as_ref().or(self.remote_node.as_ref())
    }

    pub fn local_node(&self) -> Option<&NodeArc> {
        self.local_node.as_ref()
    }

    pub fn has_body(&self) -> bool {
        self.local_node.is_some() || self.remote_node.is_some()
    }

    /// Covered: a local twin exists, or differencing already proved
    /// the subtree holds nothing new. Local presence upgrades lazily.
    pub fn is_covered(&mut self) -> bool {
        if self.state.covered {
            return true;
        }
        if self.state.local {
            self.mark_covered();
            return true;
        }
        false
    }

    /// Sets `covered`, which only means something for a hash a peer
    /// has named.
    pub fn mark_covered(&mut self) {
        if self.state.remote || self.state.local {
            self.state.covered = true;
        }
    }
}

/// Hash-keyed node index for one slice.
#[derive(Debug, Default)]
pub struct HashCache {
    entries: HashMap<TreeHash, CacheEntry>,
    /// Hashes queued for persistent storage, oldest first.
    store_queue: VecDeque<TreeHash>,
    next_index: u64,
    probes: u64,
    misses: u64,
}

impl HashCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn probes(&self) -> u64 {
        self.probes
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn lookup(&mut self, hash: &TreeHash) -> Option<&CacheEntry> {
        self.probes += 1;
        let entry = self.entries.get(hash);
        if entry.is_none() {
            self.misses += 1;
        }
        entry
    }

    pub fn lookup_mut(&mut self, hash: &TreeHash) -> Option<&mut CacheEntry> {
        self.probes += 1;
        let entry = self.entries.get_mut(hash);
        if entry.is_none() {
            self.misses += 1;
        }
        entry
    }

    /// Returns the entry for `hash`, creating it if needed, and ORs
    /// in the origin bit. Entering a hash as local while it is
    /// already remote (or vice versa) covers it.
    pub fn enter(&mut self, hash: &TreeHash, origin: Origin) -> &mut CacheEntry {
        debug_assert!(!hash.is_empty(), "empty hash never enters the cache");
        self.probes += 1;
        let next_index = &mut self.next_index;
        let misses = &mut self.misses;
        let entry = self.entries.entry(hash.clone()).or_insert_with(|| {
            *misses += 1;
            *next_index += 1;
            trace!(%hash, index = *next_index, "new cache entry");
            CacheEntry {
                hash: hash.clone(),
                small: hash.small(),
                index: *next_index,
                state: EntryState::default(),
                busy: 0,
                local_node: None,
                remote_node: None,
                last_used: Instant::now(),
            }
        });
        match origin {
            Origin::None => {}
            Origin::Local => entry.state.local = true,
            Origin::Remote => entry.state.remote = true,
        }
        if entry.state.local && entry.state.remote {
            entry.state.covered = true;
        }
        entry
    }

    /// Installs a locally authored or repo-loaded body.
    pub fn install_local(&mut self, node: NodeArc) -> &mut CacheEntry {
        let hash = node.hash().clone();
        let entry = self.enter(&hash, Origin::Local);
        if entry.local_node.is_none() {
            entry.local_node = Some(node);
        }
        if entry.state.remote {
            entry.state.covered = true;
        }
        entry
    }

    /// Installs a body received from a peer.
    pub fn install_remote(&mut self, node: NodeArc) -> &mut CacheEntry {
        let hash = node.hash().clone();
        let entry = self.enter(&hash, Origin::Remote);
        if entry.remote_node.is_none() {
            entry.remote_node = Some(node);
        }
        if entry.state.local {
            entry.state.covered = true;
        }
        entry
    }

    /// Removes an entry. Refused while a walker pins it.
    pub fn remove(&mut self, hash: &TreeHash) -> bool {
        match self.entries.get(hash) {
            Some(entry) if entry.busy == 0 => {
                self.entries.remove(hash);
                true
            }
            _ => false,
        }
    }

    /// Clears the reachability marks ahead of a sweep.
    pub fn clear_marks(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state.marked = false;
        }
    }

    /// Pins an entry against eviction; every `pin` is balanced by an
    /// `unpin` when the walker leaves the node.
    pub fn pin(&mut self, hash: &TreeHash) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.busy += 1;
        }
    }

    pub fn unpin(&mut self, hash: &TreeHash) {
        if let Some(entry) = self.entries.get_mut(hash) {
            entry.busy = entry.busy.saturating_sub(1);
        }
    }

    /// Queues a freshly built local node for persistent storage.
    pub fn queue_store(&mut self, hash: &TreeHash) {
        if let Some(entry) = self.entries.get_mut(hash) {
            if !entry.state.storing && !entry.state.stored {
                entry.state.storing = true;
                self.store_queue.push_back(hash.clone());
            }
        }
    }

    /// Next hash awaiting storage, if any.
    pub fn pop_store(&mut self) -> Option<TreeHash> {
        self.store_queue.pop_front()
    }

    pub fn store_backlog(&self) -> usize {
        self.store_queue.len()
    }

    /// Evicts entries that are unmarked, unpinned, not storing, and
    /// idle for at least `min_idle` seconds worth of duration.
    /// Returns the number of entries dropped.
    pub fn purge_unmarked(&mut self, min_idle: std::time::Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.state.marked
                || entry.busy > 0
                || entry.state.storing
                || now.duration_since(entry.last_used) < min_idle
        });
        before - self.entries.len()
    }

    /// All entry hashes; diagnostic use.
    pub fn hashes(&self) -> impl Iterator<Item = &TreeHash> {
        self.entries.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeBuilder;
    use std::sync::Arc;
    use std::time::Duration;

    fn sample_node() -> NodeArc {
        let mut b = NodeBuilder::new();
        b.add_leaf(&"/a".parse().unwrap());
        Arc::new(b.finish().unwrap())
    }

    #[test]
    fn enter_is_or_only() {
        let mut cache = HashCache::new();
        let hash = TreeHash::from_bytes(vec![1, 2, 3]);

        let entry = cache.enter(&hash, Origin::Remote);
        assert!(entry.state.remote);
        assert!(!entry.state.covered);

        let entry = cache.enter(&hash, Origin::Local);
        assert!(entry.state.remote && entry.state.local);
        assert!(entry.state.covered, "local + remote covers the entry");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn install_local_over_remote_covers() {
        let mut cache = HashCache::new();
        let node = sample_node();
        cache.enter(node.hash(), Origin::Remote);
        let entry = cache.install_local(node.clone());
        assert!(entry.state.covered);
        assert!(entry.local_node().is_some());
    }

    #[test]
    fn busy_entries_refuse_removal() {
        let mut cache = HashCache::new();
        let hash = TreeHash::from_bytes(vec![9; 8]);
        cache.enter(&hash, Origin::Remote);

        cache.pin(&hash);
        assert!(!cache.remove(&hash));
        cache.unpin(&hash);
        assert!(cache.remove(&hash));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn store_queue_is_fifo_and_once() {
        let mut cache = HashCache::new();
        let a = TreeHash::from_bytes(vec![1; 4]);
        let b = TreeHash::from_bytes(vec![2; 4]);
        cache.enter(&a, Origin::Local);
        cache.enter(&b, Origin::Local);

        cache.queue_store(&a);
        cache.queue_store(&b);
        cache.queue_store(&a); // duplicate ignored

        assert_eq!(cache.pop_store().as_ref(), Some(&a));
        assert_eq!(cache.pop_store().as_ref(), Some(&b));
        assert_eq!(cache.pop_store(), None);
    }

    #[test]
    fn purge_respects_marks_and_pins() {
        let mut cache = HashCache::new();
        let marked = TreeHash::from_bytes(vec![1; 4]);
        let pinned = TreeHash::from_bytes(vec![2; 4]);
        let stale = TreeHash::from_bytes(vec![3; 4]);
        cache.enter(&marked, Origin::Remote).state.marked = true;
        cache.enter(&pinned, Origin::Remote);
        cache.pin(&pinned);
        cache.enter(&stale, Origin::Remote);

        let dropped = cache.purge_unmarked(Duration::ZERO);
        assert_eq!(dropped, 1);
        assert!(cache.lookup(&marked).is_some());
        assert!(cache.lookup(&pinned).is_some());
        assert!(cache.lookup(&stale).is_none());
    }

    #[test]
    fn miss_accounting() {
        let mut cache = HashCache::new();
        let hash = TreeHash::from_bytes(vec![7; 4]);
        assert!(cache.lookup(&hash).is_none());
        assert_eq!(cache.misses(), 1);
        cache.enter(&hash, Origin::None);
        assert!(cache.lookup(&hash).is_some());
        assert_eq!(cache.probes(), 3);
    }
}
