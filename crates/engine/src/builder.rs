//! Incremental tree builder.
//!
//! Merges a sorted batch of new names with an existing tree and
//! produces a new root whose leaf set is the union. The merge walks
//! the old tree in order, re-emitting every surviving name through a
//! per-level buffer that is cut into leaf nodes at the split
//! triggers; the leaf hashes are then bundled upward with the same
//! sizing discipline until a single root remains. Identical subtrees
//! come out with identical hashes, so unchanged regions of the old
//! tree are reused through the cache instead of being rebuilt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use namesync_primitives::hash::leaf_digest;
use namesync_primitives::{LongHash, Name, TreeHash};
use tracing::{debug, trace};

use crate::cache::HashCache;
use crate::error::SyncError;
use crate::node::{ref_cost, NodeArc, NodeBuilder, NodeRef};
use crate::walker::TreeWalker;

/// Names emitted between yield checks.
pub const NAMES_YIELD_INC: u64 = 100;
/// Elapsed time in one step that forces a yield.
pub const NAMES_YIELD_MICROS: u64 = 20_000;

/// Outcome of one builder step.
#[derive(Debug)]
pub enum BuildOutcome {
    /// Step budget exhausted; call `step` again to resume.
    Yielded,
    /// The new root. Equal to the old root when the batch added
    /// nothing new.
    Complete(TreeHash),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Merge,
    Bundle,
}

/// A resumable update run.
#[derive(Debug)]
pub struct TreeBuilder {
    start_root: TreeHash,
    adding: Vec<Name>,
    ax: usize,
    walker: TreeWalker,
    /// Buffer of emitted names awaiting a leaf-node cut.
    names: Vec<Name>,
    name_len_accum: usize,
    /// Finished nodes of the current level, in emission order.
    nodes: Vec<NodeArc>,
    names_added: u64,
    nodes_created: u64,
    nodes_shared: u64,
    phase: Phase,
    split_trigger: usize,
    hash_split_trigger: u8,
    started: Instant,
}

impl TreeBuilder {
    /// Prepares an update of `start_root` with `batch`.
    ///
    /// The batch is sorted and deduplicated here; an empty batch
    /// returns `None` and the caller keeps the old root.
    pub fn new(
        cache: &mut HashCache,
        start_root: TreeHash,
        mut batch: Vec<Name>,
        split_trigger: usize,
        hash_split_trigger: u8,
    ) -> Option<Self> {
        batch.sort_unstable();
        batch.dedup();
        if batch.is_empty() {
            return None;
        }
        let walker = TreeWalker::new(cache, &start_root);
        Some(Self {
            start_root,
            adding: batch,
            ax: 0,
            walker,
            names: Vec::new(),
            name_len_accum: 0,
            nodes: Vec::new(),
            names_added: 0,
            nodes_created: 0,
            nodes_shared: 0,
            phase: Phase::Merge,
            split_trigger,
            hash_split_trigger,
            started: Instant::now(),
        })
    }

    pub fn start_root(&self) -> &TreeHash {
        &self.start_root
    }

    pub fn names_added(&self) -> u64 {
        self.names_added
    }

    pub fn nodes_created(&self) -> u64 {
        self.nodes_created
    }

    pub fn nodes_shared(&self) -> u64 {
        self.nodes_shared
    }

    /// Releases walker pins after a cancelled or failed run.
    pub fn abandon(&mut self, cache: &mut HashCache) {
        self.walker.clear(cache);
    }

    /// Advances the run by one bounded step.
    pub fn step(&mut self, cache: &mut HashCache) -> Result<BuildOutcome, SyncError> {
        let entered = Instant::now();
        if self.phase == Phase::Merge {
            if !self.merge_step(cache, entered)? {
                return Ok(BuildOutcome::Yielded);
            }
            // flush whatever is left in the name buffer
            self.cut_leaf_node(cache, 0)?;
            self.phase = Phase::Bundle;
        }

        let root = self.bundle(cache)?;
        self.walker.clear(cache);
        debug!(
            names = self.names_added,
            created = self.nodes_created,
            shared = self.nodes_shared,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            %root,
            "tree update complete"
        );
        Ok(BuildOutcome::Complete(root))
    }

    /// Order-merge of the old tree's leaves with the batch. Returns
    /// `Ok(false)` on a yield, `Ok(true)` when both inputs are
    /// drained.
    fn merge_step(&mut self, cache: &mut HashCache, entered: Instant) -> Result<bool, SyncError> {
        let budget = Duration::from_micros(NAMES_YIELD_MICROS);
        let mut names_lim = self.names_added + NAMES_YIELD_INC;
        while let Some(frame) = self.walker.top() {
            let hash = frame.hash.clone();
            let pos = frame.pos;
            let Some(node) = cache.lookup(&hash).and_then(|e| e.node()).cloned() else {
                self.walker.clear(cache);
                return Err(SyncError::CacheCorruption(hash));
            };
            if pos >= node.ref_count() {
                if let Some(parent) = self.walker.pop(cache) {
                    parent.pos += 1;
                }
                continue;
            }
            match node.ref_at(pos).expect("position bounded") {
                NodeRef::Node(_) => {
                    let _ = self.walker.push(cache);
                    continue;
                }
                NodeRef::Leaf(tree_name) => {
                    let tree_name = tree_name.clone();
                    match self.adding.get(self.ax) {
                        Some(next) if *next < tree_name => {
                            // batch name precedes the tree leaf
                            let next = next.clone();
                            self.ax += 1;
                            self.emit(cache, next)?;
                        }
                        Some(next) if *next == tree_name => {
                            // duplicate: the tree side will emit it
                            self.ax += 1;
                        }
                        _ => {
                            // tree leaf precedes any remaining batch name
                            self.emit(cache, tree_name)?;
                            self.walker.top_mut().expect("frame exists").pos += 1;
                        }
                    }
                    if self.names_added >= names_lim {
                        if entered.elapsed() >= budget {
                            trace!(names = self.names_added, "update yield");
                            return Ok(false);
                        }
                        names_lim += NAMES_YIELD_INC;
                    }
                }
            }
        }
        // old tree drained; the rest of the batch is all new
        while self.ax < self.adding.len() {
            let name = self.adding[self.ax].clone();
            self.ax += 1;
            self.emit(cache, name)?;
        }
        Ok(true)
    }

    /// Adds one name to the buffer, cutting a leaf node when the
    /// accumulated size reaches the split window.
    fn emit(&mut self, cache: &mut HashCache, name: Name) -> Result<(), SyncError> {
        self.name_len_accum += name.encoded_len();
        self.names.push(name);
        self.names_added += 1;
        if self.name_len_accum >= acc_limit(self.split_trigger) {
            let split = self.find_split();
            self.cut_leaf_node(cache, split)?;
        }
        Ok(())
    }

    /// Scans the buffer left to right for the first split point:
    /// a namespace-level break, a hash break, or the size ceiling.
    fn find_split(&self) -> usize {
        let lim = self.names.len();
        let acc_lim = acc_limit(self.split_trigger);
        let acc_min = self.split_trigger / 2;
        let mut max_cost = 0usize;
        let mut acc = 0usize;
        let mut prev_match = 0usize;
        let mut split = 0usize;
        while split < lim {
            let name = &self.names[split];
            let cost = ref_cost(name.encoded_len());
            if cost > max_cost {
                max_cost = cost;
            }
            acc += cost + (max_cost - cost) * 2;
            if split + 1 < lim {
                let matched = name.shared_components(&self.names[split + 1]);
                if acc >= acc_min && (matched < prev_match || matched > prev_match + 1) {
                    trace!(split, matched, prev_match, "level split");
                    break;
                }
                prev_match = matched;
                if acc >= acc_min {
                    if let Some(byte) = hash_split_byte(name) {
                        if byte < self.hash_split_trigger {
                            trace!(split, byte, "hash split");
                            break;
                        }
                    }
                }
            }
            if acc >= acc_lim {
                break;
            }
            split += 1;
        }
        split
    }

    /// Moves the first `split` buffered names (0 = all of them) into
    /// a leaf node, reusing an existing node with the same hash.
    fn cut_leaf_node(&mut self, cache: &mut HashCache, split: usize) -> Result<(), SyncError> {
        let take = if split == 0 { self.names.len() } else { split };
        if take == 0 {
            return Ok(());
        }

        let mut acc = LongHash::new();
        for name in &self.names[..take] {
            acc.accumulate(&leaf_digest(name));
        }
        let hash = acc.finish();

        let existing = cache
            .lookup(&hash)
            .and_then(|entry| entry.local_node())
            .cloned();
        match existing {
            Some(node) => {
                trace!(%hash, "leaf node shared");
                self.nodes_shared += 1;
                self.nodes.push(node);
            }
            None => {
                let mut builder = NodeBuilder::new();
                for name in &self.names[..take] {
                    builder.add_leaf(name);
                }
                let node = Arc::new(builder.finish()?);
                self.install_new(cache, node);
            }
        }

        self.names.drain(..take);
        self.name_len_accum = self.names.iter().map(Name::encoded_len).sum();
        Ok(())
    }

    /// Bundles the finished nodes upward until one root remains.
    fn bundle(&mut self, cache: &mut HashCache) -> Result<TreeHash, SyncError> {
        let acc_lim = acc_limit(self.split_trigger);
        while self.nodes.len() > 1 {
            let level = std::mem::take(&mut self.nodes);
            let lim = level.len();
            let mut j = 0usize;
            while j < lim {
                let mut acc = 0usize;
                let mut max_cost = 0usize;
                let mut i = j;
                while i < lim && acc < acc_lim {
                    let cost = level[i].hash().len() + 8;
                    i += 1;
                    if cost > max_cost {
                        max_cost = cost;
                    }
                    acc += cost + (max_cost - cost) * 2;
                }
                let existing = {
                    let mut fold = LongHash::new();
                    for child in &level[j..i] {
                        fold.accumulate(child.hash().as_bytes());
                    }
                    let hash = fold.finish();
                    cache
                        .lookup(&hash)
                        .and_then(|entry| entry.local_node())
                        .cloned()
                };
                match existing {
                    Some(node) => {
                        self.nodes_shared += 1;
                        self.nodes.push(node);
                        j = i;
                    }
                    None => {
                        let mut builder = NodeBuilder::new();
                        while j < i {
                            builder.add_child(&level[j]);
                            j += 1;
                        }
                        let node = Arc::new(builder.finish()?);
                        self.install_new(cache, node);
                    }
                }
            }
        }
        let root = self
            .nodes
            .first()
            .ok_or_else(|| SyncError::CacheCorruption(self.start_root.clone()))?;
        Ok(root.hash().clone())
    }

    fn install_new(&mut self, cache: &mut HashCache, node: NodeArc) {
        if node.encoded_len() >= self.split_trigger {
            debug!(
                size = node.encoded_len(),
                trigger = self.split_trigger,
                "node exceeded the split estimate"
            );
        }
        let hash = node.hash().clone();
        cache.install_local(node.clone());
        cache.queue_store(&hash);
        self.nodes_created += 1;
        self.nodes.push(node);
    }
}

fn acc_limit(trigger: usize) -> usize {
    trigger - trigger / 8
}

/// The deterministic-random split byte of a name: the penultimate
/// byte of its last component. Absent when the last component is
/// shorter than 9 bytes; peers must agree on this exact condition.
fn hash_split_byte(name: &Name) -> Option<u8> {
    let last = name.components().last()?;
    if last.len() < 9 {
        return None;
    }
    Some(last[last.len() - 2])
}
