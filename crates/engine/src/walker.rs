//! Stack-based tree walker.
//!
//! Walks a tree held in the hash cache without recursion, so a walk
//! can be suspended whenever a node body is missing and resumed after
//! the fetch lands. Frames hold only hash keys; the bodies stay owned
//! by the cache, pinned through busy counts while a frame stands on
//! them.

use namesync_primitives::{Name, TreeHash};

use crate::cache::{HashCache, Origin};
use crate::node::{NodeArc, NodeRef};

/// One level of the walk: the node's hash, the position of the child
/// being visited, and the number of names contributed under this
/// frame (the differencing engine uses the count for its covered
/// short cut).
#[derive(Debug, Clone)]
pub struct Frame {
    pub hash: TreeHash,
    pub pos: usize,
    pub count: u64,
}

/// A suspended in-order walk of one tree.
#[derive(Debug, Default)]
pub struct TreeWalker {
    stack: Vec<Frame>,
}

impl TreeWalker {
    /// Starts a walk at `root`. The empty hash yields an exhausted
    /// walker (the empty tree has nothing to visit).
    pub fn new(cache: &mut HashCache, root: &TreeHash) -> Self {
        let mut walker = Self::default();
        walker.init(cache, root);
        walker
    }

    /// Re-seeds the walker at `root`, releasing any previous stack.
    pub fn init(&mut self, cache: &mut HashCache, root: &TreeHash) {
        self.reset(cache, 0);
        if !root.is_empty() {
            cache.enter(root, Origin::None);
            cache.pin(root);
            self.stack.push(Frame {
                hash: root.clone(),
                pos: 0,
                count: 0,
            });
        }
    }

    pub fn level(&self) -> usize {
        self.stack.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.stack.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.stack.last_mut()
    }

    /// Body of the node the top frame stands on, if present.
    pub fn top_node(&self, cache: &mut HashCache) -> Option<NodeArc> {
        let frame = self.top()?;
        cache.lookup(&frame.hash)?.node().cloned()
    }

    /// The reference at the top frame's position. `None` when the top
    /// body is missing or the position is off the end.
    pub fn current_ref(&self, cache: &mut HashCache) -> Option<NodeRef> {
        let frame = self.top()?;
        let node = cache.lookup(&frame.hash)?.node()?.clone();
        node.ref_at(frame.pos).cloned()
    }

    /// Descends into the child at the current position.
    ///
    /// Fails (returns `None`) when the current reference is a leaf or
    /// cannot be read. Succeeds even when the child's body is not in
    /// the cache yet: the new frame lets the caller observe that a
    /// fetch is required.
    pub fn push(&mut self, cache: &mut HashCache) -> Option<&mut Frame> {
        let child = match self.current_ref(cache)? {
            NodeRef::Leaf(_) => return None,
            NodeRef::Node(hash) => hash,
        };
        cache.enter(&child, Origin::None);
        cache.pin(&child);
        self.stack.push(Frame {
            hash: child,
            pos: 0,
            count: 0,
        });
        self.stack.last_mut()
    }

    /// Returns to the parent frame, unpinning the level left behind.
    pub fn pop(&mut self, cache: &mut HashCache) -> Option<&mut Frame> {
        let left = self.stack.pop()?;
        cache.unpin(&left.hash);
        self.stack.last_mut()
    }

    /// Pops down to `level` (or stays, if already lower) and rewinds
    /// the surviving top frame to position 0.
    pub fn reset(&mut self, cache: &mut HashCache, level: usize) {
        while self.stack.len() > level {
            let left = self.stack.pop().expect("stack is non-empty");
            cache.unpin(&left.hash);
        }
        if let Some(frame) = self.stack.last_mut() {
            frame.pos = 0;
            frame.count = 0;
        }
    }

    /// Releases every pin; the walker is exhausted afterwards.
    pub fn clear(&mut self, cache: &mut HashCache) {
        self.reset(cache, 0);
    }
}

/// Collects every leaf name reachable from `root`, in order.
///
/// Returns `Err` with the missing hash when a body is absent, leaving
/// the tree only partially visited.
pub fn collect_names(cache: &mut HashCache, root: &TreeHash) -> Result<Vec<Name>, TreeHash> {
    let mut walker = TreeWalker::new(cache, root);
    let mut names = Vec::new();
    loop {
        let Some(frame) = walker.top() else {
            break;
        };
        let hash = frame.hash.clone();
        let pos = frame.pos;
        let Some(node) = cache.lookup(&hash).and_then(|e| e.node()).cloned() else {
            walker.clear(cache);
            return Err(hash);
        };
        if pos >= node.ref_count() {
            if let Some(parent) = walker.pop(cache) {
                parent.pos += 1;
            }
            continue;
        }
        match node.ref_at(pos) {
            Some(NodeRef::Leaf(name)) => {
                names.push(name.clone());
                walker.top_mut().expect("frame exists").pos += 1;
            }
            Some(NodeRef::Node(_)) => {
                let _ = walker.push(cache);
            }
            None => unreachable!("position bounded above"),
        }
    }
    Ok(names)
}

/// Marks every cache entry reachable from `root`; used by the purge
/// sweep. Missing bodies end the descent on that branch.
pub fn mark_reachable(cache: &mut HashCache, root: &TreeHash) -> usize {
    let mut walker = TreeWalker::new(cache, root);
    let mut marked = 0;
    loop {
        let Some(frame) = walker.top() else {
            break;
        };
        let hash = frame.hash.clone();
        let pos = frame.pos;
        let entry = match cache.lookup_mut(&hash) {
            Some(entry) => entry,
            None => break,
        };
        if pos == 0 && !entry.state.marked {
            entry.state.marked = true;
            marked += 1;
        }
        let Some(node) = entry.node().cloned() else {
            if let Some(parent) = walker.pop(cache) {
                parent.pos += 1;
            }
            continue;
        };
        if pos >= node.ref_count() {
            if let Some(parent) = walker.pop(cache) {
                parent.pos += 1;
            }
            continue;
        }
        match node.ref_at(pos) {
            Some(NodeRef::Node(_)) => {
                let _ = walker.push(cache);
            }
            _ => {
                walker.top_mut().expect("frame exists").pos += 1;
            }
        }
    }
    walker.clear(cache);
    marked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Origin;
    use crate::node::NodeBuilder;
    use std::sync::Arc;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    /// Installs a two-level tree: root -> [leafs("/a","/b"), leafs("/c")]
    fn small_tree(cache: &mut HashCache) -> TreeHash {
        let mut left = NodeBuilder::new();
        left.add_leaf(&name("/a"));
        left.add_leaf(&name("/b"));
        let left = Arc::new(left.finish().unwrap());

        let mut right = NodeBuilder::new();
        right.add_leaf(&name("/c"));
        let right = Arc::new(right.finish().unwrap());

        let mut root = NodeBuilder::new();
        root.add_child(&left);
        root.add_child(&right);
        let root = Arc::new(root.finish().unwrap());

        cache.install_local(left);
        cache.install_local(right);
        let hash = root.hash().clone();
        cache.install_local(root);
        hash
    }

    #[test]
    fn empty_root_is_exhausted() {
        let mut cache = HashCache::new();
        let walker = TreeWalker::new(&mut cache, &TreeHash::empty());
        assert!(walker.is_exhausted());
    }

    #[test]
    fn push_fails_on_leaf_ref() {
        let mut cache = HashCache::new();
        let root = small_tree(&mut cache);
        let mut walker = TreeWalker::new(&mut cache, &root);

        assert!(walker.push(&mut cache).is_some(), "into left child");
        assert!(walker.push(&mut cache).is_none(), "leaf refuses descent");
    }

    #[test]
    fn push_succeeds_without_body() {
        let mut cache = HashCache::new();

        let mut child = NodeBuilder::new();
        child.add_leaf(&name("/x"));
        let child = Arc::new(child.finish().unwrap());
        let mut parent = NodeBuilder::new();
        parent.add_child(&child);
        let parent = Arc::new(parent.finish().unwrap());
        // the parent body is installed, the child body is not
        cache.install_local(parent.clone());

        let mut walker = TreeWalker::new(&mut cache, parent.hash());
        let frame = walker.push(&mut cache);
        assert!(frame.is_some(), "descends onto the bare hash");
        assert!(
            walker.top_node(&mut cache).is_none(),
            "caller observes the missing body and schedules a fetch"
        );
    }

    #[test]
    fn busy_counts_follow_the_stack() {
        let mut cache = HashCache::new();
        let root = small_tree(&mut cache);
        let mut walker = TreeWalker::new(&mut cache, &root);
        assert_eq!(cache.lookup(&root).unwrap().busy(), 1);

        walker.push(&mut cache).unwrap();
        let child = walker.top().unwrap().hash.clone();
        assert_eq!(cache.lookup(&child).unwrap().busy(), 1);

        let _ = walker.pop(&mut cache);
        assert_eq!(cache.lookup(&child).unwrap().busy(), 0);

        walker.clear(&mut cache);
        assert_eq!(cache.lookup(&root).unwrap().busy(), 0);
    }

    #[test]
    fn reset_rewinds_to_level() {
        let mut cache = HashCache::new();
        let root = small_tree(&mut cache);
        let mut walker = TreeWalker::new(&mut cache, &root);
        walker.top_mut().unwrap().pos = 1;
        walker.push(&mut cache).unwrap();

        walker.reset(&mut cache, 1);
        assert_eq!(walker.level(), 1);
        assert_eq!(walker.top().unwrap().pos, 0);
    }

    #[test]
    fn collects_names_in_order() {
        let mut cache = HashCache::new();
        let root = small_tree(&mut cache);
        let names = collect_names(&mut cache, &root).unwrap();
        assert_eq!(names, vec![name("/a"), name("/b"), name("/c")]);
        // all pins released
        assert_eq!(cache.lookup(&root).unwrap().busy(), 0);
    }

    #[test]
    fn marks_reachable_entries() {
        let mut cache = HashCache::new();
        let root = small_tree(&mut cache);
        let stray = TreeHash::from_bytes(vec![5; 8]);
        cache.enter(&stray, Origin::Remote);

        assert_eq!(mark_reachable(&mut cache, &root), 3);
        assert!(cache.lookup(&root).unwrap().state.marked);
        assert!(!cache.lookup(&stray).unwrap().state.marked);
    }
}
