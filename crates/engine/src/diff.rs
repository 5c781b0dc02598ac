//! Two-tree differencing engine.
//!
//! Walks a local tree X and a remote tree Y in parallel and reports,
//! in ascending order, every name under Y that is not under X. Nodes
//! of Y (and, after crash recovery, of X) that are not in the cache
//! are fetched on demand; the session suspends while fetches are in
//! flight and resumes where it stopped. Subtrees whose hash is
//! already covered are skipped whole, which is what makes k
//! differences cost O(k log N) node visits instead of O(N).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use namesync_primitives::{Name, TreeHash};
use tracing::{debug, trace, warn};

use crate::cache::{HashCache, Origin};
use crate::error::SyncError;
use crate::node::{Bound, NodeRef};
use crate::walker::TreeWalker;

use crate::builder::{NAMES_YIELD_INC, NAMES_YIELD_MICROS};

/// A failed fetch is retried this many times in total before the
/// session counts it as a hard failure.
pub const MAX_FETCH_ATTEMPTS: u32 = 2;

/// Seconds without a successful fetch before a session is assumed
/// dead and aborted.
pub const COMPARE_ASSUME_BAD_SECS: u64 = 20;

/// Which tree a fetch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    X,
    Y,
}

/// A node fetch the driver must issue.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub hash: TreeHash,
    pub side: Side,
    pub started: Instant,
}

/// Session state, in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffState {
    Init,
    Preload,
    Busy,
    Waiting,
    Done,
    Error,
}

/// What the driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOutcome {
    /// More local work; step again.
    Progress,
    /// Fetches are outstanding; issue `take_requests` and call
    /// `note_fetch` as they land.
    AwaitFetch,
    /// Every missing name has been reported; the session sits in
    /// `Waiting` until the driver calls `complete`.
    NamesEmitted,
    /// Terminal: the final sink call was delivered.
    Finished,
    /// Terminal: aborted; the final sink call was delivered.
    Failed,
}

/// Receives discovered names; `None` signals termination.
pub trait NameSink {
    /// Return `false` to stop the session.
    fn add(&mut self, name: Option<&Name>) -> bool;
}

impl<F: FnMut(Option<&Name>) -> bool> NameSink for F {
    fn add(&mut self, name: Option<&Name>) -> bool {
        self(name)
    }
}

enum CompareStep {
    Finished,
    NeedFetch,
    Yield,
    ClientStop,
}

/// One differencing run over a (X, Y) root pair.
#[derive(Debug)]
pub struct DiffSession {
    hash_x: TreeHash,
    hash_y: TreeHash,
    wx: TreeWalker,
    wy: TreeWalker,
    state: DiffState,
    /// Initial eager walk of both trees still pending.
    preloading: bool,
    requests: Vec<FetchRequest>,
    in_flight: Vec<FetchRequest>,
    attempts: HashMap<TreeHash, u32>,
    names_added: u64,
    fetch_failed: u32,
    client_stopped: bool,
    last_fetch_ok: Instant,
    started: Instant,
    max_fetch_busy: usize,
    stall_deadline: Duration,
}

impl DiffSession {
    pub fn new(hash_x: TreeHash, hash_y: TreeHash, max_fetch_busy: usize) -> Self {
        let now = Instant::now();
        Self {
            hash_x,
            hash_y,
            wx: TreeWalker::default(),
            wy: TreeWalker::default(),
            state: DiffState::Init,
            preloading: true,
            requests: Vec::new(),
            in_flight: Vec::new(),
            attempts: HashMap::new(),
            names_added: 0,
            fetch_failed: 0,
            client_stopped: false,
            last_fetch_ok: now,
            started: now,
            max_fetch_busy,
            stall_deadline: Duration::from_secs(COMPARE_ASSUME_BAD_SECS),
        }
    }

    /// Overrides the stall deadline; the default is
    /// [`COMPARE_ASSUME_BAD_SECS`].
    pub fn set_stall_deadline(&mut self, deadline: Duration) {
        self.stall_deadline = deadline;
    }

    /// True when the session has waited on fetches past its deadline.
    pub fn stalled(&self) -> bool {
        self.outstanding_fetches() > 0 && self.last_fetch_ok.elapsed() >= self.stall_deadline
    }

    pub fn state(&self) -> DiffState {
        self.state
    }

    pub fn hash_x(&self) -> &TreeHash {
        &self.hash_x
    }

    pub fn hash_y(&self) -> &TreeHash {
        &self.hash_y
    }

    pub fn names_added(&self) -> u64 {
        self.names_added
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, DiffState::Done | DiffState::Error)
    }

    /// True when the client callback ended the session early.
    pub fn client_stopped(&self) -> bool {
        self.client_stopped
    }

    /// Time since the last successful fetch; the driver aborts the
    /// session when this exceeds its stall deadline.
    pub fn since_last_fetch(&self) -> Duration {
        self.last_fetch_ok.elapsed()
    }

    /// Wall time since the session started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn outstanding_fetches(&self) -> usize {
        self.requests.len() + self.in_flight.len()
    }

    /// Drains the fetches the driver must issue.
    pub fn take_requests(&mut self) -> Vec<FetchRequest> {
        let out = std::mem::take(&mut self.requests);
        self.in_flight.extend(out.iter().cloned());
        out
    }

    /// Advances the session by one bounded step.
    pub fn step(&mut self, cache: &mut HashCache, sink: &mut dyn NameSink) -> DiffOutcome {
        loop {
            if self.fetch_failed > 0 {
                return self.abort(cache, sink, "node fetch failed");
            }
            match self.state {
                DiffState::Init => {
                    self.wx.init(cache, &self.hash_x.clone());
                    self.wy.init(cache, &self.hash_y.clone());
                    self.state = DiffState::Preload;
                }
                DiffState::Preload => {
                    if self.preloading {
                        let done_x = match self.preload_pass(cache, Side::X) {
                            Ok(done) => done,
                            Err(err) => return self.abort(cache, sink, &err.to_string()),
                        };
                        let done_y = match self.preload_pass(cache, Side::Y) {
                            Ok(done) => done,
                            Err(err) => return self.abort(cache, sink, &err.to_string()),
                        };
                        if self.outstanding_fetches() > 0 || !done_x || !done_y {
                            return DiffOutcome::AwaitFetch;
                        }
                        // walkers restart at the roots for the merge
                        self.wx.init(cache, &self.hash_x.clone());
                        self.wy.init(cache, &self.hash_y.clone());
                        self.preloading = false;
                        self.state = DiffState::Busy;
                    } else if self.outstanding_fetches() > 0 {
                        return DiffOutcome::AwaitFetch;
                    } else {
                        // a mid-compare fetch landed; resume in place
                        self.state = DiffState::Busy;
                    }
                }
                DiffState::Busy => match self.compare(cache, sink) {
                    Ok(CompareStep::Finished) => {
                        self.state = DiffState::Waiting;
                        return DiffOutcome::NamesEmitted;
                    }
                    Ok(CompareStep::NeedFetch) => {
                        self.state = DiffState::Preload;
                        return DiffOutcome::AwaitFetch;
                    }
                    Ok(CompareStep::Yield) => return DiffOutcome::Progress,
                    Ok(CompareStep::ClientStop) => {
                        self.client_stopped = true;
                        return self.finish(cache, sink);
                    }
                    Err(err) => return self.abort(cache, sink, &err.to_string()),
                },
                DiffState::Waiting => return DiffOutcome::NamesEmitted,
                DiffState::Done => return DiffOutcome::Finished,
                DiffState::Error => return DiffOutcome::Failed,
            }
        }
    }

    /// Ends a session sitting in `Waiting`: delivers the final sink
    /// call and marks Y covered.
    pub fn complete(&mut self, cache: &mut HashCache, sink: &mut dyn NameSink) -> DiffOutcome {
        debug_assert_eq!(self.state, DiffState::Waiting);
        self.finish(cache, sink)
    }

    fn finish(&mut self, cache: &mut HashCache, sink: &mut dyn NameSink) -> DiffOutcome {
        if !self.hash_y.is_empty() {
            cache
                .enter(&self.hash_y.clone(), Origin::Remote)
                .mark_covered();
        }
        self.teardown(cache);
        self.state = DiffState::Done;
        let _ = sink.add(None);
        debug!(
            names = self.names_added,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "differencing complete"
        );
        DiffOutcome::Finished
    }

    /// Tears the session down without any callback, for owner-driven
    /// cancellation (closing the slice). A fetch completion arriving
    /// later finds nothing in flight and is discarded.
    pub fn cancel(&mut self, cache: &mut HashCache) {
        if self.is_terminal() {
            return;
        }
        self.teardown(cache);
        self.state = DiffState::Error;
    }

    /// Aborts the session: final sink call, resources released, no
    /// covered marking.
    pub fn abort(
        &mut self,
        cache: &mut HashCache,
        sink: &mut dyn NameSink,
        why: &str,
    ) -> DiffOutcome {
        if self.is_terminal() {
            return DiffOutcome::Failed;
        }
        warn!(names = self.names_added, why, "differencing aborted");
        self.teardown(cache);
        self.state = DiffState::Error;
        let _ = sink.add(None);
        DiffOutcome::Failed
    }

    fn teardown(&mut self, cache: &mut HashCache) {
        self.wx.clear(cache);
        self.wy.clear(cache);
        for record in self.requests.drain(..).chain(self.in_flight.drain(..)) {
            if let Some(entry) = cache.lookup_mut(&record.hash) {
                entry.state.fetching = false;
            }
        }
    }

    /// Records the outcome of an issued fetch. The body, if any, must
    /// already be installed in the cache. Failed fetches are retried
    /// once before counting as hard failures.
    pub fn note_fetch(&mut self, cache: &mut HashCache, hash: &TreeHash, ok: bool) {
        let Some(idx) = self.in_flight.iter().position(|f| &f.hash == hash) else {
            return;
        };
        let record = self.in_flight.remove(idx);
        if let Some(entry) = cache.lookup_mut(hash) {
            entry.state.fetching = false;
        }
        let has_body = cache
            .lookup(hash)
            .map(|entry| entry.has_body())
            .unwrap_or(false);
        if ok && has_body {
            self.last_fetch_ok = Instant::now();
            return;
        }
        let attempts = self.attempts.entry(hash.clone()).or_insert(0);
        *attempts += 1;
        if *attempts < MAX_FETCH_ATTEMPTS {
            trace!(%hash, attempt = *attempts, "requeueing failed fetch");
            if let Some(entry) = cache.lookup_mut(hash) {
                entry.state.fetching = true;
            }
            self.requests.push(FetchRequest {
                hash: hash.clone(),
                side: record.side,
                started: Instant::now(),
            });
        } else {
            self.fetch_failed += 1;
        }
    }

    fn request_fetch(&mut self, cache: &mut HashCache, hash: &TreeHash, side: Side) {
        let entry = cache.enter(hash, Origin::None);
        if entry.has_body() || entry.state.fetching {
            return;
        }
        entry.state.fetching = true;
        self.requests.push(FetchRequest {
            hash: hash.clone(),
            side,
            started: Instant::now(),
        });
    }

    /// One eager pass over a whole tree, requesting every missing
    /// node. Returns whether the pass saw everything present.
    fn preload_pass(&mut self, cache: &mut HashCache, side: Side) -> Result<bool, SyncError> {
        let root = match side {
            Side::X => self.hash_x.clone(),
            Side::Y => self.hash_y.clone(),
        };
        let mut walker = match side {
            Side::X => std::mem::take(&mut self.wx),
            Side::Y => std::mem::take(&mut self.wy),
        };
        walker.init(cache, &root);
        let result = self.preload_walk(cache, side, &mut walker);
        match side {
            Side::X => self.wx = walker,
            Side::Y => self.wy = walker,
        }
        result
    }

    fn preload_walk(
        &mut self,
        cache: &mut HashCache,
        side: Side,
        walker: &mut TreeWalker,
    ) -> Result<bool, SyncError> {
        let mut incomplete = false;
        loop {
            if self.requests.len() + self.in_flight.len() >= self.max_fetch_busy {
                walker.clear(cache);
                return Ok(false);
            }
            let Some(frame) = walker.top() else {
                break;
            };
            let hash = frame.hash.clone();
            let mut pos = frame.pos;
            let entry = cache
                .lookup_mut(&hash)
                .ok_or_else(|| SyncError::CacheCorruption(hash.clone()))?;
            if entry.state.fetching {
                incomplete = true;
                if let Some(parent) = walker.pop(cache) {
                    parent.pos += 1;
                }
                continue;
            }
            match entry.node().cloned() {
                Some(node) => {
                    let mut descended = false;
                    while pos < node.ref_count() {
                        if matches!(node.ref_at(pos), Some(NodeRef::Node(_))) {
                            walker.top_mut().expect("frame exists").pos = pos;
                            if walker.push(cache).is_none() {
                                return Err(SyncError::CacheCorruption(hash));
                            }
                            descended = true;
                            break;
                        }
                        pos += 1;
                    }
                    if descended {
                        continue;
                    }
                    if let Some(parent) = walker.pop(cache) {
                        parent.pos += 1;
                    }
                }
                None => {
                    incomplete = true;
                    self.request_fetch(cache, &hash, side);
                    if let Some(parent) = walker.pop(cache) {
                        parent.pos += 1;
                    }
                }
            }
        }
        Ok(!incomplete)
    }

    /// The order-merge over both walkers.
    fn compare(
        &mut self,
        cache: &mut HashCache,
        sink: &mut dyn NameSink,
    ) -> Result<CompareStep, SyncError> {
        let entered = Instant::now();
        let budget = Duration::from_micros(NAMES_YIELD_MICROS);
        let mut names_lim = self.names_added + NAMES_YIELD_INC;
        loop {
            let Some(top_y) = self.wy.top() else {
                // Y exhausted: nothing further to report
                return Ok(CompareStep::Finished);
            };
            let y_hash = top_y.hash.clone();
            let y_pos = top_y.pos;
            let y_count = top_y.count;

            let entry_y = cache
                .lookup_mut(&y_hash)
                .ok_or_else(|| SyncError::CacheCorruption(y_hash.clone()))?;
            entry_y.last_used = Instant::now();
            if y_pos == 0 && entry_y.is_covered() {
                // nothing under this subtree is missing locally
                if let Some(parent) = self.wy.pop(cache) {
                    parent.pos += 1;
                    parent.count += y_count;
                }
                continue;
            }
            let Some(node_y) = entry_y.node().cloned() else {
                self.request_fetch(cache, &y_hash, Side::Y);
                return Ok(CompareStep::NeedFetch);
            };
            if y_pos >= node_y.ref_count() {
                if y_count == 0 {
                    // walked the whole node without adding anything
                    cache
                        .lookup_mut(&y_hash)
                        .expect("entry exists")
                        .mark_covered();
                }
                if let Some(parent) = self.wy.pop(cache) {
                    parent.pos += 1;
                    parent.count += y_count;
                }
                continue;
            }
            let ref_y = node_y.ref_at(y_pos).cloned().expect("position bounded");

            match self.wx.top() {
                None => {
                    // X is exhausted; everything remaining under Y is new
                    match ref_y {
                        NodeRef::Node(_) => {
                            if self.wy.push(cache).is_none() {
                                return Err(SyncError::CacheCorruption(y_hash));
                            }
                        }
                        NodeRef::Leaf(name) => {
                            if !self.emit(sink, &name) {
                                return Ok(CompareStep::ClientStop);
                            }
                        }
                    }
                }
                Some(top_x) => {
                    let x_hash = top_x.hash.clone();
                    let x_pos = top_x.pos;
                    let entry_x = cache
                        .lookup_mut(&x_hash)
                        .ok_or_else(|| SyncError::CacheCorruption(x_hash.clone()))?;
                    entry_x.last_used = Instant::now();
                    let Some(node_x) = entry_x.node().cloned() else {
                        self.request_fetch(cache, &x_hash, Side::X);
                        return Ok(CompareStep::NeedFetch);
                    };
                    if x_pos >= node_x.ref_count() {
                        if let Some(parent) = self.wx.pop(cache) {
                            parent.pos += 1;
                        }
                        continue;
                    }
                    let ref_x = node_x.ref_at(x_pos).cloned().expect("position bounded");

                    match (&ref_x, &ref_y) {
                        (NodeRef::Leaf(name_x), NodeRef::Leaf(name_y)) => {
                            match name_x.cmp(name_y) {
                                core::cmp::Ordering::Equal => {
                                    self.advance_x();
                                    self.advance_y();
                                }
                                core::cmp::Ordering::Less => self.advance_x(),
                                core::cmp::Ordering::Greater => {
                                    let name_y = name_y.clone();
                                    if !self.emit(sink, &name_y) {
                                        return Ok(CompareStep::ClientStop);
                                    }
                                }
                            }
                        }
                        (_, NodeRef::Node(child_y)) => {
                            let sub_y = cache.enter(child_y, Origin::None);
                            if sub_y.is_covered() {
                                // works even when the body is absent
                                self.advance_y();
                                continue;
                            }
                            let Some(node_sub_y) = sub_y.node().cloned() else {
                                // hash known, body missing: descend to
                                // force the fetch
                                if self.wy.push(cache).is_none() {
                                    return Err(SyncError::CacheCorruption(y_hash));
                                }
                                continue;
                            };
                            match &ref_x {
                                NodeRef::Leaf(name_x) => {
                                    match node_sub_y.compare_bounds(name_x) {
                                        Bound::Before => self.advance_x(),
                                        Bound::Max => {
                                            self.advance_x();
                                            self.advance_y();
                                        }
                                        _ => {
                                            if self.wy.push(cache).is_none() {
                                                return Err(SyncError::CacheCorruption(y_hash));
                                            }
                                        }
                                    }
                                }
                                NodeRef::Node(child_x) => {
                                    if child_x == child_y {
                                        // identical subtrees
                                        self.advance_x();
                                        self.advance_y();
                                        continue;
                                    }
                                    let body_x = cache
                                        .enter(child_x, Origin::None)
                                        .node()
                                        .cloned();
                                    match body_x {
                                        None => {
                                            if self.wx.push(cache).is_none() {
                                                return Err(SyncError::CacheCorruption(x_hash));
                                            }
                                        }
                                        Some(node_sub_x) => {
                                            if node_sub_y.min_name() > node_sub_x.max_name() {
                                                // Y's child is wholly past X's
                                                self.advance_x();
                                            } else {
                                                if self.wx.push(cache).is_none() {
                                                    return Err(SyncError::CacheCorruption(
                                                        x_hash,
                                                    ));
                                                }
                                                if self.wy.push(cache).is_none() {
                                                    return Err(SyncError::CacheCorruption(
                                                        y_hash,
                                                    ));
                                                }
                                            }
                                        }
                                    }
                                }
                            }
                        }
                        (NodeRef::Node(child_x), NodeRef::Leaf(name_y)) => {
                            let body_x = cache.enter(child_x, Origin::None).node().cloned();
                            let Some(node_sub_x) = body_x else {
                                if self.wx.push(cache).is_none() {
                                    return Err(SyncError::CacheCorruption(x_hash));
                                }
                                continue;
                            };
                            match node_sub_x.compare_bounds(name_y) {
                                Bound::Before => {
                                    let name_y = name_y.clone();
                                    if !self.emit(sink, &name_y) {
                                        return Ok(CompareStep::ClientStop);
                                    }
                                }
                                Bound::Min => self.advance_y(),
                                Bound::Max => {
                                    self.advance_x();
                                    self.advance_y();
                                }
                                Bound::After => self.advance_x(),
                                Bound::Inside => {
                                    if self.wx.push(cache).is_none() {
                                        return Err(SyncError::CacheCorruption(x_hash));
                                    }
                                }
                            }
                        }
                    }
                }
            }

            if self.names_added >= names_lim {
                if entered.elapsed() >= budget {
                    return Ok(CompareStep::Yield);
                }
                names_lim += NAMES_YIELD_INC;
            }
        }
    }

    /// Reports one missing name and advances Y. Returns `false` when
    /// the client asked to stop (Y is intentionally not advanced).
    fn emit(&mut self, sink: &mut dyn NameSink, name: &Name) -> bool {
        if !sink.add(Some(name)) {
            return false;
        }
        self.names_added += 1;
        self.advance_y_counted();
        true
    }

    fn advance_x(&mut self) {
        if let Some(frame) = self.wx.top_mut() {
            frame.pos += 1;
        }
    }

    fn advance_y(&mut self) {
        if let Some(frame) = self.wy.top_mut() {
            frame.pos += 1;
        }
    }

    fn advance_y_counted(&mut self) {
        if let Some(frame) = self.wy.top_mut() {
            frame.pos += 1;
            frame.count += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{BuildOutcome, TreeBuilder};
    use crate::node::{TreeNode, MAX_NODE_ENCODING};
    use std::collections::HashSet;
    use std::sync::Arc;

    const TRIGGER: usize = 4000;
    const HASH_TRIGGER: u8 = 17;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    fn build(cache: &mut HashCache, root: TreeHash, batch: Vec<Name>) -> TreeHash {
        let Some(mut builder) =
            TreeBuilder::new(cache, root.clone(), batch, TRIGGER, HASH_TRIGGER)
        else {
            return root;
        };
        loop {
            match builder.step(cache).unwrap() {
                BuildOutcome::Yielded => {}
                BuildOutcome::Complete(hash) => return hash,
            }
        }
    }

    /// Builds a tree in a scratch cache and exports every node body,
    /// standing in for the peer's node store.
    fn remote_tree(names: Vec<Name>) -> (TreeHash, HashMap<TreeHash, Vec<u8>>) {
        let mut scratch = HashCache::new();
        let root = build(&mut scratch, TreeHash::empty(), names);
        let mut store = HashMap::new();
        for hash in scratch.hashes().cloned().collect::<Vec<_>>() {
            if let Some(node) = scratch.lookup(&hash).and_then(|e| e.node()) {
                store.insert(hash.clone(), node.encoding().to_vec());
            }
        }
        (root, store)
    }

    #[derive(Default)]
    struct RecordingSink {
        names: Vec<Name>,
        finals: usize,
        stop_after: Option<usize>,
    }

    impl NameSink for RecordingSink {
        fn add(&mut self, name: Option<&Name>) -> bool {
            match name {
                Some(n) => {
                    self.names.push(n.clone());
                    !matches!(self.stop_after, Some(lim) if self.names.len() >= lim)
                }
                None => {
                    self.finals += 1;
                    true
                }
            }
        }
    }

    struct DriveResult {
        finished: bool,
        fetches: usize,
    }

    /// Steps a session to termination, serving fetches out of
    /// `store`. Hashes in `fail_once` fail their first attempt.
    fn drive(
        cache: &mut HashCache,
        session: &mut DiffSession,
        sink: &mut RecordingSink,
        store: &HashMap<TreeHash, Vec<u8>>,
        fail_once: &HashSet<TreeHash>,
    ) -> DriveResult {
        let mut fetches = 0usize;
        let mut failed_already: HashSet<TreeHash> = HashSet::new();
        for _ in 0..100_000 {
            match session.step(cache, sink) {
                DiffOutcome::Progress => {}
                DiffOutcome::AwaitFetch => {
                    let requests = session.take_requests();
                    assert!(
                        !requests.is_empty() || session.outstanding_fetches() > 0,
                        "session wedged with nothing in flight"
                    );
                    for request in requests {
                        fetches += 1;
                        let flaky = fail_once.contains(&request.hash)
                            && failed_already.insert(request.hash.clone());
                        if flaky {
                            session.note_fetch(cache, &request.hash, false);
                            continue;
                        }
                        match store.get(&request.hash) {
                            Some(bytes) => {
                                let node =
                                    TreeNode::parse(bytes, MAX_NODE_ENCODING).unwrap();
                                cache.install_remote(Arc::new(node));
                                session.note_fetch(cache, &request.hash, true);
                            }
                            None => session.note_fetch(cache, &request.hash, false),
                        }
                    }
                }
                DiffOutcome::NamesEmitted => {
                    session.complete(cache, sink);
                }
                DiffOutcome::Finished => {
                    return DriveResult {
                        finished: true,
                        fetches,
                    }
                }
                DiffOutcome::Failed => {
                    return DriveResult {
                        finished: false,
                        fetches,
                    }
                }
            }
        }
        panic!("session did not terminate");
    }

    fn no_failures() -> HashSet<TreeHash> {
        HashSet::new()
    }

    #[test]
    fn empty_vs_single_name() {
        let (root_y, store) = remote_tree(vec![name("/a/b")]);
        let mut cache = HashCache::new();
        let mut session = DiffSession::new(TreeHash::empty(), root_y.clone(), 6);
        let mut sink = RecordingSink::default();

        let result = drive(&mut cache, &mut session, &mut sink, &store, &no_failures());
        assert!(result.finished);
        assert_eq!(sink.names, vec![name("/a/b")]);
        assert_eq!(sink.finals, 1);
        assert!(cache.lookup(&root_y).unwrap().state.covered);
    }

    #[test]
    fn equal_trees_emit_nothing() {
        let names: Vec<Name> = (0..20).map(|i| name(&format!("/n/{i}"))).collect();
        let mut cache = HashCache::new();
        let root = build(&mut cache, TreeHash::empty(), names);

        let mut session = DiffSession::new(root.clone(), root.clone(), 6);
        let mut sink = RecordingSink::default();
        let result = drive(
            &mut cache,
            &mut session,
            &mut sink,
            &HashMap::new(),
            &no_failures(),
        );
        assert!(result.finished);
        assert!(sink.names.is_empty());
        assert_eq!(sink.finals, 1);
        assert_eq!(result.fetches, 0);
        assert!(cache.lookup(&root).unwrap().state.covered);
    }

    #[test]
    fn empty_remote_emits_only_final() {
        let mut cache = HashCache::new();
        let root_x = build(&mut cache, TreeHash::empty(), vec![name("/x")]);
        let mut session = DiffSession::new(root_x, TreeHash::empty(), 6);
        let mut sink = RecordingSink::default();
        let result = drive(
            &mut cache,
            &mut session,
            &mut sink,
            &HashMap::new(),
            &no_failures(),
        );
        assert!(result.finished);
        assert!(sink.names.is_empty());
        assert_eq!(sink.finals, 1);
    }

    #[test]
    fn emits_exact_set_difference_in_order() {
        let lx: Vec<Name> = (0..120).step_by(2).map(|i| name(&format!("/s/{i:03}"))).collect();
        let ly: Vec<Name> = (0..120).map(|i| name(&format!("/s/{i:03}"))).collect();

        let mut cache = HashCache::new();
        let root_x = build(&mut cache, TreeHash::empty(), lx.clone());
        let (root_y, store) = remote_tree(ly.clone());

        let mut session = DiffSession::new(root_x, root_y, 6);
        let mut sink = RecordingSink::default();
        let result = drive(&mut cache, &mut session, &mut sink, &store, &no_failures());
        assert!(result.finished);

        let expected: Vec<Name> = (1..120).step_by(2).map(|i| name(&format!("/s/{i:03}"))).collect();
        assert_eq!(sink.names, expected, "Ly \\ Lx, ascending");
    }

    #[test]
    fn disjoint_subtree_fetches_stay_logarithmic() {
        let mut lx: Vec<Name> = (1..=100).map(|i| name(&format!("/a/{i:04}"))).collect();
        let mut cache = HashCache::new();
        let root_x = build(&mut cache, TreeHash::empty(), lx.clone());

        lx.push(name("/b/1"));
        let (root_y, store) = remote_tree(lx);

        let mut session = DiffSession::new(root_x, root_y, 6);
        let mut sink = RecordingSink::default();
        let result = drive(&mut cache, &mut session, &mut sink, &store, &no_failures());
        assert!(result.finished);
        assert_eq!(sink.names, vec![name("/b/1")]);
        // shared subtrees resolve against local bodies; only the
        // changed spine and the new subtree travel
        assert!(
            result.fetches <= 8,
            "expected O(log n) fetches, made {}",
            result.fetches
        );
    }

    #[test]
    fn rerun_after_success_emits_nothing() {
        let (root_y, store) = remote_tree((0..50).map(|i| name(&format!("/r/{i}"))).collect());
        let mut cache = HashCache::new();

        let mut first = DiffSession::new(TreeHash::empty(), root_y.clone(), 6);
        let mut sink = RecordingSink::default();
        assert!(drive(&mut cache, &mut first, &mut sink, &store, &no_failures()).finished);
        assert_eq!(sink.names.len(), 50);

        let mut second = DiffSession::new(TreeHash::empty(), root_y.clone(), 6);
        let mut sink2 = RecordingSink::default();
        let result = drive(&mut cache, &mut second, &mut sink2, &store, &no_failures());
        assert!(result.finished);
        assert!(sink2.names.is_empty(), "Y is covered after the first run");
        assert_eq!(result.fetches, 0);
    }

    #[test]
    fn fetch_failure_recovers_on_retry() {
        let (root_y, store) = remote_tree((0..40).map(|i| name(&format!("/f/{i}"))).collect());
        let mut cache = HashCache::new();

        // every node of Y fails its first fetch attempt
        let fail_once: HashSet<TreeHash> = store.keys().cloned().collect();
        let mut session = DiffSession::new(TreeHash::empty(), root_y.clone(), 6);
        let mut sink = RecordingSink::default();
        let result = drive(&mut cache, &mut session, &mut sink, &store, &fail_once);

        assert!(result.finished, "one retry per node must suffice");
        assert_eq!(sink.names.len(), 40);
        assert_eq!(sink.finals, 1);
        assert!(!session.stalled());
    }

    #[test]
    fn repeated_failure_aborts() {
        let (root_y, _) = remote_tree(vec![name("/gone")]);
        let mut cache = HashCache::new();
        let mut session = DiffSession::new(TreeHash::empty(), root_y.clone(), 6);
        let mut sink = RecordingSink::default();
        // empty store: every fetch fails, retries included
        let result = drive(
            &mut cache,
            &mut session,
            &mut sink,
            &HashMap::new(),
            &no_failures(),
        );
        assert!(!result.finished);
        assert_eq!(sink.finals, 1, "failure still delivers the final call");
        assert!(!cache.lookup(&root_y).unwrap().state.covered);
    }

    #[test]
    fn stall_abort_releases_resources() {
        let (root_y, _) = remote_tree(vec![name("/never")]);
        let mut cache = HashCache::new();
        let mut session = DiffSession::new(TreeHash::empty(), root_y.clone(), 6);
        session.set_stall_deadline(Duration::ZERO);
        let mut sink = RecordingSink::default();

        // first step schedules the root fetch, which never completes
        let outcome = session.step(&mut cache, &mut sink);
        assert_eq!(outcome, DiffOutcome::AwaitFetch);
        let _ = session.take_requests();
        assert!(session.stalled());

        session.abort(&mut cache, &mut sink, "no progress");
        assert_eq!(sink.finals, 1);
        assert_eq!(session.state(), DiffState::Error);
        assert_eq!(cache.lookup(&root_y).unwrap().busy(), 0);
        assert!(!cache.lookup(&root_y).unwrap().state.fetching);
    }

    #[test]
    fn client_stop_terminates_cleanly() {
        let (root_y, store) = remote_tree((0..30).map(|i| name(&format!("/c/{i}"))).collect());
        let mut cache = HashCache::new();
        let mut session = DiffSession::new(TreeHash::empty(), root_y, 6);
        let mut sink = RecordingSink {
            stop_after: Some(5),
            ..RecordingSink::default()
        };
        let result = drive(&mut cache, &mut session, &mut sink, &store, &no_failures());
        assert!(result.finished);
        assert!(session.client_stopped());
        assert_eq!(sink.names.len(), 5);
        assert_eq!(sink.finals, 1);
    }
}
