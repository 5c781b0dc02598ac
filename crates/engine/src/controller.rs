//! Reconciliation controller.
//!
//! A single task owns every slice's mutable state and is fed by three
//! sources: client commands, inbound protocol requests, and the
//! outcomes of requests it spawned. A periodic heartbeat drives the
//! advise/update/compare cycle per slice. Fetch helpers run on their
//! own tasks and post results back tagged with a session epoch, so a
//! completion that outlives its session is discarded instead of
//! touching freed state.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use namesync_primitives::{Name, Slice, SliceHash, SyncConfig, TreeHash};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::builder::{BuildOutcome, TreeBuilder};
use crate::cache::{HashCache, Origin};
use crate::deltas::{decode_deltas, is_deltas_coding, DeltaDraft, DeltasCache};
use crate::diff::{DiffOutcome, DiffSession, NameSink, Side};
use crate::error::TransportError;
use crate::node::{NodeArc, TreeNode, MAX_NODE_ENCODING};
use crate::stats::SliceStats;
use crate::transport::{
    command_name, marker, parse_command_name, ContentObject, InboundRequest, RepoHooks,
    RequestTemplate, SyncTransport,
};
use crate::walker::mark_reachable;

/// Seconds of a silent compare before a stall warning is logged.
const UPDATE_STALL_DELTA_SECS: u64 = 15;
/// Ceiling on the adaptive update back-off.
const UPDATE_NEED_DELTA_SECS: u64 = 6;
/// Idle age before unreachable cache entries are purged.
const CACHE_PURGE_TRIGGER_SECS: u64 = 60;
/// Store-queue entries drained per clean pass.
const CACHE_CLEAN_BATCH: usize = 8;
/// Seconds between store-queue clean passes.
const CACHE_CLEAN_DELTA_SECS: u64 = 4;
/// Seconds between durable checkpoint fences.
const FENCE_SECONDS: u64 = 2;

/// Client name callback: `(local_root, remote_root, name)`; `None`
/// signals session termination. Return a negative value to stop the
/// session.
pub type NameCallback = Box<dyn FnMut(&TreeHash, &TreeHash, Option<&Name>) -> i32 + Send>;

pub(crate) enum Command {
    Open {
        slice: Slice,
        callback: NameCallback,
        resume_hash: Option<TreeHash>,
        resume_name: Option<Name>,
        outcome: oneshot::Sender<Result<SliceHash, String>>,
    },
    Close {
        key: SliceHash,
        outcome: oneshot::Sender<Option<(TreeHash, Option<Name>)>>,
    },
    AddNames {
        key: SliceHash,
        names: Vec<Name>,
    },
    RootHash {
        key: SliceHash,
        outcome: oneshot::Sender<Option<TreeHash>>,
    },
    Stats {
        key: SliceHash,
        outcome: oneshot::Sender<Option<SliceStats>>,
    },
    Shutdown,
}

enum Event {
    AdviseReply {
        key: SliceHash,
        result: Result<Option<ContentObject>, TransportError>,
    },
    FetchDone {
        key: SliceHash,
        epoch: u64,
        hash: TreeHash,
        side: Side,
        from_repo: bool,
        result: Result<Option<ContentObject>, TransportError>,
    },
    ContentDone {
        key: SliceHash,
        epoch: u64,
        name: Name,
        ok: bool,
    },
    EnumName {
        key: SliceHash,
        name: Name,
    },
    EnumDone {
        key: SliceHash,
        ok: bool,
    },
    StoreDone {
        key: SliceHash,
        hash: TreeHash,
        ok: bool,
    },
}

/// A hash a peer has advised, most recent first.
struct RemoteSeen {
    hash: TreeHash,
    last_seen: Instant,
}

struct SliceState {
    slice: Slice,
    key: SliceHash,
    cache: HashCache,
    current_root: TreeHash,
    callback: NameCallback,
    pending_name: Option<Name>,

    names_to_add: Vec<Name>,
    names_to_fetch: VecDeque<Name>,
    content_retries: HashMap<Name, u32>,
    content_busy: usize,
    names_seen: u64,

    remote_seen: Vec<RemoteSeen>,
    deltas: DeltasCache,
    delta_draft: Option<DeltaDraft>,

    builder: Option<TreeBuilder>,
    update_started: Option<Instant>,
    session: Option<DiffSession>,
    epoch: u64,

    held_advise: Option<(TreeHash, oneshot::Sender<ContentObject>, Name)>,

    stats: SliceStats,
    advise_need: bool,
    last_sent_root: Option<TreeHash>,
    last_advise: Instant,
    last_update: Instant,
    last_update_duration: Duration,
    prev_add_len: usize,
    last_stall_warn: Instant,

    enum_pending: bool,
    enum_running: bool,
}

impl SliceState {
    fn new(slice: Slice, callback: NameCallback, config: &SyncConfig, with_repo: bool) -> Self {
        let now = Instant::now();
        let key = slice.hash();
        Self {
            slice,
            key,
            cache: HashCache::new(),
            current_root: TreeHash::empty(),
            callback,
            pending_name: None,
            names_to_add: Vec::new(),
            names_to_fetch: VecDeque::new(),
            content_retries: HashMap::new(),
            content_busy: 0,
            names_seen: 0,
            remote_seen: Vec::new(),
            deltas: DeltasCache::new(config.deltas_limit),
            delta_draft: None,
            builder: None,
            update_started: None,
            session: None,
            epoch: 0,
            held_advise: None,
            stats: SliceStats::default(),
            advise_need: true,
            last_sent_root: None,
            last_advise: now,
            last_update: now,
            last_update_duration: Duration::ZERO,
            prev_add_len: 0,
            last_stall_warn: now,
            enum_pending: with_repo,
            enum_running: false,
        }
    }

    fn note_remote(&mut self, hash: &TreeHash) {
        self.cache.enter(hash, Origin::Remote);
        if let Some(idx) = self.remote_seen.iter().position(|r| &r.hash == hash) {
            let mut seen = self.remote_seen.remove(idx);
            seen.last_seen = Instant::now();
            self.remote_seen.insert(0, seen);
        } else {
            self.remote_seen.insert(
                0,
                RemoteSeen {
                    hash: hash.clone(),
                    last_seen: Instant::now(),
                },
            );
        }
    }

    /// Most recently seen remote hash that is not yet covered.
    fn choose_remote(&mut self) -> Option<TreeHash> {
        let cache = &mut self.cache;
        self.remote_seen
            .iter()
            .find(|seen| {
                cache
                    .lookup_mut(&seen.hash)
                    .map(|entry| !entry.is_covered())
                    .unwrap_or(false)
            })
            .map(|seen| seen.hash.clone())
    }
}

/// Bridges a session's name sink onto the client callback and the
/// slice's pending-name buffers.
struct SinkBridge<'a> {
    callback: &'a mut NameCallback,
    local: TreeHash,
    remote: TreeHash,
    to_fetch: Option<&'a mut VecDeque<Name>>,
    to_add: &'a mut Vec<Name>,
}

impl NameSink for SinkBridge<'_> {
    fn add(&mut self, name: Option<&Name>) -> bool {
        match name {
            Some(n) => {
                if (self.callback)(&self.local, &self.remote, Some(n)) < 0 {
                    return false;
                }
                match &mut self.to_fetch {
                    Some(queue) => queue.push_back(n.clone()),
                    None => self.to_add.push(n.clone()),
                }
                true
            }
            None => {
                let _ = (self.callback)(&self.local, &self.remote, None);
                true
            }
        }
    }
}

pub(crate) struct SyncManager {
    config: SyncConfig,
    transport: Arc<dyn SyncTransport>,
    repo: Option<Arc<dyn RepoHooks>>,
    slices: HashMap<SliceHash, SliceState>,
    commands: mpsc::Receiver<Command>,
    inbound: mpsc::Receiver<InboundRequest>,
    inbound_tx: mpsc::Sender<InboundRequest>,
    events: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<Event>,
    rng: StdRng,
    last_clean: Instant,
    last_purge: Instant,
    last_fence: Instant,
    fence_seq: u64,
}

impl SyncManager {
    pub(crate) fn spawn(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        repo: Option<Arc<dyn RepoHooks>>,
    ) -> mpsc::Sender<Command> {
        let (command_tx, commands) = mpsc::channel(64);
        let (inbound_tx, inbound) = mpsc::channel(64);
        let (events_tx, events) = mpsc::channel(256);
        let now = Instant::now();
        let manager = Self {
            config,
            transport,
            repo,
            slices: HashMap::new(),
            commands,
            inbound,
            inbound_tx,
            events,
            events_tx,
            rng: StdRng::from_entropy(),
            last_clean: now,
            last_purge: now,
            last_fence: now,
            fence_seq: 0,
        };
        drop(tokio::spawn(manager.run()));
        command_tx
    }

    async fn run(mut self) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(slices = 0, "sync controller running");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                Some(request) = self.inbound.recv() => {
                    self.handle_inbound(request);
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
                _ = heartbeat.tick() => {
                    self.tick().await;
                }
            }
        }
        for state in self.slices.values_mut() {
            if let Some(session) = state.session.as_mut() {
                session.cancel(&mut state.cache);
            }
            if let Some(builder) = state.builder.as_mut() {
                builder.abandon(&mut state.cache);
            }
        }
        info!("sync controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open {
                slice,
                callback,
                resume_hash,
                resume_name,
                outcome,
            } => {
                if !self.config.enable {
                    let _ = outcome.send(Err("sync is disabled".into()));
                    return;
                }
                let key = slice.hash();
                if self.slices.contains_key(&key) {
                    let _ = outcome.send(Err(format!("slice {key} is already open")));
                    return;
                }
                if let Err(err) = self
                    .transport
                    .register_filter(slice.topo_prefix().clone(), self.inbound_tx.clone())
                    .await
                {
                    let _ = outcome.send(Err(err.to_string()));
                    return;
                }
                let mut state =
                    SliceState::new(slice, callback, &self.config, self.repo.is_some());
                if let Some(root) = resume_hash {
                    state.current_root = root;
                }
                state.pending_name = resume_name;
                info!(slice = %key, root = %state.current_root, "slice opened");
                self.slices.insert(key, state);
                let _ = outcome.send(Ok(key));
            }
            Command::Close { key, outcome } => {
                let Some(mut state) = self.slices.remove(&key) else {
                    let _ = outcome.send(None);
                    return;
                };
                if let Some(session) = state.session.as_mut() {
                    session.cancel(&mut state.cache);
                }
                if let Some(builder) = state.builder.as_mut() {
                    builder.abandon(&mut state.cache);
                }
                info!(slice = %key, root = %state.current_root, "slice closed");
                let _ = outcome.send(Some((state.current_root, state.pending_name)));
            }
            Command::AddNames { key, names } => {
                if let Some(state) = self.slices.get_mut(&key) {
                    for name in names {
                        if state.slice.contains(&name) {
                            state.names_seen += 1;
                            state.names_to_add.push(name);
                        }
                    }
                }
            }
            Command::RootHash { key, outcome } => {
                let _ = outcome.send(
                    self.slices
                        .get(&key)
                        .map(|state| state.current_root.clone()),
                );
            }
            Command::Stats { key, outcome } => {
                let _ = outcome.send(self.slices.get(&key).map(|state| state.stats.clone()));
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Routes an inbound protocol request to its slice.
    fn handle_inbound(&mut self, request: InboundRequest) {
        let Some(key) = self.slices.values().find_map(|state| {
            parse_command_name(state.slice.topo_prefix(), &request.name)
                .filter(|(_, slice_hash, _)| *slice_hash == state.key)
                .map(|_| state.key)
        }) else {
            trace!(name = %request.name, "inbound request matches no slice");
            return;
        };
        let state = self.slices.get_mut(&key).expect("slice just matched");
        let (cmd, _, target) =
            parse_command_name(state.slice.topo_prefix(), &request.name).expect("parsed above");
        let target = target.map(<[u8]>::to_vec);

        if cmd == marker::ROOT_ADVISE {
            state.stats.root_advise_seen += 1;
            let remote_root = TreeHash::from_bytes(target.unwrap_or_default());
            if !remote_root.is_empty() {
                state.note_remote(&remote_root);
            }
            if remote_root == state.current_root {
                // no news for this peer; answer when the root moves
                trace!(slice = %key, "advise held until the root changes");
                state.held_advise = Some((remote_root, request.reply, request.name));
                return;
            }
            let fresh = self.config.root_advise_fresh;
            if let Some(reply) = Self::advise_reply(state, &remote_root, &request.name, fresh) {
                let _ = request.reply.send(reply);
            }
        } else if cmd == marker::NODE_FETCH {
            state.stats.node_fetch_seen += 1;
            let hash = TreeHash::from_bytes(target.unwrap_or_default());
            let body = state
                .cache
                .lookup(&hash)
                .and_then(|entry| entry.node())
                .cloned();
            match body {
                Some(node) => {
                    let _ = request
                        .reply
                        .send(ContentObject::new(request.name, node.encoding().to_vec()));
                }
                None => trace!(slice = %key, %hash, "node fetch for unknown hash"),
            }
        } else if cmd == marker::STATS {
            let _ = request.reply.send(
                ContentObject::new(request.name, state.stats.render().into_bytes())
                    .with_freshness(self.config.root_advise_fresh),
            );
        } else {
            trace!(slice = %key, "unknown command marker");
        }
    }

    /// Builds the reply to a root advise: a cached delta list when the
    /// peer's root matches one, otherwise our root node (or an empty
    /// payload when we hold the empty tree).
    fn advise_reply(
        state: &mut SliceState,
        remote_root: &TreeHash,
        request_name: &Name,
        fresh_secs: u64,
    ) -> Option<ContentObject> {
        if let Some(record) = state.deltas.find(remote_root) {
            state.stats.deltas_served += 1;
            return Some(
                ContentObject::new(request_name.clone(), record.coding.clone())
                    .with_freshness(fresh_secs),
            );
        }
        if state.current_root.is_empty() {
            return Some(
                ContentObject::new(request_name.clone(), Vec::new())
                    .with_freshness(fresh_secs),
            );
        }
        let body = state
            .cache
            .lookup(&state.current_root.clone())
            .and_then(|entry| entry.node())
            .cloned()?;
        Some(
            ContentObject::new(request_name.clone(), body.encoding().to_vec())
                .with_freshness(fresh_secs),
        )
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::AdviseReply { key, result } => self.on_advise_reply(key, result).await,
            Event::FetchDone {
                key,
                epoch,
                hash,
                side,
                from_repo,
                result,
            } => {
                self.on_fetch_done(key, epoch, hash, side, from_repo, result)
                    .await;
            }
            Event::ContentDone {
                key,
                epoch,
                name,
                ok,
            } => {
                let Some(state) = self.slices.get_mut(&key) else {
                    return;
                };
                if state.epoch != epoch {
                    return;
                }
                state.content_busy = state.content_busy.saturating_sub(1);
                if ok {
                    state.stats.content_fetch_received += 1;
                    let _ = state.content_retries.remove(&name);
                    state.names_seen += 1;
                    state.names_to_add.push(name);
                } else {
                    state.stats.content_fetch_failed += 1;
                    let tries = state.content_retries.entry(name.clone()).or_insert(0);
                    *tries += 1;
                    if *tries < 2 {
                        state.names_to_fetch.push_back(name);
                    } else {
                        warn!(slice = %key, %name, "content unavailable, name dropped");
                    }
                }
                self.pump_session(key).await;
            }
            Event::EnumName { key, name } => {
                if let Some(state) = self.slices.get_mut(&key) {
                    if state.slice.contains(&name) {
                        state.names_seen += 1;
                        state.names_to_add.push(name);
                    }
                }
            }
            Event::EnumDone { key, ok } => {
                if let Some(state) = self.slices.get_mut(&key) {
                    state.enum_running = false;
                    state.enum_pending = !ok;
                    debug!(slice = %key, ok, buffered = state.names_to_add.len(),
                        "slice enumeration finished");
                }
            }
            Event::StoreDone { key, hash, ok } => {
                if let Some(state) = self.slices.get_mut(&key) {
                    if let Some(entry) = state.cache.lookup_mut(&hash) {
                        entry.state.storing = false;
                        if ok {
                            entry.state.stored = true;
                        } else {
                            // retried on a later clean pass
                            state.cache.queue_store(&hash);
                        }
                    }
                }
            }
        }
    }

    async fn on_advise_reply(
        &mut self,
        key: SliceHash,
        result: Result<Option<ContentObject>, TransportError>,
    ) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        match result {
            Ok(Some(object)) if object.payload.is_empty() => {
                // peer starts from the empty root; nothing to pull
                state.stats.root_advise_received += 1;
                trace!(slice = %key, "peer advised the empty root");
            }
            Ok(Some(object)) if is_deltas_coding(&object.payload) => {
                state.stats.root_advise_received += 1;
                match decode_deltas(&object.payload) {
                    Ok(names) => {
                        debug!(slice = %key, names = names.len(), "delta reply received");
                        let local = state.current_root.clone();
                        for name in names {
                            if (state.callback)(&local, &TreeHash::empty(), Some(&name)) < 0 {
                                break;
                            }
                            state.names_seen += 1;
                            state.names_to_add.push(name);
                        }
                    }
                    Err(err) => {
                        warn!(slice = %key, %err, "undecodable delta reply");
                        state.stats.root_advise_failed += 1;
                    }
                }
            }
            Ok(Some(object)) => match TreeNode::parse(&object.payload, MAX_NODE_ENCODING) {
                Ok(node) => {
                    state.stats.root_advise_received += 1;
                    let remote_root = node.hash().clone();
                    let node: NodeArc = Arc::new(node);
                    state.cache.install_remote(node);
                    state.note_remote(&remote_root);
                    debug!(slice = %key, root = %remote_root, "remote root advised");
                }
                Err(err) => {
                    warn!(slice = %key, %err, "undecodable advise reply");
                    state.stats.root_advise_failed += 1;
                }
            },
            Ok(None) => {
                state.stats.root_advise_failed += 1;
            }
            Err(err) => {
                trace!(slice = %key, %err, "advise request failed");
                state.stats.root_advise_failed += 1;
            }
        }
    }

    async fn on_fetch_done(
        &mut self,
        key: SliceHash,
        epoch: u64,
        hash: TreeHash,
        _side: Side,
        from_repo: bool,
        result: Result<Option<ContentObject>, TransportError>,
    ) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        if state.epoch != epoch || state.session.is_none() {
            // the session this fetch belonged to is gone
            return;
        }
        let installed = match result {
            Ok(Some(object)) => match TreeNode::parse(&object.payload, MAX_NODE_ENCODING) {
                Ok(node) if node.hash() == &hash => {
                    let node: NodeArc = Arc::new(node);
                    if from_repo {
                        state.cache.install_local(node);
                    } else {
                        state.cache.install_remote(node);
                    }
                    true
                }
                Ok(_) => {
                    warn!(slice = %key, %hash, "fetched node does not match its hash");
                    false
                }
                Err(err) => {
                    warn!(slice = %key, %hash, %err, "undecodable node fetch reply");
                    false
                }
            },
            Ok(None) | Err(_) => false,
        };
        if installed {
            state.stats.node_fetch_received += 1;
        } else {
            state.stats.node_fetch_failed += 1;
        }
        let session = state.session.as_mut().expect("session checked above");
        session.note_fetch(&mut state.cache, &hash, installed);
        self.pump_session(key).await;
    }

    async fn tick(&mut self) {
        let keys: Vec<SliceHash> = self.slices.keys().copied().collect();
        for key in keys {
            self.tick_slice(key).await;
        }
        self.clean_store_queues().await;
        self.purge_caches();
        self.fence().await;
    }

    async fn tick_slice(&mut self, key: SliceHash) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };

        // 1. startup enumeration gates everything else
        if state.enum_pending && !state.enum_running {
            if let Some(repo) = self.repo.clone() {
                state.enum_pending = false;
                state.enum_running = true;
                let slice = state.slice.clone();
                let events = self.events_tx.clone();
                drop(tokio::spawn(async move {
                    let (tx, mut rx) = mpsc::channel::<Name>(64);
                    let run = repo.enumerate(&slice, tx);
                    let forward = async {
                        while let Some(name) = rx.recv().await {
                            if events.send(Event::EnumName { key, name }).await.is_err() {
                                return false;
                            }
                        }
                        true
                    };
                    let (run, _) = tokio::join!(run, forward);
                    let _ = events
                        .send(Event::EnumDone {
                            key,
                            ok: run.is_ok(),
                        })
                        .await;
                }));
            } else {
                state.enum_pending = false;
            }
            return;
        }
        if state.enum_running {
            return;
        }

        // 2. a builder in progress keeps the slice to itself
        if state.builder.is_some() {
            self.pump_builder(key).await;
            return;
        }

        if state.session.is_none() {
            // 3a. advance the local root over buffered names
            let grew = state.names_to_add.len() != state.prev_add_len;
            state.prev_add_len = state.names_to_add.len();
            if !state.names_to_add.is_empty() && Self::update_due(state, grew) {
                self.start_builder(key).await;
                return;
            }
            // 3b. advertise the current root
            let advise_due = state.advise_need
                || state.last_sent_root.as_ref() != Some(&state.current_root)
                || state.last_advise.elapsed() >= self.config.root_advise_lifetime();
            if advise_due {
                self.send_advise(key).await;
            }

            // 3c. start differencing against an uncovered remote root
            let busy_compares = self
                .slices
                .values()
                .filter(|s| s.session.is_some())
                .count();
            if busy_compares < self.config.max_compares_busy {
                if let Some(state) = self.slices.get_mut(&key) {
                    if let Some(remote) = state.choose_remote() {
                        state.epoch += 1;
                        debug!(
                            slice = %key,
                            local = %state.current_root,
                            remote = %remote,
                            "differencing session starting"
                        );
                        state.session = Some(DiffSession::new(
                            state.current_root.clone(),
                            remote,
                            self.config.max_fetch_busy,
                        ));
                        self.pump_session(key).await;
                    }
                }
            }
        } else {
            // 4. police the running session
            let state = self.slices.get_mut(&key).expect("slice exists");
            let session = state.session.as_mut().expect("session exists");
            if session.stalled() {
                state.stats.compares_failed += 1;
                let mut sink = SinkBridge {
                    callback: &mut state.callback,
                    local: session.hash_x().clone(),
                    remote: session.hash_y().clone(),
                    to_fetch: None,
                    to_add: &mut state.names_to_add,
                };
                session.abort(&mut state.cache, &mut sink, "no fetch progress");
                state.session = None;
                return;
            }
            if session.since_last_fetch() >= Duration::from_secs(UPDATE_STALL_DELTA_SECS)
                && state.last_stall_warn.elapsed() >= Duration::from_secs(UPDATE_STALL_DELTA_SECS)
            {
                warn!(slice = %key, "compare stalled?");
                state.last_stall_warn = Instant::now();
            }
            self.pump_session(key).await;
        }
    }

    /// Adaptive pacing: an unchanged buffer defers the next update to
    /// twice the previous update's duration, bounded by the ceiling.
    fn update_due(state: &SliceState, grew: bool) -> bool {
        if grew {
            return true;
        }
        let backoff = (state.last_update_duration * 2)
            .min(Duration::from_secs(UPDATE_NEED_DELTA_SECS));
        state.last_update.elapsed() >= backoff
    }

    async fn start_builder(&mut self, key: SliceHash) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        let batch = std::mem::take(&mut state.names_to_add);
        state.prev_add_len = 0;
        let draft = state.deltas.begin(state.current_root.clone()).map(|mut d| {
            let mut sorted = batch.clone();
            sorted.sort_unstable();
            sorted.dedup();
            for name in &sorted {
                d.push(name);
            }
            d
        });
        match TreeBuilder::new(
            &mut state.cache,
            state.current_root.clone(),
            batch,
            self.config.node_split_trigger,
            self.config.hash_split_trigger,
        ) {
            Some(builder) => {
                state.builder = Some(builder);
                state.delta_draft = draft;
                state.update_started = Some(Instant::now());
                self.pump_builder(key).await;
            }
            None => {
                trace!(slice = %key, "empty batch, root unchanged");
            }
        }
    }

    async fn pump_builder(&mut self, key: SliceHash) {
        loop {
            let Some(state) = self.slices.get_mut(&key) else {
                return;
            };
            let Some(builder) = state.builder.as_mut() else {
                return;
            };
            match builder.step(&mut state.cache) {
                Ok(BuildOutcome::Yielded) => {
                    tokio::task::yield_now().await;
                }
                Ok(BuildOutcome::Complete(new_root)) => {
                    let builder = state.builder.take().expect("builder exists");
                    self.finish_update(key, builder, new_root);
                    return;
                }
                Err(err) => {
                    error!(slice = %key, %err, "tree update failed; root unchanged");
                    let mut builder = state.builder.take().expect("builder exists");
                    builder.abandon(&mut state.cache);
                    state.delta_draft = None;
                    state.update_started = None;
                    return;
                }
            }
        }
    }

    fn finish_update(&mut self, key: SliceHash, builder: TreeBuilder, new_root: TreeHash) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        let elapsed = state
            .update_started
            .take()
            .map(|at| at.elapsed())
            .unwrap_or_default();
        state.stats.updates_done += 1;
        state.stats.last_update_micros = elapsed.as_micros() as u64;
        state.stats.nodes_created += builder.nodes_created();
        state.stats.nodes_shared += builder.nodes_shared();
        state.stats.names_added += builder.names_added();
        state.last_update = Instant::now();
        state.last_update_duration = elapsed;

        if let Some(draft) = state.delta_draft.take() {
            let _ = state.deltas.close(draft, new_root.clone());
        }
        if new_root != state.current_root {
            info!(
                slice = %key,
                old = %state.current_root,
                new = %new_root,
                names = builder.names_added(),
                "local root advanced"
            );
            state.current_root = new_root;
            state.advise_need = true;
            self.fence_seq = self.fence_seq.max(state.names_seen);
            self.release_held_advise(key);
        }
    }

    /// Answers a held advise after the local root moved.
    fn release_held_advise(&mut self, key: SliceHash) {
        let fresh = self.config.root_advise_fresh;
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        let Some((their_root, reply, request_name)) = state.held_advise.take() else {
            return;
        };
        if let Some(object) = Self::advise_reply(state, &their_root, &request_name, fresh) {
            let _ = reply.send(object);
        }
    }

    async fn send_advise(&mut self, key: SliceHash) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        state.advise_need = false;
        state.last_advise = Instant::now();
        state.last_sent_root = Some(state.current_root.clone());
        state.stats.root_advise_sent += 1;
        let request = command_name(
            state.slice.topo_prefix(),
            marker::ROOT_ADVISE,
            &key,
            Some(&state.current_root),
        );
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let template = RequestTemplate::new(self.config.root_advise_lifetime())
            .with_scope(self.config.sync_scope);
        trace!(slice = %key, root = %state.current_root, "root advise out");
        drop(tokio::spawn(async move {
            let result = transport.express_request(request, template).await;
            let _ = events.send(Event::AdviseReply { key, result }).await;
        }));
    }

    /// Steps the active session until it needs outside help, then
    /// issues whatever it asked for.
    async fn pump_session(&mut self, key: SliceHash) {
        loop {
            let Some(state) = self.slices.get_mut(&key) else {
                return;
            };
            let Some(session) = state.session.as_mut() else {
                return;
            };
            let use_content_fetch = self.repo.is_some() && self.config.repo_store;
            let mut sink = SinkBridge {
                callback: &mut state.callback,
                local: session.hash_x().clone(),
                remote: session.hash_y().clone(),
                to_fetch: use_content_fetch.then_some(&mut state.names_to_fetch),
                to_add: &mut state.names_to_add,
            };
            match session.step(&mut state.cache, &mut sink) {
                DiffOutcome::Progress => {
                    tokio::task::yield_now().await;
                }
                DiffOutcome::AwaitFetch => {
                    self.issue_node_fetches(key).await;
                    return;
                }
                DiffOutcome::NamesEmitted => {
                    // waiting phase: pull content for discovered names
                    if state.content_busy == 0 && state.names_to_fetch.is_empty() {
                        let mut sink = SinkBridge {
                            callback: &mut state.callback,
                            local: session.hash_x().clone(),
                            remote: session.hash_y().clone(),
                            to_fetch: None,
                            to_add: &mut state.names_to_add,
                        };
                        session.complete(&mut state.cache, &mut sink);
                        continue;
                    }
                    self.issue_content_fetches(key).await;
                    return;
                }
                DiffOutcome::Finished => {
                    state.stats.compares_done += 1;
                    state.stats.last_compare_micros = session.elapsed().as_micros() as u64;
                    let names = session.names_added();
                    debug!(slice = %key, names, "differencing session finished");
                    state.session = None;
                    return;
                }
                DiffOutcome::Failed => {
                    state.stats.compares_failed += 1;
                    state.session = None;
                    return;
                }
            }
        }
    }

    async fn issue_node_fetches(&mut self, key: SliceHash) {
        let (requests, epoch, topo) = {
            let Some(state) = self.slices.get_mut(&key) else {
                return;
            };
            let Some(session) = state.session.as_mut() else {
                return;
            };
            let requests = session.take_requests();
            if requests.is_empty() {
                return;
            }
            (requests, state.epoch, state.slice.topo_prefix().clone())
        };
        for request in requests {
            // synthetic failure injection ahead of the transport
            let faux = self.config.faux_error > 0
                && self.rng.gen_range(0..100) < self.config.faux_error;
            let Some(state) = self.slices.get_mut(&key) else {
                return;
            };
            state.stats.node_fetch_sent += 1;
            if faux {
                warn!(slice = %key, hash = %request.hash, "faux fetch error injected");
                if let Some(session) = state.session.as_mut() {
                    session.note_fetch(&mut state.cache, &request.hash, false);
                }
                continue;
            }
            let name = command_name(&topo, marker::NODE_FETCH, &key, Some(&request.hash));
            let transport = self.transport.clone();
            let repo = self.repo.clone();
            let events = self.events_tx.clone();
            let template = RequestTemplate::new(self.config.node_fetch_lifetime())
                .with_scope(self.config.sync_scope);
            let hash = request.hash.clone();
            let side = request.side;
            drop(tokio::spawn(async move {
                if let Some(repo) = &repo {
                    if let Ok(Some(object)) = repo.lookup(&name).await {
                        let _ = events
                            .send(Event::FetchDone {
                                key,
                                epoch,
                                hash,
                                side,
                                from_repo: true,
                                result: Ok(Some(object)),
                            })
                            .await;
                        return;
                    }
                }
                let result = transport.express_request(name, template).await;
                let _ = events
                    .send(Event::FetchDone {
                        key,
                        epoch,
                        hash,
                        side,
                        from_repo: false,
                        result,
                    })
                    .await;
            }));
        }
    }

    async fn issue_content_fetches(&mut self, key: SliceHash) {
        let Some(state) = self.slices.get_mut(&key) else {
            return;
        };
        let epoch = state.epoch;
        while state.content_busy < self.config.max_fetch_busy {
            let Some(name) = state.names_to_fetch.pop_front() else {
                break;
            };
            state.content_busy += 1;
            state.stats.content_fetch_sent += 1;
            let transport = self.transport.clone();
            let repo = self.repo.clone();
            let events = self.events_tx.clone();
            let template = RequestTemplate::new(self.config.node_fetch_lifetime())
                .with_scope(self.config.sync_scope);
            drop(tokio::spawn(async move {
                let result = transport.express_request(name.clone(), template).await;
                let ok = match result {
                    Ok(Some(object)) => {
                        if let Some(repo) = &repo {
                            if let Err(err) = repo.store(object).await {
                                warn!(%err, "content store failed");
                            }
                        }
                        true
                    }
                    _ => false,
                };
                let _ = events
                    .send(Event::ContentDone {
                        key,
                        epoch,
                        name,
                        ok,
                    })
                    .await;
            }));
        }
    }

    /// Drains a batch of the per-slice store queues through the repo.
    async fn clean_store_queues(&mut self) {
        if self.repo.is_none()
            || !self.config.repo_store
            || self.last_clean.elapsed() < Duration::from_secs(CACHE_CLEAN_DELTA_SECS)
        {
            return;
        }
        self.last_clean = Instant::now();
        let repo = self.repo.clone().expect("checked above");
        let keys: Vec<SliceHash> = self.slices.keys().copied().collect();
        for key in keys {
            let Some(state) = self.slices.get_mut(&key) else {
                continue;
            };
            let topo = state.slice.topo_prefix().clone();
            for _ in 0..CACHE_CLEAN_BATCH {
                let Some(hash) = state.cache.pop_store() else {
                    break;
                };
                let Some(node) = state
                    .cache
                    .lookup(&hash)
                    .and_then(|entry| entry.local_node())
                    .cloned()
                else {
                    continue;
                };
                let object = ContentObject::new(
                    command_name(&topo, marker::NODE_FETCH, &key, Some(&hash)),
                    node.encoding().to_vec(),
                );
                let repo = repo.clone();
                let events = self.events_tx.clone();
                drop(tokio::spawn(async move {
                    let ok = repo.store(object).await.is_ok();
                    let _ = events.send(Event::StoreDone { key, hash, ok }).await;
                }));
            }
        }
    }

    /// Periodic reachability sweep over every slice cache.
    fn purge_caches(&mut self) {
        let trigger = Duration::from_secs(CACHE_PURGE_TRIGGER_SECS);
        if self.last_purge.elapsed() < trigger {
            return;
        }
        self.last_purge = Instant::now();
        for state in self.slices.values_mut() {
            state
                .remote_seen
                .retain(|seen| seen.last_seen.elapsed() < trigger);
            state.cache.clear_marks();
            let root = state.current_root.clone();
            let reachable = mark_reachable(&mut state.cache, &root);
            let dropped = state.cache.purge_unmarked(trigger);
            debug!(slice = %state.key, reachable, dropped, "cache purge");
        }
    }

    async fn fence(&mut self) {
        if !self.config.stable_enabled
            || self.last_fence.elapsed() < Duration::from_secs(FENCE_SECONDS)
        {
            return;
        }
        let Some(repo) = self.repo.clone() else {
            return;
        };
        self.last_fence = Instant::now();
        let seq = self.fence_seq;
        drop(tokio::spawn(async move {
            if let Err(err) = repo.fence(seq).await {
                warn!(%err, "fence failed");
            }
        }));
    }
}
