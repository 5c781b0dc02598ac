//! Transport and repo boundaries.
//!
//! The engine never opens a socket: it consumes a request/reply
//! transport abstraction (express a request toward a name, register a
//! handler for inbound requests under a prefix, put a content object)
//! and an optional repo for persistence and local lookup. Framing,
//! signing, and key resolution all live behind these traits.

use std::time::Duration;

use async_trait::async_trait;
use namesync_primitives::{Name, Slice, SliceHash, TreeHash};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

/// Command markers distinguishing protocol requests inside a slice's
/// topology prefix.
pub mod marker {
    /// Peer announces/queries a current root.
    pub const ROOT_ADVISE: &[u8] = b"ra";
    /// Peer requests the body of a node by hash.
    pub const NODE_FETCH: &[u8] = b"nf";
    /// Peer requests human-readable statistics.
    pub const STATS: &[u8] = b"stats";
}

/// A (possibly signed) named payload crossing the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentObject {
    pub name: Name,
    pub payload: Vec<u8>,
    /// Seconds the object may be served from intermediate caches;
    /// `None` leaves the transport's default in force.
    pub fresh_secs: Option<u64>,
}

impl ContentObject {
    pub fn new(name: Name, payload: Vec<u8>) -> Self {
        Self {
            name,
            payload,
            fresh_secs: None,
        }
    }

    pub fn with_freshness(mut self, secs: u64) -> Self {
        self.fresh_secs = Some(secs);
        self
    }
}

/// Per-request knobs handed to the transport alongside the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTemplate {
    /// How long the request stays pending before it reads as a
    /// timeout.
    pub lifetime: Duration,
    /// Scope tag limiting how far the request propagates.
    pub scope: u8,
}

impl RequestTemplate {
    pub fn new(lifetime: Duration) -> Self {
        Self { lifetime, scope: 2 }
    }

    pub fn with_scope(mut self, scope: u8) -> Self {
        self.scope = scope;
        self
    }
}

/// An inbound request delivered to a registered filter. Dropping the
/// reply sender lets the request expire unanswered.
#[derive(Debug)]
pub struct InboundRequest {
    pub name: Name,
    pub reply: oneshot::Sender<ContentObject>,
}

/// Builds the protocol request name
/// `<topo_prefix>/<marker>/<slice hash>/<target hash>`.
pub fn command_name(
    topo_prefix: &Name,
    marker: &[u8],
    slice_hash: &SliceHash,
    target: Option<&TreeHash>,
) -> Name {
    let mut name = topo_prefix.clone();
    name.push(marker.to_vec());
    name.push(slice_hash.as_bytes().to_vec());
    if let Some(hash) = target {
        name.push(hash.as_bytes().to_vec());
    }
    name
}

/// Splits a protocol request name back into marker, slice hash, and
/// target component. Returns `None` for names under the wrong prefix
/// or with a malformed shape.
pub fn parse_command_name<'a>(
    topo_prefix: &Name,
    name: &'a Name,
) -> Option<(&'a [u8], SliceHash, Option<&'a [u8]>)> {
    let tail = name.strip_prefix(topo_prefix)?;
    let marker = tail.first()?.as_slice();
    let slice_bytes: [u8; 32] = tail.get(1)?.as_slice().try_into().ok()?;
    let target = tail.get(2).map(Vec::as_slice);
    Some((marker, SliceHash::from_bytes(slice_bytes), target))
}

/// The named-data transport the engine drives.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
    /// Sends a request toward `name` and waits for the reply.
    /// `Ok(None)` is a timeout; verification failures surface as
    /// [`TransportError::Unverified`].
    async fn express_request(
        &self,
        name: Name,
        template: RequestTemplate,
    ) -> Result<Option<ContentObject>, TransportError>;

    /// Publishes a handler for inbound requests under `prefix`.
    async fn register_filter(
        &self,
        prefix: Name,
        handler: mpsc::Sender<InboundRequest>,
    ) -> Result<(), TransportError>;

    /// Sends a signed content object.
    async fn put(&self, object: ContentObject) -> Result<(), TransportError>;
}

/// Optional repo hooks: persistence, local lookup, and enumeration.
#[async_trait]
pub trait RepoHooks: Send + Sync + 'static {
    /// Local store lookup; lets node fetches bypass the network.
    async fn lookup(&self, name: &Name) -> Result<Option<ContentObject>, TransportError>;

    /// Persists a produced node.
    async fn store(&self, object: ContentObject) -> Result<(), TransportError>;

    /// Streams every stored name belonging to `slice` into `into`.
    /// Returns an enumeration id.
    async fn enumerate(
        &self,
        slice: &Slice,
        into: mpsc::Sender<Name>,
    ) -> Result<u64, TransportError>;

    /// Marks a durable checkpoint.
    async fn fence(&self, seq: u64) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Name {
        s.parse().unwrap()
    }

    #[test]
    fn command_name_round_trip() {
        let topo = name("/topo/sync");
        let slice_hash = Slice::with_prefixes(topo.clone(), name("/data")).hash();
        let target = TreeHash::from_bytes(vec![9; 16]);

        let request = command_name(&topo, marker::NODE_FETCH, &slice_hash, Some(&target));
        let (m, s, t) = parse_command_name(&topo, &request).unwrap();
        assert_eq!(m, marker::NODE_FETCH);
        assert_eq!(s, slice_hash);
        assert_eq!(t.unwrap(), target.as_bytes());
    }

    #[test]
    fn advise_name_has_no_target_requirement() {
        let topo = name("/t");
        let slice_hash = Slice::new().hash();
        let request = command_name(&topo, marker::ROOT_ADVISE, &slice_hash, None);
        let (m, _, t) = parse_command_name(&topo, &request).unwrap();
        assert_eq!(m, marker::ROOT_ADVISE);
        assert!(t.is_none());
    }

    #[test]
    fn foreign_prefix_is_rejected() {
        let topo = name("/t");
        let slice_hash = Slice::new().hash();
        let request = command_name(&topo, marker::STATS, &slice_hash, None);
        assert!(parse_command_name(&name("/other"), &request).is_none());
    }
}
