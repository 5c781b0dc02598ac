//! In-memory two-peer test fabric.
//!
//! Each peer gets a transport endpoint; a request expressed on one
//! side is served from the other side's published objects, or routed
//! to the other side's registered filters and answered through the
//! reply channel. No sockets, no signing: just the request/reply
//! shape the engine drives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use namesync_engine::transport::{
    ContentObject, InboundRequest, RepoHooks, RequestTemplate, SyncTransport,
};
use namesync_engine::TransportError;
use namesync_primitives::{Name, Slice};
use tokio::sync::mpsc;

/// Installs a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

#[derive(Default)]
struct PeerSide {
    filters: Mutex<Vec<(Name, mpsc::Sender<InboundRequest>)>>,
    objects: Mutex<HashMap<Name, ContentObject>>,
}

/// One peer's view of the fabric.
pub struct Endpoint {
    me: Arc<PeerSide>,
    other: Arc<PeerSide>,
}

/// Builds a connected pair of endpoints.
pub fn loopback_pair() -> (Arc<Endpoint>, Arc<Endpoint>) {
    let a = Arc::new(PeerSide::default());
    let b = Arc::new(PeerSide::default());
    (
        Arc::new(Endpoint {
            me: a.clone(),
            other: b.clone(),
        }),
        Arc::new(Endpoint { me: b, other: a }),
    )
}

impl Endpoint {
    /// Publishes a content object on this peer so the other side can
    /// fetch it by name.
    pub fn seed_content(&self, name: Name, payload: Vec<u8>) {
        let object = ContentObject::new(name.clone(), payload);
        let _ = self.me.objects.lock().unwrap().insert(name, object);
    }
}

#[async_trait]
impl SyncTransport for Endpoint {
    async fn express_request(
        &self,
        name: Name,
        template: RequestTemplate,
    ) -> Result<Option<ContentObject>, TransportError> {
        if let Some(object) = self.other.objects.lock().unwrap().get(&name) {
            return Ok(Some(object.clone()));
        }
        let handler = {
            let filters = self.other.filters.lock().unwrap();
            filters
                .iter()
                .find(|(prefix, _)| name.starts_with(prefix))
                .map(|(_, tx)| tx.clone())
        };
        let Some(handler) = handler else {
            return Ok(None);
        };
        let (reply, rx) = tokio::sync::oneshot::channel();
        if handler.send(InboundRequest { name, reply }).await.is_err() {
            return Ok(None);
        }
        match tokio::time::timeout(template.lifetime, rx).await {
            Ok(Ok(object)) => Ok(Some(object)),
            // dropped reply or expired lifetime both read as timeouts
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    async fn register_filter(
        &self,
        prefix: Name,
        handler: mpsc::Sender<InboundRequest>,
    ) -> Result<(), TransportError> {
        self.me.filters.lock().unwrap().push((prefix, handler));
        Ok(())
    }

    async fn put(&self, object: ContentObject) -> Result<(), TransportError> {
        let _ = self
            .me
            .objects
            .lock()
            .unwrap()
            .insert(object.name.clone(), object);
        Ok(())
    }
}

/// In-memory repo: a name-keyed object store with pass-through
/// enumeration and fence bookkeeping.
#[derive(Default)]
pub struct MemRepo {
    objects: Mutex<HashMap<Name, ContentObject>>,
    enum_ids: AtomicU64,
    last_fence: AtomicU64,
}

impl MemRepo {
    pub fn stored_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn last_fence(&self) -> u64 {
        self.last_fence.load(Ordering::Relaxed)
    }

    pub fn has(&self, name: &Name) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl RepoHooks for MemRepo {
    async fn lookup(&self, name: &Name) -> Result<Option<ContentObject>, TransportError> {
        Ok(self.objects.lock().unwrap().get(name).cloned())
    }

    async fn store(&self, object: ContentObject) -> Result<(), TransportError> {
        let _ = self
            .objects
            .lock()
            .unwrap()
            .insert(object.name.clone(), object);
        Ok(())
    }

    async fn enumerate(
        &self,
        slice: &Slice,
        into: mpsc::Sender<Name>,
    ) -> Result<u64, TransportError> {
        let names: Vec<Name> = {
            let objects = self.objects.lock().unwrap();
            objects
                .keys()
                .filter(|name| slice.contains(name))
                .cloned()
                .collect()
        };
        for name in names {
            if into.send(name).await.is_err() {
                break;
            }
        }
        Ok(self.enum_ids.fetch_add(1, Ordering::Relaxed) + 1)
    }

    async fn fence(&self, seq: u64) -> Result<(), TransportError> {
        self.last_fence.fetch_max(seq, Ordering::Relaxed);
        Ok(())
    }
}
