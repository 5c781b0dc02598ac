//! Client surface of the engine.
//!
//! A [`SyncClient`] is a thin handle over the controller task: every
//! method sends a command and awaits its outcome. Slice descriptors
//! themselves are plain values (see `namesync_primitives::Slice`);
//! the free functions at the bottom store and retrieve them through
//! the transport.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, WrapErr};
use namesync_primitives::{Name, Slice, SliceHash, SyncConfig, TreeHash};
use tokio::sync::{mpsc, oneshot};

use crate::controller::{Command, NameCallback, SyncManager};
use crate::error::TransportError;
use crate::stats::SliceStats;
use crate::transport::{ContentObject, RepoHooks, RequestTemplate, SyncTransport};

/// Routing prefix under which slice descriptors are stored.
const SLICE_STORE_PREFIX: &[&[u8]] = &[b"localhost", b"cs"];

/// Handle to an open slice. Opaque; pass it back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceSession {
    key: SliceHash,
}

impl SliceSession {
    pub fn key(&self) -> SliceHash {
        self.key
    }
}

/// Handle to a running sync controller.
#[derive(Clone)]
pub struct SyncClient {
    commands: mpsc::Sender<Command>,
}

impl SyncClient {
    /// Spawns the controller task and returns its handle.
    pub fn start(
        config: SyncConfig,
        transport: Arc<dyn SyncTransport>,
        repo: Option<Arc<dyn RepoHooks>>,
    ) -> Self {
        Self {
            commands: SyncManager::spawn(config, transport, repo),
        }
    }

    /// Opens a slice for reconciliation. The callback fires once per
    /// discovered name and once with `None` at every session end;
    /// returning a negative value stops the running session.
    ///
    /// `resume_hash` restarts from a previously closed root instead
    /// of the empty tree; `resume_name` is carried through and handed
    /// back by [`Self::close`].
    pub async fn open(
        &self,
        slice: Slice,
        callback: impl FnMut(&TreeHash, &TreeHash, Option<&Name>) -> i32 + Send + 'static,
        resume_hash: Option<TreeHash>,
        resume_name: Option<Name>,
    ) -> eyre::Result<SliceSession> {
        let (outcome, result) = oneshot::channel();
        self.commands
            .send(Command::Open {
                slice,
                callback: Box::new(callback) as NameCallback,
                resume_hash,
                resume_name,
                outcome,
            })
            .await
            .map_err(|_| eyre!("sync controller is gone"))?;
        let key = result
            .await
            .map_err(|_| eyre!("sync controller is gone"))?
            .map_err(|err| eyre!(err))?;
        Ok(SliceSession { key })
    }

    /// Closes a slice, returning its current root hash and the
    /// pending resume name. The name callback is not invoked from
    /// here.
    pub async fn close(&self, session: SliceSession) -> eyre::Result<(TreeHash, Option<Name>)> {
        let (outcome, result) = oneshot::channel();
        self.commands
            .send(Command::Close {
                key: session.key,
                outcome,
            })
            .await
            .map_err(|_| eyre!("sync controller is gone"))?;
        result
            .await
            .map_err(|_| eyre!("sync controller is gone"))?
            .ok_or_else(|| eyre!("slice {} is not open", session.key))
    }

    /// Buffers locally known names for the next root update. Names
    /// outside the slice are ignored.
    pub async fn add_names(
        &self,
        session: SliceSession,
        names: Vec<Name>,
    ) -> eyre::Result<()> {
        self.commands
            .send(Command::AddNames {
                key: session.key,
                names,
            })
            .await
            .map_err(|_| eyre!("sync controller is gone"))
    }

    /// The slice's current root hash.
    pub async fn root_hash(&self, session: SliceSession) -> eyre::Result<TreeHash> {
        let (outcome, result) = oneshot::channel();
        self.commands
            .send(Command::RootHash {
                key: session.key,
                outcome,
            })
            .await
            .map_err(|_| eyre!("sync controller is gone"))?;
        result
            .await
            .map_err(|_| eyre!("sync controller is gone"))?
            .ok_or_else(|| eyre!("slice {} is not open", session.key))
    }

    /// Counter snapshot for diagnostics.
    pub async fn stats(&self, session: SliceSession) -> eyre::Result<SliceStats> {
        let (outcome, result) = oneshot::channel();
        self.commands
            .send(Command::Stats {
                key: session.key,
                outcome,
            })
            .await
            .map_err(|_| eyre!("sync controller is gone"))?;
        result
            .await
            .map_err(|_| eyre!("sync controller is gone"))?
            .ok_or_else(|| eyre!("slice {} is not open", session.key))
    }

    /// Stops the controller; open slices are torn down without
    /// callbacks.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Canonical storage name of a slice descriptor:
/// `/localhost/cs/<slice hash>`.
pub fn slice_name(slice: &Slice) -> Name {
    let mut name = Name::root();
    for component in SLICE_STORE_PREFIX {
        name.push(component.to_vec());
    }
    name.push(slice.hash().as_bytes().to_vec());
    name
}

/// Publishes a slice descriptor; returns the name it was stored
/// under.
pub async fn write_slice(
    transport: &dyn SyncTransport,
    slice: &Slice,
) -> Result<Name, TransportError> {
    let name = slice_name(slice);
    transport
        .put(ContentObject::new(name.clone(), slice.encode()))
        .await?;
    Ok(name)
}

/// Fetches and parses a slice descriptor by name.
pub async fn read_slice(
    transport: &dyn SyncTransport,
    name: &Name,
    lifetime: Duration,
) -> eyre::Result<Slice> {
    let object = transport
        .express_request(name.clone(), RequestTemplate::new(lifetime))
        .await
        .wrap_err("slice fetch failed")?
        .ok_or_else(|| eyre!("no slice stored at {name}"))?;
    Slice::decode(&object.payload).wrap_err("stored slice is malformed")
}

/// Publishes a tombstone for a stored slice: an empty payload under
/// the slice's storage name.
pub async fn delete_slice(
    transport: &dyn SyncTransport,
    name: &Name,
) -> Result<(), TransportError> {
    transport
        .put(ContentObject::new(name.clone(), Vec::new()))
        .await
}
