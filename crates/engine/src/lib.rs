//! Named-content dataset synchronization engine.
//!
//! Two peers each hold a subset of a common, name-ordered namespace
//! (a *slice*). This crate reconciles them: each side summarizes its
//! names as a hash-indexed tree, peers exchange root hashes through
//! root-advise requests, and a differencing session walks both trees
//! fetching unknown nodes by hash until every name present remotely
//! but missing locally has been reported. Discovered names feed the
//! incremental tree builder, which advances the local root while
//! reusing every unchanged subtree.
//!
//! The engine is transport-agnostic: it drives the request/reply
//! abstraction in [`transport`] and an optional repo for persistence.
//! All mutable state lives on a single controller task
//! ([`SyncClient`] is the handle); long operations are broken into
//! bounded steps so one slice can never starve the rest.
//!
//! ```no_run
//! use std::sync::Arc;
//! use namesync_engine::SyncClient;
//! use namesync_primitives::{Name, Slice, SyncConfig};
//!
//! # async fn example(transport: Arc<dyn namesync_engine::transport::SyncTransport>) -> eyre::Result<()> {
//! let slice = Slice::with_prefixes(
//!     "/topo/sync".parse()?,
//!     "/data".parse()?,
//! );
//! let client = SyncClient::start(SyncConfig::from_env(), transport, None);
//! let session = client
//!     .open(slice, |_local, _remote, name| {
//!         if let Some(name) = name {
//!             println!("discovered {name}");
//!         }
//!         0
//!     }, None, None)
//!     .await?;
//! client.add_names(session, vec!["/data/hello".parse()?]).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod builder;
pub mod cache;
pub mod controller;
pub mod deltas;
pub mod diff;
pub mod error;
pub mod node;
pub mod stats;
pub mod transport;
pub mod walker;

pub use api::{delete_slice, read_slice, slice_name, write_slice, SliceSession, SyncClient};
pub use builder::{BuildOutcome, TreeBuilder};
pub use cache::{CacheEntry, EntryState, HashCache, Origin};
pub use diff::{DiffOutcome, DiffSession, DiffState, NameSink};
pub use error::{CodecError, SyncError, TransportError};
pub use node::{NodeBuilder, NodeKind, NodeRef, TreeNode};
pub use stats::SliceStats;
pub use walker::TreeWalker;
