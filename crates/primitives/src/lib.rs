//! Domain types for the namesync engine.
//!
//! This crate holds the value types the synchronization protocol is
//! built from: ordered opaque [`Name`]s, the carry-addition
//! [`LongHash`] accumulator and its [`TreeHash`] output, the tagged
//! TLV [`wire`] codec the canonical encodings are written in, the
//! [`Slice`] descriptor identifying a namespace subset, and the
//! engine [`SyncConfig`].
//!
//! Everything here is independent of the transport and the scheduler;
//! the behavior lives in `namesync-engine`.

pub mod config;
pub mod hash;
pub mod name;
pub mod slice;
pub mod wire;

pub use config::SyncConfig;
pub use hash::{LongHash, TreeHash, MAX_HASH_BYTES};
pub use name::{Name, NameRelation};
pub use slice::{Slice, SliceHash, SLICE_VERSION};

/// Format version carried in every tree node encoding.
pub const SYNC_VERSION: u64 = 20_110_614;

/// Format version carried in delta codings.
pub const DELTAS_VERSION: u64 = 20_120_307;
