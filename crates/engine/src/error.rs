//! Error kinds of the synchronization engine.

use namesync_primitives::wire::WireError;
use namesync_primitives::TreeHash;
use thiserror::Error;

/// Failures decoding or verifying a tree node encoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("unsupported node version {0}")]
    VersionMismatch(u64),

    #[error("malformed node encoding: {0}")]
    Structure(#[from] WireError),

    #[error("references out of order or mixed kinds")]
    BadReferences,

    #[error("node hash does not match its elements")]
    HashMismatch,

    #[error("node encoding of {size} bytes exceeds ceiling {limit}")]
    Oversize { size: usize, limit: usize },
}

/// Failures of a running session (differencing or building).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    #[error("cache entry {0} is missing or inconsistent")]
    CacheCorruption(TreeHash),

    #[error("node fetch for {0} failed")]
    FetchFailed(TreeHash),

    #[error("no progress within the stall deadline")]
    Stalled,

    #[error("name callback requested termination")]
    ClientAbort,

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport rejected the request: {0}")]
    Transport(#[from] TransportError),
}

/// Failures at the transport boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("content failed verification")]
    Unverified,

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}
