//! Per-slice counters.

use serde::{Deserialize, Serialize};

/// Tallies for one slice, snapshotted for the stats request and for
/// diagnostics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SliceStats {
    pub updates_done: u64,
    pub last_update_micros: u64,
    pub compares_done: u64,
    pub last_compare_micros: u64,
    pub nodes_created: u64,
    pub nodes_shared: u64,
    pub names_added: u64,

    pub root_advise_sent: u64,
    pub node_fetch_sent: u64,
    pub content_fetch_sent: u64,

    pub root_advise_seen: u64,
    pub node_fetch_seen: u64,

    pub root_advise_received: u64,
    pub node_fetch_received: u64,
    pub content_fetch_received: u64,

    pub root_advise_failed: u64,
    pub node_fetch_failed: u64,
    pub content_fetch_failed: u64,

    pub compares_failed: u64,
    pub deltas_served: u64,
}

impl SliceStats {
    /// Human-readable rendering served for the stats marker.
    pub fn render(&self) -> String {
        format!(
            "updates {} ({} us), compares {} ({} us, {} failed), \
             nodes {}+{}, names {}, \
             advise {}/{}/{} sent/seen/recv, \
             fetch {}/{}/{} sent/seen/recv, \
             content {}/{} sent/recv, \
             failed {}/{}/{} advise/fetch/content, deltas {}",
            self.updates_done,
            self.last_update_micros,
            self.compares_done,
            self.last_compare_micros,
            self.compares_failed,
            self.nodes_created,
            self.nodes_shared,
            self.names_added,
            self.root_advise_sent,
            self.root_advise_seen,
            self.root_advise_received,
            self.node_fetch_sent,
            self.node_fetch_seen,
            self.node_fetch_received,
            self.content_fetch_sent,
            self.content_fetch_received,
            self.root_advise_failed,
            self.node_fetch_failed,
            self.content_fetch_failed,
            self.deltas_served,
        )
    }
}
