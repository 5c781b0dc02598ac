//! Engine configuration.
//!
//! Every option can come from the environment (`NAMESYNC_*`); values
//! outside an option's legal range fall back to the default, matching
//! how the rest of the engine treats bad operator input: clamp and
//! carry on rather than refuse to start.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

const ENV_PREFIX: &str = "NAMESYNC_";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Master on/off switch.
    pub enable: bool,
    /// Free-form verbosity hint, echoed at startup. Actual filtering
    /// belongs to the tracing subscriber installed by the host.
    pub debug: Option<String>,
    /// Publish locally built tree nodes through the repo store hook.
    pub repo_store: bool,
    /// Compute durable checkpoints (repo fence hook).
    pub stable_enabled: bool,
    /// Percentage of node fetches to fail synthetically.
    pub faux_error: u8,
    /// Controller tick interval, microseconds.
    pub heartbeat_micros: u64,
    /// Seconds a root-advise reply stays fresh.
    pub root_advise_fresh: u64,
    /// Seconds a root-advise request lives.
    pub root_advise_lifetime: u64,
    /// Seconds a node-fetch request lives.
    pub node_fetch_lifetime: u64,
    /// Concurrent node fetches per session.
    pub max_fetch_busy: usize,
    /// Concurrent differencing sessions.
    pub max_compares_busy: usize,
    /// Byte budget for delta replies; 0 disables delta codings.
    pub deltas_limit: usize,
    /// Scope tag attached to outgoing requests.
    pub sync_scope: u8,
    /// Node split size threshold, bytes.
    pub node_split_trigger: usize,
    /// Hash-byte threshold for deterministic random splits (of 256).
    pub hash_split_trigger: u8,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable: true,
            debug: None,
            repo_store: true,
            stable_enabled: true,
            faux_error: 0,
            heartbeat_micros: 200_000,
            root_advise_fresh: 4,
            root_advise_lifetime: 20,
            node_fetch_lifetime: 4,
            max_fetch_busy: 6,
            max_compares_busy: 4,
            deltas_limit: 0,
            sync_scope: 2,
            node_split_trigger: 4000,
            hash_split_trigger: 17,
        }
    }
}

fn env_limited(suffix: &str, lo: u64, hi: u64, default: u64) -> u64 {
    match env::var(format!("{ENV_PREFIX}{suffix}")) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if (lo..=hi).contains(&value) => value,
            _ => default,
        },
        Err(_) => default,
    }
}

impl SyncConfig {
    /// Reads `NAMESYNC_*` variables, clamping each to its legal range.
    pub fn from_env() -> Self {
        let default = Self::default();
        let config = Self {
            enable: env_limited("ENABLE", 0, 1, 1) != 0,
            debug: env::var(format!("{ENV_PREFIX}DEBUG")).ok(),
            repo_store: env_limited("REPO_STORE", 0, 1, 1) != 0,
            stable_enabled: env_limited("STABLE_ENABLED", 0, 1, 1) != 0,
            faux_error: env_limited("FAUX_ERROR", 0, 99, 0) as u8,
            heartbeat_micros: env_limited(
                "HEARTBEAT_MICROS",
                10_000,
                10_000_000,
                default.heartbeat_micros,
            ),
            root_advise_fresh: env_limited("ROOT_ADVISE_FRESH", 1, 30, default.root_advise_fresh),
            root_advise_lifetime: env_limited(
                "ROOT_ADVISE_LIFETIME",
                1,
                30,
                default.root_advise_lifetime,
            ),
            node_fetch_lifetime: env_limited(
                "NODE_FETCH_LIFETIME",
                1,
                30,
                default.node_fetch_lifetime,
            ),
            max_fetch_busy: env_limited("MAX_FETCH_BUSY", 1, 100, 6) as usize,
            max_compares_busy: env_limited("MAX_COMPARES_BUSY", 1, 100, 4) as usize,
            deltas_limit: env_limited("DELTAS_LIMIT", 0, 8000, 0) as usize,
            sync_scope: env_limited("SYNC_SCOPE", 0, 3, 2) as u8,
            node_split_trigger: env_limited(
                "NODE_SPLIT_TRIGGER",
                512,
                65_536,
                default.node_split_trigger as u64,
            ) as usize,
            hash_split_trigger: env_limited("HASH_SPLIT_TRIGGER", 0, 255, 17) as u8,
        };
        info!(?config, "sync options loaded");
        config
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_micros(self.heartbeat_micros)
    }

    pub fn node_fetch_lifetime(&self) -> Duration {
        Duration::from_secs(self.node_fetch_lifetime)
    }

    pub fn root_advise_lifetime(&self) -> Duration {
        Duration::from_secs(self.root_advise_lifetime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert!(config.enable);
        assert_eq!(config.heartbeat_micros, 200_000);
        assert_eq!(config.max_fetch_busy, 6);
        assert_eq!(config.node_split_trigger, 4000);
        assert_eq!(config.hash_split_trigger, 17);
        assert_eq!(config.deltas_limit, 0);
    }

    #[test]
    fn out_of_range_env_falls_back() {
        // vars unset in the test environment fall back everywhere
        let config = SyncConfig::from_env();
        assert_eq!(config.max_compares_busy, 4);
    }
}
