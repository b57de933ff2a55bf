//! Per-tablet health snapshot maintained by the health-check engine.

use serde::{Deserialize, Serialize};

use crate::tablet::{Tablet, Target};

/// The realtime payload carried by a `StreamHealthResponse`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeStats {
    pub seconds_behind_master: u64,
    pub health_error: Option<String>,
    pub cpu_usage: f64,
}

/// A snapshot of one tablet's health as currently known to `HealthCheck`.
///
/// `up` is true while the tablet is present in the engine's set; `serving`
/// reflects the last health response; `primary_ts` is the epoch-millis of
/// the tablet's last promotion, used to tie-break stale primaries.
/// `last_error` is populated only while the connection is broken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletStats {
    pub key: String,
    pub name: String,
    pub tablet: Tablet,
    pub target: Target,
    pub up: bool,
    pub serving: bool,
    pub primary_ts: i64,
    pub replication_lag_sec: u64,
    pub last_error: Option<String>,
}

impl PartialEq for TabletStats {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.name == other.name
            && self.tablet == other.tablet
            && self.target == other.target
            && self.up == other.up
            && self.serving == other.serving
            && self.primary_ts == other.primary_ts
            && self.replication_lag_sec == other.replication_lag_sec
            && self.last_error.as_deref() == other.last_error.as_deref()
    }
}

impl TabletStats {
    /// Sort key used by `CacheStatus`: `Name`, falling back to `Key` when
    /// empty.
    pub fn sort_key(&self) -> &str {
        if self.name.is_empty() {
            &self.key
        } else {
            &self.name
        }
    }
}
