//! `ResilientSrvTopoServer`: a TTL-bounded, single-flight cache over an
//! underlying topology store, returning last-known values under failure.
//! Mirrors vitess's resilient server wrapping `srvtopo`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use vtrouter_client::{Role, SrvKeyspace, Tablet};
use vtrouter_errors::RouterResult;

use crate::cache::SingleFlightCache;

/// A tablet as returned by the topology store's endpoint listing, carrying
/// just enough health context (its last-known replication lag) for the
/// post-fetch filtering step. The store itself does not probe tablets; this
/// lag is whatever it last observed out of band (e.g. from a sidecar
/// health-check write), used only to decide what to prefer when several
/// equally-correct serving endpoints exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndPoint {
    pub tablet: Tablet,
    pub replication_lag_sec: u64,
}

/// The three read operations the resilient cache wraps. May block, fail, or
/// return stale data; the underlying implementation is an external
/// collaborator (the authoritative topology store).
#[async_trait]
pub trait TopoServer: Send + Sync {
    async fn get_srv_keyspace_names(&self, cell: &str) -> RouterResult<Vec<String>>;
    async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> RouterResult<SrvKeyspace>;
    async fn get_end_points(&self, cell: &str, keyspace: &str, shard: &str, role: Role) -> RouterResult<Vec<EndPoint>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ResilientConfig {
    pub cache_ttl: Duration,
    /// Endpoints reporting a lag above this are removed by post-fetch
    /// filtering, unless doing so would remove every endpoint.
    pub lag_threshold: Duration,
}

impl Default for ResilientConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(1),
            lag_threshold: Duration::from_secs(30),
        }
    }
}

/// Filters out endpoints whose reported lag exceeds `threshold`, unless that
/// would remove every endpoint ("better stale than empty").
pub fn filter_unhealthy_endpoints(endpoints: Vec<EndPoint>, threshold: Duration) -> Vec<EndPoint> {
    let filtered: Vec<EndPoint> = endpoints
        .iter()
        .filter(|e| e.replication_lag_sec <= threshold.as_secs())
        .cloned()
        .collect();
    if filtered.is_empty() {
        endpoints
    } else {
        filtered
    }
}

/// Wraps a `TopoServer` with per-operation single-flight TTL caches and
/// endpoint health filtering.
pub struct ResilientSrvTopoServer {
    inner: std::sync::Arc<dyn TopoServer>,
    config: ResilientConfig,
    keyspace_names: SingleFlightCache<String, Vec<String>>,
    srv_keyspace: SingleFlightCache<(String, String), SrvKeyspace>,
    end_points: SingleFlightCache<(String, String, String, Role), Vec<EndPoint>>,
}

impl ResilientSrvTopoServer {
    pub fn new(inner: std::sync::Arc<dyn TopoServer>, config: ResilientConfig) -> Self {
        Self {
            inner,
            config,
            keyspace_names: SingleFlightCache::new(config.cache_ttl),
            srv_keyspace: SingleFlightCache::new(config.cache_ttl),
            end_points: SingleFlightCache::new(config.cache_ttl),
        }
    }

    #[instrument(skip(self), fields(cell))]
    pub async fn get_srv_keyspace_names(&self, cell: &str) -> RouterResult<Vec<String>> {
        let inner = self.inner.clone();
        let cell_owned = cell.to_string();
        self.keyspace_names
            .get_or_fetch(cell.to_string(), "srv_keyspace_names", move || async move { inner.get_srv_keyspace_names(&cell_owned).await })
            .await
    }

    #[instrument(skip(self), fields(cell, keyspace))]
    pub async fn get_srv_keyspace(&self, cell: &str, keyspace: &str) -> RouterResult<SrvKeyspace> {
        let inner = self.inner.clone();
        let cell_owned = cell.to_string();
        let ks_owned = keyspace.to_string();
        self.srv_keyspace
            .get_or_fetch((cell.to_string(), keyspace.to_string()), "srv_keyspace", move || async move {
                inner.get_srv_keyspace(&cell_owned, &ks_owned).await
            })
            .await
    }

    #[instrument(skip(self), fields(cell, keyspace, shard, role = %role))]
    pub async fn get_end_points(&self, cell: &str, keyspace: &str, shard: &str, role: Role) -> RouterResult<Vec<EndPoint>> {
        let inner = self.inner.clone();
        let cell_owned = cell.to_string();
        let ks_owned = keyspace.to_string();
        let shard_owned = shard.to_string();
        let raw = self
            .end_points
            .get_or_fetch(
                (cell.to_string(), keyspace.to_string(), shard.to_string(), role),
                "end_points",
                move || async move { inner.get_end_points(&cell_owned, &ks_owned, &shard_owned, role).await },
            )
            .await?;
        Ok(filter_unhealthy_endpoints(raw, self.config.lag_threshold))
    }
}
