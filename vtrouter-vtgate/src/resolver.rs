//! Translates high-level routing hints (keyspace-ids, key-ranges, entity-ids)
//! into a sorted list of [`ResolvedShard`]s pointing at currently serving
//! tablets. Mirrors vitess's `vtgate/resolver.go` and `srvtopo`'s
//! shard-resolution helpers.

use std::sync::Arc;

use itertools::Itertools;
use rand::seq::IteratorRandom;

use vtrouter_client::{BindValue, KeyRange, QueryService, Role, Target};
use vtrouter_discovery::health_check::HealthCheck;
use vtrouter_discovery::stats_cache::TabletStatsCache;
use vtrouter_errors::{unavailable, RouterResult};
use vtrouter_topo::ResilientSrvTopoServer;

/// A shard plus a live connection handle to one of its currently healthy
/// tablets.
#[derive(Clone)]
pub struct ResolvedShard {
    pub keyspace: String,
    pub shard: String,
    pub target: Target,
    pub query_service: Arc<dyn QueryService>,
}

impl std::fmt::Debug for ResolvedShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedShard")
            .field("keyspace", &self.keyspace)
            .field("shard", &self.shard)
            .field("target", &self.target)
            .finish()
    }
}

/// Pointer-free, field-wise equality over `(keyspace, shard, target)`,
/// ignoring the connection handle — used to decide whether a resharding
/// retry should actually re-dispatch (the shard set changed) or surface the
/// original error (it didn't).
pub fn resolved_shards_equal(a: &[ResolvedShard], b: &[ResolvedShard]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).all(|(x, y)| x.keyspace == y.keyspace && x.shard == y.shard && x.target == y.target)
}

pub struct Resolver {
    cell: String,
    topo: Arc<ResilientSrvTopoServer>,
    health: Arc<HealthCheck>,
    stats_cache: Arc<TabletStatsCache>,
}

impl Resolver {
    pub fn new(cell: impl Into<String>, topo: Arc<ResilientSrvTopoServer>, health: Arc<HealthCheck>, stats_cache: Arc<TabletStatsCache>) -> Self {
        Self {
            cell: cell.into(),
            topo,
            health,
            stats_cache,
        }
    }

    async fn pick_tablet(&self, keyspace: &str, shard: &str, role: Role) -> RouterResult<Arc<dyn QueryService>> {
        let healthy = self.stats_cache.healthy(&self.cell, keyspace, shard, role);
        let mut rng = rand::rng();
        let candidate = healthy
            .into_iter()
            .filter_map(|stats| self.health.get_connection(&stats.key).map(|conn| (stats.key, conn)))
            .choose(&mut rng);
        match candidate {
            Some((_, conn)) => Ok(conn),
            None => Err(unavailable!("no healthy tablet serving {keyspace}/{shard}/{role}")),
        }
    }

    async fn resolved_shard(&self, keyspace: &str, shard: &str, role: Role) -> RouterResult<ResolvedShard> {
        let query_service = self.pick_tablet(keyspace, shard, role).await?;
        Ok(ResolvedShard {
            keyspace: keyspace.to_string(),
            shard: shard.to_string(),
            target: Target::new(keyspace, shard, role),
            query_service,
        })
    }

    /// For each keyspace-id, locates the shard whose `KeyRange` contains it
    /// via binary search, deduplicates, and returns a deterministically
    /// (shard-name) sorted list of resolved shards.
    pub async fn resolve_keyspace_ids(&self, keyspace: &str, role: Role, ids: &[Vec<u8>]) -> RouterResult<Vec<ResolvedShard>> {
        let srv_keyspace = self.topo.get_srv_keyspace(&self.cell, keyspace).await?;
        let mut shard_names = Vec::with_capacity(ids.len());
        for id in ids {
            let shard = srv_keyspace
                .shard_for_id(id)
                .ok_or_else(|| vtrouter_errors::internal!("keyspace id has no covering shard in keyspace {keyspace}"))?;
            shard_names.push(shard.name.clone());
        }
        let shard_names: Vec<String> = shard_names.into_iter().sorted().dedup().collect();
        self.resolve_shard_names(keyspace, role, &shard_names).await
    }

    /// Resolves every shard whose `KeyRange` intersects any of `ranges`.
    pub async fn resolve_key_ranges(&self, keyspace: &str, role: Role, ranges: &[KeyRange]) -> RouterResult<Vec<ResolvedShard>> {
        let srv_keyspace = self.topo.get_srv_keyspace(&self.cell, keyspace).await?;
        let shard_names: Vec<String> = ranges
            .iter()
            .flat_map(|range| srv_keyspace.shards_intersecting(range))
            .map(|shard| shard.name.clone())
            .sorted()
            .dedup()
            .collect();
        self.resolve_shard_names(keyspace, role, &shard_names).await
    }

    /// Resolves shards for a list of `(keyspace_id, entity_value)` pairs,
    /// returning the resolved shards alongside the per-shard partition of
    /// entity values (grouped by destination shard, input order preserved
    /// within each group).
    pub async fn resolve_entity_ids(
        &self,
        keyspace: &str,
        role: Role,
        entities: &[(Vec<u8>, BindValue)],
    ) -> RouterResult<(Vec<ResolvedShard>, Vec<Vec<BindValue>>)> {
        let srv_keyspace = self.topo.get_srv_keyspace(&self.cell, keyspace).await?;
        let mut shard_names: Vec<String> = Vec::new();
        let mut by_shard: std::collections::HashMap<String, Vec<BindValue>> = std::collections::HashMap::new();
        for (ksid, value) in entities {
            let shard = srv_keyspace
                .shard_for_id(ksid)
                .ok_or_else(|| vtrouter_errors::internal!("keyspace id has no covering shard in keyspace {keyspace}"))?;
            if !shard_names.contains(&shard.name) {
                shard_names.push(shard.name.clone());
            }
            by_shard.entry(shard.name.clone()).or_default().push(value.clone());
        }
        shard_names.sort();
        let resolved = self.resolve_shard_names(keyspace, role, &shard_names).await?;
        let values = resolved.iter().map(|rs| by_shard.remove(&rs.shard).unwrap_or_default()).collect();
        Ok((resolved, values))
    }

    async fn resolve_shard_names(&self, keyspace: &str, role: Role, shard_names: &[String]) -> RouterResult<Vec<ResolvedShard>> {
        let mut resolved = Vec::with_capacity(shard_names.len());
        for shard in shard_names {
            resolved.push(self.resolved_shard(keyspace, shard, role).await?);
        }
        Ok(resolved)
    }
}
