//! Groups `TabletStats` by `(cell, keyspace, shard, role)` and filters a
//! group down to its replication-healthy subset, mirroring vitess's
//! replication-lag filter for a discovery tablet group.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;

use vtrouter_client::TabletStats;

use crate::health_check::StatsListener;
use crate::metrics;

/// Configuration for [`filter_by_replication_lag`].
#[derive(Debug, Clone, Copy)]
pub struct LagFilterConfig {
    /// Lag below which a tablet is considered "fresh" (§4.3 step 3).
    pub threshold: Duration,
    /// Minimum number of serving tablets to keep when possible.
    pub min_num_tablets: usize,
    /// A tablet whose lag exceeds the group's best lag by more than this
    /// factor is dropped, once the candidate set already satisfies
    /// `min_num_tablets` (§4.3 step 4).
    pub too_far_factor: u64,
}

impl Default for LagFilterConfig {
    fn default() -> Self {
        Self {
            threshold: Duration::from_secs(30),
            min_num_tablets: 2,
            too_far_factor: 70,
        }
    }
}

/// Filters the serving subset of a group down to a "healthy" subset, per the
/// five-step rule:
/// 1. input is the serving subset;
/// 2. if at most `min_num_tablets` serving tablets exist, skip straight to
///    step 4 with all of them as candidates;
/// 3. otherwise partition into fresh/stale by `threshold` and promote the
///    lowest-lag stale entries until `min_num_tablets` fresh-or-promoted
///    entries are available;
/// 4. trim the worst entry while its lag exceeds `too_far_factor` times the
///    best remaining lag, at most twice;
/// 5. if nothing survives, return the single lowest-lag entry.
///
/// Preserves the relative order of the input list.
pub fn filter_by_replication_lag(serving: &[TabletStats], config: LagFilterConfig) -> Vec<TabletStats> {
    if serving.is_empty() {
        return Vec::new();
    }

    let mut candidate_indices: Vec<usize> = if serving.len() <= config.min_num_tablets {
        (0..serving.len()).collect()
    } else {
        let mut fresh: Vec<usize> = Vec::new();
        let mut stale: Vec<usize> = Vec::new();
        for (i, ts) in serving.iter().enumerate() {
            if ts.replication_lag_sec <= config.threshold.as_secs() {
                fresh.push(i);
            } else {
                stale.push(i);
            }
        }
        if fresh.len() >= config.min_num_tablets {
            fresh
        } else {
            stale.sort_by_key(|&i| serving[i].replication_lag_sec);
            let need = config.min_num_tablets - fresh.len();
            fresh.extend(stale.into_iter().take(need));
            fresh
        }
    };

    for _ in 0..2 {
        if candidate_indices.len() <= 1 {
            break;
        }
        let best = candidate_indices.iter().map(|&i| serving[i].replication_lag_sec).min().unwrap_or(0).max(1);
        let (worst_pos, worst_lag) = candidate_indices
            .iter()
            .enumerate()
            .map(|(pos, &i)| (pos, serving[i].replication_lag_sec))
            .max_by_key(|&(_, lag)| lag)
            .unwrap();
        if worst_lag > best * config.too_far_factor {
            candidate_indices.remove(worst_pos);
        } else {
            break;
        }
    }

    if candidate_indices.is_empty() {
        let best_idx = (0..serving.len()).min_by_key(|&i| serving[i].replication_lag_sec).unwrap();
        return vec![serving[best_idx].clone()];
    }

    candidate_indices.sort_unstable();
    candidate_indices.into_iter().map(|i| serving[i].clone()).collect()
}

/// Decides whether a listener notification for a lag-only change can be
/// suppressed. Lags both below the threshold are trivially equal;
/// exactly one below is never trivial (a threshold crossing always
/// notifies); both above the threshold are trivial iff within ~10%.
pub fn trivial_stats_update(old_lag: Duration, new_lag: Duration, threshold: Duration) -> bool {
    let old_fresh = old_lag <= threshold;
    let new_fresh = new_lag <= threshold;
    match (old_fresh, new_fresh) {
        (true, true) => true,
        (false, false) => {
            let old = old_lag.as_secs_f64();
            let new = new_lag.as_secs_f64();
            // Denominator uses max(old, new) rather than old alone so the
            // relation is symmetric, per the TrivialStatsUpdate invariant.
            (old - new).abs() <= old.max(new) / 10.0
        }
        _ => false,
    }
}

/// Enforces the invariant that at most one tablet in a `(keyspace,
/// shard, PRIMARY)` group may be `Serving` at a time. If two or more are
/// observed serving, the one with the greatest `primary_ts` wins and every
/// other is forced non-serving in the cached view, with a synthesized
/// `last_error` explaining why. `list` must already be a single
/// `(keyspace, shard, PRIMARY)` group.
fn enforce_single_serving_primary(list: &mut [TabletStats]) {
    let mut serving_indices: Vec<usize> = list.iter().enumerate().filter(|(_, t)| t.up && t.serving).map(|(i, _)| i).collect();
    if serving_indices.len() <= 1 {
        return;
    }
    serving_indices.sort_by_key(|&i| list[i].primary_ts);
    let winner = *serving_indices.last().expect("len > 1 checked above");
    for &i in &serving_indices {
        if i != winner {
            list[i].serving = false;
            list[i].last_error = Some(format!(
                "forced non-serving: {} has a more recent primary_ts ({} > {})",
                list[winner].key, list[winner].primary_ts, list[i].primary_ts
            ));
        }
    }
}

/// Maintains the `(cell, keyspace, shard, role) → TabletStats` grouping fed
/// by `HealthCheck`'s listener callback, exposing the replication-lag
/// filtered "healthy" view per group.
pub struct TabletStatsCache {
    config: LagFilterConfig,
    groups: RwLock<HashMap<String, Vec<TabletStats>>>,
}

impl TabletStatsCache {
    pub fn new(config: LagFilterConfig) -> Self {
        Self {
            config,
            groups: RwLock::new(HashMap::new()),
        }
    }

    fn group_key(cell: &str, stats: &TabletStats) -> String {
        stats.target.group_key(cell)
    }

    /// All tablets currently known for a group, in `Name`/key sort order.
    pub fn group(&self, cell: &str, keyspace: &str, shard: &str, role: vtrouter_client::Role) -> Vec<TabletStats> {
        let key = format!("{cell}.{keyspace}.{shard}.{role}");
        self.groups.read().get(&key).cloned().unwrap_or_default()
    }

    /// The replication-lag filtered healthy subset of a group.
    pub fn healthy(&self, cell: &str, keyspace: &str, shard: &str, role: vtrouter_client::Role) -> Vec<TabletStats> {
        let all = self.group(cell, keyspace, shard, role);
        let serving: Vec<TabletStats> = all.into_iter().filter(|t| t.up && t.serving).collect();
        filter_by_replication_lag(&serving, self.config)
    }

    fn upsert(&self, cell: &str, stats: TabletStats) {
        let key = Self::group_key(cell, &stats);
        let target = stats.target.clone();
        let mut groups = self.groups.write();
        let list = groups.entry(key).or_default();
        if let Some(existing) = list.iter_mut().find(|t| t.key == stats.key) {
            *existing = stats;
        } else {
            list.push(stats);
        }
        for l in groups.values_mut() {
            l.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        }
        if target.role == vtrouter_client::Role::Primary {
            if let Some(list) = groups.get_mut(&target.group_key(cell)) {
                enforce_single_serving_primary(list);
            }
        }
        let serving_count = groups.get(&target.group_key(cell)).map_or(0, |l| l.iter().filter(|t| t.up && t.serving).count());
        metrics::record_serving_connections(&target, serving_count as i64);
    }

    fn remove(&self, cell: &str, stats: &TabletStats) {
        let key = Self::group_key(cell, stats);
        let mut groups = self.groups.write();
        if let Some(list) = groups.get_mut(&key) {
            list.retain(|t| t.key != stats.key);
            let count = list.iter().filter(|t| t.up && t.serving).count();
            metrics::record_serving_connections(&stats.target, count as i64);
        }
    }
}

/// Bridges `HealthCheck`'s listener callback into a `TabletStatsCache`.
pub struct TabletStatsCacheListener {
    cell: String,
    cache: std::sync::Arc<TabletStatsCache>,
}

impl TabletStatsCacheListener {
    pub fn new(cell: impl Into<String>, cache: std::sync::Arc<TabletStatsCache>) -> Self {
        Self { cell: cell.into(), cache }
    }
}

impl StatsListener for TabletStatsCacheListener {
    fn stats_update(&self, stats: &TabletStats) {
        if stats.up {
            self.cache.upsert(&self.cell, stats.clone());
        } else {
            self.cache.remove(&self.cell, stats);
        }
    }
}
