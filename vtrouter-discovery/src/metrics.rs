//! Metric names emitted by the health-check engine, mirroring
//! `healthcheck.go`'s `hcErrorCounters`/`servingConnStats`.

use vtrouter_client::Target;

pub fn record_healthcheck_error(target: &Target) {
    metrics::counter!(
        "vtrouter_healthcheck_errors_total",
        "keyspace" => target.keyspace.clone(),
        "shard" => target.shard.clone(),
        "role" => target.role.to_string(),
    )
    .increment(1);
}

pub fn record_promotion(target: &Target) {
    metrics::counter!(
        "vtrouter_promotions_total",
        "keyspace" => target.keyspace.clone(),
        "shard" => target.shard.clone(),
    )
    .increment(1);
}

pub fn record_serving_connections(target: &Target, count: i64) {
    metrics::gauge!(
        "vtrouter_healthcheck_connections",
        "keyspace" => target.keyspace.clone(),
        "shard" => target.shard.clone(),
        "role" => target.role.to_string(),
    )
    .set(count as f64);
}
