//! Per-cache-key fetch counters, mirroring `srv_topo_server.go`'s
//! `queryCategory`/`cachedCategory`/`errorCategory` stats.

pub fn record_query(operation: &str) {
    metrics::counter!("vtrouter_topo_cache_fetches_total", "operation" => operation.to_string(), "outcome" => "query").increment(1);
}

pub fn record_cached(operation: &str) {
    metrics::counter!("vtrouter_topo_cache_fetches_total", "operation" => operation.to_string(), "outcome" => "cached").increment(1);
}

pub fn record_error(operation: &str) {
    metrics::counter!("vtrouter_topo_cache_fetches_total", "operation" => operation.to_string(), "outcome" => "error").increment(1);
}
