//! Router-wide flags, `clap`-derived as one flat struct with `long` + `env`
//! on every field and documented defaults.

use std::time::Duration;

use clap::Parser;

fn parse_duration_secs(s: &str) -> Result<Duration, std::num::ParseIntError> {
    s.parse::<u64>().map(Duration::from_secs)
}

#[derive(Debug, Clone, Parser)]
pub struct RouterConfig {
    /// TTL for a `ResilientSrvTopoServer` cache entry before a refresh is
    /// attempted.
    #[arg(long, env = "SRV_TOPO_CACHE_TTL", default_value = "1", value_parser = parse_duration_secs)]
    pub srv_topo_cache_ttl: Duration,

    /// Base delay before a failed per-tablet probe redials, doubling on each
    /// consecutive failure.
    #[arg(long, env = "HEALTHCHECK_RETRY_DELAY", default_value = "5", value_parser = parse_duration_secs)]
    pub healthcheck_retry_delay: Duration,

    /// How long a `Serving` tablet may go without a health response before
    /// the timeout watcher forces it non-serving.
    #[arg(long, env = "HEALTHCHECK_TIMEOUT", default_value = "60", value_parser = parse_duration_secs)]
    pub healthcheck_timeout: Duration,

    /// Template used by the (external) tablet dialer to build a connect
    /// address from a `Tablet`'s hostname/port-map. Carried through
    /// unevaluated; the physical RPC client owns template expansion.
    #[arg(long, env = "TABLET_URL_TEMPLATE")]
    pub tablet_url_template: Option<String>,

    /// Minimum number of serving tablets the replication-lag filter tries to
    /// keep per group before it will promote stale entries.
    #[arg(long, env = "MIN_NUMBER_SERVING_VTTABLETS", default_value = "2")]
    pub min_number_serving_vttablets: usize,

    /// Lag above which a tablet is excluded by the replication-lag filter
    /// (and by the topology cache's endpoint post-filter), unless excluding
    /// it would empty the candidate set.
    #[arg(long, env = "REPLICATION_LAG_THRESHOLD", default_value = "30", value_parser = parse_duration_secs)]
    pub replication_lag_threshold: Duration,

    /// Factor by which a candidate's lag may exceed the group's best lag
    /// before the lag filter trims it.
    #[arg(long, env = "REPLICATION_LAG_TOO_FAR_FACTOR", default_value = "70")]
    pub replication_lag_too_far_factor: u64,

    /// Address the `/debug/gateway` and `/debug/tablet_vschema` JSON status
    /// endpoints listen on.
    #[arg(long, env = "DEBUG_ADDRESS", default_value = "0.0.0.0:15000")]
    pub debug_address: std::net::SocketAddr,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            srv_topo_cache_ttl: Duration::from_secs(1),
            healthcheck_retry_delay: Duration::from_secs(5),
            healthcheck_timeout: Duration::from_secs(60),
            tablet_url_template: None,
            min_number_serving_vttablets: 2,
            replication_lag_threshold: Duration::from_secs(30),
            replication_lag_too_far_factor: 70,
            debug_address: "0.0.0.0:15000".parse().unwrap(),
        }
    }
}

impl RouterConfig {
    pub fn health_check_config(&self) -> vtrouter_discovery::HealthCheckConfig {
        vtrouter_discovery::HealthCheckConfig {
            conn_timeout: self.healthcheck_retry_delay,
            retry_delay: self.healthcheck_retry_delay,
            healthcheck_timeout: self.healthcheck_timeout,
        }
    }

    pub fn lag_filter_config(&self) -> vtrouter_discovery::LagFilterConfig {
        vtrouter_discovery::LagFilterConfig {
            threshold: self.replication_lag_threshold,
            min_num_tablets: self.min_number_serving_vttablets,
            too_far_factor: self.replication_lag_too_far_factor,
        }
    }

    pub fn resilient_topo_config(&self) -> vtrouter_topo::ResilientConfig {
        vtrouter_topo::ResilientConfig {
            cache_ttl: self.srv_topo_cache_ttl,
            lag_threshold: self.replication_lag_threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_flag_values() {
        let cfg = RouterConfig::default();
        assert_eq!(cfg.srv_topo_cache_ttl, Duration::from_secs(1));
        assert_eq!(cfg.healthcheck_timeout, Duration::from_secs(60));
        assert_eq!(cfg.min_number_serving_vttablets, 2);
        assert_eq!(cfg.replication_lag_too_far_factor, 70);
    }

    #[test]
    fn parses_from_args() {
        let cfg = RouterConfig::parse_from([
            "vtrouter-vtgate",
            "--srv-topo-cache-ttl",
            "2",
            "--min-number-serving-vttablets",
            "3",
        ]);
        assert_eq!(cfg.srv_topo_cache_ttl, Duration::from_secs(2));
        assert_eq!(cfg.min_number_serving_vttablets, 3);
    }
}
