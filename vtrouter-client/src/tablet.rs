//! Tablet identity and target types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A tablet's serving role, mirroring the wire protocol's `TabletType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Replica,
    Rdonly,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Primary => "PRIMARY",
            Role::Replica => "REPLICA",
            Role::Rdonly => "RDONLY",
        };
        f.write_str(s)
    }
}

/// `(keyspace, shard, role)` addressing a tablet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub role: Role,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, role: Role) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            role,
        }
    }

    /// `(cell,keyspace,shard,role)` style group key used by the stats cache
    /// and `CacheStatus` sort.
    pub fn group_key(&self, cell: &str) -> String {
        format!("{cell}.{}.{}.{}", self.keyspace, self.shard, self.role)
    }
}

/// Stable identifier for a tablet: cell + numeric uid. Tablets are
/// immutable-by-identity; only their declared `Target` and serving state
/// mutate via health updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.cell, self.uid)
    }
}

/// A logical backend database server: identity, hostname, named ports, and
/// the currently-declared target. The map key used by `HealthCheck` is the
/// sorted `hostname,name:port,...` string built by [`Tablet::map_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tablet {
    pub alias: TabletAlias,
    pub hostname: String,
    pub port_map: BTreeMap<String, u16>,
    pub target: Target,
}

impl Tablet {
    pub fn new(alias: TabletAlias, hostname: impl Into<String>, port_map: BTreeMap<String, u16>, target: Target) -> Self {
        Self {
            alias,
            hostname: hostname.into(),
            port_map,
            target,
        }
    }

    pub fn map_key(&self) -> String {
        vtrouter_util::tablet_map_key(&self.hostname, self.port_map.iter().map(|(k, v)| (k.as_str(), *v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tablet(hostname: &str) -> Tablet {
        let mut ports = BTreeMap::new();
        ports.insert("vt".to_string(), 15001);
        ports.insert("grpc".to_string(), 15991);
        Tablet::new(
            TabletAlias {
                cell: "cell1".into(),
                uid: 1,
            },
            hostname,
            ports,
            Target::new("ks", "80-", Role::Replica),
        )
    }

    #[test]
    fn map_key_is_deterministic() {
        let t = tablet("host1");
        assert_eq!(t.map_key(), "host1,grpc:15991,vt:15001");
    }

    #[test]
    fn group_key_orders_by_cell_keyspace_shard_role() {
        let target = Target::new("ks", "80-", Role::Primary);
        assert_eq!(target.group_key("cell1"), "cell1.ks.80-.PRIMARY");
    }
}
