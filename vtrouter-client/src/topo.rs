//! Topology data model: key ranges and the served-shard view of a keyspace.

use serde::{Deserialize, Serialize};

/// `[start, end)` over fixed-width big-endian bytes. Empty bounds mean
/// unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    pub fn full() -> Self {
        Self {
            start: Vec::new(),
            end: Vec::new(),
        }
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        let after_start = self.start.is_empty() || id >= self.start.as_slice();
        let before_end = self.end.is_empty() || id < self.end.as_slice();
        after_start && before_end
    }

    /// Whether `self` and `other` share any keyspace-id.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let self_after_other_start = other.start.is_empty() || self.end.is_empty() || self.end.as_slice() > other.start.as_slice();
        let self_before_other_end = other.end.is_empty() || self.start.is_empty() || self.start.as_slice() < other.end.as_slice();
        self_after_other_start && self_before_other_end
    }
}

/// A single shard within a keyspace's serving graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardReference {
    pub name: String,
    pub key_range: KeyRange,
}

/// Authoritative map from a logical keyspace to its shard list. The shard
/// list's key ranges are expected to cover the full key space with no
/// overlaps; callers that build one out of band should maintain that
/// invariant themselves, this type does not enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrvKeyspace {
    pub keyspace: String,
    /// Sorted by `key_range.start` so resolution can binary search.
    pub shards: Vec<ShardReference>,
}

impl SrvKeyspace {
    pub fn new(keyspace: impl Into<String>, mut shards: Vec<ShardReference>) -> Self {
        shards.sort_by(|a, b| a.key_range.start.cmp(&b.key_range.start));
        Self {
            keyspace: keyspace.into(),
            shards,
        }
    }

    /// Binary search for the shard whose `KeyRange` contains `id`. An empty
    /// `start` sorts first and represents the unbounded lower end, so it
    /// must count as `<= id` for every `id` — otherwise the partition
    /// predicate is non-monotonic and `partition_point` misbehaves.
    pub fn shard_for_id(&self, id: &[u8]) -> Option<&ShardReference> {
        let idx = self.shards.partition_point(|s| s.key_range.start.is_empty() || s.key_range.start.as_slice() <= id);
        let candidate_idx = idx.checked_sub(1)?;
        let shard = self.shards.get(candidate_idx)?;
        if shard.key_range.contains(id) {
            Some(shard)
        } else {
            None
        }
    }

    pub fn shards_intersecting(&self, range: &KeyRange) -> impl Iterator<Item = &ShardReference> {
        self.shards.iter().filter(move |s| s.key_range.intersects(range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ks() -> SrvKeyspace {
        SrvKeyspace::new(
            "ks",
            vec![
                ShardReference {
                    name: "-80".into(),
                    key_range: KeyRange {
                        start: vec![],
                        end: vec![0x80],
                    },
                },
                ShardReference {
                    name: "80-".into(),
                    key_range: KeyRange {
                        start: vec![0x80],
                        end: vec![],
                    },
                },
            ],
        )
    }

    #[test]
    fn shard_for_id_binary_searches_sorted_ranges() {
        let ks = ks();
        assert_eq!(ks.shard_for_id(&[0x10]).unwrap().name, "-80");
        assert_eq!(ks.shard_for_id(&[0x80]).unwrap().name, "80-");
        assert_eq!(ks.shard_for_id(&[0xff]).unwrap().name, "80-");
    }

    #[test]
    fn full_key_range_contains_everything() {
        let kr = KeyRange::full();
        assert!(kr.contains(&[0x00]));
        assert!(kr.contains(&[0xff, 0xff]));
    }

    #[test]
    fn shards_intersecting_range() {
        let ks = ks();
        let matches: Vec<_> = ks
            .shards_intersecting(&KeyRange {
                start: vec![0x40],
                end: vec![0xa0],
            })
            .map(|s| s.name.clone())
            .collect();
        assert_eq!(matches, vec!["-80".to_string(), "80-".to_string()]);
    }
}
