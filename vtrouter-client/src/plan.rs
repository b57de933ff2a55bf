//! The tagged plan tree consumed by the router. Built by an external,
//! excluded planner; the router only ever evaluates it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::bindvalue::BindValue;

/// The closed set of route shapes a `Route` leaf can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanId {
    UnshardedSelect,
    SelectEqual,
    SelectIn,
    SelectScatter,
    UpdateEqual,
    DeleteEqual,
    InsertSharded,
}

impl PlanId {
    pub fn is_dml(&self) -> bool {
        matches!(self, PlanId::UpdateEqual | PlanId::DeleteEqual | PlanId::InsertSharded)
    }
}

/// A leaf that dispatches to the resolver/scatter engine for one keyspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePlan {
    pub plan_id: PlanId,
    pub keyspace: String,
    pub query: String,
    pub field_query: String,
    pub vindex_column: Option<String>,
    pub values: Vec<BindValue>,
    pub join_vars: Vec<String>,
    pub is_dml: bool,
}

/// Maps a join row's output column to either the left or right child row.
/// Negative (`< 0`) takes column `-i-1` from the left row; non-negative
/// takes column `i-1` from the right row — reproduced from the original's
/// signed-index convention so the merge step needs no extra tag type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinCol(pub i32);

impl JoinCol {
    pub fn from_left(idx: usize) -> Self {
        JoinCol(-(idx as i32) - 1)
    }

    pub fn from_right(idx: usize) -> Self {
        JoinCol((idx as i32) + 1)
    }

    pub fn is_left(&self) -> bool {
        self.0 < 0
    }

    /// The zero-based index into the side indicated by `is_left`.
    pub fn index(&self) -> usize {
        if self.is_left() {
            (-self.0 - 1) as usize
        } else {
            (self.0 - 1) as usize
        }
    }
}

/// A nested-loop join of two child plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinPlan {
    pub left: Box<Plan>,
    pub right: Box<Plan>,
    pub cols: Vec<JoinCol>,
    pub is_left: bool,
    /// Maps a bind-variable name to the column index in the left row it is
    /// populated from, before evaluating the right branch.
    pub vars: HashMap<String, usize>,
}

/// The two-case plan tree: a `Route` leaf or a `Join` of two plans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Plan {
    Route(RoutePlan),
    Join(JoinPlan),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_col_round_trips_left_and_right() {
        let l = JoinCol::from_left(2);
        assert!(l.is_left());
        assert_eq!(l.index(), 2);

        let r = JoinCol::from_right(3);
        assert!(!r.is_left());
        assert_eq!(r.index(), 3);
    }

    #[test]
    fn plan_id_is_dml_classification() {
        assert!(PlanId::InsertSharded.is_dml());
        assert!(!PlanId::SelectScatter.is_dml());
    }
}
