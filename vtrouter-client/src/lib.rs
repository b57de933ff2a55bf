//! Shared data types for the query router: tablet identity, topology shapes,
//! health snapshots, typed bind variables, the plan tree, and the physical
//! per-tablet RPC contract.

pub mod bindvalue;
pub mod plan;
pub mod query_service;
pub mod stats;
pub mod tablet;
pub mod topo;

pub use bindvalue::{BindValue, BindVars};
pub use plan::{JoinCol, JoinPlan, Plan, PlanId, RoutePlan};
pub use query_service::{QueryResult, QueryService, StreamHealthResponse};
pub use stats::{RealtimeStats, TabletStats};
pub use tablet::{Role, Tablet, TabletAlias, Target};
pub use topo::{KeyRange, ShardReference, SrvKeyspace};
