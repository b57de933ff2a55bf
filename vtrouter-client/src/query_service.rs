//! The physical per-tablet RPC client contract. The concrete wire
//! implementation is an external collaborator; this crate only defines the
//! trait the router and health-checker program against.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::bindvalue::BindVars;
use crate::stats::RealtimeStats;
use crate::tablet::{Target, TabletAlias};
use vtrouter_errors::RouterResult;

/// A query result: columns, rows, and write-path metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    /// One all-NULL row shaped like `fields`, used to synthesize LEFT JOIN
    /// padding when the right side returns no rows.
    pub fn null_row(field_count: usize) -> Vec<Option<Vec<u8>>> {
        vec![None; field_count]
    }
}

/// Health payload streamed by `StreamHealth`, emitted at roughly a fixed
/// cadence (≈20s) by a live tablet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamHealthResponse {
    pub target: Target,
    pub serving: bool,
    pub tablet_alias: TabletAlias,
    pub tablet_externally_reparented_timestamp: i64,
    pub realtime_stats: Option<RealtimeStats>,
}

/// The physical per-tablet RPC surface. Implementations own the transport;
/// the router and health-checker only ever see this trait.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn execute(&self, target: &Target, sql: &str, bind_vars: &BindVars, transaction_id: i64) -> RouterResult<QueryResult>;

    async fn begin(&self, target: &Target) -> RouterResult<i64>;

    async fn commit(&self, target: &Target, transaction_id: i64) -> RouterResult<()>;

    async fn rollback(&self, target: &Target, transaction_id: i64) -> RouterResult<()>;

    /// Drains the tablet's streaming health responses, invoking `callback`
    /// for each one. Returns (with an error) when the stream breaks.
    async fn stream_health(&self, callback: &mut (dyn FnMut(StreamHealthResponse) + Send)) -> RouterResult<()>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_row_matches_field_count() {
        assert_eq!(QueryResult::null_row(3), vec![None, None, None]);
    }
}
