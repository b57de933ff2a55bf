//! `ScatterConn`: fans a query out to one RPC per resolved shard in
//! parallel, merges results bottom-up, and enforces fail-fast cancellation
//! on the first irrecoverable error. Mirrors vitess's `vtgate/scatter_conn.go`.

use std::sync::Arc;

use futures::future::select_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::instrument;

use vtrouter_client::{BindVars, QueryResult, Role};
use vtrouter_errors::{internal, RouterResult};

use crate::resolver::ResolvedShard;
use crate::session::{Session, ShardSession};

/// Whether the caller explicitly opted out of auto-transacting a
/// single-shard call (`notInTransaction=true` in the wire protocol).
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    pub not_in_transaction: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self { not_in_transaction: false }
    }
}

pub struct ScatterConn;

impl Default for ScatterConn {
    fn default() -> Self {
        Self::new()
    }
}

impl ScatterConn {
    pub fn new() -> Self {
        Self
    }

    /// Executes `query` against every resolved shard in parallel and merges
    /// the results: rows concatenate in resolved-shard order (not reply
    /// arrival order), `rows_affected` sums, `insert_id` is the first
    /// non-zero, and `fields` must be structurally identical across shards
    /// that return any.
    #[instrument(skip_all, fields(shard_count = rss.len()))]
    pub async fn execute(
        &self,
        query: &str,
        bind_vars: &BindVars,
        rss: &[ResolvedShard],
        role: Role,
        session: &Session,
        options: ExecuteOptions,
    ) -> RouterResult<QueryResult> {
        if rss.is_empty() {
            return Ok(QueryResult::default());
        }

        let auto_begin = should_auto_begin(rss.len(), session, options);
        let mut handles: Vec<_> = rss
            .iter()
            .enumerate()
            .map(|(idx, rs)| {
                let rs = rs.clone();
                let query = query.to_string();
                let bind_vars = bind_vars.clone();
                let session = session.clone();
                tokio::spawn(async move { (idx, execute_one_shard(&rs, &query, &bind_vars, role, &session, auto_begin).await) })
            })
            .collect();

        // Results are written into their resolved-shard slot as each task
        // finishes, so merge order reflects resolved-shard order regardless
        // of reply arrival order.
        let mut slots: Vec<Option<QueryResult>> = (0..rss.len()).map(|_| None).collect();
        while !handles.is_empty() {
            let (outcome, _idx_in_vec, remaining) = select_all(handles).await;
            handles = remaining;
            let (shard_idx, result) = vtrouter_util::panic_guard::join_result_to_router_result(outcome)?;
            match result {
                Ok(result) => slots[shard_idx] = Some(result),
                Err(e) => {
                    // Fail-fast: cancel the remaining in-flight per-shard
                    // RPCs rather than waiting them out. Partial success
                    // never returns successfully ("no silent
                    // partial").
                    for handle in handles {
                        handle.abort();
                    }
                    return Err(e);
                }
            }
        }

        let results: Vec<QueryResult> = slots.into_iter().map(|s| s.expect("every shard slot is filled before loop exits")).collect();
        merge_results(results, rss)
    }

    /// Streaming variant: invokes `callback` once per shard's result.
    /// Ordering across shards is not guaranteed; ordering within a single
    /// shard's single response is trivially preserved since each shard
    /// produces exactly one chunk in this scatter model.
    pub async fn stream_execute(
        &self,
        query: &str,
        bind_vars: &BindVars,
        rss: &[ResolvedShard],
        role: Role,
        session: &Session,
        options: ExecuteOptions,
        mut callback: impl FnMut(QueryResult) + Send,
    ) -> RouterResult<()> {
        let auto_begin = should_auto_begin(rss.len(), session, options);
        let mut futs = FuturesUnordered::new();
        for rs in rss {
            let rs = rs.clone();
            let query = query.to_string();
            let bind_vars = bind_vars.clone();
            let session = session.clone();
            futs.push(async move { execute_one_shard(&rs, &query, &bind_vars, role, &session, auto_begin).await });
        }
        while let Some(outcome) = futs.next().await {
            callback(outcome?);
        }
        Ok(())
    }
}

fn should_auto_begin(shard_count: usize, session: &Session, options: ExecuteOptions) -> bool {
    if !session.in_transaction() {
        return false;
    }
    shard_count <= 1 || options.not_in_transaction
}

async fn execute_one_shard(
    rs: &ResolvedShard,
    query: &str,
    bind_vars: &BindVars,
    role: Role,
    session: &Session,
    auto_begin: bool,
) -> RouterResult<QueryResult> {
    let wrap = |e: vtrouter_errors::RouterError| e.wrap_shard(rs.keyspace.clone(), rs.shard.clone(), role.to_string());

    // A shard already transacting within this session must stay bound to
    // the connection its transaction was begun on — a re-resolve can hand
    // back a different randomly-picked tablet for the same shard, and
    // sending the old transaction_id there would be a protocol violation.
    if let Some(existing) = session.existing(&rs.target) {
        return existing.query_service.execute(&rs.target, query, bind_vars, existing.transaction_id).await.map_err(wrap);
    }

    let transaction_id = if auto_begin {
        let tx = rs.query_service.begin(&rs.target).await.map_err(wrap)?;
        session.record(ShardSession {
            target: rs.target.clone(),
            transaction_id: tx,
            query_service: rs.query_service.clone(),
        });
        tx
    } else {
        0
    };

    rs.query_service.execute(&rs.target, query, bind_vars, transaction_id).await.map_err(wrap)
}

/// Merges per-shard results in resolved-shard order. `fields` is taken from
/// the first non-empty response; all others must match structurally.
fn merge_results(results: Vec<QueryResult>, rss: &[ResolvedShard]) -> RouterResult<QueryResult> {
    let mut merged = QueryResult::default();
    for (i, result) in results.into_iter().enumerate() {
        if merged.fields.is_empty() {
            merged.fields = result.fields.clone();
        } else if !result.fields.is_empty() && result.fields != merged.fields {
            let rs = &rss[i];
            return Err(internal!("mismatched field metadata returned by {}/{}", rs.keyspace, rs.shard));
        }
        merged.rows.extend(result.rows);
        merged.rows_affected += result.rows_affected;
        if merged.insert_id == 0 {
            merged.insert_id = result.insert_id;
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use vtrouter_client::{StreamHealthResponse, Target};

    use super::*;
    use crate::session::CommitMode;

    struct FixedConn {
        result: QueryResult,
        fail: bool,
        execute_calls: AtomicUsize,
    }

    #[async_trait]
    impl vtrouter_client::QueryService for FixedConn {
        async fn execute(&self, _t: &Target, _s: &str, _b: &BindVars, _tx: i64) -> RouterResult<QueryResult> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(vtrouter_errors::transient_conn!("boom"))
            } else {
                Ok(self.result.clone())
            }
        }
        async fn begin(&self, _t: &Target) -> RouterResult<i64> {
            Ok(42)
        }
        async fn commit(&self, _t: &Target, _tx: i64) -> RouterResult<()> {
            Ok(())
        }
        async fn rollback(&self, _t: &Target, _tx: i64) -> RouterResult<()> {
            Ok(())
        }
        async fn stream_health(&self, _cb: &mut (dyn FnMut(StreamHealthResponse) + Send)) -> RouterResult<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn rs(shard: &str, result: QueryResult, fail: bool) -> ResolvedShard {
        ResolvedShard {
            keyspace: "ks".into(),
            shard: shard.into(),
            target: Target::new("ks", shard, Role::Replica),
            query_service: Arc::new(FixedConn {
                result,
                fail,
                execute_calls: AtomicUsize::new(0),
            }),
        }
    }

    fn rows_result(n: u64) -> QueryResult {
        QueryResult {
            fields: vec!["a".to_string()],
            rows: vec![vec![Some(vec![n as u8])]],
            rows_affected: n,
            insert_id: 0,
        }
    }

    #[tokio::test]
    async fn merges_rows_in_resolved_shard_order() {
        let rss = vec![rs("-80", rows_result(1), false), rs("80-", rows_result(2), false)];
        let session = Session::new(CommitMode::OnePc);
        let result = ScatterConn::new()
            .execute("select 1", &BindVars::new(), &rss, Role::Replica, &session, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows_affected, 3);
    }

    #[tokio::test]
    async fn one_shard_error_fails_the_whole_scatter() {
        let rss = vec![rs("-80", rows_result(1), true), rs("80-", rows_result(2), false)];
        let session = Session::new(CommitMode::OnePc);
        let err = ScatterConn::new()
            .execute("select 1", &BindVars::new(), &rss, Role::Replica, &session, ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ks/-80"));
    }

    #[tokio::test]
    async fn empty_shard_list_returns_empty_result() {
        let session = Session::new(CommitMode::OnePc);
        let result = ScatterConn::new()
            .execute("select 1", &BindVars::new(), &[], Role::Replica, &session, ExecuteOptions::default())
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 0);
    }

    #[tokio::test]
    async fn single_shard_transaction_auto_commits_without_explicit_begin_call() {
        let session = Session::new(CommitMode::OnePc);
        session.begin();
        let rss = vec![rs("-80", rows_result(1), false)];
        ScatterConn::new()
            .execute("select 1", &BindVars::new(), &rss, Role::Primary, &session, ExecuteOptions::default())
            .await
            .unwrap();
        // single-shard transactions auto-begin a transaction id and record it.
        assert_eq!(session.shard_count(), 1);
    }

    #[tokio::test]
    async fn transacting_shard_routes_through_the_session_bound_connection() {
        // A re-resolve can hand back a ResolvedShard pointing at a different
        // tablet than the one the transaction began on. The session-bound
        // connection must win, and the freshly resolved one must not be called.
        let target = Target::new("ks", "-80", Role::Primary);
        let original_conn = Arc::new(FixedConn {
            result: rows_result(1),
            fail: false,
            execute_calls: AtomicUsize::new(0),
        });
        let session = Session::new(CommitMode::OnePc);
        session.begin();
        session.record(ShardSession {
            target: target.clone(),
            transaction_id: 99,
            query_service: original_conn.clone() as Arc<dyn vtrouter_client::QueryService>,
        });

        let reresolved_conn = Arc::new(FixedConn {
            result: rows_result(1),
            fail: true,
            execute_calls: AtomicUsize::new(0),
        });
        let rs = ResolvedShard {
            keyspace: "ks".into(),
            shard: "-80".into(),
            target,
            query_service: reresolved_conn.clone() as Arc<dyn vtrouter_client::QueryService>,
        };

        let result = execute_one_shard(&rs, "select 1", &BindVars::new(), Role::Primary, &session, true).await.unwrap();

        assert_eq!(result.rows_affected, 1);
        assert_eq!(original_conn.execute_calls.load(Ordering::SeqCst), 1);
        assert_eq!(reresolved_conn.execute_calls.load(Ordering::SeqCst), 0);
    }
}
