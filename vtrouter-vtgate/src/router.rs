//! Evaluates a [`Plan`] tree against live shard resolution: dispatches
//! `Route` leaves through the resolver and `ScatterConn`, evaluates `Join`
//! nodes as a nested-loop join, and retries once on a classified resharding
//! error. Mirrors vitess's `router.go`'s `execInstruction`/`execRoute`/
//! `execJoin`.

use std::collections::HashMap;

use futures::future::BoxFuture;
use vtrouter_client::{BindValue, BindVars, JoinCol, JoinPlan, KeyRange, Plan, PlanId, QueryResult, Role, RoutePlan};
use vtrouter_errors::{invalid_argument, RouterResult};

use crate::resolver::{resolved_shards_equal, ResolvedShard, Resolver};
use crate::scatter::{ExecuteOptions, ScatterConn};
use crate::session::Session;

/// Per-request evaluation state threaded down through the plan tree. Cloned
/// (not shared by `&mut`) on the way into a join's right branch, so
/// concurrently-evaluated sibling branches never observe each other's
/// bindings, unlike the original's mutable save/restore of `JoinVars`.
#[derive(Clone)]
pub struct ExecContext {
    pub bind_vars: BindVars,
    pub role: Role,
    pub session: Session,
    pub options: ExecuteOptions,
}

impl ExecContext {
    pub fn new(bind_vars: BindVars, role: Role, session: Session) -> Self {
        Self {
            bind_vars,
            role,
            session,
            options: ExecuteOptions::default(),
        }
    }
}

pub struct Router {
    resolver: std::sync::Arc<Resolver>,
    scatter: ScatterConn,
}

impl Router {
    pub fn new(resolver: std::sync::Arc<Resolver>) -> Self {
        Self {
            resolver,
            scatter: ScatterConn::new(),
        }
    }

    /// Dispatches on the two-case plan tree, exactly as `execInstruction`'s
    /// switch on node kind. Boxed because `Join` evaluation recurses into
    /// this same method for both children.
    pub fn exec_instruction<'a>(&'a self, plan: &'a Plan, ctx: &'a ExecContext) -> BoxFuture<'a, RouterResult<QueryResult>> {
        Box::pin(async move {
            match plan {
                Plan::Route(route) => self.exec_route(route, ctx).await,
                Plan::Join(join) => self.exec_join(join, ctx).await,
            }
        })
    }

    async fn exec_route(&self, route: &RoutePlan, ctx: &ExecContext) -> RouterResult<QueryResult> {
        let rss = self.resolve(route, ctx.role).await?;
        reject_multi_shard_dml(route, &rss)?;
        let query = query_for_shard(route, &rss);

        match self.dispatch(&query, &rss, ctx).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_resharding() => {
                // Retry budget: exactly one re-resolve. If the shard set did
                // not change, the stale-topology condition isn't transient
                // from this request's point of view — surface the original
                // error unwrapped of the retry layer.
                let rss2 = self.resolve(route, ctx.role).await?;
                if resolved_shards_equal(&rss, &rss2) {
                    return Err(e);
                }
                reject_multi_shard_dml(route, &rss2)?;
                let query2 = query_for_shard(route, &rss2);
                self.dispatch(&query2, &rss2, ctx).await
            }
            Err(e) => Err(e),
        }
    }

    async fn dispatch(&self, query: &str, rss: &[ResolvedShard], ctx: &ExecContext) -> RouterResult<QueryResult> {
        self.scatter.execute(query, &ctx.bind_vars, rss, ctx.role, &ctx.session, ctx.options).await
    }

    async fn resolve(&self, route: &RoutePlan, role: Role) -> RouterResult<Vec<ResolvedShard>> {
        match route.plan_id {
            PlanId::UnshardedSelect | PlanId::SelectScatter => self.resolver.resolve_key_ranges(&route.keyspace, role, &[KeyRange::full()]).await,
            PlanId::SelectEqual | PlanId::SelectIn | PlanId::UpdateEqual | PlanId::DeleteEqual | PlanId::InsertSharded => {
                let ids = keyspace_ids(&route.values)?;
                self.resolver.resolve_keyspace_ids(&route.keyspace, role, &ids).await
            }
        }
    }

    async fn exec_join(&self, join: &JoinPlan, ctx: &ExecContext) -> RouterResult<QueryResult> {
        let left = self.exec_instruction(&join.left, ctx).await?;

        if left.rows.is_empty() {
            // Still evaluate the right branch once, with NULL bindings, so
            // field metadata is obtained even though no output row exists.
            let probe_ctx = bind_join_vars(ctx, &join.vars, None);
            let right = self.exec_instruction(&join.right, &probe_ctx).await?;
            return Ok(QueryResult {
                fields: join_fields(&join.cols, &left.fields, &right.fields),
                rows: Vec::new(),
                rows_affected: left.rows_affected,
                insert_id: left.insert_id,
            });
        }

        let mut fields: Option<Vec<String>> = None;
        let mut rows = Vec::new();
        let mut rows_affected = left.rows_affected;
        let mut insert_id = left.insert_id;

        for left_row in &left.rows {
            let branch_ctx = bind_join_vars(ctx, &join.vars, Some(left_row));
            let right = self.exec_instruction(&join.right, &branch_ctx).await?;
            if fields.is_none() {
                fields = Some(join_fields(&join.cols, &left.fields, &right.fields));
            }
            rows_affected += right.rows_affected;
            if insert_id == 0 {
                insert_id = right.insert_id;
            }

            if right.rows.is_empty() {
                if join.is_left {
                    let null_right = QueryResult::null_row(right.fields.len());
                    rows.push(join_row(&join.cols, left_row, &null_right));
                }
                // Inner join: a left row with no right match contributes no
                // output row.
            } else {
                for right_row in &right.rows {
                    rows.push(join_row(&join.cols, left_row, right_row));
                }
            }
        }

        Ok(QueryResult {
            fields: fields.unwrap_or_default(),
            rows,
            rows_affected,
            insert_id,
        })
    }
}

/// DML spanning more than one resolved shard is rejected before any RPC is
/// issued, unless the plan explicitly permits scatter DML — this router
/// does not model that opt-in, so every DML plan is single-shard-only.
fn reject_multi_shard_dml(route: &RoutePlan, rss: &[ResolvedShard]) -> RouterResult<()> {
    if route.plan_id.is_dml() && rss.len() > 1 {
        return Err(invalid_argument!(
            "DML plan for keyspace {} resolved to {} shards, scatter DML is not permitted",
            route.keyspace,
            rss.len()
        ));
    }
    Ok(())
}

/// Flattens `values` (one level of `Tuple` nesting, per `BindValue`'s
/// contract) into the keyspace-id byte strings the resolver expects.
fn keyspace_ids(values: &[BindValue]) -> RouterResult<Vec<Vec<u8>>> {
    let mut ids = Vec::with_capacity(values.len());
    for v in values {
        match v {
            BindValue::Bytes(b) => ids.push(b.clone()),
            BindValue::Tuple(items) => {
                for item in items {
                    match item {
                        BindValue::Bytes(b) => ids.push(b.clone()),
                        other => return Err(invalid_argument!("expected keyspace-id bytes in tuple, got {other:?}")),
                    }
                }
            }
            other => return Err(invalid_argument!("expected keyspace-id bytes, got {other:?}")),
        }
    }
    Ok(ids)
}

/// For `InsertSharded`, annotates the query with the target keyspace-id as a
/// trailing SQL comment so downstream binlog filtering can attribute writes,
/// matching `sqlannotation.AddKeyspaceID`. Every other plan shape dispatches
/// the query verbatim.
fn query_for_shard(route: &RoutePlan, rss: &[ResolvedShard]) -> String {
    if route.plan_id == PlanId::InsertSharded && rss.len() == 1 {
        if let Some(BindValue::Bytes(ksid)) = route.values.first() {
            return annotate_with_keyspace_id(&route.query, ksid);
        }
    }
    route.query.clone()
}

fn annotate_with_keyspace_id(sql: &str, ksid: &[u8]) -> String {
    let mut hex = String::with_capacity(ksid.len() * 2);
    for byte in ksid {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{sql} /* vtgate:: keyspace_id:{hex} */")
}

/// Binds `join.vars` into a fresh copy of `ctx`'s bind vars from a specific
/// left row (or `Null` for every var, when probing with no left row), never
/// mutating `ctx` itself.
fn bind_join_vars(ctx: &ExecContext, vars: &HashMap<String, usize>, left_row: Option<&[Option<Vec<u8>>]>) -> ExecContext {
    let mut next = ctx.clone();
    for (name, &col_idx) in vars {
        let value = match left_row {
            Some(row) => row.get(col_idx).cloned().flatten().map(BindValue::Bytes).unwrap_or(BindValue::Null),
            None => BindValue::Null,
        };
        next.bind_vars.insert(name.clone(), value);
    }
    next
}

fn join_fields(cols: &[JoinCol], left_fields: &[String], right_fields: &[String]) -> Vec<String> {
    cols.iter()
        .map(|c| {
            if c.is_left() {
                left_fields.get(c.index()).cloned().unwrap_or_default()
            } else {
                right_fields.get(c.index()).cloned().unwrap_or_default()
            }
        })
        .collect()
}

fn join_row(cols: &[JoinCol], left_row: &[Option<Vec<u8>>], right_row: &[Option<Vec<u8>>]) -> Vec<Option<Vec<u8>>> {
    cols.iter()
        .map(|c| {
            if c.is_left() {
                left_row.get(c.index()).cloned().flatten()
            } else {
                right_row.get(c.index()).cloned().flatten()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use vtrouter_client::{BindVars, QueryService, Role, ShardReference, SrvKeyspace, StreamHealthResponse, Tablet, TabletAlias, Target};
    use vtrouter_discovery::{HealthCheck, HealthCheckConfig, LagFilterConfig, TabletStatsCache, TabletStatsCacheListener};
    use vtrouter_errors::RouterResult as RR;
    use vtrouter_topo::{EndPoint, ResilientConfig, ResilientSrvTopoServer, TopoServer};

    use super::*;
    use crate::session::CommitMode;

    struct ShardConn {
        fail_with_resharding: bool,
    }

    #[async_trait]
    impl QueryService for ShardConn {
        async fn execute(&self, _t: &Target, sql: &str, _b: &BindVars, _tx: i64) -> RR<QueryResult> {
            if self.fail_with_resharding {
                return Err(vtrouter_errors::resharding!("shard map changed under you"));
            }
            Ok(QueryResult {
                fields: vec!["id".into()],
                rows: vec![vec![Some(sql.as_bytes().to_vec())]],
                rows_affected: 1,
                insert_id: 0,
            })
        }
        async fn begin(&self, _t: &Target) -> RR<i64> {
            Ok(1)
        }
        async fn commit(&self, _t: &Target, _tx: i64) -> RR<()> {
            Ok(())
        }
        async fn rollback(&self, _t: &Target, _tx: i64) -> RR<()> {
            Ok(())
        }
        async fn stream_health(&self, _cb: &mut (dyn FnMut(StreamHealthResponse) + Send)) -> RR<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
        async fn close(&self) {}
    }

    struct ReshardingDialer;

    #[async_trait]
    impl vtrouter_discovery::health_check::Dialer for ReshardingDialer {
        async fn dial(&self, tablet: &Tablet, _timeout: std::time::Duration) -> RR<Arc<dyn QueryService>> {
            Ok(Arc::new(ShardConn {
                fail_with_resharding: tablet.target.shard == "-80",
            }))
        }
    }

    /// First `get_srv_keyspace` call reports a single shard `-80`; every call
    /// after the first reports `80-` instead, modeling a reshard observed by
    /// a concurrent topology update.
    struct ReshardingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TopoServer for ReshardingStore {
        async fn get_srv_keyspace_names(&self, _cell: &str) -> RR<Vec<String>> {
            Ok(vec!["ks".to_string()])
        }

        async fn get_srv_keyspace(&self, _cell: &str, keyspace: &str) -> RR<SrvKeyspace> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let shard_name = if n == 0 { "-80" } else { "80-" };
            Ok(SrvKeyspace::new(
                keyspace,
                vec![ShardReference {
                    name: shard_name.to_string(),
                    key_range: KeyRange::full(),
                }],
            ))
        }

        async fn get_end_points(&self, cell: &str, keyspace: &str, shard: &str, role: Role) -> RR<Vec<EndPoint>> {
            Ok(vec![EndPoint {
                tablet: Tablet::new(TabletAlias { cell: cell.into(), uid: 1 }, format!("host-{shard}"), BTreeMap::new(), Target::new(keyspace, shard, role)),
                replication_lag_sec: 0,
            }])
        }
    }

    async fn router_with_both_shards_healthy() -> (Router, Arc<HealthCheck>) {
        let health = Arc::new(HealthCheck::new(Arc::new(ReshardingDialer), HealthCheckConfig::default()));
        let stats_cache = Arc::new(TabletStatsCache::new(LagFilterConfig::default()));
        health.set_listener(Arc::new(TabletStatsCacheListener::new("cell1", stats_cache.clone())), true);

        for shard in ["-80", "80-"] {
            health.add_tablet(
                Tablet::new(
                    TabletAlias {
                        cell: "cell1".into(),
                        uid: if shard == "-80" { 1 } else { 2 },
                    },
                    format!("host-{shard}"),
                    BTreeMap::new(),
                    Target::new("ks", shard, Role::Replica),
                ),
                format!("job-{shard}"),
            );
        }
        health.wait_for_initial_stats_updates().await;

        let store = Arc::new(ReshardingStore { calls: AtomicUsize::new(0) });
        let topo = Arc::new(ResilientSrvTopoServer::new(store, ResilientConfig::default()));
        let resolver = Arc::new(Resolver::new("cell1", topo, health.clone(), stats_cache));
        (Router::new(resolver), health)
    }

    fn equal_route(plan_id: PlanId) -> RoutePlan {
        RoutePlan {
            plan_id,
            keyspace: "ks".into(),
            query: "select 1".into(),
            field_query: "select 1".into(),
            vindex_column: None,
            values: vec![BindValue::Bytes(vec![0x42])],
            join_vars: vec![],
            is_dml: plan_id.is_dml(),
        }
    }

    #[tokio::test]
    async fn resharding_error_triggers_one_retry_against_new_shard() {
        let (router, health) = router_with_both_shards_healthy().await;
        let plan = Plan::Route(equal_route(PlanId::SelectEqual));
        let ctx = ExecContext::new(BindVars::new(), Role::Replica, Session::new(CommitMode::OnePc));
        let result = router.exec_instruction(&plan, &ctx).await.unwrap();
        assert_eq!(result.rows.len(), 1);
        health.close().await;
    }

    #[tokio::test]
    async fn dml_spanning_multiple_shards_is_rejected_before_any_rpc() {
        let (router, health) = router_with_both_shards_healthy().await;
        let mut route = equal_route(PlanId::UpdateEqual);
        route.values = vec![BindValue::Bytes(vec![0x01]), BindValue::Bytes(vec![0x02])];
        let plan = Plan::Route(route);
        let ctx = ExecContext::new(BindVars::new(), Role::Replica, Session::new(CommitMode::OnePc));
        let err = router.exec_instruction(&plan, &ctx).await.unwrap_err();
        assert_eq!(err.kind(), vtrouter_errors::ErrorKind::InvalidArgument);
        health.close().await;
    }

    #[tokio::test]
    async fn left_join_pads_nulls_when_right_is_empty() {
        struct EmptyConn;
        #[async_trait]
        impl QueryService for EmptyConn {
            async fn execute(&self, _t: &Target, _s: &str, _b: &BindVars, _tx: i64) -> RR<QueryResult> {
                Ok(QueryResult {
                    fields: vec!["b".into()],
                    rows: vec![],
                    rows_affected: 0,
                    insert_id: 0,
                })
            }
            async fn begin(&self, _t: &Target) -> RR<i64> {
                Ok(1)
            }
            async fn commit(&self, _t: &Target, _tx: i64) -> RR<()> {
                Ok(())
            }
            async fn rollback(&self, _t: &Target, _tx: i64) -> RR<()> {
                Ok(())
            }
            async fn stream_health(&self, _cb: &mut (dyn FnMut(StreamHealthResponse) + Send)) -> RR<()> {
                std::future::pending::<()>().await;
                Ok(())
            }
            async fn close(&self) {}
        }

        let left = QueryResult {
            fields: vec!["a".into()],
            rows: vec![vec![Some(b"1".to_vec())], vec![Some(b"2".to_vec())]],
            rows_affected: 0,
            insert_id: 0,
        };
        let right = QueryResult {
            fields: vec!["b".into()],
            rows: vec![],
            rows_affected: 0,
            insert_id: 0,
        };
        let cols = vec![JoinCol::from_left(0), JoinCol::from_right(0)];
        let mut rows = Vec::new();
        for left_row in &left.rows {
            let null_right = QueryResult::null_row(right.fields.len());
            rows.push(join_row(&cols, left_row, &null_right));
        }
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![Some(b"1".to_vec()), None]);
        let _ = EmptyConn;
    }

    #[test]
    fn annotate_with_keyspace_id_appends_hex_comment() {
        let sql = annotate_with_keyspace_id("insert into t values (1)", &[0xab, 0xcd]);
        assert_eq!(sql, "insert into t values (1) /* vtgate:: keyspace_id:abcd */");
    }

    #[test]
    fn keyspace_ids_flattens_one_level_of_tuple() {
        let values = vec![BindValue::Tuple(vec![BindValue::Bytes(vec![1]), BindValue::Bytes(vec![2])])];
        let ids = keyspace_ids(&values).unwrap();
        assert_eq!(ids, vec![vec![1], vec![2]]);
    }
}
