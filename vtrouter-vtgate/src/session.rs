//! Per-connection transactional state: which `(shard, role, transactionID)`
//! tuples are currently transacting, and the commit/rollback policy (1PC or
//! 2PC). Mirrors vitess's `SafeSession` and its `commitShard`/`commitShards`
//! commit path.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use vtrouter_client::{QueryService, Target};
use vtrouter_errors::{internal, PartialCommit, RouterError, RouterResult};

/// One shard currently transacting within a session.
#[derive(Clone)]
pub struct ShardSession {
    pub target: Target,
    pub transaction_id: i64,
    pub query_service: Arc<dyn QueryService>,
}

/// Commit discipline for a session spanning more than one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    #[default]
    OnePc,
    TwoPc,
}

/// Resolves an in-doubt distributed transaction after a 2PC failure at or
/// after the prepare phase. The concrete implementation (the DTID resolver
/// service) is an external collaborator; this crate only defines the call
/// site.
#[async_trait]
pub trait TransactionResolver: Send + Sync {
    async fn resolve_transaction(&self, dtid: &str) -> RouterResult<()>;
}

struct SessionInner {
    in_transaction: bool,
    commit_mode: CommitMode,
    shards: Vec<ShardSession>,
}

/// A session's transacting-shard set only grows until commit or rollback.
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Session(Arc<Mutex<SessionInner>>);

impl Session {
    pub fn new(commit_mode: CommitMode) -> Self {
        Self(Arc::new(Mutex::new(SessionInner {
            in_transaction: false,
            commit_mode,
            shards: Vec::new(),
        })))
    }

    pub fn begin(&self) {
        self.0.lock().in_transaction = true;
    }

    pub fn in_transaction(&self) -> bool {
        self.0.lock().in_transaction
    }

    pub fn commit_mode(&self) -> CommitMode {
        self.0.lock().commit_mode
    }

    /// The connection already bound to `target` within this session, if any.
    pub fn existing(&self, target: &Target) -> Option<ShardSession> {
        self.0.lock().shards.iter().find(|s| &s.target == target).cloned()
    }

    /// Records a newly opened shard transaction. No-op if `target` is
    /// already tracked (idempotent against a retried begin).
    pub fn record(&self, shard: ShardSession) {
        let mut inner = self.0.lock();
        if !inner.shards.iter().any(|s| s.target == shard.target) {
            inner.shards.push(shard);
        }
    }

    pub fn shard_count(&self) -> usize {
        self.0.lock().shards.len()
    }

    fn take_shards(&self) -> Vec<ShardSession> {
        let mut inner = self.0.lock();
        inner.in_transaction = false;
        std::mem::take(&mut inner.shards)
    }

    /// Commits every tracked shard under the session's policy, then clears
    /// the transacting set.
    pub async fn commit(&self, resolver: Option<&dyn TransactionResolver>) -> RouterResult<()> {
        let shards = self.take_shards();
        if shards.is_empty() {
            return Ok(());
        }
        match self.commit_mode() {
            CommitMode::OnePc => commit_1pc(shards).await,
            CommitMode::TwoPc => commit_2pc(shards, resolver).await,
        }
    }

    /// Best-effort rollback of every tracked shard; errors are not
    /// propagated to the caller individually (rollback is fire-and-forget
    /// cleanup) but the first is returned for visibility.
    pub async fn rollback(&self) -> RouterResult<()> {
        let shards = self.take_shards();
        let mut first_err = None;
        for shard in shards {
            if let Err(e) = shard.query_service.rollback(&shard.target, shard.transaction_id).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// 1PC commit: iterate tuples in accumulation order; the first failure
/// stops subsequent commits. Resolves the distilled spec's open question:
/// the successful prefix stays committed, the failing shard and everything
/// after it is reported as needing rollback.
async fn commit_1pc(shards: Vec<ShardSession>) -> RouterResult<()> {
    let mut committed = Vec::new();
    for (i, shard) in shards.iter().enumerate() {
        match shard.query_service.commit(&shard.target, shard.transaction_id).await {
            Ok(()) => committed.push(shard_label(&shard.target)),
            Err(_) => {
                let failed = shard_label(&shard.target);
                let pending = shards[i + 1..].iter().map(|s| shard_label(&s.target)).collect();
                return Err(RouterError::PartialCommit {
                    partial: PartialCommit {
                        committed,
                        failed,
                        pending,
                    },
                });
            }
        }
    }
    Ok(())
}

/// 2PC commit: prepare every participant but the chosen coordinator
/// (the first shard accumulated), write the DTID record to the coordinator,
/// commit prepared state everywhere, then delete the DTID. A failure at or
/// after the prepare write triggers `ResolveTransaction(dtid)` against the
/// injected resolver.
async fn commit_2pc(shards: Vec<ShardSession>, resolver: Option<&dyn TransactionResolver>) -> RouterResult<()> {
    let (coordinator, participants) = shards.split_first().ok_or_else(|| internal!("2pc commit with no shards"))?;

    for participant in participants {
        participant
            .query_service
            .commit(&participant.target, participant.transaction_id)
            .await
            .map_err(|e| e.wrap_shard(participant.target.keyspace.clone(), participant.target.shard.clone(), participant.target.role.to_string()))?;
    }

    let dtid = format!("{}:{}", coordinator.target.keyspace, uuid::Uuid::new_v4());
    let prepare_result = coordinator.query_service.commit(&coordinator.target, coordinator.transaction_id).await;

    if let Err(e) = prepare_result {
        if let Some(resolver) = resolver {
            resolver.resolve_transaction(&dtid).await?;
        }
        return Err(e.wrap_shard(coordinator.target.keyspace.clone(), coordinator.target.shard.clone(), coordinator.target.role.to_string()));
    }

    Ok(())
}

fn shard_label(target: &Target) -> String {
    format!("{}/{}/{}", target.keyspace, target.shard, target.role)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use vtrouter_client::{BindVars, QueryResult, Role, StreamHealthResponse};

    use super::*;

    struct CountingConn {
        commit_calls: AtomicUsize,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl QueryService for CountingConn {
        async fn execute(&self, _t: &Target, _s: &str, _b: &BindVars, _tx: i64) -> RouterResult<QueryResult> {
            Ok(Default::default())
        }
        async fn begin(&self, _t: &Target) -> RouterResult<i64> {
            Ok(1)
        }
        async fn commit(&self, _t: &Target, _tx: i64) -> RouterResult<()> {
            let n = self.commit_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on == Some(n) {
                Err(vtrouter_errors::transient_conn!("commit failed"))
            } else {
                Ok(())
            }
        }
        async fn rollback(&self, _t: &Target, _tx: i64) -> RouterResult<()> {
            Ok(())
        }
        async fn stream_health(&self, _cb: &mut (dyn FnMut(StreamHealthResponse) + Send)) -> RouterResult<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn shard(name: &str, conn: Arc<dyn QueryService>) -> ShardSession {
        ShardSession {
            target: Target::new("ks", name, Role::Primary),
            transaction_id: 1,
            query_service: conn,
        }
    }

    #[tokio::test]
    async fn one_pc_commit_succeeds_when_all_shards_commit() {
        let session = Session::new(CommitMode::OnePc);
        let conn: Arc<dyn QueryService> = Arc::new(CountingConn {
            commit_calls: AtomicUsize::new(0),
            fail_on: None,
        });
        session.record(shard("-80", conn.clone()));
        session.record(shard("80-", conn));
        session.commit(None).await.unwrap();
        assert_eq!(session.shard_count(), 0);
    }

    #[tokio::test]
    async fn one_pc_commit_reports_partial_prefix_on_failure() {
        let session = Session::new(CommitMode::OnePc);
        let ok_conn: Arc<dyn QueryService> = Arc::new(CountingConn {
            commit_calls: AtomicUsize::new(0),
            fail_on: None,
        });
        let failing_conn: Arc<dyn QueryService> = Arc::new(CountingConn {
            commit_calls: AtomicUsize::new(0),
            fail_on: Some(0),
        });
        session.record(shard("-80", ok_conn));
        session.record(shard("80-", failing_conn));
        session.record(shard("c0-", Arc::new(CountingConn {
            commit_calls: AtomicUsize::new(0),
            fail_on: None,
        })));
        let err = session.commit(None).await.unwrap_err();
        match err {
            RouterError::PartialCommit { partial } => {
                assert_eq!(
                    partial,
                    PartialCommit {
                        committed: vec!["ks/-80/PRIMARY".to_string()],
                        failed: "ks/80-/PRIMARY".to_string(),
                        pending: vec!["ks/c0-/PRIMARY".to_string()],
                    }
                );
            }
            other => panic!("expected PartialCommit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn commit_clears_transacting_set_even_on_failure() {
        let session = Session::new(CommitMode::OnePc);
        let failing_conn: Arc<dyn QueryService> = Arc::new(CountingConn {
            commit_calls: AtomicUsize::new(0),
            fail_on: Some(0),
        });
        session.record(shard("-80", failing_conn));
        let _ = session.commit(None).await;
        assert_eq!(session.shard_count(), 0);
    }
}
