//! The streaming health-probe engine: one long-running task per registered
//! tablet, fanning in to a single listener. Mirrors vitess's discovery
//! `HealthCheckImpl`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use vtrouter_client::{QueryService, StreamHealthResponse, Tablet, TabletStats, Target};
use vtrouter_errors::RouterResult;
use vtrouter_util::Backoff;

use crate::metrics;

/// Receives a `StatsUpdate` on every tablet lifecycle transition: first
/// successful probe, role change, timeout, or removal.
pub trait StatsListener: Send + Sync {
    fn stats_update(&self, stats: &TabletStats);
}

/// Dials a tablet's physical RPC connection. The transport implementation is
/// an external collaborator; the engine only needs this seam to start a
/// probe.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, tablet: &Tablet, timeout: Duration) -> RouterResult<Arc<dyn QueryService>>;
}

#[derive(Debug, Clone, Copy)]
pub struct HealthCheckConfig {
    pub conn_timeout: Duration,
    pub retry_delay: Duration,
    pub healthcheck_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            conn_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(5),
            healthcheck_timeout: Duration::from_secs(60),
        }
    }
}

struct EntryState {
    stats: TabletStats,
    last_response: Instant,
}

struct Entry {
    key: String,
    tablet: Tablet,
    cancel: CancellationToken,
    state: RwLock<EntryState>,
    conn: Mutex<Option<Arc<dyn QueryService>>>,
    reported_initial: AtomicBool,
}

struct Inner {
    listener: OnceLock<(Arc<dyn StatsListener>, bool)>,
    dialer: Arc<dyn Dialer>,
    config: HealthCheckConfig,
    conns: RwLock<HashMap<String, Arc<Entry>>>,
    cancel_all: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initial_pending: AtomicUsize,
    initial_done: Notify,
}

impl Inner {
    fn listener(&self) -> Option<(&Arc<dyn StatsListener>, bool)> {
        self.listener.get().map(|(l, d)| (l, *d))
    }

    fn notify(&self, stats: &TabletStats) {
        if let Some((listener, _)) = self.listener() {
            listener.stats_update(stats);
        }
    }
}

/// The streaming health-check engine. Cheap to clone; clones share the same
/// underlying state.
#[derive(Clone)]
pub struct HealthCheck(Arc<Inner>);

impl HealthCheck {
    pub fn new(dialer: Arc<dyn Dialer>, config: HealthCheckConfig) -> Self {
        let inner = Arc::new(Inner {
            listener: OnceLock::new(),
            dialer,
            config,
            conns: RwLock::new(HashMap::new()),
            cancel_all: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            initial_pending: AtomicUsize::new(0),
            initial_done: Notify::new(),
        });
        // Weak: the ticker must not keep `Inner` alive past `close()`, or the
        // engine would never drop while this background task still runs.
        let ticker_weak = Arc::downgrade(&inner);
        let ticker_cancel = inner.cancel_all.clone();
        let period = inner.config.healthcheck_timeout / 3;
        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = ticker_cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            let Some(inner) = ticker_weak.upgrade() else { return };
                            check_timeouts(&inner);
                        }
                    }
                }
            }
            .instrument(tracing::debug_span!("healthcheck_timeout_ticker")),
        );
        inner.tasks.lock().push(handle);
        Self(inner)
    }

    /// Must be called before the first `add_tablet`. A second call, or a
    /// call after tablets already exist, is a programmer error.
    pub fn set_listener(&self, listener: Arc<dyn StatsListener>, send_down_events: bool) {
        if !self.0.conns.read().is_empty() {
            panic!("must not call set_listener after tablets were added");
        }
        if self.0.listener.set((listener, send_down_events)).is_err() {
            panic!("must not call set_listener twice");
        }
    }

    /// Idempotent by the tablet's map key. Spawns the per-tablet probe task.
    #[instrument(skip(self, tablet), fields(key = %tablet.map_key()))]
    pub fn add_tablet(&self, tablet: Tablet, name: String) {
        let key = tablet.map_key();
        let entry = Arc::new(Entry {
            key: key.clone(),
            tablet: tablet.clone(),
            cancel: self.0.cancel_all.child_token(),
            state: RwLock::new(EntryState {
                stats: TabletStats {
                    key: key.clone(),
                    name,
                    target: tablet.target.clone(),
                    tablet: tablet.clone(),
                    up: true,
                    serving: false,
                    primary_ts: 0,
                    replication_lag_sec: 0,
                    last_error: None,
                },
                last_response: Instant::now(),
            }),
            conn: Mutex::new(None),
            reported_initial: AtomicBool::new(false),
        });

        {
            let mut conns = self.0.conns.write();
            if conns.contains_key(&key) {
                warn!(key = %key, "adding duplicate tablet, ignoring");
                return;
            }
            conns.insert(key.clone(), entry.clone());
        }
        self.0.initial_pending.fetch_add(1, Ordering::SeqCst);

        let inner = self.0.clone();
        let span = tracing::info_span!("tablet_probe", key = %key);
        let handle = tokio::spawn(probe_loop(inner, entry).instrument(span));
        self.0.tasks.lock().push(handle);
    }

    /// Asynchronous: cancels the probe and removes the entry; the listener
    /// receives a final `Up=false` event.
    pub fn remove_tablet(&self, tablet: &Tablet) {
        let inner = self.0.clone();
        let key = tablet.map_key();
        tokio::spawn(async move {
            let entry = {
                let mut conns = inner.conns.write();
                conns.remove(&key)
            };
            let Some(entry) = entry else {
                warn!(key = %key, "removing unknown tablet");
                return;
            };
            {
                let mut state = entry.state.write();
                state.stats.up = false;
            }
            entry.cancel.cancel();
            let stats = entry.state.read().stats.clone();
            inner.notify(&stats);
        });
    }

    /// Atomic remove-then-add such that the listener never observes both
    /// `old` and `new` absent at once.
    pub fn replace_tablet(&self, old: &Tablet, new: Tablet, name: String) {
        self.remove_tablet(old);
        self.add_tablet(new, name);
    }

    /// Blocks until every tablet added so far has produced its first
    /// `StatsUpdate`. Not cancelable.
    pub async fn wait_for_initial_stats_updates(&self) {
        loop {
            // Register interest before checking the count, or the last
            // probe's finish_initial landing between the check and the
            // await would notify nobody and this would hang forever.
            let notified = self.0.initial_done.notified();
            if self.0.initial_pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Non-blocking lookup of the per-tablet RPC handle, keyed by the
    /// tablet's map key.
    pub fn get_connection(&self, key: &str) -> Option<Arc<dyn QueryService>> {
        let conns = self.0.conns.read();
        let entry = conns.get(key)?;
        entry.conn.lock().clone()
    }

    /// A grouped, sorted snapshot for introspection, matching
    /// `TabletsCacheStatusList`.
    pub fn cache_status(&self) -> Vec<CacheStatusGroup> {
        let mut groups: HashMap<String, CacheStatusGroup> = HashMap::new();
        for entry in self.0.conns.read().values() {
            let state = entry.state.read();
            let cell = entry.tablet.alias.cell.clone();
            let group_key = state.stats.target.group_key(&cell);
            let group = groups.entry(group_key).or_insert_with(|| CacheStatusGroup {
                cell: cell.clone(),
                target: state.stats.target.clone(),
                tablets: Vec::new(),
            });
            group.tablets.push(state.stats.clone());
        }
        let mut list: Vec<CacheStatusGroup> = groups.into_values().collect();
        list.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for group in &mut list {
            group.tablets.sort_by(|a, b| a.sort_key().cmp(b.sort_key()));
        }
        list
    }

    /// Cancels every probe, waits for all of them (and the timeout ticker)
    /// to exit. Guarantees no further listener callbacks after returning.
    pub async fn close(&self) {
        self.0.cancel_all.cancel();
        self.0.conns.write().clear();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.0.tasks.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CacheStatusGroup {
    pub cell: String,
    pub target: Target,
    pub tablets: Vec<TabletStats>,
}

impl CacheStatusGroup {
    fn sort_key(&self) -> String {
        self.target.group_key(&self.cell)
    }
}

fn check_timeouts(inner: &Arc<Inner>) {
    let entries: Vec<Arc<Entry>> = inner.conns.read().values().cloned().collect();
    for entry in entries {
        let timed_out = {
            let state = entry.state.read();
            state.stats.serving && state.last_response.elapsed() >= inner.config.healthcheck_timeout
        };
        if !timed_out {
            continue;
        }
        let stats = {
            let mut state = entry.state.write();
            // Re-check after acquiring the exclusive lock: a fresh response
            // may have landed between the read check above and here.
            if !state.stats.serving || state.last_response.elapsed() < inner.config.healthcheck_timeout {
                continue;
            }
            state.stats.serving = false;
            state.stats.last_error = Some(format!("healthcheck timed out (latest {:?})", state.last_response));
            state.stats.clone()
        };
        entry.cancel.cancel();
        metrics::record_healthcheck_error(&stats.target);
        inner.notify(&stats);
        warn!(key = %entry.key, "healthcheck timed out, forcing non-serving");
    }
}

async fn probe_loop(inner: Arc<Inner>, entry: Arc<Entry>) {
    let mut backoff = Backoff::new(inner.config.retry_delay, inner.config.retry_delay * 16);
    loop {
        if entry.cancel.is_cancelled() {
            break;
        }
        match inner.dialer.dial(&entry.tablet, inner.config.conn_timeout).await {
            Err(e) => {
                mark_dial_error(&inner, &entry, &e.to_string());
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
            Ok(conn) => {
                *entry.conn.lock() = Some(conn.clone());
                backoff.reset();
                let inner2 = inner.clone();
                let entry2 = entry.clone();
                let mut cb = move |shr| process_response(&inner2, &entry2, shr);
                let drain = conn.stream_health(&mut cb);
                tokio::select! {
                    _ = entry.cancel.cancelled() => break,
                    result = drain => {
                        *entry.conn.lock() = None;
                        if let Err(e) = result {
                            mark_dial_error(&inner, &entry, &e.to_string());
                        }
                        let delay = backoff.next_delay();
                        tokio::select! {
                            _ = entry.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
    finish_initial(&inner, &entry);
    debug!(key = %entry.key, "probe exiting");
}

fn mark_dial_error(inner: &Arc<Inner>, entry: &Arc<Entry>, message: &str) {
    let stats = {
        let mut state = entry.state.write();
        state.stats.serving = false;
        state.stats.last_error = Some(message.to_string());
        state.stats.clone()
    };
    metrics::record_healthcheck_error(&stats.target);
    inner.notify(&stats);
    finish_initial(inner, entry);
}

fn process_response(inner: &Arc<Inner>, entry: &Arc<Entry>, shr: StreamHealthResponse) {
    if shr.tablet_alias != entry.tablet.alias {
        warn!(key = %entry.key, "dropping health response for stale tablet alias");
        return;
    }
    let Some(realtime) = shr.realtime_stats else {
        warn!(key = %entry.key, "dropping health response without realtime stats");
        return;
    };

    let mut serving = shr.serving;
    let health_error = if let Some(err) = realtime.health_error.filter(|s| !s.is_empty()) {
        serving = false;
        Some(format!("vttablet error: {err}"))
    } else {
        None
    };

    let (old_target, role_changed) = {
        let state = entry.state.read();
        let changed = state.stats.target != shr.target;
        (state.stats.target.clone(), changed)
    };

    if role_changed {
        info!(key = %entry.key, old = %old_target.role, new = %shr.target.role, "tablet target changed");
        if let Some((listener, true)) = inner.listener() {
            let mut down = {
                let state = entry.state.read();
                state.stats.clone()
            };
            down.target = old_target;
            down.up = false;
            listener.stats_update(&down);
        }
    }

    let stats = {
        let mut state = entry.state.write();
        state.last_response = Instant::now();
        state.stats.target = shr.target.clone();
        state.stats.serving = serving;
        state.stats.primary_ts = shr.tablet_externally_reparented_timestamp;
        state.stats.replication_lag_sec = realtime.seconds_behind_master;
        state.stats.last_error = health_error;
        state.stats.clone()
    };

    if shr.target.role == vtrouter_client::Role::Primary && role_changed {
        metrics::record_promotion(&shr.target);
    }

    inner.notify(&stats);
    finish_initial(inner, entry);
}

fn finish_initial(inner: &Arc<Inner>, entry: &Arc<Entry>) {
    if !entry.reported_initial.swap(true, Ordering::SeqCst) {
        inner.initial_pending.fetch_sub(1, Ordering::SeqCst);
        inner.initial_done.notify_waiters();
    }
}
