//! Mimir coordinator runtime: Coalescer, SnapshotBuilder and the serialized reconcile loop.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use mimir_core::{
    Delta, DeltaKind, InputSnapshot, Payload, Pusher, ReconciliationResult, RelationObject, RelationSnapshot,
    StatusReporter, WorkerUnit,
};
use mimir_reconcile::Reconciler;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn queue_cap() -> usize {
    std::env::var("MIMIR_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).filter(|n| *n > 0).unwrap_or(2048)
}

fn resync_secs() -> u64 {
    std::env::var("MIMIR_RESYNC_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(300)
}

fn debounce_ms() -> u64 {
    std::env::var("MIMIR_DEBOUNCE_MS").ok().and_then(|s| s.parse::<u64>().ok()).filter(|n| *n > 0).unwrap_or(50)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub queue_cap: usize,
    /// Passes run at most this often while events keep arriving.
    pub debounce: Duration,
    /// Periodic pass without new events; `None` disables it.
    pub resync: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self { Self { queue_cap: 2048, debounce: Duration::from_millis(50), resync: Some(Duration::from_secs(300)) } }
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let resync = resync_secs();
        Self {
            queue_cap: queue_cap(),
            debounce: Duration::from_millis(debounce_ms()),
            resync: (resync > 0).then(|| Duration::from_secs(resync)),
        }
    }
}

/// Coalescing queue keyed by object with FIFO order and fixed capacity.
/// A push past capacity hands back the oldest delta instead of dropping it.
pub struct Coalescer {
    map: FxHashMap<String, Delta>,
    order: VecDeque<String>,
    cap: usize,
    spilled: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), spilled: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn spilled(&self) -> u64 { self.spilled }

    pub fn push(&mut self, d: Delta) -> Option<Delta> {
        if d.kind == DeltaKind::Restarted {
            // A relist supersedes everything still pending under its prefix.
            let prefix = format!("{}/", d.key);
            self.map.retain(|k, _| !k.starts_with(&prefix) && *k != d.key);
            self.order.retain(|k| self.map.contains_key(k));
        }
        let mut evicted = None;
        if !self.map.contains_key(&d.key) {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    evicted = self.map.remove(&old);
                    self.spilled += 1;
                }
            }
            self.order.push_back(d.key.clone());
        }
        self.map.insert(d.key.clone(), d);
        evicted
    }

    /// Drain all coalesced deltas in first-seen order.
    pub fn drain_ready(&mut self) -> Vec<Delta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&key) {
                out.push(d);
            }
        }
        out
    }
}

/// Folds deltas into the current relation state and freezes it into pass snapshots.
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    epoch: u64,
    relations: BTreeMap<String, RelationSnapshot>,
    workers: BTreeMap<String, WorkerUnit>,
    options: BTreeMap<String, Payload>,
}

impl SnapshotBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn epoch(&self) -> u64 { self.epoch }

    pub fn apply_one(&mut self, d: Delta) {
        if d.kind == DeltaKind::Restarted {
            if let RelationObject::Listing(keys) = &d.object {
                self.reset(&d.key, keys);
            }
            return;
        }
        self.relations.remove(&d.key);
        self.workers.remove(&d.key);
        self.options.remove(&d.key);
        if d.kind == DeltaKind::Deleted {
            return;
        }
        match d.object {
            RelationObject::Dependency(r) => { self.relations.insert(d.key, r); }
            RelationObject::Worker(w) => { self.workers.insert(d.key, w); }
            RelationObject::Options(p) => { self.options.insert(d.key, p); }
            RelationObject::Listing(_) => {}
        }
    }

    /// Drop entries under `prefix` that the source no longer lists.
    fn reset(&mut self, prefix: &str, keep: &BTreeSet<String>) {
        let prefix = format!("{}/", prefix);
        let stale = |k: &String| k.starts_with(&prefix) && !keep.contains(k);
        let before = self.relations.len() + self.workers.len() + self.options.len();
        self.relations.retain(|k, _| !stale(k));
        self.workers.retain(|k, _| !stale(k));
        self.options.retain(|k, _| !stale(k));
        let dropped = before - (self.relations.len() + self.workers.len() + self.options.len());
        if dropped > 0 {
            debug!(%prefix, dropped, "source relisted; dropped stale entries");
        }
    }

    pub fn apply(&mut self, batch: Vec<Delta>) {
        for d in batch {
            self.apply_one(d);
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    /// Options from several sources merge in key order; later keys win.
    pub fn freeze(&self) -> InputSnapshot {
        let mut options = Payload::new();
        for p in self.options.values() {
            options.extend(p.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        InputSnapshot {
            epoch: self.epoch,
            relations: self.relations.values().cloned().collect(),
            workers: self.workers.values().cloned().collect(),
            options,
        }
    }
}

/// Logs every pass outcome; used when no cluster-facing reporter is configured.
pub struct LogReporter;

#[async_trait::async_trait]
impl StatusReporter for LogReporter {
    async fn report(&self, result: &ReconciliationResult) -> anyhow::Result<()> {
        match result.status.reason() {
            None => info!(pass = %result.pass_id, status = result.status.name(), "coordinator status"),
            Some(reason) => warn!(pass = %result.pass_id, status = result.status.name(), %reason, "coordinator status"),
        }
        for d in &result.diagnostics {
            debug!(pass = %result.pass_id, severity = ?d.severity(), "{}", d);
        }
        Ok(())
    }
}

/// Handle for readers to access the latest pass result and subscribe to new ones.
#[derive(Clone)]
pub struct ReconcileHandle {
    last: Arc<ArcSwapOption<ReconciliationResult>>,
    passes_rx: watch::Receiver<u64>,
}

impl ReconcileHandle {
    pub fn current(&self) -> Option<Arc<ReconciliationResult>> { self.last.load_full() }
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.passes_rx.clone() }
}

async fn tick_opt(t: &mut Option<tokio::time::Interval>) {
    match t {
        Some(t) => { t.tick().await; }
        None => std::future::pending::<()>().await,
    }
}

struct PassLoop {
    reconciler: Reconciler,
    pusher: Arc<dyn Pusher>,
    reporter: Arc<dyn StatusReporter>,
    last: Arc<ArcSwapOption<ReconciliationResult>>,
    passes_tx: watch::Sender<u64>,
    passes: u64,
}

impl PassLoop {
    async fn run_pass(&mut self, snap: InputSnapshot) {
        let result = self.reconciler.reconcile(&snap, self.pusher.as_ref()).await;
        if let Err(e) = self.reporter.report(&result).await {
            metrics::counter!("runtime_report_err_total", 1u64);
            warn!(error = %e, "status report failed");
        }
        self.last.store(Some(Arc::new(result)));
        self.passes += 1;
        let _ = self.passes_tx.send(self.passes);
    }
}

/// Spawn the reconcile loop. Deltas sent on the returned channel are coalesced and folded into
/// snapshots; at most one pass runs at a time and events arriving mid-pass wait for the next one.
pub fn spawn_reconcile(
    reconciler: Reconciler,
    pusher: Arc<dyn Pusher>,
    reporter: Arc<dyn StatusReporter>,
    cfg: RuntimeConfig,
) -> (mpsc::Sender<Delta>, ReconcileHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Delta>(cfg.queue_cap.max(1));
    let last = Arc::new(ArcSwapOption::<ReconciliationResult>::empty());
    let (passes_tx, passes_rx) = watch::channel(0u64);
    let handle = ReconcileHandle { last: Arc::clone(&last), passes_rx };

    let join = tokio::spawn(async move {
        let mut state = PassLoop { reconciler, pusher, reporter, last, passes_tx, passes: 0 };
        let mut coalescer = Coalescer::with_capacity(cfg.queue_cap);
        let mut builder = SnapshotBuilder::new();
        let mut ticker = tokio::time::interval(cfg.debounce.max(Duration::from_millis(1)));
        let mut resync = cfg.resync.map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => {
                            if let Some(spill) = coalescer.push(d) {
                                metrics::counter!("runtime_coalescer_spill_total", 1u64);
                                builder.apply_one(spill);
                            }
                        }
                        None => {
                            debug!("delta channel closed; draining and exiting reconcile loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() {
                                builder.apply(batch);
                                state.run_pass(builder.freeze()).await;
                            }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() {
                        debug!(deltas = batch.len(), "applying coalesced batch");
                        builder.apply(batch);
                        state.run_pass(builder.freeze()).await;
                    }
                }
                _ = tick_opt(&mut resync) => {
                    if builder.epoch() > 0 {
                        debug!(epoch = builder.epoch(), "resync pass");
                        state.run_pass(builder.freeze()).await;
                    }
                }
            }
        }
        info!(passes = state.passes, spilled = coalescer.spilled(), "reconcile loop stopped");
    });

    (tx, handle, join)
}
