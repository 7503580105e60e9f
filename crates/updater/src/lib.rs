//! Node updater pool: a resizable set of workers draining a per-node coalescing queue and applying
//! planned patches through a [`NodeStore`].
//!
//! Requests for the same node never run concurrently; a request that arrives while one is queued
//! replaces it, so at most one request per node waits behind the in-flight one.

#![forbid(unsafe_code)]

pub mod coalescer;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use nodefeat_apply::plan_node_patches;
use nodefeat_core::{NodeStore, NodeUpdateRequest, StoreError};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use coalescer::Coalescer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 5, base: Duration::from_millis(100), cap: Duration::from_secs(5) } }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Idle,
    Queued,
    Applying,
    Retrying { attempt: u32 },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied { ops: usize },
    Unchanged,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub enqueued: u64,
    pub coalesced: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub conflicts: u64,
}

impl PoolStats {
    /// Requests that reached a worker.
    pub fn processed(&self) -> u64 { self.applied + self.unchanged + self.skipped + self.failed }
}

struct QueueState {
    queue: Coalescer<NodeUpdateRequest>,
    nodes: FxHashMap<String, NodeState>,
    outcomes: FxHashMap<String, UpdateOutcome>,
    stats: PoolStats,
    alive: BTreeSet<usize>,
    next_worker: usize,
    shutdown: bool,
}

struct Inner {
    store: Arc<dyn NodeStore>,
    retry: RetryPolicy,
    no_publish: AtomicBool,
    state: Mutex<QueueState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    work: Notify,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }
}

/// Cheap to clone; all clones drive the same workers.
#[derive(Clone)]
pub struct NodeUpdaterPool {
    inner: Arc<Inner>,
}

impl NodeUpdaterPool {
    /// Start `workers` workers (at least one). Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn NodeStore>, workers: usize, retry: RetryPolicy) -> Self {
        let inner = Arc::new(Inner {
            store,
            retry,
            no_publish: AtomicBool::new(false),
            state: Mutex::new(QueueState {
                queue: Coalescer::new(),
                nodes: FxHashMap::default(),
                outcomes: FxHashMap::default(),
                stats: PoolStats::default(),
                alive: BTreeSet::new(),
                next_worker: 0,
                shutdown: false,
            }),
            handles: Mutex::new(Vec::new()),
            work: Notify::new(),
            idle: Notify::new(),
        });
        let pool = Self { inner };
        pool.resize(workers);
        pool
    }

    /// Queue a desired state for its node. Returns false once the pool is shutting down.
    pub fn enqueue(&self, req: NodeUpdateRequest) -> bool {
        let name = req.node_name.clone();
        {
            let mut st = self.inner.lock();
            if st.shutdown {
                return false;
            }
            st.stats.enqueued += 1;
            if st.queue.push(&name, req) {
                debug!(node = %name, "updater: replaced pending request");
            }
            if !st.queue.is_in_flight(&name) {
                st.nodes.insert(name, NodeState::Queued);
            }
        }
        self.inner.work.notify_one();
        true
    }

    /// Queue many requests without waiting for any of them; returns how many were accepted.
    pub fn enqueue_all(&self, reqs: impl IntoIterator<Item = NodeUpdateRequest>) -> usize {
        reqs.into_iter().map(|r| self.enqueue(r)).filter(|accepted| *accepted).count()
    }

    /// Grow or shrink the worker set. Retired workers finish their current request first; queued
    /// requests stay queued.
    pub fn resize(&self, workers: usize) {
        let workers = workers.max(1);
        let mut spawned = Vec::new();
        {
            let mut st = self.inner.lock();
            if st.shutdown {
                return;
            }
            while st.alive.len() > workers {
                st.alive.pop_last();
            }
            while st.alive.len() < workers {
                let id = st.next_worker;
                st.next_worker += 1;
                st.alive.insert(id);
                spawned.push(id);
            }
        }
        debug!(workers, spawned = spawned.len(), "updater: resized");
        let mut handles = self.inner.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.retain(|h| !h.is_finished());
        for id in spawned {
            handles.push(tokio::spawn(worker(Arc::clone(&self.inner), id)));
        }
        drop(handles);
        self.inner.work.notify_waiters();
    }

    pub fn workers(&self) -> usize { self.inner.lock().alive.len() }

    /// While set, workers plan patches and log them but never write.
    pub fn set_no_publish(&self, on: bool) { self.inner.no_publish.store(on, Ordering::Relaxed); }

    pub fn state(&self, node: &str) -> NodeState {
        self.inner.lock().nodes.get(node).copied().unwrap_or(NodeState::Idle)
    }

    pub fn last_outcome(&self, node: &str) -> Option<UpdateOutcome> { self.inner.lock().outcomes.get(node).cloned() }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.lock();
        PoolStats { coalesced: st.queue.coalesced(), ..st.stats }
    }

    /// Resolve once nothing is queued or in flight.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.inner.lock().queue.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Drop queued requests, let in-flight ones complete, then join every worker.
    pub async fn shutdown(&self) {
        {
            let mut st = self.inner.lock();
            if !st.shutdown {
                st.shutdown = true;
                let dropped = st.queue.clear_pending();
                st.alive.clear();
                for s in st.nodes.values_mut() {
                    if *s == NodeState::Queued {
                        *s = NodeState::Idle;
                    }
                }
                info!(dropped, in_flight = st.queue.in_flight(), "updater: shutting down");
            }
        }
        self.inner.work.notify_waiters();
        let handles = std::mem::take(&mut *self.inner.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "updater: worker panicked");
            }
        }
        self.inner.idle.notify_waiters();
    }
}

async fn worker(inner: Arc<Inner>, id: usize) {
    debug!(worker = id, "updater: worker started");
    loop {
        let mut notified = std::pin::pin!(inner.work.notified());
        notified.as_mut().enable();
        let job = {
            let mut st = inner.lock();
            if st.shutdown || !st.alive.contains(&id) {
                break;
            }
            let job = st.queue.pop_ready();
            if let Some((name, _)) = &job {
                st.nodes.insert(name.clone(), NodeState::Applying);
            }
            job
        };
        let Some((name, req)) = job else {
            notified.await;
            continue;
        };

        let started = Instant::now();
        let outcome = process(&inner, &name, req).await;
        histogram!("node_update_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

        let mut st = inner.lock();
        st.queue.finish(&name);
        match &outcome {
            UpdateOutcome::Applied { ops } => {
                st.stats.applied += 1;
                counter!("node_updates_total", 1u64);
                debug!(node = %name, ops, "updater: applied");
            }
            UpdateOutcome::Unchanged => st.stats.unchanged += 1,
            UpdateOutcome::Skipped(reason) => {
                st.stats.skipped += 1;
                debug!(node = %name, reason = %reason, "updater: skipped");
            }
            UpdateOutcome::Failed(e) => {
                st.stats.failed += 1;
                counter!("node_update_failures_total", 1u64);
                warn!(node = %name, error = %e, "updater: update failed");
            }
        }
        let next = if st.queue.is_pending(&name) {
            NodeState::Queued
        } else if matches!(outcome, UpdateOutcome::Failed(_)) {
            NodeState::Failed
        } else {
            NodeState::Idle
        };
        st.nodes.insert(name.clone(), next);
        st.outcomes.insert(name, outcome);
        let idle = st.queue.is_idle();
        let more = !st.queue.is_empty();
        drop(st);
        if more {
            inner.work.notify_one();
        }
        if idle {
            inner.idle.notify_waiters();
        }
    }
    debug!(worker = id, "updater: worker stopped");
    inner.idle.notify_waiters();
}

/// Fetch, plan and patch, re-reading the node after each conflict. A retry picks up whatever
/// newer desired state was queued for the node during the backoff.
async fn process(inner: &Inner, name: &str, mut req: NodeUpdateRequest) -> UpdateOutcome {
    let mut attempt = 1;
    loop {
        match apply_once(inner, &req).await {
            Ok(outcome) => return outcome,
            Err(StoreError::NotFound(_)) => return UpdateOutcome::Skipped("node not found".to_string()),
            Err(e) if e.is_conflict() && attempt < inner.retry.max_attempts => {
                counter!("node_update_conflicts_total", 1u64);
                let delay = inner.retry.backoff(attempt);
                {
                    let mut st = inner.lock();
                    st.stats.conflicts += 1;
                    st.nodes.insert(name.to_string(), NodeState::Retrying { attempt });
                }
                debug!(node = %name, attempt, delay_ms = delay.as_millis() as u64, "updater: conflict; retrying");
                tokio::time::sleep(delay).await;
                let newer = {
                    let mut st = inner.lock();
                    st.nodes.insert(name.to_string(), NodeState::Applying);
                    st.queue.take_pending(name)
                };
                if let Some(newer) = newer {
                    debug!(node = %name, "updater: retrying with newer desired state");
                    req = newer;
                }
                attempt += 1;
            }
            Err(e) => {
                if e.is_conflict() {
                    counter!("node_update_conflicts_total", 1u64);
                    inner.lock().stats.conflicts += 1;
                }
                return UpdateOutcome::Failed(format!("after {} attempt(s): {}", attempt, e));
            }
        }
    }
}

async fn apply_once(inner: &Inner, req: &NodeUpdateRequest) -> Result<UpdateOutcome, StoreError> {
    let node = inner.store.get_node(&req.node_name).await?;
    let plan = plan_node_patches(&node, req);
    if plan.is_empty() {
        return Ok(UpdateOutcome::Unchanged);
    }
    let summary = plan.summary();
    if inner.no_publish.load(Ordering::Relaxed) {
        info!(
            node = %req.node_name,
            adds = summary.adds,
            updates = summary.updates,
            removes = summary.removes,
            "updater: noPublish set; not patching"
        );
        return Ok(UpdateOutcome::Skipped("noPublish".to_string()));
    }
    if !plan.metadata.is_empty() {
        inner.store.patch_node(&req.node_name, &plan.metadata).await?;
    }
    if !plan.status.is_empty() {
        inner.store.patch_node_status(&req.node_name, &plan.status).await?;
    }
    Ok(UpdateOutcome::Applied { ops: plan.len() })
}
