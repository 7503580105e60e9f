//! Reconciler façade: owns the rule and feature caches, turns inputs into desired node state and
//! hands it to the updater pool.
//!
//! All cache mutation happens through `&mut self`; [`Master::run`] is the single loop that owns
//! the master once the process is up.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use metrics::counter;
use nodefeat_config::{Config, ConfigManager};
use nodefeat_core::{FeatureSet, InputEvent, NodeFeatures, NodeStore, NodeUpdateRequest, RuleSet, SourceEvent};
use nodefeat_rules::{evaluate_rule_sets, NamespaceFilter};
use nodefeat_updater::{NodeUpdaterPool, PoolStats, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Labels (and optionally raw features) pushed directly for one node by a node agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLabelsRequest {
    pub node_name: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub features: Option<FeatureSet>,
}

pub struct Master {
    config: Arc<ConfigManager>,
    store: Arc<dyn NodeStore>,
    pool: NodeUpdaterPool,
    rules: BTreeMap<String, RuleSet>,
    /// Feature objects by object name.
    features: BTreeMap<String, NodeFeatures>,
    /// Latest direct push per node.
    pushed: BTreeMap<String, NodeFeatures>,
}

impl Master {
    /// Must be called inside a tokio runtime; starts the updater workers.
    pub fn new(config: Arc<ConfigManager>, store: Arc<dyn NodeStore>) -> Self {
        Self::with_retry(config, store, RetryPolicy::default())
    }

    pub fn with_retry(config: Arc<ConfigManager>, store: Arc<dyn NodeStore>, retry: RetryPolicy) -> Self {
        let cfg = config.current();
        let pool = NodeUpdaterPool::new(Arc::clone(&store), cfg.api_parallelism, retry);
        pool.set_no_publish(cfg.no_publish);
        Self { config, store, pool, rules: BTreeMap::new(), features: BTreeMap::new(), pushed: BTreeMap::new() }
    }

    pub fn config(&self) -> Arc<Config> { self.config.current() }
    pub fn pool(&self) -> &NodeUpdaterPool { &self.pool }
    pub fn stats(&self) -> PoolStats { self.pool.stats() }
    pub fn rule_sets(&self) -> impl Iterator<Item = &RuleSet> { self.rules.values() }

    /// Everything known for `node`: feature objects in name order, then the latest push.
    fn node_inputs(&self, node: &str) -> (FeatureSet, BTreeMap<String, String>) {
        let mut features = FeatureSet::new();
        let mut labels = BTreeMap::new();
        for nf in self.features.values().chain(self.pushed.get(node)).filter(|nf| nf.node_name == node) {
            features.merge_from(&nf.features);
            labels.extend(nf.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        (features, labels)
    }

    /// Desired, policy-filtered state for one node. Rule output wins over pushed labels.
    pub fn compute_node_update(&self, node: &str) -> NodeUpdateRequest {
        let (features, labels) = self.node_inputs(node);
        let ev = evaluate_rule_sets(node, self.rules.values(), &features);
        let mut req = NodeUpdateRequest::new(node);
        req.labels = labels;
        req.merge(ev.request);
        let cfg = self.config.current();
        let out = NamespaceFilter::new(&cfg).filter_request(req);
        debug!(
            node = %node,
            fired = ev.fired.len(),
            rule_errors = ev.errors.len(),
            labels = out.labels.len(),
            "master: computed node state"
        );
        out
    }

    fn update_node(&self, node: &str) {
        if node.is_empty() {
            return;
        }
        self.pool.enqueue(self.compute_node_update(node));
    }

    /// Store a direct push and queue the node. Returns the request that was queued.
    pub fn set_labels(&mut self, req: SetLabelsRequest) -> Result<NodeUpdateRequest> {
        if req.node_name.is_empty() {
            return Err(anyhow!("set labels: node name is empty"));
        }
        counter!("label_pushes_total", 1u64);
        debug!(node = %req.node_name, schema = %req.schema_version, labels = req.labels.len(), "master: labels pushed");
        let nf = NodeFeatures {
            object: String::new(),
            node_name: req.node_name.clone(),
            features: req.features.unwrap_or_default(),
            labels: req.labels,
        };
        self.pushed.insert(req.node_name.clone(), nf);
        let out = self.compute_node_update(&req.node_name);
        self.pool.enqueue(out.clone());
        Ok(out)
    }

    /// Apply one subscription event. Rule changes resync every node; feature changes only touch
    /// the nodes they describe.
    pub async fn handle_event(&mut self, ev: InputEvent) {
        match ev {
            InputEvent::Rules(ev) => {
                match ev {
                    SourceEvent::Applied(rs) => {
                        info!(rule_set = %rs.name, rules = rs.rules.len(), "master: rules applied");
                        self.rules.insert(rs.name.clone(), rs);
                    }
                    SourceEvent::Deleted(rs) => {
                        info!(rule_set = %rs.name, "master: rules deleted");
                        self.rules.remove(&rs.name);
                    }
                    SourceEvent::Restarted(list) => {
                        info!(count = list.len(), "master: rules relisted");
                        self.rules = list.into_iter().map(|rs| (rs.name.clone(), rs)).collect();
                    }
                }
                self.log_resync(self.resync_all().await);
            }
            InputEvent::Features(ev) => match ev {
                SourceEvent::Applied(nf) => {
                    let node = nf.node_name.clone();
                    let previous = self.features.insert(nf.object.clone(), nf);
                    if let Some(prev) = previous.filter(|p| p.node_name != node) {
                        self.update_node(&prev.node_name);
                    }
                    self.update_node(&node);
                }
                SourceEvent::Deleted(nf) => {
                    let removed = self.features.remove(&nf.object);
                    self.update_node(&removed.map(|r| r.node_name).unwrap_or(nf.node_name));
                }
                SourceEvent::Restarted(list) => {
                    let mut touched: BTreeSet<String> = self.features.values().map(|f| f.node_name.clone()).collect();
                    self.features = list.into_iter().map(|nf| (nf.object.clone(), nf)).collect();
                    touched.extend(self.features.values().map(|f| f.node_name.clone()));
                    for node in &touched {
                        self.update_node(node);
                    }
                }
            },
        }
    }

    fn log_resync(&self, res: Result<usize>) {
        if let Err(e) = res {
            warn!(error = %e, "master: resync failed");
        }
    }

    /// Queue a fresh desired state for every node in the cluster; does not wait for the patches.
    pub async fn resync_all(&self) -> Result<usize> {
        let nodes = self.store.list_nodes().await.context("listing nodes")?;
        let reqs: Vec<NodeUpdateRequest> = nodes.iter().map(|n| self.compute_node_update(&n.name)).collect();
        let queued = self.pool.enqueue_all(reqs);
        counter!("resyncs_total", 1u64);
        info!(nodes = nodes.len(), queued, "master: resync queued");
        Ok(queued)
    }

    /// Push the live configuration into the pool. Returns the resync period in effect.
    fn apply_config(&self) -> Duration {
        let cfg = self.config.current();
        self.pool.resize(cfg.api_parallelism);
        self.pool.set_no_publish(cfg.no_publish);
        cfg.resync_period
    }

    /// Main loop: subscription events, direct pushes, config changes and the resync timer until
    /// `cancel` fires. In-flight node updates finish before this returns.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<InputEvent>,
        mut pushes: mpsc::Receiver<SetLabelsRequest>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut epoch = self.config.subscribe();
        let mut period = self.apply_config();
        let mut resync = interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(resync_period = ?period, "master: started");
        self.log_resync(self.resync_all().await);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(ev) = events.recv() => self.handle_event(ev).await,
                Some(req) = pushes.recv() => {
                    if let Err(e) = self.set_labels(req) {
                        warn!(error = %e, "master: rejected label push");
                    }
                }
                Ok(()) = epoch.changed() => {
                    let next = self.apply_config();
                    if next != period {
                        period = next;
                        resync = interval_at(Instant::now() + period, period);
                        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                    info!(epoch = *epoch.borrow(), "master: config changed; resyncing");
                    self.log_resync(self.resync_all().await);
                }
                _ = resync.tick() => self.log_resync(self.resync_all().await),
            }
        }
        info!("master: shutting down");
        self.pool.shutdown().await;
        Ok(())
    }
}
