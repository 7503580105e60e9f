//! In-memory `NodeStore` used by tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::node::Node;
use crate::patch::{to_json_patch, JsonPatchOp};
use crate::store::{NodeStore, StoreError};

/// One accepted patch call, in the order the store observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchRecord {
    pub node: String,
    pub status: bool,
    pub ops: Vec<JsonPatchOp>,
}

#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    conflicts: Mutex<BTreeMap<String, u32>>,
    active: Mutex<BTreeMap<String, usize>>,
    log: Mutex<Vec<PatchRecord>>,
    latency: Duration,
    max_active_per_node: AtomicUsize,
    rv: AtomicU64,
}

struct ActiveGuard<'a> {
    store: &'a MemoryNodeStore,
    node: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.store.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(n) = active.get_mut(&self.node) {
            *n = n.saturating_sub(1);
        }
    }
}

impl MemoryNodeStore {
    pub fn new() -> Self { Self::default() }

    /// Every patch call sleeps for `latency` before applying, which makes overlap observable.
    pub fn with_latency(latency: Duration) -> Self { Self { latency, ..Default::default() } }

    /// Store `node` under a fresh resource version.
    pub fn insert(&self, mut node: Node) {
        node.resource_version = Some(self.next_rv());
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).insert(node.name.clone(), node);
    }

    fn next_rv(&self) -> String { (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Make the next `n` patch calls for `node` fail with a conflict.
    pub fn inject_conflicts(&self, node: &str, n: u32) {
        self.conflicts.lock().unwrap_or_else(|e| e.into_inner()).insert(node.to_string(), n);
    }

    pub fn patch_log(&self) -> Vec<PatchRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Highest number of concurrent patch calls ever observed for a single node.
    pub fn max_concurrent_patches(&self) -> usize { self.max_active_per_node.load(Ordering::SeqCst) }

    fn enter(&self, name: &str) -> ActiveGuard<'_> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let n = active.entry(name.to_string()).or_insert(0);
        *n += 1;
        self.max_active_per_node.fetch_max(*n, Ordering::SeqCst);
        ActiveGuard { store: self, node: name.to_string() }
    }

    fn take_conflict(&self, name: &str) -> bool {
        let mut c = self.conflicts.lock().unwrap_or_else(|e| e.into_inner());
        match c.get_mut(name) {
            Some(n) if *n > 0 => { *n -= 1; true }
            _ => false,
        }
    }

    async fn apply(&self, name: &str, patches: &[JsonPatchOp], status: bool) -> Result<(), StoreError> {
        let _guard = self.enter(name);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        for p in patches {
            let is_status = p.path.starts_with("/status");
            if is_status != status {
                return Err(StoreError::Other(anyhow!("patch path {} not allowed on this endpoint", p.pointer())));
            }
        }
        if self.take_conflict(name) {
            return Err(StoreError::Conflict(format!("node {} was modified concurrently", name)));
        }
        let patch = to_json_patch(patches).map_err(|e| StoreError::Other(e.into()))?;
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let node = nodes.get_mut(name).ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let pinned = patches.iter().find(|p| p.is_resource_version()).and_then(|p| p.value.as_ref()).and_then(|v| v.as_str());
        if let Some(rv) = pinned {
            if node.resource_version.as_deref() != Some(rv) {
                return Err(StoreError::Conflict(format!(
                    "node {} is at version {}, patch expects {}",
                    name,
                    node.resource_version.as_deref().unwrap_or("none"),
                    rv
                )));
            }
        }
        let mut doc = node.to_json();
        json_patch::patch(&mut doc, &patch.0).map_err(|e| StoreError::Other(anyhow!("applying patch: {}", e)))?;
        let mut updated = Node::from_json(doc).map_err(|e| StoreError::Other(e.into()))?;
        updated.resource_version = Some(self.next_rv());
        *node = updated;
        self.log.lock().unwrap_or_else(|e| e.into_inner()).push(PatchRecord {
            node: name.to_string(),
            status,
            ops: patches.to_vec(),
        });
        Ok(())
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.node(name).ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.lock().unwrap_or_else(|e| e.into_inner()).values().cloned().collect())
    }

    async fn patch_node(&self, name: &str, patches: &[JsonPatchOp]) -> Result<(), StoreError> {
        self.apply(name, patches, false).await
    }

    async fn patch_node_status(&self, name: &str, patches: &[JsonPatchOp]) -> Result<(), StoreError> {
        self.apply(name, patches, true).await
    }
}
