//! Node-store collaborator: the only way the reconciler reads or writes cluster nodes.

use async_trait::async_trait;

use crate::node::Node;
use crate::patch::JsonPatchOp;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Optimistic-concurrency failure; the caller should re-read and retry.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Patch `/metadata` and `/spec` fields.
    async fn patch_node(&self, name: &str, patches: &[JsonPatchOp]) -> Result<(), StoreError>;

    /// Patch the status subresource (`/status/capacity`, `/status/allocatable`).
    async fn patch_node_status(&self, name: &str, patches: &[JsonPatchOp]) -> Result<(), StoreError>;
}
