//! Node snapshot as seen by the reconciler and the desired-state delta computed for it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::rule::Taint;

/// Extended resource name -> quantity. An empty quantity means "not wanted".
pub type ExtendedResources = BTreeMap<String, String>;

/// The parts of a cluster node the reconciler reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub resource_version: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub capacity: BTreeMap<String, String>,
    pub allocatable: BTreeMap<String, String>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeMetaDoc {
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Default, Serialize, Deserialize)]
struct NodeSpecDoc {
    #[serde(default)]
    taints: Vec<Taint>,
}

#[derive(Default, Serialize, Deserialize)]
struct NodeStatusDoc {
    #[serde(default)]
    capacity: BTreeMap<String, String>,
    #[serde(default)]
    allocatable: BTreeMap<String, String>,
}

#[derive(Default, Serialize, Deserialize)]
struct NodeDoc {
    #[serde(default)]
    metadata: NodeMetaDoc,
    #[serde(default)]
    spec: NodeSpecDoc,
    #[serde(default)]
    status: NodeStatusDoc,
}

impl Node {
    pub fn new(name: &str) -> Self { Self { name: name.to_string(), ..Default::default() } }

    /// Render in the Kubernetes object layout that JSON patch paths address
    /// (`/metadata/labels`, `/spec/taints`, `/status/capacity`, ...). All maps are present even
    /// when empty so that `add` operations always have a parent.
    pub fn to_json(&self) -> serde_json::Value {
        let doc = NodeDoc {
            metadata: NodeMetaDoc {
                name: self.name.clone(),
                resource_version: self.resource_version.clone(),
                labels: self.labels.clone(),
                annotations: self.annotations.clone(),
            },
            spec: NodeSpecDoc { taints: self.taints.clone() },
            status: NodeStatusDoc { capacity: self.capacity.clone(), allocatable: self.allocatable.clone() },
        };
        serde_json::to_value(doc).unwrap_or(serde_json::Value::Null)
    }

    pub fn from_json(v: serde_json::Value) -> Result<Self, serde_json::Error> {
        let doc: NodeDoc = serde_json::from_value(v)?;
        Ok(Self {
            name: doc.metadata.name,
            resource_version: doc.metadata.resource_version,
            labels: doc.metadata.labels,
            annotations: doc.metadata.annotations,
            taints: doc.spec.taints,
            capacity: doc.status.capacity,
            allocatable: doc.status.allocatable,
        })
    }
}

/// Desired state for one node, produced by rule evaluation and direct label pushes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdateRequest {
    pub node_name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub extended_resources: ExtendedResources,
    #[serde(default)]
    pub taints: Vec<Taint>,
}

impl NodeUpdateRequest {
    pub fn new(node_name: &str) -> Self { Self { node_name: node_name.to_string(), ..Default::default() } }

    /// Union-merge `other` into `self`; keys from `other` win, taints are deduplicated by id.
    pub fn merge(&mut self, other: NodeUpdateRequest) {
        self.labels.extend(other.labels);
        self.annotations.extend(other.annotations);
        self.extended_resources.extend(other.extended_resources);
        for t in other.taints {
            if let Some(existing) = self.taints.iter_mut().find(|x| x.id() == t.id()) {
                *existing = t;
            } else {
                self.taints.push(t);
            }
        }
    }
}
