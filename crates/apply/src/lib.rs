//! Patch generation: diff desired node state against the live node and emit the minimal set of
//! JSON patch operations, touching only names the reconciler owns.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use nodefeat_core::{
    add_default_ns, strip_default_ns, JsonPatchOp, Node, NodeUpdateRequest, PatchOp, Taint,
    EXTENDED_RESOURCE_ANNOTATION, FEATURE_ANNOTATIONS_TRACKING_ANNOTATION, FEATURE_LABELS_ANNOTATION, TAINTS_ANNOTATION,
};
use serde::{Deserialize, Serialize};

pub const LABELS_PATH: &str = "/metadata/labels";
pub const ANNOTATIONS_PATH: &str = "/metadata/annotations";
pub const TAINTS_PATH: &str = "/spec/taints";
pub const CAPACITY_PATH: &str = "/status/capacity";
pub const ALLOCATABLE_PATH: &str = "/status/allocatable";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

pub fn summarize<'a>(ops: impl IntoIterator<Item = &'a JsonPatchOp>) -> DiffSummary {
    let mut s = DiffSummary::default();
    for op in ops.into_iter().filter(|op| !op.is_resource_version()) {
        match op.op {
            PatchOp::Add => s.adds += 1,
            PatchOp::Replace => s.updates += 1,
            PatchOp::Remove => s.removes += 1,
        }
    }
    s
}

/// Add new keys, replace changed ones, and remove keys of `existing` that are missing from
/// `desired` but only when listed in `removable`.
pub fn create_patches<'a>(
    removable: impl IntoIterator<Item = &'a str>,
    existing: &BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    path: &str,
) -> Vec<JsonPatchOp> {
    let mut out = Vec::new();
    for key in removable {
        if existing.contains_key(key) && !desired.contains_key(key) {
            out.push(JsonPatchOp::remove(path, key));
        }
    }
    for (k, v) in desired {
        match existing.get(k) {
            None => out.push(JsonPatchOp::add(path, k, v.as_str())),
            Some(cur) if cur != v => out.push(JsonPatchOp::replace(path, k, v.as_str())),
            Some(_) => {}
        }
    }
    out
}

/// Plain map diff: every existing key not in `desired` is removed.
pub fn diff(existing: &BTreeMap<String, String>, desired: &BTreeMap<String, String>, path: &str) -> Vec<JsonPatchOp> {
    create_patches(existing.keys().map(String::as_str), existing, desired, path)
}

/// Status patches for extended resources, mirrored to capacity and allocatable. A desired empty
/// quantity counts as not wanted.
pub fn extended_resource_patches<'a>(
    node: &Node,
    desired: &BTreeMap<String, String>,
    removable: impl IntoIterator<Item = &'a str>,
) -> Vec<JsonPatchOp> {
    let wanted: BTreeMap<String, String> = desired.iter().filter(|(_, v)| !v.is_empty()).map(|(k, v)| (k.clone(), v.clone())).collect();
    let removable: Vec<&str> = removable.into_iter().collect();
    let mut out = create_patches(removable.iter().copied(), &node.capacity, &wanted, CAPACITY_PATH);
    out.extend(create_patches(removable.iter().copied(), &node.allocatable, &wanted, ALLOCATABLE_PATH));
    out
}

fn split_tracked(node: &Node, annotation: &str) -> BTreeSet<String> {
    node.annotations
        .get(annotation)
        .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(add_default_ns).collect())
        .unwrap_or_default()
}

/// Names the reconciler previously published on `node`, read back from its tracking annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Owned {
    pub labels: BTreeSet<String>,
    pub annotations: BTreeSet<String>,
    pub extended_resources: BTreeSet<String>,
    pub taints: BTreeSet<String>,
}

impl Owned {
    pub fn from_node(node: &Node) -> Self {
        Self {
            labels: split_tracked(node, FEATURE_LABELS_ANNOTATION),
            annotations: split_tracked(node, FEATURE_ANNOTATIONS_TRACKING_ANNOTATION),
            extended_resources: split_tracked(node, EXTENDED_RESOURCE_ANNOTATION),
            taints: node
                .annotations
                .get(TAINTS_ANNOTATION)
                .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

fn join_names<'a>(names: impl IntoIterator<Item = &'a String>) -> String {
    let set: BTreeSet<&str> = names.into_iter().map(|n| strip_default_ns(n)).collect();
    set.into_iter().collect::<Vec<_>>().join(",")
}

/// Bookkeeping annotations describing what `req` publishes. Empty lists are left out.
pub fn tracking_annotations(req: &NodeUpdateRequest) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut put = |key: &str, value: String| {
        if !value.is_empty() {
            out.insert(key.to_string(), value);
        }
    };
    put(FEATURE_LABELS_ANNOTATION, join_names(req.labels.keys()));
    put(FEATURE_ANNOTATIONS_TRACKING_ANNOTATION, join_names(req.annotations.keys()));
    put(
        EXTENDED_RESOURCE_ANNOTATION,
        join_names(req.extended_resources.iter().filter(|(_, v)| !v.is_empty()).map(|(k, _)| k)),
    );
    let ids: BTreeSet<String> = req.taints.iter().map(Taint::id).collect();
    put(TAINTS_ANNOTATION, ids.into_iter().collect::<Vec<_>>().join(","));
    out
}

/// New taint list: foreign taints kept in place, owned ones replaced by `desired`. `None` when
/// nothing changes.
pub fn merge_taints(node: &Node, desired: &[Taint], owned: &BTreeSet<String>) -> Option<Vec<Taint>> {
    let desired_ids: BTreeSet<String> = desired.iter().map(Taint::id).collect();
    let mut next: Vec<Taint> = node
        .taints
        .iter()
        .filter(|t| {
            let id = t.id();
            !owned.contains(&id) && !desired_ids.contains(&id)
        })
        .cloned()
        .collect();
    let mut wanted: Vec<Taint> = desired.to_vec();
    wanted.sort();
    wanted.dedup_by(|a, b| a.id() == b.id());
    next.extend(wanted);
    let same = next.len() == node.taints.len() && next.iter().all(|t| node.taints.contains(t));
    (!same).then_some(next)
}

/// Operations for the node object and for its status subresource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePatches {
    pub metadata: Vec<JsonPatchOp>,
    pub status: Vec<JsonPatchOp>,
}

impl NodePatches {
    pub fn is_empty(&self) -> bool { self.metadata.is_empty() && self.status.is_empty() }
    pub fn len(&self) -> usize { self.metadata.len() + self.status.len() }
    pub fn summary(&self) -> DiffSummary { summarize(self.metadata.iter().chain(self.status.iter())) }
}

/// Everything needed to move `node` to the state described by `req`.
pub fn plan_node_patches(node: &Node, req: &NodeUpdateRequest) -> NodePatches {
    let owned = Owned::from_node(node);
    let mut metadata = create_patches(owned.labels.iter().map(String::as_str), &node.labels, &req.labels, LABELS_PATH);

    let mut annotations = req.annotations.clone();
    annotations.extend(tracking_annotations(req));
    let bookkeeping = [FEATURE_LABELS_ANNOTATION, FEATURE_ANNOTATIONS_TRACKING_ANNOTATION, EXTENDED_RESOURCE_ANNOTATION, TAINTS_ANNOTATION];
    let removable = owned.annotations.iter().map(String::as_str).chain(bookkeeping);
    metadata.extend(create_patches(removable, &node.annotations, &annotations, ANNOTATIONS_PATH));

    // The taint list is written whole, so it must not land on a node whose taints moved since
    // the read.
    if let Some(taints) = merge_taints(node, &req.taints, &owned.taints) {
        if let Some(rv) = &node.resource_version {
            metadata.insert(0, JsonPatchOp::resource_version(rv));
        }
        let value = serde_json::to_value(&taints).unwrap_or(serde_json::Value::Array(Vec::new()));
        metadata.push(JsonPatchOp::add(TAINTS_PATH, "", value));
    }

    let status = extended_resource_patches(node, &req.extended_resources, owned.extended_resources.iter().map(String::as_str));
    NodePatches { metadata, status }
}
