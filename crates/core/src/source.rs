//! Inbound events from rule objects and per-node feature objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::features::FeatureSet;
use crate::rule::RuleSet;

/// Features and labels published for one node by one feature object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFeatures {
    /// Name of the object that carried them; a node may be described by several objects.
    pub object: String,
    pub node_name: String,
    #[serde(default)]
    pub features: FeatureSet,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Restartable list/watch event. `Restarted` carries the full current list and replaces
/// everything seen before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent<T> {
    Applied(T),
    Deleted(T),
    Restarted(Vec<T>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Rules(SourceEvent<RuleSet>),
    Features(SourceEvent<NodeFeatures>),
}
