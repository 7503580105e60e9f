//! Discovered feature tables of a single node.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Presence-only table: an element is either there or not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagFeatureSet {
    #[serde(default)]
    pub elements: BTreeSet<String>,
}

/// Key/value table, e.g. `kernel.version` -> `{major: "6", minor: "1"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFeatureSet {
    #[serde(default)]
    pub elements: BTreeMap<String, String>,
}

/// One discovered occurrence inside an instance table (one PCI device, one NUMA node, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFeature {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFeatureSet {
    #[serde(default)]
    pub elements: Vec<InstanceFeature>,
}

/// Per-reconciliation snapshot of a node's discovered features, keyed by table name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    #[serde(default)]
    pub flags: BTreeMap<String, FlagFeatureSet>,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeFeatureSet>,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceFeatureSet>,
}

impl FeatureSet {
    pub fn new() -> Self { Self::default() }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.attributes.is_empty() && self.instances.is_empty()
    }

    pub fn insert_flag(&mut self, table: &str, element: &str) {
        self.flags.entry(table.to_string()).or_default().elements.insert(element.to_string());
    }

    pub fn insert_attribute(&mut self, table: &str, key: &str, value: &str) {
        self.attributes
            .entry(table.to_string())
            .or_default()
            .elements
            .insert(key.to_string(), value.to_string());
    }

    pub fn push_instance(&mut self, table: &str, attributes: BTreeMap<String, String>) {
        self.instances
            .entry(table.to_string())
            .or_default()
            .elements
            .push(InstanceFeature { attributes });
    }

    /// Overlay `other` on top of `self`: tables from `other` replace same-named tables.
    pub fn merge_from(&mut self, other: &FeatureSet) {
        for (k, v) in other.flags.iter() { self.flags.insert(k.clone(), v.clone()); }
        for (k, v) in other.attributes.iter() { self.attributes.insert(k.clone(), v.clone()); }
        for (k, v) in other.instances.iter() { self.instances.insert(k.clone(), v.clone()); }
    }
}

/// Input handed to the match evaluator.
///
/// Discovered data is mostly strings but rule authors and feature sources may also produce
/// booleans and integers; every variant coerces to one canonical string before comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchInput {
    String(String),
    Bool(bool),
    Integer(i64),
    Absent,
}

impl MatchInput {
    /// Canonical string form, `None` for `Absent`.
    pub fn canonical(&self) -> Option<Cow<'_, str>> {
        match self {
            MatchInput::String(s) => Some(Cow::Borrowed(s.as_str())),
            MatchInput::Bool(b) => Some(Cow::Borrowed(if *b { "true" } else { "false" })),
            MatchInput::Integer(i) => Some(Cow::Owned(i.to_string())),
            MatchInput::Absent => None,
        }
    }
}

impl From<&str> for MatchInput {
    fn from(s: &str) -> Self { MatchInput::String(s.to_string()) }
}

impl From<String> for MatchInput {
    fn from(s: String) -> Self { MatchInput::String(s) }
}

impl From<bool> for MatchInput {
    fn from(b: bool) -> Self { MatchInput::Bool(b) }
}

impl<T: Into<MatchInput>> From<Option<T>> for MatchInput {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(MatchInput::Absent) }
}
