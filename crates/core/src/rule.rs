//! Declarative rule types: match expressions, rules and taints.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Operator of a single match expression. Unrecognized names are kept as `Unknown` so a typo
/// fails only the rule that carries it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MatchOp {
    Any,
    In,
    NotIn,
    InRegexp,
    Exists,
    DoesNotExist,
    Gt,
    Lt,
    GtLt,
    IsTrue,
    IsFalse,
    Unknown(String),
}

impl MatchOp {
    pub const ALL: [MatchOp; 11] = [
        MatchOp::Any,
        MatchOp::In,
        MatchOp::NotIn,
        MatchOp::InRegexp,
        MatchOp::Exists,
        MatchOp::DoesNotExist,
        MatchOp::Gt,
        MatchOp::Lt,
        MatchOp::GtLt,
        MatchOp::IsTrue,
        MatchOp::IsFalse,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            MatchOp::Any => "Any",
            MatchOp::In => "In",
            MatchOp::NotIn => "NotIn",
            MatchOp::InRegexp => "InRegexp",
            MatchOp::Exists => "Exists",
            MatchOp::DoesNotExist => "DoesNotExist",
            MatchOp::Gt => "Gt",
            MatchOp::Lt => "Lt",
            MatchOp::GtLt => "GtLt",
            MatchOp::IsTrue => "IsTrue",
            MatchOp::IsFalse => "IsFalse",
            MatchOp::Unknown(s) => s.as_str(),
        }
    }
}

impl fmt::Display for MatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown match operator {0:?}")]
pub struct UnknownOp(pub String);

impl FromStr for MatchOp {
    type Err = UnknownOp;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchOp::ALL.iter().find(|op| op.as_str() == s).cloned().ok_or_else(|| UnknownOp(s.to_string()))
    }
}

impl From<String> for MatchOp {
    fn from(s: String) -> Self { s.parse().unwrap_or(MatchOp::Unknown(s)) }
}

impl From<MatchOp> for String {
    fn from(op: MatchOp) -> Self {
        match op {
            MatchOp::Unknown(s) => s,
            op => op.as_str().to_string(),
        }
    }
}

/// `{op, values}`; `value` is accepted as an alias on input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub op: MatchOp,
    #[serde(default, alias = "value", skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl MatchExpression {
    pub fn new<I, S>(op: MatchOp, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { op, values: values.into_iter().map(Into::into).collect() }
    }

    pub fn op(op: MatchOp) -> Self { Self { op, values: Vec::new() } }
}

/// Element name -> expression, ANDed. Empty set matches trivially.
pub type MatchExpressionSet = BTreeMap<String, MatchExpression>;

/// One `matchFeatures` term: a feature table plus the expressions applied to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMatcherTerm {
    pub feature: String,
    #[serde(default)]
    pub match_expressions: MatchExpressionSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAnyElem {
    #[serde(default)]
    pub match_features: Vec<FeatureMatcherTerm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

impl TaintEffect {
    pub fn as_str(&self) -> &str {
        match self {
            TaintEffect::NoSchedule => "NoSchedule",
            TaintEffect::PreferNoSchedule => "PreferNoSchedule",
            TaintEffect::NoExecute => "NoExecute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    /// Identity used for ownership tracking: `key:effect`.
    pub fn id(&self) -> String { format!("{}:{}", self.key, self.effect.as_str()) }
}

/// A single rule. Label/annotation/resource values may be dynamic references (`@table.element`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub match_features: Vec<FeatureMatcherTerm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_any: Vec<MatchAnyElem>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended_resources: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,
}

/// Named group of rules as delivered by one rule object (custom resource).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_round_trips_through_str() {
        for op in MatchOp::ALL {
            assert_eq!(op.as_str().parse::<MatchOp>().unwrap(), op);
        }
        assert!("non-existent-op".parse::<MatchOp>().is_err());
    }

    #[test]
    fn rule_deserializes_from_yaml_like_json() {
        let v = serde_json::json!({
            "name": "avx-rule",
            "matchFeatures": [
                { "feature": "cpu.cpuid", "matchExpressions": { "AVX": { "op": "Exists" } } },
                { "feature": "kernel.version", "matchExpressions": { "major": { "op": "Gt", "value": ["4"] } } }
            ],
            "labels": { "example.io/avx": "true" },
            "taints": [ { "key": "example.io/special", "effect": "NoSchedule" } ]
        });
        let r: Rule = serde_json::from_value(v).unwrap();
        assert_eq!(r.match_features.len(), 2);
        assert_eq!(r.match_features[1].match_expressions["major"].values, vec!["4".to_string()]);
        assert_eq!(r.taints[0].id(), "example.io/special:NoSchedule");
    }

    #[test]
    fn unknown_operator_is_kept_verbatim() {
        let v = serde_json::json!({ "op": "exists", "value": ["1"] });
        let e: MatchExpression = serde_json::from_value(v).unwrap();
        assert_eq!(e.op, MatchOp::Unknown("exists".into()));
        assert_eq!(serde_json::to_value(&e).unwrap()["op"], "exists");
        let e: MatchExpression = serde_json::from_value(serde_json::json!({ "op": "Exists" })).unwrap();
        assert_eq!(e.op, MatchOp::Exists);
        assert!(serde_json::from_value::<MatchExpression>(serde_json::json!({ "op": 3 })).is_err());
    }
}
