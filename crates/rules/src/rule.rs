//! Rule execution: term matching across feature tables, dynamic value references and merging of
//! fired rules into one desired-state request.

use std::collections::BTreeMap;

use metrics::counter;
use nodefeat_core::{
    add_default_ns, FeatureMatcherTerm, FeatureSet, InstanceFeature, NodeUpdateRequest, Rule, RuleSet, Taint,
    FEATURE_ANNOTATION_NS, FEATURE_LABEL_NS, RULE_MATCHED_FEATURE,
};
use tracing::{debug, warn};

use crate::expression::{match_instances, match_keys, match_values, ExpressionError};

/// Prefix marking a template value as a reference to a feature element.
pub const DYNAMIC_VALUE_SIGIL: char = '@';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("rule {rule:?}: feature {feature:?}: {source}")]
    Validation {
        rule: String,
        feature: String,
        #[source]
        source: ExpressionError,
    },
    #[error("rule {rule:?}: {reason}")]
    DynamicReference { rule: String, reason: String },
}

/// What a fired rule contributes, with templates resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutput {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub extended_resources: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub vars: BTreeMap<String, String>,
}

/// Instances matched per instance table while evaluating one rule.
type MatchedInstances<'a> = BTreeMap<&'a str, Vec<&'a InstanceFeature>>;

/// `None` when the term does not match; otherwise the matched instances (empty for flag and
/// attribute tables). A table missing from `features` is treated as empty.
fn match_term<'a>(
    term: &FeatureMatcherTerm,
    features: &'a FeatureSet,
) -> Result<Option<Vec<&'a InstanceFeature>>, ExpressionError> {
    let set = &term.match_expressions;
    if let Some(flags) = features.flags.get(&term.feature) {
        return Ok(match_keys(set, &flags.elements)?.then(Vec::new));
    }
    if let Some(attrs) = features.attributes.get(&term.feature) {
        return Ok(match_values(set, &attrs.elements)?.then(Vec::new));
    }
    if let Some(instances) = features.instances.get(&term.feature) {
        let hits = match_instances(set, &instances.elements)?;
        return Ok((!hits.is_empty()).then_some(hits));
    }
    Ok(match_values(set, &BTreeMap::new())?.then(Vec::new))
}

fn match_terms<'a>(
    rule: &Rule,
    terms: &[FeatureMatcherTerm],
    features: &'a FeatureSet,
    matched: &mut MatchedInstances<'a>,
) -> Result<bool, RuleError> {
    let mut local: MatchedInstances<'a> = BTreeMap::new();
    for term in terms {
        let res = match_term(term, features).map_err(|source| RuleError::Validation {
            rule: rule.name.clone(),
            feature: term.feature.clone(),
            source,
        })?;
        match res {
            None => return Ok(false),
            Some(hits) if !hits.is_empty() => {
                if let Some((name, _)) = features.instances.get_key_value(&term.feature) {
                    local.entry(name.as_str()).or_default().extend(hits);
                }
            }
            Some(_) => {}
        }
    }
    for (k, v) in local {
        matched.entry(k).or_default().extend(v);
    }
    Ok(true)
}

/// Resolve `@<table>.<element>`; other values are returned as is. The table name is everything
/// before the last `.`. Lookup order: attribute table, first matched instance, flag table.
pub fn resolve_dynamic_value(
    value: &str,
    features: &FeatureSet,
    matched: &BTreeMap<&str, Vec<&InstanceFeature>>,
) -> Result<String, String> {
    let Some(reference) = value.strip_prefix(DYNAMIC_VALUE_SIGIL) else {
        return Ok(value.to_string());
    };
    let (table, element) = reference
        .rsplit_once('.')
        .filter(|(t, e)| !t.is_empty() && !e.is_empty())
        .ok_or_else(|| format!("invalid dynamic reference {:?}: expected @<feature>.<element>", value))?;
    if let Some(v) = features.attributes.get(table).and_then(|a| a.elements.get(element)) {
        return Ok(v.clone());
    }
    if let Some(v) = matched.get(table).and_then(|m| m.first()).and_then(|i| i.attributes.get(element)) {
        return Ok(v.clone());
    }
    if features.flags.get(table).is_some_and(|f| f.elements.contains(element)) {
        return Ok("true".to_string());
    }
    Err(format!("dynamic reference {:?}: element {:?} not found in feature {:?}", value, element, table))
}

fn resolve_map(
    rule: &Rule,
    templates: &BTreeMap<String, String>,
    features: &FeatureSet,
    matched: &MatchedInstances<'_>,
) -> Result<BTreeMap<String, String>, RuleError> {
    templates
        .iter()
        .map(|(k, v)| {
            resolve_dynamic_value(v, features, matched)
                .map(|v| (k.clone(), v))
                .map_err(|reason| RuleError::DynamicReference { rule: rule.name.clone(), reason })
        })
        .collect()
}

/// Execute a single rule. `Ok(None)` means the rule did not fire.
pub fn execute_rule(rule: &Rule, features: &FeatureSet) -> Result<Option<RuleOutput>, RuleError> {
    let mut matched: MatchedInstances<'_> = BTreeMap::new();
    if !match_terms(rule, &rule.match_features, features, &mut matched)? {
        return Ok(None);
    }
    if !rule.match_any.is_empty() {
        let mut any = false;
        for alt in &rule.match_any {
            if match_terms(rule, &alt.match_features, features, &mut matched)? {
                any = true;
                break;
            }
        }
        if !any {
            return Ok(None);
        }
    }
    Ok(Some(RuleOutput {
        labels: resolve_map(rule, &rule.labels, features, &matched)?,
        annotations: resolve_map(rule, &rule.annotations, features, &matched)?,
        extended_resources: resolve_map(rule, &rule.extended_resources, features, &matched)?,
        taints: rule.taints.clone(),
        vars: resolve_map(rule, &rule.vars, features, &matched)?,
    }))
}

/// Result of evaluating every rule for one node.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub request: NodeUpdateRequest,
    pub fired: Vec<String>,
    pub errors: Vec<RuleError>,
}

fn with_default_ns(m: BTreeMap<String, String>, ns: &str) -> BTreeMap<String, String> {
    m.into_iter()
        .map(|(k, v)| if k.contains('/') { (k, v) } else { (format!("{}/{}", ns, k), v) })
        .collect()
}

/// Evaluate rule sets in name order, rules in declaration order. Fired rules merge with
/// last-writer-wins; failing rules are logged and contribute nothing. Labels and vars of each
/// fired rule are visible to later rules through the `rule.matched` attribute table.
pub fn evaluate_rule_sets<'a>(
    node_name: &str,
    rule_sets: impl IntoIterator<Item = &'a RuleSet>,
    features: &FeatureSet,
) -> Evaluation {
    let mut sets: Vec<&RuleSet> = rule_sets.into_iter().collect();
    sets.sort_by(|a, b| a.name.cmp(&b.name));

    let mut working = features.clone();
    let mut out = Evaluation { request: NodeUpdateRequest::new(node_name), ..Default::default() };
    for set in sets {
        for rule in &set.rules {
            match execute_rule(rule, &working) {
                Ok(Some(o)) => {
                    debug!(node = %node_name, rule_set = %set.name, rule = %rule.name, "rules: fired");
                    for (k, v) in o.labels.iter().chain(o.vars.iter()) {
                        working.insert_attribute(RULE_MATCHED_FEATURE, k, v);
                    }
                    out.fired.push(rule.name.clone());
                    out.request.merge(NodeUpdateRequest {
                        node_name: node_name.to_string(),
                        labels: with_default_ns(o.labels, FEATURE_LABEL_NS),
                        annotations: with_default_ns(o.annotations, FEATURE_ANNOTATION_NS),
                        extended_resources: o.extended_resources.into_iter().map(|(k, v)| (add_default_ns(&k), v)).collect(),
                        taints: o.taints,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(node = %node_name, rule_set = %set.name, error = %e, "rules: rule failed; output dropped");
                    counter!("rule_errors_total", 1u64);
                    out.errors.push(e);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodefeat_core::{MatchAnyElem, MatchExpression, MatchExpressionSet, MatchOp, TaintEffect};

    fn term(feature: &str, exprs: &[(&str, MatchOp, &[&str])]) -> FeatureMatcherTerm {
        let mut set = MatchExpressionSet::new();
        for (k, op, vals) in exprs {
            set.insert(k.to_string(), MatchExpression::new(op.clone(), vals.iter().copied()));
        }
        FeatureMatcherTerm { feature: feature.to_string(), match_expressions: set }
    }

    fn features() -> FeatureSet {
        let mut f = FeatureSet::new();
        f.insert_flag("cpu.cpuid", "AVX");
        f.insert_flag("cpu.cpuid", "AVX2");
        f.insert_attribute("kernel.version", "major", "6");
        f.insert_attribute("test.feature", "LSM", "123");
        f.push_instance("pci.device", [("vendor".to_string(), "8086".to_string())].into_iter().collect());
        f.push_instance(
            "pci.device",
            [("vendor".to_string(), "10de".to_string()), ("device".to_string(), "20b0".to_string())].into_iter().collect(),
        );
        f
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn rule_fires_only_when_all_tables_match() {
        let mut rule = Rule {
            name: "avx".into(),
            match_features: vec![
                term("cpu.cpuid", &[("AVX2", MatchOp::Exists, &[])]),
                term("kernel.version", &[("major", MatchOp::Gt, &["4"])]),
            ],
            labels: labels(&[("avx2", "true")]),
            ..Default::default()
        };
        let out = execute_rule(&rule, &features()).unwrap().unwrap();
        assert_eq!(out.labels["avx2"], "true");

        rule.match_features.push(term("cpu.cpuid", &[("AVX512F", MatchOp::Exists, &[])]));
        assert_eq!(execute_rule(&rule, &features()).unwrap(), None);
    }

    #[test]
    fn missing_table_only_matches_does_not_exist() {
        let rule = Rule {
            name: "no-gpu".into(),
            match_features: vec![term("gpu.info", &[("model", MatchOp::DoesNotExist, &[])])],
            labels: labels(&[("no-gpu", "true")]),
            ..Default::default()
        };
        assert!(execute_rule(&rule, &features()).unwrap().is_some());
        let rule = Rule { match_features: vec![term("gpu.info", &[("model", MatchOp::In, &["a100"])])], ..rule };
        assert!(execute_rule(&rule, &features()).unwrap().is_none());
    }

    #[test]
    fn dynamic_values_resolve_from_attributes_instances_and_flags() {
        let rule = Rule {
            name: "dyn".into(),
            match_features: vec![term("pci.device", &[("vendor", MatchOp::In, &["10de"])])],
            labels: labels(&[("lsm", "@test.feature.LSM"), ("gpu", "@pci.device.device"), ("avx", "@cpu.cpuid.AVX")]),
            ..Default::default()
        };
        let out = execute_rule(&rule, &features()).unwrap().unwrap();
        assert_eq!(out.labels["lsm"], "123");
        assert_eq!(out.labels["gpu"], "20b0");
        assert_eq!(out.labels["avx"], "true");
    }

    #[test]
    fn unresolvable_references_are_errors() {
        let m = BTreeMap::new();
        assert!(resolve_dynamic_value("@invalid", &FeatureSet::new(), &m).is_err());
        assert!(resolve_dynamic_value("@test.feature.LSM", &FeatureSet::new(), &m).is_err());
        assert_eq!(resolve_dynamic_value("@test.feature.LSM", &features(), &m).unwrap(), "123");
        assert_eq!(resolve_dynamic_value("plain", &FeatureSet::new(), &m).unwrap(), "plain");
    }

    #[test]
    fn match_any_requires_one_alternative() {
        let rule = Rule {
            name: "any".into(),
            match_any: vec![
                MatchAnyElem { match_features: vec![term("cpu.cpuid", &[("SSE9", MatchOp::Exists, &[])])] },
                MatchAnyElem { match_features: vec![term("cpu.cpuid", &[("AVX", MatchOp::Exists, &[])])] },
            ],
            labels: labels(&[("any", "yes")]),
            ..Default::default()
        };
        assert!(execute_rule(&rule, &features()).unwrap().is_some());
        let rule = Rule { match_any: vec![rule.match_any[0].clone()], ..rule };
        assert!(execute_rule(&rule, &features()).unwrap().is_none());
    }

    #[test]
    fn failing_rule_is_isolated_and_later_rules_win() {
        let good = Rule {
            name: "a".into(),
            match_features: vec![term("cpu.cpuid", &[("AVX", MatchOp::Exists, &[])])],
            labels: labels(&[("shared", "first"), ("only-a", "1")]),
            taints: vec![Taint { key: "example.io/t".into(), value: "v".into(), effect: TaintEffect::NoSchedule }],
            ..Default::default()
        };
        let bad = Rule {
            name: "b".into(),
            match_features: vec![term("kernel.version", &[("major", MatchOp::GtLt, &["9", "1"])])],
            labels: labels(&[("bad", "1")]),
            ..Default::default()
        };
        let later = Rule { name: "c".into(), labels: labels(&[("shared", "second"), ("example.io/x", "y")]), ..Default::default() };
        let dangling = Rule { name: "d".into(), labels: labels(&[("dangling", "@nope.x")]), ..Default::default() };
        let rs = RuleSet { name: "set-1".into(), rules: vec![good, bad, later, dangling] };

        let ev = evaluate_rule_sets("node-1", [&rs], &features());
        assert_eq!(ev.fired, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(ev.errors.len(), 2);
        assert!(matches!(ev.errors[0], RuleError::Validation { .. }));
        assert!(matches!(ev.errors[1], RuleError::DynamicReference { .. }));
        let l = &ev.request.labels;
        assert_eq!(l["feature.node.kubernetes.io/shared"], "second");
        assert_eq!(l["feature.node.kubernetes.io/only-a"], "1");
        assert_eq!(l["example.io/x"], "y");
        assert!(!l.contains_key("feature.node.kubernetes.io/bad"));
        assert_eq!(ev.request.taints.len(), 1);
    }

    #[test]
    fn unknown_operator_fails_only_its_rule() {
        let rs = RuleSet {
            name: "mixed".into(),
            rules: vec![
                Rule {
                    name: "good".into(),
                    match_features: vec![term("cpu.cpuid", &[("AVX", MatchOp::Exists, &[])])],
                    labels: labels(&[("good", "true")]),
                    ..Default::default()
                },
                Rule {
                    name: "typo".into(),
                    match_features: vec![term("cpu.cpuid", &[("AVX", MatchOp::Unknown("exists".into()), &[])])],
                    labels: labels(&[("typo", "true")]),
                    ..Default::default()
                },
            ],
        };
        let ev = evaluate_rule_sets("node-1", [&rs], &features());
        assert_eq!(ev.fired, vec!["good".to_string()]);
        assert_eq!(ev.request.labels["feature.node.kubernetes.io/good"], "true");
        assert!(!ev.request.labels.contains_key("feature.node.kubernetes.io/typo"));
        match &ev.errors[..] {
            [RuleError::Validation { rule, source: ExpressionError::UnknownOp(op), .. }] => {
                assert_eq!(rule, "typo");
                assert_eq!(op, "exists");
            }
            other => panic!("unexpected errors {other:?}"),
        }
    }

    #[test]
    fn rule_sets_run_in_name_order_and_chain_through_rule_matched() {
        let first = RuleSet {
            name: "a-base".into(),
            rules: vec![Rule {
                name: "base".into(),
                vars: labels(&[("accel", "true")]),
                labels: labels(&[("base", "on")]),
                ..Default::default()
            }],
        };
        let second = RuleSet {
            name: "b-derived".into(),
            rules: vec![Rule {
                name: "derived".into(),
                match_features: vec![term(RULE_MATCHED_FEATURE, &[("accel", MatchOp::IsTrue, &[])])],
                labels: labels(&[("derived", "@rule.matched.base")]),
                ..Default::default()
            }],
        };
        let ev = evaluate_rule_sets("n", [&second, &first], &FeatureSet::new());
        assert_eq!(ev.fired, vec!["base".to_string(), "derived".to_string()]);
        assert_eq!(ev.request.labels["feature.node.kubernetes.io/derived"], "on");
        assert!(!ev.request.labels.contains_key("feature.node.kubernetes.io/accel"));
    }
}
