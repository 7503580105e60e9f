//! Match expression evaluation and the adapters over flag, attribute and instance tables.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use nodefeat_core::{InstanceFeature, MatchExpression, MatchExpressionSet, MatchInput, MatchOp};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpressionError {
    #[error("{op}: expected {expected} value(s), got {got}")]
    Arity { op: MatchOp, expected: &'static str, got: usize },
    #[error("invalid regexp {pattern:?}: {reason}")]
    Regex { pattern: String, reason: String },
    #[error("not an integer: {0:?}")]
    NotInteger(String),
    #[error("GtLt bounds not ordered: {0} >= {1}")]
    UnorderedRange(i64, i64),
    #[error("{0}: input value missing")]
    MissingInput(MatchOp),
    #[error("operator {0} not applicable to presence-only data")]
    NotApplicable(MatchOp),
    #[error("unknown match operator {0:?}")]
    UnknownOp(String),
}

const REGEX_CACHE_CAP: usize = 512;

static REGEX_CACHE: Lazy<Mutex<FxHashMap<String, Arc<Regex>>>> = Lazy::new(|| Mutex::new(FxHashMap::default()));

fn compile(pattern: &str) -> Result<Arc<Regex>, ExpressionError> {
    let mut cache = REGEX_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(re) = cache.get(pattern) {
        return Ok(Arc::clone(re));
    }
    let re = Regex::new(pattern)
        .map(Arc::new)
        .map_err(|e| ExpressionError::Regex { pattern: pattern.to_string(), reason: e.to_string() })?;
    if cache.len() >= REGEX_CACHE_CAP {
        cache.clear();
    }
    cache.insert(pattern.to_string(), Arc::clone(&re));
    Ok(re)
}

/// Base-10 integer; fractions, blanks and trailing garbage are rejected.
fn parse_int(s: &str) -> Result<i64, ExpressionError> {
    s.parse::<i64>().map_err(|_| ExpressionError::NotInteger(s.to_string()))
}

fn check_arity(expr: &MatchExpression) -> Result<(), ExpressionError> {
    let got = expr.values.len();
    let (ok, expected) = match &expr.op {
        MatchOp::Any | MatchOp::Exists | MatchOp::DoesNotExist | MatchOp::IsTrue | MatchOp::IsFalse => (got == 0, "0"),
        MatchOp::In | MatchOp::NotIn | MatchOp::InRegexp => (got >= 1, ">=1"),
        MatchOp::Gt | MatchOp::Lt => (got == 1, "1"),
        MatchOp::GtLt => (got == 2, "2"),
        MatchOp::Unknown(name) => return Err(ExpressionError::UnknownOp(name.clone())),
    };
    if ok { Ok(()) } else { Err(ExpressionError::Arity { op: expr.op.clone(), expected, got }) }
}

fn gtlt_bounds(expr: &MatchExpression) -> Result<(i64, i64), ExpressionError> {
    let lo = parse_int(&expr.values[0])?;
    let hi = parse_int(&expr.values[1])?;
    if lo >= hi {
        return Err(ExpressionError::UnorderedRange(lo, hi));
    }
    Ok((lo, hi))
}

/// Check operator arity, regex syntax and numeric operands without any input.
pub fn validate(expr: &MatchExpression) -> Result<(), ExpressionError> {
    check_arity(expr)?;
    match expr.op {
        MatchOp::InRegexp => expr.values.iter().try_for_each(|p| compile(p).map(|_| ())),
        MatchOp::Gt | MatchOp::Lt => parse_int(&expr.values[0]).map(|_| ()),
        MatchOp::GtLt => gtlt_bounds(expr).map(|_| ()),
        _ => Ok(()),
    }
}

/// Evaluate one expression. `exists` tells whether the feature element is present at all;
/// only `Exists`/`DoesNotExist`/`Any` can match an absent element. The expression itself is
/// validated first, so a malformed expression is an error even when the element is absent.
pub fn evaluate(expr: &MatchExpression, exists: bool, input: &MatchInput) -> Result<bool, ExpressionError> {
    validate(expr)?;
    match expr.op {
        MatchOp::Any => return Ok(true),
        MatchOp::Exists => return Ok(exists),
        MatchOp::DoesNotExist => return Ok(!exists),
        _ => {}
    }
    if !exists {
        return Ok(false);
    }
    let value = input.canonical().ok_or_else(|| ExpressionError::MissingInput(expr.op.clone()))?;
    let value = value.as_ref();
    Ok(match &expr.op {
        MatchOp::In => expr.values.iter().any(|v| v == value),
        MatchOp::NotIn => !expr.values.iter().any(|v| v == value),
        MatchOp::InRegexp => {
            let mut hit = false;
            for p in &expr.values {
                if compile(p)?.is_match(value) {
                    hit = true;
                    break;
                }
            }
            hit
        }
        MatchOp::Gt => parse_int(value)? > parse_int(&expr.values[0])?,
        MatchOp::Lt => parse_int(value)? < parse_int(&expr.values[0])?,
        MatchOp::GtLt => {
            let (lo, hi) = gtlt_bounds(expr)?;
            let v = parse_int(value)?;
            lo < v && v < hi
        }
        MatchOp::IsTrue => value == "true",
        MatchOp::IsFalse => value == "false",
        MatchOp::Any | MatchOp::Exists => true,
        MatchOp::DoesNotExist => false,
        MatchOp::Unknown(name) => return Err(ExpressionError::UnknownOp(name.clone())),
    })
}

/// Presence-only data: only `Any`, `Exists` and `DoesNotExist` apply.
pub fn evaluate_keys(expr: &MatchExpression, name: &str, keys: &BTreeSet<String>) -> Result<bool, ExpressionError> {
    match &expr.op {
        MatchOp::Any | MatchOp::Exists | MatchOp::DoesNotExist | MatchOp::Unknown(_) => {
            evaluate(expr, keys.contains(name), &MatchInput::Absent)
        }
        op => Err(ExpressionError::NotApplicable(op.clone())),
    }
}

/// Key -> value data: every operator applies to the value stored under `name`.
pub fn evaluate_values(expr: &MatchExpression, name: &str, values: &BTreeMap<String, String>) -> Result<bool, ExpressionError> {
    let value = values.get(name).map(String::as_str);
    evaluate(expr, value.is_some(), &MatchInput::from(value))
}

/// AND over the set; an empty set matches.
pub fn match_keys(set: &MatchExpressionSet, keys: &BTreeSet<String>) -> Result<bool, ExpressionError> {
    for (name, expr) in set {
        if !evaluate_keys(expr, name, keys)? {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn match_values(set: &MatchExpressionSet, values: &BTreeMap<String, String>) -> Result<bool, ExpressionError> {
    for (name, expr) in set {
        if !evaluate_values(expr, name, values)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Instances whose attributes satisfy the whole set, in table order.
pub fn match_instances<'a>(
    set: &MatchExpressionSet,
    instances: &'a [InstanceFeature],
) -> Result<Vec<&'a InstanceFeature>, ExpressionError> {
    let mut out = Vec::new();
    for inst in instances {
        if match_values(set, &inst.attributes)? {
            out.push(inst);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expr(op: MatchOp, values: &[&str]) -> MatchExpression { MatchExpression::new(op, values.iter().copied()) }

    fn eval(op: MatchOp, values: &[&str], exists: bool, input: impl Into<MatchInput>) -> Result<bool, ExpressionError> {
        evaluate(&expr(op, values), exists, &input.into())
    }

    #[test]
    fn operator_semantics_with_present_and_absent_input() {
        use MatchOp::*;
        let cases: Vec<(MatchOp, Vec<&str>, bool, MatchInput, bool)> = vec![
            (Any, vec![], false, MatchInput::Absent, true),
            (Any, vec![], false, "2".into(), true),
            (In, vec!["1"], false, "2".into(), false),
            (In, vec!["1"], true, "2".into(), false),
            (In, vec!["1", "2", "3"], false, "2".into(), false),
            (In, vec!["1", "2", "3"], true, "2".into(), true),
            (NotIn, vec!["2"], false, MatchInput::Integer(2), false),
            (NotIn, vec!["1"], true, MatchInput::Integer(2), true),
            (NotIn, vec!["1", "2", "3"], true, "2".into(), false),
            (InRegexp, vec!["val-[0-9]$"], false, "val-1".into(), false),
            (InRegexp, vec!["val-[0-9]$"], true, "val-1".into(), true),
            (InRegexp, vec!["val-[0-9]$"], true, "val-12".into(), false),
            (InRegexp, vec!["val-[0-9]$", "al-[1-9]"], true, "val-12".into(), true),
            (Exists, vec![], false, MatchInput::Absent, false),
            (Exists, vec![], true, MatchInput::Absent, true),
            (DoesNotExist, vec![], false, false.into(), true),
            (DoesNotExist, vec![], true, false.into(), false),
            (Gt, vec!["2"], false, MatchInput::Integer(3), false),
            (Gt, vec!["2"], true, MatchInput::Integer(2), false),
            (Gt, vec!["2"], true, MatchInput::Integer(3), true),
            (Gt, vec!["-10"], true, MatchInput::Integer(-3), true),
            (Lt, vec!["2"], false, "1".into(), false),
            (Lt, vec!["2"], true, "2".into(), false),
            (Lt, vec!["-10"], true, MatchInput::Integer(-3), false),
            (Lt, vec!["2"], true, "1".into(), true),
            (GtLt, vec!["1", "10"], false, "1".into(), false),
            (GtLt, vec!["1", "10"], true, "1".into(), false),
            (GtLt, vec!["1", "10"], true, "10".into(), false),
            (GtLt, vec!["1", "10"], true, "2".into(), true),
            (IsTrue, vec![], false, true.into(), false),
            (IsTrue, vec![], true, true.into(), true),
            (IsTrue, vec![], true, false.into(), false),
            (IsFalse, vec![], false, "false".into(), false),
            (IsFalse, vec![], true, "false".into(), true),
            (IsFalse, vec![], true, "true".into(), false),
        ];
        for (op, values, exists, input, want) in cases {
            let got = evaluate(&expr(op.clone(), &values), exists, &input);
            assert_eq!(got, Ok(want), "{op} {values:?} exists={exists} input={input:?}");
        }
    }

    #[test]
    fn malformed_expressions_are_errors() {
        use MatchOp::*;
        let cases: Vec<(MatchOp, Vec<&str>, &str)> = vec![
            (Any, vec!["1"], "val"),
            (In, vec![], "val"),
            (NotIn, vec![], "val"),
            (InRegexp, vec![], "val"),
            (InRegexp, vec!["("], "val"),
            (Exists, vec!["1"], ""),
            (DoesNotExist, vec!["1"], ""),
            (Gt, vec![], "1"),
            (Gt, vec!["1", "2"], "1"),
            (Gt, vec![""], "1"),
            (Gt, vec!["2"], "3a"),
            (Lt, vec![], "1"),
            (Lt, vec!["1", "2", "3"], "1"),
            (Lt, vec!["a"], "1"),
            (Lt, vec!["2"], "1.0"),
            (GtLt, vec![], "1"),
            (GtLt, vec!["1"], "1"),
            (GtLt, vec!["2", "1"], "1"),
            (GtLt, vec!["1", "2", "3"], "1"),
            (GtLt, vec!["a", "2"], "1"),
            (GtLt, vec!["1", "10"], "1.0"),
            (IsTrue, vec!["1"], "true"),
            (IsFalse, vec!["1", "2"], "false"),
        ];
        for (op, values, input) in cases {
            assert!(eval(op.clone(), &values, true, input).is_err(), "{op} {values:?} {input:?} should fail");
        }
    }

    #[test]
    fn equal_gtlt_bounds_are_rejected() {
        assert_eq!(eval(MatchOp::GtLt, &["5", "5"], true, "5"), Err(ExpressionError::UnorderedRange(5, 5)));
    }

    #[test]
    fn bool_and_string_coerce_identically() {
        for op in [MatchOp::IsTrue, MatchOp::IsFalse] {
            assert_eq!(eval(op.clone(), &[], true, true), eval(op, &[], true, "true"));
        }
        assert_eq!(eval(MatchOp::In, &["true"], true, true), Ok(true));
        assert_eq!(eval(MatchOp::Gt, &["1"], true, true).unwrap_err(), ExpressionError::NotInteger("true".into()));
    }

    #[test]
    fn present_element_without_value_is_an_error() {
        assert_eq!(eval(MatchOp::In, &["1"], true, MatchInput::Absent), Err(ExpressionError::MissingInput(MatchOp::In)));
    }

    #[test]
    fn evaluation_is_repeatable() {
        let e = expr(MatchOp::InRegexp, &["^a", "("]);
        let first = evaluate(&e, true, &"abc".into());
        for _ in 0..3 {
            assert_eq!(evaluate(&e, true, &"abc".into()), first);
        }
    }

    #[test]
    fn keys_adapter() {
        let keys: BTreeSet<String> = ["bar".to_string()].into_iter().collect();
        let both: BTreeSet<String> = ["bar".to_string(), "foo".to_string()].into_iter().collect();
        let empty = BTreeSet::new();
        assert_eq!(evaluate_keys(&expr(MatchOp::Any, &[]), "", &empty), Ok(true));
        assert_eq!(evaluate_keys(&expr(MatchOp::Exists, &[]), "foo", &empty), Ok(false));
        assert_eq!(evaluate_keys(&expr(MatchOp::Exists, &[]), "foo", &keys), Ok(false));
        assert_eq!(evaluate_keys(&expr(MatchOp::Exists, &[]), "foo", &both), Ok(true));
        assert_eq!(evaluate_keys(&expr(MatchOp::DoesNotExist, &[]), "foo", &keys), Ok(true));
        assert_eq!(evaluate_keys(&expr(MatchOp::DoesNotExist, &[]), "foo", &both), Ok(false));
        let rejected: Vec<MatchExpression> = vec![
            expr(MatchOp::In, &["foo"]),
            expr(MatchOp::NotIn, &["foo"]),
            expr(MatchOp::InRegexp, &["foo"]),
            expr(MatchOp::Gt, &["1"]),
            expr(MatchOp::Lt, &["1"]),
            expr(MatchOp::GtLt, &["1", "10"]),
            expr(MatchOp::IsTrue, &[]),
            expr(MatchOp::IsFalse, &[]),
        ];
        for e in rejected {
            assert_eq!(evaluate_keys(&e, "foo", &both), Err(ExpressionError::NotApplicable(e.op.clone())));
        }
    }

    #[test]
    fn unknown_operator_is_an_error_even_without_input() {
        let e = expr(MatchOp::Unknown("exists".into()), &[]);
        let want = Err(ExpressionError::UnknownOp("exists".into()));
        assert_eq!(validate(&e).map(|_| true), want);
        assert_eq!(evaluate(&e, false, &MatchInput::Absent), want);
        assert_eq!(evaluate_keys(&e, "foo", &BTreeSet::new()), want);
        assert_eq!(evaluate_values(&e, "foo", &BTreeMap::new()), want);
    }

    #[test]
    fn values_adapter() {
        fn m(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        }
        let ev = |op, values: &[&str], input: &[(&str, &str)]| evaluate_values(&expr(op, values), "foo", &m(input));
        assert_eq!(ev(MatchOp::In, &["1", "2"], &[("bar", "2")]), Ok(false));
        assert_eq!(ev(MatchOp::In, &["1", "2"], &[("foo", "3")]), Ok(false));
        assert_eq!(ev(MatchOp::In, &["1", "2"], &[("foo", "2")]), Ok(true));
        assert_eq!(ev(MatchOp::NotIn, &["1", "2"], &[("bar", "2")]), Ok(false));
        assert_eq!(ev(MatchOp::NotIn, &["1", "2"], &[("foo", "3")]), Ok(true));
        assert_eq!(ev(MatchOp::InRegexp, &["1", "[0-8]"], &[("foo", "9")]), Ok(false));
        assert_eq!(ev(MatchOp::InRegexp, &["1", "[0-8]"], &[("foo", "2")]), Ok(true));
        assert_eq!(ev(MatchOp::Exists, &[], &[("foo", "1")]), Ok(true));
        assert_eq!(ev(MatchOp::DoesNotExist, &[], &[]), Ok(true));
        assert_eq!(ev(MatchOp::Gt, &["2"], &[("bar", "3")]), Ok(false));
        assert_eq!(ev(MatchOp::Gt, &["2"], &[("foo", "3")]), Ok(true));
        assert!(ev(MatchOp::Gt, &["2"], &[("foo", "str")]).is_err());
        assert!(ev(MatchOp::Lt, &["2"], &[("foo", "str")]).is_err());
        assert_eq!(ev(MatchOp::GtLt, &["-10", "10"], &[("bar", "1")]), Ok(false));
        assert_eq!(ev(MatchOp::GtLt, &["-10", "10"], &[("foo", "-11")]), Ok(false));
        assert_eq!(ev(MatchOp::GtLt, &["-10", "10"], &[("foo", "1")]), Ok(true));
        assert!(ev(MatchOp::GtLt, &["-10", "10"], &[("foo", "str")]).is_err());
        assert_eq!(ev(MatchOp::IsTrue, &[], &[]), Ok(false));
        assert_eq!(ev(MatchOp::IsTrue, &[], &[("foo", "1")]), Ok(false));
        assert_eq!(ev(MatchOp::IsTrue, &[], &[("foo", "true")]), Ok(true));
        assert_eq!(ev(MatchOp::IsFalse, &[], &[("foo", "false")]), Ok(true));
    }

    #[test]
    fn sets_are_anded_and_instances_filtered() {
        let mut set = MatchExpressionSet::new();
        assert_eq!(match_values(&set, &BTreeMap::new()), Ok(true));
        set.insert("vendor".into(), expr(MatchOp::In, &["10de"]));
        set.insert("class".into(), expr(MatchOp::InRegexp, &["^03"]));
        let inst = |v: &str, c: &str| InstanceFeature {
            attributes: [("vendor".to_string(), v.to_string()), ("class".to_string(), c.to_string())].into_iter().collect(),
        };
        let all = vec![inst("8086", "0300"), inst("10de", "0302"), inst("10de", "0200")];
        let hits = match_instances(&set, &all).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].attributes["class"], "0302");
    }
}
