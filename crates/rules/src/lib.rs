//! Rule engine for node features: match expressions, rule execution with dynamic value
//! references and the namespace policy applied to everything a rule produces.

#![forbid(unsafe_code)]

pub mod expression;
pub mod filter;
pub mod rule;

pub use expression::{
    evaluate, evaluate_keys, evaluate_values, match_instances, match_keys, match_values, validate, ExpressionError,
};
pub use filter::{FilterError, NamespaceFilter};
pub use rule::{evaluate_rule_sets, execute_rule, resolve_dynamic_value, Evaluation, RuleError, RuleOutput};
