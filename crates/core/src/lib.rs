//! Node feature reconciler core: feature tables, rules, node snapshots, JSON patches and the
//! node-store collaborator trait.

#![forbid(unsafe_code)]

pub mod features;
pub mod memory;
pub mod node;
pub mod patch;
pub mod rule;
pub mod source;
pub mod store;

pub use features::{AttributeFeatureSet, FeatureSet, FlagFeatureSet, InstanceFeature, InstanceFeatureSet, MatchInput};
pub use node::{ExtendedResources, Node, NodeUpdateRequest};
pub use patch::{JsonPatchOp, PatchOp};
pub use rule::{
    FeatureMatcherTerm, MatchAnyElem, MatchExpression, MatchExpressionSet, MatchOp, Rule, RuleSet, Taint, TaintEffect,
};
pub use source::{InputEvent, NodeFeatures, SourceEvent};
pub use store::{NodeStore, StoreError};

/// Default namespace of feature labels; label names in it may be written without the prefix.
pub const FEATURE_LABEL_NS: &str = "feature.node.kubernetes.io";
/// Sub-namespace suffix accepted for feature labels (`vendor.feature.node.kubernetes.io`).
pub const FEATURE_LABEL_SUB_NS: &str = ".feature.node.kubernetes.io";
pub const PROFILE_LABEL_NS: &str = "profile.node.kubernetes.io";
pub const PROFILE_LABEL_SUB_NS: &str = ".profile.node.kubernetes.io";
/// Namespace of feature annotations and taints.
pub const FEATURE_ANNOTATION_NS: &str = "feature.node.kubernetes.io";
pub const FEATURE_ANNOTATION_SUB_NS: &str = ".feature.node.kubernetes.io";
/// Internal namespace for the reconciler's own bookkeeping annotations.
pub const ANNOTATION_NS: &str = "nfd.node.kubernetes.io";

pub const FEATURE_LABELS_ANNOTATION: &str = "nfd.node.kubernetes.io/feature-labels";
pub const FEATURE_ANNOTATIONS_TRACKING_ANNOTATION: &str = "nfd.node.kubernetes.io/feature-annotations";
pub const EXTENDED_RESOURCE_ANNOTATION: &str = "nfd.node.kubernetes.io/extended-resources";
pub const TAINTS_ANNOTATION: &str = "nfd.node.kubernetes.io/taints";

/// Attribute table through which fired rules expose their labels and vars to later rules.
pub const RULE_MATCHED_FEATURE: &str = "rule.matched";

/// Label on feature objects naming the node they describe.
pub const NODE_NAME_LABEL: &str = "nfd.node.kubernetes.io/node-name";

pub mod prelude {
    pub use super::{
        FeatureSet, JsonPatchOp, MatchExpression, MatchExpressionSet, MatchInput, MatchOp, Node, NodeStore,
        NodeUpdateRequest, Rule, RuleSet, StoreError, Taint, TaintEffect,
    };
}

/// Strip the default feature namespace, used for the compact form stored in tracking annotations.
pub fn strip_default_ns(name: &str) -> &str {
    name.strip_prefix(FEATURE_LABEL_NS).and_then(|rest| rest.strip_prefix('/')).unwrap_or(name)
}

/// Inverse of [`strip_default_ns`]: names without a namespace get the default one.
pub fn add_default_ns(name: &str) -> String {
    if name.contains('/') { name.to_string() } else { format!("{}/{}", FEATURE_LABEL_NS, name) }
}
