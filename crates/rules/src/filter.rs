//! Namespace policy for labels, annotations, extended resources and taints.

use metrics::counter;
use nodefeat_config::Config;
use nodefeat_core::{
    add_default_ns, NodeUpdateRequest, Taint, ANNOTATION_NS, FEATURE_ANNOTATION_NS, FEATURE_ANNOTATION_SUB_NS,
    FEATURE_LABEL_NS, FEATURE_LABEL_SUB_NS, PROFILE_LABEL_NS, PROFILE_LABEL_SUB_NS,
};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("{0:?}: name has no namespace")]
    NoNamespace(String),
    #[error("{name:?}: namespace {ns:?} is denied")]
    Denied { name: String, ns: String },
    #[error("{name:?}: namespace {ns:?} is not allowed")]
    NotAllowed { name: String, ns: String },
    #[error("{name:?}: invalid value {value:?}")]
    InvalidValue { name: String, value: String },
}

const LABEL_VALUE_MAX: usize = 63;

static LABEL_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("label value pattern"));

fn split_ns(name: &str) -> (&str, &str) {
    name.split_once('/').unwrap_or(("", name))
}

pub fn is_builtin_label_ns(ns: &str) -> bool {
    ns == FEATURE_LABEL_NS || ns == PROFILE_LABEL_NS || ns.ends_with(FEATURE_LABEL_SUB_NS) || ns.ends_with(PROFILE_LABEL_SUB_NS)
}

pub fn is_builtin_annotation_ns(ns: &str) -> bool {
    ns == FEATURE_ANNOTATION_NS || ns.ends_with(FEATURE_ANNOTATION_SUB_NS)
}

pub fn is_valid_label_value(value: &str) -> bool {
    value.len() <= LABEL_VALUE_MAX && LABEL_VALUE_RE.is_match(value)
}

/// Policy view over one configuration snapshot.
pub struct NamespaceFilter<'a> {
    cfg: &'a Config,
}

impl<'a> NamespaceFilter<'a> {
    pub fn new(cfg: &'a Config) -> Self { Self { cfg } }

    /// Namespace checks shared by every kind of name. `builtin` short-circuits to accept;
    /// `whitelist` enables the local-name regex as an allow path.
    fn check_ns(&self, name: &str, builtin: fn(&str) -> bool, whitelist: bool) -> Result<(), FilterError> {
        let (ns, local) = split_ns(name);
        if ns.is_empty() {
            return Err(FilterError::NoNamespace(name.to_string()));
        }
        if builtin(ns) {
            return Ok(());
        }
        let denied = || FilterError::Denied { name: name.to_string(), ns: ns.to_string() };
        if ns == ANNOTATION_NS || self.cfg.denied_ns.is_denied(ns) {
            return Err(denied());
        }
        if self.cfg.extra_label_ns.contains(ns) {
            return Ok(());
        }
        if whitelist && self.cfg.label_white_list.as_ref().is_some_and(|re| re.is_match(local)) {
            return Ok(());
        }
        Err(FilterError::NotAllowed { name: name.to_string(), ns: ns.to_string() })
    }

    /// Accept or reject a label; the accepted value is returned unchanged.
    pub fn filter_label(&self, name: &str, value: &str) -> Result<String, FilterError> {
        self.check_ns(name, is_builtin_label_ns, true)?;
        if !is_valid_label_value(value) {
            return Err(FilterError::InvalidValue { name: name.to_string(), value: value.to_string() });
        }
        Ok(value.to_string())
    }

    pub fn filter_annotation(&self, name: &str, value: &str) -> Result<String, FilterError> {
        self.check_ns(name, is_builtin_annotation_ns, true)?;
        Ok(value.to_string())
    }

    /// Extended resources follow label namespaces without the whitelist; the quantity must be a
    /// non-negative integer. An empty quantity passes through and means "remove".
    pub fn filter_extended_resource(&self, name: &str, value: &str) -> Result<String, FilterError> {
        self.check_ns(name, is_builtin_label_ns, false)?;
        if !value.is_empty() && value.parse::<u64>().is_err() {
            return Err(FilterError::InvalidValue { name: name.to_string(), value: value.to_string() });
        }
        Ok(value.to_string())
    }

    pub fn filter_taint(&self, taint: &Taint) -> Result<(), FilterError> {
        self.check_ns(&taint.key, is_builtin_label_ns, false)?;
        if !is_valid_label_value(&taint.value) {
            return Err(FilterError::InvalidValue { name: taint.key.clone(), value: taint.value.clone() });
        }
        Ok(())
    }

    /// Labels listed in `resourceLabels` (with or without the default namespace).
    pub fn is_resource_label(&self, name: &str) -> bool {
        self.cfg.resource_labels.iter().any(|r| add_default_ns(r) == name)
    }

    /// Apply the whole policy to a desired-state request. Rejected entries are dropped and
    /// logged; resource labels move to extended resources; taints are dropped unless enabled.
    pub fn filter_request(&self, req: NodeUpdateRequest) -> NodeUpdateRequest {
        let node = req.node_name.clone();
        let mut out = NodeUpdateRequest::new(&node);
        let mut resources = req.extended_resources;
        for (name, value) in req.labels {
            if self.is_resource_label(&name) {
                resources.insert(name, value);
                continue;
            }
            match self.filter_label(&name, &value) {
                Ok(v) => { out.labels.insert(name, v); }
                Err(e) => dropped(&node, "label", &e),
            }
        }
        for (name, value) in req.annotations {
            match self.filter_annotation(&name, &value) {
                Ok(v) => { out.annotations.insert(name, v); }
                Err(e) => dropped(&node, "annotation", &e),
            }
        }
        for (name, value) in resources {
            match self.filter_extended_resource(&name, &value) {
                Ok(v) => { out.extended_resources.insert(name, v); }
                Err(e) => dropped(&node, "extended resource", &e),
            }
        }
        if !self.cfg.enable_taints {
            if !req.taints.is_empty() {
                debug!(node = %node, count = req.taints.len(), "filter: taints disabled; dropping");
            }
            return out;
        }
        for t in req.taints {
            match self.filter_taint(&t) {
                Ok(()) => out.taints.push(t),
                Err(e) => dropped(&node, "taint", &e),
            }
        }
        out
    }
}

fn dropped(node: &str, kind: &str, e: &FilterError) {
    counter!("filtered_names_total", 1u64);
    match e {
        FilterError::InvalidValue { .. } => warn!(node = %node, kind, error = %e, "filter: dropped"),
        _ => debug!(node = %node, kind, error = %e, "filter: dropped"),
    }
}
