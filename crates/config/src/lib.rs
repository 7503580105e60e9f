//! Reconciler configuration: the layered raw form, the validated immutable snapshot and the
//! hot-reloading manager that publishes snapshots.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod duration;
pub mod manager;

pub use duration::{format_duration, parse_duration};
pub use manager::ConfigManager;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(3600);
pub const DEFAULT_API_PARALLELISM: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLeaderElection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_deadline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_period: Option<String>,
}

/// One configuration layer. Every field is optional; unset fields fall through to lower layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_publish: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_taints: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_label_ns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deny_label_ns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_labels: Option<Vec<String>>,
    #[serde(default, rename = "labelWhiteList", skip_serializing_if = "Option::is_none")]
    pub label_white_list: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period: Option<String>,
    #[serde(default, alias = "nfdApiParallelism", skip_serializing_if = "Option::is_none")]
    pub api_parallelism: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_election: Option<RawLeaderElection>,
}

impl RawConfig {
    /// Parse a YAML (or JSON) document; an empty document is an empty layer.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Fields set in `upper` replace ours.
    pub fn overlay(&mut self, upper: &RawConfig) {
        fn set<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if let Some(v) = src { *dst = Some(v.clone()); }
        }
        set(&mut self.no_publish, &upper.no_publish);
        set(&mut self.enable_taints, &upper.enable_taints);
        set(&mut self.extra_label_ns, &upper.extra_label_ns);
        set(&mut self.deny_label_ns, &upper.deny_label_ns);
        set(&mut self.resource_labels, &upper.resource_labels);
        set(&mut self.label_white_list, &upper.label_white_list);
        set(&mut self.resync_period, &upper.resync_period);
        set(&mut self.api_parallelism, &upper.api_parallelism);
        if let Some(up) = &upper.leader_election {
            let le = self.leader_election.get_or_insert_with(RawLeaderElection::default);
            set(&mut le.lease_duration, &up.lease_duration);
            set(&mut le.renew_deadline, &up.renew_deadline);
            set(&mut le.retry_period, &up.retry_period);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

/// Label namespaces that are never accepted, split by match kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeniedNamespaces {
    pub exact: BTreeSet<String>,
    /// Suffixes starting with `.`; a namespace ending with one of them is denied.
    pub wildcard_suffix: BTreeSet<String>,
}

impl DeniedNamespaces {
    /// Built-in denials plus the configured `denyLabelNs`. Entries written as `*.sub.ns` or
    /// `.sub.ns` are wildcard suffixes.
    pub fn from_deny_list<'a>(deny: impl IntoIterator<Item = &'a String>) -> Self {
        let mut exact: BTreeSet<String> = ["", "kubernetes.io"].iter().map(|s| s.to_string()).collect();
        let mut wildcard_suffix: BTreeSet<String> = [".kubernetes.io"].iter().map(|s| s.to_string()).collect();
        for ns in deny {
            let trimmed = ns.trim_start_matches('*');
            if trimmed.starts_with('.') {
                wildcard_suffix.insert(trimmed.to_string());
            } else {
                exact.insert(trimmed.to_string());
            }
        }
        Self { exact, wildcard_suffix }
    }

    pub fn is_denied(&self, ns: &str) -> bool {
        self.exact.contains(ns) || self.wildcard_suffix.iter().any(|sfx| ns.ends_with(sfx.as_str()))
    }
}

/// Validated, immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub no_publish: bool,
    pub enable_taints: bool,
    pub extra_label_ns: BTreeSet<String>,
    pub deny_label_ns: BTreeSet<String>,
    pub resource_labels: BTreeSet<String>,
    pub label_white_list: Option<Regex>,
    pub resync_period: Duration,
    pub api_parallelism: usize,
    pub leader_election: LeaderElectionConfig,
    pub denied_ns: DeniedNamespaces,
}

impl PartialEq for Config {
    fn eq(&self, other: &Self) -> bool {
        self.no_publish == other.no_publish
            && self.enable_taints == other.enable_taints
            && self.extra_label_ns == other.extra_label_ns
            && self.deny_label_ns == other.deny_label_ns
            && self.resource_labels == other.resource_labels
            && self.label_white_list.as_ref().map(Regex::as_str) == other.label_white_list.as_ref().map(Regex::as_str)
            && self.resync_period == other.resync_period
            && self.api_parallelism == other.api_parallelism
            && self.leader_election == other.leader_election
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            no_publish: false,
            enable_taints: false,
            extra_label_ns: BTreeSet::new(),
            deny_label_ns: BTreeSet::new(),
            resource_labels: BTreeSet::new(),
            label_white_list: None,
            resync_period: DEFAULT_RESYNC_PERIOD,
            api_parallelism: DEFAULT_API_PARALLELISM,
            leader_election: LeaderElectionConfig::default(),
            denied_ns: DeniedNamespaces::from_deny_list(std::iter::empty()),
        }
    }
}

fn positive_duration(field: &str, s: &str) -> Result<Duration, ConfigError> {
    let d = parse_duration(s)?;
    if d.is_zero() {
        return Err(ConfigError::Invalid(format!("{} must be positive", field)));
    }
    Ok(d)
}

impl Config {
    /// Defaults with `raw` applied on top.
    pub fn from_raw(raw: &RawConfig) -> Result<Self, ConfigError> {
        let mut c = Config::default();
        if let Some(v) = raw.no_publish { c.no_publish = v; }
        if let Some(v) = raw.enable_taints { c.enable_taints = v; }
        if let Some(v) = &raw.extra_label_ns { c.extra_label_ns = v.iter().cloned().collect(); }
        if let Some(v) = &raw.deny_label_ns { c.deny_label_ns = v.iter().cloned().collect(); }
        if let Some(v) = &raw.resource_labels { c.resource_labels = v.iter().cloned().collect(); }
        if let Some(v) = &raw.label_white_list {
            let re = Regex::new(v).map_err(|e| ConfigError::Invalid(format!("labelWhiteList: {}", e)))?;
            c.label_white_list = Some(re);
        }
        if let Some(v) = &raw.resync_period { c.resync_period = positive_duration("resyncPeriod", v)?; }
        if let Some(v) = raw.api_parallelism {
            if v == 0 {
                return Err(ConfigError::Invalid("apiParallelism must be at least 1".into()));
            }
            c.api_parallelism = v;
        }
        if let Some(le) = &raw.leader_election {
            if let Some(v) = &le.lease_duration { c.leader_election.lease_duration = positive_duration("leaseDuration", v)?; }
            if let Some(v) = &le.renew_deadline { c.leader_election.renew_deadline = positive_duration("renewDeadline", v)?; }
            if let Some(v) = &le.retry_period { c.leader_election.retry_period = positive_duration("retryPeriod", v)?; }
        }
        c.denied_ns = DeniedNamespaces::from_deny_list(c.deny_label_ns.iter());
        Ok(c)
    }

    /// Merge layers, lowest first: defaults < file < structured override < command line.
    pub fn from_layers(file: Option<&RawConfig>, options: Option<&RawConfig>, cmdline: &RawConfig) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::default();
        if let Some(f) = file { raw.overlay(f); }
        if let Some(o) = options { raw.overlay(o); }
        raw.overlay(cmdline);
        Self::from_raw(&raw)
    }

    /// Fully-populated raw form, used for printing the effective configuration.
    pub fn to_raw(&self) -> RawConfig {
        RawConfig {
            no_publish: Some(self.no_publish),
            enable_taints: Some(self.enable_taints),
            extra_label_ns: Some(self.extra_label_ns.iter().cloned().collect()),
            deny_label_ns: Some(self.deny_label_ns.iter().cloned().collect()),
            resource_labels: Some(self.resource_labels.iter().cloned().collect()),
            label_white_list: self.label_white_list.as_ref().map(|r| r.as_str().to_string()),
            resync_period: Some(format_duration(self.resync_period)),
            api_parallelism: Some(self.api_parallelism),
            leader_election: Some(RawLeaderElection {
                lease_duration: Some(format_duration(self.leader_election.lease_duration)),
                renew_deadline: Some(format_duration(self.leader_election.renew_deadline)),
                retry_period: Some(format_duration(self.leader_election.retry_period)),
            }),
        }
    }
}
