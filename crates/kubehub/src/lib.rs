//! Kubernetes wiring: a kube-rs backed [`NodeStore`] and list/watch subscriptions for rule and
//! feature custom resources.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Node as K8sNode;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client,
};
use metrics::counter;
use nodefeat_core::{
    patch::to_json_patch, AttributeFeatureSet, FeatureSet, FlagFeatureSet, InputEvent, InstanceFeatureSet, JsonPatchOp,
    Node, NodeFeatures, NodeStore, Rule, RuleSet, SourceEvent, StoreError, NODE_NAME_LABEL,
};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const NFD_GROUP: &str = "nfd.k8s-sigs.io";
pub const NFD_VERSION: &str = "v1alpha1";

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Process-wide client built from the ambient kubeconfig or in-cluster environment.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    Ok(CLIENT.get_or_init(|| client).clone())
}

fn store_err(node: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(format!("{}: {}", node, ae.message)),
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(node.to_string()),
        e => StoreError::Other(anyhow::Error::new(e).context(format!("node {}", node))),
    }
}

/// Reduce a full Kubernetes node object to the fields the reconciler works with.
pub fn node_from_k8s(n: &K8sNode) -> Result<Node, StoreError> {
    let v = serde_json::to_value(n).map_err(|e| StoreError::Other(e.into()))?;
    Node::from_json(v).map_err(|e| StoreError::Other(e.into()))
}

pub struct KubeNodeStore {
    api: Api<K8sNode>,
}

impl KubeNodeStore {
    pub fn new(client: Client) -> Self { Self { api: Api::all(client) } }

    fn json_patch(patches: &[JsonPatchOp]) -> Result<Patch<()>, StoreError> {
        let p = to_json_patch(patches).map_err(|e| StoreError::Other(e.into()))?;
        Ok(Patch::Json(p))
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        let n = self.api.get(name).await.map_err(|e| store_err(name, e))?;
        node_from_k8s(&n)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let list = self.api.list(&ListParams::default()).await.map_err(|e| store_err("*", e))?;
        list.items.iter().map(node_from_k8s).collect()
    }

    async fn patch_node(&self, name: &str, patches: &[JsonPatchOp]) -> Result<(), StoreError> {
        let patch = Self::json_patch(patches)?;
        self.api.patch(name, &PatchParams::default(), &patch).await.map_err(|e| store_err(name, e))?;
        debug!(node = %name, ops = patches.len(), "kubehub: node patched");
        Ok(())
    }

    async fn patch_node_status(&self, name: &str, patches: &[JsonPatchOp]) -> Result<(), StoreError> {
        let patch = Self::json_patch(patches)?;
        self.api.patch_status(name, &PatchParams::default(), &patch).await.map_err(|e| store_err(name, e))?;
        debug!(node = %name, ops = patches.len(), "kubehub: node status patched");
        Ok(())
    }
}

pub fn rule_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(NFD_GROUP, NFD_VERSION, "NodeFeatureRule"), "nodefeaturerules")
}

pub fn feature_resource() -> ApiResource {
    ApiResource::from_gvk_with_plural(&GroupVersionKind::gvk(NFD_GROUP, NFD_VERSION, "NodeFeature"), "nodefeatures")
}

fn object_name(obj: &DynamicObject) -> Result<String> {
    obj.metadata.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))
}

fn spec(obj: &DynamicObject) -> serde_json::Value { obj.data.get("spec").cloned().unwrap_or(serde_json::Value::Null) }

#[derive(Deserialize, Default)]
struct RuleSpec {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// A NodeFeatureRule object becomes a rule set named after the object.
pub fn rule_set_from_object(obj: &DynamicObject) -> Result<RuleSet> {
    let name = object_name(obj)?;
    let spec = spec(obj);
    let parsed: RuleSpec =
        if spec.is_null() { RuleSpec::default() } else { serde_json::from_value(spec).with_context(|| format!("rule object {}", name))? };
    Ok(RuleSet { name, rules: parsed.rules })
}

/// Flag elements are published as an object of empty values; a plain list is accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum FlagElements {
    Map(BTreeMap<String, serde_json::Value>),
    List(Vec<String>),
}

#[derive(Deserialize, Default)]
struct WireFlags {
    #[serde(default)]
    elements: Option<FlagElements>,
}

#[derive(Deserialize, Default)]
struct WireFeatures {
    #[serde(default)]
    flags: BTreeMap<String, WireFlags>,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeFeatureSet>,
    #[serde(default)]
    instances: BTreeMap<String, InstanceFeatureSet>,
}

#[derive(Deserialize, Default)]
struct FeatureSpec {
    #[serde(default)]
    features: WireFeatures,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

/// A NodeFeature object carries one node's features and requested labels. The node is named by
/// the `nfd.node.kubernetes.io/node-name` label.
pub fn node_features_from_object(obj: &DynamicObject) -> Result<NodeFeatures> {
    let object = object_name(obj)?;
    let node_name = obj
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(NODE_NAME_LABEL))
        .cloned()
        .ok_or_else(|| anyhow!("feature object {} has no {} label", object, NODE_NAME_LABEL))?;
    let spec = spec(obj);
    let parsed: FeatureSpec =
        if spec.is_null() { FeatureSpec::default() } else { serde_json::from_value(spec).with_context(|| format!("feature object {}", object))? };

    let mut features = FeatureSet::new();
    for (table, flags) in parsed.features.flags {
        let elements = match flags.elements {
            Some(FlagElements::Map(m)) => m.into_keys().collect(),
            Some(FlagElements::List(l)) => l.into_iter().collect(),
            None => Default::default(),
        };
        features.flags.insert(table, FlagFeatureSet { elements });
    }
    features.attributes = parsed.features.attributes;
    features.instances = parsed.features.instances;
    Ok(NodeFeatures { object, node_name, features, labels: parsed.labels })
}

type Parse<T> = fn(&DynamicObject) -> Result<T>;
type Wrap<T> = fn(SourceEvent<T>) -> InputEvent;

fn parse_logged<T>(kind: &str, parse: Parse<T>, obj: &DynamicObject) -> Option<T> {
    match parse(obj) {
        Ok(t) => Some(t),
        Err(e) => {
            warn!(kind, error = %e, "kubehub: ignoring malformed object");
            None
        }
    }
}

/// List+watch one kind and forward parsed events until cancelled or the receiver goes away.
async fn pump<T>(
    api: Api<DynamicObject>,
    kind: &'static str,
    parse: Parse<T>,
    wrap: Wrap<T>,
    tx: mpsc::Sender<InputEvent>,
    cancel: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind, "kubehub: watch started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.try_next() => next,
        };
        let ev = match next {
            Ok(Some(ev)) => ev,
            Ok(None) => {
                warn!(kind, "kubehub: watch stream ended");
                break;
            }
            Err(e) => {
                counter!("kube_watch_errors_total", 1u64);
                warn!(kind, error = %e, "kubehub: watch error");
                continue;
            }
        };
        let out = match ev {
            Event::Applied(o) => parse_logged(kind, parse, &o).map(SourceEvent::Applied),
            Event::Deleted(o) => parse_logged(kind, parse, &o).map(SourceEvent::Deleted),
            Event::Restarted(list) => {
                debug!(kind, count = list.len(), "kubehub: watch restart");
                Some(SourceEvent::Restarted(list.iter().filter_map(|o| parse_logged(kind, parse, o)).collect()))
            }
        };
        if let Some(ev) = out {
            if tx.send(wrap(ev)).await.is_err() {
                break;
            }
        }
    }
    info!(kind, "kubehub: watch stopped");
}

/// Watch NodeFeatureRule and NodeFeature objects cluster-wide and feed them to `tx`.
pub async fn watch_sources(client: Client, tx: mpsc::Sender<InputEvent>, cancel: CancellationToken) {
    let rules: Api<DynamicObject> = Api::all_with(client.clone(), &rule_resource());
    let features: Api<DynamicObject> = Api::all_with(client, &feature_resource());
    tokio::join!(
        pump(rules, "NodeFeatureRule", rule_set_from_object, InputEvent::Rules, tx.clone(), cancel.clone()),
        pump(features, "NodeFeature", node_features_from_object, InputEvent::Features, tx, cancel),
    );
}
