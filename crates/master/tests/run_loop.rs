use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use nodefeat_config::{ConfigManager, RawConfig};
use nodefeat_core::memory::MemoryNodeStore;
use nodefeat_core::{FeatureSet, InputEvent, Node, NodeFeatures, RuleSet, SourceEvent};
use nodefeat_master::{Master, SetLabelsRequest};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const RULES: &str = r#"
name: kernel
rules:
  - name: modern-kernel
    matchFeatures:
      - feature: kernel.version
        matchExpressions:
          major: {op: Gt, value: ["5"]}
    labels:
      kernel-modern: "true"
      kernel-major: "@kernel.version.major"
"#;

async fn eventually(what: &str, f: impl Fn() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_reconciles_events_pushes_and_config_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nfd-master.conf");
    std::fs::write(&path, "apiParallelism: 2\n").unwrap();
    let manager = Arc::new(ConfigManager::new(Some(path.clone()), None, RawConfig::default()).unwrap());

    let store = Arc::new(MemoryNodeStore::new());
    store.insert(Node::new("worker-0"));
    store.insert(Node::new("worker-1"));
    let master = Master::new(manager.clone(), store.clone());
    let pool = master.pool().clone();
    assert_eq!(pool.workers(), 2);

    let (ev_tx, ev_rx) = mpsc::channel(16);
    let (push_tx, push_rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(master.run(ev_rx, push_rx, cancel.clone()));

    let rules: RuleSet = serde_yaml::from_str(RULES).unwrap();
    ev_tx.send(InputEvent::Rules(SourceEvent::Restarted(vec![rules]))).await.unwrap();
    let mut features = FeatureSet::new();
    features.insert_attribute("kernel.version", "major", "6");
    ev_tx
        .send(InputEvent::Features(SourceEvent::Applied(NodeFeatures {
            object: "worker-0-features".into(),
            node_name: "worker-0".into(),
            features,
            labels: BTreeMap::new(),
        })))
        .await
        .unwrap();
    eventually("rule labels", || {
        store.node("worker-0").is_some_and(|n| n.labels.get("feature.node.kubernetes.io/kernel-major").map(String::as_str) == Some("6"))
    })
    .await;
    assert!(store.node("worker-1").unwrap().labels.is_empty());

    push_tx
        .send(SetLabelsRequest {
            node_name: "worker-1".into(),
            labels: [("feature.node.kubernetes.io/pushed".to_string(), "1".to_string())].into_iter().collect(),
            ..Default::default()
        })
        .await
        .unwrap();
    eventually("pushed label", || store.node("worker-1").is_some_and(|n| n.labels.contains_key("feature.node.kubernetes.io/pushed"))).await;

    std::fs::write(&path, "apiParallelism: 3\n").unwrap();
    assert!(manager.reload().unwrap());
    eventually("pool resize", || pool.workers() == 3).await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(pool.workers(), 0);
    assert_eq!(store.node("worker-0").unwrap().labels["feature.node.kubernetes.io/kernel-modern"], "true");
}
