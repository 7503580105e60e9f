//! Live configuration: an `ArcSwap` snapshot rebuilt from all layers whenever the file or the
//! structured override changes, plus a watch channel carrying a change epoch.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Config, ConfigError, RawConfig};

const DEBOUNCE: Duration = Duration::from_millis(50);

pub struct ConfigManager {
    snapshot: ArcSwap<Config>,
    epoch_tx: watch::Sender<u64>,
    path: Option<PathBuf>,
    // Held while rebuilding so concurrent reloads publish in order.
    options: Mutex<Option<RawConfig>>,
    cmdline: RawConfig,
}

fn read_file_layer(path: &Path) -> Result<Option<RawConfig>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(s) => RawConfig::parse(&s).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl ConfigManager {
    /// Build the initial snapshot. Failing here is the only fatal configuration error.
    pub fn new(path: Option<PathBuf>, options: Option<&str>, cmdline: RawConfig) -> Result<Self, ConfigError> {
        let options = options.map(RawConfig::parse).transpose()?;
        let file = match &path { Some(p) => read_file_layer(p)?, None => None };
        let cfg = Config::from_layers(file.as_ref(), options.as_ref(), &cmdline)?;
        let (epoch_tx, _) = watch::channel(0u64);
        info!(path = ?path, api_parallelism = cfg.api_parallelism, no_publish = cfg.no_publish, "config: loaded");
        Ok(Self { snapshot: ArcSwap::from_pointee(cfg), epoch_tx, path, options: Mutex::new(options), cmdline })
    }

    /// Manager with a fixed configuration and no file source.
    pub fn fixed(cfg: Config) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snapshot: ArcSwap::from_pointee(cfg), epoch_tx, path: None, options: Mutex::new(None), cmdline: RawConfig::default() }
    }

    pub fn current(&self) -> Arc<Config> { self.snapshot.load_full() }

    /// Receiver whose value increments on every published change.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }

    pub fn path(&self) -> Option<&Path> { self.path.as_deref() }

    /// Re-read the file layer and republish. On error the previous snapshot stays live.
    /// Returns whether a new snapshot was published.
    pub fn reload(&self) -> Result<bool, ConfigError> {
        let options = self.options.lock().unwrap_or_else(|e| e.into_inner());
        match self.build(options.as_ref()) {
            Ok(cfg) => Ok(self.publish(cfg)),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "config: reload failed; keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Replace the structured override layer (JSON or YAML). Invalid input leaves everything as is.
    pub fn apply_options(&self, s: &str) -> Result<bool, ConfigError> {
        let parsed = RawConfig::parse(s)?;
        let mut options = self.options.lock().unwrap_or_else(|e| e.into_inner());
        let cfg = self.build(Some(&parsed))?;
        *options = Some(parsed);
        Ok(self.publish(cfg))
    }

    fn build(&self, options: Option<&RawConfig>) -> Result<Config, ConfigError> {
        let file = match &self.path { Some(p) => read_file_layer(p)?, None => None };
        Config::from_layers(file.as_ref(), options, &self.cmdline)
    }

    fn publish(&self, cfg: Config) -> bool {
        if *self.snapshot.load_full() == cfg {
            return false;
        }
        info!(api_parallelism = cfg.api_parallelism, no_publish = cfg.no_publish, "config: snapshot updated");
        self.snapshot.store(Arc::new(cfg));
        self.epoch_tx.send_modify(|e| *e += 1);
        counter!("config_reloads_total", 1u64);
        true
    }

    /// Watch the config file's directories and reload on change; `poll` bounds how long a missed
    /// event can go unnoticed. Without a file source the task just waits for cancellation.
    pub fn spawn_watcher(self: Arc<Self>, poll: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let Some(path) = self.path.clone() else {
                cancel.cancelled().await;
                return;
            };
            let (tx, mut rx) = mpsc::channel::<()>(1);
            let mut watcher = match RecommendedWatcher::new(
                move |res: Result<Event, notify::Error>| match res {
                    Ok(ev) => {
                        debug!(kind = ?ev.kind, "config: fs event");
                        let _ = tx.try_send(());
                    }
                    Err(e) => warn!(error = %e, "config: watch error"),
                },
                notify::Config::default(),
            ) {
                Ok(w) => Some(w),
                Err(e) => {
                    warn!(error = %e, "config: fs watcher unavailable; polling only");
                    None
                }
            };
            let mut watched = Vec::new();
            rearm(watcher.as_mut(), &path, &mut watched);
            let mut tick = tokio::time::interval(poll);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                let fs_event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(()) = rx.recv() => {
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}
                        true
                    }
                    _ = tick.tick() => false,
                };
                // An event may come from a directory being replaced, which kills its watch.
                if fs_event || watch_dirs(&path) != watched {
                    rearm(watcher.as_mut(), &path, &mut watched);
                }
                let _ = self.reload();
            }
            info!("config: watcher stopped");
        })
    }
}

/// The file's directory and its parent, when they exist, nearest first. The parent catches
/// `..data` symlink swaps and re-creation of the directory itself.
fn watch_dirs(path: &Path) -> Vec<PathBuf> {
    path.ancestors().skip(1).take(2).filter(|d| !d.as_os_str().is_empty() && d.is_dir()).map(Path::to_path_buf).collect()
}

// Watches on deleted directories die silently; re-register everything.
fn rearm(watcher: Option<&mut RecommendedWatcher>, path: &Path, watched: &mut Vec<PathBuf>) {
    let Some(w) = watcher else { return };
    for d in watched.drain(..) {
        let _ = w.unwatch(&d);
    }
    for d in watch_dirs(path) {
        match w.watch(&d, RecursiveMode::NonRecursive) {
            Ok(()) => watched.push(d),
            Err(e) => debug!(dir = %d.display(), error = %e, "config: cannot watch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn wait_for(mgr: &ConfigManager, f: impl Fn(&Config) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if f(&mgr.current()) { return true; }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn watches_config_dir_and_parent_only() {
        let root = tempfile::tempdir().unwrap();
        let parent = root.path().join("etc");
        let dir = parent.join("nfd");
        std::fs::create_dir_all(&dir).unwrap();
        assert_eq!(watch_dirs(&dir.join("nfd-master.conf")), vec![dir.clone(), parent.clone()]);
        assert_eq!(watch_dirs(&parent.join("gone").join("nfd-master.conf")), vec![parent]);
        assert!(watch_dirs(&root.path().join("a").join("b").join("c.conf")).is_empty());
    }

    #[test]
    fn missing_file_at_startup_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ConfigManager::new(Some(dir.path().join("nope.yaml")), None, RawConfig::default()).unwrap();
        assert_eq!(*mgr.current(), Config::default());
    }

    #[test]
    fn invalid_file_at_startup_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("c.yaml");
        std::fs::write(&p, "apiParallelism: 0\n").unwrap();
        assert!(ConfigManager::new(Some(p), None, RawConfig::default()).is_err());
    }

    #[test]
    fn parse_failure_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("c.yaml");
        std::fs::write(&p, "apiParallelism: 3\n").unwrap();
        let mgr = ConfigManager::new(Some(p.clone()), None, RawConfig::default()).unwrap();
        std::fs::write(&p, "apiParallelism: [oops\n").unwrap();
        assert!(mgr.reload().is_err());
        assert_eq!(mgr.current().api_parallelism, 3);
        assert_eq!(mgr.epoch(), 0);
    }

    #[test]
    fn unchanged_reload_does_not_bump_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("c.yaml");
        std::fs::write(&p, "noPublish: true\n").unwrap();
        let mgr = ConfigManager::new(Some(p.clone()), None, RawConfig::default()).unwrap();
        assert!(!mgr.reload().unwrap());
        std::fs::write(&p, "noPublish: false\n").unwrap();
        assert!(mgr.reload().unwrap());
        assert_eq!(mgr.epoch(), 1);
    }

    #[test]
    fn options_sit_between_file_and_cmdline() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("c.yaml");
        std::fs::write(&p, "resyncPeriod: 2h\nextraLabelNs: [file.io]\n").unwrap();
        let cmd = RawConfig { api_parallelism: Some(7), ..Default::default() };
        let mgr = ConfigManager::new(Some(p), None, cmd).unwrap();
        assert!(mgr.apply_options(r#"{"extraLabelNs": ["opt.io"], "apiParallelism": 99}"#).unwrap());
        let c = mgr.current();
        assert_eq!(c.extra_label_ns.iter().cloned().collect::<Vec<_>>(), vec!["opt.io".to_string()]);
        assert_eq!(c.api_parallelism, 7);
        assert_eq!(c.resync_period, Duration::from_secs(7200));
        assert!(mgr.apply_options("{not json").is_err());
        assert_eq!(mgr.current().extra_label_ns.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_follows_file_edits_deletion_and_dir_recreation() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("conf");
        std::fs::create_dir(&dir).unwrap();
        let p = dir.join("nfd-master.conf");
        std::fs::write(&p, "noPublish: true\nresyncPeriod: 2h\n").unwrap();
        let cmd = RawConfig { extra_label_ns: Some(vec!["cmd.io".into()]), ..Default::default() };
        let mgr = Arc::new(ConfigManager::new(Some(p.clone()), None, cmd).unwrap());
        let mut rx = mgr.subscribe();
        let cancel = CancellationToken::new();
        let task = Arc::clone(&mgr).spawn_watcher(Duration::from_millis(200), cancel.clone());
        assert!(mgr.current().no_publish);

        std::fs::write(&p, "noPublish: false\nresyncPeriod: 3h\napiParallelism: 4\n").unwrap();
        assert!(wait_for(&mgr, |c| c.api_parallelism == 4).await);
        assert!(!mgr.current().no_publish);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        std::fs::remove_file(&p).unwrap();
        assert!(wait_for(&mgr, |c| c.api_parallelism == 10).await);
        assert_eq!(mgr.current().resync_period, Duration::from_secs(3600));
        assert!(mgr.current().extra_label_ns.contains("cmd.io"));

        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(&p, "apiParallelism: 2\n").unwrap();
        assert!(wait_for(&mgr, |c| c.api_parallelism == 2).await);
        assert!(mgr.current().extra_label_ns.contains("cmd.io"));

        cancel.cancel();
        task.await.unwrap();
    }
}
