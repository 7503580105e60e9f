use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nodefeat_config::{ConfigManager, RawConfig};
use nodefeat_core::{FeatureSet, RuleSet};
use nodefeat_kubehub::{get_kube_client, watch_sources, KubeNodeStore};
use nodefeat_master::Master;
use nodefeat_rules::{evaluate_rule_sets, NamespaceFilter};
use serde::Deserialize;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG: &str = "/etc/kubernetes/node-feature-discovery/nfd-master.conf";
const CONFIG_POLL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "nodefeatd", version, about = "Node feature reconciler")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Configuration sources. Flags given here override the file and `--options`.
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Configuration file; a missing file counts as empty
    #[arg(long = "config", global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    /// Structured overrides (JSON or YAML) applied on top of the file
    #[arg(long = "options", global = true)]
    options: Option<String>,

    /// Compute node state but never write it
    #[arg(long = "no-publish", global = true, num_args = 0..=1, default_missing_value = "true")]
    no_publish: Option<bool>,

    #[arg(long = "enable-taints", global = true, num_args = 0..=1, default_missing_value = "true")]
    enable_taints: Option<bool>,

    /// Extra namespaces allowed for labels (comma separated)
    #[arg(long = "extra-label-ns", global = true, value_delimiter = ',')]
    extra_label_ns: Option<Vec<String>>,

    /// Label namespaces to deny; a leading '*.' or '.' denies all subdomains
    #[arg(long = "deny-label-ns", global = true, value_delimiter = ',')]
    deny_label_ns: Option<Vec<String>>,

    /// Labels published as extended resources instead
    #[arg(long = "resource-labels", global = true, value_delimiter = ',')]
    resource_labels: Option<Vec<String>>,

    /// Regex on label names (without namespace) that are allowed in any namespace
    #[arg(long = "label-whitelist", global = true)]
    label_whitelist: Option<String>,

    /// Full resync interval, e.g. "1h" or "90s"
    #[arg(long = "resync-period", global = true)]
    resync_period: Option<String>,

    /// Concurrent node updates
    #[arg(long = "api-parallelism", global = true)]
    api_parallelism: Option<usize>,
}

impl ConfigArgs {
    /// Command-line layer; only flags that were given are set.
    fn cmdline(&self) -> RawConfig {
        RawConfig {
            no_publish: self.no_publish,
            enable_taints: self.enable_taints,
            extra_label_ns: self.extra_label_ns.clone(),
            deny_label_ns: self.deny_label_ns.clone(),
            resource_labels: self.resource_labels.clone(),
            label_white_list: self.label_whitelist.clone(),
            resync_period: self.resync_period.clone(),
            api_parallelism: self.api_parallelism,
            leader_election: None,
        }
    }

    fn manager(&self) -> Result<ConfigManager> {
        ConfigManager::new(Some(self.config.clone()), self.options.as_deref(), self.cmdline())
            .with_context(|| format!("loading configuration from {}", self.config.display()))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile cluster nodes (default)
    Run,
    /// Print the effective configuration as JSON
    Config,
    /// Evaluate rules against a feature file offline and print the resulting node update
    Eval {
        /// YAML file with one rule set or a list of them
        #[arg(long = "rules")]
        rules: PathBuf,
        /// YAML feature set
        #[arg(long = "features")]
        features: PathBuf,
        #[arg(long = "node", default_value = "local")]
        node: String,
    },
}

fn init_tracing() {
    let env = std::env::var("NODEFEAT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("NODEFEAT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid NODEFEAT_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RulesDoc {
    Many(Vec<RuleSet>),
    One(RuleSet),
}

fn parse_rules(s: &str) -> Result<Vec<RuleSet>> {
    Ok(match serde_yaml::from_str::<RulesDoc>(s).context("parsing rules")? {
        RulesDoc::Many(v) => v,
        RulesDoc::One(r) => vec![r],
    })
}

fn eval(args: &ConfigArgs, rules: &Path, features: &Path, node: &str) -> Result<()> {
    let manager = args.manager()?;
    let rule_sets = parse_rules(&std::fs::read_to_string(rules).with_context(|| format!("reading {}", rules.display()))?)?;
    let features: FeatureSet =
        serde_yaml::from_str(&std::fs::read_to_string(features).with_context(|| format!("reading {}", features.display()))?)
            .context("parsing features")?;
    let ev = evaluate_rule_sets(node, &rule_sets, &features);
    info!(fired = ?ev.fired, errors = ev.errors.len(), "eval: rules evaluated");
    let cfg = manager.current();
    let out = NamespaceFilter::new(&cfg).filter_request(ev.request);
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(args: &ConfigArgs) -> Result<()> {
    let manager = Arc::new(args.manager()?);
    let cancel = CancellationToken::new();
    let config_watcher = Arc::clone(&manager).spawn_watcher(CONFIG_POLL, cancel.clone());

    let client = get_kube_client().await?;
    let store = Arc::new(KubeNodeStore::new(client.clone()));
    let master = Master::new(Arc::clone(&manager), store);

    let (ev_tx, ev_rx) = mpsc::channel(256);
    // Label pushes have no transport in this binary; the channel stays empty.
    let (_push_tx, push_rx) = mpsc::channel(1);
    let sources = tokio::spawn(watch_sources(client, ev_tx, cancel.clone()));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
                return;
            }
            info!("interrupt received; shutting down");
            cancel.cancel();
        }
    });

    let res = master.run(ev_rx, push_rx, cancel.clone()).await;
    cancel.cancel();
    if let Err(e) = sources.await {
        warn!(error = %e, "source watcher task failed");
    }
    if let Err(e) = config_watcher.await {
        warn!(error = %e, "config watcher task failed");
    }
    res
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&cli.config).await,
        Commands::Config => {
            let manager = cli.config.manager()?;
            println!("{}", serde_json::to_string_pretty(&manager.current().to_raw())?);
            Ok(())
        }
        Commands::Eval { rules, features, node } => eval(&cli.config, &rules, &features, &node),
    }
}
