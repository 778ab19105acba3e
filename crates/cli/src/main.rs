use std::fmt::Debug;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_informer::{EventHandler, InformerConfig, InformerFactory, Resource};
use tether_kubehub::{KubeListWatch, KubeObject};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether demo client")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Label selector, e.g. "app=nginx"
    #[arg(short = 'l', long = "selector", global = true)]
    labels: Option<String>,

    /// Informer config file (JSON); overrides TETHER_* env values
    #[arg(long = "config", global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Resync period in seconds (0 disables)
    #[arg(long = "resync-secs", global = true)]
    resync_secs: Option<u64>,

    /// Delta queue capacity
    #[arg(long = "queue-cap", global = true)]
    queue_cap: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind { Pods, Deployments }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync a cache once and print its contents
    Ls {
        kind: Kind,
        /// Give up waiting for the initial list after this many seconds
        #[arg(long = "sync-timeout", default_value_t = 30)]
        sync_timeout: u64,
    },
    /// Run an informer and print +/~/-/= lines per event until Ctrl-C
    Watch {
        kind: Kind,
        /// After sync, print this object from the cache (name, or namespace/name)
        #[arg(long = "get")]
        get: Option<String>,
        #[arg(long = "sync-timeout", default_value_t = 30)]
        sync_timeout: u64,
    },
}

/// Logs go to stderr so `-o json` output stays clean on stdout. Metrics are
/// exported only when `TETHER_METRICS_ADDR` names a socket address.
fn init_observability() {
    let filter = std::env::var("TETHER_LOG")
        .ok()
        .and_then(|v| tracing_subscriber::EnvFilter::from_str(&v).ok())
        .unwrap_or_else(|| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();

    let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") else { return };
    let installed = addr
        .parse::<std::net::SocketAddr>()
        .map_err(|e| e.to_string())
        .and_then(|sock| metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install().map_err(|e| e.to_string()));
    match installed {
        Ok(()) => info!(addr = %addr, "informer metrics exported"),
        Err(error) => warn!(addr = %addr, %error, "metrics exporter not installed"),
    }
}

/// Overlay `patch` onto `base`, recursing into objects.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(b), serde_json::Value::Object(p)) => {
            for (k, v) in p {
                match b.get_mut(&k) {
                    Some(slot) => merge_json(slot, v),
                    None => { b.insert(k, v); }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// defaults < env < config file < flags
fn load_config(cli: &Cli) -> Result<InformerConfig> {
    let mut cfg = InformerConfig::from_env();
    if let Some(path) = &cli.config {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let patch: serde_json::Value = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        let mut merged = serde_json::to_value(&cfg)?;
        merge_json(&mut merged, patch);
        cfg = serde_json::from_value(merged).context("invalid informer config")?;
    }
    if let Some(v) = cli.resync_secs { cfg.resync_secs = v; }
    if let Some(v) = cli.queue_cap { cfg.queue_capacity = v; }
    Ok(cfg)
}

fn namespaced_api<K>(client: Client, ns: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match ns {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_observability();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let client = Client::try_default().await.context("building kube client")?;
    let ns = cli.namespace.as_deref();

    match (&cli.command, kind_of(&cli.command)) {
        (Commands::Ls { sync_timeout, .. }, Kind::Pods) => ls::<Pod>(&cli, namespaced_api(client, ns), config, *sync_timeout).await,
        (Commands::Ls { sync_timeout, .. }, Kind::Deployments) => {
            ls::<Deployment>(&cli, namespaced_api(client, ns), config, *sync_timeout).await
        }
        (Commands::Watch { get, sync_timeout, .. }, Kind::Pods) => {
            watch::<Pod>(&cli, namespaced_api(client, ns), config, get.as_deref(), *sync_timeout).await
        }
        (Commands::Watch { get, sync_timeout, .. }, Kind::Deployments) => {
            watch::<Deployment>(&cli, namespaced_api(client, ns), config, get.as_deref(), *sync_timeout).await
        }
    }
}

fn kind_of(cmd: &Commands) -> Kind {
    match cmd {
        Commands::Ls { kind, .. } | Commands::Watch { kind, .. } => *kind,
    }
}

fn source<K>(cli: &Cli, api: Api<K>) -> KubeListWatch<K> {
    let src = KubeListWatch::new(api).with_env();
    match &cli.labels {
        Some(l) => src.labels(l.clone()),
        None => src,
    }
}

enum SyncOutcome { Synced, TimedOut, Interrupted }

async fn wait_synced(factory: &InformerFactory, stop: &CancellationToken, timeout_secs: u64) -> SyncOutcome {
    tokio::select! {
        synced = factory.wait_for_cache_sync(stop) => if synced { SyncOutcome::Synced } else { SyncOutcome::Interrupted },
        _ = tokio::time::sleep(Duration::from_secs(timeout_secs)) => SyncOutcome::TimedOut,
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received while waiting for cache sync");
            stop.cancel();
            SyncOutcome::Interrupted
        }
    }
}

#[derive(Serialize)]
struct Row {
    namespace: Option<String>,
    name: String,
    age: String,
    resource_version: Option<String>,
}

fn row_of<K: kube::Resource>(obj: &K) -> Row {
    let meta = obj.meta();
    Row {
        namespace: meta.namespace.clone(),
        name: meta.name.clone().unwrap_or_default(),
        age: render_age(meta.creation_timestamp.as_ref().map(|t| t.0)),
        resource_version: meta.resource_version.clone(),
    }
}

async fn ls<K>(cli: &Cli, api: Api<K>, config: InformerConfig, sync_timeout: u64) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    info!(ns = ?cli.namespace, "ls invoked");
    let factory = InformerFactory::new(InformerConfig { resync_secs: 0, ..config });
    let informer = factory.informer::<KubeObject<K>, _>(source(cli, api));
    let stop = CancellationToken::new();
    factory.start(&stop)?;
    let outcome = wait_synced(&factory, &stop, sync_timeout).await;
    let rows: Vec<Row> = informer.lister().list_all().iter().map(|o| row_of(&o.0)).collect();
    informer.shutdown().await;
    match outcome {
        SyncOutcome::Synced => {}
        SyncOutcome::TimedOut => bail!("timed out after {sync_timeout}s waiting for cache sync"),
        SyncOutcome::Interrupted => return Ok(()),
    }

    match cli.output {
        Output::Human => {
            println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
            for r in rows {
                println!("{:<20} {:<40} {}", r.namespace.as_deref().unwrap_or("-"), r.name, r.age);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    Ok(())
}

/// Prints one line per notification.
struct Printer<K>(PhantomData<fn() -> K>);

fn key_of<K>(obj: &KubeObject<K>) -> String
where
    K: kube::Resource + Clone + Send + Sync + 'static,
{
    obj.key().map(|k| k.to_string()).unwrap_or_else(|_| "<unnamed>".to_string())
}

impl<K> EventHandler<KubeObject<K>> for Printer<K>
where
    K: kube::Resource + Clone + Send + Sync + 'static,
{
    fn on_add(&self, obj: &Arc<KubeObject<K>>) { println!("+ {}", key_of(obj)) }

    fn on_update(&self, old: &Arc<KubeObject<K>>, new: &Arc<KubeObject<K>>) {
        let rv = |o: &KubeObject<K>| o.version().map(|v| v.to_string()).unwrap_or_else(|| "?".into());
        println!("~ {} {} -> {}", key_of(new), rv(old), rv(new))
    }

    fn on_delete(&self, obj: &Arc<KubeObject<K>>) { println!("- {}", key_of(obj)) }

    fn on_sync(&self, obj: &Arc<KubeObject<K>>) { println!("= {}", key_of(obj)) }
}

async fn watch<K>(cli: &Cli, api: Api<K>, config: InformerConfig, get: Option<&str>, sync_timeout: u64) -> Result<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    info!(ns = ?cli.namespace, resync_secs = config.resync_secs, "watch invoked");
    let factory = InformerFactory::new(config);
    let informer = factory.informer::<KubeObject<K>, _>(source(cli, api));
    informer.add_event_handler(Printer::<K>(PhantomData))?;
    let stop = CancellationToken::new();
    factory.start(&stop)?;

    match wait_synced(&factory, &stop, sync_timeout).await {
        SyncOutcome::Synced => info!(objects = informer.lister().list_all().len(), "cache synced"),
        SyncOutcome::TimedOut => {
            informer.shutdown().await;
            bail!("timed out after {sync_timeout}s waiting for cache sync");
        }
        SyncOutcome::Interrupted => {
            informer.shutdown().await;
            return Ok(());
        }
    }

    if let Some(target) = get {
        let found = if target.contains('/') {
            informer.get_by_key(target)?
        } else {
            informer.lister().namespaced(cli.namespace.clone().unwrap_or_else(|| "default".into())).get(target)
        };
        match found {
            Some(obj) => match cli.output {
                Output::Human => {
                    let r = row_of(&obj.0);
                    println!("found {} (resourceVersion {}, age {})", key_of(&obj), r.resource_version.unwrap_or_default(), r.age);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&obj.0)?),
            },
            None => warn!(name = %target, "not found in cache"),
        }
    }

    if signal::ctrl_c().await.is_err() {
        warn!("cannot listen for Ctrl-C; stopping");
    }
    info!(health = ?informer.health(), last_rv = ?informer.last_sync_resource_version(), "shutting down");
    stop.cancel();
    informer.shutdown().await;
    Ok(())
}

fn render_age(created: Option<DateTime<Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}
