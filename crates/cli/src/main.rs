use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use mimir_core::{InputSnapshot, PushError, Pusher, ReconciliationResult, RenderedView, StatusReporter};
use mimir_persist::{History, RecordingPusher, SqliteHistory};
use mimir_reconcile::Reconciler;
use mimir_render::{ClusterIdentity, Renderer};
use mimir_runtime::{spawn_reconcile, LogReporter, RuntimeConfig};
use mimir_schema::OptionSchema;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "mimirctl", version, about = "Mimir coordinator")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", env = "MIMIR_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Model name used in the memberlist cluster label (default: namespace)
    #[arg(long = "model", env = "MIMIR_MODEL", global = true)]
    model: Option<String>,

    /// Application name used in the memberlist cluster label
    #[arg(long = "app", env = "MIMIR_APP", global = true, default_value = "mimir")]
    app: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch relations in the namespace and reconcile until Ctrl-C
    Run {
        /// Log pass status instead of writing the status ConfigMap
        #[arg(long = "status-to-log", action = ArgAction::SetTrue)]
        status_to_log: bool,
    },
    /// Render the Mimir config for a snapshot file (offline)
    Render {
        /// Snapshot YAML: relations, workers, options
        snapshot: PathBuf,
        /// Print the reverse-proxy config instead
        #[arg(long = "proxy", action = ArgAction::SetTrue)]
        proxy: bool,
    },
    /// Run one reconcile pass over a snapshot file with an in-memory pusher
    Reconcile {
        snapshot: PathBuf,
    },
    /// Show views recently pushed to a worker
    History {
        unit: String,
        #[arg(long = "limit", default_value_t = 3)]
        limit: usize,
    },
    /// List the options the coordinator accepts
    Options,
}

fn init_tracing() {
    let env = std::env::var("MIMIR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MIMIR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MIMIR_METRICS_ADDR; expected host:port");
        }
    }
}

fn history_disabled() -> bool {
    std::env::var("MIMIR_DISABLE_HISTORY").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn load_snapshot(path: &Path) -> Result<InputSnapshot> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_snapshot(&text).with_context(|| format!("parsing {}", path.display()))
}

fn parse_snapshot(text: &str) -> Result<InputSnapshot> { Ok(serde_yaml::from_str(text)?) }

fn renderer(model: String, app: String) -> Renderer { Renderer::new(OptionSchema::mimir(), ClusterIdentity { model, app }) }

/// Keeps pushed views in memory; backs the offline `reconcile` command.
#[derive(Default)]
struct MemoryPusher {
    views: Mutex<Vec<RenderedView>>,
}

#[async_trait::async_trait]
impl Pusher for MemoryPusher {
    async fn push(&self, view: &RenderedView) -> Result<(), PushError> {
        self.views.lock().map_err(|_| PushError::Transport("memory pusher poisoned".into()))?.push(view.clone());
        Ok(())
    }
}

fn print_result(res: &ReconciliationResult) {
    println!("status: {}", res.status.name());
    if let Some(reason) = res.status.reason() {
        println!("reason: {}", reason);
    }
    if let Some(v) = &res.config_version {
        println!("config: {}", v);
    }
    println!("external url: {}", res.endpoints.external_url);
    println!("remote write: {}", res.endpoints.remote_write_url);
    for (role, unit) in &res.assignment.by_role {
        println!("  {} -> {}", role, unit);
    }
    for (role, units) in &res.conflicts {
        println!("  {} !! {}", role, units.iter().cloned().collect::<Vec<_>>().join(", "));
    }
    println!("pushed: {}  skipped: {}  failed: {}", res.pushed.len(), res.skipped.len(), res.failures.len());
    for d in &res.diagnostics {
        println!("  [{:?}] {}", d.severity(), d);
    }
}

async fn run(namespace: Option<String>, model: Option<String>, app: String, status_to_log: bool) -> Result<()> {
    let client = mimir_kubehub::get_kube_client().await?;
    let ns = namespace.unwrap_or_else(|| client.default_namespace().to_string());
    let model = model.unwrap_or_else(|| ns.clone());
    info!(ns = %ns, model = %model, app = %app, "coordinator starting");

    let mut pusher: Arc<dyn Pusher> = Arc::new(mimir_kubehub::ConfigMapPusher::new(client.clone(), &ns));
    if !history_disabled() {
        match SqliteHistory::open_default() {
            Ok(h) => pusher = Arc::new(RecordingPusher::new(pusher, Arc::new(h))),
            Err(e) => warn!(error = %e, "history db unavailable; pushes will not be recorded"),
        }
    }
    let reporter: Arc<dyn StatusReporter> = if status_to_log {
        Arc::new(LogReporter)
    } else {
        Arc::new(mimir_kubehub::ConfigMapReporter::new(client, &ns))
    };

    let (tx, handle, join) = spawn_reconcile(Reconciler::new(renderer(model, app)), pusher, reporter, RuntimeConfig::from_env());
    let watcher = tokio::spawn({
        let ns = ns.clone();
        let tx = tx.clone();
        async move {
            if let Err(e) = mimir_kubehub::watch_relations(&ns, tx).await {
                error!(error = ?e, "relation watcher failed");
            }
        }
    });
    drop(tx);

    let mut passes = handle.subscribe();
    let mut last_status = String::new();
    loop {
        tokio::select! {
            changed = passes.changed() => {
                if changed.is_err() {
                    warn!("reconcile loop ended");
                    break;
                }
                if let Some(res) = handle.current() {
                    let now = format!("{}:{}", res.status.name(), res.status.reason().unwrap_or(""));
                    if now != last_status {
                        info!(status = res.status.name(), reason = res.status.reason().unwrap_or(""), "status changed");
                        last_status = now;
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down");
                break;
            }
        }
    }

    watcher.abort();
    let _ = join.await;
    warn!("coordinator stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { status_to_log } => run(cli.namespace, cli.model, cli.app, status_to_log).await?,
        Commands::Render { snapshot, proxy } => {
            let snap = load_snapshot(&snapshot)?;
            let caps = mimir_registry::evaluate(&snap.relations);
            let resolution = mimir_roles::resolve(&snap.workers);
            let model = cli.model.or(cli.namespace).unwrap_or_else(|| "default".into());
            let cfg = renderer(model, cli.app)
                .render(&snap.options, &caps, &resolution.assignment)
                .map_err(|e| anyhow!("render failed: {}", e))?;
            match (cli.output, proxy) {
                (_, true) => print!("{}", cfg.proxy),
                (Output::Human, false) => print!("{}", cfg.yaml),
                (Output::Json, false) => println!("{}", serde_json::to_string_pretty(&cfg.document)?),
            }
        }
        Commands::Reconcile { snapshot } => {
            let snap = load_snapshot(&snapshot)?;
            let model = cli.model.or(cli.namespace).unwrap_or_else(|| "default".into());
            let pusher = MemoryPusher::default();
            let mut reconciler = Reconciler::new(renderer(model, cli.app));
            let res = reconciler.reconcile(&snap, &pusher).await;
            match cli.output {
                Output::Human => print_result(&res),
                Output::Json => println!("{}", serde_json::to_string_pretty(&res)?),
            }
        }
        Commands::History { unit, limit } => {
            let store = SqliteHistory::open_default()?;
            let rows = store.recent(&unit, Some(limit))?;
            match cli.output {
                Output::Human => {
                    if rows.is_empty() {
                        println!("no recorded views for {}", unit);
                    }
                    for r in rows {
                        println!("{}  {}  [{}]", r.ts, r.hash, r.roles);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Options => {
            let schema = OptionSchema::mimir();
            match cli.output {
                Output::Human => {
                    for s in schema.specs() {
                        println!("{:<32} default={:<8} {}", s.name, s.default.unwrap_or("-"), s.help);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(schema.specs())?),
            }
        }
    }
    Ok(())
}
