mod cache;
mod collectors;
mod config;
mod http;
mod metrics;
mod poller;
mod scan;
mod state;

use axum::serve;
use cache::DifferentialCache;
use clap::Parser;
use collectors::system::SysinfoSource;
use collectors::MetricSnapshot;
use config::{Config, ConfigError};
use metrics::Metrics;
use poller::{now_unix, SnapshotPoller};
use scan::checks::SystemChecks;
use scan::consent::{ConsentPrompt, FixedAnswer, LinePrompt};
use scan::orchestrator::FullScanOrchestrator;
use scan::privilege::{PrivilegeProbe, ProcessPrivilege};
use scan::runner::CommandRunner;
use scan::{PassSummary, ScanError, ScanEvent};
use state::{AlertTransition, State};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "./config.yaml";

#[derive(Parser, Debug)]
#[command(name = "sentineld")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run one full scan pass in the foreground and exit.
    #[arg(long)]
    scan: bool,
    /// With --scan, print the pass summary as JSON.
    #[arg(long, requires = "scan")]
    json: bool,
    #[arg(long, conflicts_with = "assume_no")]
    assume_yes: bool,
    #[arg(long, conflicts_with = "assume_yes")]
    assume_no: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    if cli.scan {
        let consent: Arc<dyn ConsentPrompt> = if cli.assume_yes {
            Arc::new(FixedAnswer(true))
        } else if cli.assume_no {
            Arc::new(FixedAnswer(false))
        } else {
            Arc::new(LinePrompt::stdio())
        };
        let code = run_scan_foreground(&cfg, consent, cli.json).await;
        std::process::exit(code);
    }

    run_daemon(cfg, cli.assume_yes).await;
}

/// The default path may be absent; an explicitly named file must exist.
fn load_config(path: &str) -> Result<Config, ConfigError> {
    if path == DEFAULT_CONFIG_PATH && !Path::new(path).exists() {
        info!(path, "config file not found, using defaults");
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    Config::load_from_file(path)
}

fn build_orchestrator(
    cfg: &Config,
    consent: Arc<dyn ConsentPrompt>,
) -> Result<(FullScanOrchestrator, UnboundedReceiver<ScanEvent>), ScanError> {
    let privilege: Arc<dyn PrivilegeProbe> = Arc::new(ProcessPrivilege);
    let checks = Arc::new(SystemChecks::new(
        CommandRunner::system(),
        Arc::clone(&privilege),
        &cfg.scan,
    ));
    let (events_tx, events_rx) = unbounded_channel();
    let orchestrator = FullScanOrchestrator::new(
        checks.full_scan_list(),
        privilege,
        consent,
        events_tx,
        &cfg.scan,
    )?;
    Ok((orchestrator, events_rx))
}

async fn run_scan_foreground(cfg: &Config, consent: Arc<dyn ConsentPrompt>, json: bool) -> i32 {
    let (orchestrator, mut events) = match build_orchestrator(cfg, consent) {
        Ok(pair) => pair,
        Err(err) => {
            error!(error = %err, "failed to prepare full scan");
            return 1;
        }
    };

    let worker = tokio::task::spawn_blocking(move || orchestrator.start());
    while let Some(event) = events.recv().await {
        if let ScanEvent::Check(status) = &event {
            println!("{:<22} {}", status.name, status.message);
        }
    }

    match worker.await {
        Ok(Ok(summary)) => {
            if json {
                print_summary_json(&summary);
            }
            if summary.has_failures() {
                2
            } else {
                0
            }
        }
        Ok(Err(err)) => {
            eprintln!("{err}");
            2
        }
        Err(err) => {
            error!(error = %err, "scan worker ended abnormally");
            1
        }
    }
}

fn print_summary_json(summary: &PassSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(text) => println!("{text}"),
        Err(err) => error!(error = %err, "failed to encode scan summary"),
    }
}

async fn run_daemon(cfg: Config, assume_yes: bool) {
    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        http_enabled = cfg.http_enabled,
        "starting sentineld"
    );

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialise metrics");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = if cfg.http_enabled {
        let listen = cfg.listen.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        }))
    } else {
        None
    };

    let (snapshot_tx, snapshot_rx) = unbounded_channel();
    let poller = SnapshotPoller::spawn(
        Box::new(SysinfoSource::new()),
        Duration::from_secs(cfg.interval_secs),
        snapshot_tx,
    );

    let delivery_task = tokio::spawn(deliver_snapshots(
        snapshot_rx,
        DifferentialCache::new(cfg.monitor.temp_alert_threshold_celsius),
        shared_state.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    let scan_task = if cfg.scan.run_on_start {
        spawn_startup_scan(&cfg, assume_yes, shared_state.clone(), metrics.clone())
    } else {
        None
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);

    poller.shutdown().await;
    let _ = delivery_task.await;
    if let Some(task) = http_task {
        let _ = task.await;
    }
    if let Some(task) = scan_task {
        if !task.is_finished() {
            warn!("full scan still running, exiting without waiting; remaining checks are abandoned");
        }
    }
}

/// Single consumer of the snapshot stream; owns the cache so no lock is needed.
async fn deliver_snapshots(
    mut snapshots: UnboundedReceiver<Arc<MetricSnapshot>>,
    mut cache: DifferentialCache,
    shared_state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("stop signal received, ending snapshot delivery");
                break;
            }
            next = snapshots.recv() => {
                let Some(snapshot) = next else {
                    break;
                };
                let updates = cache.apply(&snapshot);
                let (transitions, critical, started_at) = {
                    let mut guard = shared_state.write().await;
                    let transitions = guard.update_collected(Arc::clone(&snapshot), &updates);
                    (transitions, guard.critical_fields.len(), guard.started_at_unix)
                };

                for transition in transitions {
                    match transition {
                        AlertTransition::Raised { field, value } => {
                            warn!(field = %field, value = %value, "critical reading")
                        }
                        AlertTransition::Cleared { field } => {
                            info!(field = %field, "reading back to normal")
                        }
                    }
                }
                metrics.update_from_snapshot(&snapshot, started_at);
                metrics.record_cache_updates(&updates, critical);
            }
        }
    }
}

fn spawn_startup_scan(
    cfg: &Config,
    assume_yes: bool,
    shared_state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
) -> Option<tokio::task::JoinHandle<()>> {
    match build_orchestrator(cfg, Arc::new(FixedAnswer(assume_yes))) {
        Ok((orchestrator, events)) => Some(tokio::spawn(drive_scan_pass(
            orchestrator,
            events,
            shared_state,
            metrics,
        ))),
        Err(err) => {
            error!(error = %err, "failed to prepare startup scan");
            None
        }
    }
}

/// Runs one pass and mirrors its events into the shared state.
async fn drive_scan_pass(
    orchestrator: FullScanOrchestrator,
    mut events: UnboundedReceiver<ScanEvent>,
    shared_state: Arc<RwLock<State>>,
    metrics: Arc<Metrics>,
) {
    // A plain thread rather than spawn_blocking: runtime shutdown must not
    // wait for a pass in progress.
    let (done_tx, done_rx) = oneshot::channel();
    let spawned = thread::Builder::new()
        .name("startup-scan".to_string())
        .spawn(move || {
            let _ = done_tx.send(orchestrator.start());
        });
    if let Err(err) = spawned {
        error!(error = %err, "failed to start scan thread");
        return;
    }

    while let Some(event) = events.recv().await {
        if let ScanEvent::PassFinished(summary) = &event {
            metrics.record_scan_pass(summary);
        }
        shared_state.write().await.apply_scan_event(&event);
    }

    match done_rx.await {
        Ok(Ok(summary)) => info!(
            failed = summary.count("failed"),
            elapsed_ms = summary.elapsed_ms,
            "startup scan complete"
        ),
        Ok(Err(err)) => warn!(error = %err, "startup scan refused"),
        Err(_) => error!("scan thread ended abnormally"),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
