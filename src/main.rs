use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod preflight;
mod service;

use anyhow::Context;
use clap::Parser;
use tokio::time::MissedTickBehavior;

use hub_broker::config::HubConfig;
use hub_broker::coordinator::CoordinatorOrchestrator;
use hub_broker::gc::GcRunner;
use hub_broker::metrics::Metrics;
use hub_broker::paths::{write_atomic, HubPaths};
use hub_broker::poller::SessionPoller;
use hub_broker::ratelimit::RateLimiter;
use hub_broker::registrar::Registrar;
use hub_broker::relay::RelayClient;
use hub_broker::session_cache::SessionCache;
use hub_broker::store::StateStore;
use hub_broker::threads::ThreadTracker;
use hub_broker::watcher::{self, SpoolWatcher};
use hub_broker::worker::{run_worker, DeliveryContext};

const EXIT_GENERIC: i32 = 1;
const EXIT_PREFLIGHT: i32 = 2;
const EXIT_RELAY_UNREACHABLE: i32 = 3;

#[derive(Debug, Parser)]
#[command(name = "agent-hub-daemon", version)]
#[command(about = "Multi-agent coordination daemon: routes spool messages into assistant sessions")]
struct Cli {
    /// Write a systemd user unit for the daemon and exit.
    #[arg(long)]
    install_service: bool,

    /// Remove the systemd user unit and exit.
    #[arg(long)]
    uninstall_service: bool,
}

fn main() {
    let cli = Cli::parse();
    let cfg = HubConfig::load();
    init_tracing(&cfg.log_level);

    if cli.install_service {
        match service::install() {
            Ok(path) => {
                println!("installed {}", path.display());
                println!("enable with: systemctl --user enable --now agent-hub-daemon");
                return;
            }
            Err(error) => {
                eprintln!("service install failed: {error:#}");
                std::process::exit(EXIT_GENERIC);
            }
        }
    }
    if cli.uninstall_service {
        match service::uninstall() {
            Ok(true) => {
                println!("removed agent-hub-daemon.service");
                return;
            }
            Ok(false) => {
                println!("agent-hub-daemon.service was not installed");
                return;
            }
            Err(error) => {
                eprintln!("service uninstall failed: {error:#}");
                std::process::exit(EXIT_GENERIC);
            }
        }
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(error) => {
            eprintln!("failed to start runtime: {error}");
            std::process::exit(EXIT_GENERIC);
        }
    };
    let code = runtime.block_on(run(cfg));
    std::process::exit(code);
}

async fn run(cfg: HubConfig) -> i32 {
    if let Err(error) = preflight::check_agent_hub_mcp(&preflight::relay_host_config_path()) {
        tracing::error!(%error, "preflight failed");
        eprintln!("{}", preflight::GUIDANCE);
        return EXIT_PREFLIGHT;
    }

    let relay = Arc::new(RelayClient::new(cfg.relay_base_url(), cfg.injection_timeout()));
    if let Err(error) = relay.ensure_relay_running(cfg.opencode_port).await {
        tracing::error!(%error, "relay unreachable");
        return EXIT_RELAY_UNREACHABLE;
    }

    match run_daemon(cfg, relay).await {
        Ok(()) => 0,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "daemon failed");
            EXIT_GENERIC
        }
    }
}

async fn run_daemon(cfg: HubConfig, relay: Arc<RelayClient>) -> anyhow::Result<()> {
    let paths = HubPaths::new(cfg.hub_dir.clone());
    paths.ensure_dirs().context("failed creating hub directories")?;

    let metrics = Metrics::new();
    let store = Arc::new(StateStore::load(paths.clone()).context("failed loading state")?);
    let threads =
        Arc::new(ThreadTracker::load(paths.threads.clone()).context("failed loading threads")?);
    let cache = Arc::new(SessionCache::new(
        Duration::from_secs(cfg.session_cache_ttl_seconds),
        metrics.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(cfg.rate_limit.clone()));

    tracing::info!(
        hub = %paths.root.display(),
        relay = %relay.base_url(),
        workers = cfg.injection_workers,
        rate_limit = cfg.rate_limit.enabled,
        coordinator = cfg.coordinator.enabled,
        "agent-hub-daemon starting"
    );

    // The coordinator is best-effort: the pipeline works without it.
    let orchestrator =
        CoordinatorOrchestrator::new(cfg.coordinator.clone(), relay.clone(), store.clone());
    match orchestrator.start().await {
        Ok(Some(session_id)) => tracing::info!(session = %session_id, "coordinator ready"),
        Ok(None) => {}
        Err(error) => tracing::error!(%error, "coordinator startup failed, continuing without it"),
    }

    let registrar = Arc::new(Registrar::new(
        store.clone(),
        relay.clone(),
        metrics.clone(),
        paths.clone(),
        cfg.injection_retries,
        cfg.agent_stale_seconds,
        cfg.coordinator.enabled,
    ));

    let (tx, rx) = watcher::delivery_channel(1024);
    let ctx = Arc::new(DeliveryContext {
        relay: relay.clone(),
        cache: cache.clone(),
        store: store.clone(),
        threads: threads.clone(),
        limiter,
        metrics: metrics.clone(),
        archive_dir: paths.archive.clone(),
        message_ttl_ms: cfg.message_ttl_seconds as i64 * 1000,
        retries: cfg.injection_retries,
        backoff_base: cfg.injection_timeout(),
    });
    let mut workers = Vec::with_capacity(cfg.injection_workers);
    for _ in 0..cfg.injection_workers {
        workers.push(tokio::spawn(run_worker(ctx.clone(), rx.clone())));
    }

    // Recover files that arrived while the daemon was down, then watch.
    watcher::recover_spool(&paths.messages, &tx, &metrics)
        .await
        .context("spool recovery failed")?;
    let spool_watcher = SpoolWatcher::start(&paths.messages, tx.clone(), metrics.clone())
        .context("failed to start spool watcher")?;

    let poller = Arc::new(SessionPoller::new(
        relay.clone(),
        cache.clone(),
        store.clone(),
        registrar,
        metrics.clone(),
        Duration::from_secs(cfg.session_poll_seconds),
    ));
    let poller_task = tokio::spawn(poller.run());

    let gc = Arc::new(GcRunner::new(
        store.clone(),
        threads.clone(),
        paths.clone(),
        metrics.clone(),
        cfg.message_ttl_seconds,
        cfg.agent_stale_seconds,
        Duration::from_secs(cfg.gc_interval_seconds),
    ));
    let gc_task = tokio::spawn(gc.run());

    let metrics_task = tokio::spawn(metrics_writer(
        metrics.clone(),
        paths.metrics_file.clone(),
        cfg.metrics_interval_seconds,
    ));

    tracing::info!("agent-hub-daemon running");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }

    // Shutdown: stop intake, drain deliveries inside the grace period,
    // stop the periodic loops, then snapshot state. The relay process is
    // external and stays up.
    drop(spool_watcher);
    drop(tx);
    let grace = cfg.shutdown_grace();
    let drain = async {
        for handle in workers {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "drain grace period exceeded; pending messages stay in the spool for the next run"
        );
    }

    poller_task.abort();
    gc_task.abort();
    metrics_task.abort();

    store.flush().context("failed flushing state snapshots")?;
    if let Err(error) = write_atomic(&paths.metrics_file, metrics.render().as_bytes()) {
        tracing::warn!(%error, "failed writing final metrics");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn metrics_writer(metrics: Metrics, path: PathBuf, interval_seconds: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_seconds));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first write
    loop {
        if let Err(error) = write_atomic(&path, metrics.render().as_bytes()) {
            tracing::warn!(%error, "failed writing metrics file");
        }
        tracing::info!("metrics: {}", metrics.log_summary());
        ticker.tick().await;
    }
}

fn init_tracing(level: &str) {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
