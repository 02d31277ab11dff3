use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use application::control_loop::{ControlLoop, SharedSpecs};
use application::health_monitor::HealthMonitor;
use application::reconciler::{HealthView, Reconciler};
use infrastructure::config::Config;
use infrastructure::constants::{
    CONFIG_SIGNAL_CAPACITY, HEALTH_SIGNAL_CAPACITY, WATCHER_SHUTDOWN_TIMEOUT,
};
use infrastructure::logging::init_logging;
use ports::secondary::lb_table_port::LbTablePort;
use ports::secondary::snat_rule_port::SnatRulePort;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::Cli;

/// Run the daemon until SIGINT or SIGTERM.
pub async fn run_daemon(cli: &Cli, config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(Path::new(config_path))
        .with_context(|| format!("failed to load config from '{config_path}'"))?;
    init_from(cli, &config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path, "keel starting"
    );

    let specs = config.service_specs().context("invalid configuration")?;
    let (table, snat) = build_bindings()?;
    snat.ensure_chain().context("failed to set up snat chain")?;

    let (health_tx, health_rx) = mpsc::channel(HEALTH_SIGNAL_CAPACITY);
    let (config_tx, config_rx) = mpsc::channel(CONFIG_SIGNAL_CAPACITY);

    let monitor = Arc::new(HealthMonitor::new(
        health_tx,
        Arc::new(adapters::probe::StandardProbes),
    ));
    let reconciler = Arc::new(Reconciler::new(
        table,
        snat,
        Arc::clone(&monitor) as Arc<dyn HealthView>,
    ));

    let shared: SharedSpecs = Arc::new(RwLock::new(specs));
    let cancel = CancellationToken::new();

    let watcher_handle = crate::watcher::spawn_config_watcher(
        config_path.to_string(),
        Arc::clone(&shared),
        config_tx,
        cancel.clone(),
    );

    let control = ControlLoop::new(shared, monitor, reconciler, config_rx, health_rx);
    let control_handle = tokio::spawn(control.run(cancel.clone()));

    let signal = wait_for_exit_signal().await?;
    info!(signal, "shutdown signal received");
    cancel.cancel();

    let _ = control_handle.await;

    // Source-rewrite rules are left installed on purpose: they persist across
    // restarts so a rolling upgrade does not disrupt traffic.
    let _ = tokio::time::timeout(WATCHER_SHUTDOWN_TIMEOUT, watcher_handle).await;
    info!("keel stopped");
    Ok(())
}

/// Block until the operator asks keel to stop.
///
/// SIGINT and SIGTERM both mean graceful shutdown; the returned name only
/// feeds the shutdown log line.
#[cfg(unix)]
async fn wait_for_exit_signal() -> anyhow::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    Ok(tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    })
}

#[cfg(not(unix))]
async fn wait_for_exit_signal() -> anyhow::Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt")?;
    Ok("interrupt")
}

/// Run a single reconcile pass and exit; any reconcile or validation error
/// yields a non-zero exit code.
pub async fn run_once(cli: &Cli, config_path: &str) -> anyhow::Result<()> {
    let config = Config::load(Path::new(config_path))
        .with_context(|| format!("failed to load config from '{config_path}'"))?;
    init_from(cli, &config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_path, "running single reconcile"
    );

    let specs = config.service_specs().context("invalid configuration")?;
    let (table, snat) = build_bindings()?;
    snat.ensure_chain().context("failed to set up snat chain")?;

    let (health_tx, health_rx) = mpsc::channel(HEALTH_SIGNAL_CAPACITY);
    let (_config_tx, config_rx) = mpsc::channel(CONFIG_SIGNAL_CAPACITY);

    // No targets are ever registered, so every backend counts as healthy.
    let monitor = Arc::new(HealthMonitor::new(
        health_tx,
        Arc::new(adapters::probe::StandardProbes),
    ));
    let reconciler = Arc::new(Reconciler::new(
        table,
        snat,
        Arc::clone(&monitor) as Arc<dyn HealthView>,
    ));

    let shared: SharedSpecs = Arc::new(RwLock::new(specs));
    let control = ControlLoop::new(shared, monitor, reconciler, config_rx, health_rx);

    match control.run_once().await {
        Ok(summary) => {
            info!(
                services_created = summary.services_created,
                services_updated = summary.services_updated,
                services_deleted = summary.services_deleted,
                destinations_created = summary.destinations_created,
                destinations_updated = summary.destinations_updated,
                destinations_deleted = summary.destinations_deleted,
                "reconcile complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "reconcile failed");
            Err(e.into())
        }
    }
}

fn init_from(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let level = cli.log_level.unwrap_or(config.global.log_level);
    let format = cli.log_format.unwrap_or(config.global.log_format);
    init_logging(level, format).context("failed to initialize logging")?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn build_bindings() -> anyhow::Result<(Arc<dyn LbTablePort>, Arc<dyn SnatRulePort>)> {
    let table = adapters::ipvs::NetlinkLbTable::open()
        .context("failed to open ipvs netlink handle (is the ip_vs module loaded?)")?;
    info!("ipvs netlink handle opened");
    Ok((
        Arc::new(table),
        Arc::new(adapters::snat::IptablesSnatRules::new()),
    ))
}

#[cfg(not(target_os = "linux"))]
fn build_bindings() -> anyhow::Result<(Arc<dyn LbTablePort>, Arc<dyn SnatRulePort>)> {
    tracing::warn!("no kernel ipvs support on this platform, using in-memory bindings");
    Ok((
        Arc::new(adapters::ipvs::MemoryLbTable::new()),
        Arc::new(adapters::snat::MemorySnatRules::new()),
    ))
}
