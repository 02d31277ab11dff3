use std::path::Path;

use application::control_loop::SharedSpecs;
use infrastructure::config::Config;
use infrastructure::constants::CONFIG_WATCH_DEBOUNCE;
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Spawn a background task that watches the config file for changes and
/// listens for SIGHUP.
///
/// On each trigger the file is re-read and validated; a valid configuration
/// is swapped into `shared` and the change signal fired, an invalid one is
/// logged and the previous configuration retained. The control loop never
/// reads the file itself.
pub fn spawn_config_watcher(
    config_path: String,
    shared: SharedSpecs,
    config_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // Channel for file watcher events → async task
        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(4);

        let tx_for_watcher = notify_tx.clone();
        let mut debouncer = match new_debouncer(
            CONFIG_WATCH_DEBOUNCE,
            move |res: Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                if let Ok(events) = res {
                    for event in &events {
                        if event.kind == DebouncedEventKind::Any {
                            let _ = tx_for_watcher.blocking_send(());
                            return; // one notification per batch is enough
                        }
                    }
                }
            },
        ) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create file watcher, hot-reload disabled");
                return;
            }
        };

        if let Err(e) = debouncer
            .watcher()
            .watch(Path::new(&config_path), notify::RecursiveMode::NonRecursive)
        {
            tracing::warn!(
                path = %config_path,
                error = %e,
                "failed to watch config file, hot-reload disabled"
            );
            return;
        }

        tracing::info!(path = %config_path, "config file watcher started");

        #[cfg(unix)]
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };

        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("config watcher shutting down");
                        break;
                    }
                    _ = notify_rx.recv() => {
                        tracing::info!("config file change detected, reloading");
                    }
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received, reloading configuration");
                    }
                }
            }

            #[cfg(not(unix))]
            {
                tokio::select! {
                    () = cancel.cancelled() => {
                        tracing::info!("config watcher shutting down");
                        break;
                    }
                    _ = notify_rx.recv() => {
                        tracing::info!("config file change detected, reloading");
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            reload(&config_path, &shared, &config_tx).await;
        }
    })
}

/// One reload attempt: parse, validate, convert, swap, signal.
async fn reload(config_path: &str, shared: &SharedSpecs, config_tx: &mpsc::Sender<()>) {
    let config = match Config::load(Path::new(config_path)) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected, keeping previous configuration");
            return;
        }
    };

    let specs = match config.service_specs() {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "config reload rejected, keeping previous configuration");
            return;
        }
    };

    let count = specs.len();
    *shared.write().await = specs;
    tracing::info!(services = count, "configuration reloaded");

    // Full channel means a pass is already pending; drop the token.
    let _ = config_tx.try_send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const VALID: &str = r#"
services:
  - name: web
    vip: 10.0.0.1
    port: 80
    scheduler: rr
    backends:
      - address: 192.168.1.10
        port: 8080
"#;

    #[tokio::test]
    async fn reload_swaps_specs_and_signals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, VALID).unwrap();

        let shared: SharedSpecs = Arc::new(RwLock::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(1);

        reload(path.to_str().unwrap(), &shared, &tx).await;

        assert_eq!(shared.read().await.len(), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn invalid_reload_keeps_previous_specs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, VALID).unwrap();

        let shared: SharedSpecs = Arc::new(RwLock::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(1);
        reload(path.to_str().unwrap(), &shared, &tx).await;
        let _ = rx.try_recv();

        std::fs::write(&path, "services: []").unwrap();
        reload(path.to_str().unwrap(), &shared, &tx).await;

        // Previous snapshot survives; no signal fired.
        assert_eq!(shared.read().await.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn missing_file_keeps_previous_specs() {
        let shared: SharedSpecs = Arc::new(RwLock::new(Vec::new()));
        let (tx, mut rx) = mpsc::channel(1);

        reload("/nonexistent/keel.yaml", &shared, &tx).await;
        assert!(rx.try_recv().is_err());
    }
}
