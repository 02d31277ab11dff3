use std::sync::Arc;

use domain::service::entity::ServiceSpec;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::health_monitor::HealthMonitor;
use crate::reconciler::{ReconcileError, ReconcileSummary, Reconciler};

/// Shared configuration snapshot, swapped atomically by the config watcher.
pub type SharedSpecs = Arc<RwLock<Vec<ServiceSpec>>>;

/// Serializes the asynchronous signals (startup, configuration change,
/// health transition) into reconcile passes.
///
/// The loop never reads configuration from disk; the watcher swaps the
/// shared snapshot and signals through `config_rx`. Both signal channels
/// have capacity 1 with drop-if-full senders, so bursts collapse into a
/// single pending pass.
pub struct ControlLoop {
    specs: SharedSpecs,
    monitor: Arc<HealthMonitor>,
    reconciler: Arc<Reconciler>,
    config_rx: mpsc::Receiver<()>,
    health_rx: mpsc::Receiver<()>,
}

impl ControlLoop {
    pub fn new(
        specs: SharedSpecs,
        monitor: Arc<HealthMonitor>,
        reconciler: Arc<Reconciler>,
        config_rx: mpsc::Receiver<()>,
        health_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            specs,
            monitor,
            reconciler,
            config_rx,
            health_rx,
        }
    }

    /// Run in daemon mode until the token is cancelled.
    ///
    /// The initial reconcile may fail on a transient kernel error; that is
    /// logged but does not prevent entering the loop, where the next signal
    /// retries.
    pub async fn run(mut self, cancel: CancellationToken) {
        let snapshot = self.specs.read().await.clone();
        self.monitor.update_targets(&snapshot);
        if let Err(e) = self.reconciler.reconcile(&snapshot) {
            error!(error = %e, "initial reconcile failed");
        }

        info!("control loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,

                Some(()) = self.config_rx.recv() => {
                    info!("configuration changed, reconciling");
                    let snapshot = self.specs.read().await.clone();
                    self.monitor.update_targets(&snapshot);
                    if let Err(e) = self.reconciler.reconcile(&snapshot) {
                        error!(error = %e, "reconcile after config change failed");
                    }
                }

                Some(()) = self.health_rx.recv() => {
                    info!("backend health changed, reconciling");
                    let snapshot = self.specs.read().await.clone();
                    if let Err(e) = self.reconciler.reconcile(&snapshot) {
                        error!(error = %e, "reconcile after health change failed");
                    }
                }
            }
        }

        self.monitor.stop();
        info!("control loop stopped");
    }

    /// Run a single reconcile pass without registering health targets, so
    /// every backend counts as healthy.
    ///
    /// The managed set starts empty, so pre-existing services are left in
    /// place: one-shot mode is additive and corrective, not authoritative.
    pub async fn run_once(self) -> Result<ReconcileSummary, ReconcileError> {
        let snapshot = self.specs.read().await.clone();
        let result = self.reconciler.reconcile(&snapshot);
        self.monitor.stop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::ipvs::MemoryLbTable;
    use adapters::snat::MemorySnatRules;
    use domain::health::entity::HealthCheckSpec;
    use domain::health::error::ProbeError;
    use domain::service::entity::{BackendSpec, Protocol, Scheduler};
    use ports::secondary::lb_table_port::LbTablePort;
    use ports::secondary::probe_port::{ProbeFactory, ProbeFuture, ProbePort};
    use ports::secondary::snat_rule_port::SnatRulePort;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct ScriptedProbe {
        ok: Arc<AtomicBool>,
    }

    impl ProbePort for ScriptedProbe {
        fn check(&self, target: SocketAddr) -> ProbeFuture<'_> {
            let ok = self.ok.load(Ordering::SeqCst);
            Box::pin(async move {
                if ok {
                    Ok(())
                } else {
                    Err(ProbeError::Connect {
                        addr: target,
                        reason: "scripted failure".to_string(),
                    })
                }
            })
        }
    }

    struct ScriptedFactory {
        ok: Arc<AtomicBool>,
    }

    impl ProbeFactory for ScriptedFactory {
        fn build(&self, _check: &HealthCheckSpec) -> Arc<dyn ProbePort> {
            Arc::new(ScriptedProbe { ok: Arc::clone(&self.ok) })
        }
    }

    fn spec(name: &str, port: u16, health_enabled: bool) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            vip: "10.0.0.1".parse().unwrap(),
            port,
            protocol: Protocol::Tcp,
            scheduler: Scheduler::RoundRobin,
            health_check: HealthCheckSpec {
                enabled: health_enabled,
                interval: Duration::from_millis(50),
                timeout: Duration::from_millis(20),
                fail_threshold: 2,
                rise_threshold: 2,
                ..HealthCheckSpec::default()
            },
            full_nat: false,
            snat_ip: None,
            backends: vec![BackendSpec {
                address: "192.168.1.10:8080".parse().unwrap(),
                weight: 1,
            }],
        }
    }

    struct Harness {
        table: Arc<MemoryLbTable>,
        specs: SharedSpecs,
        config_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn start(initial: Vec<ServiceSpec>, probe_ok: bool) -> Harness {
        let table = Arc::new(MemoryLbTable::new());
        let snat = Arc::new(MemorySnatRules::new());
        let ok = Arc::new(AtomicBool::new(probe_ok));

        let (health_tx, health_rx) = mpsc::channel(1);
        let (config_tx, config_rx) = mpsc::channel(1);

        let monitor = Arc::new(HealthMonitor::new(
            health_tx,
            Arc::new(ScriptedFactory { ok }),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&table) as Arc<dyn LbTablePort>,
            snat as Arc<dyn SnatRulePort>,
            Arc::clone(&monitor) as Arc<dyn crate::reconciler::HealthView>,
        ));

        let specs: SharedSpecs = Arc::new(RwLock::new(initial));
        let control = ControlLoop::new(
            Arc::clone(&specs),
            monitor,
            reconciler,
            config_rx,
            health_rx,
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(control.run(cancel.clone()));

        Harness { table, specs, config_tx, cancel, handle }
    }

    #[tokio::test(start_paused = true)]
    async fn initial_reconcile_installs_services() {
        let harness = start(vec![spec("web", 80, false)], true);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(harness.table.service_count(), 1);

        harness.cancel.cancel();
        harness.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn config_change_swaps_the_table() {
        let harness = start(vec![spec("web", 80, false)], true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(harness.table.service_count(), 1);

        *harness.specs.write().await = vec![spec("api", 8443, false)];
        harness.config_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let services = harness.table.list_services().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].port, 8443);

        harness.cancel.cancel();
        harness.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn health_transition_withdraws_backend() {
        let svc = spec("web", 80, true);
        let key = svc.key();
        let harness = start(vec![svc], false);

        tokio::time::sleep(Duration::from_millis(10)).await;
        // Fail-open: the backend routes until the fail threshold is crossed.
        assert_eq!(harness.table.list_destinations(&key).unwrap().len(), 1);

        // Two probe intervals cross fail_threshold = 2; the loop reconciles.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(harness.table.list_destinations(&key).unwrap().is_empty());
        // Service itself stays installed.
        assert_eq!(harness.table.service_count(), 1);

        harness.cancel.cancel();
        harness.handle.await.unwrap();
    }

    #[tokio::test]
    async fn run_once_reports_summary() {
        let table = Arc::new(MemoryLbTable::new());
        let snat = Arc::new(MemorySnatRules::new());
        let ok = Arc::new(AtomicBool::new(true));
        let (health_tx, health_rx) = mpsc::channel(1);
        let (_config_tx, config_rx) = mpsc::channel(1);
        let monitor = Arc::new(HealthMonitor::new(
            health_tx,
            Arc::new(ScriptedFactory { ok }),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&table) as Arc<dyn LbTablePort>,
            snat as Arc<dyn SnatRulePort>,
            Arc::clone(&monitor) as Arc<dyn crate::reconciler::HealthView>,
        ));

        // Health checks enabled, but no targets registered: one-shot treats
        // every backend as healthy.
        let specs: SharedSpecs = Arc::new(RwLock::new(vec![spec("web", 80, true)]));
        let control = ControlLoop::new(specs, monitor, reconciler, config_rx, health_rx);

        let summary = control.run_once().await.unwrap();
        assert_eq!(summary.services_created, 1);
        assert_eq!(summary.destinations_created, 1);
        assert_eq!(table.service_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_leaves_preexisting_services_alone() {
        let table = Arc::new(MemoryLbTable::new());
        // Something another process installed earlier.
        table
            .create_service(&spec("old", 9999, false).virtual_service())
            .unwrap();

        let snat = Arc::new(MemorySnatRules::new());
        let ok = Arc::new(AtomicBool::new(true));
        let (health_tx, health_rx) = mpsc::channel(1);
        let (_config_tx, config_rx) = mpsc::channel(1);
        let monitor = Arc::new(HealthMonitor::new(
            health_tx,
            Arc::new(ScriptedFactory { ok }),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&table) as Arc<dyn LbTablePort>,
            snat as Arc<dyn SnatRulePort>,
            Arc::clone(&monitor) as Arc<dyn crate::reconciler::HealthView>,
        ));

        let specs: SharedSpecs = Arc::new(RwLock::new(vec![spec("web", 80, false)]));
        let control = ControlLoop::new(specs, monitor, reconciler, config_rx, health_rx);
        control.run_once().await.unwrap();

        assert_eq!(table.service_count(), 2);
    }
}
