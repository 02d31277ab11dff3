use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use domain::health::entity::{BackendHealth, HealthCheckSpec};
use domain::service::entity::ServiceSpec;
use ports::secondary::probe_port::{ProbeFactory, ProbePort};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::reconciler::HealthView;

struct BackendStatus {
    health: BackendHealth,
    fail_threshold: u32,
    rise_threshold: u32,
    cancel: CancellationToken,
}

/// Active health monitor: one probe loop per tracked backend.
///
/// State transitions are published as a non-blocking send on a capacity-1
/// channel, so any number of transitions between two reconcile passes
/// collapse into a single pending pass. The send happens after the state
/// change is visible to `is_healthy` and outside the state lock.
pub struct HealthMonitor {
    statuses: Mutex<HashMap<SocketAddr, BackendStatus>>,
    probes: Arc<dyn ProbeFactory>,
    notify: mpsc::Sender<()>,
}

impl HealthMonitor {
    pub fn new(notify: mpsc::Sender<()>, probes: Arc<dyn ProbeFactory>) -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
            probes,
            notify,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, BackendStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a backend may receive traffic.
    ///
    /// Unknown addresses report healthy: backends of services with health
    /// checks disabled are never tracked, and a monitor without registered
    /// targets treats everything as routable.
    pub fn is_healthy(&self, address: SocketAddr) -> bool {
        self.lock().get(&address).is_none_or(|s| s.health.healthy)
    }

    /// Number of backends currently being probed.
    pub fn tracked_count(&self) -> usize {
        self.lock().len()
    }

    /// Synchronize probe loops with the given configuration: start probing
    /// new backends of health-checked services, stop probing backends that
    /// are gone or whose service disabled checks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn update_targets(self: &Arc<Self>, specs: &[ServiceSpec]) {
        let mut desired: HashMap<SocketAddr, HealthCheckSpec> = HashMap::new();
        let mut referenced: HashSet<SocketAddr> = HashSet::new();

        for spec in specs {
            for backend in &spec.backends {
                referenced.insert(backend.address);
                if spec.health_check.enabled {
                    // First service referencing an address wins its settings.
                    desired
                        .entry(backend.address)
                        .or_insert_with(|| spec.health_check.clone());
                }
            }
        }

        let mut statuses = self.lock();

        statuses.retain(|address, status| {
            let keep = desired.contains_key(address);
            if !keep {
                status.cancel.cancel();
                if referenced.contains(address) {
                    info!(backend = %address, "stopped health check (checks disabled)");
                } else {
                    info!(backend = %address, "stopped health check for removed backend");
                }
            }
            keep
        });

        for (address, check) in desired {
            if statuses.contains_key(&address) {
                continue;
            }
            let cancel = CancellationToken::new();
            statuses.insert(
                address,
                BackendStatus {
                    health: BackendHealth::new(),
                    fail_threshold: check.fail_threshold,
                    rise_threshold: check.rise_threshold,
                    cancel: cancel.clone(),
                },
            );
            info!(backend = %address, kind = %check.kind, "started health check");

            let monitor = Arc::clone(self);
            let probe = self.probes.build(&check);
            tokio::spawn(probe_loop(monitor, address, check, probe, cancel));
        }
    }

    /// Cancel every probe loop and drop all state.
    pub fn stop(&self) {
        let mut statuses = self.lock();
        for (address, status) in statuses.iter() {
            status.cancel.cancel();
            debug!(backend = %address, "stopped health check");
        }
        statuses.clear();
        info!("all health checks stopped");
    }

    /// Feed one probe outcome into the state machine; fires the change
    /// signal iff the backend crossed a threshold.
    fn record(&self, address: SocketAddr, result: Result<(), impl std::fmt::Display>) {
        let transitioned = {
            let mut statuses = self.lock();
            let Some(status) = statuses.get_mut(&address) else {
                return;
            };
            match result {
                Ok(()) => {
                    let up = status.health.record_success(status.rise_threshold);
                    if up {
                        info!(
                            backend = %address,
                            consecutive_oks = status.health.consecutive_oks,
                            "backend marked healthy"
                        );
                    }
                    up
                }
                Err(e) => {
                    let down = status.health.record_failure(status.fail_threshold);
                    if down {
                        warn!(
                            backend = %address,
                            consecutive_fails = status.health.consecutive_fails,
                            error = %e,
                            "backend marked unhealthy"
                        );
                    }
                    down
                }
            }
        };

        if transitioned {
            // Full channel means a pass is already pending; drop the token.
            let _ = self.notify.try_send(());
        }
    }
}

impl HealthView for HealthMonitor {
    fn is_healthy(&self, address: SocketAddr) -> bool {
        HealthMonitor::is_healthy(self, address)
    }
}

async fn probe_loop(
    monitor: Arc<HealthMonitor>,
    address: SocketAddr,
    check: HealthCheckSpec,
    probe: Arc<dyn ProbePort>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(check.interval) => {}
        }
        let outcome = tokio::select! {
            () = cancel.cancelled() => return,
            outcome = probe.check(address) => outcome,
        };
        monitor.record(address, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::health::entity::ProbeKind;
    use domain::health::error::ProbeError;
    use domain::service::entity::{BackendSpec, Protocol, Scheduler, ServiceSpec};
    use ports::secondary::probe_port::ProbeFuture;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Probe whose outcome is flipped by the test.
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

    fn check_spec(fail: u32, rise: u32) -> HealthCheckSpec {
        HealthCheckSpec {
            enabled: true,
            kind: ProbeKind::Tcp,
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            fail_threshold: fail,
            rise_threshold: rise,
            http_path: "/".to_string(),
            http_expected_status: 200,
        }
    }

    fn service(name: &str, hc: HealthCheckSpec, backends: &[&str]) -> ServiceSpec {
        ServiceSpec {
            name: name.to_string(),
            vip: "10.0.0.1".parse().unwrap(),
            port: 80,
            protocol: Protocol::Tcp,
            scheduler: Scheduler::RoundRobin,
            health_check: hc,
            full_nat: false,
            snat_ip: None,
            backends: backends
                .iter()
                .map(|a| BackendSpec { address: a.parse().unwrap(), weight: 1 })
                .collect(),
        }
    }

    fn monitor_with(ok: &Arc<AtomicBool>) -> (Arc<HealthMonitor>, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let factory = Arc::new(ScriptedFactory { ok: Arc::clone(ok) });
        (Arc::new(HealthMonitor::new(tx, factory)), rx)
    }

    #[tokio::test]
    async fn unknown_address_is_healthy() {
        let ok = Arc::new(AtomicBool::new(true));
        let (monitor, _rx) = monitor_with(&ok);
        assert!(monitor.is_healthy("10.1.2.3:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn update_targets_tracks_only_checked_services() {
        let ok = Arc::new(AtomicBool::new(true));
        let (monitor, _rx) = monitor_with(&ok);

        let checked = service("a", check_spec(3, 2), &["192.168.1.10:80", "192.168.1.11:80"]);
        let unchecked = service(
            "b",
            HealthCheckSpec { enabled: false, ..check_spec(3, 2) },
            &["192.168.1.20:80"],
        );
        monitor.update_targets(&[checked, unchecked]);

        assert_eq!(monitor.tracked_count(), 2);
        // The unchecked service's backend is unknown, hence healthy.
        assert!(monitor.is_healthy("192.168.1.20:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn removed_backend_is_untracked() {
        let ok = Arc::new(AtomicBool::new(true));
        let (monitor, _rx) = monitor_with(&ok);

        monitor.update_targets(&[service("a", check_spec(3, 2), &["192.168.1.10:80", "192.168.1.11:80"])]);
        assert_eq!(monitor.tracked_count(), 2);

        monitor.update_targets(&[service("a", check_spec(3, 2), &["192.168.1.10:80"])]);
        assert_eq!(monitor.tracked_count(), 1);
        assert!(monitor.is_healthy("192.168.1.11:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn disabling_checks_drops_state() {
        let ok = Arc::new(AtomicBool::new(true));
        let (monitor, _rx) = monitor_with(&ok);

        monitor.update_targets(&[service("a", check_spec(3, 2), &["192.168.1.10:80"])]);
        assert_eq!(monitor.tracked_count(), 1);

        monitor.update_targets(&[service(
            "a",
            HealthCheckSpec { enabled: false, ..check_spec(3, 2) },
            &["192.168.1.10:80"],
        )]);
        assert_eq!(monitor.tracked_count(), 0);
    }

    #[tokio::test]
    async fn record_fires_signal_once_per_transition() {
        let ok = Arc::new(AtomicBool::new(true));
        let (monitor, mut rx) = monitor_with(&ok);
        let addr: SocketAddr = "192.168.1.10:80".parse().unwrap();
        monitor.update_targets(&[service("a", check_spec(2, 2), &["192.168.1.10:80"])]);

        let fail = || Err::<(), _>("down");

        monitor.record(addr, fail());
        assert!(rx.try_recv().is_err());
        assert!(monitor.is_healthy(addr));

        monitor.record(addr, fail());
        assert!(rx.try_recv().is_ok());
        assert!(!monitor.is_healthy(addr));

        // Further failures change nothing and fire nothing.
        monitor.record(addr, fail());
        monitor.record(addr, fail());
        assert!(rx.try_recv().is_err());

        monitor.record(addr, Ok::<(), &str>(()));
        assert!(rx.try_recv().is_err());
        monitor.record(addr, Ok::<(), &str>(()));
        assert!(rx.try_recv().is_ok());
        assert!(monitor.is_healthy(addr));
    }

    #[tokio::test]
    async fn coalesces_signals_when_channel_is_full() {
        let ok = Arc::new(AtomicBool::new(true));
        let (monitor, mut rx) = monitor_with(&ok);
        monitor.update_targets(&[service(
            "a",
            check_spec(1, 1),
            &["192.168.1.10:80", "192.168.1.11:80"],
        )]);

        // Two transitions, one slot: the second send is dropped.
        monitor.record("192.168.1.10:80".parse().unwrap(), Err::<(), _>("down"));
        monitor.record("192.168.1.11:80".parse().unwrap(), Err::<(), _>("down"));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn probe_loop_drives_state_transitions() {
        let ok = Arc::new(AtomicBool::new(false));
        let (monitor, mut rx) = monitor_with(&ok);
        let addr: SocketAddr = "192.168.1.10:80".parse().unwrap();

        monitor.update_targets(&[service("a", check_spec(2, 2), &["192.168.1.10:80"])]);
        assert!(monitor.is_healthy(addr));

        // Two intervals of failing probes take the backend down.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!monitor.is_healthy(addr));
        assert!(rx.recv().await.is_some());

        // Recovery after two successful probes.
        ok.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(monitor.is_healthy(addr));
        assert!(rx.recv().await.is_some());

        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_probe_loop_stops_recording() {
        let ok = Arc::new(AtomicBool::new(false));
        let (monitor, _rx) = monitor_with(&ok);
        let addr: SocketAddr = "192.168.1.10:80".parse().unwrap();

        monitor.update_targets(&[service("a", check_spec(1, 1), &["192.168.1.10:80"])]);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!monitor.is_healthy(addr));

        monitor.stop();
        assert_eq!(monitor.tracked_count(), 0);

        // Loops are cancelled; nothing re-registers the address.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(monitor.tracked_count(), 0);
        assert!(monitor.is_healthy(addr));
    }
}
