use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use domain::service::entity::{
    Destination, DestinationKey, FwdMethod, ServiceKey, ServiceSpec, VirtualService,
};
use domain::snat::entity::SnatRule;
use ports::secondary::lb_table_port::LbTablePort;
use ports::secondary::snat_rule_port::SnatRulePort;
use thiserror::Error;
use tracing::{debug, error, info};

/// Read-side view of backend health consulted during a pass.
///
/// Implemented by the health monitor; the unknown-address case reports
/// healthy, so a reconciler that never registered targets treats every
/// backend as routable.
pub trait HealthView: Send + Sync {
    fn is_healthy(&self, address: SocketAddr) -> bool;
}

/// All operation failures of one pass, joined.
#[derive(Debug, Error)]
#[error("reconcile finished with {} error(s): {}", .0.len(), .0.join("; "))]
pub struct ReconcileError(pub Vec<String>);

/// Mutation counters for one pass. A converged table yields all zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub services_created: usize,
    pub services_updated: usize,
    pub services_deleted: usize,
    pub destinations_created: usize,
    pub destinations_updated: usize,
    pub destinations_deleted: usize,
    /// Size of the desired SNAT rule set handed to the rule binding.
    pub snat_rules: usize,
}

impl ReconcileSummary {
    /// Total number of table mutations issued.
    pub fn mutations(&self) -> usize {
        self.services_created
            + self.services_updated
            + self.services_deleted
            + self.destinations_created
            + self.destinations_updated
            + self.destinations_deleted
    }
}

struct DesiredService {
    name: String,
    service: VirtualService,
    destinations: HashMap<DestinationKey, Destination>,
}

/// Declarative reconciler: diffs desired state (config filtered by health)
/// against the kernel table and issues the minimum set of mutations.
///
/// The single writer to both bindings. One internal lock serializes passes
/// and guards the managed set; services not in the managed set are never
/// touched, so entries installed by other tools survive every pass.
pub struct Reconciler {
    table: Arc<dyn LbTablePort>,
    snat: Arc<dyn SnatRulePort>,
    health: Arc<dyn HealthView>,
    managed: Mutex<HashSet<ServiceKey>>,
}

impl Reconciler {
    pub fn new(
        table: Arc<dyn LbTablePort>,
        snat: Arc<dyn SnatRulePort>,
        health: Arc<dyn HealthView>,
    ) -> Self {
        Self {
            table,
            snat,
            health,
            managed: Mutex::new(HashSet::new()),
        }
    }

    /// Run one reconcile pass.
    ///
    /// Individual operation failures are collected rather than aborting the
    /// pass, so one failing service does not block convergence of the rest.
    pub fn reconcile(&self, specs: &[ServiceSpec]) -> Result<ReconcileSummary, ReconcileError> {
        let mut managed = self.managed.lock().unwrap_or_else(PoisonError::into_inner);

        info!(desired_services = specs.len(), "starting reconcile");

        let (desired, snat_rules) = self.build_desired(specs);

        let actual = match self.table.list_services() {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "failed to list services");
                return Err(ReconcileError(vec![format!("list services: {e}")]));
            }
        };
        let actual_managed: HashMap<ServiceKey, VirtualService> = actual
            .into_iter()
            .filter(|svc| managed.contains(&svc.key()))
            .map(|svc| (svc.key(), svc))
            .collect();

        let mut summary = ReconcileSummary {
            snat_rules: snat_rules.len(),
            ..ReconcileSummary::default()
        };
        let mut errors = Vec::new();

        // Managed services gone from the configuration go first, so a spec
        // whose key changed is handled as delete-old, create-new.
        for key in actual_managed.keys() {
            if desired.contains_key(key) {
                continue;
            }
            match self.table.delete_service(key) {
                Ok(()) => {
                    managed.remove(key);
                    summary.services_deleted += 1;
                    info!(service = %key, "deleted service");
                }
                Err(e) => errors.push(format!("delete service {key}: {e}")),
            }
        }

        for (key, want) in &desired {
            match actual_managed.get(key) {
                None => match self.table.create_service(&want.service) {
                    Ok(()) => {
                        managed.insert(*key);
                        summary.services_created += 1;
                        info!(service = %key, scheduler = %want.service.scheduler, "created service");
                    }
                    Err(e) => {
                        errors.push(format!("create service {key}: {e}"));
                        continue;
                    }
                },
                Some(current) => {
                    if current.scheduler != want.service.scheduler {
                        match self.table.update_service(&want.service) {
                            Ok(()) => {
                                summary.services_updated += 1;
                                info!(
                                    service = %key,
                                    scheduler = %want.service.scheduler,
                                    "updated service"
                                );
                            }
                            Err(e) => {
                                errors.push(format!("update service {key}: {e}"));
                                continue;
                            }
                        }
                    }
                }
            }

            self.reconcile_destinations(key, want, &mut summary, &mut errors);
        }

        if let Err(e) = self.snat.reconcile(&snat_rules) {
            errors.push(format!("snat reconcile: {e}"));
        }

        if errors.is_empty() {
            info!(
                created = summary.services_created,
                updated = summary.services_updated,
                deleted = summary.services_deleted,
                destinations_created = summary.destinations_created,
                destinations_updated = summary.destinations_updated,
                destinations_deleted = summary.destinations_deleted,
                "reconcile completed"
            );
            Ok(summary)
        } else {
            error!(error_count = errors.len(), "reconcile completed with errors");
            Err(ReconcileError(errors))
        }
    }

    /// Desired table contents and SNAT rule set for the given specs.
    ///
    /// A backend is included iff its service has health checks disabled or
    /// the monitor reports it healthy. SNAT rules cover every configured
    /// backend regardless of health, so health flaps never churn the
    /// mangling table.
    fn build_desired(
        &self,
        specs: &[ServiceSpec],
    ) -> (HashMap<ServiceKey, DesiredService>, Vec<SnatRule>) {
        let mut desired = HashMap::with_capacity(specs.len());
        let mut snat_rules = Vec::new();

        for spec in specs {
            let mut destinations = HashMap::with_capacity(spec.backends.len());
            for backend in &spec.backends {
                if spec.health_check.enabled && !self.health.is_healthy(backend.address) {
                    debug!(
                        service = %spec.name,
                        backend = %backend.address,
                        "skipping unhealthy backend"
                    );
                    continue;
                }
                let destination = Destination {
                    address: backend.address.ip(),
                    port: backend.address.port(),
                    weight: backend.weight,
                    fwd_method: FwdMethod::Masquerade,
                };
                destinations.insert(destination.key(), destination);
            }

            snat_rules.extend(spec.snat_rules());

            desired.insert(
                spec.key(),
                DesiredService {
                    name: spec.name.clone(),
                    service: spec.virtual_service(),
                    destinations,
                },
            );
        }

        (desired, snat_rules)
    }

    fn reconcile_destinations(
        &self,
        key: &ServiceKey,
        want: &DesiredService,
        summary: &mut ReconcileSummary,
        errors: &mut Vec<String>,
    ) {
        let actual = match self.table.list_destinations(key) {
            Ok(destinations) => destinations,
            Err(e) => {
                errors.push(format!("list destinations of {key}: {e}"));
                return;
            }
        };
        let actual_map: HashMap<DestinationKey, Destination> =
            actual.into_iter().map(|d| (d.key(), d)).collect();

        for (dst_key, destination) in &want.destinations {
            match actual_map.get(dst_key) {
                None => match self.table.create_destination(key, destination) {
                    Ok(()) => {
                        summary.destinations_created += 1;
                        info!(
                            service = %key,
                            destination = %dst_key,
                            weight = destination.weight,
                            "created destination"
                        );
                    }
                    Err(e) => errors.push(format!("create destination {key} -> {dst_key}: {e}")),
                },
                Some(current)
                    if current.weight != destination.weight
                        || current.fwd_method != destination.fwd_method =>
                {
                    match self.table.update_destination(key, destination) {
                        Ok(()) => {
                            summary.destinations_updated += 1;
                            info!(
                                service = %key,
                                destination = %dst_key,
                                weight = destination.weight,
                                "updated destination"
                            );
                        }
                        Err(e) => {
                            errors.push(format!("update destination {key} -> {dst_key}: {e}"));
                        }
                    }
                }
                Some(_) => {}
            }
        }

        for dst_key in actual_map.keys() {
            if want.destinations.contains_key(dst_key) {
                continue;
            }
            match self.table.delete_destination(key, dst_key) {
                Ok(()) => {
                    summary.destinations_deleted += 1;
                    info!(service = %key, destination = %dst_key, "deleted destination");
                }
                Err(e) => errors.push(format!("delete destination {key} -> {dst_key}: {e}")),
            }
        }

        debug!(
            service = %want.name,
            desired = want.destinations.len(),
            "destinations reconciled"
        );
    }
}
