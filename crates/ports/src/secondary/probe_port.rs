use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use domain::health::entity::HealthCheckSpec;
use domain::health::error::ProbeError;

/// Future returned by a probe check.
pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProbeError>> + Send + 'a>>;

/// Secondary port for a single active health probe.
///
/// Uses a boxed-future return type (instead of RPITIT) so the trait is
/// dyn-compatible and probes can be held as `Arc<dyn ProbePort>`. Probes are
/// stateless, safe to call concurrently, and never retry.
pub trait ProbePort: Send + Sync {
    fn check(&self, target: SocketAddr) -> ProbeFuture<'_>;
}

/// Builds the probe matching a service's health check parameters.
///
/// Lets the monitor construct probes per configuration without depending on
/// concrete probe types.
pub trait ProbeFactory: Send + Sync {
    fn build(&self, check: &HealthCheckSpec) -> Arc<dyn ProbePort>;
}
