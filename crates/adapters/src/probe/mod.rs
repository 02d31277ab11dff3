//! Active health probes: TCP connect and HTTP GET.

mod http;
mod tcp;

pub use http::HttpProbe;
pub use tcp::TcpProbe;

use std::sync::Arc;

use domain::health::entity::{HealthCheckSpec, ProbeKind};
use ports::secondary::probe_port::{ProbeFactory, ProbePort};

/// Builds the probe matching a service's health check parameters.
pub struct StandardProbes;

impl ProbeFactory for StandardProbes {
    fn build(&self, check: &HealthCheckSpec) -> Arc<dyn ProbePort> {
        match check.kind {
            ProbeKind::Tcp => Arc::new(TcpProbe::new(check.timeout)),
            ProbeKind::Http => Arc::new(HttpProbe::new(
                check.timeout,
                &check.http_path,
                check.http_expected_status,
            )),
        }
    }
}
