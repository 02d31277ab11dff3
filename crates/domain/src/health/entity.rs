use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Probe flavor used for a service's backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Tcp,
    Http,
}

impl ProbeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
        }
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-service health check parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub enabled: bool,
    pub kind: ProbeKind,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures before a backend is withdrawn.
    pub fail_threshold: u32,
    /// Consecutive successes before a withdrawn backend returns.
    pub rise_threshold: u32,
    pub http_path: String,
    pub http_expected_status: u16,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            kind: ProbeKind::Tcp,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            fail_threshold: 3,
            rise_threshold: 2,
            http_path: "/".to_string(),
            http_expected_status: 200,
        }
    }
}

/// Hysteresis state machine for a single backend.
///
/// A backend starts out healthy so traffic flows immediately after
/// registration and is withdrawn only after confirmed failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendHealth {
    pub healthy: bool,
    pub consecutive_fails: u32,
    pub consecutive_oks: u32,
}

impl Default for BackendHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendHealth {
    pub fn new() -> Self {
        Self {
            healthy: true,
            consecutive_fails: 0,
            consecutive_oks: 0,
        }
    }

    /// Record a failed probe. Returns `true` iff the backend just crossed
    /// from healthy to unhealthy.
    pub fn record_failure(&mut self, fail_threshold: u32) -> bool {
        self.consecutive_oks = 0;
        self.consecutive_fails = self.consecutive_fails.saturating_add(1);
        if self.healthy && self.consecutive_fails >= fail_threshold {
            self.healthy = false;
            return true;
        }
        false
    }

    /// Record a successful probe. Returns `true` iff the backend just crossed
    /// from unhealthy to healthy.
    pub fn record_success(&mut self, rise_threshold: u32) -> bool {
        self.consecutive_fails = 0;
        self.consecutive_oks = self.consecutive_oks.saturating_add(1);
        if !self.healthy && self.consecutive_oks >= rise_threshold {
            self.healthy = true;
            return true;
        }
        false
    }
}
