//! Shared parsing helpers and the config error type.

use std::time::Duration;

use domain::service::entity::{Protocol, Scheduler};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(String),

    #[error("validation error: {field}: {message}")]
    Validation { field: String, message: String },

    #[error("invalid value '{value}' for field '{field}': expected one of {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("failed to install log subscriber: {0}")]
    Logging(String),
}

impl From<serde_yaml_ng::Error> for ConfigError {
    fn from(e: serde_yaml_ng::Error) -> Self {
        Self::Yaml(e.to_string())
    }
}

// ── Shared serde defaults ──────────────────────────────────────────

pub(super) fn default_protocol() -> String {
    "tcp".to_string()
}

pub(super) fn default_weight() -> u32 {
    1
}

pub(super) fn default_hc_kind() -> String {
    "tcp".to_string()
}

pub(super) fn default_hc_interval() -> String {
    "5s".to_string()
}

pub(super) fn default_hc_timeout() -> String {
    "3s".to_string()
}

pub(super) fn default_fail_threshold() -> u32 {
    3
}

pub(super) fn default_rise_threshold() -> u32 {
    2
}

pub(super) fn default_http_path() -> String {
    "/".to_string()
}

pub(super) fn default_http_status() -> u16 {
    200
}

// ── Parsing helpers ────────────────────────────────────────────────

/// Parse a duration written as a number with a unit suffix: `ms`, `s`, `m`.
///
/// `"500ms"`, `"5s"`, `"1m"`. Bare numbers and other units are rejected.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => return Err(format!("missing unit suffix in '{s}' (ms, s, m)")),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid number in '{s}'"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(format!("unsupported unit '{other}' in '{s}' (ms, s, m)")),
    }
}

pub(super) fn parse_protocol(s: &str) -> Result<Protocol, ()> {
    match s.to_lowercase().as_str() {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        _ => Err(()),
    }
}

pub(super) fn parse_scheduler(s: &str) -> Result<Scheduler, ()> {
    Scheduler::parse(&s.to_lowercase()).ok_or(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_bare_numbers() {
        assert!(parse_duration("5").is_err());
    }

    #[test]
    fn parse_duration_rejects_unknown_units() {
        assert!(parse_duration("5h").is_err());
        assert!(parse_duration("5sec").is_err());
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
        assert!(parse_duration("-5s").is_err());
    }

    #[test]
    fn parse_protocol_variants() {
        assert_eq!(parse_protocol("tcp").unwrap(), Protocol::Tcp);
        assert_eq!(parse_protocol("UDP").unwrap(), Protocol::Udp);
        assert!(parse_protocol("sctp").is_err());
    }

    #[test]
    fn parse_scheduler_variants() {
        assert_eq!(parse_scheduler("rr").unwrap(), Scheduler::RoundRobin);
        assert_eq!(parse_scheduler("WRR").unwrap(), Scheduler::WeightedRoundRobin);
        assert!(parse_scheduler("random").is_err());
    }
}
