//! Configuration: structs, YAML parsing, validation, and conversion into
//! domain service specs.

mod common;

pub use common::{ConfigError, parse_duration};

use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use clap::ValueEnum;
use domain::health::entity::{HealthCheckSpec, ProbeKind};
use domain::service::entity::{BackendSpec, ServiceSpec};
use serde::{Deserialize, Serialize};

use common::{
    default_fail_threshold, default_hc_interval, default_hc_kind, default_hc_timeout,
    default_http_path, default_http_status, default_protocol, default_rise_threshold,
    default_weight, parse_protocol, parse_scheduler,
};

// ── Logging knobs ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable colored output (development).
    Text,
    /// Flattened JSON (production, log aggregator compatible).
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Json => "json",
        }
    }
}

// ── Top-level config ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,

    /// Virtual IP the service listens on.
    pub vip: String,
    pub port: u16,

    /// `tcp` (default) or `udp`.
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// One of `rr`, `wrr`, `lc`, `wlc`, `dh`, `sh`.
    pub scheduler: String,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Keep a source-rewrite rule for every backend.
    #[serde(default)]
    pub full_nat: bool,

    /// SNAT source address; omitted means MASQUERADE.
    #[serde(default)]
    pub snat_ip: Option<String>,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckConfig {
    /// Null means enabled.
    #[serde(default)]
    pub enabled: Option<bool>,

    /// `tcp` or `http`.
    #[serde(default = "default_hc_kind")]
    pub kind: String,

    /// Number with unit suffix: `ms`, `s`, `m`.
    #[serde(default = "default_hc_interval")]
    pub interval: String,

    #[serde(default = "default_hc_timeout")]
    pub timeout: String,

    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    #[serde(default = "default_rise_threshold")]
    pub rise_threshold: u32,

    #[serde(default = "default_http_path")]
    pub http_path: String,

    #[serde(default = "default_http_status")]
    pub http_expected_status: u16,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: None,
            kind: default_hc_kind(),
            interval: default_hc_interval(),
            timeout: default_hc_timeout(),
            fail_threshold: default_fail_threshold(),
            rise_threshold: default_rise_threshold(),
            http_path: default_http_path(),
            http_expected_status: default_http_status(),
        }
    }
}

impl HealthCheckConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// Backend IP address.
    pub address: String,
    pub port: u16,

    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Config {
    /// Load, parse, and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the config after deserialization.
    #[allow(clippy::too_many_lines)]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::Validation {
                field: "services".to_string(),
                message: "at least one service is required".to_string(),
            });
        }

        let mut names = std::collections::HashSet::new();
        let mut keys = std::collections::HashSet::new();

        for (idx, svc) in self.services.iter().enumerate() {
            svc.validate(idx)?;

            if !names.insert(svc.name.as_str()) {
                return Err(ConfigError::Validation {
                    field: format!("services[{idx}].name"),
                    message: format!("duplicate service name '{}'", svc.name),
                });
            }

            // Same vip:port under tcp and udp is legal; the triple is not.
            let key = (svc.vip.as_str(), svc.port, svc.protocol.to_lowercase());
            if !keys.insert(key) {
                return Err(ConfigError::Validation {
                    field: format!("services[{idx}]"),
                    message: format!(
                        "duplicate listen address {}:{}/{}",
                        svc.vip, svc.port, svc.protocol
                    ),
                });
            }
        }

        Ok(())
    }

    /// Convert into domain specs. The config must already be validated.
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, ConfigError> {
        self.services.iter().map(ServiceConfig::to_spec).collect()
    }
}

impl ServiceConfig {
    fn validate(&self, idx: usize) -> Result<(), ConfigError> {
        let prefix = format!("services[{idx}]");

        if self.name.is_empty() {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.name"),
                message: "service name must not be empty".to_string(),
            });
        }

        self.vip
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::Validation {
                field: format!("{prefix}.vip"),
                message: format!("invalid IP address: {}", self.vip),
            })?;

        if self.port == 0 {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.port"),
                message: "port must be > 0".to_string(),
            });
        }

        parse_protocol(&self.protocol).map_err(|()| ConfigError::InvalidValue {
            field: format!("{prefix}.protocol"),
            value: self.protocol.clone(),
            expected: "tcp, udp".to_string(),
        })?;

        parse_scheduler(&self.scheduler).map_err(|()| ConfigError::InvalidValue {
            field: format!("{prefix}.scheduler"),
            value: self.scheduler.clone(),
            expected: "rr, wrr, lc, wlc, dh, sh".to_string(),
        })?;

        if let Some(ref snat_ip) = self.snat_ip {
            snat_ip
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::Validation {
                    field: format!("{prefix}.snat_ip"),
                    message: format!("invalid IP address: {snat_ip}"),
                })?;
        }

        self.health_check.validate(&prefix)?;

        if self.backends.is_empty() {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.backends"),
                message: "at least one backend is required".to_string(),
            });
        }

        let mut endpoints = std::collections::HashSet::new();
        for (bidx, backend) in self.backends.iter().enumerate() {
            backend.validate(idx, bidx)?;
            if !endpoints.insert((backend.address.as_str(), backend.port)) {
                return Err(ConfigError::Validation {
                    field: format!("{prefix}.backends[{bidx}]"),
                    message: format!(
                        "duplicate backend address {}:{}",
                        backend.address, backend.port
                    ),
                });
            }
        }

        Ok(())
    }

    fn to_spec(&self) -> Result<ServiceSpec, ConfigError> {
        let vip: IpAddr = self.vip.parse().map_err(|_| ConfigError::Validation {
            field: "vip".to_string(),
            message: format!("invalid IP address: {}", self.vip),
        })?;

        let protocol = parse_protocol(&self.protocol).map_err(|()| ConfigError::InvalidValue {
            field: "protocol".to_string(),
            value: self.protocol.clone(),
            expected: "tcp, udp".to_string(),
        })?;

        let scheduler = parse_scheduler(&self.scheduler).map_err(|()| ConfigError::InvalidValue {
            field: "scheduler".to_string(),
            value: self.scheduler.clone(),
            expected: "rr, wrr, lc, wlc, dh, sh".to_string(),
        })?;

        let snat_ip = self
            .snat_ip
            .as_ref()
            .map(|s| {
                s.parse::<IpAddr>().map_err(|_| ConfigError::Validation {
                    field: "snat_ip".to_string(),
                    message: format!("invalid IP address: {s}"),
                })
            })
            .transpose()?;

        let backends = self
            .backends
            .iter()
            .map(BackendConfig::to_spec)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ServiceSpec {
            name: self.name.clone(),
            vip,
            port: self.port,
            protocol,
            scheduler,
            health_check: self.health_check.to_spec()?,
            full_nat: self.full_nat,
            snat_ip,
            backends,
        })
    }
}

impl HealthCheckConfig {
    fn validate(&self, prefix: &str) -> Result<(), ConfigError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let interval =
            parse_duration(&self.interval).map_err(|reason| ConfigError::Validation {
                field: format!("{prefix}.health_check.interval"),
                message: reason,
            })?;
        if interval.is_zero() {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.health_check.interval"),
                message: "interval must be > 0".to_string(),
            });
        }

        let timeout = parse_duration(&self.timeout).map_err(|reason| ConfigError::Validation {
            field: format!("{prefix}.health_check.timeout"),
            message: reason,
        })?;
        if timeout.is_zero() {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.health_check.timeout"),
                message: "timeout must be > 0".to_string(),
            });
        }

        if self.fail_threshold == 0 {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.health_check.fail_threshold"),
                message: "fail_threshold must be >= 1".to_string(),
            });
        }
        if self.rise_threshold == 0 {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.health_check.rise_threshold"),
                message: "rise_threshold must be >= 1".to_string(),
            });
        }

        match self.kind.to_lowercase().as_str() {
            "tcp" => {}
            "http" => {
                if !self.http_path.starts_with('/') {
                    return Err(ConfigError::Validation {
                        field: format!("{prefix}.health_check.http_path"),
                        message: "http_path must start with '/'".to_string(),
                    });
                }
                if !(100..=599).contains(&self.http_expected_status) {
                    return Err(ConfigError::Validation {
                        field: format!("{prefix}.health_check.http_expected_status"),
                        message: "http_expected_status must be between 100 and 599".to_string(),
                    });
                }
            }
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: format!("{prefix}.health_check.kind"),
                    value: self.kind.clone(),
                    expected: "tcp, http".to_string(),
                });
            }
        }

        Ok(())
    }

    fn to_spec(&self) -> Result<HealthCheckSpec, ConfigError> {
        // A disabled check is never consulted; tolerate leftover garbage in
        // its fields rather than failing the whole configuration.
        let enabled = self.is_enabled();

        let kind = match self.kind.to_lowercase().as_str() {
            "tcp" => ProbeKind::Tcp,
            "http" => ProbeKind::Http,
            _ if !enabled => ProbeKind::Tcp,
            _ => {
                return Err(ConfigError::InvalidValue {
                    field: "health_check.kind".to_string(),
                    value: self.kind.clone(),
                    expected: "tcp, http".to_string(),
                });
            }
        };

        let interval = match parse_duration(&self.interval) {
            Ok(d) => d,
            Err(_) if !enabled => parse_duration(&default_hc_interval()).unwrap_or_default(),
            Err(reason) => {
                return Err(ConfigError::Validation {
                    field: "health_check.interval".to_string(),
                    message: reason,
                });
            }
        };
        let timeout = match parse_duration(&self.timeout) {
            Ok(d) => d,
            Err(_) if !enabled => parse_duration(&default_hc_timeout()).unwrap_or_default(),
            Err(reason) => {
                return Err(ConfigError::Validation {
                    field: "health_check.timeout".to_string(),
                    message: reason,
                });
            }
        };

        Ok(HealthCheckSpec {
            enabled,
            kind,
            interval,
            timeout,
            fail_threshold: self.fail_threshold,
            rise_threshold: self.rise_threshold,
            http_path: self.http_path.clone(),
            http_expected_status: self.http_expected_status,
        })
    }
}

impl BackendConfig {
    fn validate(&self, svc_idx: usize, be_idx: usize) -> Result<(), ConfigError> {
        let prefix = format!("services[{svc_idx}].backends[{be_idx}]");

        self.address
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::Validation {
                field: format!("{prefix}.address"),
                message: format!("invalid IP address: {}", self.address),
            })?;

        if self.port == 0 {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.port"),
                message: "port must be > 0".to_string(),
            });
        }

        if self.weight == 0 {
            return Err(ConfigError::Validation {
                field: format!("{prefix}.weight"),
                message: "weight must be > 0".to_string(),
            });
        }

        Ok(())
    }

    fn to_spec(&self) -> Result<BackendSpec, ConfigError> {
        let ip: IpAddr = self.address.parse().map_err(|_| ConfigError::Validation {
            field: "address".to_string(),
            message: format!("invalid IP address: {}", self.address),
        })?;

        Ok(BackendSpec {
            address: SocketAddr::new(ip, self.port),
            weight: self.weight,
        })
    }
}
