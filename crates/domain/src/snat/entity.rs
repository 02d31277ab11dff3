use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::service::entity::Protocol;

/// Identity of a source-rewrite rule: one per backend endpoint and protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnatRuleKey {
    pub backend_ip: IpAddr,
    pub backend_port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for SnatRuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.backend_ip, self.backend_port, self.protocol)
    }
}

/// A single source-rewrite rule for traffic leaving toward a backend.
///
/// `snat_ip` of `None` renders as MASQUERADE; the rule text encodes the
/// source address, so changing it replaces the rule rather than updating it
/// in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnatRule {
    pub backend_ip: IpAddr,
    pub backend_port: u16,
    pub protocol: Protocol,
    pub snat_ip: Option<IpAddr>,
}

impl SnatRule {
    pub fn key(&self) -> SnatRuleKey {
        SnatRuleKey {
            backend_ip: self.backend_ip,
            backend_port: self.backend_port,
            protocol: self.protocol,
        }
    }
}
