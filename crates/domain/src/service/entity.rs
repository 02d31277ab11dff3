use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::health::entity::HealthCheckSpec;
use crate::snat::entity::SnatRule;

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// IP protocol number as the kernel encodes it (`IPPROTO_TCP` / `IPPROTO_UDP`).
    pub fn number(self) -> u16 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPVS scheduling algorithm.
///
/// `as_str` yields the short name the kernel registers the scheduler module
/// under, which is also the spelling used in the configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheduler {
    RoundRobin,
    WeightedRoundRobin,
    LeastConn,
    WeightedLeastConn,
    DestHash,
    SourceHash,
}

impl Scheduler {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "rr",
            Self::WeightedRoundRobin => "wrr",
            Self::LeastConn => "lc",
            Self::WeightedLeastConn => "wlc",
            Self::DestHash => "dh",
            Self::SourceHash => "sh",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rr" => Some(Self::RoundRobin),
            "wrr" => Some(Self::WeightedRoundRobin),
            "lc" => Some(Self::LeastConn),
            "wlc" => Some(Self::WeightedLeastConn),
            "dh" => Some(Self::DestHash),
            "sh" => Some(Self::SourceHash),
            _ => None,
        }
    }
}

impl std::fmt::Display for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Natural key of a virtual service in the kernel table.
///
/// IPVS permits the same `vip:port` under TCP and UDP simultaneously, so the
/// protocol is part of the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub vip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
}

impl std::fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.vip, self.port, self.protocol)
    }
}

/// A virtual service record as the kernel holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualService {
    pub vip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: Scheduler,
    /// Persistence timeout in seconds; 0 disables persistence.
    pub timeout: u32,
}

impl VirtualService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            vip: self.vip,
            port: self.port,
            protocol: self.protocol,
        }
    }
}

/// Packet forwarding method for a destination, with the kernel's
/// connection-flag encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FwdMethod {
    Masquerade,
    Tunnel,
    DirectRoute,
}

impl FwdMethod {
    pub fn flag(self) -> u32 {
        match self {
            Self::Masquerade => 0,
            Self::Tunnel => 2,
            Self::DirectRoute => 3,
        }
    }

    pub fn from_flag(flag: u32) -> Self {
        // Low three bits carry the forwarding method.
        match flag & 0x7 {
            2 => Self::Tunnel,
            3 => Self::DirectRoute,
            _ => Self::Masquerade,
        }
    }
}

/// Key of a destination within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationKey {
    pub address: IpAddr,
    pub port: u16,
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// A destination (real server) record as the kernel holds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
    pub fwd_method: FwdMethod,
}

impl Destination {
    pub fn key(&self) -> DestinationKey {
        DestinationKey {
            address: self.address,
            port: self.port,
        }
    }
}

/// A backend as the operator declares it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub address: SocketAddr,
    pub weight: u32,
}

/// The desired state of one virtual service, as declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique name within a configuration; used for logging only.
    pub name: String,
    pub vip: IpAddr,
    pub port: u16,
    pub protocol: Protocol,
    pub scheduler: Scheduler,
    pub health_check: HealthCheckSpec,
    /// When true, a source-rewrite rule is kept for every backend.
    pub full_nat: bool,
    /// SNAT source address; `None` means MASQUERADE.
    pub snat_ip: Option<IpAddr>,
    pub backends: Vec<BackendSpec>,
}

impl ServiceSpec {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            vip: self.vip,
            port: self.port,
            protocol: self.protocol,
        }
    }

    /// The kernel record this spec converges to.
    pub fn virtual_service(&self) -> VirtualService {
        VirtualService {
            vip: self.vip,
            port: self.port,
            protocol: self.protocol,
            scheduler: self.scheduler,
            timeout: 0,
        }
    }

    /// Source-rewrite rules for this service.
    ///
    /// Emitted for every configured backend regardless of its health, so a
    /// flapping backend does not churn the mangling table. Empty unless
    /// `full_nat` is set.
    pub fn snat_rules(&self) -> Vec<SnatRule> {
        if !self.full_nat {
            return Vec::new();
        }
        self.backends
            .iter()
            .map(|b| SnatRule {
                backend_ip: b.address.ip(),
                backend_port: b.address.port(),
                protocol: self.protocol,
                snat_ip: self.snat_ip,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn spec(full_nat: bool, snat_ip: Option<IpAddr>) -> ServiceSpec {
        ServiceSpec {
            name: "web".to_string(),
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 80,
            protocol: Protocol::Tcp,
            scheduler: Scheduler::WeightedRoundRobin,
            health_check: HealthCheckSpec::default(),
            full_nat,
            snat_ip,
            backends: vec![
                BackendSpec {
                    address: "192.168.1.10:8080".parse().unwrap(),
                    weight: 5,
                },
                BackendSpec {
                    address: "192.168.1.11:8080".parse().unwrap(),
                    weight: 3,
                },
            ],
        }
    }

    #[test]
    fn protocol_numbers_match_kernel() {
        assert_eq!(Protocol::Tcp.number(), 6);
        assert_eq!(Protocol::Udp.number(), 17);
    }

    #[test]
    fn scheduler_short_names() {
        assert_eq!(Scheduler::RoundRobin.as_str(), "rr");
        assert_eq!(Scheduler::WeightedRoundRobin.as_str(), "wrr");
        assert_eq!(Scheduler::LeastConn.as_str(), "lc");
        assert_eq!(Scheduler::WeightedLeastConn.as_str(), "wlc");
        assert_eq!(Scheduler::DestHash.as_str(), "dh");
        assert_eq!(Scheduler::SourceHash.as_str(), "sh");
    }

    #[test]
    fn scheduler_parse_round_trips() {
        for s in ["rr", "wrr", "lc", "wlc", "dh", "sh"] {
            assert_eq!(Scheduler::parse(s).unwrap().as_str(), s);
        }
        assert!(Scheduler::parse("mh").is_none());
        assert!(Scheduler::parse("").is_none());
    }

    #[test]
    fn service_key_display() {
        let key = ServiceKey {
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 80,
            protocol: Protocol::Tcp,
        };
        assert_eq!(key.to_string(), "10.0.0.1:80/tcp");
    }

    #[test]
    fn same_vip_port_differs_by_protocol() {
        let tcp = ServiceKey {
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 53,
            protocol: Protocol::Tcp,
        };
        let udp = ServiceKey { protocol: Protocol::Udp, ..tcp };
        assert_ne!(tcp, udp);
    }

    #[test]
    fn fwd_method_flags() {
        assert_eq!(FwdMethod::Masquerade.flag(), 0);
        assert_eq!(FwdMethod::Tunnel.flag(), 2);
        assert_eq!(FwdMethod::DirectRoute.flag(), 3);
        assert_eq!(FwdMethod::from_flag(0), FwdMethod::Masquerade);
        // Flags word may carry bits beyond the forwarding mask.
        assert_eq!(FwdMethod::from_flag(0x0102), FwdMethod::Tunnel);
    }

    #[test]
    fn spec_key_and_virtual_service_agree() {
        let s = spec(false, None);
        assert_eq!(s.key(), s.virtual_service().key());
        assert_eq!(s.virtual_service().scheduler, Scheduler::WeightedRoundRobin);
    }

    #[test]
    fn snat_rules_empty_without_full_nat() {
        assert!(spec(false, None).snat_rules().is_empty());
    }

    #[test]
    fn snat_rules_cover_every_backend() {
        let snat_ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        let rules = spec(true, snat_ip).snat_rules();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.snat_ip == snat_ip));
        assert!(rules.iter().all(|r| r.protocol == Protocol::Tcp));
        assert_eq!(rules[0].backend_port, 8080);
    }

    #[test]
    fn snat_rules_masquerade_when_no_snat_ip() {
        let rules = spec(true, None).snat_rules();
        assert!(rules.iter().all(|r| r.snat_ip.is_none()));
    }
}
