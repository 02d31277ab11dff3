//! Generic-netlink wire codec for the kernel IPVS family.
//!
//! Message building and attribute parsing are pure byte manipulation and are
//! unit-tested off-target; the socket I/O lives in the Linux-only binding.
//! Command and attribute values follow `include/uapi/linux/ip_vs.h`.

use std::net::IpAddr;

use domain::service::entity::{
    Destination, DestinationKey, FwdMethod, Protocol, Scheduler, ServiceKey, VirtualService,
};
use domain::service::error::TableError;

// ── Netlink framing ────────────────────────────────────────────────

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const NLM_F_REQUEST: u16 = 0x01;
pub const NLM_F_MULTI: u16 = 0x02;
pub const NLM_F_ACK: u16 = 0x04;
/// `NLM_F_ROOT | NLM_F_MATCH`
pub const NLM_F_DUMP: u16 = 0x300;

pub const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

const NLMSG_HDRLEN: usize = 16;
const GENL_HDRLEN: usize = 4;
const NLA_HDRLEN: usize = 4;

// ── Generic netlink controller ─────────────────────────────────────

pub const GENL_ID_CTRL: u16 = 0x10;
pub const CTRL_CMD_GETFAMILY: u8 = 3;
pub const CTRL_ATTR_FAMILY_ID: u16 = 1;
pub const CTRL_ATTR_FAMILY_NAME: u16 = 2;

// ── IPVS family ────────────────────────────────────────────────────

pub const IPVS_GENL_NAME: &str = "IPVS";
pub const IPVS_GENL_VERSION: u8 = 0x1;

pub const IPVS_CMD_NEW_SERVICE: u8 = 1;
pub const IPVS_CMD_SET_SERVICE: u8 = 2;
pub const IPVS_CMD_DEL_SERVICE: u8 = 3;
pub const IPVS_CMD_GET_SERVICE: u8 = 4;
pub const IPVS_CMD_NEW_DEST: u8 = 5;
pub const IPVS_CMD_SET_DEST: u8 = 6;
pub const IPVS_CMD_DEL_DEST: u8 = 7;
pub const IPVS_CMD_GET_DEST: u8 = 8;
pub const IPVS_CMD_FLUSH: u8 = 17;

pub const IPVS_ATTR_SERVICE: u16 = 1;
pub const IPVS_ATTR_DEST: u16 = 2;

const IPVS_SVC_ATTR_AF: u16 = 1;
const IPVS_SVC_ATTR_PROTOCOL: u16 = 2;
const IPVS_SVC_ATTR_ADDR: u16 = 3;
const IPVS_SVC_ATTR_PORT: u16 = 4;
const IPVS_SVC_ATTR_SCHED_NAME: u16 = 6;
const IPVS_SVC_ATTR_FLAGS: u16 = 7;
const IPVS_SVC_ATTR_TIMEOUT: u16 = 8;
const IPVS_SVC_ATTR_NETMASK: u16 = 9;

const IPVS_DEST_ATTR_ADDR: u16 = 1;
const IPVS_DEST_ATTR_PORT: u16 = 2;
const IPVS_DEST_ATTR_FWD_METHOD: u16 = 3;
const IPVS_DEST_ATTR_WEIGHT: u16 = 4;
const IPVS_DEST_ATTR_U_THRESH: u16 = 5;
const IPVS_DEST_ATTR_L_THRESH: u16 = 6;
const IPVS_DEST_ATTR_ADDR_FAMILY: u16 = 11;

pub const AF_INET: u16 = 2;
pub const AF_INET6: u16 = 10;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

pub fn family_of(addr: IpAddr) -> u16 {
    match addr {
        IpAddr::V4(_) => AF_INET,
        IpAddr::V6(_) => AF_INET6,
    }
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn netmask_of(addr: IpAddr) -> u32 {
    match addr {
        IpAddr::V4(_) => u32::MAX,
        IpAddr::V6(_) => 128,
    }
}

// ── Message building ───────────────────────────────────────────────

/// Builds one genl request: netlink header, genl header, then attributes.
pub struct MessageBuilder {
    buf: Vec<u8>,
    family: u16,
    flags: u16,
    seq: u32,
}

impl MessageBuilder {
    pub fn new(family: u16, flags: u16, seq: u32, cmd: u8, version: u8) -> Self {
        let mut buf = vec![0u8; NLMSG_HDRLEN];
        buf.push(cmd);
        buf.push(version);
        buf.extend_from_slice(&[0, 0]);
        Self { buf, family, flags, seq }
    }

    pub fn put(&mut self, attr_type: u16, payload: &[u8]) {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }

    pub fn put_u16(&mut self, attr_type: u16, value: u16) {
        self.put(attr_type, &value.to_ne_bytes());
    }

    /// Port attributes are carried in network byte order.
    pub fn put_be16(&mut self, attr_type: u16, value: u16) {
        self.put(attr_type, &value.to_be_bytes());
    }

    pub fn put_u32(&mut self, attr_type: u16, value: u32) {
        self.put(attr_type, &value.to_ne_bytes());
    }

    /// NUL-terminated string attribute.
    pub fn put_str(&mut self, attr_type: u16, value: &str) {
        let mut payload = value.as_bytes().to_vec();
        payload.push(0);
        self.put(attr_type, &payload);
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[4..6].copy_from_slice(&self.family.to_ne_bytes());
        self.buf[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&self.seq.to_ne_bytes());
        // nlmsg_pid stays 0; the kernel fills in the sender.
        self.buf
    }
}

/// Nested payload builder for `IPVS_ATTR_SERVICE` / `IPVS_ATTR_DEST`.
#[derive(Default)]
struct NestedAttrs {
    buf: Vec<u8>,
}

impl NestedAttrs {
    fn put(&mut self, attr_type: u16, payload: &[u8]) {
        let len = NLA_HDRLEN + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
    }
}

/// Attributes identifying a service: family, protocol, address, port.
pub fn service_identity_attrs(key: &ServiceKey) -> Vec<u8> {
    let mut nested = NestedAttrs::default();
    nested.put(IPVS_SVC_ATTR_AF, &family_of(key.vip).to_ne_bytes());
    nested.put(IPVS_SVC_ATTR_PROTOCOL, &key.protocol.number().to_ne_bytes());
    nested.put(IPVS_SVC_ATTR_ADDR, &addr_bytes(key.vip));
    nested.put(IPVS_SVC_ATTR_PORT, &key.port.to_be_bytes());
    nested.buf
}

/// Full service attribute set for create/update.
pub fn service_attrs(service: &VirtualService) -> Vec<u8> {
    let mut nested = NestedAttrs { buf: service_identity_attrs(&service.key()) };
    nested.put(
        IPVS_SVC_ATTR_SCHED_NAME,
        &{
            let mut s = service.scheduler.as_str().as_bytes().to_vec();
            s.push(0);
            s
        },
    );
    // struct ip_vs_flags { flags, mask }
    let mut flags = 0u32.to_ne_bytes().to_vec();
    flags.extend_from_slice(&u32::MAX.to_ne_bytes());
    nested.put(IPVS_SVC_ATTR_FLAGS, &flags);
    nested.put(IPVS_SVC_ATTR_TIMEOUT, &service.timeout.to_ne_bytes());
    nested.put(IPVS_SVC_ATTR_NETMASK, &netmask_of(service.vip).to_ne_bytes());
    nested.buf
}

/// Attributes identifying a destination: address and port.
pub fn dest_identity_attrs(key: &DestinationKey) -> Vec<u8> {
    let mut nested = NestedAttrs::default();
    nested.put(IPVS_DEST_ATTR_ADDR, &addr_bytes(key.address));
    nested.put(IPVS_DEST_ATTR_PORT, &key.port.to_be_bytes());
    nested.put(IPVS_DEST_ATTR_ADDR_FAMILY, &family_of(key.address).to_ne_bytes());
    nested.buf
}

/// Full destination attribute set for create/update.
pub fn dest_attrs(destination: &Destination) -> Vec<u8> {
    let mut nested = NestedAttrs { buf: dest_identity_attrs(&destination.key()) };
    nested.put(
        IPVS_DEST_ATTR_FWD_METHOD,
        &destination.fwd_method.flag().to_ne_bytes(),
    );
    nested.put(IPVS_DEST_ATTR_WEIGHT, &destination.weight.to_ne_bytes());
    nested.put(IPVS_DEST_ATTR_U_THRESH, &0u32.to_ne_bytes());
    nested.put(IPVS_DEST_ATTR_L_THRESH, &0u32.to_ne_bytes());
    nested.buf
}

/// Controller request resolving a genl family name to its id.
pub fn family_lookup_request(seq: u32, name: &str) -> Vec<u8> {
    let mut msg = MessageBuilder::new(GENL_ID_CTRL, NLM_F_REQUEST | NLM_F_ACK, seq, CTRL_CMD_GETFAMILY, 1);
    msg.put_str(CTRL_ATTR_FAMILY_NAME, name);
    msg.finish()
}

// ── Parsing ────────────────────────────────────────────────────────

/// One netlink message within a receive buffer.
pub struct NlMsg<'a> {
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

/// Iterate the netlink messages in a receive buffer.
pub fn messages(buf: &[u8]) -> NlMsgIter<'_> {
    NlMsgIter { buf }
}

pub struct NlMsgIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for NlMsgIter<'a> {
    type Item = NlMsg<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLMSG_HDRLEN {
            return None;
        }
        let len = u32::from_ne_bytes(self.buf[0..4].try_into().ok()?) as usize;
        if len < NLMSG_HDRLEN || len > self.buf.len() {
            return None;
        }
        let kind = u16::from_ne_bytes(self.buf[4..6].try_into().ok()?);
        let flags = u16::from_ne_bytes(self.buf[6..8].try_into().ok()?);
        let seq = u32::from_ne_bytes(self.buf[8..12].try_into().ok()?);
        let payload = &self.buf[NLMSG_HDRLEN..len];
        self.buf = &self.buf[align4(len).min(self.buf.len())..];
        Some(NlMsg { kind, flags, seq, payload })
    }
}

/// Errno carried by an `NLMSG_ERROR` message; 0 is an ack.
pub fn error_code(payload: &[u8]) -> Option<i32> {
    payload
        .get(0..4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_ne_bytes)
}

/// One attribute within a genl payload or a nested attribute block.
pub struct Attr<'a> {
    kind: u16,
    pub payload: &'a [u8],
}

impl Attr<'_> {
    pub fn kind(&self) -> u16 {
        self.kind & NLA_TYPE_MASK
    }
}

/// Iterate attributes, skipping the genl header when `genl` is set.
pub fn attrs(payload: &[u8], genl: bool) -> AttrIter<'_> {
    let buf = if genl && payload.len() >= GENL_HDRLEN {
        &payload[GENL_HDRLEN..]
    } else if genl {
        &[]
    } else {
        payload
    };
    AttrIter { buf }
}

pub struct AttrIter<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Attr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < NLA_HDRLEN {
            return None;
        }
        let len = u16::from_ne_bytes(self.buf[0..2].try_into().ok()?) as usize;
        if len < NLA_HDRLEN || len > self.buf.len() {
            return None;
        }
        let kind = u16::from_ne_bytes(self.buf[2..4].try_into().ok()?);
        let payload = &self.buf[NLA_HDRLEN..len];
        self.buf = &self.buf[align4(len).min(self.buf.len())..];
        Some(Attr { kind, payload })
    }
}

fn read_u16(payload: &[u8]) -> Option<u16> {
    payload.get(0..2).and_then(|b| b.try_into().ok()).map(u16::from_ne_bytes)
}

fn read_be16(payload: &[u8]) -> Option<u16> {
    payload.get(0..2).and_then(|b| b.try_into().ok()).map(u16::from_be_bytes)
}

fn read_u32(payload: &[u8]) -> Option<u32> {
    payload.get(0..4).and_then(|b| b.try_into().ok()).map(u32::from_ne_bytes)
}

fn read_addr(payload: &[u8], family: u16) -> Option<IpAddr> {
    match family {
        AF_INET => payload
            .get(0..4)
            .and_then(|b| <[u8; 4]>::try_from(b).ok())
            .map(|octets| IpAddr::from(octets)),
        AF_INET6 => payload
            .get(0..16)
            .and_then(|b| <[u8; 16]>::try_from(b).ok())
            .map(|octets| IpAddr::from(octets)),
        _ => None,
    }
}

fn read_str(payload: &[u8]) -> Option<&str> {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    std::str::from_utf8(&payload[..end]).ok()
}

/// Parse a nested `IPVS_ATTR_SERVICE` block.
///
/// Entries this control plane cannot represent (SCTP services, firewall-mark
/// services, schedulers outside the supported set) come back as `Ok(None)`;
/// they can only be foreign and are never touched.
pub fn parse_service(nested: &[u8]) -> Result<Option<VirtualService>, TableError> {
    let mut family = None;
    let mut protocol = None;
    let mut addr_payload: Option<&[u8]> = None;
    let mut port = None;
    let mut scheduler = None;
    let mut timeout = 0;

    for attr in attrs(nested, false) {
        match attr.kind() {
            IPVS_SVC_ATTR_AF => family = read_u16(attr.payload),
            IPVS_SVC_ATTR_PROTOCOL => protocol = read_u16(attr.payload),
            IPVS_SVC_ATTR_ADDR => addr_payload = Some(attr.payload),
            IPVS_SVC_ATTR_PORT => port = read_be16(attr.payload),
            IPVS_SVC_ATTR_SCHED_NAME => scheduler = read_str(attr.payload).map(str::to_owned),
            IPVS_SVC_ATTR_TIMEOUT => timeout = read_u32(attr.payload).unwrap_or(0),
            _ => {}
        }
    }

    let family = family.ok_or_else(|| TableError::Transport("service without family".to_string()))?;
    let protocol = match protocol {
        Some(6) => Protocol::Tcp,
        Some(17) => Protocol::Udp,
        _ => return Ok(None),
    };
    let Some(scheduler) = scheduler.as_deref().and_then(Scheduler::parse) else {
        return Ok(None);
    };
    let vip = addr_payload
        .and_then(|p| read_addr(p, family))
        .ok_or_else(|| TableError::Transport("service without address".to_string()))?;
    let port = port.ok_or_else(|| TableError::Transport("service without port".to_string()))?;

    Ok(Some(VirtualService { vip, port, protocol, scheduler, timeout }))
}

/// Parse a nested `IPVS_ATTR_DEST` block. `service_family` is used when the
/// destination carries no family attribute of its own.
pub fn parse_destination(
    nested: &[u8],
    service_family: u16,
) -> Result<Destination, TableError> {
    let mut family = None;
    let mut addr_payload: Option<&[u8]> = None;
    let mut port = None;
    let mut fwd = 0;
    let mut weight = 0;

    for attr in attrs(nested, false) {
        match attr.kind() {
            IPVS_DEST_ATTR_ADDR => addr_payload = Some(attr.payload),
            IPVS_DEST_ATTR_PORT => port = read_be16(attr.payload),
            IPVS_DEST_ATTR_FWD_METHOD => fwd = read_u32(attr.payload).unwrap_or(0),
            IPVS_DEST_ATTR_WEIGHT => weight = read_u32(attr.payload).unwrap_or(0),
            IPVS_DEST_ATTR_ADDR_FAMILY => family = read_u16(attr.payload),
            _ => {}
        }
    }

    let family = family.unwrap_or(service_family);
    let address = addr_payload
        .and_then(|p| read_addr(p, family))
        .ok_or_else(|| TableError::Transport("destination without address".to_string()))?;
    let port = port.ok_or_else(|| TableError::Transport("destination without port".to_string()))?;

    Ok(Destination {
        address,
        port,
        weight,
        fwd_method: FwdMethod::from_flag(fwd),
    })
}

/// Find the family id in a `CTRL_CMD_GETFAMILY` reply payload.
pub fn parse_family_id(genl_payload: &[u8]) -> Option<u16> {
    attrs(genl_payload, true)
        .find(|a| a.kind() == CTRL_ATTR_FAMILY_ID)
        .and_then(|a| read_u16(a.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::service::entity::Scheduler;
    use std::net::Ipv4Addr;

    fn sample_service() -> VirtualService {
        VirtualService {
            vip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            port: 80,
            protocol: Protocol::Tcp,
            scheduler: Scheduler::WeightedRoundRobin,
            timeout: 0,
        }
    }

    #[test]
    fn message_header_layout() {
        let mut msg = MessageBuilder::new(0x23, NLM_F_REQUEST | NLM_F_ACK, 7, IPVS_CMD_FLUSH, IPVS_GENL_VERSION);
        msg.put_u32(99, 0xdead_beef);
        let bytes = msg.finish();

        assert_eq!(u32::from_ne_bytes(bytes[0..4].try_into().unwrap()) as usize, bytes.len());
        assert_eq!(u16::from_ne_bytes(bytes[4..6].try_into().unwrap()), 0x23);
        assert_eq!(u16::from_ne_bytes(bytes[6..8].try_into().unwrap()), NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(u32::from_ne_bytes(bytes[8..12].try_into().unwrap()), 7);
        // genl header directly after the netlink header
        assert_eq!(bytes[16], IPVS_CMD_FLUSH);
        assert_eq!(bytes[17], IPVS_GENL_VERSION);
    }

    #[test]
    fn attributes_are_padded_to_four_bytes() {
        let mut msg = MessageBuilder::new(1, 0, 0, 0, 0);
        msg.put_str(5, "rr");
        let bytes = msg.finish();
        // 16 (nlmsg) + 4 (genl) + 4 (nla hdr) + 3 ("rr\0") padded to 4
        assert_eq!(bytes.len(), 16 + 4 + 8);
    }

    #[test]
    fn service_attrs_round_trip() {
        let svc = sample_service();
        let parsed = parse_service(&service_attrs(&svc)).unwrap().unwrap();
        assert_eq!(parsed, svc);
    }

    #[test]
    fn service_attrs_round_trip_v6() {
        let svc = VirtualService {
            vip: "2001:db8::1".parse().unwrap(),
            port: 443,
            protocol: Protocol::Udp,
            scheduler: Scheduler::SourceHash,
            timeout: 300,
        };
        let parsed = parse_service(&service_attrs(&svc)).unwrap().unwrap();
        assert_eq!(parsed, svc);
    }

    #[test]
    fn unsupported_scheduler_is_skipped_not_an_error() {
        let mut nested = NestedAttrs { buf: service_identity_attrs(&sample_service().key()) };
        nested.put(IPVS_SVC_ATTR_SCHED_NAME, b"mh\0");
        assert!(parse_service(&nested.buf).unwrap().is_none());
    }

    #[test]
    fn dest_attrs_round_trip() {
        let dst = Destination {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            port: 8080,
            weight: 5,
            fwd_method: FwdMethod::Masquerade,
        };
        let parsed = parse_destination(&dest_attrs(&dst), AF_INET).unwrap();
        assert_eq!(parsed, dst);
    }

    #[test]
    fn ports_are_network_byte_order_on_the_wire() {
        let key = DestinationKey {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            port: 0x1f90, // 8080
        };
        let nested = dest_identity_attrs(&key);
        let port_attr = attrs(&nested, false)
            .find(|a| a.kind() == IPVS_DEST_ATTR_PORT)
            .unwrap();
        assert_eq!(port_attr.payload, &[0x1f, 0x90]);
    }

    #[test]
    fn message_iterator_walks_multipart_buffers() {
        let a = MessageBuilder::new(0x23, NLM_F_MULTI, 1, IPVS_CMD_GET_SERVICE, 1).finish();
        let b = MessageBuilder::new(NLMSG_DONE, NLM_F_MULTI, 1, 0, 0).finish();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);

        let kinds: Vec<u16> = messages(&buf).map(|m| m.kind).collect();
        assert_eq!(kinds, vec![0x23, NLMSG_DONE]);
    }

    #[test]
    fn error_code_reads_errno() {
        assert_eq!(error_code(&(-17i32).to_ne_bytes()), Some(-17));
        assert_eq!(error_code(&0i32.to_ne_bytes()), Some(0));
        assert_eq!(error_code(&[0u8; 2]), None);
    }

    #[test]
    fn family_lookup_reply_parses_id() {
        // Hand-build a GETFAMILY reply: genl header + FAMILY_ID attribute.
        let mut payload = vec![1u8, 1, 0, 0];
        payload.extend_from_slice(&6u16.to_ne_bytes()); // nla_len
        payload.extend_from_slice(&CTRL_ATTR_FAMILY_ID.to_ne_bytes());
        payload.extend_from_slice(&0x23u16.to_ne_bytes());
        payload.extend_from_slice(&[0, 0]); // pad
        assert_eq!(parse_family_id(&payload), Some(0x23));
    }
}
