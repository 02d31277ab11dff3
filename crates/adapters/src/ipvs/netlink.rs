use std::io;
use std::sync::{Mutex, PoisonError};

use domain::service::entity::{Destination, DestinationKey, ServiceKey, VirtualService};
use domain::service::error::TableError;
use ports::secondary::lb_table_port::LbTablePort;
use tracing::debug;

use super::wire;

const RECV_BUF_LEN: usize = 64 * 1024;

#[allow(unsafe_code)]
mod sock {
    use std::io;
    use std::os::fd::RawFd;

    /// Raw `NETLINK_GENERIC` socket with RAII close.
    pub struct NetlinkSocket {
        fd: RawFd,
    }

    impl NetlinkSocket {
        pub fn open() -> io::Result<Self> {
            let fd = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    libc::NETLINK_GENERIC,
                )
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            let rc = unsafe {
                libc::bind(
                    fd,
                    std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                    std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(err);
            }

            Ok(Self { fd })
        }

        pub fn send(&self, buf: &[u8]) -> io::Result<()> {
            let n = unsafe { libc::send(self.fd, buf.as_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n as usize != buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short netlink send",
                ));
            }
            Ok(())
        }

        pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }
    }

    impl Drop for NetlinkSocket {
        fn drop(&mut self) {
            unsafe { libc::close(self.fd) };
        }
    }
}

struct Conn {
    sock: sock::NetlinkSocket,
    family: u16,
    seq: u32,
}

/// Kernel LB table over the `IPVS` generic-netlink family.
///
/// One socket, serialized behind a mutex; every mutation is acked by the
/// kernel before the call returns.
pub struct NetlinkLbTable {
    inner: Mutex<Conn>,
}

fn transport(err: io::Error) -> TableError {
    TableError::Transport(err.to_string())
}

fn map_errno(code: i32, subject: &str) -> TableError {
    match -code {
        libc::EEXIST => TableError::AlreadyExists(subject.to_string()),
        libc::ENOENT | libc::ESRCH => TableError::NotFound(subject.to_string()),
        libc::EINVAL => TableError::InvalidArgument(subject.to_string()),
        errno => TableError::Transport(format!(
            "{subject}: {}",
            io::Error::from_raw_os_error(errno)
        )),
    }
}

impl NetlinkLbTable {
    /// Open a netlink handle and resolve the IPVS family id.
    ///
    /// Fails when the kernel lacks IPVS support or the process lacks
    /// `CAP_NET_ADMIN`.
    pub fn open() -> Result<Self, TableError> {
        let sock = sock::NetlinkSocket::open().map_err(transport)?;
        let mut conn = Conn { sock, family: 0, seq: 0 };
        conn.family = conn.resolve_family()?;
        debug!(family = conn.family, "ipvs netlink family resolved");
        Ok(Self { inner: Mutex::new(conn) })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Conn> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Conn {
    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn resolve_family(&mut self) -> Result<u16, TableError> {
        let seq = self.next_seq();
        self.sock
            .send(&wire::family_lookup_request(seq, wire::IPVS_GENL_NAME))
            .map_err(transport)?;

        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let n = self.sock.recv(&mut buf).map_err(transport)?;
            for msg in wire::messages(&buf[..n]) {
                if msg.seq != seq {
                    continue;
                }
                match msg.kind {
                    wire::NLMSG_ERROR => {
                        let code = wire::error_code(msg.payload).unwrap_or(0);
                        if code != 0 {
                            return Err(map_errno(code, "ipvs genl family lookup"));
                        }
                    }
                    wire::GENL_ID_CTRL => {
                        if let Some(id) = wire::parse_family_id(msg.payload) {
                            return Ok(id);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Send a mutation and wait for the kernel's ack.
    fn request_ack(
        &mut self,
        cmd: u8,
        attrs: &[(u16, Vec<u8>)],
        subject: &str,
    ) -> Result<(), TableError> {
        let seq = self.next_seq();
        let mut msg = wire::MessageBuilder::new(
            self.family,
            wire::NLM_F_REQUEST | wire::NLM_F_ACK,
            seq,
            cmd,
            wire::IPVS_GENL_VERSION,
        );
        for (attr_type, payload) in attrs {
            msg.put(attr_type | wire::NLA_F_NESTED, payload);
        }
        self.sock.send(&msg.finish()).map_err(transport)?;

        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let n = self.sock.recv(&mut buf).map_err(transport)?;
            for msg in wire::messages(&buf[..n]) {
                if msg.seq != seq || msg.kind != wire::NLMSG_ERROR {
                    continue;
                }
                return match wire::error_code(msg.payload).unwrap_or(0) {
                    0 => Ok(()),
                    code => Err(map_errno(code, subject)),
                };
            }
        }
    }

    /// Send a dump request and collect the genl payload of every part.
    fn dump(
        &mut self,
        cmd: u8,
        attrs: &[(u16, Vec<u8>)],
        subject: &str,
    ) -> Result<Vec<Vec<u8>>, TableError> {
        let seq = self.next_seq();
        let mut msg = wire::MessageBuilder::new(
            self.family,
            wire::NLM_F_REQUEST | wire::NLM_F_DUMP,
            seq,
            cmd,
            wire::IPVS_GENL_VERSION,
        );
        for (attr_type, payload) in attrs {
            msg.put(attr_type | wire::NLA_F_NESTED, payload);
        }
        self.sock.send(&msg.finish()).map_err(transport)?;

        let mut parts = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let n = self.sock.recv(&mut buf).map_err(transport)?;
            for msg in wire::messages(&buf[..n]) {
                if msg.seq != seq {
                    continue;
                }
                match msg.kind {
                    wire::NLMSG_DONE => return Ok(parts),
                    wire::NLMSG_ERROR => {
                        let code = wire::error_code(msg.payload).unwrap_or(0);
                        if code != 0 {
                            return Err(map_errno(code, subject));
                        }
                        return Ok(parts);
                    }
                    _ => parts.push(msg.payload.to_vec()),
                }
            }
        }
    }
}

impl LbTablePort for NetlinkLbTable {
    fn list_services(&self) -> Result<Vec<VirtualService>, TableError> {
        let parts = self
            .conn()
            .dump(wire::IPVS_CMD_GET_SERVICE, &[], "list services")?;

        let mut services = Vec::new();
        for part in parts {
            let Some(nested) = wire::attrs(&part, true).find(|a| a.kind() == wire::IPVS_ATTR_SERVICE)
            else {
                continue;
            };
            if let Some(svc) = wire::parse_service(nested.payload)? {
                services.push(svc);
            }
        }
        Ok(services)
    }

    fn create_service(&self, service: &VirtualService) -> Result<(), TableError> {
        self.conn().request_ack(
            wire::IPVS_CMD_NEW_SERVICE,
            &[(wire::IPVS_ATTR_SERVICE, wire::service_attrs(service))],
            &service.key().to_string(),
        )
    }

    fn update_service(&self, service: &VirtualService) -> Result<(), TableError> {
        self.conn().request_ack(
            wire::IPVS_CMD_SET_SERVICE,
            &[(wire::IPVS_ATTR_SERVICE, wire::service_attrs(service))],
            &service.key().to_string(),
        )
    }

    fn delete_service(&self, key: &ServiceKey) -> Result<(), TableError> {
        self.conn().request_ack(
            wire::IPVS_CMD_DEL_SERVICE,
            &[(wire::IPVS_ATTR_SERVICE, wire::service_identity_attrs(key))],
            &key.to_string(),
        )
    }

    fn list_destinations(&self, key: &ServiceKey) -> Result<Vec<Destination>, TableError> {
        let parts = self.conn().dump(
            wire::IPVS_CMD_GET_DEST,
            &[(wire::IPVS_ATTR_SERVICE, wire::service_identity_attrs(key))],
            &key.to_string(),
        )?;

        let family = wire::family_of(key.vip);
        let mut destinations = Vec::new();
        for part in parts {
            let Some(nested) = wire::attrs(&part, true).find(|a| a.kind() == wire::IPVS_ATTR_DEST)
            else {
                continue;
            };
            destinations.push(wire::parse_destination(nested.payload, family)?);
        }
        Ok(destinations)
    }

    fn create_destination(
        &self,
        key: &ServiceKey,
        destination: &Destination,
    ) -> Result<(), TableError> {
        self.conn().request_ack(
            wire::IPVS_CMD_NEW_DEST,
            &[
                (wire::IPVS_ATTR_SERVICE, wire::service_identity_attrs(key)),
                (wire::IPVS_ATTR_DEST, wire::dest_attrs(destination)),
            ],
            &format!("{key} -> {}", destination.key()),
        )
    }

    fn update_destination(
        &self,
        key: &ServiceKey,
        destination: &Destination,
    ) -> Result<(), TableError> {
        self.conn().request_ack(
            wire::IPVS_CMD_SET_DEST,
            &[
                (wire::IPVS_ATTR_SERVICE, wire::service_identity_attrs(key)),
                (wire::IPVS_ATTR_DEST, wire::dest_attrs(destination)),
            ],
            &format!("{key} -> {}", destination.key()),
        )
    }

    fn delete_destination(
        &self,
        key: &ServiceKey,
        destination: &DestinationKey,
    ) -> Result<(), TableError> {
        self.conn().request_ack(
            wire::IPVS_CMD_DEL_DEST,
            &[
                (wire::IPVS_ATTR_SERVICE, wire::service_identity_attrs(key)),
                (wire::IPVS_ATTR_DEST, wire::dest_identity_attrs(destination)),
            ],
            &format!("{key} -> {destination}"),
        )
    }

    fn flush(&self) -> Result<(), TableError> {
        self.conn()
            .request_ack(wire::IPVS_CMD_FLUSH, &[], "flush")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert!(matches!(
            map_errno(-libc::EEXIST, "svc"),
            TableError::AlreadyExists(_)
        ));
        assert!(matches!(
            map_errno(-libc::ENOENT, "svc"),
            TableError::NotFound(_)
        ));
        assert!(matches!(
            map_errno(-libc::ESRCH, "svc"),
            TableError::NotFound(_)
        ));
        assert!(matches!(
            map_errno(-libc::EINVAL, "svc"),
            TableError::InvalidArgument(_)
        ));
        assert!(matches!(
            map_errno(-libc::EPERM, "svc"),
            TableError::Transport(_)
        ));
    }
}
