use std::net::SocketAddr;
use std::time::Duration;

use domain::health::error::ProbeError;
use ports::secondary::probe_port::{ProbeFuture, ProbePort};
use tokio::net::TcpStream;

/// Health probe that opens a TCP connection and closes it immediately.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl ProbePort for TcpProbe {
    fn check(&self, target: SocketAddr) -> ProbeFuture<'_> {
        let timeout = self.timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    drop(stream);
                    Ok(())
                }
                Ok(Err(e)) => Err(ProbeError::Connect {
                    addr: target,
                    reason: e.to_string(),
                }),
                Err(_) => Err(ProbeError::Timeout {
                    addr: target,
                    timeout,
                }),
            }
        })
    }
}
