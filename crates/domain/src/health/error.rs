use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Outcome of a failed probe.
///
/// Not an error in control-plane terms: a failed probe is a normal
/// observation that advances the health state machine.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("tcp connect to {addr} failed: {reason}")]
    Connect { addr: SocketAddr, reason: String },

    #[error("probe of {addr} timed out after {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("http request to {addr} failed: {reason}")]
    Http { addr: SocketAddr, reason: String },

    #[error("http probe of {addr} returned status {got}, expected {expected}")]
    UnexpectedStatus {
        addr: SocketAddr,
        expected: u16,
        got: u16,
    },
}
