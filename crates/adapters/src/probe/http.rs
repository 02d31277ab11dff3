use std::net::SocketAddr;
use std::time::Duration;

use domain::health::error::ProbeError;
use ports::secondary::probe_port::{ProbeFuture, ProbePort};

/// Health probe that issues `GET http://<backend><path>` and compares the
/// response status. The body is drained and discarded.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
    expected_status: u16,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(timeout: Duration, path: &str, expected_status: u16) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            path: path.to_string(),
            expected_status,
            timeout,
        }
    }
}

impl ProbePort for HttpProbe {
    fn check(&self, target: SocketAddr) -> ProbeFuture<'_> {
        Box::pin(async move {
            let url = format!("http://{target}{}", self.path);
            let response = self.client.get(&url).send().await.map_err(|e| {
                if e.is_timeout() {
                    ProbeError::Timeout {
                        addr: target,
                        timeout: self.timeout,
                    }
                } else {
                    ProbeError::Http {
                        addr: target,
                        reason: e.to_string(),
                    }
                }
            })?;

            let status = response.status().as_u16();
            // Drain the body so the connection can be reused.
            let _ = response.bytes().await;

            if status != self.expected_status {
                return Err(ProbeError::UnexpectedStatus {
                    addr: target,
                    expected: self.expected_status,
                    got: status,
                });
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal single-shot HTTP server: accepts one connection, reads the
    /// request, answers with the given status line, and records the path.
    async fn serve_once(status_line: &'static str) -> (SocketAddr, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = "ok";
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            request
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn expected_status_is_ok() {
        let (addr, _server) = serve_once("200 OK").await;
        let probe = HttpProbe::new(Duration::from_secs(2), "/healthz", 200);
        assert!(probe.check(addr).await.is_ok());
    }

    #[tokio::test]
    async fn probe_requests_the_configured_path() {
        let (addr, server) = serve_once("200 OK").await;
        let probe = HttpProbe::new(Duration::from_secs(2), "/healthz", 200);
        probe.check(addr).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /healthz HTTP/1.1"));
    }

    #[tokio::test]
    async fn unexpected_status_is_an_error() {
        let (addr, _server) = serve_once("503 Service Unavailable").await;
        let probe = HttpProbe::new(Duration::from_secs(2), "/", 200);
        let err = probe.check(addr).await.unwrap_err();
        assert!(matches!(
            err,
            ProbeError::UnexpectedStatus { expected: 200, got: 503, .. }
        ));
    }

    #[tokio::test]
    async fn non_default_expected_status_matches() {
        let (addr, _server) = serve_once("201 Created").await;
        let probe = HttpProbe::new(Duration::from_secs(2), "/", 201);
        assert!(probe.check(addr).await.is_ok());
    }

    #[tokio::test]
    async fn connection_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpProbe::new(Duration::from_secs(1), "/", 200);
        let err = probe.check(addr).await.unwrap_err();
        assert!(matches!(err, ProbeError::Http { .. }));
    }
}
