//! Pre-flight reachability probe for the storage endpoint.
//!
//! The upload cycle runs on a box whose uplink comes and goes; probing
//! before listing exports avoids burning upload retries on a link that is
//! down, and keeps the cycle all-or-nothing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Yes/no reachability check run before each upload cycle.
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Probes a TCP endpoint, by default the S3 edge on port 443.
///
/// A successful connect within the timeout is the only signal; nothing is
/// written to the socket.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ConnectivityCheck for TcpProbe {
    async fn is_reachable(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "connectivity probe failed");
                false
            }
            Err(_) => {
                debug!(
                    addr = %self.addr,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "connectivity probe timed out"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listening_endpoint_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(probe.is_reachable().await);
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = TcpProbe::new(addr.to_string(), Duration::from_secs(1));
        assert!(!probe.is_reachable().await);
    }
}
