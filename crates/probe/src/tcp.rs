use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::{HealthProbe, ProbeResult};

/// Readiness probe that attempts a TCP connection to a host and port.
///
/// Connectivity alone is a weak signal; this probe is reserved for
/// infrastructure nodes with no query protocol of their own.
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Creates a new probe for the given host and port.
    #[must_use]
    pub const fn new(host: String, port: u16, timeout: Duration) -> Self {
        Self {
            host,
            port,
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    fn describe(&self) -> String {
        format!("tcp {}:{}", self.host, self.port)
    }

    async fn check(&self) -> ProbeResult {
        debug!("probing tcp {}:{}", self.host, self.port);

        match timeout(
            self.timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        {
            Ok(Ok(_)) => ProbeResult::Ready,
            Ok(Err(e)) => ProbeResult::NotReady(e.to_string()),
            Err(_) => ProbeResult::NotReady(format!("no connection within {:?}", self.timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ready_when_port_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let probe = TcpProbe::new("127.0.0.1".to_string(), port, Duration::from_secs(1));

        assert_eq!(probe.check().await, ProbeResult::Ready);
    }

    #[tokio::test]
    async fn test_not_ready_when_nothing_listens() {
        // Bind and drop to get a port that is very likely closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbe::new("127.0.0.1".to_string(), port, Duration::from_secs(1));

        assert!(matches!(probe.check().await, ProbeResult::NotReady(_)));
    }
}
