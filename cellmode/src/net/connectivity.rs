use crate::Result;
use async_trait::async_trait;
use std::{net::SocketAddr, time::Duration};
use tokio::{net::TcpStream, time};
use tracing::debug;

/// Checks whether the internet is reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self) -> Result<bool>;
}

/// Reachability by opening a TCP connection to a well known host.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub target: SocketAddr,
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([8, 8, 8, 8], 53)),
            timeout: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl ConnectivityProbe for TcpProbe {
    async fn check(&self) -> Result<bool> {
        match time::timeout(self.timeout, TcpStream::connect(self.target)).await {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => {
                debug!("connectivity check to {} failed: {e}", self.target);
                Ok(false)
            }
            Err(_) => {
                debug!("connectivity check to {} timed out", self.target);
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn reachable_listener_passes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let probe = TcpProbe {
            target: listener.local_addr().unwrap(),
            timeout: Duration::from_secs(2),
        };

        assert!(probe.check().await.unwrap());
    }

    #[tokio::test]
    async fn closed_port_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        drop(listener);

        let probe = TcpProbe {
            target,
            timeout: Duration::from_secs(2),
        };

        assert!(!probe.check().await.unwrap());
    }
}
