//! TCP connect probe, for subordinates that speak something other than HTTP.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Probe, ProbeResult};

/// Ready as soon as a TCP connection to `host:port` succeeds.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_secs(1),
        }
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn describe(&self) -> String {
        format!("connect {}", self.address())
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.address())
    }

    async fn check(&self) -> ProbeResult {
        let address = self.address();
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or(address);
                ProbeResult::Ready(peer)
            }
            Ok(Err(e)) => ProbeResult::Error(e.to_string()),
            Err(_) => ProbeResult::Error(format!(
                "connect to {address} timed out after {:?}",
                self.connect_timeout
            )),
        }
    }
}
