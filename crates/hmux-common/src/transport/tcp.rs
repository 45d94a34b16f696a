use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

use crate::protocol::error::{HmuxError, Result};

/// Default timeout for establishing a backend connection (5 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Async TCP connect helper for backend connections.
///
/// Resolves the address and tries each resolved socket address in turn, all
/// within a single connect timeout. Every failure, including the timeout, is
/// reported as [`HmuxError::Connect`] so the pool can treat it as a backend
/// failure signal.
pub struct TcpTransport {
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Connects to a remote endpoint.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:6802")
    ///
    /// # Returns
    ///
    /// A connected TCP stream with `TCP_NODELAY` set
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, Self::connect_any(addr)).await {
            Ok(result) => result,
            Err(_) => Err(HmuxError::Connect(format!(
                "connect to {} timed out after {}ms",
                addr,
                self.connect_timeout.as_millis()
            ))),
        }
    }

    async fn connect_any(addr: &str) -> Result<TcpStream> {
        let socket_addrs = lookup_host(addr)
            .await
            .map_err(|e| HmuxError::Connect(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            match TcpStream::connect(socket_addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on {}: {}", socket_addr, e);
                    }
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(HmuxError::Connect(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}
