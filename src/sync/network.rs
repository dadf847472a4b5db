//! Connectivity probe checked before any sync traffic

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;

#[async_trait]
pub trait Connectivity: Send + Sync {
    /// Whether `server_url` is worth contacting right now
    async fn is_online(&self, server_url: &str) -> bool;
}

/// Considers the network up when a TCP connection to the sync server opens
#[derive(Debug, Clone)]
pub struct TcpConnectivity {
    timeout: Duration,
}

impl TcpConnectivity {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn probe_target(server_url: &str) -> Option<(String, u16)> {
    let url = url::Url::parse(server_url).ok()?;
    let host = url.host_str()?.to_string();
    let port = url.port_or_known_default()?;
    Some((host, port))
}

#[async_trait]
impl Connectivity for TcpConnectivity {
    async fn is_online(&self, server_url: &str) -> bool {
        let Some((host, port)) = probe_target(server_url) else {
            log::debug!("Connectivity probe: no usable host in {}", server_url);
            return false;
        };

        match tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                log::debug!("Connectivity probe to {}:{} failed: {}", host, port, e);
                false
            }
            Err(_) => {
                log::debug!("Connectivity probe to {}:{} timed out", host, port);
                false
            }
        }
    }
}

/// Fixed answer, switchable at runtime. Used when the host platform reports
/// connectivity itself.
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connectivity for StaticConnectivity {
    async fn is_online(&self, _server_url: &str) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
