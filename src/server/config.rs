//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::config::{Config, DEFAULT_PORT};
use crate::error::{RemoteFitError, Result};
use crate::protocol::{SharedKey, MAX_FRAME_SIZE};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address
    pub addr: SocketAddr,
    /// Shared handshake key
    pub key: SharedKey,
    /// Largest accepted frame payload (bytes)
    pub max_frame_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            key: SharedKey::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Resolve the server section of a loaded [`Config`]
    pub fn from_config(config: &Config) -> Result<Self> {
        let addr = (config.server.host.as_str(), config.server.port)
            .to_socket_addrs()
            .map_err(|e| {
                RemoteFitError::Config(format!(
                    "Invalid listen address {}: {e}",
                    config.server.listen_addr()
                ))
            })?
            .next()
            .ok_or_else(|| {
                RemoteFitError::Config(format!(
                    "No address for {}",
                    config.server.listen_addr()
                ))
            })?;

        Ok(Self {
            addr,
            key: config.shared_key()?,
            max_frame_size: config.server.max_frame_size,
        })
    }

    /// Create with custom port
    pub fn with_port(mut self, port: u16) -> Self {
        self.addr.set_port(port);
        self
    }

    /// Bind to all interfaces
    pub fn bind_all(mut self) -> Self {
        self.addr.set_ip(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        self
    }

    /// Set address directly
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Set the shared key
    pub fn with_key(mut self, key: SharedKey) -> Self {
        self.key = key;
        self
    }

    /// Set max frame size
    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }
}
