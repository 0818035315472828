//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files (default: `<config dir>/remotefit/config.toml`)
//! - Environment variables (`REMOTEFIT_HOST`, `REMOTEFIT_PORT`, `REMOTEFIT_AUTH_KEY`)
//! - CLI arguments (applied by the binary last)
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 3000
//!
//! [auth]
//! key = "shared secret"
//!
//! [client]
//! host = "fit-host.local"
//! port = 3000
//! connect_timeout_secs = 10
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{RemoteFitError, Result};
use crate::protocol::{SharedKey, DEFAULT_AUTH_KEY, MAX_FRAME_SIZE};

/// Default port for both server and client
pub const DEFAULT_PORT: u16 = 3000;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Session server configuration
    #[serde(default)]
    pub server: ServerSection,

    /// Shared-key configuration
    #[serde(default)]
    pub auth: AuthSection,

    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            RemoteFitError::Config(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        toml::from_str(&content)
            .map_err(|e| RemoteFitError::Config(format!("Failed to parse config: {e}")))
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remotefit").join("config.toml"))
    }

    /// Resolve configuration: explicit file, else the default file if it
    /// exists, else built-in defaults; then environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let base = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(path)?,
                _ => Self::default(),
            },
        };
        Ok(base.with_env())
    }

    /// Apply environment overrides
    pub fn with_env(self) -> Self {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(host) = lookup("REMOTEFIT_HOST") {
            self.server.host.clone_from(&host);
            self.client.host = host;
        }
        if let Some(port) = lookup("REMOTEFIT_PORT") {
            match port.parse() {
                Ok(port) => {
                    self.server.port = port;
                    self.client.port = port;
                },
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid REMOTEFIT_PORT"),
            }
        }
        if let Some(key) = lookup("REMOTEFIT_AUTH_KEY") {
            self.auth.key = key;
        }
        self
    }

    /// Shared key for the handshake
    pub fn shared_key(&self) -> Result<SharedKey> {
        SharedKey::new(self.auth.key.as_bytes().to_vec())
    }
}

/// Session server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Largest accepted frame payload in bytes
    pub max_frame_size: u32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl ServerSection {
    /// Get the full listen address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Shared-key configuration (wiped on drop)
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct AuthSection {
    /// Key shared by client and server
    #[serde(default = "default_auth_key")]
    pub key: String,
}

fn default_auth_key() -> String {
    DEFAULT_AUTH_KEY.to_string()
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            key: default_auth_key(),
        }
    }
}

impl fmt::Debug for AuthSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSection")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            connect_timeout_secs: 10,
        }
    }
}

impl ClientSection {
    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
