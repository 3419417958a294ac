//! Daemon configuration.
//!
//! Loaded from an optional TOML file; command-line flags are applied on top
//! by the binary. Every field has a default so an empty file is valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{DaemonError, Result};

/// Port the daemon listens on when none is configured.
pub const DEFAULT_PORT: u16 = 9090;

/// Upper bound on simultaneously served connections.
pub const CONNECTION_LIMIT: usize = 20;

/// Runtime configuration for [`crate::Daemon`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// TCP port to listen on (0 = ephemeral)
    pub port: u16,
    /// Listen on the IPv6 wildcard address instead of IPv4
    pub enable_ipv6: bool,
    /// Largest accepted request body in bytes (None = unbounded)
    pub max_body_bytes: Option<usize>,
    /// Default tracing filter when RUST_LOG is not set
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            enable_ipv6: false,
            max_body_bytes: None,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DaemonError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: DaemonConfig =
            toml::from_str(raw).map_err(|e| DaemonError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_body_bytes == Some(0) {
            return Err(DaemonError::Config(
                "max_body_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
