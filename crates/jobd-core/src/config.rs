//! Daemon configuration (`jobd.toml`).
//!
//! Every field has a default reproducing the reference deployment, so the
//! daemon runs with no config file at all; a partial file overrides only
//! what it names.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:12345"
//! cert = "certs/server.crt"
//! key = "certs/server.key"
//! ca = "certs/ca.crt"
//! runner = "./jobd-runner"
//!
//! [limits]
//! memory_mb = 10
//! cpu_shares = 512
//!
//! [permissions]
//! client1 = ["start", "stop", "status", "stream"]
//! client2 = ["start", "stop", "stream"]
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::limits::ResourceLimits;
use crate::perms::{Operation, PermissionTable, Permissions};

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: ResourceLimits,
    /// Client CN → granted operations.
    pub permissions: HashMap<String, Vec<Operation>>,
}

/// Listener and TLS material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address the daemon listens on.
    pub listen_addr: String,
    /// Server certificate (PEM).
    pub cert: PathBuf,
    /// Server private key (PEM).
    pub key: PathBuf,
    /// CA bundle used to verify client certificates (PEM).
    pub ca: PathBuf,
    /// Path to the launcher binary.
    pub runner: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:12345".to_string(),
            cert: PathBuf::from("certs/server.crt"),
            key: PathBuf::from("certs/server.key"),
            ca: PathBuf::from("certs/ca.crt"),
            runner: PathBuf::from("./jobd-runner"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        use Operation::{Start, Status, Stop, Stream};
        let mut permissions = HashMap::new();
        permissions.insert("client1".to_string(), vec![Start, Stop, Status, Stream]);
        permissions.insert("client2".to_string(), vec![Start, Stop, Stream]);
        Self {
            server: ServerConfig::default(),
            limits: ResourceLimits::default(),
            permissions,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] when the file cannot be read and
    /// [`ConfigError::Parse`] when it does not match the schema.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Build the immutable permission table from the configured grants.
    #[must_use]
    pub fn permission_table(&self) -> PermissionTable {
        let grants = self
            .permissions
            .iter()
            .map(|(client, ops)| (client.clone(), Permissions::grant(ops)))
            .collect();
        PermissionTable::new(grants)
    }
}
