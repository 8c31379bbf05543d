//! Server configuration (TOML file plus environment overrides).
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/schemaflow"
//!
//! [persistence]
//! flush_threshold = 5
//! merge_debounce_ms = 300
//!
//! [tokens.dev-token]
//! user_id = "u-1"
//! username = "alice"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::scheduler::PersistenceConfig;

pub const ENV_BIND: &str = "SCHEMAFLOW_BIND";
pub const ENV_STORAGE_PATH: &str = "SCHEMAFLOW_STORAGE_PATH";
pub const ENV_FLUSH_THRESHOLD: &str = "SCHEMAFLOW_FLUSH_THRESHOLD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Identity a static token resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenIdentity {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames a room member may fall behind before dropping some.
    pub broadcast_capacity: usize,
    /// Queue depth of each connection's direct channel.
    pub direct_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory; `None` keeps everything in memory.
    pub storage_path: Option<PathBuf>,
    pub persistence: PersistenceConfig,
    /// Patch messages accepted per connection per second (0 = unlimited).
    pub max_patches_per_sec: u32,
    /// Accepted bearer tokens.
    pub tokens: BTreeMap<String, TokenIdentity>,
    /// Private workspaces and the user ids allowed to join them. Workspaces
    /// not listed are open to every authenticated user.
    pub workspace_members: BTreeMap<String, Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            direct_capacity: 64,
            heartbeat_interval_secs: 30,
            storage_path: None,
            persistence: PersistenceConfig::default(),
            max_patches_per_sec: 5,
            tokens: BTreeMap::new(),
            workspace_members: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from `path` (or defaults when `None`), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Apply `SCHEMAFLOW_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(bind) = lookup(ENV_BIND) {
            self.bind_addr = bind;
        }
        if let Some(path) = lookup(ENV_STORAGE_PATH) {
            self.storage_path = (!path.is_empty()).then(|| PathBuf::from(path));
        }
        if let Some(raw) = lookup(ENV_FLUSH_THRESHOLD) {
            self.persistence.flush_threshold =
                raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    var: ENV_FLUSH_THRESHOLD,
                    value: raw.clone(),
                })?;
        }
        Ok(())
    }

    /// Defaults with the given bind address and no persistence.
    pub fn in_memory(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    /// Defaults with RocksDB persistence at `path`.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Accept `token` as `username`.
    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            TokenIdentity {
                user_id: user_id.into(),
                username: username.into(),
            },
        );
        self
    }

    /// Restrict `workspace_id` to the listed user ids.
    pub fn with_private_workspace<I, U>(mut self, workspace_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        self.workspace_members.insert(
            workspace_id.into(),
            members.into_iter().map(Into::into).collect(),
        );
        self
    }
}
