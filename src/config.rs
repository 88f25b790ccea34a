//! WolfCoord Configuration
//!
//! File configuration for the `wolfcoord` binary. Library users build an
//! [`ElectionConfig`] directly; this module maps a TOML file onto one and
//! opens the configured storage backend.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::state::ElectionConfig;
use crate::storage::{MemoryBackend, MySqlBackend, SqliteBackend, StorageBackend};

/// Main WolfCoord configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfCoordConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Election timing and table names
    pub election: ElectionSection,

    /// Shared store
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Address advertised in the member row
    #[serde(default)]
    pub address: Option<String>,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// Election group name
    pub group: String,

    /// Membership table name
    pub membership_table: String,

    /// Leadership table name
    pub leadership_table: String,

    /// Heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Leader monitor interval in milliseconds
    pub monitor_interval_ms: u64,

    /// Lease TTL in milliseconds (must exceed the heartbeat interval)
    pub lease_ttl_ms: u64,

    /// Member rows older than this many heartbeat intervals are pruned
    #[serde(default = "default_stale_after_multiple")]
    pub stale_after_multiple: u32,

    /// Clock skew tolerated between nodes in milliseconds
    #[serde(default)]
    pub max_clock_skew_ms: u64,
}

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite database file shared by every node on the host
    Sqlite,
    /// MySQL or MariaDB server
    Mysql,
    /// In-process only; useful for trying out a single node
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend type
    pub backend: BackendKind,

    /// SQLite database path
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// MySQL connection URL
    #[serde(default)]
    pub url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_stale_after_multiple() -> u32 {
    3
}

fn default_pool_size() -> u32 {
    4
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfCoordConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: WolfCoordConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        match self.storage.backend {
            BackendKind::Sqlite if self.storage.path.is_none() => {
                return Err(crate::Error::ConfigurationInvalid(
                    "storage.path is required for the sqlite backend".into(),
                ));
            }
            BackendKind::Mysql if self.storage.url.is_none() => {
                return Err(crate::Error::ConfigurationInvalid(
                    "storage.url is required for the mysql backend".into(),
                ));
            }
            _ => {}
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "compact") {
            return Err(crate::Error::ConfigurationInvalid(format!(
                "logging.format must be 'pretty' or 'compact', got '{}'",
                self.logging.format
            )));
        }

        self.election_config().validate()
    }

    /// Build the library election configuration
    pub fn election_config(&self) -> ElectionConfig {
        ElectionConfig {
            node_id: self.node.id.clone(),
            address: self.node.address.clone(),
            group: self.election.group.clone(),
            membership_table: self.election.membership_table.clone(),
            leadership_table: self.election.leadership_table.clone(),
            heartbeat_interval: Duration::from_millis(self.election.heartbeat_interval_ms),
            monitor_interval: Duration::from_millis(self.election.monitor_interval_ms),
            lease_ttl: Duration::from_millis(self.election.lease_ttl_ms),
            stale_after_multiple: self.election.stale_after_multiple,
            max_clock_skew: Duration::from_millis(self.election.max_clock_skew_ms),
        }
    }

    /// Open the configured storage backend
    pub async fn open_backend(&self) -> crate::Result<Arc<dyn StorageBackend>> {
        let missing = |field: &str| {
            crate::Error::ConfigurationInvalid(format!("storage.{} is not set", field))
        };

        let backend: Arc<dyn StorageBackend> = match self.storage.backend {
            BackendKind::Sqlite => {
                let path = self.storage.path.as_ref().ok_or_else(|| missing("path"))?;
                Arc::new(SqliteBackend::open(path)?)
            }
            BackendKind::Mysql => {
                let url = self.storage.url.as_deref().ok_or_else(|| missing("url"))?;
                Arc::new(
                    MySqlBackend::connect(
                        url,
                        self.storage.pool_size,
                        Duration::from_secs(self.storage.connect_timeout_secs),
                    )
                    .await?,
                )
            }
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
        };

        Ok(backend)
    }

    /// Sample configuration written by `wolfcoord init`
    pub fn sample(node_id: &str) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.to_string(),
                address: None,
            },
            election: ElectionSection {
                group: "default".to_string(),
                membership_table: "wolfcoord_members".to_string(),
                leadership_table: "wolfcoord_leadership".to_string(),
                heartbeat_interval_ms: 1000,
                monitor_interval_ms: 1000,
                lease_ttl_ms: 5000,
                stale_after_multiple: default_stale_after_multiple(),
                max_clock_skew_ms: 500,
            },
            storage: StorageConfig {
                backend: BackendKind::Sqlite,
                path: Some(PathBuf::from("/var/lib/wolfcoord/coord.db")),
                url: None,
                pool_size: default_pool_size(),
                connect_timeout_secs: default_connect_timeout(),
            },
            logging: LoggingConfig::default(),
        }
    }
}
