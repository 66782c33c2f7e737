//! Configuration for a keyplane node.

use crate::error::{KeyplaneError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a keyplane node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyplaneConfig {
    /// Node identity.
    pub node: NodeConfig,
    /// Consensus settings.
    pub raft: RaftSettings,
    /// Coordination/admin API settings.
    pub api: ApiConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Replica group policy.
    pub group: GroupSettings,
}

impl KeyplaneConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| KeyplaneError::InvalidConfig {
            field: "config".to_string(),
            reason: format!("failed to read config file: {}", e),
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            KeyplaneError::InvalidConfig {
                field: "config".to_string(),
                reason: format!("failed to parse config: {}", e),
            }
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(KeyplaneError::InvalidConfig {
                field: "node.id".to_string(),
                reason: "node id must be non-zero".to_string(),
            });
        }

        if !self.raft.bootstrap && self.raft.peers.is_empty() {
            return Err(KeyplaneError::InvalidConfig {
                field: "raft.peers".to_string(),
                reason: "a non-bootstrap node requires at least one peer".to_string(),
            });
        }

        if let Some(quorum) = self.group.write_quorum {
            if quorum == 0 {
                return Err(KeyplaneError::InvalidConfig {
                    field: "group.write_quorum".to_string(),
                    reason: "write quorum must be non-zero".to_string(),
                });
            }
        }

        Ok(())
    }

    /// A single-node development configuration that bootstraps itself.
    pub fn development() -> Self {
        Self {
            node: NodeConfig {
                id: 1,
                name: "dev-node".to_string(),
            },
            raft: RaftSettings {
                bind_addr: "127.0.0.1:9100".parse().expect("valid socket address"),
                peers: HashMap::new(),
                bootstrap: true,
                election_timeout_min: Duration::from_millis(150),
                election_timeout_max: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(50),
                snapshot_threshold: 10_000,
                propose_timeout: Duration::from_secs(10),
            },
            api: ApiConfig {
                bind_addr: "127.0.0.1:9101".parse().expect("valid socket address"),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("/tmp/keyplane"),
            },
            group: GroupSettings::default(),
        }
    }
}

/// Node-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable node name.
    pub name: String,
}

/// Consensus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftSettings {
    /// Address the raft RPC endpoints bind to.
    pub bind_addr: SocketAddr,
    /// Known peers at startup, `node id -> host:port`. May be empty for a
    /// bootstrap node; later nodes are adopted via voter addition.
    pub peers: HashMap<NodeId, String>,
    /// Whether this node bootstraps a fresh single-voter cluster.
    pub bootstrap: bool,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Applied entries between state machine snapshots.
    pub snapshot_threshold: usize,
    /// Upper bound on a leader-side mutation submission.
    pub propose_timeout: Duration,
}

/// Coordination/admin API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address the coordination API binds to.
    pub bind_addr: SocketAddr,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the raft log, vote state, and snapshots.
    pub data_dir: PathBuf,
}

/// Replica group policy, consumed by the default group constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    /// Write quorum per group. `None` derives a majority from the group size.
    pub write_quorum: Option<usize>,
    /// Per-request timeout for leaf storage operations.
    pub request_timeout: Duration,
}

impl Default for GroupSettings {
    fn default() -> Self {
        Self {
            write_quorum: None,
            request_timeout: Duration::from_secs(2),
        }
    }
}
