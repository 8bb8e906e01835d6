//! Engine configuration, deserialized from `iopmesh.toml`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Agent name used when none is configured.
pub const DEFAULT_AGENT_NAME: &str = "iop_noname";

/// Quota ceilings. Zero means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum agents visible on the network, the local one included.
    pub max_agents: usize,
    /// Maximum IOPs in the local definition.
    pub max_iops: usize,
    /// Unlicensed operation time box in seconds.
    pub unlicensed_timeout_secs: u64,
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Agent name announced to peers.
    pub agent_name: String,
    /// Network-unique id of this process.
    pub peer_id: String,
    /// TCP address to listen on.
    pub listen_addr: SocketAddr,
    /// Pre-shared key for handshake authentication. Empty disables it.
    pub shared_secret: String,
    /// Peers dialed at start and redialed after their connection ends.
    pub bootstrap_peers: Vec<SocketAddr>,
    /// Delay between redial attempts.
    pub reconnect_interval_secs: u64,
    /// Definition JSON loaded at start.
    pub definition_path: Option<PathBuf>,
    /// Mapping JSON loaded at start.
    pub mapping_path: Option<PathBuf>,
    /// Events retained in the event bus history.
    pub event_history: usize,
    pub quota: QuotaConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_name: DEFAULT_AGENT_NAME.to_string(),
            peer_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shared_secret: String::new(),
            bootstrap_peers: Vec::new(),
            reconnect_interval_secs: 5,
            definition_path: None,
            mapping_path: None,
            event_history: 1000,
            quota: QuotaConfig::default(),
        }
    }
}
