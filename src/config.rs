//! Node configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all) yields a working in-memory node with the open group enabled.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::circuit::DEFAULT_CIRCUIT_K;
use crate::groups::OPEN_GROUP_ID;
use crate::types::{GroupId, Hash32};

const DEFAULT_TREE_DEPTH: usize = 20;
const DEFAULT_MAX_ZK_PROOF_SIZE: usize = 16 * 1024;
const DEFAULT_QUERY_LIMIT: usize = 100;
const DEFAULT_HISTORY_LIMIT: usize = 1024;
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_USER_POLL_INTERVAL_SECS: u64 = 15;
const DEFAULT_GROUP_SYNC_INTERVAL_SECS: u64 = 60;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub groups: GroupsConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database directory. In-memory storage when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    #[serde(default = "default_tree_depth")]
    pub tree_depth: usize,
    #[serde(default = "default_true")]
    pub open_group_enabled: bool,
    #[serde(default = "default_open_group_id")]
    pub open_group_id: GroupId,
    #[serde(default)]
    pub static_groups: Vec<StaticGroupConfig>,
    #[serde(default)]
    pub reputation_groups: Vec<ReputationGroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticGroupConfig {
    pub id: GroupId,
    #[serde(default)]
    pub members: Vec<Hash32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationGroupConfig {
    pub provider: String,
    pub tier: String,
    /// Base URL of the membership service.
    pub source_url: String,
    #[serde(default = "default_http_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_true")]
    pub require_registration: bool,
    #[serde(default = "default_circuit_k")]
    pub circuit_k: u32,
    #[serde(default = "default_max_zk_proof_size")]
    pub max_zk_proof_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_query_limit")]
    pub query_limit: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_user_poll_interval_secs")]
    pub user_poll_interval_secs: u64,
    #[serde(default = "default_group_sync_interval_secs")]
    pub group_sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            tree_depth: DEFAULT_TREE_DEPTH,
            open_group_enabled: true,
            open_group_id: default_open_group_id(),
            static_groups: Vec::new(),
            reputation_groups: Vec::new(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            require_registration: true,
            circuit_k: DEFAULT_CIRCUIT_K,
            max_zk_proof_size: DEFAULT_MAX_ZK_PROOF_SIZE,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            query_limit: DEFAULT_QUERY_LIMIT,
            history_limit: DEFAULT_HISTORY_LIMIT,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_poll_interval_secs: DEFAULT_USER_POLL_INTERVAL_SECS,
            group_sync_interval_secs: DEFAULT_GROUP_SYNC_INTERVAL_SECS,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_tree_depth() -> usize {
    DEFAULT_TREE_DEPTH
}

fn default_open_group_id() -> GroupId {
    GroupId::from(OPEN_GROUP_ID)
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_circuit_k() -> u32 {
    DEFAULT_CIRCUIT_K
}

fn default_max_zk_proof_size() -> usize {
    DEFAULT_MAX_ZK_PROOF_SIZE
}

fn default_query_limit() -> usize {
    DEFAULT_QUERY_LIMIT
}

fn default_history_limit() -> usize {
    DEFAULT_HISTORY_LIMIT
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_user_poll_interval_secs() -> u64 {
    DEFAULT_USER_POLL_INTERVAL_SECS
}

fn default_group_sync_interval_secs() -> u64 {
    DEFAULT_GROUP_SYNC_INTERVAL_SECS
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Config {
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn load_from_file_or_default(path: &PathBuf) -> Self {
        Self::load_from_file(path).unwrap_or_default()
    }

    pub fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.groups.tree_depth, DEFAULT_TREE_DEPTH);
        assert_eq!(config.groups.open_group_id.as_str(), "zksocial_all");
        assert!(config.groups.open_group_enabled);
        assert!(config.storage.path.is_none());
        assert_eq!(config.verification.circuit_k, DEFAULT_CIRCUIT_K);
        assert_eq!(config.transport.query_limit, DEFAULT_QUERY_LIMIT);
    }

    #[test]
    fn test_serialize_deserialize_config() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.groups.tree_depth, deserialized.groups.tree_depth);
        assert_eq!(
            config.sync.group_sync_interval_secs,
            deserialized.sync.group_sync_interval_secs
        );
    }

    #[test]
    fn test_custom_config() {
        let config_toml = r#"
            [storage]
            path = "/var/lib/zkitter"

            [groups]
            tree_depth = 16
            open_group_enabled = false

            [[groups.static_groups]]
            id = "founders"
            members = ["0x0101010101010101010101010101010101010101010101010101010101010101"]

            [[groups.reputation_groups]]
            provider = "twitter"
            tier = "gold"
            source_url = "https://interrep.example"

            [verification]
            require_registration = false
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.storage.path, Some(PathBuf::from("/var/lib/zkitter")));
        assert_eq!(config.groups.tree_depth, 16);
        assert!(!config.groups.open_group_enabled);
        assert_eq!(config.groups.static_groups[0].members, vec![Hash32([1; 32])]);
        assert_eq!(config.groups.reputation_groups[0].timeout_secs, DEFAULT_HTTP_TIMEOUT_SECS);
        assert!(!config.verification.require_registration);
        assert_eq!(config.verification.circuit_k, DEFAULT_CIRCUIT_K);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("zkitter.toml");
        let mut config = Config::default();
        config.sync.user_poll_interval_secs = 3;
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.sync.user_poll_interval_secs, 3);
        assert!(Config::load_from_file(&dir.path().join("missing.toml")).is_err());
        assert_eq!(
            Config::load_from_file_or_default(&dir.path().join("missing.toml"))
                .sync
                .user_poll_interval_secs,
            DEFAULT_USER_POLL_INTERVAL_SECS
        );
    }
}
