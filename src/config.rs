//! Configuration management for Coinpit

use crate::error::ChainError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "COINPIT_CONFIG";
pub const NODE_ID_ENV: &str = "NODE_ID";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningConfig {
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_block_reward")]
    pub block_reward: u64,
    /// Bundle a coinbase crediting the sender with every transfer.
    #[serde(default)]
    pub reward_sender_on_send: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_block_reward")]
    pub initial_grant: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenesisConfig {
    #[serde(default = "default_genesis_address")]
    pub address: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            block_reward: default_block_reward(),
            reward_sender_on_send: false,
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            initial_grant: default_block_reward(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            rate_limit_per_minute: default_rate_limit(),
        }
    }
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            address: default_genesis_address(),
        }
    }
}

impl Config {
    /// Path of the SQLite ledger for this node.
    pub fn ledger_path(&self) -> PathBuf {
        self.node
            .data_dir
            .join(format!("blocks_{}.db", self.node.node_id))
    }

    pub fn wallets_path(&self) -> PathBuf {
        self.node
            .data_dir
            .join(format!("wallets_{}.json", self.node.node_id))
    }

    pub fn seed_nodes_path(&self) -> PathBuf {
        self.node.data_dir.join("seed_nodes.json")
    }

    pub fn validate(&self) -> Result<(), ChainError> {
        if self.node.node_id.trim().is_empty() {
            return Err(ChainError::Config("node.node_id must not be empty".to_string()));
        }
        if self.node.data_dir.as_os_str().is_empty() {
            return Err(ChainError::Config("node.data_dir must be set".to_string()));
        }
        if self.mining.difficulty == 0 || self.mining.difficulty > 255 {
            return Err(ChainError::Config(format!(
                "mining.difficulty must be within 1..=255, got {}",
                self.mining.difficulty
            )));
        }
        Ok(())
    }
}

/// Load `config.toml` (or the file named by `COINPIT_CONFIG`), falling back to
/// defaults when it is absent. `NODE_ID` overrides `node.node_id`.
pub fn load_config() -> Result<Config, ChainError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string());
    let mut config = load_config_from(Path::new(&path))?;

    if let Ok(node_id) = std::env::var(NODE_ID_ENV) {
        if !node_id.is_empty() {
            config.node.node_id = node_id;
        }
    }

    config.validate()?;
    Ok(config)
}

pub fn load_config_from(path: &Path) -> Result<Config, ChainError> {
    let config_str = fs::read_to_string(path).unwrap_or_default();
    if config_str.trim().is_empty() {
        return Ok(Config::default());
    }
    toml::from_str(&config_str)
        .map_err(|e| ChainError::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

fn default_node_id() -> String {
    "3000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_difficulty() -> u32 {
    crate::miner::DEFAULT_DIFFICULTY
}

fn default_block_reward() -> u64 {
    100
}

fn default_api_port() -> u16 {
    6969
}

fn default_rate_limit() -> usize {
    30
}

fn default_genesis_address() -> String {
    // Funds nobody in particular; replaced in any real deployment.
    "00751e76e8199196d454941c45d1b3a323f1433bd6510d1634".to_string()
}
