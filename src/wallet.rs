//! Wallets: key pairs persisted as JSON, one file per node

use crate::crypto::KeyPair;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub name: Option<String>,
    pub address: String,
    pub secret_key_hex: String,
    /// RFC 3339 creation time.
    pub created: String,
}

impl Wallet {
    pub fn new(name: Option<String>) -> Self {
        Self::from_keypair(&KeyPair::generate(), name)
    }

    pub fn from_keypair(keypair: &KeyPair, name: Option<String>) -> Self {
        Wallet {
            name,
            address: keypair.address(),
            secret_key_hex: hex::encode(keypair.secret_bytes()),
            created: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn get_keypair(&self) -> Result<KeyPair, ChainError> {
        let keypair = KeyPair::from_secret_hex(&self.secret_key_hex)?;
        if keypair.address() != self.address {
            return Err(ChainError::Crypto(format!(
                "Wallet {} does not match its secret key",
                self.address
            )));
        }
        Ok(keypair)
    }

    /// Raw 64-byte `x || y`.
    pub fn public_key(&self) -> Result<Vec<u8>, ChainError> {
        Ok(self.get_keypair()?.public_key_bytes())
    }

    pub fn save(&self, path: &Path) -> Result<(), ChainError> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ChainError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// The wallets of one node, keyed by address.
#[derive(Debug)]
pub struct Wallets {
    path: PathBuf,
    wallets: BTreeMap<String, Wallet>,
}

impl Wallets {
    /// Load `path`, or start empty if it does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self, ChainError> {
        let wallets = if path.exists() {
            let data = fs::read_to_string(path)?;
            serde_json::from_str(&data)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), count = wallets.len(), "loaded wallets");
        Ok(Wallets {
            path: path.to_path_buf(),
            wallets,
        })
    }

    /// Generate a new wallet, persist the file and return the address.
    pub fn add_wallet(&mut self) -> Result<String, ChainError> {
        self.insert(Wallet::new(None))
    }

    /// Store an already generated wallet and persist the file.
    pub fn insert(&mut self, wallet: Wallet) -> Result<String, ChainError> {
        let address = wallet.address.clone();
        self.wallets.insert(address.clone(), wallet);
        self.save()?;
        Ok(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn get(&self, address: &str) -> Result<&Wallet, ChainError> {
        self.wallets
            .get(address)
            .ok_or_else(|| ChainError::NotFound(format!("No wallet for address {}", address)))
    }

    pub fn keypair(&self, address: &str) -> Result<KeyPair, ChainError> {
        self.get(address)?.get_keypair()
    }

    pub fn save(&self) -> Result<(), ChainError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.wallets)?)?;
        Ok(())
    }
}
