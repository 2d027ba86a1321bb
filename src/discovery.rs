//! Seed-node bookkeeping for peer discovery
//!
//! Known seed nodes are persisted as JSON. Health is a single TCP dial; a node
//! that stops answering is kept for a grace period after it was last seen.

use crate::error::ChainError;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Returned when no healthy node is known.
pub const FALLBACK_NODE: &str = "localhost:3000";
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
/// How long an unreachable node is remembered after it was last seen.
pub const UNHEALTHY_GRACE_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedNode {
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub is_healthy: bool,
}

impl SeedNode {
    pub fn new(address: impl Into<String>) -> Self {
        SeedNode {
            address: address.into(),
            last_seen: Utc::now(),
            is_healthy: true,
        }
    }

    /// Fold in a health check taken at `now`. `None` means the node has been
    /// unreachable past the grace period and should be forgotten.
    pub fn observe(mut self, healthy: bool, now: DateTime<Utc>) -> Option<Self> {
        if healthy {
            self.last_seen = now;
            self.is_healthy = true;
            return Some(self);
        }
        self.is_healthy = false;
        (now - self.last_seen < chrono::Duration::hours(UNHEALTHY_GRACE_HOURS)).then_some(self)
    }
}

#[derive(Debug)]
pub struct PeerDiscovery {
    path: PathBuf,
    seed_nodes: Vec<SeedNode>,
}

impl PeerDiscovery {
    /// Load the seed list at `path`, creating an empty file when absent.
    pub fn load(path: &Path) -> Result<Self, ChainError> {
        let discovery = if path.exists() {
            PeerDiscovery {
                path: path.to_path_buf(),
                seed_nodes: serde_json::from_str(&fs::read_to_string(path)?)?,
            }
        } else {
            let discovery = PeerDiscovery {
                path: path.to_path_buf(),
                seed_nodes: Vec::new(),
            };
            discovery.save()?;
            discovery
        };
        debug!(path = %path.display(), nodes = discovery.seed_nodes.len(), "loaded seed nodes");
        Ok(discovery)
    }

    pub fn save(&self) -> Result<(), ChainError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.seed_nodes)?)?;
        Ok(())
    }

    pub fn seed_nodes(&self) -> &[SeedNode] {
        &self.seed_nodes
    }

    /// Add `address` unless already known. Returns whether it was added.
    pub fn add_seed_node(&mut self, address: &str) -> Result<bool, ChainError> {
        if self.seed_nodes.iter().any(|node| node.address == address) {
            return Ok(false);
        }
        self.seed_nodes.push(SeedNode::new(address));
        self.save()?;
        Ok(true)
    }

    pub fn healthy_nodes(&self) -> Vec<String> {
        self.seed_nodes
            .iter()
            .filter(|node| node.is_healthy)
            .map(|node| node.address.clone())
            .collect()
    }

    /// One TCP dial with a short timeout; no retries.
    pub async fn check_node_health(address: &str) -> bool {
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, TcpStream::connect(address)).await,
            Ok(Ok(_))
        )
    }

    /// Re-check every known node and persist the result.
    pub async fn update_known_nodes(&mut self) -> Result<(), ChainError> {
        let mut updated = Vec::with_capacity(self.seed_nodes.len());
        for node in std::mem::take(&mut self.seed_nodes) {
            let healthy = Self::check_node_health(&node.address).await;
            if let Some(node) = node.observe(healthy, Utc::now()) {
                updated.push(node);
            }
        }
        self.seed_nodes = updated;
        info!(
            known = self.seed_nodes.len(),
            healthy = self.healthy_nodes().len(),
            "refreshed seed nodes"
        );
        self.save()
    }

    pub fn random_healthy_node(&self) -> String {
        self.healthy_nodes()
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| FALLBACK_NODE.to_string())
    }
}
