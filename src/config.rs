//! Scuttle Configuration
//!
//! Configuration structures for the gossip replication endpoint.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A seed peer contacted when live peers run low
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedPeer {
    /// Unique peer identifier
    pub id: String,

    /// Opaque transport address for reaching the seed
    pub address: String,
}

/// Gossip engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Phi accrual threshold beyond which a peer is assumed dead
    #[serde(default = "default_dead_peer_phi")]
    pub dead_peer_phi: f64,

    /// Milliseconds between gossip rounds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// Maximum number of deltas sent in one gossip exchange
    #[serde(default = "default_max_deltas_per_gossip")]
    pub max_deltas_per_gossip: usize,

    /// Gossip with a seed when fewer live peers than this are visible
    #[serde(default = "default_minimum_live_peers")]
    pub minimum_live_peers: usize,

    /// Maximum number of contact intervals kept per peer
    #[serde(default = "default_max_intervals_history")]
    pub max_intervals_history: usize,

    /// Seed peers used for bootstrapping
    #[serde(default)]
    pub seeds: Vec<SeedPeer>,
}

// Default value functions
fn default_dead_peer_phi() -> f64 {
    8.0
}

fn default_gossip_interval_ms() -> u64 {
    1000
}

fn default_max_deltas_per_gossip() -> usize {
    5
}

fn default_minimum_live_peers() -> usize {
    1
}

fn default_max_intervals_history() -> usize {
    100
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            dead_peer_phi: default_dead_peer_phi(),
            gossip_interval_ms: default_gossip_interval_ms(),
            max_deltas_per_gossip: default_max_deltas_per_gossip(),
            minimum_live_peers: default_minimum_live_peers(),
            max_intervals_history: default_max_intervals_history(),
            seeds: Vec::new(),
        }
    }
}

impl GossipConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GossipConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if !self.dead_peer_phi.is_finite() || self.dead_peer_phi <= 0.0 {
            return Err(crate::Error::Config(
                "dead_peer_phi must be a positive finite number".into(),
            ));
        }

        if self.gossip_interval_ms == 0 {
            return Err(crate::Error::Config("gossip_interval_ms cannot be zero".into()));
        }

        if self.max_deltas_per_gossip == 0 {
            return Err(crate::Error::Config("max_deltas_per_gossip cannot be zero".into()));
        }

        if self.max_intervals_history == 0 {
            return Err(crate::Error::Config("max_intervals_history cannot be zero".into()));
        }

        for seed in &self.seeds {
            if seed.id.is_empty() {
                return Err(crate::Error::Config("seed id cannot be empty".into()));
            }
            if seed.address.is_empty() {
                return Err(crate::Error::Config("seed address cannot be empty".into()));
            }
        }

        Ok(())
    }

    /// Get the gossip interval as Duration
    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.gossip_interval_ms)
    }
}
