//! Scuttle - Gossip-Based Anti-Entropy Replication
//!
//! A gossip protocol endpoint for eventually-consistent peer-to-peer state
//! replication. Each node holds a local key/value store plus its knowledge of
//! every other peer's store, and periodically exchanges compact digests and
//! deltas with randomly chosen peers, so updates spread through the cluster
//! without a central coordinator.
//!
//! # Architecture
//!
//! A timer drives gossip rounds: each round builds a digest of everything
//! this node knows, sends it to a random live peer (and sometimes a dead
//! peer or a seed), and re-evaluates peer liveness with a phi accrual
//! failure detector. Receiving a digest answers with the deltas the sender
//! is missing; receiving deltas folds them into the peer directory.
//!
//! Storage and wire transport stay pluggable behind the [`PeerDirectory`]
//! and [`Transport`] traits; in-memory and TCP implementations are bundled.
//!
//! # Features
//!
//! - Bounded-bandwidth delta reconciliation with per-peer scalar clocks
//! - Phi accrual failure detection with per-round dead/revive transitions
//! - Dead-peer probing and seed fallback for partition recovery
//! - Typed replicated values with structural equality
//! - Observable engine events over a broadcast channel
//!
//! [`PeerDirectory`]: directory::PeerDirectory
//! [`Transport`]: transport::Transport

pub mod config;
pub mod directory;
pub mod error;
pub mod gossip;
pub mod peer;
pub mod transport;
pub mod value;

pub use config::GossipConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{GossipConfig, SeedPeer};
    pub use crate::directory::{MemoryDirectory, PeerDirectory};
    pub use crate::error::{Error, Result};
    pub use crate::gossip::{GossipEvent, ReplicationEngine};
    pub use crate::peer::{Delta, PeerRecord, PeerRef, PeerSummary};
    pub use crate::transport::{TcpTransport, Transport, TransportEvent};
    pub use crate::value::Value;
}
