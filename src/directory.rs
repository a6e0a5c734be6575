//! Peer Directory
//!
//! Storage seam for peer records. The engine reads and writes records through
//! the [`PeerDirectory`] trait so the backing store stays pluggable; the
//! bundled [`MemoryDirectory`] keeps everything in process memory.
//!
//! The local node's own record is never stored here. Dead peers are kept as
//! records with `live = false` so they can be revived later.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::peer::PeerRecord;

/// Pluggable store of peer records, keyed by peer id
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Fetch the record for a peer, if known
    async fn get(&self, id: &str) -> Result<Option<PeerRecord>>;

    /// Store a record under its peer id, replacing any previous one
    async fn put(&self, record: PeerRecord) -> Result<()>;

    /// All records currently marked live
    async fn live_peers(&self) -> Result<Vec<PeerRecord>>;

    /// All records currently marked dead
    async fn dead_peers(&self) -> Result<Vec<PeerRecord>>;
}

/// In-memory peer directory
#[derive(Default)]
pub struct MemoryDirectory {
    peers: RwLock<HashMap<String, PeerRecord>>,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known peers
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Whether the directory holds no peers
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }
}

#[async_trait]
impl PeerDirectory for MemoryDirectory {
    async fn get(&self, id: &str) -> Result<Option<PeerRecord>> {
        let peers = self.peers.read().await;
        Ok(peers.get(id).cloned())
    }

    async fn put(&self, record: PeerRecord) -> Result<()> {
        let mut peers = self.peers.write().await;
        peers.insert(record.id.clone(), record);
        Ok(())
    }

    async fn live_peers(&self) -> Result<Vec<PeerRecord>> {
        let peers = self.peers.read().await;
        Ok(peers.values().filter(|p| p.live).cloned().collect())
    }

    async fn dead_peers(&self) -> Result<Vec<PeerRecord>> {
        let peers = self.peers.read().await;
        Ok(peers.values().filter(|p| !p.live).cloned().collect())
    }
}
