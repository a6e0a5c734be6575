//! Replication Engine
//!
//! Drives the anti-entropy exchange: periodic gossip rounds pick peers and
//! send them digests, inbound digests are answered with the deltas the sender
//! is missing, and inbound deltas are folded into the directory. Liveness is
//! re-evaluated once per round with the phi accrual detector.
//!
//! The round timer and the inbound handlers run concurrently and share the
//! directory, so every read-modify-write of a peer record happens under that
//! peer's entry in a per-peer-id lock registry. The local node's record is
//! held by the engine itself and never enters the directory.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, mpsc, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::GossipConfig;
use crate::directory::PeerDirectory;
use crate::error::{Error, Result};
use crate::gossip::event::GossipEvent;
use crate::peer::{Delta, PeerRecord, PeerRef, PeerSummary};
use crate::transport::{Transport, TransportEvent};
use crate::value::Value;

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-peer-id mutexes serializing record read-modify-write cycles
#[derive(Default)]
struct PeerLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PeerLocks {
    async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut inner = self.inner.lock().await;
            inner
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }
}

struct EngineInner {
    config: GossipConfig,
    /// This node's own id, stable for the engine's lifetime
    local_id: String,
    /// This node's own record, authoritative for its data
    local: Mutex<PeerRecord>,
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<GossipEvent>,
    locks: PeerLocks,
    /// Pending timer for the next round; replaced on every reschedule
    round_timer: Mutex<Option<JoinHandle<()>>>,
}

/// Gossip replication endpoint.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct ReplicationEngine {
    inner: Arc<EngineInner>,
}

impl ReplicationEngine {
    /// Create an engine for a local peer with the given id and address
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        config: GossipConfig,
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let record = PeerRecord::new(id.into(), address.into());
        Self::with_local_record(record, config, directory, transport)
    }

    /// Create an engine from a pre-built local record, e.g. restored state
    pub fn with_local_record(
        mut record: PeerRecord,
        config: GossipConfig,
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if record.id.is_empty() {
            return Err(Error::Config("local peer id cannot be empty".into()));
        }
        record.max_intervals = config.max_intervals_history;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                local_id: record.id.clone(),
                local: Mutex::new(record),
                directory,
                transport,
                events,
                locks: PeerLocks::default(),
                round_timer: Mutex::new(None),
            }),
        })
    }

    /// This node's peer id
    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<GossipEvent> {
        self.inner.events.subscribe()
    }

    /// The digest summary for this node
    pub async fn local_summary(&self) -> PeerSummary {
        self.inner.local.lock().await.summary()
    }

    /// Apply a local write.
    ///
    /// Returns whether anything changed; the version bump propagates to the
    /// cluster through subsequent digest exchanges.
    pub async fn update(&self, key: &str, value: Value) -> bool {
        let mut local = self.inner.local.lock().await;
        let changed = local.update_local(key, value);
        if changed {
            tracing::debug!("Local update of '{}' at version {}", key, local.max_version_seen);
        }
        changed
    }

    /// Build a digest from the given live peers, with this node appended last
    pub async fn digest(&self, live_peers: &[PeerRecord]) -> Vec<PeerSummary> {
        let mut result: Vec<PeerSummary> = live_peers.iter().map(|p| p.summary()).collect();
        result.push(self.inner.local.lock().await.summary());
        result
    }

    /// Start gossiping: runs a round now and keeps rescheduling
    pub async fn start(&self) {
        tracing::info!(
            "Starting gossip for '{}', round interval {:?}",
            self.inner.local_id,
            self.inner.config.gossip_interval()
        );
        self.gossip().await;
    }

    /// Cancel the pending gossip round, if any
    pub async fn stop(&self) {
        let mut slot = self.inner.round_timer.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Spawn a task pumping inbound transport events into the engine
    pub fn run_inbound(&self, mut events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Digest { from, digest } => {
                        engine.handle_digest(from, digest).await;
                    }
                    TransportEvent::Deltas { from, deltas } => {
                        engine.handle_deltas(from, deltas).await;
                    }
                    TransportEvent::Error(detail) => {
                        tracing::warn!("Transport fault: {}", detail);
                        engine.emit(GossipEvent::Error { detail });
                    }
                }
            }
        })
    }

    /// Run one gossip round and arm the next.
    ///
    /// Safe to call at any time; the pending round timer is replaced, never
    /// duplicated.
    pub async fn gossip(&self) {
        let live = match self.inner.directory.live_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                self.emit_storage_error(e);
                Vec::new()
            }
        };
        let dead = match self.inner.directory.dead_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                self.emit_storage_error(e);
                Vec::new()
            }
        };

        let digest = self.digest(&live).await;
        let sender = self.local_summary().await;

        // Gossip with a random live peer
        if !live.is_empty() {
            let target = live[pick(live.len())].peer_ref();
            self.send_digest_to(&target, sender.clone(), digest.clone()).await;
        }

        // Maybe probe a dead peer; certain when no live peer is visible
        let mut probability = dead.len() as f64 / (live.len() as f64 + 1.0);
        if live.is_empty() {
            probability = 1.0;
        }
        if !dead.is_empty() && roll() < probability {
            let target = dead[pick(dead.len())].peer_ref();
            self.send_digest_to(&target, sender.clone(), digest.clone()).await;
        }

        // Fall back to a seed when live peers run low
        if live.len() < self.inner.config.minimum_live_peers && !self.inner.config.seeds.is_empty()
        {
            let seed = &self.inner.config.seeds[pick(self.inner.config.seeds.len())];
            let target = PeerRef {
                id: seed.id.clone(),
                address: seed.address.clone(),
            };
            self.send_digest_to(&target, sender, digest).await;
        }

        // Re-evaluate liveness for every known peer, once per round
        let now = now_ms();
        for peer in &live {
            self.check_live_peer(&peer.id, now).await;
        }
        for peer in &dead {
            self.check_dead_peer(&peer.id, now).await;
        }

        // Arm the next round, cancelling any pending timer. Last call wins,
        // so concurrent invocations leave exactly one timer pending.
        let next = tokio::spawn(next_round(self.clone(), self.inner.config.gossip_interval()));
        let mut slot = self.inner.round_timer.lock().await;
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = Some(next);
    }

    /// Handle a digest received from `from`.
    ///
    /// Answers with the deltas the sender is missing, most out-of-sync peer
    /// first, oldest versions first, capped globally at
    /// `max_deltas_per_gossip`.
    pub async fn handle_digest(&self, from: PeerRef, digest: Vec<PeerSummary>) {
        tracing::debug!("Digest with {} entries from '{}'", digest.len(), from.id);
        self.emit(GossipEvent::DigestReceive {
            from: from.id.clone(),
            entries: digest.len(),
        });

        let now = now_ms();
        self.record_contact(&from, now).await;

        // Collect the peers the sender is behind on
        let mut candidates: Vec<Vec<Delta>> = Vec::new();
        for entry in &digest {
            if entry.id == self.inner.local_id {
                // Entries about ourselves are answered from the local record;
                // it is authoritative and never treated as a remote peer
                let local = self.inner.local.lock().await;
                if local.max_version_seen > entry.max_version_seen {
                    candidates.push(local.deltas_after_version(entry.max_version_seen));
                }
                continue;
            }

            let _guard = self.inner.locks.acquire(&entry.id).await;
            let record = match self.inner.directory.get(&entry.id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    let record = PeerRecord::from_summary(entry)
                        .with_max_intervals(self.inner.config.max_intervals_history);
                    if let Err(e) = self.inner.directory.put(record.clone()).await {
                        self.emit_storage_error(e);
                        continue;
                    }
                    tracing::debug!("Discovered peer '{}' via digest", entry.id);
                    self.emit(GossipEvent::NewPeer {
                        id: entry.id.clone(),
                    });
                    record
                }
                Err(e) => {
                    self.emit_storage_error(e);
                    continue;
                }
            };

            if record.max_version_seen > entry.max_version_seen {
                candidates.push(record.deltas_after_version(entry.max_version_seen));
            }
        }

        // The most out-of-sync peer contributes first
        candidates.sort_by(|a, b| b.len().cmp(&a.len()));

        let cap = self.inner.config.max_deltas_per_gossip;
        let mut deltas_to_send: Vec<Delta> = Vec::new();
        'candidates: for mut deltas in candidates {
            if deltas_to_send.len() >= cap {
                break;
            }

            // Oldest changes first, so a truncated reply never skips
            // intermediate versions
            deltas.sort_by_key(|d| d.version);
            for delta in deltas {
                if deltas_to_send.len() >= cap {
                    break 'candidates;
                }
                deltas_to_send.push(delta);
            }
        }

        self.emit(GossipEvent::DeltasSend {
            to: from.id.clone(),
            count: deltas_to_send.len(),
        });
        let sender = self.local_summary().await;
        if let Err(e) = self
            .inner
            .transport
            .send_deltas(&from, sender, deltas_to_send)
            .await
        {
            tracing::warn!("Delta send to '{}' failed: {}", from.id, e);
            self.emit(GossipEvent::Error {
                detail: e.to_string(),
            });
        }
    }

    /// Handle a delta batch received from `from`.
    ///
    /// Deltas only apply to peers already in the directory; unlike digests
    /// they never introduce new peers.
    pub async fn handle_deltas(&self, from: PeerRef, deltas: Vec<Delta>) {
        tracing::debug!("{} deltas from '{}'", deltas.len(), from.id);
        self.emit(GossipEvent::DeltasReceive {
            from: from.id.clone(),
            count: deltas.len(),
        });

        let now = now_ms();
        self.record_contact(&from, now).await;

        for delta in deltas {
            let _guard = self.inner.locks.acquire(&delta.peer_id).await;
            let mut record = match self.inner.directory.get(&delta.peer_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::warn!("Delta for unknown peer '{}' dropped", delta.peer_id);
                    self.emit(GossipEvent::UnknownPeer {
                        id: delta.peer_id.clone(),
                    });
                    continue;
                }
                Err(e) => {
                    self.emit_storage_error(e);
                    continue;
                }
            };

            // Stale and duplicate deltas are rejected silently
            if record.update_with_delta(&delta.key, delta.value.clone(), delta.version) {
                if let Err(e) = self.inner.directory.put(record).await {
                    self.emit_storage_error(e);
                    continue;
                }
                self.emit(GossipEvent::Update {
                    peer_id: delta.peer_id,
                    key: delta.key,
                    value: delta.value,
                });
            }
        }
    }

    /// Mark contact with the sender of an inbound message, creating its
    /// record on first sight
    async fn record_contact(&self, from: &PeerRef, now: i64) {
        let _guard = self.inner.locks.acquire(&from.id).await;

        let (mut record, created) = match self.inner.directory.get(&from.id).await {
            Ok(Some(record)) => (record, false),
            Ok(None) => {
                let record = PeerRecord::new(from.id.clone(), from.address.clone())
                    .with_max_intervals(self.inner.config.max_intervals_history);
                (record, true)
            }
            Err(e) => {
                self.emit_storage_error(e);
                return;
            }
        };

        record.mark_contact(now);
        if let Err(e) = self.inner.directory.put(record).await {
            self.emit_storage_error(e);
            return;
        }

        if created {
            tracing::debug!("First contact from peer '{}'", from.id);
            self.emit(GossipEvent::NewPeer {
                id: from.id.clone(),
            });
        }
    }

    /// Send a digest, surfacing failures as events rather than errors
    async fn send_digest_to(&self, target: &PeerRef, sender: PeerSummary, digest: Vec<PeerSummary>) {
        tracing::trace!("Sending digest with {} entries to '{}'", digest.len(), target.id);
        self.emit(GossipEvent::DigestSend {
            to: target.id.clone(),
            entries: digest.len(),
        });

        if let Err(e) = self.inner.transport.send_digest(target, sender, digest).await {
            tracing::warn!("Digest send to '{}' failed: {}", target.id, e);
            self.emit(GossipEvent::Error {
                detail: e.to_string(),
            });
        }
    }

    /// Transition a live peer to dead if its phi crossed the threshold
    async fn check_live_peer(&self, id: &str, now: i64) {
        let _guard = self.inner.locks.acquire(id).await;

        let mut record = match self.inner.directory.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                self.emit_storage_error(e);
                return;
            }
        };
        if !record.live {
            // Already transitioned since the round fetched its peer list
            return;
        }

        let phi = record.phi(now);
        if phi > self.inner.config.dead_peer_phi || !phi.is_finite() {
            record.mark_dead();
            tracing::info!("Peer '{}' marked dead (phi {:.2})", id, phi);
            if let Err(e) = self.inner.directory.put(record).await {
                self.emit_storage_error(e);
                return;
            }
            self.emit(GossipEvent::PeerDead { id: id.to_string() });
        }
    }

    /// Transition a dead peer back to live if its phi recovered
    async fn check_dead_peer(&self, id: &str, now: i64) {
        let _guard = self.inner.locks.acquire(id).await;

        let mut record = match self.inner.directory.get(id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                self.emit_storage_error(e);
                return;
            }
        };
        if record.live {
            return;
        }

        let phi = record.phi(now);
        if phi < self.inner.config.dead_peer_phi {
            record.mark_live();
            tracing::info!("Peer '{}' revived (phi {:.2})", id, phi);
            if let Err(e) = self.inner.directory.put(record).await {
                self.emit_storage_error(e);
                return;
            }
            self.emit(GossipEvent::PeerLive { id: id.to_string() });
        }
    }

    fn emit(&self, event: GossipEvent) {
        let _ = self.inner.events.send(event);
    }

    fn emit_storage_error(&self, e: Error) {
        tracing::warn!("Storage fault: {}", e);
        self.emit(GossipEvent::Error {
            detail: e.to_string(),
        });
    }
}

/// Timer task driving the next gossip round. Boxed so a round can schedule
/// its successor.
fn next_round(
    engine: ReplicationEngine,
    delay: Duration,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        engine.gossip().await;
    })
}

/// Current wall-clock time in milliseconds since the epoch
fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Uniform random index into a candidate set of the given size
fn pick(len: usize) -> usize {
    rand::thread_rng().gen_range(0..len)
}

/// Uniform random draw from [0, 1)
fn roll() -> f64 {
    rand::thread_rng().gen()
}
