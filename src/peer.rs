//! Peer Records
//!
//! Per-peer replication state: identity, versioned key/value data, liveness,
//! and the contact statistics feeding the phi accrual failure detector.
//! Version numbers are per-peer scalar clocks assigned by the owning peer;
//! `max_version_seen` is the highest version this node has assigned (for the
//! local record) or observed (for remote records).

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Interval assumed for a peer's very first contact, in milliseconds
pub const DEFAULT_CONTACT_INTERVAL_MS: i64 = 750;

/// Default bound on the contact interval history
pub const DEFAULT_MAX_INTERVALS: usize = 100;

/// Reference to a peer as seen by the transport layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerRef {
    /// Unique peer identifier
    pub id: String,
    /// Opaque transport address
    pub address: String,
}

/// Compact per-peer summary carried in digests
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSummary {
    /// Unique peer identifier
    pub id: String,
    /// Highest version this node has seen for the peer
    pub max_version_seen: u64,
    /// Opaque transport address
    pub address: String,
}

/// A single replicated update record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Delta {
    /// Peer whose data this delta belongs to
    pub peer_id: String,
    /// Key being updated
    pub key: String,
    /// New value
    pub value: Value,
    /// Version the owning peer assigned to this update
    pub version: u64,
}

/// A value together with the version it was stored at
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
}

/// Replication state for a single peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Unique peer identifier, stable for the peer's lifetime
    pub id: String,

    /// Opaque transport address, carried but never interpreted
    pub address: String,

    /// Versioned key/value data
    pub data: HashMap<String, VersionedValue>,

    /// Highest version assigned or observed for this peer's data
    pub max_version_seen: u64,

    /// Most recent inter-contact gaps in milliseconds, oldest first
    pub contact_intervals: VecDeque<i64>,

    /// Memoized sum of `contact_intervals`
    pub interval_sum: i64,

    /// Memoized mean of `contact_intervals`
    pub intervals_mean: f64,

    /// Timestamp of the last observed contact, ms since epoch
    pub last_contact_ms: Option<i64>,

    /// Liveness flag
    pub live: bool,

    /// Bound on the contact interval history
    pub max_intervals: usize,
}

impl PeerRecord {
    /// Create a new record for a peer at the given transport address.
    ///
    /// The interval history is seeded with one default interval so the
    /// failure detector has a usable mean before any contact is observed.
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            data: HashMap::new(),
            max_version_seen: 0,
            contact_intervals: VecDeque::from([DEFAULT_CONTACT_INTERVAL_MS]),
            interval_sum: DEFAULT_CONTACT_INTERVAL_MS,
            intervals_mean: DEFAULT_CONTACT_INTERVAL_MS as f64,
            last_contact_ms: None,
            live: true,
            max_intervals: DEFAULT_MAX_INTERVALS,
        }
    }

    /// Set the bound on the contact interval history
    pub fn with_max_intervals(mut self, max_intervals: usize) -> Self {
        self.max_intervals = max_intervals;
        self
    }

    /// Create a record for a peer first learned from a digest entry.
    ///
    /// The advertised version is adopted as our high-water mark: we hold no
    /// data for the peer yet, and only updates newer than what the cluster
    /// already reported will be accepted.
    pub fn from_summary(summary: &PeerSummary) -> Self {
        let mut record = Self::new(summary.id.clone(), summary.address.clone());
        record.max_version_seen = summary.max_version_seen;
        record
    }

    /// Build the digest summary for this record
    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            max_version_seen: self.max_version_seen,
            address: self.address.clone(),
        }
    }

    /// Transport reference for this record
    pub fn peer_ref(&self) -> PeerRef {
        PeerRef {
            id: self.id.clone(),
            address: self.address.clone(),
        }
    }

    /// Record a contact with this peer at `now_ms`.
    ///
    /// Appends the observed inter-contact gap to the history (evicting the
    /// oldest entry past the bound) and maintains the sum and mean in O(1).
    pub fn mark_contact(&mut self, now_ms: i64) {
        let interval = match self.last_contact_ms {
            Some(last) => now_ms - last,
            None => DEFAULT_CONTACT_INTERVAL_MS,
        };
        self.last_contact_ms = Some(now_ms);

        self.contact_intervals.push_back(interval);
        let evicted = if self.contact_intervals.len() > self.max_intervals {
            self.contact_intervals.pop_front()
        } else {
            None
        };

        self.interval_sum += interval - evicted.unwrap_or(0);
        self.intervals_mean = self.interval_sum as f64 / self.contact_intervals.len() as f64;
    }

    /// Mark this peer dead. Callers persist the change.
    pub fn mark_dead(&mut self) {
        self.live = false;
    }

    /// Mark this peer live. Callers persist the change.
    pub fn mark_live(&mut self) {
        self.live = true;
    }

    /// Phi accrual suspicion level at `now_ms`.
    ///
    /// Models inter-contact gaps as exponentially distributed with the
    /// observed mean and returns the negated log10 of the probability that a
    /// healthy peer would stay silent this long. A non-finite result (mean of
    /// zero) must be treated by callers as certainty of death.
    pub fn phi(&mut self, now_ms: i64) -> f64 {
        let last = match self.last_contact_ms {
            Some(last) => last,
            None => {
                let seeded = now_ms - DEFAULT_CONTACT_INTERVAL_MS;
                self.last_contact_ms = Some(seeded);
                seeded
            }
        };

        let current_interval = (now_ms - last) as f64;
        let p = (-current_interval / self.intervals_mean).exp();
        -p.log10()
    }

    /// Apply a local write.
    ///
    /// Bumps the version and stores the value only if it differs structurally
    /// from what is already stored under `key`. Returns whether anything
    /// changed, so re-applying an identical value never inflates the version.
    pub fn update_local(&mut self, key: &str, value: Value) -> bool {
        if let Some(stored) = self.data.get(key) {
            if stored.value == value {
                return false;
            }
        }

        self.max_version_seen += 1;
        self.data.insert(
            key.to_string(),
            VersionedValue {
                value,
                version: self.max_version_seen,
            },
        );
        true
    }

    /// Apply a delta received from the cluster.
    ///
    /// A delta is accepted iff its version exceeds everything seen for this
    /// peer so far. The comparison is against the record-wide high-water
    /// mark, not the prior version of the individual key: the owning peer's
    /// counter establishes a strict total order over its updates.
    pub fn update_with_delta(&mut self, key: &str, value: Value, version: u64) -> bool {
        if version <= self.max_version_seen {
            return false;
        }

        self.max_version_seen = version;
        self.data
            .insert(key.to_string(), VersionedValue { value, version });
        true
    }

    /// Deltas for every key stored at a version above `version`.
    ///
    /// Order is unspecified; the engine sorts before sending.
    pub fn deltas_after_version(&self, version: u64) -> Vec<Delta> {
        self.data
            .iter()
            .filter(|(_, stored)| stored.version > version)
            .map(|(key, stored)| Delta {
                peer_id: self.id.clone(),
                key: key.clone(),
                value: stored.value.clone(),
                version: stored.version,
            })
            .collect()
    }
}
