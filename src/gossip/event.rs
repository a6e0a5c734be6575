//! Gossip Events
//!
//! Typed notifications emitted by the engine over a broadcast channel.
//! Consumers subscribe via [`ReplicationEngine::subscribe`]; events sent with
//! no subscribers are dropped.
//!
//! [`ReplicationEngine::subscribe`]: crate::gossip::ReplicationEngine::subscribe

use crate::value::Value;

/// Observable engine events
#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    /// A previously unknown peer entered the directory
    NewPeer { id: String },

    /// A live peer's phi crossed the death threshold
    PeerDead { id: String },

    /// A dead peer's phi dropped back below the threshold
    PeerLive { id: String },

    /// A delta referenced a peer the directory does not know
    UnknownPeer { id: String },

    /// A delta was accepted and stored
    Update {
        peer_id: String,
        key: String,
        value: Value,
    },

    /// A digest was sent to a peer
    DigestSend { to: String, entries: usize },

    /// A digest arrived from a peer
    DigestReceive { from: String, entries: usize },

    /// A delta batch was sent to a peer
    DeltasSend { to: String, count: usize },

    /// A delta batch arrived from a peer
    DeltasReceive { from: String, count: usize },

    /// A transport or storage fault, non-fatal to the engine
    Error { detail: String },
}
