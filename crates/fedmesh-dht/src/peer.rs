//! Peer trust registry
//!
//! A [`Peer`] is the trust-augmented view of a node: where the routing
//! table tracks reachability, the registry tracks whether we have
//! cryptographically verified the node and how healthy the relationship
//! has been. Records live in an injected [`PeerRepository`].

use async_trait::async_trait;
use fedmesh_crypto::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::node::now;

/// How far a peer has progressed through the trust ladder
///
/// `Verified` is only ever granted after a successful challenge-response
/// handshake, and `Blocked` only by an explicit operator decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Never interacted with
    Unknown,
    /// Observed in discovery, identity not yet proven
    Seen,
    /// Passed mutual challenge-response verification
    Verified,
    /// Operator marked as trusted
    Trusted,
    /// Operator blocked; never contacted again
    Blocked,
}

/// Trust and health state for one remote server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: NodeId,

    /// Ed25519 public key, hex encoded; pinned at first contact
    pub public_key: String,

    pub endpoint: String,

    pub trust: TrustLevel,

    /// Rolling health score in [0, 1]
    pub health_score: f64,

    /// Consecutive failed health checks
    pub failed_checks: u32,

    pub first_seen: u64,

    pub last_seen: u64,

    /// Operator note recorded when the peer was blocked
    pub block_reason: Option<String>,
}

impl Peer {
    /// Create a record for a peer observed during discovery
    pub fn seen(node_id: NodeId, public_key: String, endpoint: String) -> Self {
        let timestamp = now();
        Peer {
            node_id,
            public_key,
            endpoint,
            trust: TrustLevel::Seen,
            health_score: 0.5,
            failed_checks: 0,
            first_seen: timestamp,
            last_seen: timestamp,
            block_reason: None,
        }
    }

    /// Record a successful interaction
    pub fn record_success(&mut self, gain: f64) {
        self.health_score = (self.health_score + gain).min(1.0);
        self.failed_checks = 0;
        self.last_seen = now();
    }

    /// Record a failed interaction
    ///
    /// The peer is flagged, never removed: operators decide about removal.
    pub fn record_failure(&mut self, penalty: f64) {
        self.health_score = (self.health_score - penalty).max(0.0);
        self.failed_checks += 1;
    }

    pub fn is_blocked(&self) -> bool {
        self.trust == TrustLevel::Blocked
    }

    /// Whether the peer may carry secure messages
    pub fn is_verified(&self) -> bool {
        matches!(self.trust, TrustLevel::Verified | TrustLevel::Trusted)
    }

    /// Promote to verified after a successful handshake
    ///
    /// Trusted and blocked peers keep their level: verification never
    /// downgrades an operator decision.
    pub fn mark_verified(&mut self) {
        if matches!(self.trust, TrustLevel::Unknown | TrustLevel::Seen) {
            self.trust = TrustLevel::Verified;
        }
        self.last_seen = now();
    }

    /// Block this peer with an operator-supplied reason
    pub fn block(&mut self, reason: String) {
        self.trust = TrustLevel::Blocked;
        self.block_reason = Some(reason);
    }
}

/// Storage collaborator for peer trust records
#[async_trait]
pub trait PeerRepository: Send + Sync {
    async fn get(&self, node_id: &NodeId) -> Result<Option<Peer>>;

    async fn upsert(&self, peer: Peer) -> Result<()>;

    async fn all(&self) -> Result<Vec<Peer>>;

    async fn remove(&self, node_id: &NodeId) -> Result<()>;
}

/// In-memory peer store used by tests and single-process deployments
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: RwLock<HashMap<NodeId, Peer>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PeerRepository for MemoryPeerStore {
    async fn get(&self, node_id: &NodeId) -> Result<Option<Peer>> {
        Ok(self.peers.read().await.get(node_id).cloned())
    }

    async fn upsert(&self, peer: Peer) -> Result<()> {
        self.peers.write().await.insert(peer.node_id, peer);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Peer>> {
        Ok(self.peers.read().await.values().cloned().collect())
    }

    async fn remove(&self, node_id: &NodeId) -> Result<()> {
        self.peers.write().await.remove(node_id);
        Ok(())
    }
}
