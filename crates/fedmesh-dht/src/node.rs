//! Node records stored in the routing table

use fedmesh_crypto::{CryptoError, NodeId, NodeIdentity};
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::sign::ed25519;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::DhtConfig;
use crate::error::{DhtError, Result};

/// Get current timestamp in unix seconds
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Contact information for a remote node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtNode {
    /// Node identifier (SHA-256 of the node's public key)
    pub node_id: NodeId,

    /// Reachable endpoint, e.g. "https://mesh.example.org:8484"
    pub endpoint: String,

    /// Ed25519 public key, hex encoded
    pub public_key: String,

    /// Short federation tag derived from the node id
    pub server_id: String,

    /// Unix seconds of the last successful contact
    pub last_seen: u64,

    /// Consecutive failed pings since the last success
    pub failed_pings: u32,
}

impl DhtNode {
    /// Create a contact record seen just now
    pub fn new(node_id: NodeId, endpoint: String, public_key: &ed25519::PublicKey) -> Self {
        DhtNode {
            node_id,
            endpoint,
            public_key: hex::encode(public_key.as_ref()),
            server_id: node_id.server_id(),
            last_seen: now(),
            failed_pings: 0,
        }
    }

    /// Decode the stored public key
    pub fn public_key(&self) -> Result<ed25519::PublicKey> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| DhtError::Serialization(e.to_string()))?;
        ed25519::PublicKey::from_slice(&bytes)
            .ok_or_else(|| DhtError::Crypto(CryptoError::InvalidKeyFormat))
    }

    /// Record a successful contact
    pub fn touch(&mut self) {
        self.last_seen = now();
        self.failed_pings = 0;
    }

    /// Record a failed contact attempt
    pub fn record_failure(&mut self) {
        self.failed_pings += 1;
    }

    /// Whether this node has gone quiet for longer than `max_age_secs`
    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        now().saturating_sub(self.last_seen) > max_age_secs
    }
}

/// The announce payload a node publishes about itself
///
/// Capabilities are whatever the operator configured; nothing is
/// introspected from the running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeManifest {
    pub node_id: NodeId,
    pub endpoint: String,
    pub public_key: String,
    pub server_id: String,
    pub capabilities: Vec<String>,
}

impl NodeManifest {
    /// Build the local node's manifest from its identity and configuration
    pub fn local(identity: &NodeIdentity, endpoint: String, config: &DhtConfig) -> Self {
        NodeManifest {
            node_id: identity.node_id,
            endpoint,
            public_key: hex::encode(identity.public_key.as_ref()),
            server_id: identity.server_id(),
            capabilities: config.capabilities.clone(),
        }
    }

    /// Convert a received manifest into a routing table contact
    pub fn to_node(&self) -> Result<DhtNode> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| DhtError::Serialization(e.to_string()))?;
        let public_key = ed25519::PublicKey::from_slice(&bytes)
            .ok_or_else(|| DhtError::Crypto(CryptoError::InvalidKeyFormat))?;

        // Reject manifests whose id does not commit to the key
        let derived = NodeIdentity::derive_node_id(&public_key);
        if derived != self.node_id {
            return Err(DhtError::Protocol(format!(
                "manifest id {} does not match its public key",
                self.node_id
            )));
        }

        Ok(DhtNode::new(self.node_id, self.endpoint.clone(), &public_key))
    }
}
