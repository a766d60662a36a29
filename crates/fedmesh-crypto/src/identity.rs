//! Node identity generation and management
//!
//! This module provides functionality for generating and managing node
//! identities using Ed25519 key pairs and SHA-256 for node ID derivation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sodiumoxide::crypto::sign::ed25519;
use std::fmt;

use crate::error::{CryptoError, Result};

/// Size of a node ID in bytes (32 bytes / 256 bits)
pub const NODE_ID_SIZE: usize = 32;

/// A unique identifier for a node in the FedMesh network
///
/// Derived as the SHA-256 hash of the node's Ed25519 public key, so the
/// identity space is uniform and a node cannot choose its own position.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    /// Create a NodeId from a byte array
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    /// Get the bytes of this NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// XOR distance to another node ID, interpreted as a 256-bit
    /// big-endian integer by callers that need ordering.
    pub fn distance(&self, other: &NodeId) -> [u8; NODE_ID_SIZE] {
        let mut dist = [0u8; NODE_ID_SIZE];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::SerializationError(e.to_string()))?;

        if bytes.len() != NODE_ID_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: NODE_ID_SIZE,
                actual: bytes.len(),
            });
        }

        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(NodeId(arr))
    }

    /// Short tag used to identify this node in logs and federation
    /// headers: the first 8 bytes of the ID in hex.
    pub fn server_id(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct NodeIdVisitor;

        impl<'de> serde::de::Visitor<'de> for NodeIdVisitor {
            type Value = NodeId;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(&format!(
                    "a byte array or hex string of length {}",
                    NODE_ID_SIZE
                ))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != NODE_ID_SIZE {
                    return Err(E::custom(format!(
                        "invalid NodeId length: expected {}, got {}",
                        NODE_ID_SIZE,
                        v.len()
                    )));
                }
                let mut bytes = [0u8; NODE_ID_SIZE];
                bytes.copy_from_slice(v);
                Ok(NodeId(bytes))
            }

            fn visit_str<E>(self, v: &str) -> std::result::Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                NodeId::from_hex(v).map_err(|e| E::custom(e.to_string()))
            }

            fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut bytes = [0u8; NODE_ID_SIZE];
                #[allow(clippy::needless_range_loop)]
                for i in 0..NODE_ID_SIZE {
                    bytes[i] = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(NodeId(bytes))
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_str(NodeIdVisitor)
        } else {
            deserializer.deserialize_bytes(NodeIdVisitor)
        }
    }
}

/// A node's identity including its key pair
#[derive(Clone)]
pub struct NodeIdentity {
    /// Ed25519 public key
    pub public_key: ed25519::PublicKey,
    /// Ed25519 secret key
    pub secret_key: ed25519::SecretKey,
    /// Derived node ID (SHA-256 hash of public key)
    pub node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a new random node identity
    pub fn generate() -> Result<Self> {
        let (public_key, secret_key) = ed25519::gen_keypair();
        let node_id = Self::derive_node_id(&public_key);

        Ok(NodeIdentity {
            public_key,
            secret_key,
            node_id,
        })
    }

    /// Derive a node ID from a public key using SHA-256
    pub fn derive_node_id(public_key: &ed25519::PublicKey) -> NodeId {
        let mut hasher = Sha256::new();
        hasher.update(public_key.as_ref());
        let hash = hasher.finalize();

        let mut node_id = [0u8; NODE_ID_SIZE];
        node_id.copy_from_slice(&hash[..NODE_ID_SIZE]);

        NodeId(node_id)
    }

    /// Create identity from existing keys
    pub fn from_keypair(public_key: ed25519::PublicKey, secret_key: ed25519::SecretKey) -> Self {
        let node_id = Self::derive_node_id(&public_key);
        NodeIdentity {
            public_key,
            secret_key,
            node_id,
        }
    }

    /// Import identity from raw key bytes
    pub fn from_bytes(public_bytes: &[u8], secret_bytes: &[u8]) -> Result<Self> {
        let public_key =
            ed25519::PublicKey::from_slice(public_bytes).ok_or(CryptoError::InvalidKeyFormat)?;
        let secret_key =
            ed25519::SecretKey::from_slice(secret_bytes).ok_or(CryptoError::InvalidKeyFormat)?;

        Ok(Self::from_keypair(public_key, secret_key))
    }

    /// Export the secret key as bytes (for secure storage)
    pub fn export_secret_key(&self) -> &[u8] {
        self.secret_key.as_ref()
    }

    /// Export the public key as bytes
    pub fn export_public_key(&self) -> &[u8] {
        self.public_key.as_ref()
    }

    /// Short hex tag identifying this node in logs
    pub fn server_id(&self) -> String {
        self.node_id.server_id()
    }

    /// Convert to a persistence record
    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord {
            public_key: hex::encode(self.public_key.as_ref()),
            secret_key: hex::encode(self.secret_key.as_ref()),
        }
    }

    /// Restore an identity from a persistence record
    pub fn from_record(record: &IdentityRecord) -> Result<Self> {
        let public_bytes = hex::decode(&record.public_key)
            .map_err(|e| CryptoError::SerializationError(e.to_string()))?;
        let secret_bytes = hex::decode(&record.secret_key)
            .map_err(|e| CryptoError::SerializationError(e.to_string()))?;

        Self::from_bytes(&public_bytes, &secret_bytes)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &hex::encode(self.public_key.as_ref()))
            .finish()
    }
}

/// Serializable form of a node identity for key storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub public_key: String,
    pub secret_key: String,
}
