//! Error types for DHT and federation operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Cryptography error: {0}")]
    Crypto(#[from] fedmesh_crypto::CryptoError),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Public key does not match the key on record for {0}")]
    PublicKeyMismatch(String),

    #[error("Unknown peer: {0}")]
    PeerNotFound(String),

    #[error("Peer is blocked: {0}")]
    PeerBlocked(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DhtError {
    fn from(e: serde_json::Error) -> Self {
        DhtError::Serialization(e.to_string())
    }
}
