//! FedMesh cryptography primitives
//!
//! This crate provides the identity and trust primitives for the FedMesh
//! federation layer:
//! - Node identity generation (Ed25519 key pairs, SHA-256 node IDs)
//! - Message signing and verification (Ed25519 detached signatures)
//! - Sealed peer-to-peer encryption (Ed25519 to X25519 conversion + box)
//! - Challenge-response authentication (signed nonce plus timestamp)

pub mod challenge;
pub mod error;
pub mod identity;
pub mod sealed;
pub mod signing;

pub use challenge::{generate_challenge, respond_to_challenge, verify_response, CHALLENGE_SIZE};
pub use error::{CryptoError, Result};
pub use identity::{IdentityRecord, NodeId, NodeIdentity, NODE_ID_SIZE};
pub use sealed::{decrypt_from, encrypt_for, SealedEnvelope, NONCE_SIZE};
pub use signing::{sign_message, verify_signature, Signature, SIGNATURE_SIZE};

/// Initialize the cryptography library
///
/// Must be called once before using any cryptographic functions.
pub fn init() -> Result<()> {
    sodiumoxide::init().map_err(|_| CryptoError::InitializationFailed)
}
