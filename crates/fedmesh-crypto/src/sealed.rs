//! Sealed peer-to-peer encryption
//!
//! Messages between nodes are encrypted with authenticated public-key
//! cryptography. Both sides hold Ed25519 signing keys; those are converted
//! to their X25519 form so a single key pair serves both signing and
//! encryption. The sender needs only the recipient's public signing key.

use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::box_;
use sodiumoxide::crypto::sign::ed25519;

use crate::error::{CryptoError, Result};
use crate::identity::NodeIdentity;

/// Size of the box nonce in bytes
pub const NONCE_SIZE: usize = box_::NONCEBYTES;

/// An encrypted message envelope
///
/// The nonce is random per message and travels with the ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

fn curve_public_key(public_key: &ed25519::PublicKey) -> Result<box_::PublicKey> {
    ed25519::to_curve25519_pk(public_key)
        .map_err(|_| CryptoError::KeyConversion("ed25519 public key has no curve25519 form".into()))
}

fn curve_secret_key(secret_key: &ed25519::SecretKey) -> Result<box_::SecretKey> {
    ed25519::to_curve25519_sk(secret_key)
        .map_err(|_| CryptoError::KeyConversion("ed25519 secret key has no curve25519 form".into()))
}

/// Encrypt a message for a recipient identified by their public signing key
///
/// Authenticates the sender: only someone holding the sender's secret key
/// could have produced an envelope that opens under the sender's public key.
pub fn encrypt_for(
    sender: &NodeIdentity,
    recipient_public_key: &ed25519::PublicKey,
    plaintext: &[u8],
) -> Result<SealedEnvelope> {
    let their_pk = curve_public_key(recipient_public_key)?;
    let our_sk = curve_secret_key(&sender.secret_key)?;

    let nonce = box_::gen_nonce();
    let ciphertext = box_::seal(plaintext, &nonce, &their_pk, &our_sk);

    Ok(SealedEnvelope {
        nonce: nonce.as_ref().to_vec(),
        ciphertext,
    })
}

/// Decrypt an envelope from a known sender
///
/// Returns `Ok(None)` when the ciphertext fails authentication (wrong
/// sender, tampered payload, or a message not addressed to us). That is an
/// expected outcome for untrusted input, not an error; `Err` is reserved
/// for malformed keys and nonces.
pub fn decrypt_from(
    recipient: &NodeIdentity,
    sender_public_key: &ed25519::PublicKey,
    envelope: &SealedEnvelope,
) -> Result<Option<Vec<u8>>> {
    let their_pk = curve_public_key(sender_public_key)?;
    let our_sk = curve_secret_key(&recipient.secret_key)?;

    let nonce = box_::Nonce::from_slice(&envelope.nonce).ok_or(CryptoError::InvalidKeyLength {
        expected: NONCE_SIZE,
        actual: envelope.nonce.len(),
    })?;

    match box_::open(&envelope.ciphertext, &nonce, &their_pk, &our_sk) {
        Ok(plaintext) => Ok(Some(plaintext)),
        Err(()) => Ok(None),
    }
}
