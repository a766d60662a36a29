//! Challenge-response authentication
//!
//! Proves that a peer controls the secret key matching a claimed public
//! key. The verifier issues a random challenge; the prover signs the
//! challenge concatenated with the current unix time in seconds. Binding
//! the timestamp into the signed payload bounds how long a captured
//! response stays replayable without requiring the response to carry a
//! timestamp field of its own.

use sodiumoxide::randombytes::randombytes_into;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{CryptoError, Result};
use crate::identity::NodeIdentity;
use crate::signing::{sign_message, verify_signature, Signature};
use sodiumoxide::crypto::sign::ed25519;

/// Size of a challenge nonce in bytes
pub const CHALLENGE_SIZE: usize = 32;

fn unix_seconds() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| CryptoError::ClockError(e.to_string()))
}

fn signed_payload(challenge: &[u8; CHALLENGE_SIZE], timestamp: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CHALLENGE_SIZE + 8);
    payload.extend_from_slice(challenge);
    payload.extend_from_slice(&timestamp.to_be_bytes());
    payload
}

/// Generate a fresh random challenge
pub fn generate_challenge() -> [u8; CHALLENGE_SIZE] {
    let mut challenge = [0u8; CHALLENGE_SIZE];
    randombytes_into(&mut challenge);
    challenge
}

/// Sign a challenge received from a verifier
pub fn respond_to_challenge(
    identity: &NodeIdentity,
    challenge: &[u8; CHALLENGE_SIZE],
) -> Result<Signature> {
    let payload = signed_payload(challenge, unix_seconds()?);
    sign_message(identity, &payload)
}

/// Verify a challenge response against the prover's claimed public key
///
/// The prover signed the challenge with whatever its clock read; the
/// verifier reconstructs candidate payloads at one-second steps backward
/// from its own clock, accepting any match within `max_age_ms`. A response
/// older than the window fails every candidate and is rejected.
pub fn verify_response(
    public_key: &ed25519::PublicKey,
    challenge: &[u8; CHALLENGE_SIZE],
    signature: &Signature,
    max_age_ms: u64,
) -> Result<bool> {
    let now = unix_seconds()?;
    let attempts = max_age_ms / 1000;

    for age in 0..=attempts {
        let timestamp = match now.checked_sub(age) {
            Some(ts) => ts,
            None => break,
        };
        let payload = signed_payload(challenge, timestamp);
        if verify_signature(public_key, &payload, signature).is_ok() {
            return Ok(true);
        }
    }

    Ok(false)
}
