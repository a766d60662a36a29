//! Error types for cryptographic operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CryptoError {
    #[error("Failed to initialize cryptography library")]
    InitializationFailed,

    #[error("Invalid key format")]
    InvalidKeyFormat,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Key conversion failed: {0}")]
    KeyConversion(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("System clock error: {0}")]
    ClockError(String),
}
