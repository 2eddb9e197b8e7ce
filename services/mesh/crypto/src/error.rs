//! Crypto error types.

use thiserror::Error;

/// Errors raised by key derivation and the AES/ECDH primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A key or key-sized input was not exactly the expected length
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    /// A nonce was not 13 bytes
    #[error("invalid nonce length: {0}")]
    InvalidNonceLength(usize),

    /// Ciphertext shorter than its MIC
    #[error("ciphertext too short: {0}")]
    CiphertextTooShort(usize),

    /// MIC verification failed
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Encryption failed inside the AEAD
    #[error("encryption failed")]
    EncryptionFailed,

    /// Peer public key is not a valid P-256 point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Key material was not valid hexadecimal
    #[error("invalid hex key: {0}")]
    InvalidHex(String),
}
