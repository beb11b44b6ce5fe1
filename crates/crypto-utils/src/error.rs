use thiserror::Error;

/// Errors raised while wrapping secret material.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("invalid seed length: {0} bytes (must be 16..=64)")]
    InvalidSeedLength(usize),
}
