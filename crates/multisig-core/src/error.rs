use thiserror::Error;

/// Errors produced by the multisig engine.
///
/// Format and structural variants are raised before any signing is attempted.
/// Non-fatal advisories are not errors; see [`crate::psbt::SecurityWarning`].
#[derive(Debug, Error)]
pub enum BtcError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("network mismatch: expected {expected}, found {found}")]
    NetworkMismatch { expected: String, found: String },

    #[error("incompatible key: {0}")]
    IncompatibleKey(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("invalid derivation path: {0}")]
    InvalidPath(String),

    #[error("structural PSBT error: {0}")]
    StructuralPsbt(String),

    #[error("insufficient funds: have {available} sat, need {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("insufficient signatures on input {input}: have {have}, need {need}")]
    InsufficientSignatures {
        input: usize,
        have: usize,
        need: usize,
    },

    #[error("key provider is locked")]
    KeyProviderLocked,

    #[error("signing error: {0}")]
    Signing(String),

    #[error("security policy violation: {0}")]
    SecurityPolicy(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("pending transaction expired at {expired_at}")]
    Expired { expired_at: u64 },
}

impl From<crypto_utils::CryptoError> for BtcError {
    fn from(e: crypto_utils::CryptoError) -> Self {
        BtcError::Signing(e.to_string())
    }
}
