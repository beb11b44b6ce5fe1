use multisig_core::BtcError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("invalid mnemonic: {0}")]
    InvalidMnemonic(String),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("unlock failed: {0}")]
    UnlockFailed(String),

    #[error("unknown address: {0}")]
    UnknownAddress(String),

    #[error("no pending transaction {0}")]
    UnknownTransaction(String),

    #[error("invalid cosigner export: {0}")]
    InvalidExport(String),

    #[error(transparent)]
    Engine(#[from] BtcError),

    #[error(transparent)]
    Crypto(#[from] crypto_utils::CryptoError),
}

impl WalletError {
    /// The engine error underneath, if this is one.
    pub fn engine(&self) -> Option<&BtcError> {
        match self {
            WalletError::Engine(e) => Some(e),
            _ => None,
        }
    }
}
