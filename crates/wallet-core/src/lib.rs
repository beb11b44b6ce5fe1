//! Wallet-side facade over the multisig engine: seed and WIF key providers,
//! account setup from cosigner exports, address bookkeeping, and the
//! [`WalletSession`] that carries all of it for one account.

pub mod address_book;
pub mod error;
pub mod hd_derivation;
pub mod key_provider;
pub mod mnemonic;
pub mod session;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub use error::WalletError;
pub use key_provider::{SeedKeyProvider, WifKeyProvider};
pub use session::WalletSession;
pub use types::{CosignerExport, DerivedAddress};

use multisig_core::BtcNetwork;

/// Validate a mnemonic phrase
pub fn validate_mnemonic(phrase: &str) -> bool {
    mnemonic::validate_mnemonic(phrase)
}

/// Check if a single word is in the BIP-39 word list
pub fn is_valid_bip39_word(word: &str) -> bool {
    mnemonic::is_valid_word(word)
}

/// Validate an address for a given network
pub fn validate_address(addr: &str, network: BtcNetwork) -> Result<bool, WalletError> {
    Ok(multisig_core::address::validate_address(addr, network)?)
}

/// Seconds since the Unix epoch, for pending-transaction expiry.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
