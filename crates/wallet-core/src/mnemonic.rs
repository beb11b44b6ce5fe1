use bip39::{Language, Mnemonic};
use crypto_utils::SeedBytes;
use zeroize::Zeroize;

use crate::error::WalletError;

/// Whether `phrase` is a valid English BIP-39 mnemonic.
pub fn validate_mnemonic(phrase: &str) -> bool {
    Mnemonic::parse_in_normalized(Language::English, phrase).is_ok()
}

/// BIP-39 seed of `phrase` with `passphrase`, wiped when dropped.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<SeedBytes, WalletError> {
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    let mut seed = mnemonic.to_seed(passphrase);
    let wrapped = SeedBytes::new(seed.to_vec());
    seed.zeroize();
    Ok(wrapped?)
}

/// Validate a single word against the BIP-39 word list
pub fn is_valid_word(word: &str) -> bool {
    Language::English.find_word(word).is_some()
}
