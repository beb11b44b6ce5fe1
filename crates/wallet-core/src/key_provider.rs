//! Key providers backed by a BIP-39 seed or a single WIF key.
//!
//! Both can be locked, which drops the private material; the public half
//! (master fingerprint or imported public key) stays available so PSBTs can
//! still be inspected while locked.

use bitcoin::bip32::Fingerprint;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{PrivateKey, PublicKey};
use crypto_utils::{KeyMaterial, SeedBytes};
use multisig_core::derivation::ExtendedKey;
use multisig_core::signer::{KeyProvider, KeyRef};
use multisig_core::{BtcError, BtcNetwork};

use crate::error::WalletError;
use crate::mnemonic::mnemonic_to_seed;

/// HD key provider over a seed.
pub struct SeedKeyProvider {
    fingerprint: Fingerprint,
    network: BtcNetwork,
    master: Option<ExtendedKey>,
}

impl SeedKeyProvider {
    pub fn from_seed(seed: &SeedBytes, network: BtcNetwork) -> Result<Self, WalletError> {
        let master = ExtendedKey::from_seed(seed, network)?;
        Ok(Self {
            fingerprint: master.fingerprint(),
            network,
            master: Some(master),
        })
    }

    pub fn from_mnemonic(phrase: &str, passphrase: &str, network: BtcNetwork) -> Result<Self, WalletError> {
        let seed = mnemonic_to_seed(phrase, passphrase)?;
        Self::from_seed(&seed, network)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    pub fn is_locked(&self) -> bool {
        self.master.is_none()
    }

    /// Drop the master key.
    pub fn lock(&mut self) {
        if self.master.take().is_some() {
            log::info!("seed provider {} locked", self.fingerprint);
        }
    }

    /// Restore the master key. The phrase must produce the same fingerprint.
    pub fn unlock(&mut self, phrase: &str, passphrase: &str) -> Result<(), WalletError> {
        let seed = mnemonic_to_seed(phrase, passphrase)?;
        let master = ExtendedKey::from_seed(&seed, self.network)?;
        if master.fingerprint() != self.fingerprint {
            return Err(WalletError::UnlockFailed(format!(
                "seed belongs to {}, not {}",
                master.fingerprint(),
                self.fingerprint
            )));
        }
        self.master = Some(master);
        log::info!("seed provider {} unlocked", self.fingerprint);
        Ok(())
    }

    /// The master key, while unlocked.
    pub fn master(&self) -> Result<&ExtendedKey, BtcError> {
        self.master.as_ref().ok_or(BtcError::KeyProviderLocked)
    }
}

impl KeyProvider for SeedKeyProvider {
    fn master_fingerprint(&self) -> Option<Fingerprint> {
        Some(self.fingerprint)
    }

    fn imported_public_key(&self) -> Option<PublicKey> {
        None
    }

    fn private_key(&self, key: &KeyRef) -> Result<KeyMaterial, BtcError> {
        match key {
            KeyRef::Derivation(path) => self
                .master()?
                .derive_path(path)?
                .key_material()
                .ok_or_else(|| BtcError::Signing("derived node has no private key".into())),
            KeyRef::Imported => Err(BtcError::Signing("seed provider holds no imported key".into())),
        }
    }
}

/// Provider holding one imported private key.
pub struct WifKeyProvider {
    public_key: PublicKey,
    network: BtcNetwork,
    key: Option<PrivateKey>,
}

fn parse_wif(wif: &str, network: BtcNetwork) -> Result<PrivateKey, WalletError> {
    let key = PrivateKey::from_wif(wif.trim()).map_err(|e| WalletError::InvalidPrivateKey(e.to_string()))?;
    if key.network != network.kind() {
        return Err(BtcError::NetworkMismatch {
            expected: network.to_string(),
            found: format!("{:?} key", key.network),
        }
        .into());
    }
    Ok(key)
}

impl WifKeyProvider {
    pub fn from_wif(wif: &str, network: BtcNetwork) -> Result<Self, WalletError> {
        let key = parse_wif(wif, network)?;
        Ok(Self {
            public_key: key.public_key(&Secp256k1::signing_only()),
            network,
            key: Some(key),
        })
    }

    /// Public key in the encoding the WIF declared.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn network(&self) -> BtcNetwork {
        self.network
    }

    pub fn is_locked(&self) -> bool {
        self.key.is_none()
    }

    pub fn lock(&mut self) {
        if let Some(mut key) = self.key.take() {
            key.inner.non_secure_erase();
            log::info!("imported key {} locked", self.public_key);
        }
    }

    pub fn unlock(&mut self, wif: &str) -> Result<(), WalletError> {
        let key = parse_wif(wif, self.network)?;
        if key.public_key(&Secp256k1::signing_only()) != self.public_key {
            return Err(WalletError::UnlockFailed("key does not match the imported public key".into()));
        }
        self.key = Some(key);
        Ok(())
    }
}

impl Drop for WifKeyProvider {
    fn drop(&mut self) {
        self.lock();
    }
}

impl KeyProvider for WifKeyProvider {
    fn master_fingerprint(&self) -> Option<Fingerprint> {
        None
    }

    fn imported_public_key(&self) -> Option<PublicKey> {
        Some(self.public_key)
    }

    fn private_key(&self, key: &KeyRef) -> Result<KeyMaterial, BtcError> {
        match key {
            KeyRef::Imported => {
                let private = self.key.as_ref().ok_or(BtcError::KeyProviderLocked)?;
                let mut bytes = private.inner.secret_bytes();
                Ok(KeyMaterial::take(&mut bytes, private.compressed))
            }
            KeyRef::Derivation(_) => Err(BtcError::Signing("imported key provider has no HD keys".into())),
        }
    }
}
