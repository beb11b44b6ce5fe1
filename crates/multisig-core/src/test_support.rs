//! Fixtures shared by unit tests: known seeds, in-memory key providers and
//! UTXOs paying to account addresses.

use std::str::FromStr;

use bitcoin::bip32::Fingerprint;
use bitcoin::PrivateKey;
use crypto_utils::KeyMaterial;

use crate::account::{Account, ImportedKeyAccount, MultisigAccount};
use crate::derivation::ExtendedKey;
use crate::error::BtcError;
use crate::multisig::{Cosigner, MultisigConfig};
use crate::network::BtcNetwork;
use crate::script_type::ScriptType;
use crate::signer::{KeyProvider, KeyRef};
use crate::utxo::Utxo;
use crate::xpub::encode_xpub;

/// BIP-39 seeds (empty passphrase) of "abandon … about", "legal winner … yellow"
/// and "letter advice … above".
pub const SEEDS: [&str; 3] = [
    "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4",
    "878386efb78845b3355bd15ea4d39ef97d179cb712b77d5c12b6be415fffeffe5f377ba02bf3f8544ab800b955e51fbff09828f682052a20faa6addbbddfb096",
    "77d6be9708c8218738934f84bbbb78a2e048ca007746cb764f0673e4b1812d176bbb173e1a291f31cf633f1d0bad7d3cf071c30e98cd0688b5bcce65ecaceb36",
];

pub fn master_from_hex(seed: &str) -> ExtendedKey {
    ExtendedKey::from_seed(&hex::decode(seed).unwrap(), BtcNetwork::Testnet).unwrap()
}

pub fn abandon_master() -> ExtendedKey {
    master_from_hex(SEEDS[0])
}

/// HD key provider over an in-memory master key.
pub struct SeedSigner {
    master: ExtendedKey,
}

impl SeedSigner {
    pub fn new(master: ExtendedKey) -> Self {
        Self { master }
    }

    pub fn from_mnemonic_index(i: usize) -> Self {
        Self::new(master_from_hex(SEEDS[i]))
    }

    pub fn master(&self) -> &ExtendedKey {
        &self.master
    }
}

impl KeyProvider for SeedSigner {
    fn master_fingerprint(&self) -> Option<Fingerprint> {
        Some(self.master.fingerprint())
    }

    fn imported_public_key(&self) -> Option<bitcoin::PublicKey> {
        None
    }

    fn private_key(&self, key: &KeyRef) -> Result<KeyMaterial, BtcError> {
        match key {
            KeyRef::Derivation(path) => self
                .master
                .derive_path(path)?
                .key_material()
                .ok_or_else(|| BtcError::Signing("no private key".into())),
            KeyRef::Imported => Err(BtcError::Signing("no imported key".into())),
        }
    }
}

/// Provider holding a single WIF key.
pub struct WifSigner {
    key: PrivateKey,
}

impl WifSigner {
    /// Private key 1, uncompressed, testnet.
    pub fn uncompressed_one() -> Self {
        Self {
            key: PrivateKey::from_wif("91avARGdfge8E4tZfYLoxeJ5sGBdNJQH4kvjJoQFacbgwmaKkrx").unwrap(),
        }
    }

    pub fn legacy_account(&self) -> Account {
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let public = self.key.public_key(&secp);
        Account::Imported(ImportedKeyAccount::new(public, ScriptType::Legacy, BtcNetwork::Testnet).unwrap())
    }
}

impl KeyProvider for WifSigner {
    fn master_fingerprint(&self) -> Option<Fingerprint> {
        None
    }

    fn imported_public_key(&self) -> Option<bitcoin::PublicKey> {
        Some(self.key.public_key(&bitcoin::secp256k1::Secp256k1::new()))
    }

    fn private_key(&self, key: &KeyRef) -> Result<KeyMaterial, BtcError> {
        match key {
            KeyRef::Imported => {
                let mut bytes = self.key.inner.secret_bytes();
                Ok(KeyMaterial::take(&mut bytes, self.key.compressed))
            }
            KeyRef::Derivation(_) => Err(BtcError::Signing("no HD key".into())),
        }
    }
}

/// The 2-of-3 P2SH-P2WSH testnet wallet of the three known mnemonics.
pub fn multisig_2_of_3() -> Account {
    let vpubs = [
        ("73c5da0a", "Vpub5n95dMZrDHj6RTzsxFmTU74yDebKg5Utg438CY1p4raaLyGHgkWiF6qS4wPMUarPiCBw1xAGDBEeXZ644pHeXEGFmuYLmzpwY9W2SeiKbmF"),
        ("b8688df1", "Vpub5mXjbXRpPCwQzPkXewjUmnyto5E1mcmQ3Z4R2YsDtaRv1qhWnhMzRRPnhd9knLottPojsoj8joJVB7VQhnfjzUgqVuVn55URaxit5NfErgs"),
        ("28645006", "Vpub5momCasstFqTu667cM7RXKeFqk6ysYjZbYeb8788cNYdeyvSCuJGvTEUWb8eJPMdL8s6VioUPxy4XPAv8MBs9AacUsprthXm59kf7hofvt2"),
    ];
    let cosigners = vpubs
        .iter()
        .enumerate()
        .map(|(i, (fp, key))| {
            Cosigner::new(
                format!("cosigner-{i}"),
                key,
                Fingerprint::from_str(fp).unwrap(),
                "m/48'/1'/0'/1'",
                i == 0,
                BtcNetwork::Testnet,
            )
            .unwrap()
        })
        .collect();
    let config = MultisigConfig::new(2, 3, ScriptType::MultisigP2SHWrapped).unwrap();
    Account::Multisig(MultisigAccount::new(config, cosigners, BtcNetwork::Testnet).unwrap())
}

/// An M-of-N testnet wallet over seeds `[1; 32]`, `[2; 32]`, … with one
/// signer per cosigner, in cosigner order.
pub fn multisig_from_seeds(required: u8, total: u8, script_type: ScriptType) -> (Account, Vec<SeedSigner>) {
    let config = MultisigConfig::new(required, total, script_type).unwrap();
    let path = script_type.account_path(1, 0);
    let mut cosigners = Vec::new();
    let mut signers = Vec::new();
    for i in 1..=total {
        let master = ExtendedKey::from_seed(&[i; 32], BtcNetwork::Testnet).unwrap();
        let account_key = master.derive(&path).unwrap();
        let exported = encode_xpub(&account_key.xpub(), script_type, BtcNetwork::Testnet);
        cosigners.push(
            Cosigner::new(format!("seed-{i}"), &exported, master.fingerprint(), &path, i == 1, BtcNetwork::Testnet)
                .unwrap(),
        );
        signers.push(SeedSigner::new(master));
    }
    let account = MultisigAccount::new(config, cosigners, BtcNetwork::Testnet).unwrap();
    (Account::Multisig(account), signers)
}

/// A UTXO paying to `account`'s address at `change/index`.
pub fn utxo_at(account: &Account, change: u32, index: u32, txid_char: char, amount_sat: u64) -> Utxo {
    let output = account.address(change, index).unwrap();
    Utxo {
        txid: txid_char.to_string().repeat(64),
        vout: index,
        amount_sat,
        address: output.address,
        script_type: account.script_type(),
        derivation_path: account.derivation_path(change, index).unwrap(),
        script_pubkey: output.script_pubkey,
    }
}
