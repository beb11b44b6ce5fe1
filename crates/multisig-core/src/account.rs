//! Spending accounts: where addresses come from and how an owned UTXO maps
//! back to the scripts and key origins needed to sign it.

use std::collections::{BTreeMap, HashSet};

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpub};
use bitcoin::secp256k1::{self, Secp256k1};
use bitcoin::{Amount, PublicKey, ScriptBuf, TxOut};

use crate::address::{derive_address, AddressOutput};
use crate::derivation::{format_path, parse_path, ExtendedKey};
use crate::error::BtcError;
use crate::multisig::{normal, Cosigner, MultisigConfig};
use crate::network::BtcNetwork;
use crate::script_type::ScriptType;
use crate::utxo::Utxo;
use crate::xpub::{decode_xpub_for, encode_xpub};

/// Receive (`0`) or change (`1`) branch below an account key.
pub const RECEIVE_BRANCH: u32 = 0;
pub const CHANGE_BRANCH: u32 = 1;

/// Everything a PSBT input needs besides the outpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSigningData {
    pub witness_utxo: TxOut,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub bip32_derivation: BTreeMap<secp256k1::PublicKey, KeySource>,
}

/// A BIP-44/49/84 account described by its account-level xpub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleSigAccount {
    xpub: Xpub,
    fingerprint: Fingerprint,
    account_path: DerivationPath,
    script_type: ScriptType,
    network: BtcNetwork,
}

impl SingleSigAccount {
    pub fn new(
        xpub: &str,
        fingerprint: Fingerprint,
        account_path: &str,
        script_type: ScriptType,
        network: BtcNetwork,
    ) -> Result<Self, BtcError> {
        if script_type.is_multisig() {
            return Err(BtcError::Validation(format!(
                "{script_type} accounts need cosigners"
            )));
        }
        let decoded = decode_xpub_for(xpub, network)?;
        let account_path = parse_path(account_path)?;
        if usize::from(decoded.xpub.depth) != account_path.as_ref().len() {
            return Err(BtcError::Validation(format!(
                "account key depth {} does not match {}",
                decoded.xpub.depth,
                format_path(account_path.as_ref())
            )));
        }
        Ok(Self {
            xpub: decoded.xpub,
            fingerprint,
            account_path,
            script_type,
            network,
        })
    }

    /// Derive the standard account for `script_type` from a master node.
    pub fn from_master(
        master: &ExtendedKey,
        script_type: ScriptType,
        account: u32,
        network: BtcNetwork,
    ) -> Result<Self, BtcError> {
        if script_type.is_multisig() {
            return Err(BtcError::Validation(format!(
                "{script_type} accounts need cosigners"
            )));
        }
        let path = script_type.account_path(network.coin_type(), account);
        let node = master.derive(&path)?;
        Ok(Self {
            xpub: node.xpub(),
            fingerprint: master.fingerprint(),
            account_path: parse_path(&path)?,
            script_type,
            network,
        })
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    /// Account key with the prefix conventional for its script type.
    pub fn encoded_xpub(&self) -> String {
        encode_xpub(&self.xpub, self.script_type, self.network)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn account_path(&self) -> &DerivationPath {
        &self.account_path
    }

    pub fn child_key(&self, change: u32, index: u32) -> Result<(PublicKey, KeySource), BtcError> {
        let steps = [normal(change)?, normal(index)?];
        let secp = Secp256k1::verification_only();
        let child = self
            .xpub
            .derive_pub(&secp, &steps)
            .map_err(|e| BtcError::Validation(format!("account derivation failed: {e}")))?;
        Ok((
            PublicKey::new(child.public_key),
            (self.fingerprint, self.account_path.extend(steps)),
        ))
    }
}

/// An M-of-N wallet shared by a fixed set of cosigners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigAccount {
    config: MultisigConfig,
    cosigners: Vec<Cosigner>,
    network: BtcNetwork,
}

impl MultisigAccount {
    pub fn new(config: MultisigConfig, cosigners: Vec<Cosigner>, network: BtcNetwork) -> Result<Self, BtcError> {
        if cosigners.len() != usize::from(config.total()) {
            return Err(BtcError::Validation(format!(
                "{config} wallet needs {} cosigners, got {}",
                config.total(),
                cosigners.len()
            )));
        }

        let mut seen = HashSet::new();
        for cosigner in &cosigners {
            let declared = cosigner.declared_script_type();
            if declared.is_multisig() && declared != config.script_type() {
                return Err(BtcError::Validation(format!(
                    "cosigner {} exported a {declared} key for a {config} wallet",
                    cosigner.name()
                )));
            }
            if !seen.insert(cosigner.xpub().public_key.serialize()) {
                return Err(BtcError::DuplicateKey(format!(
                    "cosigner {} repeats another cosigner's key",
                    cosigner.name()
                )));
            }
        }
        if cosigners.iter().filter(|c| c.is_self()).count() > 1 {
            return Err(BtcError::Validation("more than one cosigner marked as self".into()));
        }

        Ok(Self {
            config,
            cosigners,
            network,
        })
    }

    pub fn config(&self) -> &MultisigConfig {
        &self.config
    }

    pub fn cosigners(&self) -> &[Cosigner] {
        &self.cosigners
    }

    /// The cosigner this wallet signs as, if any.
    pub fn own_cosigner(&self) -> Option<&Cosigner> {
        self.cosigners.iter().find(|c| c.is_self())
    }

    /// Every cosigner's public key at `change/index`, with key origins.
    pub fn child_keys(&self, change: u32, index: u32) -> Result<Vec<(PublicKey, KeySource)>, BtcError> {
        self.cosigners.iter().map(|c| c.child_key(change, index)).collect()
    }
}

/// A single imported private key's public half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportedKeyAccount {
    public_key: PublicKey,
    script_type: ScriptType,
    network: BtcNetwork,
}

impl ImportedKeyAccount {
    /// Checks up front that the key can be used with `script_type`.
    pub fn new(public_key: PublicKey, script_type: ScriptType, network: BtcNetwork) -> Result<Self, BtcError> {
        derive_address(&[public_key], None, script_type, network)?;
        Ok(Self {
            public_key,
            script_type,
            network,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

/// Any account the engine can build and sign transactions for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    SingleSig(SingleSigAccount),
    Multisig(MultisigAccount),
    Imported(ImportedKeyAccount),
}

impl Account {
    pub fn network(&self) -> BtcNetwork {
        match self {
            Account::SingleSig(a) => a.network,
            Account::Multisig(a) => a.network,
            Account::Imported(a) => a.network,
        }
    }

    pub fn script_type(&self) -> ScriptType {
        match self {
            Account::SingleSig(a) => a.script_type,
            Account::Multisig(a) => a.config.script_type(),
            Account::Imported(a) => a.script_type,
        }
    }

    pub fn multisig_config(&self) -> Option<&MultisigConfig> {
        match self {
            Account::Multisig(a) => Some(&a.config),
            Account::SingleSig(_) | Account::Imported(_) => None,
        }
    }

    /// Signatures needed per input.
    pub fn required_signatures(&self) -> usize {
        self.multisig_config().map_or(1, |c| usize::from(c.required()))
    }

    /// Address at `change/index`. Imported keys have a single address.
    pub fn address(&self, change: u32, index: u32) -> Result<AddressOutput, BtcError> {
        let (output, _) = self.address_with_origins(change, index)?;
        Ok(output)
    }

    pub fn receive_address(&self, index: u32) -> Result<AddressOutput, BtcError> {
        self.address(RECEIVE_BRANCH, index)
    }

    pub fn change_address(&self, index: u32) -> Result<AddressOutput, BtcError> {
        self.address(CHANGE_BRANCH, index)
    }

    /// Full derivation path string reported for an address, if the account is HD.
    pub fn derivation_path(&self, change: u32, index: u32) -> Result<Option<String>, BtcError> {
        let steps = [normal(change)?, normal(index)?];
        Ok(match self {
            Account::SingleSig(a) => Some(format_path(a.account_path.extend(steps).as_ref())),
            Account::Multisig(a) => a
                .own_cosigner()
                .or_else(|| a.cosigners.first())
                .map(|c| format_path(c.derivation_path().extend(steps).as_ref())),
            Account::Imported(_) => None,
        })
    }

    fn address_with_origins(
        &self,
        change: u32,
        index: u32,
    ) -> Result<(AddressOutput, BTreeMap<secp256k1::PublicKey, KeySource>), BtcError> {
        let network = self.network();
        match self {
            Account::SingleSig(a) => {
                let (key, origin) = a.child_key(change, index)?;
                let output = derive_address(&[key], None, a.script_type, network)?;
                Ok((output, BTreeMap::from([(key.inner, origin)])))
            }
            Account::Multisig(a) => {
                let children = a.child_keys(change, index)?;
                let keys: Vec<PublicKey> = children.iter().map(|(k, _)| *k).collect();
                let output = derive_address(&keys, Some(&a.config), a.config.script_type(), network)?;
                let origins = children.into_iter().map(|(k, origin)| (k.inner, origin)).collect();
                Ok((output, origins))
            }
            Account::Imported(a) => {
                let output = derive_address(&[a.public_key], None, a.script_type, network)?;
                Ok((output, BTreeMap::new()))
            }
        }
    }

    /// Resolve an owned UTXO to the data its PSBT input needs.
    ///
    /// The UTXO's scriptPubKey must match what this account derives at the
    /// UTXO's path; anything else is rejected rather than signed blindly.
    pub fn input_data(&self, utxo: &Utxo) -> Result<InputSigningData, BtcError> {
        if utxo.script_type != self.script_type() {
            return Err(BtcError::Validation(format!(
                "UTXO {}:{} is {} but the account is {}",
                utxo.txid,
                utxo.vout,
                utxo.script_type,
                self.script_type()
            )));
        }

        let (change, index) = match self {
            Account::Imported(_) => (0, 0),
            Account::SingleSig(_) | Account::Multisig(_) => self.branch_and_index(utxo)?,
        };
        let (output, bip32_derivation) = self.address_with_origins(change, index)?;
        if output.script_pubkey != utxo.script_pubkey {
            return Err(BtcError::Validation(format!(
                "UTXO {}:{} does not pay to this account's address {}",
                utxo.txid, utxo.vout, output.address
            )));
        }

        Ok(InputSigningData {
            witness_utxo: TxOut {
                value: Amount::from_sat(utxo.amount_sat),
                script_pubkey: utxo.script_pubkey.clone(),
            },
            redeem_script: output.redeem_script,
            witness_script: output.witness_script,
            bip32_derivation,
        })
    }

    fn branch_and_index(&self, utxo: &Utxo) -> Result<(u32, u32), BtcError> {
        let raw = utxo.derivation_path.as_deref().ok_or_else(|| {
            BtcError::InvalidPath(format!("UTXO {}:{} has no derivation path", utxo.txid, utxo.vout))
        })?;
        let path = parse_path(raw)?;
        let steps = path.as_ref();
        let (prefix, tail) = match steps.len() {
            n if n >= 2 => steps.split_at(n - 2),
            _ => return Err(BtcError::InvalidPath(format!("{raw} is too short"))),
        };

        let known_prefix = match self {
            Account::SingleSig(a) => a.account_path.as_ref() == prefix,
            Account::Multisig(a) => a.cosigners.iter().any(|c| c.derivation_path().as_ref() == prefix),
            Account::Imported(_) => false,
        };
        if !known_prefix {
            return Err(BtcError::InvalidPath(format!("{raw} is not below this account")));
        }

        match (tail[0], tail[1]) {
            (ChildNumber::Normal { index: change }, ChildNumber::Normal { index })
                if change == RECEIVE_BRANCH || change == CHANGE_BRANCH =>
            {
                Ok((change, index))
            }
            _ => Err(BtcError::InvalidPath(format!(
                "{raw} must end in a receive/change branch and a non-hardened index"
            ))),
        }
    }
}
