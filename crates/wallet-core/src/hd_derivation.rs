//! Account setup from a master key: cosigner exports for multisig wallets
//! and standard single-sig accounts.

use std::str::FromStr;

use bitcoin::bip32::Fingerprint;
use multisig_core::account::{Account, MultisigAccount, SingleSigAccount};
use multisig_core::derivation::ExtendedKey;
use multisig_core::xpub::encode_xpub;
use multisig_core::{BtcError, BtcNetwork, Cosigner, MultisigConfig, ScriptType};

use crate::error::WalletError;
use crate::types::CosignerExport;

/// This wallet's cosigner entry for a BIP-48 multisig account.
pub fn export_cosigner(
    master: &ExtendedKey,
    script_type: ScriptType,
    account: u32,
    network: BtcNetwork,
) -> Result<CosignerExport, WalletError> {
    if !script_type.is_multisig() {
        return Err(BtcError::Validation(format!("{script_type} is not a multisig script type")).into());
    }
    let path = script_type.account_path(network.coin_type(), account);
    let node = master.derive(&path)?;
    log::debug!("exported {script_type} cosigner key at {path}");
    Ok(CosignerExport {
        fingerprint: master.fingerprint().to_string(),
        derivation_path: path,
        xpub: encode_xpub(&node.xpub(), script_type, network),
        script_type,
    })
}

impl CosignerExport {
    pub fn to_json(&self) -> Result<String, WalletError> {
        serde_json::to_string(self).map_err(|e| WalletError::InvalidExport(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, WalletError> {
        serde_json::from_str(json).map_err(|e| WalletError::InvalidExport(e.to_string()))
    }

    pub fn master_fingerprint(&self) -> Result<Fingerprint, WalletError> {
        Fingerprint::from_str(&self.fingerprint)
            .map_err(|e| WalletError::InvalidExport(format!("fingerprint {:?}: {e}", self.fingerprint)))
    }

    pub fn to_cosigner(&self, name: &str, is_self: bool, network: BtcNetwork) -> Result<Cosigner, WalletError> {
        Ok(Cosigner::new(
            name,
            &self.xpub,
            self.master_fingerprint()?,
            &self.derivation_path,
            is_self,
            network,
        )?)
    }
}

/// Assemble a multisig account from every cosigner's export, marking the one
/// whose fingerprint is `own_fingerprint` as this wallet's.
pub fn multisig_account(
    config: MultisigConfig,
    exports: &[(String, CosignerExport)],
    own_fingerprint: Option<Fingerprint>,
    network: BtcNetwork,
) -> Result<Account, WalletError> {
    let mut cosigners = Vec::with_capacity(exports.len());
    for (name, export) in exports {
        if export.script_type != config.script_type() {
            return Err(BtcError::Validation(format!(
                "cosigner {name} exported a {} key for a {config} wallet",
                export.script_type
            ))
            .into());
        }
        let is_self = own_fingerprint == Some(export.master_fingerprint()?);
        cosigners.push(export.to_cosigner(name, is_self, network)?);
    }
    let account = MultisigAccount::new(config, cosigners, network)?;
    log::info!("set up {config} account on {network}");
    Ok(Account::Multisig(account))
}

/// Standard BIP-44/49/84 account `account` of `master`.
pub fn single_sig_account(
    master: &ExtendedKey,
    script_type: ScriptType,
    account: u32,
    network: BtcNetwork,
) -> Result<Account, WalletError> {
    Ok(Account::SingleSig(SingleSigAccount::from_master(
        master,
        script_type,
        account,
        network,
    )?))
}
