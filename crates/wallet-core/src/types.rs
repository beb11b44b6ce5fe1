use bitcoin::ScriptBuf;
use multisig_core::ScriptType;
use serde::{Deserialize, Serialize};

/// An address tracked by the address book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub address: String,
    /// `0` for receive, `1` for change.
    pub branch: u32,
    pub index: u32,
    /// Full path of this wallet's key, `None` for imported keys.
    pub derivation_path: Option<String>,
    pub script_pubkey: ScriptBuf,
    pub used: bool,
    /// Transaction in which activity on this address was first seen.
    pub first_seen_txid: Option<String>,
    /// Handed out but abandoned; never offered again.
    pub stale: bool,
}

impl DerivedAddress {
    /// Neither used nor stale.
    pub fn is_fresh(&self) -> bool {
        !self.used && !self.stale
    }
}

/// What one cosigner hands to the others to set up a multisig wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CosignerExport {
    /// Master key fingerprint, 8 hex characters.
    pub fingerprint: String,
    /// Path from the master key to `xpub`, e.g. `m/48'/1'/0'/2'`.
    pub derivation_path: String,
    /// Account-level extended public key with its SLIP-132 prefix.
    pub xpub: String,
    pub script_type: ScriptType,
}
