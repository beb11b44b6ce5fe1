use serde::{Deserialize, Serialize};

/// Every output/input script family the engine can derive, size and sign.
///
/// Adding a variant forces every size, script and signing site to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptType {
    /// P2PKH.
    Legacy,
    /// P2SH-P2WPKH.
    SegWitWrapped,
    /// P2WPKH.
    NativeSegWit,
    /// Bare multisig inside P2SH.
    MultisigP2SH,
    /// Multisig witness script inside P2WSH.
    MultisigP2WSH,
    /// P2WSH multisig nested in P2SH.
    MultisigP2SHWrapped,
}

/// Largest cosigner set accepted for any multisig script type.
///
/// A 15-of-15 compressed-key script is 513 bytes, under the 520-byte P2SH
/// redeem script push limit.
pub const MAX_COSIGNERS: u8 = 15;

impl ScriptType {
    pub const ALL: [ScriptType; 6] = [
        ScriptType::Legacy,
        ScriptType::SegWitWrapped,
        ScriptType::NativeSegWit,
        ScriptType::MultisigP2SH,
        ScriptType::MultisigP2WSH,
        ScriptType::MultisigP2SHWrapped,
    ];

    pub fn is_multisig(self) -> bool {
        match self {
            ScriptType::Legacy | ScriptType::SegWitWrapped | ScriptType::NativeSegWit => false,
            ScriptType::MultisigP2SH
            | ScriptType::MultisigP2WSH
            | ScriptType::MultisigP2SHWrapped => true,
        }
    }

    /// Whether spending requires witness data (and therefore compressed keys).
    pub fn is_segwit(self) -> bool {
        match self {
            ScriptType::Legacy | ScriptType::MultisigP2SH => false,
            ScriptType::SegWitWrapped
            | ScriptType::NativeSegWit
            | ScriptType::MultisigP2WSH
            | ScriptType::MultisigP2SHWrapped => true,
        }
    }

    /// BIP-43 purpose field of the account derivation path.
    pub fn purpose(self) -> u32 {
        match self {
            ScriptType::Legacy => 44,
            ScriptType::SegWitWrapped => 49,
            ScriptType::NativeSegWit => 84,
            ScriptType::MultisigP2SH
            | ScriptType::MultisigP2WSH
            | ScriptType::MultisigP2SHWrapped => 48,
        }
    }

    /// BIP-48 script-type path component for multisig accounts.
    pub fn bip48_script_type(self) -> Option<u32> {
        match self {
            ScriptType::Legacy | ScriptType::SegWitWrapped | ScriptType::NativeSegWit => None,
            ScriptType::MultisigP2SH | ScriptType::MultisigP2SHWrapped => Some(1),
            ScriptType::MultisigP2WSH => Some(2),
        }
    }

    /// Account-level path: `m/purpose'/coin'/account'` with a trailing
    /// `script_type'` for multisig.
    pub fn account_path(self, coin_type: u32, account: u32) -> String {
        match self.bip48_script_type() {
            Some(st) => format!("m/{}'/{}'/{}'/{}'", self.purpose(), coin_type, account, st),
            None => format!("m/{}'/{}'/{}'", self.purpose(), coin_type, account),
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            ScriptType::Legacy => "P2PKH",
            ScriptType::SegWitWrapped => "P2SH-P2WPKH",
            ScriptType::NativeSegWit => "P2WPKH",
            ScriptType::MultisigP2SH => "P2SH multisig",
            ScriptType::MultisigP2WSH => "P2WSH multisig",
            ScriptType::MultisigP2SHWrapped => "P2SH-P2WSH multisig",
        }
    }
}

impl std::fmt::Display for ScriptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_name())
    }
}
