use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::PublicKey;
use serde::{Deserialize, Serialize};

use crate::derivation::{format_path, parse_path};
use crate::error::BtcError;
use crate::network::BtcNetwork;
use crate::script_type::{ScriptType, MAX_COSIGNERS};
use crate::xpub::decode_xpub_for;

/// M-of-N policy for a multisig wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawMultisigConfig")]
pub struct MultisigConfig {
    required: u8,
    total: u8,
    script_type: ScriptType,
}

#[derive(Deserialize)]
struct RawMultisigConfig {
    required: u8,
    total: u8,
    script_type: ScriptType,
}

impl TryFrom<RawMultisigConfig> for MultisigConfig {
    type Error = BtcError;

    fn try_from(raw: RawMultisigConfig) -> Result<Self, Self::Error> {
        MultisigConfig::new(raw.required, raw.total, raw.script_type)
    }
}

impl MultisigConfig {
    pub fn new(required: u8, total: u8, script_type: ScriptType) -> Result<Self, BtcError> {
        if !script_type.is_multisig() {
            return Err(BtcError::Validation(format!(
                "{script_type} is not a multisig script type"
            )));
        }
        if required == 0 || required > total || total > MAX_COSIGNERS {
            return Err(BtcError::Validation(format!(
                "invalid threshold {required}-of-{total} (need 1 <= M <= N <= {MAX_COSIGNERS})"
            )));
        }
        Ok(Self {
            required,
            total,
            script_type,
        })
    }

    pub fn required(&self) -> u8 {
        self.required
    }

    pub fn total(&self) -> u8 {
        self.total
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }
}

impl fmt::Display for MultisigConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-of-{} {}", self.required, self.total, self.script_type)
    }
}

/// One participant in a multisig wallet, identified by its account-level
/// extended public key and the origin of that key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cosigner {
    name: String,
    xpub_string: String,
    xpub: Xpub,
    declared_type: ScriptType,
    fingerprint: Fingerprint,
    derivation_path: DerivationPath,
    is_self: bool,
}

impl Cosigner {
    /// Validates the extended key against `network` and checks that its depth
    /// agrees with `derivation_path`.
    pub fn new(
        name: impl Into<String>,
        xpub: &str,
        fingerprint: Fingerprint,
        derivation_path: &str,
        is_self: bool,
        network: BtcNetwork,
    ) -> Result<Self, BtcError> {
        let decoded = decode_xpub_for(xpub, network)?;
        let path = parse_path(derivation_path)?;

        let depth = path.as_ref().len();
        if usize::from(decoded.xpub.depth) != depth {
            return Err(BtcError::Validation(format!(
                "cosigner key has depth {} but origin path {} has {depth} steps",
                decoded.xpub.depth,
                format_path(path.as_ref())
            )));
        }
        if let Some(last) = path.as_ref().last() {
            if *last != decoded.xpub.child_number {
                return Err(BtcError::Validation(format!(
                    "cosigner key is child {} but origin path ends in {last}",
                    decoded.xpub.child_number
                )));
            }
        }

        Ok(Self {
            name: name.into(),
            xpub_string: xpub.trim().to_string(),
            xpub: decoded.xpub,
            declared_type: decoded.script_type,
            fingerprint,
            derivation_path: path,
            is_self,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The extended key exactly as it was supplied.
    pub fn xpub_string(&self) -> &str {
        &self.xpub_string
    }

    pub fn xpub(&self) -> &Xpub {
        &self.xpub
    }

    /// Script type implied by the key's prefix.
    pub fn declared_script_type(&self) -> ScriptType {
        self.declared_type
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn derivation_path(&self) -> &DerivationPath {
        &self.derivation_path
    }

    pub fn is_self(&self) -> bool {
        self.is_self
    }

    /// Public key at `change/index` below the account key, with its full origin.
    pub fn child_key(&self, change: u32, index: u32) -> Result<(PublicKey, KeySource), BtcError> {
        let steps = [normal(change)?, normal(index)?];
        let secp = Secp256k1::verification_only();
        let child = self
            .xpub
            .derive_pub(&secp, &steps)
            .map_err(|e| BtcError::Validation(format!("cosigner {} derivation failed: {e}", self.name)))?;
        let full_path = self.derivation_path.extend(steps);
        Ok((PublicKey::new(child.public_key), (self.fingerprint, full_path)))
    }
}

pub(crate) fn normal(index: u32) -> Result<ChildNumber, BtcError> {
    ChildNumber::from_normal_idx(index)
        .map_err(|_| BtcError::InvalidPath(format!("index {index} is out of the non-hardened range")))
}
