//! Hierarchical deterministic key derivation (BIP-32).
//!
//! An [`ExtendedKey`] wraps either an extended private key or an extended
//! public key. Private nodes derive along any path; public nodes reject
//! hardened components up front, before any derivation work is done.

use std::fmt;

use bitcoin::bip32::{ChainCode, ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use crypto_utils::KeyMaterial;

use crate::error::BtcError;
use crate::network::BtcNetwork;

const HARDENED_BIT: u32 = 0x8000_0000;

/// Parse a textual derivation path into its components.
///
/// Accepts `m`, `m/…` and relative `a/b/…` forms. Hardened components may be
/// marked with `'`, `h` or `H`.
pub fn parse_path(path: &str) -> Result<DerivationPath, BtcError> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(BtcError::InvalidPath("empty path".into()));
    }
    if trimmed == "m" {
        return Ok(DerivationPath::from(Vec::<ChildNumber>::new()));
    }
    let body = trimmed.strip_prefix("m/").unwrap_or(trimmed);

    let mut children = Vec::new();
    for component in body.split('/') {
        children.push(parse_component(component, path)?);
    }
    Ok(DerivationPath::from(children))
}

fn parse_component(component: &str, full: &str) -> Result<ChildNumber, BtcError> {
    let (digits, hardened) = match component.strip_suffix(['\'', 'h', 'H']) {
        Some(rest) => (rest, true),
        None => (component, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BtcError::InvalidPath(format!(
            "bad component {component:?} in {full:?}"
        )));
    }
    let index: u32 = digits
        .parse()
        .map_err(|_| BtcError::InvalidPath(format!("index out of range in {full:?}")))?;
    if index >= HARDENED_BIT {
        return Err(BtcError::InvalidPath(format!(
            "index {index} exceeds 2^31 - 1 in {full:?}"
        )));
    }
    Ok(if hardened {
        ChildNumber::Hardened { index }
    } else {
        ChildNumber::Normal { index }
    })
}

/// Render a path with `'` hardened markers and a leading `m`.
pub fn format_path(path: &[ChildNumber]) -> String {
    let mut out = String::from("m");
    for child in path {
        match child {
            ChildNumber::Normal { index } => out.push_str(&format!("/{index}")),
            ChildNumber::Hardened { index } => out.push_str(&format!("/{index}'")),
        }
    }
    out
}

#[derive(Clone)]
enum KeyNode {
    Private(Xpriv),
    Public(Xpub),
}

/// A node in a BIP-32 key tree.
///
/// The private half, when present, is erased when the node is dropped.
#[derive(Clone)]
pub struct ExtendedKey {
    node: KeyNode,
}

impl ExtendedKey {
    /// Master node for a seed.
    pub fn from_seed(seed: &[u8], network: BtcNetwork) -> Result<Self, BtcError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(BtcError::Validation(format!(
                "seed must be 16..=64 bytes, got {}",
                seed.len()
            )));
        }
        let xpriv = Xpriv::new_master(network.kind(), seed)
            .map_err(|e| BtcError::Validation(format!("master key generation failed: {e}")))?;
        Ok(Self {
            node: KeyNode::Private(xpriv),
        })
    }

    pub fn from_xpriv(xpriv: Xpriv) -> Self {
        Self {
            node: KeyNode::Private(xpriv),
        }
    }

    pub fn from_xpub(xpub: Xpub) -> Self {
        Self {
            node: KeyNode::Public(xpub),
        }
    }

    pub fn has_private_key(&self) -> bool {
        matches!(self.node, KeyNode::Private(_))
    }

    /// The extended public key of this node.
    pub fn xpub(&self) -> Xpub {
        match &self.node {
            KeyNode::Private(xpriv) => Xpub::from_priv(&Secp256k1::signing_only(), xpriv),
            KeyNode::Public(xpub) => *xpub,
        }
    }

    /// Compressed public key of this node.
    pub fn public_key(&self) -> bitcoin::PublicKey {
        bitcoin::PublicKey::new(self.xpub().public_key)
    }

    pub fn chain_code(&self) -> ChainCode {
        match &self.node {
            KeyNode::Private(xpriv) => xpriv.chain_code,
            KeyNode::Public(xpub) => xpub.chain_code,
        }
    }

    pub fn depth(&self) -> u8 {
        match &self.node {
            KeyNode::Private(xpriv) => xpriv.depth,
            KeyNode::Public(xpub) => xpub.depth,
        }
    }

    pub fn parent_fingerprint(&self) -> Fingerprint {
        match &self.node {
            KeyNode::Private(xpriv) => xpriv.parent_fingerprint,
            KeyNode::Public(xpub) => xpub.parent_fingerprint,
        }
    }

    pub fn child_number(&self) -> ChildNumber {
        match &self.node {
            KeyNode::Private(xpriv) => xpriv.child_number,
            KeyNode::Public(xpub) => xpub.child_number,
        }
    }

    /// First four bytes of HASH160 of this node's public key.
    pub fn fingerprint(&self) -> Fingerprint {
        self.xpub().fingerprint()
    }

    /// Drop the private half, keeping a public-only node.
    pub fn neuter(&self) -> ExtendedKey {
        ExtendedKey::from_xpub(self.xpub())
    }

    /// Derive along a textual path.
    pub fn derive(&self, path: &str) -> Result<ExtendedKey, BtcError> {
        let parsed = parse_path(path)?;
        self.derive_path(&parsed)
    }

    /// Derive along a parsed path, one validated step at a time.
    pub fn derive_path(&self, path: &DerivationPath) -> Result<ExtendedKey, BtcError> {
        if !self.has_private_key() {
            if let Some(hardened) = path.into_iter().find(|c| c.is_hardened()) {
                return Err(BtcError::IncompatibleKey(format!(
                    "hardened step {hardened} requires a private key"
                )));
            }
        }

        let mut current = self.clone();
        for child in path {
            current = current.derive_child(*child)?;
        }
        log::debug!(
            "derived {} from depth {} to depth {}",
            format_path(path.as_ref()),
            self.depth(),
            current.depth()
        );
        Ok(current)
    }

    /// Derive a single child and check its depth and parent linkage.
    pub fn derive_child(&self, child: ChildNumber) -> Result<ExtendedKey, BtcError> {
        if self.depth() == u8::MAX {
            return Err(BtcError::InvalidPath("maximum derivation depth reached".into()));
        }

        let derived = match &self.node {
            KeyNode::Private(xpriv) => {
                let secp = Secp256k1::new();
                let next = xpriv
                    .derive_priv(&secp, &[child])
                    .map_err(|e| BtcError::Validation(format!("private derivation failed: {e}")))?;
                ExtendedKey::from_xpriv(next)
            }
            KeyNode::Public(xpub) => {
                if child.is_hardened() {
                    return Err(BtcError::IncompatibleKey(format!(
                        "hardened step {child} requires a private key"
                    )));
                }
                let secp = Secp256k1::verification_only();
                let next = xpub
                    .derive_pub(&secp, &[child])
                    .map_err(|e| BtcError::Validation(format!("public derivation failed: {e}")))?;
                ExtendedKey::from_xpub(next)
            }
        };

        if derived.depth() != self.depth() + 1
            || derived.parent_fingerprint() != self.fingerprint()
            || derived.child_number() != child
        {
            return Err(BtcError::Validation(format!(
                "derived node for {child} does not link back to its parent"
            )));
        }
        Ok(derived)
    }

    /// A zeroizing copy of the private key, or `None` for public-only nodes.
    pub fn key_material(&self) -> Option<KeyMaterial> {
        match &self.node {
            KeyNode::Private(xpriv) => {
                let mut bytes = xpriv.private_key.secret_bytes();
                Some(KeyMaterial::take(&mut bytes, true))
            }
            KeyNode::Public(_) => None,
        }
    }
}

impl Drop for ExtendedKey {
    fn drop(&mut self) {
        if let KeyNode::Private(xpriv) = &mut self.node {
            xpriv.private_key.non_secure_erase();
        }
    }
}

impl fmt::Debug for ExtendedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedKey")
            .field("public_key", &self.public_key())
            .field("depth", &self.depth())
            .field("parent_fingerprint", &self.parent_fingerprint())
            .field("child_number", &self.child_number())
            .field("has_private_key", &self.has_private_key())
            .finish()
    }
}
