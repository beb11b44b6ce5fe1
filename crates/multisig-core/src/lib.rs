//! Multisig Bitcoin transaction engine.
//!
//! Derives single-sig and M-of-N multisig addresses from extended public
//! keys, selects coins, builds PSBTs, and coordinates signatures between
//! cosigners until a transaction can be finalized. Signing keys come from a
//! caller-supplied [`signer::KeyProvider`]; nothing here touches the network.

pub mod account;
pub mod address;
pub mod derivation;
pub mod error;
pub mod fee;
pub mod key_sort;
pub mod multisig;
pub mod network;
pub mod pending;
pub mod policy;
pub mod psbt;
pub mod script_type;
pub mod signer;
pub mod spend;
pub mod transaction;
pub mod utxo;
pub mod xpub;

#[cfg(test)]
mod test_support;

pub use account::Account;
pub use error::BtcError;
pub use multisig::{Cosigner, MultisigConfig};
pub use network::BtcNetwork;
pub use policy::EnginePolicy;
pub use script_type::ScriptType;
