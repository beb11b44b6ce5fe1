//! # crypto-utils
//!
//! Memory-safety helpers for secret material handled by the signing engine:
//! private keys borrowed from a key provider and seeds held while unlocked.

pub mod error;
pub mod zeroizing;

pub use error::CryptoError;
pub use zeroizing::{KeyMaterial, SeedBytes};
