//! Canonical public key ordering for multisig scripts (BIP-67).
//!
//! Every cosigner sorts the same key set the same way, so they all end up with
//! one script and one address without coordinating on key order.

use bitcoin::PublicKey;

use crate::error::BtcError;

/// Parse and validate a serialized secp256k1 public key.
///
/// Only 33-byte compressed (`02`/`03`) and 65-byte uncompressed (`04`) forms
/// are accepted; hybrid encodings and off-curve points are rejected.
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, BtcError> {
    match (bytes.len(), bytes.first()) {
        (33, Some(0x02 | 0x03)) | (65, Some(0x04)) => {}
        (len, prefix) => {
            return Err(BtcError::Validation(format!(
                "public key must be 33 bytes (02/03) or 65 bytes (04), got {len} bytes with prefix {}",
                prefix.map(|p| format!("{p:02x}")).unwrap_or_else(|| "none".into())
            )))
        }
    }
    PublicKey::from_slice(bytes)
        .map_err(|e| BtcError::Validation(format!("public key is not on the curve: {e}")))
}

/// Sort public keys lexicographically by their serialized bytes.
///
/// Fails with [`BtcError::DuplicateKey`] if the same point appears twice, in
/// either encoding.
pub fn sort_public_keys(keys: &[PublicKey]) -> Result<Vec<PublicKey>, BtcError> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|k| k.to_bytes());

    let mut points: Vec<_> = keys.iter().map(|k| k.inner.serialize()).collect();
    points.sort_unstable();
    if let Some(pair) = points.windows(2).find(|w| w[0] == w[1]) {
        return Err(BtcError::DuplicateKey(hex::encode(pair[0])));
    }

    Ok(sorted)
}

/// Validate raw serialized keys, then sort them.
pub fn sort_raw_keys<B: AsRef<[u8]>>(keys: &[B]) -> Result<Vec<PublicKey>, BtcError> {
    let parsed = keys
        .iter()
        .map(|k| parse_public_key(k.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;
    sort_public_keys(&parsed)
}
