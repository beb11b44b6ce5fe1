use bitcoin::address::{Address, NetworkUnchecked};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction, Script, ScriptBuf};
use bitcoin::{CompressedPublicKey, PublicKey};

use crate::error::BtcError;
use crate::key_sort::{parse_public_key, sort_public_keys};
use crate::multisig::MultisigConfig;
use crate::network::BtcNetwork;
use crate::script_type::ScriptType;

/// A derived address and the scripts needed to spend from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressOutput {
    pub address: String,
    pub script_pubkey: ScriptBuf,
    /// P2SH redeem script (the multisig script itself, or a witness program).
    pub redeem_script: Option<ScriptBuf>,
    /// P2WSH witness script.
    pub witness_script: Option<ScriptBuf>,
}

impl AddressOutput {
    fn new(address: Address, redeem_script: Option<ScriptBuf>, witness_script: Option<ScriptBuf>) -> Self {
        Self {
            script_pubkey: address.script_pubkey(),
            address: address.to_string(),
            redeem_script,
            witness_script,
        }
    }
}

/// Derive the address for `keys` under `script_type`.
///
/// Single-sig types take exactly one key and no config; multisig types take
/// the full cosigner key set (in any order) plus a config of the same type.
pub fn derive_address(
    keys: &[PublicKey],
    config: Option<&MultisigConfig>,
    script_type: ScriptType,
    network: BtcNetwork,
) -> Result<AddressOutput, BtcError> {
    match script_type {
        ScriptType::Legacy | ScriptType::SegWitWrapped | ScriptType::NativeSegWit => {
            if config.is_some() {
                return Err(BtcError::Validation(format!(
                    "{script_type} does not take a multisig config"
                )));
            }
            match keys {
                [key] => single_sig_address(key, script_type, network),
                _ => Err(BtcError::Validation(format!(
                    "{script_type} needs exactly one key, got {}",
                    keys.len()
                ))),
            }
        }
        ScriptType::MultisigP2SH | ScriptType::MultisigP2WSH | ScriptType::MultisigP2SHWrapped => {
            let config = config.ok_or_else(|| {
                BtcError::Validation(format!("{script_type} requires a multisig config"))
            })?;
            if config.script_type() != script_type {
                return Err(BtcError::Validation(format!(
                    "config is {} but {script_type} was requested",
                    config.script_type()
                )));
            }
            multisig_address(keys, config, network)
        }
    }
}

fn require_compressed(key: &PublicKey, script_type: ScriptType) -> Result<CompressedPublicKey, BtcError> {
    if !key.compressed {
        return Err(BtcError::IncompatibleKey(format!(
            "uncompressed key {key} cannot be used with {script_type}"
        )));
    }
    Ok(CompressedPublicKey(key.inner))
}

/// Single-key address: P2PKH, P2SH-P2WPKH or P2WPKH.
pub fn single_sig_address(
    key: &PublicKey,
    script_type: ScriptType,
    network: BtcNetwork,
) -> Result<AddressOutput, BtcError> {
    let net = network.to_bitcoin_network();
    let output = match script_type {
        ScriptType::Legacy => AddressOutput::new(Address::p2pkh(key.pubkey_hash(), net), None, None),
        ScriptType::SegWitWrapped => {
            let compressed = require_compressed(key, script_type)?;
            let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
            AddressOutput::new(Address::p2shwpkh(&compressed, net), Some(redeem), None)
        }
        ScriptType::NativeSegWit => {
            let compressed = require_compressed(key, script_type)?;
            AddressOutput::new(Address::p2wpkh(&compressed, net), None, None)
        }
        ScriptType::MultisigP2SH | ScriptType::MultisigP2WSH | ScriptType::MultisigP2SHWrapped => {
            return Err(BtcError::Validation(format!(
                "{script_type} is not a single-key script type"
            )))
        }
    };
    Ok(output)
}

/// `OP_m <key>… OP_n OP_CHECKMULTISIG` over keys in the given order.
pub fn multisig_script(required: u8, keys: &[PublicKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(i64::from(required));
    for key in keys {
        builder = builder.push_key(key);
    }
    builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// M-of-N address over the BIP-67 sorted key set.
pub fn multisig_address(
    keys: &[PublicKey],
    config: &MultisigConfig,
    network: BtcNetwork,
) -> Result<AddressOutput, BtcError> {
    if keys.len() != usize::from(config.total()) {
        return Err(BtcError::Validation(format!(
            "{} keys supplied for a {config} wallet",
            keys.len()
        )));
    }
    let sorted = sort_public_keys(keys)?;
    let script_type = config.script_type();
    if script_type.is_segwit() {
        if let Some(key) = sorted.iter().find(|k| !k.compressed) {
            return Err(BtcError::IncompatibleKey(format!(
                "uncompressed key {key} cannot be used with {script_type}"
            )));
        }
    }

    let script = multisig_script(config.required(), &sorted);
    let net = network.to_bitcoin_network();
    let output = match script_type {
        ScriptType::MultisigP2SH => {
            let address = Address::p2sh(&script, net)
                .map_err(|e| BtcError::Validation(format!("redeem script too large: {e}")))?;
            AddressOutput::new(address, Some(script), None)
        }
        ScriptType::MultisigP2WSH => AddressOutput::new(Address::p2wsh(&script, net), None, Some(script)),
        ScriptType::MultisigP2SHWrapped => {
            let redeem = ScriptBuf::new_p2wsh(&script.wscript_hash());
            AddressOutput::new(Address::p2shwsh(&script, net), Some(redeem), Some(script))
        }
        ScriptType::Legacy | ScriptType::SegWitWrapped | ScriptType::NativeSegWit => {
            return Err(BtcError::Validation(format!(
                "{script_type} is not a multisig script type"
            )))
        }
    };
    log::debug!("derived {config} address {}", output.address);
    Ok(output)
}

fn small_int(instruction: &Instruction<'_>) -> Option<u8> {
    match instruction {
        Instruction::Op(op) => match op.to_u8() {
            n @ 0x51..=0x60 => Some(n - 0x50),
            _ => None,
        },
        Instruction::PushBytes(_) => None,
    }
}

/// Recognize a bare multisig script, returning `(m, keys)` in script order.
pub fn parse_multisig_script(script: &Script) -> Option<(u8, Vec<PublicKey>)> {
    let instructions: Vec<Instruction<'_>> = script.instructions().collect::<Result<_, _>>().ok()?;
    let (last, body) = instructions.split_last()?;
    if !matches!(last, Instruction::Op(op) if *op == OP_CHECKMULTISIG) || body.len() < 3 {
        return None;
    }
    let required = small_int(&body[0])?;
    let total = small_int(&body[body.len() - 1])?;

    let mut keys = Vec::with_capacity(body.len() - 2);
    for instruction in &body[1..body.len() - 1] {
        match instruction {
            Instruction::PushBytes(bytes) => keys.push(parse_public_key(bytes.as_bytes()).ok()?),
            Instruction::Op(_) => return None,
        }
    }
    if keys.len() != usize::from(total) || required == 0 || required > total {
        return None;
    }
    Some((required, keys))
}

/// Parse an address and require it to belong to `network`.
pub fn parse_address(address: &str, network: BtcNetwork) -> Result<Address, BtcError> {
    let parsed = address
        .trim()
        .parse::<Address<NetworkUnchecked>>()
        .map_err(|e| BtcError::Validation(format!("invalid address {address:?}: {e}")))?;
    if !parsed.is_valid_for_network(network.to_bitcoin_network()) {
        return Err(BtcError::NetworkMismatch {
            expected: network.to_string(),
            found: format!("address {address}"),
        });
    }
    Ok(parsed.assume_checked())
}

/// Validate a Bitcoin address string for the given network.
///
/// Returns `true` if the address is valid for the specified network,
/// `false` if it is valid but for a different network.
pub fn validate_address(address: &str, network: BtcNetwork) -> Result<bool, BtcError> {
    match parse_address(address, network) {
        Ok(_) => Ok(true),
        Err(BtcError::NetworkMismatch { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const G_COMPRESSED: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const G_UNCOMPRESSED: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";

    // Keys at m/48'/1'/0'/1'/0/0 of three BIP-39 test mnemonics, already sorted.
    const COSIGNER_KEYS: [&str; 3] = [
        "0267ea4562439356307e786faf40503730d8d95a203a0e345cb355a5dfa03fce03",
        "02e318c7e129222b2ff61d467e121efbd905338e1651b3d1ce54472845f8441f13",
        "03b622704a7856c6db505e38d237b0680d00a4321a2038de80f5ba5f00c007dba1",
    ];

    fn key(hex_str: &str) -> PublicKey {
        parse_public_key(&hex::decode(hex_str).unwrap()).unwrap()
    }

    fn cosigners() -> Vec<PublicKey> {
        COSIGNER_KEYS.iter().map(|k| key(k)).collect()
    }

    #[test]
    fn generator_point_single_sig_vectors() {
        let g = key(G_COMPRESSED);
        let net = BtcNetwork::Mainnet;
        assert_eq!(
            single_sig_address(&g, ScriptType::Legacy, net).unwrap().address,
            "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH"
        );
        let wrapped = single_sig_address(&g, ScriptType::SegWitWrapped, net).unwrap();
        assert_eq!(wrapped.address, "3JvL6Ymt8MVWiCNHC7oWU6nLeHNJKLZGLN");
        assert!(wrapped.redeem_script.unwrap().is_p2wpkh());
        assert_eq!(
            single_sig_address(&g, ScriptType::NativeSegWit, net).unwrap().address,
            "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
        );
    }

    #[test]
    fn uncompressed_key_legacy_only() {
        let g = key(G_UNCOMPRESSED);
        let legacy = derive_address(&[g], None, ScriptType::Legacy, BtcNetwork::Mainnet).unwrap();
        assert_eq!(legacy.address, "1EHNa6Q4Jz2uvNExL497mE43ikXhwF6kZm");

        for script_type in [ScriptType::NativeSegWit, ScriptType::SegWitWrapped] {
            let err = derive_address(&[g], None, script_type, BtcNetwork::Mainnet).unwrap_err();
            assert!(matches!(err, BtcError::IncompatibleKey(_)), "{script_type}");
        }
    }

    #[test]
    fn bip67_two_of_two_p2sh_vector() {
        let keys = [
            key("02ff12471208c14bd580709cb2358d98975247d8765f92bc25eab3b2763ed605f8"),
            key("02fe6f0a5a297eb38c391581c4413e084773ea23954d93f7753db7dc0adc188b2f"),
        ];
        let config = MultisigConfig::new(2, 2, ScriptType::MultisigP2SH).unwrap();
        let out = multisig_address(&keys, &config, BtcNetwork::Mainnet).unwrap();
        assert_eq!(out.address, "39bgKC7RFbpoCRbtD5KEdkYKtNyhpsNa3Z");

        let reversed = [keys[1], keys[0]];
        assert_eq!(multisig_address(&reversed, &config, BtcNetwork::Mainnet).unwrap(), out);
    }

    #[test]
    fn two_of_three_variants_on_testnet() {
        let keys = cosigners();
        let cases = [
            (ScriptType::MultisigP2SHWrapped, "2NDmxKMgxHG8m3G6w9sikcT9KGrA7Bsjgxs"),
            (ScriptType::MultisigP2WSH, "tb1qurwz75m9w0ngstesntv4r3jamlclp9ae99vachjfnj9tzgeqs02s05h8y5"),
            (ScriptType::MultisigP2SH, "2MsezPBMCxnoBirzkWsdn4dkngiAnM4iFiL"),
        ];
        for (script_type, expected) in cases {
            let config = MultisigConfig::new(2, 3, script_type).unwrap();
            let out = derive_address(&keys, Some(&config), script_type, BtcNetwork::Testnet).unwrap();
            assert_eq!(out.address, expected, "{script_type}");
        }
    }

    #[test]
    fn wrapped_multisig_carries_both_scripts() {
        let config = MultisigConfig::new(2, 3, ScriptType::MultisigP2SHWrapped).unwrap();
        let out = multisig_address(&cosigners(), &config, BtcNetwork::Testnet).unwrap();
        let witness = out.witness_script.unwrap();
        assert_eq!(
            hex::encode(witness.as_bytes()),
            format!("5221{}21{}21{}53ae", COSIGNER_KEYS[0], COSIGNER_KEYS[1], COSIGNER_KEYS[2])
        );
        let redeem = out.redeem_script.unwrap();
        assert!(redeem.is_p2wsh());
        assert!(out.script_pubkey.is_p2sh());
    }

    #[test]
    fn independent_derivations_are_identical() {
        let config = MultisigConfig::new(2, 3, ScriptType::MultisigP2WSH).unwrap();
        let mut shuffled = cosigners();
        shuffled.rotate_left(1);
        let a = multisig_address(&cosigners(), &config, BtcNetwork::Testnet).unwrap();
        let b = multisig_address(&shuffled, &config, BtcNetwork::Testnet).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn uncompressed_key_rejected_for_witness_multisig() {
        let keys = [key(G_UNCOMPRESSED), key(COSIGNER_KEYS[0])];
        let p2wsh = MultisigConfig::new(1, 2, ScriptType::MultisigP2WSH).unwrap();
        assert!(matches!(
            multisig_address(&keys, &p2wsh, BtcNetwork::Testnet).unwrap_err(),
            BtcError::IncompatibleKey(_)
        ));
        let p2sh = MultisigConfig::new(1, 2, ScriptType::MultisigP2SH).unwrap();
        assert!(multisig_address(&keys, &p2sh, BtcNetwork::Testnet).is_ok());
    }

    #[test]
    fn key_count_must_match_config() {
        let config = MultisigConfig::new(2, 3, ScriptType::MultisigP2WSH).unwrap();
        let err = multisig_address(&cosigners()[..2], &config, BtcNetwork::Testnet).unwrap_err();
        assert!(matches!(err, BtcError::Validation(_)));
    }

    #[test]
    fn mismatched_config_and_type_rejected() {
        let config = MultisigConfig::new(2, 3, ScriptType::MultisigP2WSH).unwrap();
        assert!(derive_address(&cosigners(), Some(&config), ScriptType::MultisigP2SH, BtcNetwork::Testnet).is_err());
        assert!(derive_address(&cosigners(), None, ScriptType::MultisigP2WSH, BtcNetwork::Testnet).is_err());
        assert!(derive_address(&cosigners(), None, ScriptType::NativeSegWit, BtcNetwork::Testnet).is_err());
    }

    #[test]
    fn multisig_script_parses_back() {
        let keys = cosigners();
        let script = multisig_script(2, &keys);
        let (m, parsed) = parse_multisig_script(&script).unwrap();
        assert_eq!(m, 2);
        assert_eq!(parsed, keys);
    }

    #[test]
    fn non_multisig_scripts_not_recognized() {
        let g = key(G_COMPRESSED);
        let p2wpkh = single_sig_address(&g, ScriptType::NativeSegWit, BtcNetwork::Mainnet).unwrap();
        assert!(parse_multisig_script(&p2wpkh.script_pubkey).is_none());
        assert!(parse_multisig_script(Script::new()).is_none());
    }

    #[test]
    fn parse_address_reports_network_mismatch() {
        let err = parse_address("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", BtcNetwork::Testnet).unwrap_err();
        assert!(matches!(err, BtcError::NetworkMismatch { .. }));
        assert!(matches!(
            parse_address("notanaddress!!!", BtcNetwork::Mainnet).unwrap_err(),
            BtcError::Validation(_)
        ));
    }

    #[test]
    fn validate_address_flags_other_network() {
        assert!(validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", BtcNetwork::Mainnet).unwrap());
        assert!(!validate_address("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", BtcNetwork::Testnet).unwrap());
        assert!(validate_address("garbage", BtcNetwork::Mainnet).is_err());
    }
}
