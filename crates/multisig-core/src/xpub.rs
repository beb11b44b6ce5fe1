//! Extended public key strings with script-type prefixes (SLIP-132 style).
//!
//! The 4-byte version at the front of a serialized key encodes both the
//! network and the script type the key is meant for. Internally everything is
//! normalized to plain `xpub`/`tpub` versions before handing the bytes to the
//! `bitcoin` crate.

use bitcoin::bip32::Xpub;
use bitcoin::NetworkKind;

use crate::error::BtcError;
use crate::network::BtcNetwork;
use crate::script_type::ScriptType;

const MAINNET_XPUB: [u8; 4] = [0x04, 0x88, 0xB2, 0x1E];
const TESTNET_TPUB: [u8; 4] = [0x04, 0x35, 0x87, 0xCF];

struct KeyPrefix {
    name: &'static str,
    version: [u8; 4],
    kind: NetworkKind,
    script_type: ScriptType,
}

const PREFIXES: [KeyPrefix; 12] = [
    KeyPrefix {
        name: "xpub",
        version: MAINNET_XPUB,
        kind: NetworkKind::Main,
        script_type: ScriptType::Legacy,
    },
    KeyPrefix {
        name: "tpub",
        version: TESTNET_TPUB,
        kind: NetworkKind::Test,
        script_type: ScriptType::Legacy,
    },
    KeyPrefix {
        name: "ypub",
        version: [0x04, 0x9D, 0x7C, 0xB2],
        kind: NetworkKind::Main,
        script_type: ScriptType::SegWitWrapped,
    },
    KeyPrefix {
        name: "upub",
        version: [0x04, 0x4A, 0x52, 0x62],
        kind: NetworkKind::Test,
        script_type: ScriptType::SegWitWrapped,
    },
    KeyPrefix {
        name: "zpub",
        version: [0x04, 0xB2, 0x47, 0x46],
        kind: NetworkKind::Main,
        script_type: ScriptType::NativeSegWit,
    },
    KeyPrefix {
        name: "vpub",
        version: [0x04, 0x5F, 0x1C, 0xF6],
        kind: NetworkKind::Test,
        script_type: ScriptType::NativeSegWit,
    },
    KeyPrefix {
        name: "Xpub",
        version: [0x02, 0x80, 0xE9, 0xAB],
        kind: NetworkKind::Main,
        script_type: ScriptType::MultisigP2SH,
    },
    KeyPrefix {
        name: "Tpub",
        version: [0x02, 0x2D, 0xBF, 0x5B],
        kind: NetworkKind::Test,
        script_type: ScriptType::MultisigP2SH,
    },
    KeyPrefix {
        name: "Ypub",
        version: [0x02, 0x95, 0xB4, 0x3F],
        kind: NetworkKind::Main,
        script_type: ScriptType::MultisigP2WSH,
    },
    KeyPrefix {
        name: "Upub",
        version: [0x02, 0x42, 0x89, 0xEF],
        kind: NetworkKind::Test,
        script_type: ScriptType::MultisigP2WSH,
    },
    KeyPrefix {
        name: "Zpub",
        version: [0x02, 0xAA, 0x7E, 0xD3],
        kind: NetworkKind::Main,
        script_type: ScriptType::MultisigP2SHWrapped,
    },
    KeyPrefix {
        name: "Vpub",
        version: [0x02, 0x57, 0x54, 0x83],
        kind: NetworkKind::Test,
        script_type: ScriptType::MultisigP2SHWrapped,
    },
];

/// An extended public key together with what its prefix declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedXpub {
    pub xpub: Xpub,
    pub kind: NetworkKind,
    pub script_type: ScriptType,
    pub prefix: &'static str,
}

fn kind_name(kind: NetworkKind) -> &'static str {
    match kind {
        NetworkKind::Main => "mainnet",
        NetworkKind::Test => "testnet",
    }
}

/// Decode any supported extended public key string.
pub fn decode_xpub(encoded: &str) -> Result<DecodedXpub, BtcError> {
    let mut data = bs58::decode(encoded.trim())
        .with_check(None)
        .into_vec()
        .map_err(|e| BtcError::Validation(format!("invalid extended key encoding: {e}")))?;
    if data.len() != 78 {
        return Err(BtcError::Validation(format!(
            "extended key payload must be 78 bytes, got {}",
            data.len()
        )));
    }

    let prefix = PREFIXES
        .iter()
        .find(|p| p.version[..] == data[..4])
        .ok_or_else(|| {
            BtcError::Validation(format!(
                "unsupported extended key version {}",
                hex::encode(&data[..4])
            ))
        })?;

    let standard = match prefix.kind {
        NetworkKind::Main => MAINNET_XPUB,
        NetworkKind::Test => TESTNET_TPUB,
    };
    data[..4].copy_from_slice(&standard);

    let xpub = Xpub::decode(&data)
        .map_err(|e| BtcError::Validation(format!("invalid extended public key: {e}")))?;

    Ok(DecodedXpub {
        xpub,
        kind: prefix.kind,
        script_type: prefix.script_type,
        prefix: prefix.name,
    })
}

/// Decode and require the key to belong to `network`.
pub fn decode_xpub_for(encoded: &str, network: BtcNetwork) -> Result<DecodedXpub, BtcError> {
    let decoded = decode_xpub(encoded)?;
    if decoded.kind != network.kind() {
        return Err(BtcError::NetworkMismatch {
            expected: network.to_string(),
            found: format!("{} key ({})", kind_name(decoded.kind), decoded.prefix),
        });
    }
    Ok(decoded)
}

/// Encode `xpub` with the prefix conventional for `script_type` on `network`.
pub fn encode_xpub(xpub: &Xpub, script_type: ScriptType, network: BtcNetwork) -> String {
    let kind = network.kind();
    let version = PREFIXES
        .iter()
        .find(|p| p.kind == kind && p.script_type == script_type)
        .map(|p| p.version)
        .unwrap_or(match kind {
            NetworkKind::Main => MAINNET_XPUB,
            NetworkKind::Test => TESTNET_TPUB,
        });

    let mut data = xpub.encode();
    data[..4].copy_from_slice(&version);
    bs58::encode(data).with_check().into_string()
}
