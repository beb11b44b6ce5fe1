//! Transaction size and fee estimation.
//!
//! Sizes are tracked as non-witness and witness bytes separately so that
//! weight = base×4 + witness = base×3 + total, and vsize = ceil(weight / 4).

use bitcoin::{Amount, Script};

use crate::error::BtcError;
use crate::multisig::MultisigConfig;
use crate::script_type::ScriptType;

/// DER signature upper bound plus the sighash byte.
const SIGNATURE_LEN: u64 = 72;
const COMPRESSED_KEY_LEN: u64 = 33;
/// Extra scriptSig bytes when a P2PKH input reveals a 65-byte key.
pub const UNCOMPRESSED_KEY_EXTRA: u64 = 32;
/// txid + vout + sequence.
const OUTPOINT_AND_SEQUENCE: u64 = 36 + 4;
/// version + locktime.
const TX_FIXED: u64 = 4 + 4;
/// Segwit marker and flag bytes, counted as witness data.
const SEGWIT_MARKER: u64 = 2;

/// Serialized size of a transaction component, split by witness discount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxSize {
    pub base: u64,
    pub witness: u64,
}

impl TxSize {
    pub fn weight(&self) -> u64 {
        self.base * 4 + self.witness
    }

    pub fn vsize(&self) -> u64 {
        self.weight().div_ceil(4)
    }
}

impl std::ops::Add for TxSize {
    type Output = TxSize;

    fn add(self, rhs: TxSize) -> TxSize {
        TxSize {
            base: self.base + rhs.base,
            witness: self.witness + rhs.witness,
        }
    }
}

fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Opcode bytes needed to push `len` bytes of data.
fn push_len(len: u64) -> u64 {
    match len {
        0..=75 => 1,
        76..=255 => 2,
        256..=65535 => 3,
        _ => 5,
    }
}

fn multisig_script_len(total: u8) -> u64 {
    // OP_m, n × (push + key), OP_n, OP_CHECKMULTISIG
    3 + u64::from(total) * (1 + COMPRESSED_KEY_LEN)
}

/// Witness stack for `OP_0 <sig>… <witness script>`.
fn multisig_witness(config: &MultisigConfig) -> u64 {
    let required = u64::from(config.required());
    let script = multisig_script_len(config.total());
    varint_len(required + 2) + 1 + required * (1 + SIGNATURE_LEN) + varint_len(script) + script
}

fn single_sig_witness() -> u64 {
    1 + (1 + SIGNATURE_LEN) + (1 + COMPRESSED_KEY_LEN)
}

/// Size of one input spending an output of `script_type`.
///
/// Multisig types need `config`; single-key types must not have one.
pub fn input_size(script_type: ScriptType, config: Option<&MultisigConfig>) -> Result<TxSize, BtcError> {
    let with_script_sig = |len: u64| OUTPOINT_AND_SEQUENCE + varint_len(len) + len;

    let size = match (script_type, config) {
        (ScriptType::Legacy, None) => {
            let script_sig = (1 + SIGNATURE_LEN) + (1 + COMPRESSED_KEY_LEN);
            TxSize { base: with_script_sig(script_sig), witness: 0 }
        }
        (ScriptType::SegWitWrapped, None) => TxSize {
            base: with_script_sig(1 + 22),
            witness: single_sig_witness(),
        },
        (ScriptType::NativeSegWit, None) => TxSize {
            base: with_script_sig(0),
            witness: single_sig_witness(),
        },
        (ScriptType::MultisigP2SH, Some(config)) => {
            let script = multisig_script_len(config.total());
            let script_sig = 1
                + u64::from(config.required()) * (1 + SIGNATURE_LEN)
                + push_len(script)
                + script;
            TxSize { base: with_script_sig(script_sig), witness: 0 }
        }
        (ScriptType::MultisigP2WSH, Some(config)) => TxSize {
            base: with_script_sig(0),
            witness: multisig_witness(config),
        },
        (ScriptType::MultisigP2SHWrapped, Some(config)) => TxSize {
            base: with_script_sig(1 + 34),
            witness: multisig_witness(config),
        },
        (ScriptType::Legacy | ScriptType::SegWitWrapped | ScriptType::NativeSegWit, Some(_)) => {
            return Err(BtcError::Validation(format!(
                "{script_type} inputs do not take a multisig config"
            )))
        }
        (ScriptType::MultisigP2SH | ScriptType::MultisigP2WSH | ScriptType::MultisigP2SHWrapped, None) => {
            return Err(BtcError::Validation(format!(
                "{script_type} inputs need a multisig config to be sized"
            )))
        }
    };
    Ok(size)
}

/// Size of an output paying to `script_pubkey`.
pub fn output_size(script_pubkey: &Script) -> TxSize {
    let len = script_pubkey.len() as u64;
    TxSize { base: 8 + varint_len(len) + len, witness: 0 }
}

/// Size of a whole transaction from its inputs and outputs.
pub fn transaction_size(inputs: &[TxSize], outputs: &[TxSize]) -> TxSize {
    let has_witness = inputs.iter().any(|i| i.witness > 0);
    let overhead = TxSize {
        base: TX_FIXED + varint_len(inputs.len() as u64) + varint_len(outputs.len() as u64),
        witness: if has_witness { SEGWIT_MARKER } else { 0 },
    };
    let mut total = overhead;
    for part in inputs.iter().chain(outputs) {
        total = total + *part;
    }
    // Non-witness inputs in a witness transaction still carry an empty stack.
    if has_witness {
        total.witness += inputs.iter().filter(|i| i.witness == 0).count() as u64;
    }
    total
}

/// Reject fee rates that are negative, NaN or infinite.
pub fn validate_fee_rate(fee_rate: f64) -> Result<(), BtcError> {
    if !fee_rate.is_finite() || fee_rate < 0.0 {
        return Err(BtcError::Validation(format!(
            "fee rate must be a finite, non-negative sat/vB value, got {fee_rate}"
        )));
    }
    Ok(())
}

/// Converts virtual sizes into fees, never going below the relay floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeCalculator {
    min_relay_fee_rate: f64,
}

impl FeeCalculator {
    pub fn new(min_relay_fee_rate: f64) -> Result<Self, BtcError> {
        validate_fee_rate(min_relay_fee_rate)?;
        Ok(Self { min_relay_fee_rate })
    }

    pub fn min_relay_fee_rate(&self) -> f64 {
        self.min_relay_fee_rate
    }

    /// Smallest fee relay policy accepts for `vsize`.
    pub fn min_relay_fee(&self, vsize: u64) -> u64 {
        (vsize as f64 * self.min_relay_fee_rate).ceil() as u64
    }

    /// `ceil(vsize × fee_rate)`, floored at the relay minimum. Fees above the
    /// total money supply are rejected.
    pub fn fee_for_vsize(&self, vsize: u64, fee_rate: f64) -> Result<u64, BtcError> {
        validate_fee_rate(fee_rate)?;
        let fee = (vsize as f64 * fee_rate)
            .ceil()
            .max((vsize as f64 * self.min_relay_fee_rate).ceil());
        if fee > Amount::MAX_MONEY.to_sat() as f64 {
            return Err(BtcError::Validation(format!(
                "fee rate {fee_rate} sat/vB puts the fee for {vsize} vB above the money supply"
            )));
        }
        Ok(fee as u64)
    }

    pub fn fee_for(&self, size: TxSize, fee_rate: f64) -> Result<u64, BtcError> {
        self.fee_for_vsize(size.vsize(), fee_rate)
    }
}
