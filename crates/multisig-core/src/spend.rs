//! What a PSBT input spends, worked out from its previous output and the
//! scripts attached to it.

use bitcoin::hashes::Hash;
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::script::{Instruction, Script};
use bitcoin::{CompressedPublicKey, PublicKey, ScriptBuf, Transaction, TxOut};

use crate::address::parse_multisig_script;
use crate::error::BtcError;
use crate::script_type::ScriptType;

/// A classified input, with every script checked against its commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendInfo {
    pub script_type: ScriptType,
    pub prevout: TxOut,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    /// Threshold and keys, in script order, for multisig inputs.
    pub multisig: Option<(u8, Vec<PublicKey>)>,
}

fn structural(index: usize, msg: impl std::fmt::Display) -> BtcError {
    BtcError::StructuralPsbt(format!("input {index}: {msg}"))
}

/// Previous output of input `index`, from `witness_utxo` or the full
/// previous transaction.
pub fn previous_output(psbt: &Psbt, index: usize) -> Result<TxOut, BtcError> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| structural(index, "no such input"))?;
    let outpoint = psbt
        .unsigned_tx
        .input
        .get(index)
        .ok_or_else(|| structural(index, "no such input"))?
        .previous_output;

    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.clone());
    }
    if let Some(prev_tx) = &input.non_witness_utxo {
        if prev_tx.compute_txid() != outpoint.txid {
            return Err(structural(index, "previous transaction does not match the outpoint"));
        }
        return prev_tx
            .output
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or_else(|| structural(index, format!("previous transaction has no output {}", outpoint.vout)));
    }
    Err(structural(index, "missing previous output data"))
}

fn multisig_of(index: usize, script: &ScriptBuf) -> Result<(u8, Vec<PublicKey>), BtcError> {
    parse_multisig_script(script).ok_or_else(|| structural(index, "script is not a multisig script"))
}

impl SpendInfo {
    pub fn from_input(psbt: &Psbt, index: usize) -> Result<Self, BtcError> {
        let prevout = previous_output(psbt, index)?;
        let input = &psbt.inputs[index];
        let spk = &prevout.script_pubkey;

        let checked_witness_script = |program: &ScriptBuf| -> Result<ScriptBuf, BtcError> {
            let ws = input
                .witness_script
                .clone()
                .ok_or_else(|| structural(index, "missing witness script"))?;
            if ScriptBuf::new_p2wsh(&ws.wscript_hash()) != *program {
                return Err(structural(index, "witness script does not match its commitment"));
            }
            Ok(ws)
        };

        let info = if spk.is_p2pkh() {
            Self::single(ScriptType::Legacy, prevout, None)
        } else if spk.is_p2wpkh() {
            Self::single(ScriptType::NativeSegWit, prevout, None)
        } else if spk.is_p2wsh() {
            let ws = checked_witness_script(spk)?;
            let multisig = multisig_of(index, &ws)?;
            SpendInfo {
                script_type: ScriptType::MultisigP2WSH,
                prevout,
                redeem_script: None,
                witness_script: Some(ws),
                multisig: Some(multisig),
            }
        } else if spk.is_p2sh() {
            let redeem = input
                .redeem_script
                .clone()
                .ok_or_else(|| structural(index, "missing redeem script"))?;
            if ScriptBuf::new_p2sh(&redeem.script_hash()) != *spk {
                return Err(structural(index, "redeem script does not match its commitment"));
            }
            if redeem.is_p2wpkh() {
                Self::single(ScriptType::SegWitWrapped, prevout, Some(redeem))
            } else if redeem.is_p2wsh() {
                let ws = checked_witness_script(&redeem)?;
                let multisig = multisig_of(index, &ws)?;
                SpendInfo {
                    script_type: ScriptType::MultisigP2SHWrapped,
                    prevout,
                    redeem_script: Some(redeem),
                    witness_script: Some(ws),
                    multisig: Some(multisig),
                }
            } else {
                let multisig = multisig_of(index, &redeem)?;
                SpendInfo {
                    script_type: ScriptType::MultisigP2SH,
                    prevout,
                    redeem_script: Some(redeem),
                    witness_script: None,
                    multisig: Some(multisig),
                }
            }
        } else {
            return Err(structural(index, "unsupported previous output script"));
        };
        Ok(info)
    }

    fn single(script_type: ScriptType, prevout: TxOut, redeem_script: Option<ScriptBuf>) -> Self {
        SpendInfo {
            script_type,
            prevout,
            redeem_script,
            witness_script: None,
            multisig: None,
        }
    }

    pub fn required_signatures(&self) -> usize {
        self.multisig.as_ref().map_or(1, |(m, _)| usize::from(*m))
    }

    /// Position of `key` among the keys this input can be signed with.
    pub fn key_position(&self, key: &PublicKey) -> Option<usize> {
        match self.script_type {
            ScriptType::Legacy => {
                (self.prevout.script_pubkey == ScriptBuf::new_p2pkh(&key.pubkey_hash())).then_some(0)
            }
            ScriptType::NativeSegWit => wpkh_script(key)
                .filter(|s| *s == self.prevout.script_pubkey)
                .map(|_| 0),
            ScriptType::SegWitWrapped => wpkh_script(key)
                .filter(|s| Some(s) == self.redeem_script.as_ref())
                .map(|_| 0),
            ScriptType::MultisigP2SH | ScriptType::MultisigP2WSH | ScriptType::MultisigP2SHWrapped => self
                .multisig
                .as_ref()
                .and_then(|(_, keys)| keys.iter().position(|k| k == key)),
        }
    }

    pub fn involves(&self, key: &PublicKey) -> bool {
        self.key_position(key).is_some()
    }

    /// Signature hash of input `index` for `sighash_type`.
    pub fn sighash(
        &self,
        cache: &mut SighashCache<&Transaction>,
        index: usize,
        sighash_type: EcdsaSighashType,
    ) -> Result<Message, BtcError> {
        let signing = |e: &dyn std::fmt::Display| BtcError::Signing(format!("input {index}: sighash failed: {e}"));
        let value = self.prevout.value;

        let digest = match self.script_type {
            ScriptType::Legacy => cache
                .legacy_signature_hash(index, &self.prevout.script_pubkey, sighash_type.to_u32())
                .map_err(|e| signing(&e))?
                .to_byte_array(),
            ScriptType::MultisigP2SH => {
                let redeem = self.redeem_script.as_ref().ok_or_else(|| structural(index, "missing redeem script"))?;
                cache
                    .legacy_signature_hash(index, redeem, sighash_type.to_u32())
                    .map_err(|e| signing(&e))?
                    .to_byte_array()
            }
            ScriptType::NativeSegWit => cache
                .p2wpkh_signature_hash(index, &self.prevout.script_pubkey, value, sighash_type)
                .map_err(|e| signing(&e))?
                .to_byte_array(),
            ScriptType::SegWitWrapped => {
                let program = self.redeem_script.as_ref().ok_or_else(|| structural(index, "missing redeem script"))?;
                cache
                    .p2wpkh_signature_hash(index, program, value, sighash_type)
                    .map_err(|e| signing(&e))?
                    .to_byte_array()
            }
            ScriptType::MultisigP2WSH | ScriptType::MultisigP2SHWrapped => {
                let ws = self.witness_script.as_ref().ok_or_else(|| structural(index, "missing witness script"))?;
                cache
                    .p2wsh_signature_hash(index, ws, value, sighash_type)
                    .map_err(|e| signing(&e))?
                    .to_byte_array()
            }
        };
        Ok(Message::from_digest(digest))
    }
}

/// Scripts and signatures recovered from the final scriptSig and witness of
/// an input that was already finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedSpend {
    pub spend: SpendInfo,
    /// Signature pushes, in stack order.
    pub signatures: Vec<Vec<u8>>,
    /// Key pushed next to the signature of a single-sig spend.
    pub public_key: Option<PublicKey>,
}

fn script_pushes(index: usize, script: &Script) -> Result<Vec<Vec<u8>>, BtcError> {
    script
        .instructions()
        .map(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes().to_vec()),
            Ok(Instruction::Op(op)) => Err(structural(index, format!("final scriptSig is not push-only ({op})"))),
            Err(e) => Err(structural(index, format!("unparsable final scriptSig: {e}"))),
        })
        .collect()
}

fn key_spend(index: usize, stack: &[Vec<u8>]) -> Result<(Vec<u8>, PublicKey), BtcError> {
    match stack {
        [sig, key] => {
            let key = PublicKey::from_slice(key)
                .map_err(|e| structural(index, format!("bad public key in final script: {e}")))?;
            Ok((sig.clone(), key))
        }
        _ => Err(structural(index, "final script must hold one signature and one public key")),
    }
}

/// Signatures after the leading empty element `OP_CHECKMULTISIG` consumes.
fn multisig_signatures(index: usize, stack: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, BtcError> {
    match stack.split_first() {
        Some((dummy, sigs)) if dummy.is_empty() => Ok(sigs.to_vec()),
        _ => Err(structural(index, "multisig final script lacks the empty dummy element")),
    }
}

impl FinalizedSpend {
    pub fn from_input(psbt: &Psbt, index: usize) -> Result<Self, BtcError> {
        let prevout = previous_output(psbt, index)?;
        let input = &psbt.inputs[index];
        let script_sig = match &input.final_script_sig {
            Some(script) => script_pushes(index, script)?,
            None => Vec::new(),
        };
        let witness: Vec<Vec<u8>> = input
            .final_script_witness
            .as_ref()
            .map(|w| w.iter().map(<[u8]>::to_vec).collect())
            .unwrap_or_default();
        let spk = prevout.script_pubkey.clone();

        if spk.is_p2pkh() {
            let (sig, key) = key_spend(index, &script_sig)?;
            return Ok(Self::single(SpendInfo::single(ScriptType::Legacy, prevout, None), sig, key));
        }
        if spk.is_p2wpkh() {
            let (sig, key) = key_spend(index, &witness)?;
            return Ok(Self::single(SpendInfo::single(ScriptType::NativeSegWit, prevout, None), sig, key));
        }
        if spk.is_p2wsh() {
            return Self::multisig_witness(index, prevout, None, &witness);
        }
        if !spk.is_p2sh() {
            return Err(structural(index, "unsupported previous output script"));
        }

        let (redeem, rest) = script_sig
            .split_last()
            .ok_or_else(|| structural(index, "final scriptSig has no redeem script"))?;
        let redeem = ScriptBuf::from_bytes(redeem.clone());
        if ScriptBuf::new_p2sh(&redeem.script_hash()) != spk {
            return Err(structural(index, "final redeem script does not match its commitment"));
        }
        if redeem.is_p2wpkh() {
            let (sig, key) = key_spend(index, &witness)?;
            let spend = SpendInfo::single(ScriptType::SegWitWrapped, prevout, Some(redeem));
            return Ok(Self::single(spend, sig, key));
        }
        if redeem.is_p2wsh() {
            return Self::multisig_witness(index, prevout, Some(redeem), &witness);
        }
        let multisig = multisig_of(index, &redeem)?;
        Ok(FinalizedSpend {
            spend: SpendInfo {
                script_type: ScriptType::MultisigP2SH,
                prevout,
                redeem_script: Some(redeem),
                witness_script: None,
                multisig: Some(multisig),
            },
            signatures: multisig_signatures(index, rest)?,
            public_key: None,
        })
    }

    fn single(spend: SpendInfo, signature: Vec<u8>, key: PublicKey) -> Self {
        FinalizedSpend {
            spend,
            signatures: vec![signature],
            public_key: Some(key),
        }
    }

    fn multisig_witness(
        index: usize,
        prevout: TxOut,
        redeem: Option<ScriptBuf>,
        witness: &[Vec<u8>],
    ) -> Result<Self, BtcError> {
        let (ws, rest) = witness
            .split_last()
            .ok_or_else(|| structural(index, "final witness has no witness script"))?;
        let ws = ScriptBuf::from_bytes(ws.clone());
        let program = redeem.as_ref().unwrap_or(&prevout.script_pubkey);
        if ScriptBuf::new_p2wsh(&ws.wscript_hash()) != *program {
            return Err(structural(index, "final witness script does not match its commitment"));
        }
        let multisig = multisig_of(index, &ws)?;
        let script_type = if redeem.is_some() {
            ScriptType::MultisigP2SHWrapped
        } else {
            ScriptType::MultisigP2WSH
        };
        Ok(FinalizedSpend {
            spend: SpendInfo {
                script_type,
                prevout,
                redeem_script: redeem,
                witness_script: Some(ws),
                multisig: Some(multisig),
            },
            signatures: multisig_signatures(index, rest)?,
            public_key: None,
        })
    }
}

fn wpkh_script(key: &PublicKey) -> Option<ScriptBuf> {
    key.compressed
        .then(|| ScriptBuf::new_p2wpkh(&CompressedPublicKey(key.inner).wpubkey_hash()))
}
