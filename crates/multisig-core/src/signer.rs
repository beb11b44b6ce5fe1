//! PSBT signing and finalization.
//!
//! Private keys are borrowed from a [`KeyProvider`] one at a time, used for a
//! single signature and wiped before the next key is requested. Every
//! signature is verified against its public key before it is embedded.

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::psbt::Psbt;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{ecdsa, All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, ScriptBuf, Transaction, Txid, Witness};
use crypto_utils::KeyMaterial;

use crate::error::BtcError;
use crate::script_type::ScriptType;
use crate::spend::{FinalizedSpend, SpendInfo};

/// Which private key a signer is asking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRef {
    /// Key at this path below the provider's master key.
    Derivation(DerivationPath),
    /// The provider's single imported key.
    Imported,
}

/// Source of private keys. Implementations decide how keys are stored and
/// unlocked; the engine never caches what they return.
pub trait KeyProvider {
    /// Fingerprint of the HD master key, if the provider has one.
    fn master_fingerprint(&self) -> Option<Fingerprint>;

    /// Public key of the imported single key, if the provider has one.
    fn imported_public_key(&self) -> Option<PublicKey>;

    /// Hand out a private key. Fails with [`BtcError::KeyProviderLocked`]
    /// while the provider is locked.
    fn private_key(&self, key: &KeyRef) -> Result<KeyMaterial, BtcError>;
}

/// Result of a signing pass.
#[derive(Debug, Clone)]
pub struct SignOutcome {
    pub psbt: Psbt,
    pub signatures_added: usize,
}

/// A fully signed transaction.
#[derive(Debug, Clone)]
pub struct FinalizedTransaction {
    pub psbt: Psbt,
    pub tx: Transaction,
    pub raw: Vec<u8>,
    pub txid: Txid,
}

impl FinalizedTransaction {
    pub fn raw_hex(&self) -> String {
        hex::encode(&self.raw)
    }
}

/// Erases the secp256k1 secret on every exit path.
struct SecretGuard(SecretKey);

impl Drop for SecretGuard {
    fn drop(&mut self) {
        self.0.non_secure_erase();
    }
}

fn input_sighash_type(psbt: &Psbt, index: usize) -> Result<EcdsaSighashType, BtcError> {
    match psbt.inputs[index].sighash_type {
        None => Ok(EcdsaSighashType::All),
        Some(requested) => requested
            .ecdsa_hash_ty()
            .map_err(|e| BtcError::Signing(format!("input {index}: unsupported sighash type: {e}"))),
    }
}

/// Keys in `input` the provider can sign for, with how to ask for them.
fn candidate_keys(
    psbt: &Psbt,
    index: usize,
    spend: &SpendInfo,
    provider: &dyn KeyProvider,
) -> Vec<(PublicKey, KeyRef)> {
    let mut candidates = Vec::new();
    if let Some(master) = provider.master_fingerprint() {
        for (key, (fingerprint, path)) in &psbt.inputs[index].bip32_derivation {
            let key = PublicKey::new(*key);
            if *fingerprint == master && spend.involves(&key) {
                candidates.push((key, KeyRef::Derivation(path.clone())));
            }
        }
    }
    if let Some(imported) = provider.imported_public_key() {
        if spend.involves(&imported) && !candidates.iter().any(|(k, _)| *k == imported) {
            candidates.push((imported, KeyRef::Imported));
        }
    }
    candidates
}

fn sign_with(
    secp: &Secp256k1<All>,
    material: &KeyMaterial,
    expected: &PublicKey,
    msg: &Message,
) -> Result<ecdsa::Signature, BtcError> {
    material.with_secret(|bytes| {
        let guard = SecretGuard(
            SecretKey::from_slice(bytes).map_err(|e| BtcError::Signing(format!("invalid private key: {e}")))?,
        );
        let derived = PublicKey {
            compressed: material.is_compressed(),
            inner: guard.0.public_key(secp),
        };
        if derived != *expected {
            return Err(BtcError::Signing(format!(
                "key provider returned a key that does not match {expected}"
            )));
        }
        let signature = secp.sign_ecdsa(msg, &guard.0);
        secp.verify_ecdsa(msg, &signature, &expected.inner)
            .map_err(|e| BtcError::Signing(format!("fresh signature failed to verify: {e}")))?;
        Ok(signature)
    })
}

/// Add this provider's signatures to a copy of `psbt`.
///
/// Inputs the provider has no key for, and keys that have already signed,
/// are left alone, so signing twice adds nothing.
pub fn sign(psbt: &Psbt, provider: &dyn KeyProvider) -> Result<SignOutcome, BtcError> {
    let mut working = psbt.clone();
    let tx = working.unsigned_tx.clone();
    let mut cache = SighashCache::new(&tx);
    let secp = Secp256k1::new();
    let mut signatures_added = 0;

    for index in 0..working.inputs.len() {
        let spend = SpendInfo::from_input(&working, index)?;
        let candidates = candidate_keys(&working, index, &spend, provider);
        if candidates.is_empty() {
            continue;
        }
        let sighash_type = input_sighash_type(&working, index)?;
        let msg = spend.sighash(&mut cache, index, sighash_type)?;

        for (key, key_ref) in candidates {
            if working.inputs[index].partial_sigs.contains_key(&key) {
                log::debug!("input {index} already signed by {key}");
                continue;
            }
            let material = provider.private_key(&key_ref)?;
            let signature = sign_with(&secp, &material, &key, &msg)?;
            drop(material);

            working.inputs[index].partial_sigs.insert(
                key,
                bitcoin::ecdsa::Signature {
                    signature,
                    sighash_type,
                },
            );
            signatures_added += 1;
            log::debug!("signed input {index} ({}) with {key}", spend.script_type);
        }
    }

    log::info!("signing pass added {signatures_added} signature(s)");
    Ok(SignOutcome {
        psbt: working,
        signatures_added,
    })
}

/// Keys whose signatures on input `index` verify, in script order.
pub fn valid_signers(psbt: &Psbt, index: usize) -> Result<Vec<PublicKey>, BtcError> {
    let spend = SpendInfo::from_input(psbt, index)?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let secp = Secp256k1::verification_only();

    let mut valid: Vec<(usize, PublicKey)> = Vec::new();
    for (key, sig) in &psbt.inputs[index].partial_sigs {
        let Some(position) = spend.key_position(key) else {
            log::warn!("input {index}: signature from {key}, which is not in the script");
            continue;
        };
        let msg = spend.sighash(&mut cache, index, sig.sighash_type)?;
        if secp.verify_ecdsa(&msg, &sig.signature, &key.inner).is_ok() {
            valid.push((position, *key));
        } else {
            log::warn!("input {index}: invalid signature from {key} ignored");
        }
    }
    valid.sort_by_key(|(position, _)| *position);
    Ok(valid.into_iter().map(|(_, key)| key).collect())
}

/// Number of verified signatures on input `index`.
pub fn count_valid_signatures(psbt: &Psbt, index: usize) -> Result<usize, BtcError> {
    Ok(valid_signers(psbt, index)?.len())
}

/// Classify a finalized input and return the distinct script keys whose
/// signatures in its final scriptSig or witness verify.
pub fn finalized_signers(psbt: &Psbt, index: usize) -> Result<(SpendInfo, Vec<PublicKey>), BtcError> {
    let FinalizedSpend {
        spend,
        signatures,
        public_key,
    } = FinalizedSpend::from_input(psbt, index)?;
    let candidates: Vec<PublicKey> = match (public_key, &spend.multisig) {
        (Some(key), _) => {
            if !spend.involves(&key) {
                return Err(BtcError::StructuralPsbt(format!(
                    "input {index}: final script key {key} does not own the previous output"
                )));
            }
            vec![key]
        }
        (None, Some((_, keys))) => keys.clone(),
        (None, None) => Vec::new(),
    };

    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let secp = Secp256k1::verification_only();
    let mut signers: Vec<PublicKey> = Vec::new();
    for raw in &signatures {
        let sig = bitcoin::ecdsa::Signature::from_slice(raw)
            .map_err(|e| BtcError::StructuralPsbt(format!("input {index}: bad signature in final script: {e}")))?;
        let msg = spend.sighash(&mut cache, index, sig.sighash_type)?;
        let signer = candidates.iter().find(|key| {
            !signers.contains(*key) && secp.verify_ecdsa(&msg, &sig.signature, &key.inner).is_ok()
        });
        match signer {
            Some(key) => signers.push(*key),
            None => log::warn!("input {index}: final script carries a signature no script key made"),
        }
    }
    Ok((spend, signers))
}

fn push_data(builder: Builder, data: &[u8]) -> Result<Builder, BtcError> {
    let bytes = PushBytesBuf::try_from(data.to_vec())
        .map_err(|_| BtcError::StructuralPsbt("script push exceeds the size limit".into()))?;
    Ok(builder.push_slice(bytes))
}

fn wrapped_script_sig(redeem: &ScriptBuf) -> Result<ScriptBuf, BtcError> {
    Ok(push_data(Builder::new(), redeem.as_bytes())?.into_script())
}

/// Combine signatures into final scripts and extract the transaction.
///
/// Every input needs at least its threshold of verified signatures from
/// distinct script keys.
pub fn finalize(psbt: &Psbt) -> Result<FinalizedTransaction, BtcError> {
    let mut finalized = psbt.clone();

    for index in 0..finalized.inputs.len() {
        let spend = SpendInfo::from_input(&finalized, index)?;
        let signers = valid_signers(&finalized, index)?;
        let need = spend.required_signatures();
        if signers.len() < need {
            return Err(BtcError::InsufficientSignatures {
                input: index,
                have: signers.len(),
                need,
            });
        }

        let input = &mut finalized.inputs[index];
        let sigs: Vec<Vec<u8>> = signers
            .iter()
            .take(need)
            .filter_map(|key| input.partial_sigs.get(key).map(|s| s.to_vec()))
            .collect();
        let missing_redeem = || BtcError::StructuralPsbt(format!("input {index}: missing redeem script"));
        let missing_witness = || BtcError::StructuralPsbt(format!("input {index}: missing witness script"));

        let (script_sig, witness) = match spend.script_type {
            ScriptType::Legacy => {
                let builder = push_data(Builder::new(), &sigs[0])?;
                let builder = push_data(builder, &signers[0].to_bytes())?;
                (Some(builder.into_script()), None)
            }
            ScriptType::NativeSegWit => (None, Some(Witness::from_slice(&[sigs[0].clone(), signers[0].to_bytes()]))),
            ScriptType::SegWitWrapped => {
                let redeem = spend.redeem_script.as_ref().ok_or_else(missing_redeem)?;
                (
                    Some(wrapped_script_sig(redeem)?),
                    Some(Witness::from_slice(&[sigs[0].clone(), signers[0].to_bytes()])),
                )
            }
            ScriptType::MultisigP2SH => {
                let redeem = spend.redeem_script.as_ref().ok_or_else(missing_redeem)?;
                let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
                for sig in &sigs {
                    builder = push_data(builder, sig)?;
                }
                (Some(push_data(builder, redeem.as_bytes())?.into_script()), None)
            }
            ScriptType::MultisigP2WSH | ScriptType::MultisigP2SHWrapped => {
                let ws = spend.witness_script.as_ref().ok_or_else(missing_witness)?;
                let mut stack: Vec<Vec<u8>> = Vec::with_capacity(sigs.len() + 2);
                stack.push(Vec::new());
                stack.extend(sigs.iter().cloned());
                stack.push(ws.to_bytes());
                let script_sig = match spend.script_type {
                    ScriptType::MultisigP2SHWrapped => {
                        Some(wrapped_script_sig(spend.redeem_script.as_ref().ok_or_else(missing_redeem)?)?)
                    }
                    _ => None,
                };
                (script_sig, Some(Witness::from_slice(&stack)))
            }
        };

        input.final_script_sig = script_sig;
        input.final_script_witness = witness;
        input.partial_sigs.clear();
        input.bip32_derivation.clear();
        input.redeem_script = None;
        input.witness_script = None;
        input.sighash_type = None;
    }

    let mut tx = finalized.unsigned_tx.clone();
    for (txin, input) in tx.input.iter_mut().zip(&finalized.inputs) {
        txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
        txin.witness = input.final_script_witness.clone().unwrap_or_default();
    }
    let raw = bitcoin::consensus::encode::serialize(&tx);
    let txid = tx.compute_txid();
    log::info!("finalized transaction {txid} ({} bytes)", raw.len());

    Ok(FinalizedTransaction {
        psbt: finalized,
        tx,
        raw,
        txid,
    })
}
