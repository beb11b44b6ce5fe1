use std::collections::HashSet;

use bitcoin::absolute::LockTime;
use bitcoin::psbt::Psbt;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use crate::account::Account;
use crate::address::parse_address;
use crate::error::BtcError;
use crate::fee::{output_size, FeeCalculator};
use crate::policy::EnginePolicy;
use crate::script_type::ScriptType;
use crate::signer::{count_valid_signatures, finalize, sign, KeyProvider};
use crate::spend::previous_output;
use crate::utxo::{CoinSelector, SelectionRequest, Utxo};

/// A payment to make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: String,
    pub amount_sat: u64,
}

impl Recipient {
    pub fn new(address: impl Into<String>, amount_sat: u64) -> Self {
        Self {
            address: address.into(),
            amount_sat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMetadata {
    pub outpoint: OutPoint,
    pub amount_sat: u64,
    pub address: String,
    pub script_type: ScriptType,
    pub derivation_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMetadata {
    pub address: String,
    pub amount_sat: u64,
    pub is_change: bool,
}

/// How far a built transaction has progressed through signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStatus {
    Unsigned,
    PartiallySigned,
    Finalized,
}

/// A transaction assembled by [`TransactionBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub inputs: Vec<InputMetadata>,
    pub outputs: Vec<OutputMetadata>,
    pub fee_sat: u64,
    pub vsize: u64,
    pub psbt: Psbt,
    pub status: SigningStatus,
    /// Serialized signed transaction, once finalized.
    pub raw_tx: Option<Vec<u8>>,
    pub txid: Txid,
}

/// Checks run on every transaction before it may be broadcast.
///
/// Returns the fee implied by the PSBT's inputs and outputs.
pub fn verify_before_broadcast(psbt: &Psbt, vsize: u64, policy: &EnginePolicy) -> Result<u64, BtcError> {
    let tx = &psbt.unsigned_tx;

    let mut seen = HashSet::new();
    for txin in &tx.input {
        if !seen.insert(txin.previous_output) {
            return Err(BtcError::Validation(format!(
                "input {} is spent twice",
                txin.previous_output
            )));
        }
    }

    for (i, out) in tx.output.iter().enumerate() {
        if out.value.to_sat() < policy.dust_limit_sat {
            return Err(BtcError::Validation(format!(
                "output {i} of {} sat is below the {} sat dust limit",
                out.value.to_sat(),
                policy.dust_limit_sat
            )));
        }
    }

    let mut total_in: u64 = 0;
    for index in 0..psbt.inputs.len() {
        total_in = total_in
            .checked_add(previous_output(psbt, index)?.value.to_sat())
            .ok_or_else(|| BtcError::Validation("input values overflow".into()))?;
    }
    let total_out = tx
        .output
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()))
        .ok_or_else(|| BtcError::Validation("output values overflow".into()))?;
    let fee = total_in.checked_sub(total_out).ok_or_else(|| {
        BtcError::Validation(format!("outputs ({total_out} sat) exceed inputs ({total_in} sat)"))
    })?;

    let min_fee = FeeCalculator::new(policy.min_relay_fee_rate)?.min_relay_fee(vsize);
    if fee < min_fee {
        return Err(BtcError::Validation(format!(
            "fee {fee} sat is below the minimum relay fee of {min_fee} sat"
        )));
    }
    Ok(fee)
}

/// Builds, and where possible signs, transactions spending from one account.
pub struct TransactionBuilder<'a> {
    account: &'a Account,
    policy: &'a EnginePolicy,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new(account: &'a Account, policy: &'a EnginePolicy) -> Self {
        Self { account, policy }
    }

    /// Select inputs, assemble a PSBT paying `recipients` (plus change), and
    /// sign with `provider` if one is given.
    ///
    /// Single-signer spends are finalized right away; multisig spends carry
    /// only this party's signatures unless they already meet the threshold.
    pub fn build(
        &self,
        utxos: &[Utxo],
        recipients: &[Recipient],
        change_address: &str,
        fee_rate: f64,
        provider: Option<&dyn KeyProvider>,
    ) -> Result<BuiltTransaction, BtcError> {
        let network = self.account.network();
        if recipients.is_empty() {
            return Err(BtcError::Validation("at least one recipient is required".into()));
        }

        let mut recipient_outputs = Vec::with_capacity(recipients.len());
        let mut target_sat: u64 = 0;
        for recipient in recipients {
            if recipient.amount_sat < self.policy.dust_limit_sat {
                return Err(BtcError::Validation(format!(
                    "payment of {} sat to {} is below the dust limit",
                    recipient.amount_sat, recipient.address
                )));
            }
            let address = parse_address(&recipient.address, network)?;
            target_sat = target_sat
                .checked_add(recipient.amount_sat)
                .ok_or_else(|| BtcError::Validation("recipient amounts overflow".into()))?;
            recipient_outputs.push(TxOut {
                value: Amount::from_sat(recipient.amount_sat),
                script_pubkey: address.script_pubkey(),
            });
        }
        let change_script = parse_address(change_address, network)?.script_pubkey();

        let script_type = self.account.script_type();
        if let Some(foreign) = utxos.iter().find(|u| u.script_type != script_type) {
            return Err(BtcError::Validation(format!(
                "UTXO {}:{} is {} but the account spends {script_type}",
                foreign.txid, foreign.vout, foreign.script_type
            )));
        }

        let selector = CoinSelector::new(
            FeeCalculator::new(self.policy.min_relay_fee_rate)?,
            self.policy.dust_limit_sat,
        );
        let selection = selector.select(
            utxos,
            &SelectionRequest {
                target_sat,
                recipient_outputs: recipient_outputs.iter().map(|o| output_size(&o.script_pubkey)).collect(),
                change_output: output_size(&change_script),
                fee_rate,
                multisig: self.account.multisig_config().copied(),
                uncompressed_key: matches!(self.account, Account::Imported(a) if !a.public_key().compressed),
            },
        )?;

        let mut tx_inputs = Vec::with_capacity(selection.selected.len());
        let mut input_meta = Vec::with_capacity(selection.selected.len());
        let mut signing_data = Vec::with_capacity(selection.selected.len());
        for utxo in &selection.selected {
            let outpoint = utxo.outpoint()?;
            signing_data.push(self.account.input_data(utxo)?);
            tx_inputs.push(TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_LOCKTIME_NO_RBF,
                witness: Witness::default(),
            });
            input_meta.push(InputMetadata {
                outpoint,
                amount_sat: utxo.amount_sat,
                address: utxo.address.clone(),
                script_type: utxo.script_type,
                derivation_path: utxo.derivation_path.clone(),
            });
        }

        let mut output_meta: Vec<OutputMetadata> = recipients
            .iter()
            .map(|r| OutputMetadata {
                address: r.address.trim().to_string(),
                amount_sat: r.amount_sat,
                is_change: false,
            })
            .collect();
        let mut tx_outputs = recipient_outputs;
        if let Some(change) = selection.change_sat {
            tx_outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: change_script,
            });
            output_meta.push(OutputMetadata {
                address: change_address.trim().to_string(),
                amount_sat: change,
                is_change: true,
            });
        }

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: tx_inputs,
            output: tx_outputs,
        };
        let txid = tx.compute_txid();

        let mut psbt = Psbt::from_unsigned_tx(tx)
            .map_err(|e| BtcError::StructuralPsbt(format!("cannot wrap transaction: {e}")))?;
        for (input, data) in psbt.inputs.iter_mut().zip(signing_data) {
            input.witness_utxo = Some(data.witness_utxo);
            input.redeem_script = data.redeem_script;
            input.witness_script = data.witness_script;
            input.bip32_derivation = data.bip32_derivation;
        }

        let vsize = selection.size.vsize();
        let fee_sat = verify_before_broadcast(&psbt, vsize, self.policy)?;
        if fee_sat != selection.fee_sat {
            return Err(BtcError::Validation(format!(
                "fee mismatch: selected {} sat but transaction pays {fee_sat} sat",
                selection.fee_sat
            )));
        }
        log::info!(
            "built {txid}: {} input(s), {} output(s), fee {fee_sat} sat, ~{vsize} vB",
            input_meta.len(),
            output_meta.len()
        );

        let mut built = BuiltTransaction {
            inputs: input_meta,
            outputs: output_meta,
            fee_sat,
            vsize,
            psbt,
            status: SigningStatus::Unsigned,
            raw_tx: None,
            txid,
        };

        if let Some(provider) = provider {
            let outcome = sign(&built.psbt, provider)?;
            built.psbt = outcome.psbt;
            if outcome.signatures_added > 0 {
                built.status = SigningStatus::PartiallySigned;
            }
            if meets_threshold(&built.psbt, self.account.required_signatures())? {
                let finalized = finalize(&built.psbt)?;
                built.psbt = finalized.psbt;
                built.raw_tx = Some(finalized.raw);
                built.status = SigningStatus::Finalized;
            }
        }
        Ok(built)
    }
}

fn meets_threshold(psbt: &Psbt, required: usize) -> Result<bool, BtcError> {
    for index in 0..psbt.inputs.len() {
        if count_valid_signatures(psbt, index)? < required {
            return Ok(false);
        }
    }
    Ok(!psbt.inputs.is_empty())
}
