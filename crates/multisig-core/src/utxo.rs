use std::collections::HashSet;

use bitcoin::{OutPoint, ScriptBuf, Txid};

use crate::error::BtcError;
use crate::fee::{input_size, transaction_size, FeeCalculator, TxSize, UNCOMPRESSED_KEY_EXTRA};
use crate::multisig::MultisigConfig;
use crate::script_type::ScriptType;

/// A single unspent transaction output (UTXO) owned by the wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    /// Transaction ID as a hex string (big-endian / display order).
    pub txid: String,
    /// Output index within the transaction.
    pub vout: u32,
    /// Value in satoshis.
    pub amount_sat: u64,
    /// Address the output pays to.
    pub address: String,
    pub script_type: ScriptType,
    /// Full derivation path of the owning key(s), e.g. `m/84'/1'/0'/0/3`.
    /// `None` for imported single keys.
    pub derivation_path: Option<String>,
    /// The locking script (scriptPubKey).
    pub script_pubkey: ScriptBuf,
}

impl Utxo {
    pub fn outpoint(&self) -> Result<OutPoint, BtcError> {
        let txid: Txid = self
            .txid
            .parse()
            .map_err(|e| BtcError::Validation(format!("invalid txid {:?}: {e}", self.txid)))?;
        Ok(OutPoint::new(txid, self.vout))
    }
}

/// Outputs the selection has to pay for besides the inputs themselves.
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Sum of all recipient amounts.
    pub target_sat: u64,
    /// Sizes of the recipient outputs.
    pub recipient_outputs: Vec<TxSize>,
    /// Size of the change output, should one be needed.
    pub change_output: TxSize,
    /// Requested fee rate in sat/vB.
    pub fee_rate: f64,
    /// Threshold of the spending wallet; sizes multisig inputs.
    pub multisig: Option<MultisigConfig>,
    /// P2PKH inputs are signed with an uncompressed key.
    pub uncompressed_key: bool,
}

/// Result of UTXO selection.
#[derive(Debug, Clone)]
pub struct UtxoSelection {
    /// The selected UTXOs, in selection order.
    pub selected: Vec<Utxo>,
    /// Total value of the selected UTXOs in satoshis.
    pub total_sat: u64,
    /// Fee paid, including any sub-dust remainder.
    pub fee_sat: u64,
    /// Change value, or `None` if the remainder was folded into the fee.
    pub change_sat: Option<u64>,
    /// Estimated size of the final transaction.
    pub size: TxSize,
}

/// Largest-first coin selection with the fee re-estimated after every pick.
#[derive(Debug, Clone, Copy)]
pub struct CoinSelector {
    fees: FeeCalculator,
    dust_limit_sat: u64,
}

impl CoinSelector {
    pub fn new(fees: FeeCalculator, dust_limit_sat: u64) -> Self {
        Self { fees, dust_limit_sat }
    }

    pub fn select(&self, utxos: &[Utxo], request: &SelectionRequest) -> Result<UtxoSelection, BtcError> {
        if utxos.is_empty() {
            return Err(BtcError::InsufficientFunds {
                available: 0,
                required: request.target_sat,
            });
        }

        let mut seen = HashSet::new();
        for utxo in utxos {
            if !seen.insert((utxo.txid.as_str(), utxo.vout)) {
                return Err(BtcError::Validation(format!(
                    "UTXO {}:{} listed twice",
                    utxo.txid, utxo.vout
                )));
            }
        }

        // Sort by value descending (largest first); ties broken by outpoint.
        let mut sorted: Vec<&Utxo> = utxos.iter().collect();
        sorted.sort_by(|a, b| {
            b.amount_sat
                .cmp(&a.amount_sat)
                .then_with(|| a.txid.cmp(&b.txid))
                .then_with(|| a.vout.cmp(&b.vout))
        });

        let mut with_change = request.recipient_outputs.clone();
        with_change.push(request.change_output);

        let mut selected: Vec<Utxo> = Vec::new();
        let mut input_sizes: Vec<TxSize> = Vec::new();
        let mut total_sat: u64 = 0;
        let mut required = request.target_sat;

        for utxo in sorted {
            let config = if utxo.script_type.is_multisig() {
                request.multisig.as_ref()
            } else {
                None
            };
            let mut size = input_size(utxo.script_type, config)?;
            if request.uncompressed_key && utxo.script_type == ScriptType::Legacy {
                size.base += UNCOMPRESSED_KEY_EXTRA;
            }
            input_sizes.push(size);
            selected.push(utxo.clone());
            total_sat = total_sat
                .checked_add(utxo.amount_sat)
                .ok_or_else(|| BtcError::Validation("UTXO values overflow".into()))?;

            let size_change = transaction_size(&input_sizes, &with_change);
            let fee_change = self.fees.fee_for(size_change, request.fee_rate)?;
            let need_change = request.target_sat.checked_add(fee_change).ok_or(BtcError::InsufficientFunds {
                available: total_sat,
                required: u64::MAX,
            })?;
            if let Some(change) = total_sat.checked_sub(need_change) {
                if change >= self.dust_limit_sat {
                    log::debug!(
                        "selected {} UTXOs ({total_sat} sat), fee {fee_change}, change {change}",
                        selected.len()
                    );
                    return Ok(UtxoSelection {
                        selected,
                        total_sat,
                        fee_sat: fee_change,
                        change_sat: Some(change),
                        size: size_change,
                    });
                }
            }

            let size_plain = transaction_size(&input_sizes, &request.recipient_outputs);
            let fee_plain = self.fees.fee_for(size_plain, request.fee_rate)?;
            required = request.target_sat.checked_add(fee_plain).ok_or(BtcError::InsufficientFunds {
                available: total_sat,
                required: u64::MAX,
            })?;
            if total_sat >= required {
                let fee_sat = total_sat - request.target_sat;
                log::debug!(
                    "selected {} UTXOs ({total_sat} sat), fee {fee_sat} with sub-dust remainder folded in",
                    selected.len()
                );
                return Ok(UtxoSelection {
                    selected,
                    total_sat,
                    fee_sat,
                    change_sat: None,
                    size: size_plain,
                });
            }
        }

        Err(BtcError::InsufficientFunds {
            available: total_sat,
            required,
        })
    }
}
