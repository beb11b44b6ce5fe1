//! PSBT import, review, export and merging between cosigners.
//!
//! Imported PSBTs are checked structurally before anything else looks at
//! them. Problems that make a PSBT unusable are errors; suspicious but valid
//! content is reported as [`SecurityWarning`]s next to the parsed PSBT.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bitcoin::bip32::ChildNumber;
use bitcoin::psbt::Psbt;
use bitcoin::Txid;
use sha2::{Digest, Sha256};

use crate::error::BtcError;
use crate::multisig::MultisigConfig;
use crate::network::BtcNetwork;
use crate::policy::EnginePolicy;
use crate::signer::{count_valid_signatures, finalized_signers};
use crate::spend::{previous_output, SpendInfo};

const PSBT_MAGIC_HEX: &str = "70736274ff";
const CHUNK_PREFIX: &str = "psbt:";
/// Hex characters of the payload SHA-256 carried in every chunk.
const DIGEST_LEN: usize = 8;

/// Non-fatal findings about an imported PSBT.
#[derive(Debug, Clone, PartialEq)]
pub enum SecurityWarning {
    /// Fee is large relative to what the transaction pays out.
    ExcessiveFee { fee_sat: u64, total_output_sat: u64 },
    /// An output is below the dust limit.
    DustOutput { index: usize, amount_sat: u64 },
    /// A key origin uses the coin type of another network.
    NetworkMismatch { input: usize, coin_type: u32 },
}

impl fmt::Display for SecurityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecurityWarning::ExcessiveFee { fee_sat, total_output_sat } => write!(
                f,
                "fee of {fee_sat} sat is excessive for {total_output_sat} sat of outputs"
            ),
            SecurityWarning::DustOutput { index, amount_sat } => {
                write!(f, "output {index} of {amount_sat} sat is dust")
            }
            SecurityWarning::NetworkMismatch { input, coin_type } => write!(
                f,
                "input {input} key origin uses coin type {coin_type}, which belongs to another network"
            ),
        }
    }
}

/// Amounts and signing progress of a PSBT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsbtSummary {
    pub txid: Txid,
    pub total_input_sat: u64,
    pub total_output_sat: u64,
    pub fee_sat: u64,
    /// Verified signatures per input; finalized inputs count as complete.
    pub signatures: Vec<usize>,
    /// Signatures needed per input.
    pub required: Vec<usize>,
}

impl PsbtSummary {
    pub fn input_count(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_ready_to_finalize(&self) -> bool {
        self.signatures.iter().zip(&self.required).all(|(have, need)| have >= need)
    }
}

#[derive(Debug, Clone)]
pub struct ImportedPsbt {
    pub psbt: Psbt,
    pub summary: PsbtSummary,
    pub warnings: Vec<SecurityWarning>,
}

/// A PSBT in every transport encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedPsbt {
    pub base64: String,
    pub hex: String,
    pub chunks: Vec<PsbtChunk>,
}

/// One piece of a base64 PSBT split for size-limited transports.
///
/// Rendered as `psbt:{index}/{total}:{digest}:{data}` with a 1-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsbtChunk {
    pub index: usize,
    pub total: usize,
    /// Leading hex characters of the SHA-256 of the whole base64 payload.
    pub digest: String,
    pub data: String,
}

impl fmt::Display for PsbtChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{CHUNK_PREFIX}{}/{}:{}:{}", self.index, self.total, self.digest, self.data)
    }
}

impl FromStr for PsbtChunk {
    type Err = BtcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || BtcError::Validation(format!("malformed PSBT chunk {:?}", truncate(s)));
        let body = s.trim().strip_prefix(CHUNK_PREFIX).ok_or_else(bad)?;
        let mut parts = body.splitn(3, ':');
        let position = parts.next().ok_or_else(bad)?;
        let digest = parts.next().ok_or_else(bad)?;
        let data = parts.next().ok_or_else(bad)?;

        let (index, total) = position.split_once('/').ok_or_else(bad)?;
        let index: usize = index.parse().map_err(|_| bad())?;
        let total: usize = total.parse().map_err(|_| bad())?;
        if index == 0 || index > total {
            return Err(BtcError::Validation(format!("chunk index {index} out of range 1..={total}")));
        }
        if digest.len() != DIGEST_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }
        Ok(PsbtChunk {
            index,
            total,
            digest: digest.to_ascii_lowercase(),
            data: data.to_string(),
        })
    }
}

fn truncate(s: &str) -> &str {
    s.get(..24).unwrap_or(s)
}

fn payload_digest(payload: &str) -> String {
    let hash = Sha256::digest(payload.as_bytes());
    hex::encode(hash)[..DIGEST_LEN].to_string()
}

/// Split a base64 payload into chunks of at most `chunk_size` characters.
pub fn split_into_chunks(payload: &str, chunk_size: usize) -> Vec<PsbtChunk> {
    let digest = payload_digest(payload);
    let pieces: Vec<&str> = payload
        .as_bytes()
        .chunks(chunk_size.max(1))
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();
    let total = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, data)| PsbtChunk {
            index: i + 1,
            total,
            digest: digest.clone(),
            data: data.to_string(),
        })
        .collect()
}

/// Put chunks back together in index order, in whatever order they arrived.
pub fn reassemble_chunks(chunks: &[PsbtChunk]) -> Result<String, BtcError> {
    let first = chunks
        .first()
        .ok_or_else(|| BtcError::Validation("no PSBT chunks supplied".into()))?;
    let (total, digest) = (first.total, first.digest.as_str());

    let mut by_index: BTreeMap<usize, &str> = BTreeMap::new();
    for chunk in chunks {
        if chunk.total != total || chunk.digest != digest {
            return Err(BtcError::Validation(format!(
                "chunk {}/{} does not belong to the same PSBT",
                chunk.index, chunk.total
            )));
        }
        if let Some(existing) = by_index.insert(chunk.index, &chunk.data) {
            if existing != chunk.data {
                return Err(BtcError::Validation(format!("conflicting copies of chunk {}", chunk.index)));
            }
        }
    }

    let missing: Vec<String> = (1..=total)
        .filter(|i| !by_index.contains_key(i))
        .map(|i| i.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(BtcError::Validation(format!(
            "missing PSBT chunk(s) {} of {total}",
            missing.join(", ")
        )));
    }

    let payload: String = by_index.into_values().collect();
    if payload_digest(&payload) != digest {
        return Err(BtcError::Validation("reassembled PSBT does not match its digest".into()));
    }
    Ok(payload)
}

fn looks_like_hex(s: &str) -> bool {
    s.len() % 2 == 0
        && s.len() >= PSBT_MAGIC_HEX.len()
        && s[..PSBT_MAGIC_HEX.len()].eq_ignore_ascii_case(PSBT_MAGIC_HEX)
        && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decode a hex or base64 PSBT.
pub fn decode_psbt(raw: &str) -> Result<Psbt, BtcError> {
    let trimmed = raw.trim();
    let bytes = if looks_like_hex(trimmed) {
        hex::decode(trimmed).map_err(|e| BtcError::Validation(format!("invalid PSBT hex: {e}")))?
    } else {
        STANDARD
            .decode(trimmed)
            .map_err(|e| BtcError::Validation(format!("PSBT is neither hex nor base64: {e}")))?
    };
    Psbt::deserialize(&bytes).map_err(|e| BtcError::Validation(format!("undecodable PSBT: {e}")))
}

fn is_finalized(psbt: &Psbt, index: usize) -> bool {
    let input = &psbt.inputs[index];
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Reviews PSBTs against the session network, policy and, optionally, the
/// multisig configuration every input is expected to spend from.
#[derive(Debug, Clone)]
pub struct PsbtCoordinator {
    policy: EnginePolicy,
    network: BtcNetwork,
    expected: Option<MultisigConfig>,
}

impl PsbtCoordinator {
    pub fn new(policy: EnginePolicy, network: BtcNetwork) -> Self {
        Self {
            policy,
            network,
            expected: None,
        }
    }

    /// Require every input to be a multisig spend with this M, N and type.
    pub fn with_expected_config(mut self, config: MultisigConfig) -> Self {
        self.expected = Some(config);
        self
    }

    /// Import a PSBT given as base64, hex, or whitespace-separated chunks.
    pub fn import(&self, raw: &str) -> Result<ImportedPsbt, BtcError> {
        if raw.trim_start().starts_with(CHUNK_PREFIX) {
            let chunks: Vec<&str> = raw.split_whitespace().collect();
            return self.import_chunks(&chunks);
        }
        let psbt = decode_psbt(raw)?;
        self.review(psbt)
    }

    pub fn import_chunks<S: AsRef<str>>(&self, chunks: &[S]) -> Result<ImportedPsbt, BtcError> {
        let parsed = chunks
            .iter()
            .map(|c| c.as_ref().parse::<PsbtChunk>())
            .collect::<Result<Vec<_>, _>>()?;
        let payload = reassemble_chunks(&parsed)?;
        self.import(&payload)
    }

    pub fn export(&self, psbt: &Psbt) -> ExportedPsbt {
        let bytes = psbt.serialize();
        let base64 = STANDARD.encode(&bytes);
        let chunks = split_into_chunks(&base64, self.policy.chunk_size);
        ExportedPsbt {
            hex: hex::encode(&bytes),
            base64,
            chunks,
        }
    }

    /// Validate an already-decoded PSBT and collect warnings.
    pub fn review(&self, psbt: Psbt) -> Result<ImportedPsbt, BtcError> {
        match self.review_inner(&psbt) {
            Ok((summary, warnings)) => {
                for warning in &warnings {
                    log::warn!("PSBT {}: {warning}", summary.txid);
                }
                if self.policy.escalate_warnings && !warnings.is_empty() {
                    let joined: Vec<String> = warnings.iter().map(|w| w.to_string()).collect();
                    return Err(BtcError::SecurityPolicy(joined.join("; ")));
                }
                Ok(ImportedPsbt {
                    psbt,
                    summary,
                    warnings,
                })
            }
            Err(e) => {
                log::warn!("rejected PSBT {}: {e}", psbt.unsigned_tx.compute_txid());
                Err(e)
            }
        }
    }

    fn review_inner(&self, psbt: &Psbt) -> Result<(PsbtSummary, Vec<SecurityWarning>), BtcError> {
        let tx = &psbt.unsigned_tx;
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err(BtcError::StructuralPsbt(format!(
                "transaction has {} input(s) and {} output(s)",
                tx.input.len(),
                tx.output.len()
            )));
        }

        let mut warnings = Vec::new();
        let mut total_output_sat: u64 = 0;
        for (index, out) in tx.output.iter().enumerate() {
            let amount_sat = out.value.to_sat();
            if amount_sat == 0 {
                return Err(BtcError::StructuralPsbt(format!("output {index} has zero value")));
            }
            if amount_sat < self.policy.dust_limit_sat {
                warnings.push(SecurityWarning::DustOutput { index, amount_sat });
            }
            total_output_sat = total_output_sat
                .checked_add(amount_sat)
                .ok_or_else(|| BtcError::StructuralPsbt("output values overflow".into()))?;
        }

        let mut total_input_sat: u64 = 0;
        let mut signatures = Vec::with_capacity(tx.input.len());
        let mut required = Vec::with_capacity(tx.input.len());
        for index in 0..tx.input.len() {
            let prevout = previous_output(psbt, index)?;
            total_input_sat = total_input_sat
                .checked_add(prevout.value.to_sat())
                .ok_or_else(|| BtcError::StructuralPsbt("input values overflow".into()))?;

            let (spend, signed) = if is_finalized(psbt, index) {
                let (spend, signers) = finalized_signers(psbt, index)?;
                if signers.len() < spend.required_signatures() {
                    return Err(BtcError::StructuralPsbt(format!(
                        "input {index} is finalized with {} of {} valid signatures",
                        signers.len(),
                        spend.required_signatures()
                    )));
                }
                (spend, signers.len())
            } else {
                let spend = SpendInfo::from_input(psbt, index)?;
                let signed = count_valid_signatures(psbt, index)?;
                (spend, signed)
            };
            if let Some(expected) = &self.expected {
                self.check_threshold(index, &spend, expected)?;
            }
            required.push(spend.required_signatures());
            signatures.push(signed);

            if self.policy.warn_on_network_mismatch {
                if let Some(coin_type) = self.foreign_coin_type(psbt, index) {
                    warnings.push(SecurityWarning::NetworkMismatch { input: index, coin_type });
                }
            }
        }

        let fee_sat = total_input_sat.checked_sub(total_output_sat).ok_or_else(|| {
            BtcError::StructuralPsbt(format!(
                "outputs ({total_output_sat} sat) exceed inputs ({total_input_sat} sat)"
            ))
        })?;
        if fee_sat as f64 > total_output_sat as f64 * self.policy.excessive_fee_ratio {
            warnings.push(SecurityWarning::ExcessiveFee {
                fee_sat,
                total_output_sat,
            });
        }

        let summary = PsbtSummary {
            txid: tx.compute_txid(),
            total_input_sat,
            total_output_sat,
            fee_sat,
            signatures,
            required,
        };
        Ok((summary, warnings))
    }

    fn check_threshold(&self, index: usize, spend: &SpendInfo, expected: &MultisigConfig) -> Result<(), BtcError> {
        let Some((m, keys)) = &spend.multisig else {
            return Err(BtcError::StructuralPsbt(format!(
                "input {index} is {} but a {expected} spend was expected",
                spend.script_type
            )));
        };
        if *m != expected.required()
            || keys.len() != usize::from(expected.total())
            || spend.script_type != expected.script_type()
        {
            return Err(BtcError::StructuralPsbt(format!(
                "input {index} is {m}-of-{} {} but the wallet is {expected}",
                keys.len(),
                spend.script_type
            )));
        }
        Ok(())
    }

    /// Coin type from a key origin that names the other network, if any.
    fn foreign_coin_type(&self, psbt: &Psbt, index: usize) -> Option<u32> {
        let expected = self.network.coin_type();
        psbt.inputs[index]
            .bip32_derivation
            .values()
            .filter_map(|(_, path)| match path.as_ref().get(1) {
                Some(ChildNumber::Hardened { index: coin @ (0 | 1) }) => Some(*coin),
                _ => None,
            })
            .find(|coin| *coin != expected)
    }

    /// Combine signatures from two copies of the same unsigned transaction.
    ///
    /// Signatures are keyed by public key, so a cosigner present in both
    /// copies is counted once. Metadata missing from `a` is taken from `b`.
    pub fn merge(&self, a: &Psbt, b: &Psbt) -> Result<Psbt, BtcError> {
        let (txid_a, txid_b) = (a.unsigned_tx.compute_txid(), b.unsigned_tx.compute_txid());
        if txid_a != txid_b {
            return Err(BtcError::StructuralPsbt(format!(
                "cannot merge PSBTs of different transactions ({txid_a} vs {txid_b})"
            )));
        }
        let mut merged = a.clone();
        merged
            .combine(b.clone())
            .map_err(|e| BtcError::StructuralPsbt(format!("PSBTs cannot be combined: {e}")))?;
        // Prefer the first copy's signature where both carry one for a key.
        for (merged_input, input) in merged.inputs.iter_mut().zip(&a.inputs) {
            for (key, sig) in &input.partial_sigs {
                merged_input.partial_sigs.insert(*key, *sig);
            }
        }
        log::debug!("merged PSBT copies of {txid_a}");
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Account, SingleSigAccount};
    use crate::script_type::ScriptType;
    use crate::signer::{finalize, sign};
    use crate::test_support::{abandon_master, multisig_2_of_3, multisig_from_seeds, utxo_at, SeedSigner};
    use crate::transaction::{Recipient, TransactionBuilder};
    use bitcoin::{Amount, Witness};
    use rand::seq::SliceRandom;

    fn unsigned_for(account: &Account) -> Psbt {
        let policy = EnginePolicy::default();
        let utxos = vec![utxo_at(account, 0, 0, 'a', 100_000)];
        let recipient = account.receive_address(3).unwrap().address;
        let change = account.change_address(0).unwrap().address;
        TransactionBuilder::new(account, &policy)
            .build(&utxos, &[Recipient::new(recipient, 40_000)], &change, 1.0, None)
            .unwrap()
            .psbt
    }

    fn testnet() -> PsbtCoordinator {
        PsbtCoordinator::new(EnginePolicy::default(), BtcNetwork::Testnet)
    }

    #[test]
    fn excessive_fee_is_a_warning_not_an_error() {
        let account = multisig_2_of_3();
        let mut psbt = unsigned_for(&account);
        // 100_000 in, 40_000 + 1_000 out: fee 59_000 > 50% of 41_000.
        psbt.unsigned_tx.output[1].value = Amount::from_sat(1_000);

        let imported = testnet().import(&testnet().export(&psbt).base64).unwrap();
        assert_eq!(imported.summary.fee_sat, 59_000);
        assert!(imported.warnings.contains(&SecurityWarning::ExcessiveFee {
            fee_sat: 59_000,
            total_output_sat: 41_000
        }));
    }

    #[test]
    fn escalated_warnings_become_errors() {
        let account = multisig_2_of_3();
        let mut psbt = unsigned_for(&account);
        psbt.unsigned_tx.output[1].value = Amount::from_sat(1_000);
        let strict = PsbtCoordinator::new(
            EnginePolicy {
                escalate_warnings: true,
                ..EnginePolicy::default()
            },
            BtcNetwork::Testnet,
        );
        assert!(matches!(strict.review(psbt).unwrap_err(), BtcError::SecurityPolicy(_)));
    }

    #[test]
    fn ordinary_spend_has_no_warnings() {
        let imported = testnet().review(unsigned_for(&multisig_2_of_3())).unwrap();
        assert!(imported.warnings.is_empty());
        assert_eq!(imported.summary.required, vec![2]);
        assert_eq!(imported.summary.signatures, vec![0]);
        assert!(!imported.summary.is_ready_to_finalize());
    }

    #[test]
    fn export_import_round_trip_in_every_encoding() {
        let account = multisig_2_of_3();
        let signed = sign(&unsigned_for(&account), &SeedSigner::from_mnemonic_index(1)).unwrap().psbt;
        let coordinator = PsbtCoordinator::new(
            EnginePolicy {
                chunk_size: 200,
                ..EnginePolicy::default()
            },
            BtcNetwork::Testnet,
        );
        let exported = coordinator.export(&signed);
        assert!(exported.chunks.len() > 1);

        let mut shuffled: Vec<String> = exported.chunks.iter().map(|c| c.to_string()).collect();
        shuffled.shuffle(&mut rand::thread_rng());

        for imported in [
            coordinator.import(&exported.base64).unwrap(),
            coordinator.import(&exported.hex).unwrap(),
            coordinator.import_chunks(&shuffled).unwrap(),
            coordinator.import(&shuffled.join("\n")).unwrap(),
        ] {
            assert_eq!(imported.psbt, signed);
            assert_eq!(imported.summary.signatures, vec![1]);
        }
    }

    #[test]
    fn chunk_text_format() {
        let chunk: PsbtChunk = "psbt:2/3:0a1b2c3d:cHNidP8B".parse().unwrap();
        assert_eq!((chunk.index, chunk.total), (2, 3));
        assert_eq!(chunk.to_string(), "psbt:2/3:0a1b2c3d:cHNidP8B");
        assert!("psbt:0/3:0a1b2c3d:x".parse::<PsbtChunk>().is_err());
        assert!("psbt:4/3:0a1b2c3d:x".parse::<PsbtChunk>().is_err());
        assert!("psbt:1/3:nothex!!:x".parse::<PsbtChunk>().is_err());
        assert!("1/3:0a1b2c3d:x".parse::<PsbtChunk>().is_err());
    }

    #[test]
    fn missing_or_tampered_chunks_rejected() {
        let payload = "A".repeat(50) + &"B".repeat(50);
        let mut chunks = split_into_chunks(&payload, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(reassemble_chunks(&chunks).unwrap(), payload);

        let missing: Vec<_> = chunks.iter().filter(|c| c.index != 2).cloned().collect();
        assert!(reassemble_chunks(&missing).is_err());

        chunks[1].data = "C".repeat(30);
        assert!(reassemble_chunks(&chunks).is_err());
    }

    #[test]
    fn undecodable_input_is_validation_error() {
        for raw in ["", "not a psbt", "70736274ff00", "cHNidP8="] {
            assert!(matches!(testnet().import(raw).unwrap_err(), BtcError::Validation(_)), "{raw:?}");
        }
    }

    #[test]
    fn missing_previous_output_is_structural() {
        let mut psbt = unsigned_for(&multisig_2_of_3());
        psbt.inputs[0].witness_utxo = None;
        assert!(matches!(testnet().review(psbt).unwrap_err(), BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn zero_value_output_is_structural() {
        let mut psbt = unsigned_for(&multisig_2_of_3());
        psbt.unsigned_tx.output[0].value = Amount::ZERO;
        assert!(matches!(testnet().review(psbt).unwrap_err(), BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn overspending_outputs_are_structural() {
        let mut psbt = unsigned_for(&multisig_2_of_3());
        psbt.unsigned_tx.output[0].value = Amount::from_sat(150_000);
        assert!(matches!(testnet().review(psbt).unwrap_err(), BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn threshold_must_match_expected_config() {
        let psbt = unsigned_for(&multisig_2_of_3());
        let matching = MultisigConfig::new(2, 3, ScriptType::MultisigP2SHWrapped).unwrap();
        assert!(testnet().with_expected_config(matching).review(psbt.clone()).is_ok());

        for other in [
            MultisigConfig::new(3, 3, ScriptType::MultisigP2SHWrapped).unwrap(),
            MultisigConfig::new(2, 4, ScriptType::MultisigP2SHWrapped).unwrap(),
            MultisigConfig::new(2, 3, ScriptType::MultisigP2WSH).unwrap(),
        ] {
            let err = testnet().with_expected_config(other).review(psbt.clone()).unwrap_err();
            assert!(matches!(err, BtcError::StructuralPsbt(_)), "{other}");
        }
    }

    #[test]
    fn single_sig_input_fails_multisig_expectation() {
        let account = Account::SingleSig(
            SingleSigAccount::from_master(&abandon_master(), ScriptType::NativeSegWit, 0, BtcNetwork::Testnet).unwrap(),
        );
        let config = MultisigConfig::new(2, 3, ScriptType::MultisigP2WSH).unwrap();
        let err = testnet().with_expected_config(config).review(unsigned_for(&account)).unwrap_err();
        assert!(matches!(err, BtcError::StructuralPsbt(_)));
    }

    fn finalized_2_of_3_wrapped() -> Psbt {
        let (account, signers) = multisig_from_seeds(2, 3, ScriptType::MultisigP2SHWrapped);
        let unsigned = unsigned_for(&account);
        let once = sign(&unsigned, &signers[0]).unwrap().psbt;
        let twice = sign(&once, &signers[2]).unwrap().psbt;
        finalize(&twice).unwrap().psbt
    }

    #[test]
    fn finalized_inputs_are_checked_against_expected_config() {
        let psbt = finalized_2_of_3_wrapped();
        let matching = MultisigConfig::new(2, 3, ScriptType::MultisigP2SHWrapped).unwrap();
        let imported = testnet().with_expected_config(matching).review(psbt.clone()).unwrap();
        assert_eq!(imported.summary.signatures, vec![2]);
        assert_eq!(imported.summary.required, vec![2]);
        assert!(imported.summary.is_ready_to_finalize());

        let stricter = MultisigConfig::new(3, 3, ScriptType::MultisigP2SHWrapped).unwrap();
        let err = testnet().with_expected_config(stricter).review(psbt).unwrap_err();
        assert!(matches!(err, BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn junk_final_witness_is_rejected() {
        let mut psbt = unsigned_for(&multisig_2_of_3());
        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&[vec![0xde, 0xad]]));
        let expected = MultisigConfig::new(3, 3, ScriptType::MultisigP2SHWrapped).unwrap();

        for coordinator in [testnet(), testnet().with_expected_config(expected)] {
            let err = coordinator.review(psbt.clone()).unwrap_err();
            assert!(matches!(err, BtcError::StructuralPsbt(_)), "{err}");
        }
    }

    #[test]
    fn finalized_input_below_threshold_is_rejected() {
        let mut psbt = finalized_2_of_3_wrapped();
        let mut stack: Vec<Vec<u8>> = psbt.inputs[0]
            .final_script_witness
            .as_ref()
            .unwrap()
            .iter()
            .map(<[u8]>::to_vec)
            .collect();
        // [dummy, sig, sig, witness script]
        stack.remove(2);
        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&stack));
        assert!(matches!(testnet().review(psbt).unwrap_err(), BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn finalized_single_sig_input_is_verified() {
        let account = Account::SingleSig(
            SingleSigAccount::from_master(&abandon_master(), ScriptType::NativeSegWit, 0, BtcNetwork::Testnet).unwrap(),
        );
        let signed = sign(&unsigned_for(&account), &SeedSigner::new(abandon_master())).unwrap().psbt;
        let finalized = finalize(&signed).unwrap().psbt;
        let imported = testnet().review(finalized.clone()).unwrap();
        assert_eq!(imported.summary.signatures, vec![1]);

        let mut foreign = finalized;
        let stranger = SeedSigner::from_mnemonic_index(1)
            .master()
            .derive("m/84'/1'/0'/0/0")
            .unwrap()
            .public_key();
        let mut stack: Vec<Vec<u8>> = foreign.inputs[0]
            .final_script_witness
            .as_ref()
            .unwrap()
            .iter()
            .map(<[u8]>::to_vec)
            .collect();
        stack[1] = stranger.to_bytes();
        foreign.inputs[0].final_script_witness = Some(Witness::from_slice(&stack));
        assert!(matches!(testnet().review(foreign).unwrap_err(), BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn foreign_coin_type_is_flagged() {
        let psbt = unsigned_for(&multisig_2_of_3());
        let mainnet = PsbtCoordinator::new(EnginePolicy::default(), BtcNetwork::Mainnet);
        let imported = mainnet.review(psbt.clone()).unwrap();
        assert!(imported
            .warnings
            .contains(&SecurityWarning::NetworkMismatch { input: 0, coin_type: 1 }));

        let quiet = PsbtCoordinator::new(
            EnginePolicy {
                warn_on_network_mismatch: false,
                ..EnginePolicy::default()
            },
            BtcNetwork::Mainnet,
        );
        assert!(quiet.review(psbt).unwrap().warnings.is_empty());
    }

    #[test]
    fn merge_unions_signatures_without_double_counting() {
        let (account, signers) = multisig_from_seeds(2, 3, ScriptType::MultisigP2WSH);
        let unsigned = unsigned_for(&account);
        let from_first = sign(&unsigned, &signers[0]).unwrap().psbt;
        let from_third = sign(&unsigned, &signers[2]).unwrap().psbt;

        let coordinator = testnet();
        let merged = coordinator.merge(&from_first, &from_third).unwrap();
        assert_eq!(count_valid_signatures(&merged, 0).unwrap(), 2);

        let again = coordinator.merge(&merged, &from_first).unwrap();
        assert_eq!(again.inputs[0].partial_sigs.len(), 2);
        assert!(finalize(&again).is_ok());
    }

    #[test]
    fn merge_fills_missing_metadata() {
        let (account, signers) = multisig_from_seeds(2, 2, ScriptType::MultisigP2WSH);
        let unsigned = unsigned_for(&account);
        let mut stripped = sign(&unsigned, &signers[0]).unwrap().psbt;
        stripped.inputs[0].witness_script = None;
        let merged = testnet().merge(&stripped, &unsigned).unwrap();
        assert!(merged.inputs[0].witness_script.is_some());
        assert_eq!(merged.inputs[0].partial_sigs.len(), 1);
    }

    #[test]
    fn merge_rejects_different_transactions() {
        let account = multisig_2_of_3();
        let a = unsigned_for(&account);
        let mut b = a.clone();
        b.unsigned_tx.output[0].value = Amount::from_sat(39_000);
        assert!(matches!(testnet().merge(&a, &b).unwrap_err(), BtcError::StructuralPsbt(_)));
    }
}
