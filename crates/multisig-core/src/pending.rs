//! Lifecycle of a multisig transaction while cosigners collect signatures.
//!
//! `Created → PartiallySigned → ReadyToFinalize → Finalized → Broadcast`,
//! with `Expired` and `Rejected` as dead ends. Time is always supplied by the
//! caller as seconds since the Unix epoch.

use std::fmt;

use bitcoin::psbt::Psbt;
use bitcoin::Txid;

use crate::error::BtcError;
use crate::multisig::MultisigConfig;
use crate::policy::EnginePolicy;
use crate::psbt::PsbtCoordinator;
use crate::signer::{self, count_valid_signatures, FinalizedTransaction, KeyProvider};
use crate::spend::SpendInfo;
use crate::transaction::verify_before_broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingStatus {
    Created,
    PartiallySigned,
    ReadyToFinalize,
    Finalized,
    Broadcast,
    Expired,
    Rejected,
}

impl PendingStatus {
    /// Still collecting signatures.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            PendingStatus::Created | PendingStatus::PartiallySigned | PendingStatus::ReadyToFinalize
        )
    }
}

impl fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PendingStatus::Created => "created",
            PendingStatus::PartiallySigned => "partially signed",
            PendingStatus::ReadyToFinalize => "ready to finalize",
            PendingStatus::Finalized => "finalized",
            PendingStatus::Broadcast => "broadcast",
            PendingStatus::Expired => "expired",
            PendingStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct PendingMultisigTransaction {
    txid: Txid,
    psbt: Psbt,
    config: MultisigConfig,
    signatures: Vec<usize>,
    status: PendingStatus,
    created_at: u64,
    expires_at: u64,
    finalized: Option<FinalizedTransaction>,
    rejection: Option<String>,
}

impl PendingMultisigTransaction {
    /// Track `psbt`, every input of which must spend from `config`.
    pub fn create(psbt: Psbt, config: MultisigConfig, now: u64, ttl_secs: u64) -> Result<Self, BtcError> {
        if psbt.inputs.is_empty() {
            return Err(BtcError::StructuralPsbt("transaction has no inputs".into()));
        }
        for index in 0..psbt.inputs.len() {
            let spend = SpendInfo::from_input(&psbt, index)?;
            let matches = spend.script_type == config.script_type()
                && spend
                    .multisig
                    .as_ref()
                    .is_some_and(|(m, keys)| *m == config.required() && keys.len() == usize::from(config.total()));
            if !matches {
                return Err(BtcError::StructuralPsbt(format!(
                    "input {index} does not spend from a {config} script"
                )));
            }
        }

        let mut pending = Self {
            txid: psbt.unsigned_tx.compute_txid(),
            psbt,
            config,
            signatures: Vec::new(),
            status: PendingStatus::Created,
            created_at: now,
            expires_at: now.saturating_add(ttl_secs),
            finalized: None,
            rejection: None,
        };
        pending.recount()?;
        log::info!("tracking {} ({config}), {}", pending.txid, pending.status);
        Ok(pending)
    }

    /// Same as [`create`](Self::create) with the policy's lifetime.
    pub fn with_policy(psbt: Psbt, config: MultisigConfig, now: u64, policy: &EnginePolicy) -> Result<Self, BtcError> {
        Self::create(psbt, config, now, policy.pending_ttl_secs)
    }

    pub fn txid(&self) -> Txid {
        self.txid
    }

    pub fn psbt(&self) -> &Psbt {
        &self.psbt
    }

    pub fn config(&self) -> &MultisigConfig {
        &self.config
    }

    pub fn required_signatures(&self) -> usize {
        usize::from(self.config.required())
    }

    /// Verified signatures per input.
    pub fn signatures(&self) -> &[usize] {
        &self.signatures
    }

    pub fn status(&self) -> PendingStatus {
        self.status
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn finalized(&self) -> Option<&FinalizedTransaction> {
        self.finalized.as_ref()
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// Move an open transaction to `Expired` once `now` reaches its expiry.
    pub fn check_expiry(&mut self, now: u64) -> PendingStatus {
        if self.status.is_open() && now >= self.expires_at {
            log::info!("{} expired at {}", self.txid, self.expires_at);
            self.status = PendingStatus::Expired;
        }
        self.status
    }

    fn ensure_open(&mut self, now: u64, action: &str) -> Result<(), BtcError> {
        match self.check_expiry(now) {
            PendingStatus::Expired => Err(BtcError::Expired {
                expired_at: self.expires_at,
            }),
            status if status.is_open() => Ok(()),
            status => Err(BtcError::InvalidState(format!(
                "cannot {action} a {status} transaction"
            ))),
        }
    }

    fn recount(&mut self) -> Result<(), BtcError> {
        self.signatures = (0..self.psbt.inputs.len())
            .map(|index| count_valid_signatures(&self.psbt, index))
            .collect::<Result<_, _>>()?;
        let required = self.required_signatures();
        self.status = if self.signatures.iter().all(|have| *have >= required) {
            PendingStatus::ReadyToFinalize
        } else if self.signatures.iter().any(|have| *have > 0) {
            PendingStatus::PartiallySigned
        } else {
            PendingStatus::Created
        };
        Ok(())
    }

    fn total_signatures(&self) -> usize {
        self.signatures.iter().sum()
    }

    /// Merge a cosigner's copy in. Returns the number of new valid signatures.
    pub fn add_signatures(&mut self, other: &Psbt, coordinator: &PsbtCoordinator, now: u64) -> Result<usize, BtcError> {
        self.ensure_open(now, "add signatures to")?;
        let before = self.total_signatures();
        let merged = coordinator.merge(&self.psbt, other)?;
        self.psbt = merged;
        self.recount()?;
        let added = self.total_signatures().saturating_sub(before);
        log::info!("{}: merged {added} signature(s), now {}", self.txid, self.status);
        Ok(added)
    }

    /// Sign with a local key provider. Returns the number of signatures added.
    pub fn sign(&mut self, provider: &dyn KeyProvider, now: u64) -> Result<usize, BtcError> {
        self.ensure_open(now, "sign")?;
        let outcome = signer::sign(&self.psbt, provider)?;
        self.psbt = outcome.psbt;
        self.recount()?;
        log::info!("{}: signed locally, now {}", self.txid, self.status);
        Ok(outcome.signatures_added)
    }

    /// Build the final transaction.
    ///
    /// A transaction that fails the pre-broadcast checks once finalized is
    /// marked `Rejected`.
    pub fn finalize(&mut self, now: u64, policy: &EnginePolicy) -> Result<&FinalizedTransaction, BtcError> {
        self.ensure_open(now, "finalize")?;
        if self.status != PendingStatus::ReadyToFinalize {
            let required = self.required_signatures();
            let (input, have) = self
                .signatures
                .iter()
                .copied()
                .enumerate()
                .find(|(_, have)| *have < required)
                .unwrap_or((0, 0));
            return Err(BtcError::InsufficientSignatures {
                input,
                have,
                need: required,
            });
        }

        let finalized = signer::finalize(&self.psbt)?;
        let vsize = finalized.tx.vsize() as u64;
        if let Err(e) = verify_before_broadcast(&self.psbt, vsize, policy) {
            self.reject_with(e.to_string());
            return Err(e);
        }
        log::info!("{} finalized, {} bytes", self.txid, finalized.raw.len());
        self.status = PendingStatus::Finalized;
        Ok(self.finalized.insert(finalized))
    }

    /// Record that the finalized transaction was handed to the network.
    pub fn mark_broadcast(&mut self) -> Result<(), BtcError> {
        if self.status != PendingStatus::Finalized {
            return Err(BtcError::InvalidState(format!(
                "cannot broadcast a {} transaction",
                self.status
            )));
        }
        log::info!("{} broadcast", self.txid);
        self.status = PendingStatus::Broadcast;
        Ok(())
    }

    /// Abandon an open transaction.
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), BtcError> {
        if !self.status.is_open() {
            return Err(BtcError::InvalidState(format!("cannot reject a {} transaction", self.status)));
        }
        self.reject_with(reason.into());
        Ok(())
    }

    fn reject_with(&mut self, reason: String) {
        log::warn!("{} rejected: {reason}", self.txid);
        self.rejection = Some(reason);
        self.status = PendingStatus::Rejected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::network::BtcNetwork;
    use crate::script_type::ScriptType;
    use crate::test_support::{multisig_from_seeds, utxo_at, SeedSigner};
    use crate::transaction::{Recipient, TransactionBuilder};

    const T0: u64 = 1_700_000_000;
    const DAY: u64 = 86_400;

    fn unsigned(account: &Account) -> Psbt {
        let policy = EnginePolicy::default();
        let utxos = vec![utxo_at(account, 0, 0, 'c', 250_000), utxo_at(account, 0, 1, 'd', 50_000)];
        let to = account.receive_address(7).unwrap().address;
        let change = account.change_address(0).unwrap().address;
        TransactionBuilder::new(account, &policy)
            .build(&utxos, &[Recipient::new(to, 260_000)], &change, 2.0, None)
            .unwrap()
            .psbt
    }

    fn setup(m: u8, n: u8) -> (PendingMultisigTransaction, Vec<SeedSigner>, Account) {
        let (account, signers) = multisig_from_seeds(m, n, ScriptType::MultisigP2WSH);
        let config = *account.multisig_config().unwrap();
        let pending = PendingMultisigTransaction::create(unsigned(&account), config, T0, 7 * DAY).unwrap();
        (pending, signers, account)
    }

    #[test]
    fn walks_the_happy_path() {
        let (mut pending, signers, _) = setup(2, 3);
        assert_eq!(pending.status(), PendingStatus::Created);
        assert_eq!(pending.signatures(), &[0, 0]);

        assert_eq!(pending.sign(&signers[1], T0 + 10).unwrap(), 2);
        assert_eq!(pending.status(), PendingStatus::PartiallySigned);

        let coordinator = PsbtCoordinator::new(EnginePolicy::default(), BtcNetwork::Testnet);
        let cosigner_copy = signer::sign(pending.psbt(), &signers[2]).unwrap().psbt;
        assert_eq!(pending.add_signatures(&cosigner_copy, &coordinator, T0 + 20).unwrap(), 2);
        assert_eq!(pending.status(), PendingStatus::ReadyToFinalize);

        let txid = pending.finalize(T0 + 30, &EnginePolicy::default()).unwrap().txid;
        assert_eq!(txid, pending.txid());
        assert_eq!(pending.status(), PendingStatus::Finalized);

        pending.mark_broadcast().unwrap();
        assert_eq!(pending.status(), PendingStatus::Broadcast);
    }

    #[test]
    fn resubmitted_signatures_are_not_recounted() {
        let (mut pending, signers, _) = setup(2, 3);
        pending.sign(&signers[0], T0).unwrap();
        let copy = pending.psbt().clone();
        let coordinator = PsbtCoordinator::new(EnginePolicy::default(), BtcNetwork::Testnet);
        assert_eq!(pending.add_signatures(&copy, &coordinator, T0).unwrap(), 0);
        assert_eq!(pending.sign(&signers[0], T0).unwrap(), 0);
        assert_eq!(pending.signatures(), &[1, 1]);
        assert_eq!(pending.status(), PendingStatus::PartiallySigned);
    }

    #[test]
    fn finalize_below_threshold_fails() {
        let (mut pending, signers, _) = setup(3, 5);
        pending.sign(&signers[0], T0).unwrap();
        pending.sign(&signers[4], T0).unwrap();
        let err = pending.finalize(T0, &EnginePolicy::default()).unwrap_err();
        assert!(matches!(err, BtcError::InsufficientSignatures { have: 2, need: 3, .. }));
        assert_eq!(pending.status(), PendingStatus::PartiallySigned);
    }

    #[test]
    fn expiry_is_checked_on_access() {
        let (mut pending, signers, _) = setup(2, 2);
        assert_eq!(pending.check_expiry(T0 + 7 * DAY - 1), PendingStatus::Created);
        let err = pending.sign(&signers[0], T0 + 7 * DAY).unwrap_err();
        assert!(matches!(err, BtcError::Expired { expired_at } if expired_at == T0 + 7 * DAY));
        assert_eq!(pending.status(), PendingStatus::Expired);
        assert!(matches!(pending.reject("late").unwrap_err(), BtcError::InvalidState(_)));
    }

    #[test]
    fn finalized_transactions_do_not_expire() {
        let (mut pending, signers, _) = setup(1, 2);
        pending.sign(&signers[1], T0).unwrap();
        pending.finalize(T0, &EnginePolicy::default()).unwrap();
        assert_eq!(pending.check_expiry(T0 + 30 * DAY), PendingStatus::Finalized);
    }

    #[test]
    fn illegal_transitions() {
        let (mut pending, signers, _) = setup(2, 2);
        assert!(matches!(pending.mark_broadcast().unwrap_err(), BtcError::InvalidState(_)));

        pending.reject("cosigner declined").unwrap();
        assert_eq!(pending.status(), PendingStatus::Rejected);
        assert_eq!(pending.rejection_reason(), Some("cosigner declined"));
        assert!(matches!(pending.sign(&signers[0], T0).unwrap_err(), BtcError::InvalidState(_)));
        assert!(matches!(
            pending.finalize(T0, &EnginePolicy::default()).unwrap_err(),
            BtcError::InvalidState(_)
        ));
    }

    #[test]
    fn foreign_transaction_is_not_tracked() {
        let (account, _) = multisig_from_seeds(2, 3, ScriptType::MultisigP2WSH);
        let other = MultisigConfig::new(3, 3, ScriptType::MultisigP2WSH).unwrap();
        let err = PendingMultisigTransaction::create(unsigned(&account), other, T0, DAY).unwrap_err();
        assert!(matches!(err, BtcError::StructuralPsbt(_)));
    }

    #[test]
    fn merge_of_a_different_transaction_keeps_state() {
        let (mut pending, _, _) = setup(2, 3);
        let mut foreign = pending.psbt().clone();
        foreign.unsigned_tx.lock_time = bitcoin::absolute::LockTime::from_consensus(1);
        let coordinator = PsbtCoordinator::new(EnginePolicy::default(), BtcNetwork::Testnet);
        assert!(pending.add_signatures(&foreign, &coordinator, T0).is_err());
        assert_eq!(pending.status(), PendingStatus::Created);
    }
}
