//! One account's working context: its policy, addresses, PSBT coordinator
//! and the multisig transactions still collecting signatures.

use std::collections::BTreeMap;

use bitcoin::psbt::Psbt;
use bitcoin::Txid;
use multisig_core::account::{Account, CHANGE_BRANCH, RECEIVE_BRANCH};
use multisig_core::pending::{PendingMultisigTransaction, PendingStatus};
use multisig_core::psbt::{ExportedPsbt, ImportedPsbt, PsbtCoordinator};
use multisig_core::signer::{self, FinalizedTransaction, KeyProvider, SignOutcome};
use multisig_core::transaction::{BuiltTransaction, Recipient, SigningStatus, TransactionBuilder};
use multisig_core::utxo::Utxo;
use multisig_core::{BtcError, BtcNetwork, EnginePolicy};

use crate::address_book::AddressBook;
use crate::error::WalletError;
use crate::types::DerivedAddress;

pub struct WalletSession {
    account: Account,
    policy: EnginePolicy,
    addresses: AddressBook,
    coordinator: PsbtCoordinator,
    pending: BTreeMap<Txid, PendingMultisigTransaction>,
    /// Change addresses held by pending transactions until they settle.
    reserved_change: BTreeMap<Txid, String>,
}

impl WalletSession {
    pub fn new(account: Account, policy: EnginePolicy) -> Result<Self, WalletError> {
        policy.validate()?;
        let addresses = AddressBook::new(&account, policy.gap_limit)?;
        let mut coordinator = PsbtCoordinator::new(policy.clone(), account.network());
        if let Some(config) = account.multisig_config() {
            coordinator = coordinator.with_expected_config(*config);
        }
        log::info!("session opened for {} account on {}", account.script_type(), account.network());
        Ok(Self {
            account,
            policy,
            addresses,
            coordinator,
            pending: BTreeMap::new(),
            reserved_change: BTreeMap::new(),
        })
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn network(&self) -> BtcNetwork {
        self.account.network()
    }

    pub fn policy(&self) -> &EnginePolicy {
        &self.policy
    }

    pub fn addresses(&self) -> &AddressBook {
        &self.addresses
    }

    fn next_unused(&self, branch: u32) -> Result<&DerivedAddress, WalletError> {
        self.addresses
            .next_unused(branch)
            .ok_or_else(|| BtcError::Validation(format!("no unused address on branch {branch}")).into())
    }

    /// Address to hand out for the next incoming payment.
    pub fn receive_address(&self) -> Result<&DerivedAddress, WalletError> {
        self.next_unused(RECEIVE_BRANCH)
    }

    pub fn change_address(&self) -> Result<&DerivedAddress, WalletError> {
        self.next_unused(CHANGE_BRANCH)
    }

    /// Record on-chain activity for one of this wallet's addresses.
    pub fn mark_used(&mut self, address: &str, txid: &str) -> Result<bool, WalletError> {
        self.addresses.mark_used(&self.account, address, txid)
    }

    /// Retire a handed-out address that will not be paid to.
    pub fn mark_stale(&mut self, address: &str) -> Result<bool, WalletError> {
        self.addresses.mark_stale(&self.account, address)
    }

    /// Turn an output reported by the chain backend into a spendable UTXO.
    pub fn utxo(&self, txid: &str, vout: u32, amount_sat: u64, address: &str) -> Result<Utxo, WalletError> {
        let entry = self
            .addresses
            .lookup(address)?
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))?;
        Ok(Utxo {
            txid: txid.to_string(),
            vout,
            amount_sat,
            address: entry.address.clone(),
            script_type: self.account.script_type(),
            derivation_path: entry.derivation_path.clone(),
            script_pubkey: entry.script_pubkey.clone(),
        })
    }

    /// Build a payment, signing with `provider` if given.
    ///
    /// Multisig spends that are not yet finalized are tracked as pending, and
    /// their change address goes back to the pool if they expire or are
    /// rejected.
    pub fn build_transaction(
        &mut self,
        utxos: &[Utxo],
        recipients: &[Recipient],
        fee_rate: f64,
        provider: Option<&dyn KeyProvider>,
        now: u64,
    ) -> Result<BuiltTransaction, WalletError> {
        let change_address = self.change_address()?.address.clone();
        let built = TransactionBuilder::new(&self.account, &self.policy).build(
            utxos,
            recipients,
            &change_address,
            fee_rate,
            provider,
        )?;
        let has_change = built.outputs.iter().any(|o| o.is_change);
        if has_change {
            self.addresses
                .mark_used(&self.account, &change_address, &built.txid.to_string())?;
        }

        if let Some(config) = self.account.multisig_config() {
            if built.status != SigningStatus::Finalized {
                let pending = PendingMultisigTransaction::with_policy(built.psbt.clone(), *config, now, &self.policy)?;
                self.pending.insert(built.txid, pending);
                if has_change {
                    self.reserved_change.insert(built.txid, change_address);
                }
            }
        }
        Ok(built)
    }

    pub fn import_psbt(&self, raw: &str) -> Result<ImportedPsbt, WalletError> {
        Ok(self.coordinator.import(raw)?)
    }

    pub fn export_psbt(&self, psbt: &Psbt) -> ExportedPsbt {
        self.coordinator.export(psbt)
    }

    /// Add this provider's signatures to any PSBT without tracking it.
    pub fn sign_psbt(&self, psbt: &Psbt, provider: &dyn KeyProvider) -> Result<SignOutcome, WalletError> {
        Ok(signer::sign(psbt, provider)?)
    }

    fn track(&mut self, psbt: Psbt, now: u64) -> Result<Txid, WalletError> {
        let config = *self
            .account
            .multisig_config()
            .ok_or_else(|| BtcError::InvalidState("only multisig sessions track pending transactions".into()))?;
        let pending = PendingMultisigTransaction::with_policy(psbt, config, now, &self.policy)?;
        let txid = pending.txid();
        self.pending.insert(txid, pending);
        Ok(txid)
    }

    /// Take in a cosigner's PSBT (any transport encoding). Unknown
    /// transactions start being tracked. Returns the txid and the number of
    /// new signatures.
    pub fn add_signatures(&mut self, raw: &str, now: u64) -> Result<(Txid, usize), WalletError> {
        let imported = self.import_psbt(raw)?;
        let txid = imported.summary.txid;
        if !self.pending.contains_key(&txid) {
            self.track(imported.psbt, now)?;
            let count = self.pending_ref(&txid)?.signatures().iter().sum();
            return Ok((txid, count));
        }
        let pending = self
            .pending
            .get_mut(&txid)
            .ok_or_else(|| WalletError::UnknownTransaction(txid.to_string()))?;
        let added = pending.add_signatures(&imported.psbt, &self.coordinator, now)?;
        Ok((txid, added))
    }

    fn pending_ref(&self, txid: &Txid) -> Result<&PendingMultisigTransaction, WalletError> {
        self.pending
            .get(txid)
            .ok_or_else(|| WalletError::UnknownTransaction(txid.to_string()))
    }

    fn pending_mut(&mut self, txid: &Txid) -> Result<&mut PendingMultisigTransaction, WalletError> {
        self.pending
            .get_mut(txid)
            .ok_or_else(|| WalletError::UnknownTransaction(txid.to_string()))
    }

    pub fn pending(&self, txid: &Txid) -> Option<&PendingMultisigTransaction> {
        self.pending.get(txid)
    }

    pub fn pending_transactions(&self) -> impl Iterator<Item = &PendingMultisigTransaction> {
        self.pending.values()
    }

    pub fn sign_pending(&mut self, txid: &Txid, provider: &dyn KeyProvider, now: u64) -> Result<usize, WalletError> {
        Ok(self.pending_mut(txid)?.sign(provider, now)?)
    }

    /// Export the current state of a pending transaction for other cosigners.
    pub fn export_pending(&self, txid: &Txid) -> Result<ExportedPsbt, WalletError> {
        Ok(self.coordinator.export(self.pending_ref(txid)?.psbt()))
    }

    pub fn finalize_pending(&mut self, txid: &Txid, now: u64) -> Result<FinalizedTransaction, WalletError> {
        let policy = self.policy.clone();
        let result = self.pending_mut(txid)?.finalize(now, &policy).cloned();
        if result.is_err() {
            self.release_abandoned_change();
        }
        Ok(result?)
    }

    /// Record that the chain backend accepted a finalized transaction.
    pub fn mark_broadcast(&mut self, txid: &Txid) -> Result<(), WalletError> {
        self.pending_mut(txid)?.mark_broadcast()?;
        self.reserved_change.remove(txid);
        Ok(())
    }

    pub fn reject_pending(&mut self, txid: &Txid, reason: &str) -> Result<(), WalletError> {
        self.pending_mut(txid)?.reject(reason)?;
        self.release_abandoned_change();
        Ok(())
    }

    /// Expire every open transaction past its lifetime. Returns their txids.
    ///
    /// Change addresses of every expired or rejected transaction are released
    /// here, including ones that expired during an earlier call.
    pub fn expire_pending(&mut self, now: u64) -> Vec<Txid> {
        let expired: Vec<Txid> = self
            .pending
            .values_mut()
            .filter(|p| p.status().is_open())
            .filter_map(|p| (p.check_expiry(now) == PendingStatus::Expired).then(|| p.txid()))
            .collect();
        self.release_abandoned_change();
        expired
    }

    fn release_abandoned_change(&mut self) {
        let abandoned: Vec<Txid> = self
            .reserved_change
            .keys()
            .filter(|txid| {
                self.pending
                    .get(*txid)
                    .map_or(true, |p| matches!(p.status(), PendingStatus::Expired | PendingStatus::Rejected))
            })
            .copied()
            .collect();
        for txid in abandoned {
            let Some(address) = self.reserved_change.remove(&txid) else {
                continue;
            };
            if let Err(e) = self.addresses.release(&address, &txid.to_string()) {
                log::warn!("could not release change address {address} of {txid}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hd_derivation::{export_cosigner, multisig_account, single_sig_account};
    use crate::key_provider::SeedKeyProvider;
    use multisig_core::{MultisigConfig, ScriptType};

    const ABANDON: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
    const LEGAL: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";
    const T0: u64 = 1_700_000_000;

    fn provider(phrase: &str) -> SeedKeyProvider {
        SeedKeyProvider::from_mnemonic(phrase, "", BtcNetwork::Testnet).unwrap()
    }

    fn two_of_two_session(own: &SeedKeyProvider) -> WalletSession {
        let exports: Vec<_> = [ABANDON, LEGAL]
            .iter()
            .map(|m| {
                let p = provider(m);
                let export = export_cosigner(p.master().unwrap(), ScriptType::MultisigP2WSH, 0, BtcNetwork::Testnet)
                    .unwrap();
                (m.split(' ').next().unwrap().to_string(), export)
            })
            .collect();
        let config = MultisigConfig::new(2, 2, ScriptType::MultisigP2WSH).unwrap();
        let account = multisig_account(config, &exports, Some(own.fingerprint()), BtcNetwork::Testnet).unwrap();
        WalletSession::new(account, EnginePolicy::default()).unwrap()
    }

    fn funded(session: &WalletSession, amount: u64) -> Utxo {
        let address = session.receive_address().unwrap().address.clone();
        session.utxo(&"e".repeat(64), 0, amount, &address).unwrap()
    }

    #[test]
    fn invalid_policy_rejected() {
        let p = provider(ABANDON);
        let account =
            single_sig_account(p.master().unwrap(), ScriptType::NativeSegWit, 0, BtcNetwork::Testnet).unwrap();
        let policy = EnginePolicy {
            gap_limit: 0,
            ..EnginePolicy::default()
        };
        assert!(WalletSession::new(account, policy).is_err());
    }

    #[test]
    fn single_sig_spend_is_finalized_and_not_tracked() {
        let p = provider(ABANDON);
        let account =
            single_sig_account(p.master().unwrap(), ScriptType::NativeSegWit, 0, BtcNetwork::Testnet).unwrap();
        let mut session = WalletSession::new(account, EnginePolicy::default()).unwrap();
        let utxo = funded(&session, 80_000);
        let change_before = session.change_address().unwrap().address.clone();

        let built = session
            .build_transaction(
                &[utxo],
                &[Recipient::new("mkpZhYtJu2r87Js3pDiWJDmPte2NRZ8bJV", 30_000)],
                1.0,
                Some(&p),
                T0,
            )
            .unwrap();
        assert_eq!(built.status, SigningStatus::Finalized);
        assert!(built.raw_tx.is_some());
        assert_eq!(session.pending_transactions().count(), 0);
        assert_ne!(session.change_address().unwrap().address, change_before);
    }

    #[test]
    fn multisig_spend_collects_cosigner_signatures() {
        let abandon = provider(ABANDON);
        let legal = provider(LEGAL);
        let mut ours = two_of_two_session(&abandon);
        let mut theirs = two_of_two_session(&legal);

        let utxo = funded(&ours, 120_000);
        let to = ours.receive_address().unwrap().address.clone();
        let built = ours
            .build_transaction(&[utxo], &[Recipient::new(to, 50_000)], 2.0, Some(&abandon), T0)
            .unwrap();
        assert_eq!(built.status, SigningStatus::PartiallySigned);
        let txid = built.txid;
        assert_eq!(ours.pending(&txid).unwrap().status(), PendingStatus::PartiallySigned);

        let (seen, count) = theirs.add_signatures(&ours.export_pending(&txid).unwrap().base64, T0 + 60).unwrap();
        assert_eq!((seen, count), (txid, 1));
        assert_eq!(theirs.sign_pending(&txid, &legal, T0 + 120).unwrap(), 1);

        let reply = theirs.export_pending(&txid).unwrap().hex;
        assert_eq!(ours.add_signatures(&reply, T0 + 180).unwrap(), (txid, 1));
        assert_eq!(ours.pending(&txid).unwrap().status(), PendingStatus::ReadyToFinalize);

        let finalized = ours.finalize_pending(&txid, T0 + 240).unwrap();
        assert_eq!(finalized.txid, txid);
        ours.mark_broadcast(&txid).unwrap();
        assert_eq!(ours.pending(&txid).unwrap().status(), PendingStatus::Broadcast);
    }

    #[test]
    fn expiry_sweep() {
        let abandon = provider(ABANDON);
        let mut session = two_of_two_session(&abandon);
        let utxo = funded(&session, 120_000);
        let to = session.receive_address().unwrap().address.clone();
        let built = session
            .build_transaction(&[utxo], &[Recipient::new(to, 50_000)], 1.0, None, T0)
            .unwrap();

        let ttl = session.policy().pending_ttl_secs;
        assert!(session.expire_pending(T0 + ttl - 1).is_empty());
        assert_eq!(session.expire_pending(T0 + ttl), vec![built.txid]);
        assert!(session.expire_pending(T0 + ttl + 1).is_empty());
        assert!(matches!(
            session.sign_pending(&built.txid, &abandon, T0 + ttl).unwrap_err(),
            WalletError::Engine(BtcError::Expired { .. })
        ));
    }

    #[test]
    fn rejected_spend_gives_its_change_address_back() {
        let abandon = provider(ABANDON);
        let mut session = two_of_two_session(&abandon);
        let to = session.receive_address().unwrap().address.clone();
        let change_before = session.change_address().unwrap().clone();

        let utxo = funded(&session, 120_000);
        let built = session
            .build_transaction(&[utxo], &[Recipient::new(to.clone(), 50_000)], 1.0, None, T0)
            .unwrap();
        assert_ne!(session.change_address().unwrap().index, change_before.index);

        session.reject_pending(&built.txid, "cosigner declined").unwrap();
        let change_after = session.change_address().unwrap();
        assert_eq!(change_after.index, change_before.index);
        assert_eq!(change_after.address, change_before.address);
        assert!(!change_after.used);

        let utxo = funded(&session, 90_000);
        let expiring = session
            .build_transaction(&[utxo], &[Recipient::new(to, 20_000)], 1.0, None, T0)
            .unwrap();
        assert_eq!(session.change_address().unwrap().index, change_before.index + 1);
        let ttl = session.policy().pending_ttl_secs;
        assert_eq!(session.expire_pending(T0 + ttl), vec![expiring.txid]);
        assert_eq!(session.change_address().unwrap().index, change_before.index);
    }

    #[test]
    fn broadcast_spend_keeps_its_change_address() {
        let abandon = provider(ABANDON);
        let legal = provider(LEGAL);
        let mut ours = two_of_two_session(&abandon);
        let to = ours.receive_address().unwrap().address.clone();
        let change_before = ours.change_address().unwrap().index;

        let utxo = funded(&ours, 120_000);
        let built = ours
            .build_transaction(&[utxo], &[Recipient::new(to, 50_000)], 1.0, Some(&abandon), T0)
            .unwrap();
        let signed = ours.sign_psbt(ours.pending(&built.txid).unwrap().psbt(), &legal).unwrap();
        let reply = ours.export_psbt(&signed.psbt).base64;
        ours.add_signatures(&reply, T0).unwrap();
        ours.finalize_pending(&built.txid, T0).unwrap();
        ours.mark_broadcast(&built.txid).unwrap();

        let ttl = ours.policy().pending_ttl_secs;
        ours.expire_pending(T0 + ttl);
        assert_eq!(ours.change_address().unwrap().index, change_before + 1);
    }

    #[test]
    fn unknown_pending_transaction() {
        let abandon = provider(ABANDON);
        let mut session = two_of_two_session(&abandon);
        let txid: Txid = "aa".repeat(32).parse().unwrap();
        assert!(matches!(
            session.mark_broadcast(&txid).unwrap_err(),
            WalletError::UnknownTransaction(_)
        ));
    }

    #[test]
    fn utxo_for_foreign_address_rejected() {
        let abandon = provider(ABANDON);
        let session = two_of_two_session(&abandon);
        let err = session
            .utxo(&"e".repeat(64), 0, 1_000, "tb1q6rz28mcfaxtmd6v789l9rrlrusdprr9pqcpvkl")
            .unwrap_err();
        assert!(matches!(err, WalletError::UnknownAddress(_)));
    }
}
