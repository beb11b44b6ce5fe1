//! Receive and change addresses kept `gap_limit` unused addresses ahead of
//! the last one seen on chain.

use bitcoin::ScriptBuf;
use multisig_core::account::{Account, CHANGE_BRANCH, RECEIVE_BRANCH};
use multisig_core::address::parse_address;
use multisig_core::{BtcError, BtcNetwork};

use crate::error::WalletError;
use crate::types::DerivedAddress;

#[derive(Debug, Clone)]
pub struct AddressBook {
    network: BtcNetwork,
    gap_limit: u32,
    /// Imported keys have exactly one address, reused for change.
    single: bool,
    receive: Vec<DerivedAddress>,
    change: Vec<DerivedAddress>,
}

fn derive(account: &Account, branch: u32, index: u32) -> Result<DerivedAddress, WalletError> {
    let output = account.address(branch, index)?;
    Ok(DerivedAddress {
        address: output.address,
        branch,
        index,
        derivation_path: account.derivation_path(branch, index)?,
        script_pubkey: output.script_pubkey,
        used: false,
        first_seen_txid: None,
        stale: false,
    })
}

impl AddressBook {
    pub fn new(account: &Account, gap_limit: u32) -> Result<Self, WalletError> {
        if gap_limit == 0 {
            return Err(BtcError::Validation("gap limit must be positive".into()).into());
        }
        let single = matches!(account, Account::Imported(_));
        let mut book = Self {
            network: account.network(),
            gap_limit,
            single,
            receive: Vec::new(),
            change: Vec::new(),
        };
        if single {
            book.receive.push(derive(account, RECEIVE_BRANCH, 0)?);
            book.change.push(derive(account, CHANGE_BRANCH, 0)?);
        } else {
            book.fill(account, RECEIVE_BRANCH)?;
            book.fill(account, CHANGE_BRANCH)?;
        }
        Ok(book)
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    /// Every tracked address on `branch`, in index order.
    pub fn addresses(&self, branch: u32) -> &[DerivedAddress] {
        if branch == CHANGE_BRANCH {
            &self.change
        } else {
            &self.receive
        }
    }

    fn branch_mut(&mut self, branch: u32) -> &mut Vec<DerivedAddress> {
        if branch == CHANGE_BRANCH {
            &mut self.change
        } else {
            &mut self.receive
        }
    }

    fn fill(&mut self, account: &Account, branch: u32) -> Result<(), WalletError> {
        let gap = self.gap_limit as usize;
        loop {
            let list = self.addresses(branch);
            let unused_tail = match list.iter().rposition(|a| a.used) {
                Some(last_used) => list.len() - last_used - 1,
                None => list.len(),
            };
            if unused_tail >= gap && list.iter().any(DerivedAddress::is_fresh) {
                return Ok(());
            }
            let next = u32::try_from(list.len())
                .map_err(|_| BtcError::InvalidPath("address index overflow".into()))?;
            let derived = derive(account, branch, next)?;
            log::debug!("address book: branch {branch} index {next} -> {}", derived.address);
            self.branch_mut(branch).push(derived);
        }
    }

    /// First address on `branch` that is neither used nor stale.
    pub fn next_unused(&self, branch: u32) -> Option<&DerivedAddress> {
        let list = self.addresses(branch);
        if self.single {
            return list.first();
        }
        list.iter().find(|a| a.is_fresh())
    }

    fn position(&self, script_pubkey: &ScriptBuf) -> Option<(u32, usize)> {
        [RECEIVE_BRANCH, CHANGE_BRANCH].into_iter().find_map(|branch| {
            self.addresses(branch)
                .iter()
                .position(|a| a.script_pubkey == *script_pubkey)
                .map(|i| (branch, i))
        })
    }

    /// Look an address up in any encoding the network accepts.
    pub fn lookup(&self, address: &str) -> Result<Option<&DerivedAddress>, WalletError> {
        let script = parse_address(address, self.network)?.script_pubkey();
        Ok(self.position(&script).map(|(branch, i)| &self.addresses(branch)[i]))
    }

    fn locate(&self, address: &str) -> Result<(u32, usize), WalletError> {
        let script = parse_address(address, self.network)?.script_pubkey();
        self.position(&script)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))
    }

    /// Record activity on `address` in `txid` and derive further addresses to
    /// keep the gap. Returns `false` if it was already marked.
    pub fn mark_used(&mut self, account: &Account, address: &str, txid: &str) -> Result<bool, WalletError> {
        let (branch, i) = self.locate(address)?;
        let entry = &mut self.branch_mut(branch)[i];
        if entry.used {
            return Ok(false);
        }
        entry.used = true;
        entry.first_seen_txid = Some(txid.to_string());
        if !self.single {
            self.fill(account, branch)?;
        }
        Ok(true)
    }

    /// Undo `mark_used` for an address whose only activity was `txid`, which
    /// never reached the chain. Addresses derived meanwhile are kept.
    pub fn release(&mut self, address: &str, txid: &str) -> Result<bool, WalletError> {
        let (branch, i) = self.locate(address)?;
        let entry = &mut self.branch_mut(branch)[i];
        if !entry.used || entry.first_seen_txid.as_deref() != Some(txid) {
            return Ok(false);
        }
        entry.used = false;
        entry.first_seen_txid = None;
        log::debug!("address {address} released by {txid}");
        Ok(true)
    }

    /// Stop offering an address that was handed out but never paid to.
    /// Used addresses cannot become stale.
    pub fn mark_stale(&mut self, account: &Account, address: &str) -> Result<bool, WalletError> {
        let (branch, i) = self.locate(address)?;
        if self.single {
            return Ok(false);
        }
        let entry = &mut self.branch_mut(branch)[i];
        if entry.used || entry.stale {
            return Ok(false);
        }
        entry.stale = true;
        log::debug!("address {address} marked stale");
        self.fill(account, branch)?;
        Ok(true)
    }
}
