//! Account sets used for priming backends and for archive snapshots.
//!
//! A [`WorldState`] is an ordered map of accounts. Ordering by address keeps
//! priming deterministic and makes two states directly comparable.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::address::{Address, Hash, ADDRESS_LENGTH, HASH_LENGTH};

/// Fixed per-account footprint used by size estimates: address, balance, nonce.
const ACCOUNT_BASE_SIZE: u64 = ADDRESS_LENGTH as u64 + 16 + 8;

/// Footprint of a single storage slot (key + value).
const STORAGE_SLOT_SIZE: u64 = 2 * HASH_LENGTH as u64;

/// A single account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub balance: u128,
    pub nonce: u64,
    #[serde(default)]
    pub code: Vec<u8>,
    #[serde(default)]
    pub storage: BTreeMap<Hash, Hash>,
}

impl Account {
    pub fn with_balance(balance: u128) -> Self {
        Self {
            balance,
            ..Self::default()
        }
    }

    /// Approximate in-memory size in bytes.
    pub fn estimate_size(&self) -> u64 {
        ACCOUNT_BASE_SIZE + self.code.len() as u64 + self.storage.len() as u64 * STORAGE_SLOT_SIZE
    }
}

/// An ordered set of accounts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    accounts: BTreeMap<Address, Account>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn get(&self, address: &Address) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn get_mut(&mut self, address: &Address) -> Option<&mut Account> {
        self.accounts.get_mut(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.accounts.contains_key(address)
    }

    /// Get an account, creating an empty one if it does not exist.
    pub fn entry(&mut self, address: Address) -> &mut Account {
        self.accounts.entry(address).or_default()
    }

    pub fn insert(&mut self, address: Address, account: Account) -> Option<Account> {
        self.accounts.insert(address, account)
    }

    pub fn remove(&mut self, address: &Address) -> Option<Account> {
        self.accounts.remove(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.accounts.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    /// Approximate in-memory size in bytes.
    pub fn estimate_size(&self) -> u64 {
        self.accounts.values().map(Account::estimate_size).sum()
    }

    /// Estimate how many bytes merging `other` into `self` would add.
    ///
    /// Accounts and storage slots that already exist are not counted again;
    /// code is counted when it would be replaced by a longer one.
    pub fn estimate_incremental_size(&self, other: &WorldState) -> u64 {
        let mut size = 0u64;
        for (address, incoming) in &other.accounts {
            match self.accounts.get(address) {
                None => size += incoming.estimate_size(),
                Some(existing) => {
                    size += (incoming.code.len() as u64).saturating_sub(existing.code.len() as u64);
                    let new_slots = incoming
                        .storage
                        .keys()
                        .filter(|key| !existing.storage.contains_key(key))
                        .count() as u64;
                    size += new_slots * STORAGE_SLOT_SIZE;
                }
            }
        }
        size
    }

    /// Merge `other` into `self`.
    ///
    /// Balance, nonce and code of `other` win. Storage is merged slot by
    /// slot, so slots only present in `self` survive.
    pub fn merge(&mut self, other: &WorldState) {
        for (address, incoming) in &other.accounts {
            match self.accounts.get_mut(address) {
                None => {
                    self.accounts.insert(*address, incoming.clone());
                }
                Some(existing) => {
                    existing.balance = incoming.balance;
                    existing.nonce = incoming.nonce;
                    existing.code = incoming.code.clone();
                    for (key, value) in &incoming.storage {
                        existing.storage.insert(*key, *value);
                    }
                }
            }
        }
    }

    /// Drop every account in `addresses`, returning how many were present.
    pub fn remove_all(&mut self, addresses: &[Address]) -> usize {
        addresses
            .iter()
            .filter(|address| self.accounts.remove(address).is_some())
            .count()
    }
}

impl FromIterator<(Address, Account)> for WorldState {
    fn from_iter<I: IntoIterator<Item = (Address, Account)>>(iter: I) -> Self {
        Self {
            accounts: iter.into_iter().collect(),
        }
    }
}

/// Accounts changed by a range of blocks ending at `block`.
///
/// Update sets are the input of priming: merged in order they reconstruct the
/// world state as of `block`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSet {
    pub block: u64,
    pub accounts: WorldState,
    /// Accounts destroyed up to and including `block`.
    #[serde(default)]
    pub deleted: Vec<Address>,
}

impl UpdateSet {
    pub fn new(block: u64, accounts: WorldState) -> Self {
        Self {
            block,
            accounts,
            deleted: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with_slot(balance: u128, key: u64, value: u64) -> Account {
        let mut account = Account::with_balance(balance);
        account
            .storage
            .insert(Hash::from_low_u64(key), Hash::from_low_u64(value));
        account
    }

    #[test]
    fn test_merge_overwrites_scalars_and_unions_storage() {
        let a = Address::from_low_u64(1);
        let mut base: WorldState = [(a, account_with_slot(10, 1, 100))].into_iter().collect();
        let update: WorldState = [(a, account_with_slot(20, 2, 200))].into_iter().collect();

        base.merge(&update);

        let merged = base.get(&a).unwrap();
        assert_eq!(merged.balance, 20);
        assert_eq!(merged.storage.len(), 2);
        assert_eq!(
            merged.storage.get(&Hash::from_low_u64(1)),
            Some(&Hash::from_low_u64(100))
        );
    }

    #[test]
    fn test_incremental_size_ignores_known_slots() {
        let a = Address::from_low_u64(1);
        let base: WorldState = [(a, account_with_slot(10, 1, 100))].into_iter().collect();

        // Same slot again: nothing new.
        let same: WorldState = [(a, account_with_slot(11, 1, 101))].into_iter().collect();
        assert_eq!(base.estimate_incremental_size(&same), 0);

        // One new slot on a known account.
        let extra: WorldState = [(a, account_with_slot(11, 2, 101))].into_iter().collect();
        assert_eq!(base.estimate_incremental_size(&extra), STORAGE_SLOT_SIZE);

        // A brand new account costs its full size.
        let b = Address::from_low_u64(2);
        let fresh: WorldState = [(b, Account::with_balance(1))].into_iter().collect();
        assert_eq!(base.estimate_incremental_size(&fresh), ACCOUNT_BASE_SIZE);
    }

    #[test]
    fn test_remove_all_counts_present_accounts() {
        let mut ws: WorldState = (1..=3)
            .map(|i| (Address::from_low_u64(i), Account::with_balance(i as u128)))
            .collect();
        let removed = ws.remove_all(&[Address::from_low_u64(2), Address::from_low_u64(9)]);
        assert_eq!(removed, 1);
        assert_eq!(ws.len(), 2);
    }
}
