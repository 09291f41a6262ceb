#![forbid(unsafe_code)]

use std::collections::HashMap;

use chatterm_domain::{Account, AccountId};
use parking_lot::RwLock;

use crate::AccountProvider;

/// In-memory account store. Tokens can be rotated with [`StaticAccounts::upsert`]
/// and take effect on the next connection attempt.
#[derive(Debug, Default)]
pub struct StaticAccounts {
	accounts: RwLock<HashMap<AccountId, Account>>,
}

impl StaticAccounts {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
		let map = accounts.into_iter().map(|a| (a.id.clone(), a)).collect();
		Self {
			accounts: RwLock::new(map),
		}
	}

	/// Insert or replace an account, returning the previous entry.
	pub fn upsert(&self, account: Account) -> Option<Account> {
		self.accounts.write().insert(account.id.clone(), account)
	}

	pub fn remove(&self, id: &AccountId) -> Option<Account> {
		self.accounts.write().remove(id)
	}

	pub fn ids(&self) -> Vec<AccountId> {
		let mut ids: Vec<_> = self.accounts.read().keys().cloned().collect();
		ids.sort();
		ids
	}
}

impl AccountProvider for StaticAccounts {
	fn account_by(&self, id: &AccountId) -> anyhow::Result<Account> {
		match self.accounts.read().get(id) {
			Some(account) => Ok(account.clone()),
			None => anyhow::bail!("unknown account {id}"),
		}
	}
}
