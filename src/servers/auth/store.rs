//! Account lookup contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::config::AccountEntry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub account_id: u32,
    /// bcrypt hash
    pub password_hash: String,
    pub banned: bool,
}

/// Where the gateway looks accounts up and records issued tickets.
#[async_trait]
pub trait AccountStore: Send + Sync + 'static {
    async fn find(&self, username: &str) -> anyhow::Result<Option<AccountRecord>>;

    /// Remember `ticket` so the world process can redeem it.
    async fn issue_ticket(&self, account_id: u32, ticket: u32) -> anyhow::Result<()>;
}

/// Accounts held in memory, typically loaded from the config file.
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: HashMap<String, AccountRecord>,
    tickets: Mutex<HashMap<u32, u32>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[AccountEntry]) -> Self {
        let mut store = Self::new();
        for e in entries {
            store.insert(
                &e.username,
                AccountRecord {
                    account_id: e.account_id,
                    password_hash: e.password_hash.clone(),
                    banned: e.banned,
                },
            );
        }
        store
    }

    /// Usernames compare case-insensitively.
    pub fn insert(&mut self, username: &str, record: AccountRecord) {
        self.accounts.insert(username.to_ascii_lowercase(), record);
    }

    pub fn ticket(&self, account_id: u32) -> Option<u32> {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account_id)
            .copied()
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find(&self, username: &str) -> anyhow::Result<Option<AccountRecord>> {
        Ok(self.accounts.get(&username.to_ascii_lowercase()).cloned())
    }

    async fn issue_ticket(&self, account_id: u32, ticket: u32) -> anyhow::Result<()> {
        self.tickets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id, ticket);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_is_case_insensitive() {
        let store = MemoryAccountStore::from_entries(&[AccountEntry {
            username: "Alice".into(),
            password_hash: "x".into(),
            account_id: 7,
            banned: false,
        }]);
        assert_eq!(store.find("alice").await.unwrap().map(|a| a.account_id), Some(7));
        assert!(store.find("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_ticket_wins() {
        let store = MemoryAccountStore::new();
        store.issue_ticket(7, 1).await.unwrap();
        store.issue_ticket(7, 2).await.unwrap();
        assert_eq!(store.ticket(7), Some(2));
    }
}
