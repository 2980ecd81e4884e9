//! Account operations used by the request handlers.

use std::sync::Arc;

use ledgerfold::{AggregateStore, LoadOptions, StoreError};
use uuid::Uuid;

use crate::domain::{Account, AccountEvent};

/// Account operations on top of an aggregate store chain.
///
/// `Clone` is cheap: the store is shared.
#[derive(Clone)]
pub struct AccountStorage {
    accounts: Arc<dyn AggregateStore<Account>>,
}

impl AccountStorage {
    pub fn new(accounts: Arc<dyn AggregateStore<Account>>) -> Self {
        Self { accounts }
    }

    /// Open a new account with one initial user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if `initial_user` is empty, or
    /// any error from the store.
    pub async fn create_account(&self, initial_user: &str) -> Result<Account, StoreError> {
        if initial_user.is_empty() {
            return Err(StoreError::Validation("initial user cannot be empty".into()));
        }

        let mut aggregate = self.accounts.new_aggregate(None)?;
        aggregate.append(vec![AccountEvent::created(initial_user)])?;
        self.accounts.save(&mut aggregate).await?;

        tracing::info!(account_id = %aggregate.id(), "account created");
        Ok(aggregate.entity().clone())
    }

    /// Load the current state of an account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub async fn get_account(&self, id: Uuid) -> Result<Account, StoreError> {
        let aggregate = self.accounts.load(id, LoadOptions::latest()).await?;
        Ok(aggregate.entity().clone())
    }

    /// Mark an account as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id and
    /// [`StoreError::Domain`] ("account already deleted") when the account
    /// was deleted before.
    pub async fn delete_account(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        let mut aggregate = self.accounts.load(id, LoadOptions::latest()).await?;
        aggregate.append(vec![AccountEvent::deleted(reason)])?;
        self.accounts.save(&mut aggregate).await?;

        tracing::info!(account_id = %id, reason, "account deleted");
        Ok(())
    }
}
