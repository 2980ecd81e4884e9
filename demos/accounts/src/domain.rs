//! The bank-account entity and its events.

use chrono::{DateTime, Utc};
use ledgerfold::{Entity, EntityEvent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A shared bank account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub users: Vec<String>,
    pub balance: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Events applied to an [`Account`].
///
/// Creation and deletion carry the time they happened so that replaying
/// them reproduces the same timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AccountEvent {
    #[serde(rename = "accountcreated")]
    AccountCreated { username: String, at: DateTime<Utc> },
    #[serde(rename = "accountdeleted")]
    AccountDeleted { reason: String, at: DateTime<Utc> },
    #[serde(rename = "balancechanged")]
    BalanceChanged { amount: i64 },
    #[serde(rename = "useradded")]
    UserAdded { username: String },
    #[serde(rename = "userremoved")]
    UserRemoved { username: String },
}

impl AccountEvent {
    /// An `accountcreated` event stamped with the current time.
    pub fn created(username: impl Into<String>) -> Self {
        Self::AccountCreated {
            username: username.into(),
            at: Utc::now(),
        }
    }

    /// An `accountdeleted` event stamped with the current time.
    pub fn deleted(reason: impl Into<String>) -> Self {
        Self::AccountDeleted {
            reason: reason.into(),
            at: Utc::now(),
        }
    }

    pub fn balance_changed(amount: i64) -> Self {
        Self::BalanceChanged { amount }
    }

    pub fn user_added(username: impl Into<String>) -> Self {
        Self::UserAdded {
            username: username.into(),
        }
    }

    pub fn user_removed(username: impl Into<String>) -> Self {
        Self::UserRemoved {
            username: username.into(),
        }
    }
}

/// Tags of every [`AccountEvent`] variant.
pub const ACCOUNT_EVENT_TYPES: &[&str] = &[
    "accountcreated",
    "accountdeleted",
    "balancechanged",
    "useradded",
    "userremoved",
];

impl EntityEvent for AccountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::AccountCreated { .. } => "accountcreated",
            Self::AccountDeleted { .. } => "accountdeleted",
            Self::BalanceChanged { .. } => "balancechanged",
            Self::UserAdded { .. } => "useradded",
            Self::UserRemoved { .. } => "userremoved",
        }
    }
}

/// Account invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccountError {
    #[error("account already created")]
    AlreadyCreated,
    #[error("account already deleted")]
    AlreadyDeleted,
    #[error("user {0} not found")]
    UserNotFound(String),
}

impl Entity for Account {
    const ENTITY_TYPE: &'static str = "account";

    type Event = AccountEvent;
    type Error = AccountError;

    fn new(id: Uuid) -> Self {
        Self {
            id,
            users: Vec::new(),
            balance: 0,
            created_at: None,
            deleted_at: None,
        }
    }

    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn event_types() -> &'static [&'static str] {
        ACCOUNT_EVENT_TYPES
    }

    fn apply(mut self, event: &AccountEvent) -> Result<Self, AccountError> {
        match event {
            AccountEvent::AccountCreated { username, at } => {
                if self.created_at.is_some() {
                    return Err(AccountError::AlreadyCreated);
                }
                self.created_at = Some(*at);
                self.users.push(username.clone());
            }
            AccountEvent::AccountDeleted { reason, at } => {
                if self.deleted_at.is_some() {
                    return Err(AccountError::AlreadyDeleted);
                }
                tracing::debug!(account_id = %self.id, reason = %reason, "account deleted");
                self.deleted_at = Some(*at);
            }
            AccountEvent::BalanceChanged { amount } => self.balance += amount,
            AccountEvent::UserAdded { username } => self.users.push(username.clone()),
            AccountEvent::UserRemoved { username } => {
                let index = self
                    .users
                    .iter()
                    .position(|u| u == username)
                    .ok_or_else(|| AccountError::UserNotFound(username.clone()))?;
                self.users.remove(index);
            }
        }
        Ok(self)
    }
}
