//! Identifier types for ledger rows.
//!
//! Row identifiers are database-assigned `BIGSERIAL` values. They are
//! wrapped in newtypes so an entry id can never be passed where an account
//! id is expected, and `AccountId` is totally ordered because transfers
//! lock account rows in ascending id order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for an account.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(i64);

impl AccountId {
    /// Wrap a raw database id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw database id.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a ledger entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntryId(i64);

impl EntryId {
    /// Wrap a raw database id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw database id.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EntryId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Unique identifier for a transfer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TransferId(i64);

impl TransferId {
    /// Wrap a raw database id.
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the raw database id.
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TransferId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_id_ordering() {
        assert!(AccountId::new(1) < AccountId::new(2));
        assert_eq!(AccountId::new(7).max(AccountId::new(3)), AccountId::new(7));
    }

    #[test]
    fn test_ids_serialize_as_plain_integers() {
        let json = serde_json::to_string(&AccountId::new(42)).unwrap();
        assert_eq!(json, "42");

        let id: TransferId = serde_json::from_str("9").unwrap();
        assert_eq!(id.get(), 9);
    }

    #[test]
    fn test_display() {
        assert_eq!(EntryId::new(15).to_string(), "15");
    }
}
