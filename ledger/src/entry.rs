//! Entry rows: immutable signed balance deltas attached to an account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simplebank_common::{AccountId, EntryId};

/// A single ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique entry ID.
    pub id: EntryId,
    /// Account affected. Nullable in the schema.
    pub account_id: Option<AccountId>,
    /// Signed amount: negative for the sending side of a transfer.
    pub amount: i64,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

/// Parameters for `create_entry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEntryParams {
    pub account_id: Option<AccountId>,
    pub amount: i64,
}

/// Parameters for `list_entries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntriesParams {
    pub account_id: Option<AccountId>,
    pub limit: u32,
    pub offset: u32,
}

/// Sum of signed entry amounts.
///
/// The two entries written by a committed transfer always sum to zero.
pub fn net_amount<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> i64 {
    entries.into_iter().map(|e| e.amount).sum()
}
