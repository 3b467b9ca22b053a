//! Data access seams.
//!
//! `Queries` is the row-level DAO. Every backend hands out a handle
//! implementing it, either in autocommit mode (`Database::acquire`) or
//! scoped to a transaction (`Database::begin`).

use async_trait::async_trait;
use simplebank_common::{AccountId, EntryId, TransferId};

use crate::account::{
    Account, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams,
    UpdateAccountParams,
};
use crate::entry::{CreateEntryParams, Entry, ListEntriesParams};
use crate::error::Result;
use crate::transfer::{CreateTransferParams, ListTransfersParams, Transfer};
use crate::user::{CreateUserParams, UpdateUserParams, User};

/// Parameterized point operations on the ledger tables.
#[async_trait]
pub trait Queries: Send {
    // === Accounts ===

    /// Insert an account.
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account>;

    /// Get an account by id.
    async fn get_account(&mut self, id: AccountId) -> Result<Account>;

    /// Get an account by id and hold its row lock until the transaction ends.
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account>;

    /// List accounts of an owner, ordered by id.
    async fn list_accounts(&mut self, params: ListAccountsParams) -> Result<Vec<Account>>;

    /// Overwrite an account balance.
    async fn update_account(&mut self, params: UpdateAccountParams) -> Result<Account>;

    /// Delete an account.
    async fn delete_account(&mut self, id: AccountId) -> Result<()>;

    /// Atomically add a signed delta to an account balance and return the
    /// updated row.
    ///
    /// The row lock taken here is held until the enclosing transaction
    /// ends. Every transfer guarantee reduces to this operation.
    async fn add_account_balance(&mut self, params: AddAccountBalanceParams) -> Result<Account>;

    // === Entries ===

    /// Insert an entry.
    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry>;

    /// Get an entry by id.
    async fn get_entry(&mut self, id: EntryId) -> Result<Entry>;

    /// List entries, optionally of a single account, ordered by id.
    async fn list_entries(&mut self, params: ListEntriesParams) -> Result<Vec<Entry>>;

    // === Transfers ===

    /// Insert a transfer.
    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer>;

    /// Get a transfer by id.
    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer>;

    /// List transfers from or to the given accounts, ordered by id.
    async fn list_transfers(&mut self, params: ListTransfersParams) -> Result<Vec<Transfer>>;

    // === Users ===

    /// Insert a user.
    async fn create_user(&mut self, params: CreateUserParams) -> Result<User>;

    /// Get a user by username.
    async fn get_user(&mut self, username: &str) -> Result<User>;

    /// Update the provided fields of a user.
    async fn update_user(&mut self, params: UpdateUserParams) -> Result<User>;
}

/// A pooled storage backend.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Handle used for both autocommit and transactional access.
    type Handle: Queries + Send;

    /// Get a handle whose writes are visible as soon as each call returns.
    async fn acquire(&self) -> Result<Self::Handle>;

    /// Begin a transaction.
    ///
    /// Fails with `LedgerError::Connection` when no connection is available.
    async fn begin(&self) -> Result<Self::Handle>;

    /// Commit a transaction handle.
    async fn commit(&self, handle: Self::Handle) -> Result<()>;

    /// Roll back a transaction handle.
    async fn rollback(&self, handle: Self::Handle) -> Result<()>;
}
