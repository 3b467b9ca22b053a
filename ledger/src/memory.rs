//! In-memory backend.
//!
//! Reproduces the parts of PostgreSQL the engine relies on:
//!
//! - Row locks: writing an account or user row takes an owned async mutex
//!   on that row, held by the transaction handle until commit, rollback or
//!   drop.
//! - Read committed visibility: a transaction sees committed rows plus its
//!   own staged writes; nobody else sees the staged writes.
//! - Atomic commit: staged writes are applied under one table lock, then
//!   row locks are released.
//! - Integrity constraints with PostgreSQL SQLSTATE codes. Unique and
//!   foreign keys are checked again at commit against committed rows.
//!
//! Sequences are not rolled back, as in PostgreSQL.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use simplebank_common::{AccountId, EntryId, TransferId};

use crate::account::{
    Account, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams,
    UpdateAccountParams,
};
use crate::entry::{CreateEntryParams, Entry, ListEntriesParams};
use crate::error::{LedgerError, Result};
use crate::queries::{Database, Queries};
use crate::transfer::{CreateTransferParams, ListTransfersParams, Transfer};
use crate::user::{CreateUserParams, UpdateUserParams, User};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const CHECK_VIOLATION: &str = "23514";

/// Committed contents of every table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tables {
    pub accounts: BTreeMap<AccountId, Account>,
    pub entries: BTreeMap<EntryId, Entry>,
    pub transfers: BTreeMap<TransferId, Transfer>,
    pub users: BTreeMap<String, User>,
}

#[derive(Default)]
struct Faults {
    begin: AtomicBool,
    commit: AtomicBool,
    rollback: AtomicBool,
}

struct Sequences {
    account: AtomicI64,
    entry: AtomicI64,
    transfer: AtomicI64,
}

impl Default for Sequences {
    fn default() -> Self {
        Self {
            account: AtomicI64::new(1),
            entry: AtomicI64::new(1),
            transfer: AtomicI64::new(1),
        }
    }
}

/// Primary key of a lockable row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowKey {
    Account(AccountId),
    User(String),
}

#[derive(Default)]
struct Inner {
    tables: Mutex<Tables>,
    row_locks: DashMap<RowKey, Arc<tokio::sync::Mutex<()>>>,
    sequences: Sequences,
    faults: Faults,
}

/// In-memory row store with PostgreSQL-like locking.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all committed rows.
    pub fn snapshot(&self) -> Tables {
        self.inner.tables.lock().clone()
    }

    /// Make the next `begin` fail as if the pool were exhausted.
    pub fn fail_next_begin(&self) {
        self.inner.faults.begin.store(true, Ordering::SeqCst);
    }

    /// Make the next `commit` fail. The transaction's writes are discarded.
    pub fn fail_next_commit(&self) {
        self.inner.faults.commit.store(true, Ordering::SeqCst);
    }

    /// Make the next `rollback` fail. The transaction's writes are still
    /// discarded, as the server aborts a transaction whose session is lost.
    pub fn fail_next_rollback(&self) {
        self.inner.faults.rollback.store(true, Ordering::SeqCst);
    }

    fn handle(&self, autocommit: bool) -> MemoryHandle {
        MemoryHandle {
            inner: Arc::clone(&self.inner),
            autocommit,
            writes: Writes::default(),
            locks: HashMap::new(),
        }
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Handle = MemoryHandle;

    async fn acquire(&self) -> Result<MemoryHandle> {
        Ok(self.handle(true))
    }

    async fn begin(&self) -> Result<MemoryHandle> {
        if self.inner.faults.begin.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Connection(sqlx::Error::PoolTimedOut));
        }
        Ok(self.handle(false))
    }

    async fn commit(&self, mut handle: MemoryHandle) -> Result<()> {
        if self.inner.faults.commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Internal("injected commit failure".to_string()));
        }
        handle.apply()
    }

    async fn rollback(&self, handle: MemoryHandle) -> Result<()> {
        drop(handle);
        if self.inner.faults.rollback.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Internal(
                "injected rollback failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// Writes staged by one transaction.
#[derive(Default)]
struct Writes {
    accounts: BTreeMap<AccountId, Account>,
    created_accounts: BTreeSet<AccountId>,
    deleted_accounts: BTreeSet<AccountId>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
    users: BTreeMap<String, User>,
    created_users: BTreeSet<String>,
}

/// Handle on the in-memory database.
///
/// Dropping the handle discards staged writes and releases its row locks.
pub struct MemoryHandle {
    inner: Arc<Inner>,
    autocommit: bool,
    writes: Writes,
    locks: HashMap<RowKey, OwnedMutexGuard<()>>,
}

impl MemoryHandle {
    /// Take a row lock, waiting for its current holder.
    async fn lock_row(&mut self, key: RowKey) {
        if self.locks.contains_key(&key) {
            return;
        }

        let lock = self
            .inner
            .row_locks
            .entry(key.clone())
            .or_default()
            .value()
            .clone();
        let guard = lock.lock_owned().await;
        debug!(row = ?key, "Row lock acquired");
        self.locks.insert(key, guard);
    }

    async fn lock_account(&mut self, id: AccountId) {
        self.lock_row(RowKey::Account(id)).await;
    }

    fn visible_account(&self, id: AccountId) -> Option<Account> {
        if self.writes.deleted_accounts.contains(&id) {
            return None;
        }
        if let Some(account) = self.writes.accounts.get(&id) {
            return Some(account.clone());
        }
        self.inner.tables.lock().accounts.get(&id).cloned()
    }

    fn visible_user(&self, username: &str) -> Option<User> {
        if let Some(user) = self.writes.users.get(username) {
            return Some(user.clone());
        }
        self.inner.tables.lock().users.get(username).cloned()
    }

    fn visible_accounts(&self) -> BTreeMap<AccountId, Account> {
        let mut accounts = self.inner.tables.lock().accounts.clone();
        accounts.extend(
            self.writes
                .accounts
                .iter()
                .map(|(id, account)| (*id, account.clone())),
        );
        accounts.retain(|id, _| !self.writes.deleted_accounts.contains(id));
        accounts
    }

    fn visible_users(&self) -> BTreeMap<String, User> {
        let mut users = self.inner.tables.lock().users.clone();
        users.extend(
            self.writes
                .users
                .iter()
                .map(|(name, user)| (name.clone(), user.clone())),
        );
        users
    }

    fn visible_entries(&self) -> BTreeMap<EntryId, Entry> {
        let mut entries = self.inner.tables.lock().entries.clone();
        entries.extend(
            self.writes
                .entries
                .iter()
                .map(|(id, entry)| (*id, entry.clone())),
        );
        entries
    }

    fn visible_transfers(&self) -> BTreeMap<TransferId, Transfer> {
        let mut transfers = self.inner.tables.lock().transfers.clone();
        transfers.extend(
            self.writes
                .transfers
                .iter()
                .map(|(id, transfer)| (*id, transfer.clone())),
        );
        transfers
    }

    fn require_account(&self, id: AccountId, table: &str, column: &str) -> Result<()> {
        if self.visible_account(id).is_none() {
            return Err(missing_account(table, column, id));
        }
        Ok(())
    }

    /// Apply staged writes to the committed tables and release row locks.
    fn apply(&mut self) -> Result<()> {
        let writes = std::mem::take(&mut self.writes);
        let result = {
            let mut tables = self.inner.tables.lock();
            check_keys_at_commit(&tables, &writes).map(|()| {
                for id in &writes.deleted_accounts {
                    tables.accounts.remove(id);
                }
                tables.accounts.extend(writes.accounts);
                tables.entries.extend(writes.entries);
                tables.transfers.extend(writes.transfers);
                tables.users.extend(writes.users);
            })
        };
        self.locks.clear();
        result
    }

    /// Flush after a write when not inside a transaction.
    fn finish_write(&mut self) -> Result<()> {
        if self.autocommit {
            self.apply()?;
        }
        Ok(())
    }

    fn page<T>(rows: impl Iterator<Item = T>, limit: u32, offset: u32) -> Vec<T> {
        rows.skip(offset as usize).take(limit as usize).collect()
    }
}

/// Unique keys can be claimed, and referenced accounts deleted, by a
/// concurrent transaction that committed after this one staged its insert.
fn check_keys_at_commit(tables: &Tables, writes: &Writes) -> Result<()> {
    for username in &writes.created_users {
        if tables.users.contains_key(username) {
            return Err(unique_violation(
                "users_pkey",
                format!("Key (username)=({username}) already exists"),
            ));
        }
    }

    for user in writes.users.values() {
        let taken = tables
            .users
            .values()
            .any(|other| other.email == user.email && other.username != user.username);
        if taken {
            return Err(unique_violation(
                "users_email_key",
                format!("Key (email)=({}) already exists", user.email),
            ));
        }
    }

    for id in &writes.created_accounts {
        if let Some(account) = writes.accounts.get(id) {
            let taken = tables.accounts.values().any(|other| {
                other.id != account.id
                    && other.owner == account.owner
                    && other.currency == account.currency
            });
            if taken {
                return Err(owner_currency_violation(account));
            }
        }
    }

    let exists = |id: AccountId| {
        !writes.deleted_accounts.contains(&id)
            && (writes.accounts.contains_key(&id) || tables.accounts.contains_key(&id))
    };
    for entry in writes.entries.values() {
        if let Some(id) = entry.account_id.filter(|id| !exists(*id)) {
            return Err(missing_account("entries", "account_id", id));
        }
    }
    for transfer in writes.transfers.values() {
        if !exists(transfer.from_account_id) {
            return Err(missing_account(
                "transfers",
                "from_account_id",
                transfer.from_account_id,
            ));
        }
        if !exists(transfer.to_account_id) {
            return Err(missing_account(
                "transfers",
                "to_account_id",
                transfer.to_account_id,
            ));
        }
    }

    Ok(())
}

fn missing_account(table: &str, column: &str, id: AccountId) -> LedgerError {
    foreign_key_violation(
        &format!("{table}_{column}_fkey"),
        format!("Key ({column})=({id}) is not present in table \"accounts\""),
    )
}

fn unique_violation(constraint: &str, message: String) -> LedgerError {
    LedgerError::ConstraintViolation {
        code: UNIQUE_VIOLATION.to_string(),
        constraint: Some(constraint.to_string()),
        message,
    }
}

fn foreign_key_violation(constraint: &str, message: String) -> LedgerError {
    LedgerError::ConstraintViolation {
        code: FOREIGN_KEY_VIOLATION.to_string(),
        constraint: Some(constraint.to_string()),
        message,
    }
}

fn owner_currency_violation(account: &Account) -> LedgerError {
    unique_violation(
        "owner_currency_key",
        format!(
            "Key (owner, currency)=({}, {}) already exists",
            account.owner, account.currency
        ),
    )
}

#[async_trait]
impl Queries for MemoryHandle {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account> {
        if self.visible_user(&params.owner).is_none() {
            return Err(foreign_key_violation(
                "accounts_owner_fkey",
                format!("Key (owner)=({}) is not present in table \"users\"", params.owner),
            ));
        }

        let account = Account {
            id: AccountId::new(self.inner.sequences.account.fetch_add(1, Ordering::SeqCst)),
            owner: params.owner,
            balance: params.balance,
            currency: params.currency,
            created_at: Utc::now(),
        };

        let duplicate = self.visible_accounts().values().any(|other| {
            other.owner == account.owner && other.currency == account.currency
        });
        if duplicate {
            return Err(owner_currency_violation(&account));
        }

        self.writes.created_accounts.insert(account.id);
        self.writes.accounts.insert(account.id, account.clone());
        self.finish_write()?;
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        self.visible_account(id)
            .ok_or_else(|| LedgerError::not_found("account", id))
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        self.lock_account(id).await;
        let account = self
            .visible_account(id)
            .ok_or_else(|| LedgerError::not_found("account", id))?;
        self.finish_write()?;
        Ok(account)
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> Result<Vec<Account>> {
        let accounts = self.visible_accounts();
        let owned = accounts
            .into_values()
            .filter(|account| account.owner == params.owner);
        Ok(Self::page(owned, params.limit, params.offset))
    }

    async fn update_account(&mut self, params: UpdateAccountParams) -> Result<Account> {
        self.lock_account(params.id).await;
        let mut account = self
            .visible_account(params.id)
            .ok_or_else(|| LedgerError::not_found("account", params.id))?;

        account.balance = params.balance;
        self.writes.accounts.insert(account.id, account.clone());
        self.finish_write()?;
        Ok(account)
    }

    async fn delete_account(&mut self, id: AccountId) -> Result<()> {
        self.lock_account(id).await;
        if self.visible_account(id).is_none() {
            return Err(LedgerError::not_found("account", id));
        }

        let referenced_by_entry = self
            .visible_entries()
            .values()
            .any(|entry| entry.account_id == Some(id));
        let referenced_by_transfer = self
            .visible_transfers()
            .values()
            .any(|t| t.from_account_id == id || t.to_account_id == id);
        if referenced_by_entry || referenced_by_transfer {
            let table = if referenced_by_entry { "entries" } else { "transfers" };
            return Err(foreign_key_violation(
                &format!("{table}_account_id_fkey"),
                format!("Key (id)=({id}) is still referenced from table \"{table}\""),
            ));
        }

        self.writes.accounts.remove(&id);
        self.writes.created_accounts.remove(&id);
        self.writes.deleted_accounts.insert(id);
        self.finish_write()
    }

    async fn add_account_balance(&mut self, params: AddAccountBalanceParams) -> Result<Account> {
        self.lock_account(params.id).await;
        let mut account = self
            .visible_account(params.id)
            .ok_or_else(|| LedgerError::not_found("account", params.id))?;

        account.balance = account
            .balance
            .checked_add(params.amount)
            .ok_or_else(|| LedgerError::Internal("bigint out of range".to_string()))?;

        self.writes.accounts.insert(account.id, account.clone());
        self.finish_write()?;
        Ok(account)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        if let Some(account_id) = params.account_id {
            self.require_account(account_id, "entries", "account_id")?;
        }

        let entry = Entry {
            id: EntryId::new(self.inner.sequences.entry.fetch_add(1, Ordering::SeqCst)),
            account_id: params.account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };

        self.writes.entries.insert(entry.id, entry.clone());
        self.finish_write()?;
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        if let Some(entry) = self.writes.entries.get(&id) {
            return Ok(entry.clone());
        }
        self.inner
            .tables
            .lock()
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("entry", id))
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> Result<Vec<Entry>> {
        let entries = self
            .visible_entries()
            .into_values()
            .filter(|entry| params.account_id.is_none() || entry.account_id == params.account_id);
        Ok(Self::page(entries, params.limit, params.offset))
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        if params.amount <= 0 {
            return Err(LedgerError::ConstraintViolation {
                code: CHECK_VIOLATION.to_string(),
                constraint: Some("transfers_amount_check".to_string()),
                message: format!(
                    "new row for relation \"transfers\" violates check constraint (amount={})",
                    params.amount
                ),
            });
        }
        self.require_account(params.from_account_id, "transfers", "from_account_id")?;
        self.require_account(params.to_account_id, "transfers", "to_account_id")?;

        let transfer = Transfer {
            id: TransferId::new(self.inner.sequences.transfer.fetch_add(1, Ordering::SeqCst)),
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
            created_at: Utc::now(),
        };

        self.writes.transfers.insert(transfer.id, transfer.clone());
        self.finish_write()?;
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        if let Some(transfer) = self.writes.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.inner
            .tables
            .lock()
            .transfers
            .get(&id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("transfer", id))
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> Result<Vec<Transfer>> {
        let transfers = self.visible_transfers().into_values().filter(|t| {
            t.from_account_id == params.from_account_id || t.to_account_id == params.to_account_id
        });
        Ok(Self::page(transfers, params.limit, params.offset))
    }

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User> {
        if self.visible_user(&params.username).is_some() {
            return Err(unique_violation(
                "users_pkey",
                format!("Key (username)=({}) already exists", params.username),
            ));
        }
        if self.visible_users().values().any(|u| u.email == params.email) {
            return Err(unique_violation(
                "users_email_key",
                format!("Key (email)=({}) already exists", params.email),
            ));
        }

        let user = User {
            username: params.username,
            hashed_password: params.hashed_password,
            full_name: params.full_name,
            email: params.email,
            password_changed_at: DateTime::<Utc>::UNIX_EPOCH,
            created_at: Utc::now(),
        };

        self.writes.created_users.insert(user.username.clone());
        self.writes.users.insert(user.username.clone(), user.clone());
        self.finish_write()?;
        Ok(user)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        self.visible_user(username)
            .ok_or_else(|| LedgerError::not_found("user", username))
    }

    async fn update_user(&mut self, params: UpdateUserParams) -> Result<User> {
        self.lock_row(RowKey::User(params.username.clone())).await;
        let mut user = self
            .visible_user(&params.username)
            .ok_or_else(|| LedgerError::not_found("user", &params.username))?;

        if let Some(email) = params.email {
            let taken = self
                .visible_users()
                .values()
                .any(|other| other.email == email && other.username != user.username);
            if taken {
                return Err(unique_violation(
                    "users_email_key",
                    format!("Key (email)=({email}) already exists"),
                ));
            }
            user.email = email;
        }
        if let Some(full_name) = params.full_name {
            user.full_name = full_name;
        }
        if let Some(hashed_password) = params.hashed_password {
            user.hashed_password = hashed_password;
            user.password_changed_at = Utc::now();
        }

        self.writes.users.insert(user.username.clone(), user.clone());
        self.finish_write()?;
        Ok(user)
    }
}
