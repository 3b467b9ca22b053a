//! Simple Bank Ledger Engine
//!
//! Transactional funds transfers over PostgreSQL or an in-memory backend.
//! Every composite operation runs as one unit of work; account rows are
//! locked in ascending id order so concurrent transfers never deadlock.

pub mod account;
pub mod balance;
pub mod config;
pub mod entry;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod queries;
pub mod store;
pub mod transfer;
pub mod user;

pub use account::{
    Account, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams,
    UpdateAccountParams,
};
pub use balance::{BalanceLeg, LockOrder};
pub use config::DatabaseConfig;
pub use entry::{CreateEntryParams, Entry, ListEntriesParams};
pub use error::{BoxError, LedgerError, Result};
pub use memory::{MemoryDatabase, MemoryHandle, Tables};
pub use postgres::{PgDatabase, PgHandle};
pub use queries::{Database, Queries};
pub use store::{SqlStore, Store};
pub use transfer::{
    CreateTransferParams, ListTransfersParams, Transfer, TransferTxParams, TransferTxResult,
};
pub use user::{
    AfterCreate, CreateUserParams, CreateUserTxParams, CreateUserTxResult, UpdateUserParams, User,
};
