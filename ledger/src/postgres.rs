//! PostgreSQL backend.
//!
//! Row locking and isolation are delegated to PostgreSQL. `UPDATE` takes a
//! `FOR NO KEY UPDATE` row lock, which does not conflict with the
//! `KEY SHARE` lock that inserting an entry or transfer takes on the
//! referenced account row.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Postgres, Row, Transaction};
use tracing::info;

use simplebank_common::{AccountId, Currency, EntryId, TransferId};

use crate::account::{
    Account, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams,
    UpdateAccountParams,
};
use crate::config::DatabaseConfig;
use crate::entry::{CreateEntryParams, Entry, ListEntriesParams};
use crate::error::{LedgerError, Result};
use crate::queries::{Database, Queries};
use crate::transfer::{CreateTransferParams, ListTransfersParams, Transfer};
use crate::user::{CreateUserParams, UpdateUserParams, User};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, password_changed_at, created_at";

/// PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Create the connection pool and verify the server is reachable.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(config.connect_options()?)
            .await
            .map_err(LedgerError::Connection)?;

        let database = Self { pool };
        database.health_check().await?;

        info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(database)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(LedgerError::Connection)?;
        Ok(())
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Handle = PgHandle;

    async fn acquire(&self) -> Result<PgHandle> {
        self.pool
            .acquire()
            .await
            .map(PgHandle::Conn)
            .map_err(LedgerError::Connection)
    }

    async fn begin(&self) -> Result<PgHandle> {
        self.pool
            .begin()
            .await
            .map(PgHandle::Tx)
            .map_err(LedgerError::Connection)
    }

    async fn commit(&self, handle: PgHandle) -> Result<()> {
        match handle {
            PgHandle::Tx(tx) => tx.commit().await.map_err(classify),
            PgHandle::Conn(_) => Ok(()),
        }
    }

    async fn rollback(&self, handle: PgHandle) -> Result<()> {
        match handle {
            PgHandle::Tx(tx) => tx.rollback().await.map_err(classify),
            PgHandle::Conn(_) => Ok(()),
        }
    }
}

/// A pooled connection, either in autocommit mode or inside a transaction.
///
/// Dropping a `Tx` handle without committing rolls the transaction back.
pub enum PgHandle {
    Conn(PoolConnection<Postgres>),
    Tx(Transaction<'static, Postgres>),
}

impl PgHandle {
    fn conn(&mut self) -> &mut PgConnection {
        match self {
            PgHandle::Conn(conn) => &mut **conn,
            PgHandle::Tx(tx) => &mut **tx,
        }
    }
}

/// Surface integrity violations (SQLSTATE class 23) with their code;
/// return everything else unmodified.
fn classify(err: sqlx::Error) -> LedgerError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code().filter(|code| code.starts_with("23")) {
            return LedgerError::ConstraintViolation {
                code: code.into_owned(),
                constraint: db.constraint().map(str::to_string),
                message: db.message().to_string(),
            };
        }
    }
    LedgerError::Database(err)
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let currency: String = row.try_get("currency")?;
    let currency = currency
        .parse::<Currency>()
        .map_err(|e| LedgerError::Database(sqlx::Error::Decode(Box::new(e))))?;

    Ok(Account {
        id: AccountId::new(row.try_get("id")?),
        owner: row.try_get("owner")?,
        balance: row.try_get("balance")?,
        currency,
        created_at: row.try_get("created_at")?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry> {
    let account_id: Option<i64> = row.try_get("account_id")?;
    Ok(Entry {
        id: EntryId::new(row.try_get("id")?),
        account_id: account_id.map(AccountId::new),
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer> {
    Ok(Transfer {
        id: TransferId::new(row.try_get("id")?),
        from_account_id: AccountId::new(row.try_get("from_account_id")?),
        to_account_id: AccountId::new(row.try_get("to_account_id")?),
        amount: row.try_get("amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User> {
    Ok(User {
        username: row.try_get("username")?,
        hashed_password: row.try_get("hashed_password")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        password_changed_at: row.try_get("password_changed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl Queries for PgHandle {
    async fn create_account(&mut self, params: CreateAccountParams) -> Result<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&params.owner)
        .bind(params.balance)
        .bind(params.currency.code())
        .fetch_one(self.conn())
        .await
        .map_err(classify)?;

        account_from_row(&row)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("account", id))?;

        account_from_row(&row)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 LIMIT 1 FOR NO KEY UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("account", id))?;

        account_from_row(&row)
    }

    async fn list_accounts(&mut self, params: ListAccountsParams) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(&params.owner)
        .bind(i64::from(params.limit))
        .bind(i64::from(params.offset))
        .fetch_all(self.conn())
        .await
        .map_err(classify)?;

        rows.iter().map(account_from_row).collect()
    }

    async fn update_account(&mut self, params: UpdateAccountParams) -> Result<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.id.get())
        .bind(params.balance)
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("account", params.id))?;

        account_from_row(&row)
    }

    async fn delete_account(&mut self, id: AccountId) -> Result<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(self.conn())
            .await
            .map_err(classify)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("account", id));
        }
        Ok(())
    }

    async fn add_account_balance(&mut self, params: AddAccountBalanceParams) -> Result<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(params.amount)
        .bind(params.id.get())
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("account", params.id))?;

        account_from_row(&row)
    }

    async fn create_entry(&mut self, params: CreateEntryParams) -> Result<Entry> {
        let row = sqlx::query(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(params.account_id.map(AccountId::get))
        .bind(params.amount)
        .fetch_one(self.conn())
        .await
        .map_err(classify)?;

        entry_from_row(&row)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        let row = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("entry", id))?;

        entry_from_row(&row)
    }

    async fn list_entries(&mut self, params: ListEntriesParams) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries \
             WHERE ($1::bigint IS NULL OR account_id = $1) \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(params.account_id.map(AccountId::get))
        .bind(i64::from(params.limit))
        .bind(i64::from(params.offset))
        .fetch_all(self.conn())
        .await
        .map_err(classify)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn create_transfer(&mut self, params: CreateTransferParams) -> Result<Transfer> {
        let row = sqlx::query(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) \
             VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(params.from_account_id.get())
        .bind(params.to_account_id.get())
        .bind(params.amount)
        .fetch_one(self.conn())
        .await
        .map_err(classify)?;

        transfer_from_row(&row)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1 LIMIT 1"
        ))
        .bind(id.get())
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("transfer", id))?;

        transfer_from_row(&row)
    }

    async fn list_transfers(&mut self, params: ListTransfersParams) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $2 \
             ORDER BY id LIMIT $3 OFFSET $4"
        ))
        .bind(params.from_account_id.get())
        .bind(params.to_account_id.get())
        .bind(i64::from(params.limit))
        .bind(i64::from(params.offset))
        .fetch_all(self.conn())
        .await
        .map_err(classify)?;

        rows.iter().map(transfer_from_row).collect()
    }

    async fn create_user(&mut self, params: CreateUserParams) -> Result<User> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (username, hashed_password, full_name, email) \
             VALUES ($1, $2, $3, $4) RETURNING {USER_COLUMNS}"
        ))
        .bind(&params.username)
        .bind(&params.hashed_password)
        .bind(&params.full_name)
        .bind(&params.email)
        .fetch_one(self.conn())
        .await
        .map_err(classify)?;

        user_from_row(&row)
    }

    async fn get_user(&mut self, username: &str) -> Result<User> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 LIMIT 1"
        ))
        .bind(username)
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("user", username))?;

        user_from_row(&row)
    }

    async fn update_user(&mut self, params: UpdateUserParams) -> Result<User> {
        let row = sqlx::query(&format!(
            "UPDATE users SET \
                 hashed_password = COALESCE($1, hashed_password), \
                 password_changed_at = CASE WHEN $1::varchar IS NULL \
                     THEN password_changed_at ELSE now() END, \
                 full_name = COALESCE($2, full_name), \
                 email = COALESCE($3, email) \
             WHERE username = $4 RETURNING {USER_COLUMNS}"
        ))
        .bind(params.hashed_password.as_deref())
        .bind(params.full_name.as_deref())
        .bind(params.email.as_deref())
        .bind(&params.username)
        .fetch_optional(self.conn())
        .await
        .map_err(classify)?
        .ok_or_else(|| LedgerError::not_found("user", &params.username))?;

        user_from_row(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_passes_through_non_database_errors() {
        let err = classify(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, LedgerError::Database(sqlx::Error::PoolTimedOut)));
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL running
    async fn test_connect_invalid_host() {
        let mut config = DatabaseConfig::default();
        config.host = "invalid.localdomain".to_string();
        config.acquire_timeout = std::time::Duration::from_secs(1);

        let result = PgDatabase::connect(&config).await;
        assert!(matches!(result, Err(LedgerError::Connection(_))));
    }
}
