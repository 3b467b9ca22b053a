//! Account rows and the parameters of the account queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simplebank_common::{AccountId, Currency};

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Username of the owning user.
    pub owner: String,
    /// Balance in the smallest unit of `currency`.
    pub balance: i64,
    /// Account currency.
    pub currency: Currency,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
}

/// Parameters for `create_account`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAccountParams {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

/// Parameters for `update_account` (administrative balance overwrite).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateAccountParams {
    pub id: AccountId,
    pub balance: i64,
}

/// Parameters for `add_account_balance`, the balance mutation primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddAccountBalanceParams {
    pub id: AccountId,
    /// Signed delta added to the balance.
    pub amount: i64,
}

/// Parameters for `list_accounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListAccountsParams {
    pub owner: String,
    pub limit: u32,
    pub offset: u32,
}
