//! Transfer rows and the composite transfer parameters/result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simplebank_common::{AccountId, TransferId};

use crate::account::Account;
use crate::entry::Entry;
use crate::error::{LedgerError, Result};

/// An immutable record of a movement of funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Unique transfer ID.
    pub id: TransferId,
    /// Sending account.
    pub from_account_id: AccountId,
    /// Receiving account.
    pub to_account_id: AccountId,
    /// Amount moved. Always positive.
    pub amount: i64,
    /// When the transfer was recorded.
    pub created_at: DateTime<Utc>,
}

/// Parameters for `create_transfer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransferParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

/// Parameters for `list_transfers`.
///
/// Matches transfers sent from `from_account_id` or received by
/// `to_account_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListTransfersParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub limit: u32,
    pub offset: u32,
}

/// Input of the transfer composite operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
}

impl TransferTxParams {
    /// Create transfer parameters.
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Reject transfers that no caller may ever perform.
    pub fn validate(&self) -> Result<()> {
        if self.amount <= 0 {
            return Err(LedgerError::InvalidTransfer(format!(
                "amount must be positive, got {}",
                self.amount
            )));
        }

        if self.from_account_id == self.to_account_id {
            return Err(LedgerError::InvalidTransfer(format!(
                "source and destination are the same account ({})",
                self.from_account_id
            )));
        }

        Ok(())
    }
}

impl From<TransferTxParams> for CreateTransferParams {
    fn from(params: TransferTxParams) -> Self {
        Self {
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
        }
    }
}

/// Result of the transfer composite operation. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    /// Sending account after the debit.
    pub from_account: Account,
    /// Receiving account after the credit.
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_positive_distinct() {
        let params = TransferTxParams::new(AccountId::new(1), AccountId::new(2), 10);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_positive_amount() {
        for amount in [0, -5] {
            let params = TransferTxParams::new(AccountId::new(1), AccountId::new(2), amount);
            assert!(matches!(
                params.validate(),
                Err(LedgerError::InvalidTransfer(_))
            ));
        }
    }

    #[test]
    fn test_validate_rejects_self_transfer() {
        let params = TransferTxParams::new(AccountId::new(3), AccountId::new(3), 10);
        let err = params.validate().unwrap_err();
        assert_eq!(err.error_code(), "INVALID_TRANSFER");
    }
}
