//! Balance legs of a transfer and the order their rows are locked in.
//!
//! A transfer has two logical legs (debit the sender, credit the receiver)
//! and a physical lock order (ascending account id). The two are kept as
//! separate values: applying the legs in from/to order would let two
//! opposite transfers between the same accounts lock the rows in opposite
//! order and deadlock.

use simplebank_common::AccountId;

/// One balance mutation of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceLeg {
    /// Account whose balance changes.
    pub account_id: AccountId,
    /// Signed delta applied to the balance.
    pub delta: i64,
}

impl BalanceLeg {
    /// Leg removing `amount` from an account.
    pub fn debit(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            delta: -amount,
        }
    }

    /// Leg adding `amount` to an account.
    pub fn credit(account_id: AccountId, amount: i64) -> Self {
        Self {
            account_id,
            delta: amount,
        }
    }
}

/// Which leg of a transfer locks its account row first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOrder {
    /// The sending account has the lower id.
    FromFirst,
    /// The receiving account has the lower id.
    ToFirst,
}

impl LockOrder {
    /// Lock order for a transfer between two accounts.
    pub fn for_pair(from: AccountId, to: AccountId) -> Self {
        if from < to {
            LockOrder::FromFirst
        } else {
            LockOrder::ToFirst
        }
    }

    /// Arrange the logical legs in the order their rows must be locked.
    pub fn arrange(self, from: BalanceLeg, to: BalanceLeg) -> [BalanceLeg; 2] {
        match self {
            LockOrder::FromFirst => [from, to],
            LockOrder::ToFirst => [to, from],
        }
    }

    /// Map values produced in lock order back to `(from, to)`.
    pub fn restore<T>(self, locked: [T; 2]) -> (T, T) {
        let [first, second] = locked;
        match self {
            LockOrder::FromFirst => (first, second),
            LockOrder::ToFirst => (second, first),
        }
    }
}
