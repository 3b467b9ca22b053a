//! Transactional store.
//!
//! `SqlStore` runs composite operations as single units of work over any
//! `Database` backend and exposes them through the object-safe `Store`
//! trait.

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{debug, error, info, instrument, warn};

use simplebank_common::{AccountId, EntryId, TransferId};

use crate::account::{Account, AddAccountBalanceParams, CreateAccountParams, ListAccountsParams};
use crate::balance::{BalanceLeg, LockOrder};
use crate::entry::{CreateEntryParams, Entry, ListEntriesParams};
use crate::error::{LedgerError, Result};
use crate::queries::{Database, Queries};
use crate::transfer::{ListTransfersParams, Transfer, TransferTxParams, TransferTxResult};
use crate::user::{CreateUserParams, CreateUserTxParams, CreateUserTxResult, User};

/// Operations the API layer performs against the ledger.
#[async_trait]
pub trait Store: Send + Sync {
    /// Move `amount` from one account to another, recording the transfer
    /// and both entries, in one unit of work.
    async fn transfer_tx(&self, params: TransferTxParams) -> Result<TransferTxResult>;

    /// Create a user and run its after-create hook in one unit of work.
    async fn create_user_tx(&self, params: CreateUserTxParams) -> Result<CreateUserTxResult>;

    async fn create_user(&self, params: CreateUserParams) -> Result<User>;

    async fn get_user(&self, username: &str) -> Result<User>;

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account>;

    async fn get_account(&self, id: AccountId) -> Result<Account>;

    async fn list_accounts(&self, params: ListAccountsParams) -> Result<Vec<Account>>;

    async fn get_entry(&self, id: EntryId) -> Result<Entry>;

    async fn list_entries(&self, params: ListEntriesParams) -> Result<Vec<Entry>>;

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer>;

    async fn list_transfers(&self, params: ListTransfersParams) -> Result<Vec<Transfer>>;
}

/// Store backed by a transactional database.
pub struct SqlStore<D> {
    db: D,
}

impl<D: Database> SqlStore<D> {
    /// Create a store over a backend.
    pub fn new(db: D) -> Self {
        Self { db }
    }

    /// The underlying backend.
    pub fn database(&self) -> &D {
        &self.db
    }

    /// Run `work` inside a transaction.
    ///
    /// Commits when `work` succeeds. Otherwise rolls back and returns the
    /// error of `work`, or `LedgerError::Rollback` carrying both errors when
    /// the rollback fails as well.
    pub async fn exec_tx<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut D::Handle) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut tx = self.db.begin().await?;

        match work(&mut tx).await {
            Ok(value) => {
                self.db.commit(tx).await?;
                Ok(value)
            }
            Err(err) => match self.db.rollback(tx).await {
                Ok(()) => {
                    debug!(error = %err, "Transaction rolled back");
                    Err(err)
                }
                Err(rollback) => {
                    error!(error = %err, rollback_error = %rollback, "Rollback failed");
                    Err(LedgerError::Rollback {
                        source: Box::new(err),
                        rollback: Box::new(rollback),
                    })
                }
            },
        }
    }
}

async fn apply_leg<Q: Queries + ?Sized>(q: &mut Q, leg: BalanceLeg) -> Result<Account> {
    q.add_account_balance(AddAccountBalanceParams {
        id: leg.account_id,
        amount: leg.delta,
    })
    .await
}

#[async_trait]
impl<D: Database> Store for SqlStore<D> {
    #[instrument(
        skip(self, params),
        fields(
            from_account_id = %params.from_account_id,
            to_account_id = %params.to_account_id,
            amount = params.amount
        )
    )]
    async fn transfer_tx(&self, params: TransferTxParams) -> Result<TransferTxResult> {
        if let Err(err) = params.validate() {
            warn!(error = %err, "Transfer rejected");
            return Err(err);
        }

        let result = self
            .exec_tx(move |q| {
                Box::pin(async move {
                    let transfer = q.create_transfer(params.into()).await?;

                    let from_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: Some(params.from_account_id),
                            amount: -params.amount,
                        })
                        .await?;

                    let to_entry = q
                        .create_entry(CreateEntryParams {
                            account_id: Some(params.to_account_id),
                            amount: params.amount,
                        })
                        .await?;

                    let order = LockOrder::for_pair(params.from_account_id, params.to_account_id);
                    let [first, second] = order.arrange(
                        BalanceLeg::debit(params.from_account_id, params.amount),
                        BalanceLeg::credit(params.to_account_id, params.amount),
                    );
                    let first = apply_leg(q, first).await?;
                    let second = apply_leg(q, second).await?;
                    let (from_account, to_account) = order.restore([first, second]);

                    Ok(TransferTxResult {
                        transfer,
                        from_account,
                        to_account,
                        from_entry,
                        to_entry,
                    })
                })
            })
            .await?;

        info!(
            transfer_id = %result.transfer.id,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "Transfer committed"
        );

        Ok(result)
    }

    #[instrument(skip(self, params), fields(username = %params.params.username))]
    async fn create_user_tx(&self, params: CreateUserTxParams) -> Result<CreateUserTxResult> {
        let CreateUserTxParams {
            params,
            after_create,
        } = params;

        let user = self
            .exec_tx(move |q| {
                Box::pin(async move {
                    let user = q.create_user(params).await?;
                    after_create
                        .run(user.clone())
                        .await
                        .map_err(LedgerError::AfterCreate)?;
                    Ok(user)
                })
            })
            .await?;

        info!(username = %user.username, "User created");

        Ok(CreateUserTxResult { user })
    }

    async fn create_user(&self, params: CreateUserParams) -> Result<User> {
        self.db.acquire().await?.create_user(params).await
    }

    async fn get_user(&self, username: &str) -> Result<User> {
        self.db.acquire().await?.get_user(username).await
    }

    async fn create_account(&self, params: CreateAccountParams) -> Result<Account> {
        self.db.acquire().await?.create_account(params).await
    }

    async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.db.acquire().await?.get_account(id).await
    }

    async fn list_accounts(&self, params: ListAccountsParams) -> Result<Vec<Account>> {
        self.db.acquire().await?.list_accounts(params).await
    }

    async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        self.db.acquire().await?.get_entry(id).await
    }

    async fn list_entries(&self, params: ListEntriesParams) -> Result<Vec<Entry>> {
        self.db.acquire().await?.list_entries(params).await
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        self.db.acquire().await?.get_transfer(id).await
    }

    async fn list_transfers(&self, params: ListTransfersParams) -> Result<Vec<Transfer>> {
        self.db.acquire().await?.list_transfers(params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::net_amount;
    use crate::error::BoxError;
    use crate::memory::MemoryDatabase;
    use crate::user::AfterCreate;
    use proptest::prelude::*;
    use simplebank_common::Currency;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Barrier;

    fn user_params(username: &str) -> CreateUserParams {
        CreateUserParams {
            username: username.to_string(),
            hashed_password: "hash".to_string(),
            full_name: username.to_uppercase(),
            email: format!("{username}@example.com"),
        }
    }

    async fn open_account(store: &dyn Store, owner: &str, balance: i64) -> Account {
        store.create_user(user_params(owner)).await.unwrap();
        store
            .create_account(CreateAccountParams {
                owner: owner.to_string(),
                balance,
                currency: Currency::Usd,
            })
            .await
            .unwrap()
    }

    type TestStore = Arc<SqlStore<MemoryDatabase>>;

    async fn setup(from_balance: i64, to_balance: i64) -> (MemoryDatabase, TestStore, Account, Account) {
        let db = MemoryDatabase::new();
        let store = Arc::new(SqlStore::new(db.clone()));
        let from = open_account(store.as_ref(), "alice", from_balance).await;
        let to = open_account(store.as_ref(), "bob", to_balance).await;
        (db, store, from, to)
    }

    #[tokio::test]
    async fn test_transfer_tx_moves_funds() {
        let (_db, store, from, to) = setup(1000, 500).await;

        let result = store
            .transfer_tx(TransferTxParams::new(from.id, to.id, 100))
            .await
            .unwrap();

        assert_eq!(result.transfer.from_account_id, from.id);
        assert_eq!(result.transfer.to_account_id, to.id);
        assert_eq!(result.transfer.amount, 100);

        assert_eq!(result.from_entry.account_id, Some(from.id));
        assert_eq!(result.from_entry.amount, -100);
        assert_eq!(result.to_entry.account_id, Some(to.id));
        assert_eq!(result.to_entry.amount, 100);
        assert_eq!(net_amount([&result.from_entry, &result.to_entry]), 0);

        assert_eq!(result.from_account.id, from.id);
        assert_eq!(result.from_account.balance, 900);
        assert_eq!(result.to_account.id, to.id);
        assert_eq!(result.to_account.balance, 600);
    }

    #[tokio::test]
    async fn test_transfer_tx_records_are_readable() {
        let (_db, store, from, to) = setup(1000, 500).await;

        // Lower id receiving exercises the reversed lock order.
        let result = store
            .transfer_tx(TransferTxParams::new(to.id, from.id, 25))
            .await
            .unwrap();

        assert_eq!(store.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
        assert_eq!(store.get_entry(result.from_entry.id).await.unwrap(), result.from_entry);
        assert_eq!(store.get_entry(result.to_entry.id).await.unwrap(), result.to_entry);
        assert_eq!(store.get_account(to.id).await.unwrap(), result.from_account);
        assert_eq!(store.get_account(from.id).await.unwrap(), result.to_account);
        assert_eq!(result.from_account.balance, 475);
        assert_eq!(result.to_account.balance, 1025);

        let transfers = store
            .list_transfers(ListTransfersParams {
                from_account_id: to.id,
                to_account_id: to.id,
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(transfers, vec![result.transfer]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_direction_transfers() {
        let (_db, store, from, to) = setup(1000, 500).await;
        let n = 5;
        let amount = 10;

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .transfer_tx(TransferTxParams::new(from.id, to.id, amount))
                        .await
                })
            })
            .collect();

        let mut seen = BTreeSet::new();
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            let from_diff = from.balance - result.from_account.balance;
            let to_diff = result.to_account.balance - to.balance;
            assert_eq!(from_diff, to_diff);
            assert!(from_diff > 0);
            assert_eq!(from_diff % amount, 0);
            assert!(seen.insert(from_diff / amount));
        }

        assert_eq!(seen, (1..=n).collect::<BTreeSet<i64>>());
        assert_eq!(store.get_account(from.id).await.unwrap().balance, from.balance - n * amount);
        assert_eq!(store.get_account(to.id).await.unwrap().balance, to.balance + n * amount);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_alternating_transfers_do_not_deadlock() {
        let (_db, store, a, b) = setup(1000, 500).await;
        let n = 10;

        let handles: Vec<_> = (0..n)
            .map(|i| {
                let store = Arc::clone(&store);
                let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
                tokio::spawn(async move {
                    store.transfer_tx(TransferTxParams::new(from, to, 10)).await
                })
            })
            .collect();

        tokio::time::timeout(Duration::from_secs(5), async {
            for handle in handles {
                handle.await.unwrap().unwrap();
            }
        })
        .await
        .expect("alternating transfers deadlocked");

        assert_eq!(store.get_account(a.id).await.unwrap().balance, a.balance);
        assert_eq!(store.get_account(b.id).await.unwrap().balance, b.balance);
    }

    /// Debit `first`, wait for the other locker, then credit `second`.
    async fn lock_in_order(
        store: &TestStore,
        barrier: Arc<Barrier>,
        first: AccountId,
        second: AccountId,
    ) -> Result<()> {
        store
            .exec_tx(move |q| {
                Box::pin(async move {
                    apply_leg(q, BalanceLeg::debit(first, 1)).await?;
                    barrier.wait().await;
                    apply_leg(q, BalanceLeg::credit(second, 1)).await?;
                    Ok(())
                })
            })
            .await
    }

    #[tokio::test]
    async fn test_opposite_order_locking_deadlocks() {
        let (_db, store, a, b) = setup(1000, 500).await;
        let barrier = Arc::new(Barrier::new(2));

        let deadlocked = tokio::time::timeout(Duration::from_millis(200), async {
            tokio::join!(
                lock_in_order(&store, Arc::clone(&barrier), a.id, b.id),
                lock_in_order(&store, Arc::clone(&barrier), b.id, a.id),
            )
        })
        .await;
        assert!(deadlocked.is_err());

        // Both transactions were cancelled together, so nothing changed and
        // the row locks were released.
        assert_eq!(store.get_account(a.id).await.unwrap().balance, a.balance);
        assert_eq!(store.get_account(b.id).await.unwrap().balance, b.balance);
        store
            .transfer_tx(TransferTxParams::new(a.id, b.id, 1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transfer_to_missing_account_leaves_no_trace() {
        let (db, store, from, _to) = setup(1000, 500).await;
        let before = db.snapshot();

        let err = store
            .transfer_tx(TransferTxParams::new(from.id, AccountId::new(999), 100))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));
        assert_eq!(db.snapshot(), before);
    }

    #[tokio::test]
    async fn test_invalid_transfer_never_opens_a_transaction() {
        let (db, store, from, to) = setup(1000, 500).await;
        db.fail_next_begin();

        let err = store
            .transfer_tx(TransferTxParams::new(from.id, to.id, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransfer(_)));

        let err = store
            .transfer_tx(TransferTxParams::new(from.id, from.id, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransfer(_)));

        // The injected fault is still armed.
        let err = store
            .transfer_tx(TransferTxParams::new(from.id, to.id, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Connection(_)));
    }

    #[tokio::test]
    async fn test_begin_failure_has_no_side_effects() {
        let (db, store, from, to) = setup(1000, 500).await;
        let before = db.snapshot();
        db.fail_next_begin();

        let err = store
            .transfer_tx(TransferTxParams::new(from.id, to.id, 10))
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "CONNECTION_ERROR");
        assert!(err.is_retryable());
        assert_eq!(db.snapshot(), before);
    }

    #[tokio::test]
    async fn test_commit_failure_discards_writes() {
        let (db, store, from, to) = setup(1000, 500).await;
        let before = db.snapshot();
        db.fail_next_commit();

        let err = store
            .transfer_tx(TransferTxParams::new(from.id, to.id, 10))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Internal(_)));
        assert_eq!(db.snapshot(), before);
    }

    #[tokio::test]
    async fn test_rollback_failure_keeps_both_errors() {
        let (db, store, from, _to) = setup(1000, 500).await;
        let before = db.snapshot();
        db.fail_next_rollback();

        let err = store
            .transfer_tx(TransferTxParams::new(from.id, AccountId::new(404), 10))
            .await
            .unwrap_err();

        match err {
            LedgerError::Rollback { source, rollback } => {
                assert!(matches!(*source, LedgerError::ConstraintViolation { .. }));
                assert!(matches!(*rollback, LedgerError::Internal(_)));
            }
            other => panic!("expected rollback error, got {other:?}"),
        }
        assert_eq!(db.snapshot(), before);
    }

    #[tokio::test]
    async fn test_cancelled_transfer_rolls_back() {
        let (db, store, from, to) = setup(1000, 500).await;
        let before = db.snapshot();

        let mut blocker = db.begin().await.unwrap();
        blocker.get_account_for_update(from.id).await.unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            store.transfer_tx(TransferTxParams::new(from.id, to.id, 10)),
        )
        .await;
        assert!(cancelled.is_err());

        db.rollback(blocker).await.unwrap();
        assert_eq!(db.snapshot(), before);

        let result = store
            .transfer_tx(TransferTxParams::new(from.id, to.id, 10))
            .await
            .unwrap();
        assert_eq!(result.from_account.balance, 990);
    }

    #[tokio::test]
    async fn test_create_user_tx_runs_hook_with_created_user() {
        let db = MemoryDatabase::new();
        let store: Arc<dyn Store> = Arc::new(SqlStore::new(db));
        let (sender, receiver) = tokio::sync::oneshot::channel();

        let result = store
            .create_user_tx(CreateUserTxParams {
                params: user_params("erin"),
                after_create: AfterCreate::new(move |user: User| async move {
                    sender
                        .send(user.username)
                        .map_err(|_| BoxError::from("receiver dropped"))
                }),
            })
            .await
            .unwrap();

        assert_eq!(receiver.await.unwrap(), "erin");
        assert_eq!(store.get_user("erin").await.unwrap(), result.user);
    }

    #[tokio::test]
    async fn test_failing_hook_rolls_back_user() {
        let db = MemoryDatabase::new();
        let store = SqlStore::new(db.clone());

        let err = store
            .create_user_tx(CreateUserTxParams {
                params: user_params("frank"),
                after_create: AfterCreate::new(|_| async { Err(BoxError::from("mailer unavailable")) }),
            })
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "AFTER_CREATE_FAILED");
        assert!(err.to_string().contains("mailer unavailable"));
        assert!(store.get_user("frank").await.unwrap_err().is_not_found());
        assert!(db.snapshot().users.is_empty());
    }

    #[tokio::test]
    async fn test_create_user_tx_duplicate_username() {
        let store = SqlStore::new(MemoryDatabase::new());
        store.create_user(user_params("gina")).await.unwrap();

        let err = store
            .create_user_tx(CreateUserTxParams {
                params: user_params("gina"),
                after_create: AfterCreate::noop(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation { .. }));
    }

    proptest! {
        #[test]
        fn prop_transfers_conserve_total_balance(
            moves in prop::collection::vec((0usize..3, 0usize..3, 1i64..200), 1..20)
        ) {
            tokio_test::block_on(async {
                let db = MemoryDatabase::new();
                let store = SqlStore::new(db.clone());
                let mut accounts = Vec::new();
                for (i, owner) in ["ann", "ben", "cat"].into_iter().enumerate() {
                    accounts.push(open_account(&store, owner, 100 * (i as i64 + 1)).await);
                }
                let total: i64 = accounts.iter().map(|a| a.balance).sum();

                for (from, to, amount) in moves {
                    let params = TransferTxParams::new(accounts[from].id, accounts[to].id, amount);
                    let outcome = store.transfer_tx(params).await;
                    assert_eq!(outcome.is_ok(), from != to);
                }

                let snapshot = db.snapshot();
                let final_total: i64 = snapshot.accounts.values().map(|a| a.balance).sum();
                assert_eq!(final_total, total);
                assert_eq!(net_amount(snapshot.entries.values()), 0);

                for account in &accounts {
                    let entries = snapshot
                        .entries
                        .values()
                        .filter(|e| e.account_id == Some(account.id));
                    assert_eq!(
                        snapshot.accounts[&account.id].balance,
                        account.balance + net_amount(entries)
                    );
                }
            });
        }
    }
}
