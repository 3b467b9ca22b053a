//! Integration tests against a live PostgreSQL server.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::Executor;
use uuid::Uuid;

use simplebank_common::Currency;
use simplebank_ledger::{
    Account, AfterCreate, BoxError, CreateAccountParams, CreateUserParams, CreateUserTxParams,
    DatabaseConfig, LedgerError, PgDatabase, SqlStore, Store, TransferTxParams,
};

static SCHEMA_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

async fn connect() -> Option<Arc<SqlStore<PgDatabase>>> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    };

    let db = PgDatabase::connect(&DatabaseConfig::with_dsn(url))
        .await
        .expect("connect to DATABASE_URL");

    {
        let _guard = SCHEMA_LOCK.lock().await;
        db.pool()
            .execute(include_str!("../schema.sql"))
            .await
            .expect("apply schema");
    }

    Some(Arc::new(SqlStore::new(db)))
}

fn unique_user() -> CreateUserParams {
    let username = format!("user_{}", Uuid::new_v4().simple());
    CreateUserParams {
        email: format!("{username}@example.com"),
        full_name: username.clone(),
        hashed_password: "hash".to_string(),
        username,
    }
}

async fn open_account(store: &dyn Store, balance: i64) -> Account {
    let user = store.create_user(unique_user()).await.unwrap();
    store
        .create_account(CreateAccountParams {
            owner: user.username,
            balance,
            currency: Currency::Usd,
        })
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn test_transfer_tx_moves_funds() {
    let Some(store) = connect().await else { return };
    let from = open_account(store.as_ref(), 1000).await;
    let to = open_account(store.as_ref(), 500).await;

    let result = store
        .transfer_tx(TransferTxParams::new(from.id, to.id, 100))
        .await
        .unwrap();

    assert_eq!(result.from_account.balance, 900);
    assert_eq!(result.to_account.balance, 600);
    assert_eq!(result.from_entry.amount + result.to_entry.amount, 0);
    assert_eq!(store.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn test_concurrent_alternating_transfers() {
    let Some(store) = connect().await else { return };
    let a = open_account(store.as_ref(), 1000).await;
    let b = open_account(store.as_ref(), 1000).await;

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let store = Arc::clone(&store);
            let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
            tokio::spawn(async move { store.transfer_tx(TransferTxParams::new(from, to, 10)).await })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(10), async {
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
    })
    .await
    .expect("alternating transfers did not finish");

    assert_eq!(store.get_account(a.id).await.unwrap().balance, 1000);
    assert_eq!(store.get_account(b.id).await.unwrap().balance, 1000);
}

#[tokio::test]
#[ignore]
async fn test_transfer_to_missing_account_is_constraint_violation() {
    let Some(store) = connect().await else { return };
    let from = open_account(store.as_ref(), 1000).await;

    let err = store
        .transfer_tx(TransferTxParams::new(from.id, simplebank_common::AccountId::new(i64::MAX), 10))
        .await
        .unwrap_err();

    match err {
        LedgerError::ConstraintViolation { code, .. } => assert_eq!(code, "23503"),
        other => panic!("expected constraint violation, got {other:?}"),
    }
    assert_eq!(store.get_account(from.id).await.unwrap().balance, 1000);
}

#[tokio::test]
#[ignore]
async fn test_failing_hook_rolls_back_user() {
    let Some(store) = connect().await else { return };
    let params = unique_user();
    let username = params.username.clone();

    let err = store
        .create_user_tx(CreateUserTxParams {
            params,
            after_create: AfterCreate::new(|_| async { Err(BoxError::from("queue down")) }),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::AfterCreate(_)));
    assert!(store.get_user(&username).await.unwrap_err().is_not_found());
}
