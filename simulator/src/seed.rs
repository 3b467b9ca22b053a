//! Seeding of account holders for a simulation run.

use tracing::{debug, info};

use simplebank_common::Currency;
use simplebank_ledger::{
    Account, AfterCreate, BoxError, CreateAccountParams, CreateUserParams, CreateUserTxParams,
    Store,
};

const HOLDER_NAMES: [&str; 10] = [
    "Alpha Holder",
    "Beta Saver",
    "Central Trust",
    "Delta Holdings",
    "Eastern Co-op",
    "First Fund",
    "Global Partners",
    "Harbor Savings",
    "Island Credit",
    "Jade Capital",
];

/// Creates users and one USD account per user.
pub struct AccountSeeder<'a> {
    store: &'a dyn Store,
    run_id: String,
}

impl<'a> AccountSeeder<'a> {
    /// Usernames are prefixed with `run_id` so repeated runs against the
    /// same database do not collide.
    pub fn new(store: &'a dyn Store, run_id: impl Into<String>) -> Self {
        Self {
            store,
            run_id: run_id.into(),
        }
    }

    /// Create `count` holders, each with an account funded with
    /// `initial_balance`.
    pub async fn seed(&self, count: usize, initial_balance: i64) -> anyhow::Result<Vec<Account>> {
        let mut accounts = Vec::with_capacity(count);

        for i in 0..count {
            let username = format!("{}_{}", self.run_id, i);
            let full_name = HOLDER_NAMES
                .get(i)
                .map(|name| name.to_string())
                .unwrap_or_else(|| format!("Holder {}", i + 1));

            let params = CreateUserParams {
                email: format!("{username}@simplebank.test"),
                hashed_password: format!("seed-{username}"),
                full_name,
                username: username.clone(),
            };

            self.store
                .create_user_tx(CreateUserTxParams {
                    params,
                    after_create: AfterCreate::new(|user| async move {
                        debug!(username = %user.username, "Welcome queued");
                        Ok::<(), BoxError>(())
                    }),
                })
                .await?;

            let account = self
                .store
                .create_account(CreateAccountParams {
                    owner: username,
                    balance: initial_balance,
                    currency: Currency::Usd,
                })
                .await?;

            info!(
                account_id = %account.id,
                owner = %account.owner,
                balance = account.balance,
                "Seeded account"
            );
            accounts.push(account);
        }

        Ok(accounts)
    }
}
