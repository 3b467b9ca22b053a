//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use simplebank_ledger::{Account, ListEntriesParams, Store};

use crate::metrics::{MetricsSummary, SimulationMetrics};
use crate::scenario::{PlannedTransfer, Scenario};

const ENTRY_PAGE: u32 = 500;

/// Ledger state checks run after a simulation.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    /// Sum of seeded balances.
    pub total_before: i64,
    /// Sum of the same accounts' balances after the run.
    pub total_after: i64,
    /// No money was created or destroyed.
    pub conserved: bool,
    /// Every account's balance change equals the net of its entries.
    pub entries_match_balances: bool,
}

impl Verification {
    pub fn passed(&self) -> bool {
        self.conserved && self.entries_match_balances
    }
}

/// Result of one simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: Scenario,
    pub description: &'static str,
    pub accounts: usize,
    pub workers: usize,
    pub elapsed_ms: u64,
    pub metrics: MetricsSummary,
    pub verification: Verification,
}

/// Drives planned transfers through a store concurrently.
pub struct SimulationController {
    /// Store under test.
    store: Arc<dyn Store>,
    /// Maximum transfers in flight.
    workers: usize,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(store: Arc<dyn Store>, workers: usize) -> Self {
        Self {
            store,
            workers: workers.max(1),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Run a scenario over seeded accounts and verify the ledger afterwards.
    pub async fn execute(
        &self,
        scenario: Scenario,
        accounts: &[Account],
        plan: Vec<PlannedTransfer>,
    ) -> anyhow::Result<SimulationReport> {
        info!(
            scenario = ?scenario,
            transfers = plan.len(),
            workers = self.workers,
            "Running scenario: {}",
            scenario.description()
        );

        let elapsed = self.run(plan).await?;
        let verification = self.verify(accounts).await?;
        let metrics = self.metrics().await.summary(elapsed);

        Ok(SimulationReport {
            scenario,
            description: scenario.description(),
            accounts: accounts.len(),
            workers: self.workers,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            metrics,
            verification,
        })
    }

    /// Submit every planned transfer, at most `workers` at a time.
    pub async fn run(&self, plan: Vec<PlannedTransfer>) -> anyhow::Result<Duration> {
        let start = Instant::now();

        let joined: Vec<_> = stream::iter(plan)
            .map(|planned| {
                let store = Arc::clone(&self.store);
                let metrics = Arc::clone(&self.metrics);
                tokio::spawn(async move { submit(store.as_ref(), &metrics, planned).await })
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        for result in joined {
            result?;
        }

        Ok(start.elapsed())
    }

    /// Check conservation of the total balance and that each account's
    /// balance change matches its entries.
    pub async fn verify(&self, before: &[Account]) -> anyhow::Result<Verification> {
        let mut total_before = 0;
        let mut total_after = 0;
        let mut entries_match_balances = true;

        for account in before {
            let current = self.store.get_account(account.id).await?;
            let net = self.net_entries(account).await?;

            if current.balance - account.balance != net {
                warn!(
                    account_id = %account.id,
                    before = account.balance,
                    after = current.balance,
                    net_entries = net,
                    "Balance does not match entries"
                );
                entries_match_balances = false;
            }

            total_before += account.balance;
            total_after += current.balance;
        }

        let verification = Verification {
            total_before,
            total_after,
            conserved: total_before == total_after,
            entries_match_balances,
        };

        if verification.passed() {
            info!(total = total_after, "Ledger verified");
        } else {
            warn!(?verification, "Ledger verification failed");
        }

        Ok(verification)
    }

    async fn net_entries(&self, account: &Account) -> anyhow::Result<i64> {
        let mut net = 0;
        let mut offset = 0;

        loop {
            let page = self
                .store
                .list_entries(ListEntriesParams {
                    account_id: Some(account.id),
                    limit: ENTRY_PAGE,
                    offset,
                })
                .await?;

            net += page.iter().map(|entry| entry.amount).sum::<i64>();
            if page.len() < ENTRY_PAGE as usize {
                return Ok(net);
            }
            offset += ENTRY_PAGE;
        }
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}

async fn submit(store: &dyn Store, metrics: &RwLock<SimulationMetrics>, planned: PlannedTransfer) {
    let start = Instant::now();
    let outcome = store.transfer_tx(planned.params).await;
    let latency = start.elapsed();

    let mut metrics = metrics.write().await;
    match &outcome {
        Ok(result) => {
            debug!(transfer_id = %result.transfer.id, "Transfer succeeded");
            metrics.record_success(latency);
        }
        Err(e) => {
            debug!(error = %e, code = e.error_code(), "Transfer failed");
            metrics.record_failure(latency);
        }
    }

    if outcome.is_ok() != planned.expect_success {
        warn!(
            from_account_id = %planned.params.from_account_id,
            to_account_id = %planned.params.to_account_id,
            expected_success = planned.expect_success,
            "Unexpected transfer outcome"
        );
        metrics.record_unexpected();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seed::AccountSeeder;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use simplebank_ledger::{MemoryDatabase, SqlStore};

    async fn setup(accounts: usize) -> (Arc<dyn Store>, Vec<Account>) {
        let store: Arc<dyn Store> = Arc::new(SqlStore::new(MemoryDatabase::new()));
        let accounts = AccountSeeder::new(store.as_ref(), "sim")
            .seed(accounts, 1000)
            .await
            .unwrap();
        (store, accounts)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_direction_run() {
        let (store, accounts) = setup(2).await;
        let controller = SimulationController::new(Arc::clone(&store), 4);
        let plan = Scenario::SameDirection
            .plan(&accounts, 20, 10, &mut StdRng::seed_from_u64(1))
            .unwrap();

        let report = controller
            .execute(Scenario::SameDirection, &accounts, plan)
            .await
            .unwrap();

        assert!(report.verification.passed());
        assert_eq!(report.metrics.successful_transfers, 20);
        assert_eq!(store.get_account(accounts[0].id).await.unwrap().balance, 800);
        assert_eq!(store.get_account(accounts[1].id).await.unwrap().balance, 1200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_random_run_conserves_total() {
        let (store, accounts) = setup(5).await;
        let controller = SimulationController::new(store, 8);
        let plan = Scenario::Random
            .plan(&accounts, 100, 50, &mut StdRng::seed_from_u64(9))
            .unwrap();

        let report = controller
            .execute(Scenario::Random, &accounts, plan)
            .await
            .unwrap();

        assert_eq!(report.verification.total_before, 5000);
        assert!(report.verification.conserved);
        assert!(report.verification.entries_match_balances);
        assert_eq!(report.metrics.unexpected_outcomes, 0);
    }

    #[tokio::test]
    async fn test_failed_transfers_are_expected() {
        let (store, accounts) = setup(2).await;
        let controller = SimulationController::new(store, 2);
        let plan = Scenario::FailedTransfer
            .plan(&accounts, 10, 5, &mut StdRng::seed_from_u64(3))
            .unwrap();

        let report = controller
            .execute(Scenario::FailedTransfer, &accounts, plan)
            .await
            .unwrap();

        assert_eq!(report.metrics.failed_transfers, 5);
        assert_eq!(report.metrics.unexpected_outcomes, 0);
        assert!(report.verification.passed());
    }
}
