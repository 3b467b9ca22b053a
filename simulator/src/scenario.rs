//! Simulation scenarios.

use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use simplebank_common::AccountId;
use simplebank_ledger::{Account, TransferTxParams};

/// Account id no seeded account can have.
const MISSING_ACCOUNT: AccountId = AccountId::new(i64::MAX);

/// Transfer workload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    /// One transfer between the first two accounts.
    SimpleTransfer,
    /// Every transfer moves funds from the first account to the second.
    SameDirection,
    /// Transfers bounce between the first two accounts in both directions.
    Alternating,
    /// Random pairs of distinct accounts.
    Random,
    /// Every other transfer targets an account that does not exist.
    FailedTransfer,
}

/// A transfer to submit and whether it should commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTransfer {
    pub params: TransferTxParams,
    pub expect_success: bool,
}

impl PlannedTransfer {
    fn valid(from: AccountId, to: AccountId, amount: i64) -> Self {
        Self {
            params: TransferTxParams::new(from, to, amount),
            expect_success: true,
        }
    }

    fn doomed(from: AccountId, amount: i64) -> Self {
        Self {
            params: TransferTxParams::new(from, MISSING_ACCOUNT, amount),
            expect_success: false,
        }
    }
}

impl Scenario {
    /// Short description for reports.
    pub fn description(self) -> &'static str {
        match self {
            Scenario::SimpleTransfer => "Single transfer between two accounts",
            Scenario::SameDirection => "Concurrent transfers contending on one account pair",
            Scenario::Alternating => "Concurrent transfers in opposite directions on one pair",
            Scenario::Random => "Concurrent transfers between random account pairs",
            Scenario::FailedTransfer => "Transfers to a missing account interleaved with valid ones",
        }
    }

    /// Build the list of transfers to submit.
    pub fn plan(
        self,
        accounts: &[Account],
        transfers: usize,
        amount: i64,
        rng: &mut StdRng,
    ) -> anyhow::Result<Vec<PlannedTransfer>> {
        if accounts.len() < 2 {
            anyhow::bail!("Scenario {self:?} needs at least 2 accounts, got {}", accounts.len());
        }

        let a = accounts[0].id;
        let b = accounts[1].id;

        let plan = match self {
            Scenario::SimpleTransfer => vec![PlannedTransfer::valid(a, b, amount)],
            Scenario::SameDirection => (0..transfers)
                .map(|_| PlannedTransfer::valid(a, b, amount))
                .collect(),
            Scenario::Alternating => (0..transfers)
                .map(|i| {
                    if i % 2 == 0 {
                        PlannedTransfer::valid(a, b, amount)
                    } else {
                        PlannedTransfer::valid(b, a, amount)
                    }
                })
                .collect(),
            Scenario::Random => (0..transfers)
                .map(|_| {
                    let from = rng.gen_range(0..accounts.len());
                    let mut to = rng.gen_range(0..accounts.len());
                    while to == from {
                        to = rng.gen_range(0..accounts.len());
                    }
                    let amount = rng.gen_range(1..=amount);
                    PlannedTransfer::valid(accounts[from].id, accounts[to].id, amount)
                })
                .collect(),
            Scenario::FailedTransfer => (0..transfers)
                .map(|i| {
                    if i % 2 == 0 {
                        PlannedTransfer::valid(a, b, amount)
                    } else {
                        PlannedTransfer::doomed(a, amount)
                    }
                })
                .collect(),
        };

        Ok(plan)
    }
}
