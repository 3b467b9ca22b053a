//! Simple Bank Simulator
//!
//! Seeds accounts, fires concurrent transfers at the ledger and checks that
//! no money was created or lost.

use std::sync::Arc;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simplebank_ledger::{DatabaseConfig, MemoryDatabase, PgDatabase, SqlStore, Store};

mod controller;
mod metrics;
mod scenario;
mod seed;

use controller::SimulationController;
use scenario::Scenario;
use seed::AccountSeeder;

/// Simple Bank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Concurrent transfer simulator for the simplebank ledger")]
struct Args {
    /// PostgreSQL connection string. Runs against the in-memory backend when
    /// neither this nor --postgres is given.
    #[arg(long)]
    database_url: Option<String>,

    /// Connect to PostgreSQL using DB_DSN / POSTGRES_* environment variables
    #[arg(long)]
    postgres: bool,

    /// Number of accounts to seed
    #[arg(short, long, default_value = "4")]
    accounts: usize,

    /// Maximum transfers in flight
    #[arg(short, long, default_value = "8")]
    workers: usize,

    /// Number of transfers to submit
    #[arg(short, long, default_value = "100")]
    transfers: usize,

    /// Transfer amount (upper bound for the random scenario)
    #[arg(long, default_value = "10")]
    amount: i64,

    /// Initial balance of every seeded account
    #[arg(long, default_value = "100000")]
    initial_balance: i64,

    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "random")]
    scenario: Scenario,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Emit JSON logs and a JSON report
    #[arg(long)]
    json: bool,
}

async fn open_store(args: &Args) -> anyhow::Result<Arc<dyn Store>> {
    if args.database_url.is_none() && !args.postgres {
        info!("Using in-memory backend");
        return Ok(Arc::new(SqlStore::new(MemoryDatabase::new())));
    }

    let mut config = DatabaseConfig::from_env();
    if let Some(url) = &args.database_url {
        config.dsn = Some(url.clone());
    }
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let db = PgDatabase::connect(&config).await?;
    info!(max_connections = config.max_connections, "Using PostgreSQL backend");
    Ok(Arc::new(SqlStore::new(db)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(args.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.json).then(tracing_subscriber::fmt::layer))
        .init();

    if args.amount <= 0 {
        anyhow::bail!("--amount must be positive, got {}", args.amount);
    }

    info!(
        scenario = ?args.scenario,
        accounts = args.accounts,
        workers = args.workers,
        transfers = args.transfers,
        "Starting Simple Bank Simulator"
    );

    let store = open_store(&args).await?;

    let run_id = format!("sim_{}", uuid::Uuid::new_v4().simple());
    let accounts = AccountSeeder::new(store.as_ref(), run_id)
        .seed(args.accounts, args.initial_balance)
        .await?;

    let mut rng = match args.seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };
    let plan = args
        .scenario
        .plan(&accounts, args.transfers, args.amount, &mut rng)?;

    let controller = SimulationController::new(Arc::clone(&store), args.workers);
    let report = controller.execute(args.scenario, &accounts, plan).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let metrics = &report.metrics;
        info!("Simulation complete");
        info!("Total transfers: {}", metrics.total_transfers);
        info!("Successful: {}", metrics.successful_transfers);
        info!("Failed: {}", metrics.failed_transfers);
        info!("Unexpected outcomes: {}", metrics.unexpected_outcomes);
        info!(
            "Latency avg/p50/p99: {}/{}/{}us",
            metrics.average_latency_us, metrics.p50_latency_us, metrics.p99_latency_us
        );
        info!("Throughput: {:.1} transfers/s", metrics.throughput_per_sec);
        info!(
            "Total balance: {} -> {}",
            report.verification.total_before, report.verification.total_after
        );
    }

    if !report.verification.passed() || report.metrics.unexpected_outcomes > 0 {
        anyhow::bail!("Simulation detected ledger inconsistencies");
    }

    Ok(())
}
