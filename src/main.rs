//! CastAlgo governance operator binary
//!
//! Runs the window scheduler and exposes the engine's entry points as
//! subcommands against the configured SQLite store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use castalgo_governance::broadcaster::{self, Broadcaster};
use castalgo_governance::clock::SystemClock;
use castalgo_governance::models::Market;
use castalgo_governance::store::{SqliteStore, Store};
use castalgo_governance::{GovernanceConfig, GovernanceEngine, WindowScheduler};

#[derive(Parser, Debug)]
#[command(name = "castalgo-governance")]
#[command(about = "Resolution governance for CastAlgo prediction markets")]
struct Args {
    /// SQLite database
    #[arg(long, env = "GOVERNANCE_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the window scheduler until Ctrl-C
    Run,

    /// Register a market so it can be resolved
    RegisterMarket {
        #[arg(long)]
        id: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        app_id: Option<u64>,
    },

    /// Create a multisig proposal (the proposer signs it)
    Propose {
        #[arg(long)]
        market: String,
        #[arg(long)]
        outcome: u8,
        #[arg(long)]
        evidence: String,
        #[arg(long)]
        admin: String,
    },

    /// Sign a multisig proposal
    Sign {
        #[arg(long)]
        proposal: String,
        #[arg(long)]
        admin: String,
    },

    /// Propose an optimistic resolution and open its dispute window
    ProposeUma {
        #[arg(long)]
        market: String,
        #[arg(long)]
        outcome: u8,
        #[arg(long)]
        evidence: String,
        #[arg(long)]
        admin: String,
    },

    /// Dispute a market's proposed outcome
    Dispute {
        #[arg(long)]
        market: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        reason: String,
    },

    /// Cast a committee vote on a disputed resolution
    Vote {
        #[arg(long)]
        resolution: String,
        #[arg(long)]
        admin: String,
        #[arg(long)]
        vote: u8,
    },

    /// Print market, lock state and open windows
    Status {
        #[arg(long)]
        market: String,
    },

    /// List multisig proposals waiting for signatures
    Pending,

    /// Run one scheduler sweep
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();

    let mut config = GovernanceConfig::from_env().context("invalid governance configuration")?;
    if let Some(db) = args.db {
        config.database_path = db;
    }

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::new(&config.database_path)
            .with_context(|| format!("Failed to open database: {}", config.database_path))?,
    );
    let broadcaster: Arc<dyn Broadcaster> = Arc::from(broadcaster::from_config(&config)?);
    let engine = GovernanceEngine::new(config, store, broadcaster, Arc::new(SystemClock));

    match args.command {
        Commands::Run => run_scheduler(engine).await?,
        Commands::RegisterMarket {
            id,
            question,
            app_id,
        } => {
            let mut market = Market::new(id, question);
            market.app_id = app_id;
            engine.store().upsert_market(&market).await?;
            print_json(&market)?;
        }
        Commands::Propose {
            market,
            outcome,
            evidence,
            admin,
        } => print_json(
            &engine
                .propose_resolution(&market, outcome, &evidence, &admin)
                .await?,
        )?,
        Commands::Sign { proposal, admin } => {
            print_json(&engine.sign_resolution(&proposal, &admin).await?)?
        }
        Commands::ProposeUma {
            market,
            outcome,
            evidence,
            admin,
        } => print_json(
            &engine
                .propose_uma_resolution(&market, outcome, &evidence, &admin)
                .await?,
        )?,
        Commands::Dispute {
            market,
            user,
            reason,
        } => print_json(&engine.raise_dispute(&market, &user, &reason).await?)?,
        Commands::Vote {
            resolution,
            admin,
            vote,
        } => print_json(&engine.cast_uma_vote(&resolution, &admin, vote).await?)?,
        Commands::Status { market } => print_status(&engine, &market).await?,
        Commands::Pending => print_json(&engine.get_pending_proposals().await?)?,
        Commands::Sweep => {
            let report = WindowScheduler::from_engine(engine).tick().await;
            print_json(&report)?;
        }
    }

    Ok(())
}

async fn run_scheduler(engine: GovernanceEngine) -> Result<()> {
    info!(
        db = %engine.config().database_path,
        threshold = engine.config().signature_threshold,
        committee_size = engine.config().committee_size,
        "🚀 Governance engine starting"
    );

    let handle = WindowScheduler::from_engine(engine).start();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutdown requested");
    handle.stop().await
}

async fn print_status(engine: &GovernanceEngine, market_id: &str) -> Result<()> {
    let market = engine.store().get_market(market_id).await?;
    let locked = engine.is_market_locked(market_id).await?;
    let active = engine.active_resolution(market_id).await?;
    let latest_uma = engine.get_uma_resolution(market_id).await?;
    let dispute_remaining = engine.get_dispute_time_remaining(market_id).await?;
    let voting_remaining = engine.get_voting_time_remaining(market_id).await?;

    print_json(&json!({
        "market": market,
        "locked": locked,
        "active_resolution": active,
        "latest_uma_resolution": latest_uma,
        "dispute_secs_remaining": dispute_remaining.map(|d| d.as_secs()),
        "voting_secs_remaining": voting_remaining.map(|d| d.as_secs()),
    }))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castalgo_governance=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    let _ = dotenv();

    // Also pick up the crate's own .env when launched from elsewhere.
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
