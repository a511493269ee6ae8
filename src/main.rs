//! Yield Keeper - Main Entry Point
//!
//! Runs the rebalancing pipeline on a schedule, once, or prints the
//! transaction history.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use yield_keeper::chain::{ChainGateway, EthersGateway, MockVault};
use yield_keeper::config::Config;
use yield_keeper::keeper::{PipelineRunner, RebalancePipeline, RunOutcome, Scheduler};
use yield_keeper::persistence::{TransactionStore, TxStatus};
use yield_keeper::prediction::PredictionClient;

/// Yield Keeper CLI
#[derive(Parser)]
#[command(name = "yield-keeper")]
#[command(version, about = "Keeper bot for multi-strategy yield vault rebalancing")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the keeper on its rebalance interval (default)
    Run {
        /// Use the simulated vault instead of the chain
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a single pipeline pass and exit
    Once {
        /// Use the simulated vault instead of the chain
        #[arg(long)]
        dry_run: bool,
    },

    /// Show recorded rebalance transactions
    History {
        /// Path to the history database (defaults to the configured one)
        #[arg(long)]
        db: Option<String>,

        /// Number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Read the dry-run history instead
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    match cli.command {
        Some(Commands::History { db, limit, dry_run }) => {
            let config = Config::load()?;
            let db_path = db.unwrap_or_else(|| history_path(&config, dry_run).display().to_string());
            show_history(&db_path, limit)
        }
        Some(Commands::Once { dry_run }) => run_keeper(dry_run, true).await,
        Some(Commands::Run { dry_run }) => run_keeper(dry_run, false).await,
        None => run_keeper(false, false).await,
    }
}

async fn run_keeper(dry_run_flag: bool, once: bool) -> Result<()> {
    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║              Yield Keeper v{}                            ║",
        env!("CARGO_PKG_VERSION")
    );
    info!("╚════════════════════════════════════════════════════════════╝");

    let mut config = Config::load()?;
    config.keeper.dry_run |= dry_run_flag;
    config.validate()?;
    log_config(&config);

    let dry_run = config.keeper.dry_run;
    let gateway: Arc<dyn ChainGateway> = if dry_run {
        info!("📝 DRY RUN - rebalances go to a simulated vault");
        Arc::new(MockVault::demo())
    } else {
        warn!("⚠️  LIVE MODE - rebalances move vault funds");
        Arc::new(EthersGateway::new(&config.chain)?)
    };

    let db_path = history_path(&config, dry_run);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let history = Arc::new(TransactionStore::new(&db_path)?);

    let predictor = Arc::new(PredictionClient::new(&config.prediction)?);
    match predictor.health().await {
        Ok(()) => info!(endpoint = %config.prediction.endpoint, "✅ [INIT] Prediction service reachable"),
        Err(e) => warn!(error = %e, "⚠️  [INIT] Prediction service health check failed"),
    }

    let interval = config.keeper.rebalance_interval();
    let pipeline = Arc::new(RebalancePipeline::new(config, gateway, predictor, history)?);

    match pipeline.executor().reconcile().await {
        Ok(0) => {}
        Ok(resolved) => info!(resolved, "📂 [HISTORY] Resolved transactions from previous run"),
        Err(e) => warn!(error = %e, "📂 [HISTORY] Reconciliation failed"),
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("🛑 Shutdown signal received");
            shutdown.cancel();
        }
    });

    if once {
        match pipeline.run(shutdown.child_token()).await {
            Ok(RunOutcome::Skipped { run_id, max_deviation }) => {
                info!(%run_id, max_deviation, "🏁 No rebalance needed");
            }
            Ok(RunOutcome::Rebalanced(record)) => {
                info!(run_id = %record.run_id, hash = %record.hash, "🏁 Rebalance confirmed");
            }
            Err(e) => {
                error!(kind = e.kind(), error = %e, "❌ Run failed");
                return Err(e.into());
            }
        }
        return Ok(());
    }

    info!("🚀 Starting scheduler...");
    let scheduler = Scheduler::new(pipeline, interval);
    scheduler.run(shutdown).await;

    let stats = scheduler.stats().snapshot();
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("🏁 Final Statistics:");
    info!("   Runs started:    {}", stats.runs_started);
    info!("   Rebalanced:      {}", stats.runs_rebalanced);
    info!("   Skipped:         {}", stats.runs_skipped);
    info!("   Failed:          {}", stats.runs_failed);
    info!("   Ticks dropped:   {}", stats.ticks_dropped);
    info!("👋 Yield Keeper shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.ok();
}

/// Dry runs keep their own history so simulated hashes never reach
/// live reconciliation.
fn history_path(config: &Config, dry_run: bool) -> PathBuf {
    let path = PathBuf::from(&config.persistence.db_path);
    if dry_run {
        path.with_extension("dry-run.db")
    } else {
        path
    }
}

/// Initialize logging to stdout and an hourly rolling file.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "keeper.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("yield_keeper=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!(
        "   Rebalance Interval: {}s",
        config.keeper.rebalance_interval_secs
    );
    info!(
        "   Deviation Threshold: {:.1}%",
        config.keeper.deviation_threshold * 100.0
    );
    info!(
        "   Allocation Bounds: {:.0}% - {:.0}%",
        config.solver.min_allocation * 100.0,
        config.solver.max_allocation * 100.0
    );
    info!(
        "   Confirmation Timeout: {}s",
        config.execution.confirmation_timeout_secs
    );
    info!(
        "   Submit Attempts: {}",
        config.execution.max_submit_attempts
    );
    info!("   Prediction Service: {}", config.prediction.endpoint);
    info!(
        "   Chain: {} (id {})",
        config.chain.rpc_url, config.chain.chain_id
    );
}

/// Print recent rebalance transactions.
fn show_history(db_path: &str, limit: usize) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              REBALANCE HISTORY                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   The keeper has not submitted anything yet, or the path is incorrect.");
        return Ok(());
    }

    let store = TransactionStore::new(db_path)?;
    let records = store.recent(limit)?;
    if records.is_empty() {
        println!("\n❌ No transactions recorded.");
        return Ok(());
    }

    let unresolved = store.unresolved()?;
    println!("\n📊 Summary");
    println!("   ├─ Records:     {}", store.count()?);
    println!("   └─ Unresolved:  {}", unresolved.len());

    println!("\n🧾 Recent Records");
    for record in &records {
        let icon = match record.status {
            TxStatus::Pending => "⏳",
            TxStatus::Confirmed => "✅",
            TxStatus::Reverted => "❌",
            TxStatus::TimedOut => "⌛",
            TxStatus::Dropped => "🚫",
        };
        println!("   ┌─ {} {} ({})", icon, record.hash, record.status);
        println!("   ├─ Run:       {}", record.run_id);
        println!("   ├─ Nonce:     {}", record.nonce);
        println!("   ├─ Gas Price: {} wei", record.gas_price);
        if let Some(gas_used) = record.gas_used {
            println!("   ├─ Gas Used:  {}", gas_used);
        }
        if let Some(block) = record.block_number {
            println!("   ├─ Block:     {}", block);
        }
        println!(
            "   └─ Submitted: {}",
            record.submitted_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }

    println!();
    Ok(())
}
