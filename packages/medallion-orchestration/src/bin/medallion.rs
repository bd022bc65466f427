//! medallion - run the bronze / silver / gold pipeline for one dataset
//!
//! `medallion` with no subcommand is `medallion run`. The process exit code
//! tells which stage failed (see `PipelineError::exit_code`).

use anyhow::Context;
use clap::Parser;
use medallion_orchestration::logging::init_logging;
use medallion_orchestration::reports::run_report_dir;
use medallion_orchestration::stages::gold::{CHURN_SUMMARY, EXECUTIVE_SUMMARY, REVENUE_ANALYSIS};
use medallion_orchestration::{
    source_from_config, write_run_reports, BusinessInsights, ConfigError, FsRawStore,
    PipelineConfig, PipelineError, PipelineOrchestrator,
};
use medallion_storage::{RunLedger, SqliteStore, Warehouse};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Medallion: bronze / silver / gold batch pipeline
#[derive(Parser, Debug)]
#[command(name = "medallion", version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to $MEDALLION_CONFIG, then ./medallion.yaml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once (default)
    Run,
    /// Show recent run records
    History {
        /// Number of runs to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Summarize the current gold models
    Insights,
    /// Force-release a stale run lock
    Unlock,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run_cli(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_code_of(&e)
        }
    };
    std::process::exit(code);
}

fn exit_code_of(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<PipelineError>() {
        e.exit_code()
    } else if err.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    }
}

/// Everything that holds the log guard; it is dropped (and flushed) before exit
async fn run_cli(cli: Cli) -> anyhow::Result<i32> {
    let config = PipelineConfig::load(cli.config.as_deref())?;

    let _guard =
        init_logging(cli.verbose, Some(&config.log_dir)).context("Failed to set up logging")?;

    let store = Arc::new(open_store(&config.warehouse_path)?);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_pipeline(config, store).await,
        Commands::History { limit } => show_history(store.as_ref(), limit).await,
        Commands::Insights => show_insights(store.as_ref()).await,
        Commands::Unlock => unlock(store.as_ref()).await,
        Commands::Config => {
            print!("{}", config.to_yaml()?);
            Ok(0)
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteStore, PipelineError> {
    if path == Path::new(":memory:") {
        return Ok(SqliteStore::in_memory()?);
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteStore::open(path)?)
}

async fn run_pipeline(config: PipelineConfig, store: Arc<SqliteStore>) -> anyhow::Result<i32> {
    let source = source_from_config(&config.source, config.fetch_timeout())?;
    let raw_store = Arc::new(FsRawStore::new(config.landing_dir.clone()));
    let report_dir = config.report_dir.clone();

    let orchestrator = PipelineOrchestrator::new(config, source, raw_store, store.clone(), store)?;
    let outcome = orchestrator.run().await?;

    for stage in &outcome.record.stages {
        info!(
            "  {:<18} {:<8} {:>6} -> {:<6} {:>6}ms",
            stage.stage,
            stage.status.as_str(),
            stage.rows_in,
            stage.rows_out,
            stage.duration_ms()
        );
    }

    match write_run_reports(&report_dir, &outcome).await {
        Ok(files) if !files.is_empty() => info!(
            "Wrote {} report files to {}",
            files.len(),
            run_report_dir(&report_dir, &outcome.record.dataset_id, outcome.record.run_id)
                .display()
        ),
        Ok(_) => {}
        Err(e) => warn!("Could not write run reports: {}", e),
    }

    match &outcome.error {
        Some(e) => error!("Run {} failed: {}", outcome.record.run_id, e),
        None => info!(
            "Run {} {}",
            outcome.record.run_id,
            if outcome.was_skipped() {
                "skipped (source unchanged)"
            } else {
                "complete"
            }
        ),
    }
    Ok(outcome.exit_code())
}

async fn show_history(ledger: &dyn RunLedger, limit: usize) -> anyhow::Result<i32> {
    let runs = ledger.recent_runs(limit).await?;
    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(0);
    }

    for run in runs {
        println!(
            "{}  {}  {:<8} {}",
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            run.run_id,
            run.status.as_str(),
            match (&run.failed_stage, &run.error) {
                (Some(stage), Some(error)) => format!("{}: {}", stage, error),
                _ => format!("{} stages", run.stages.len()),
            }
        );
    }
    Ok(0)
}

async fn show_insights(warehouse: &dyn Warehouse) -> anyhow::Result<i32> {
    let mut tables = Vec::new();
    for name in [EXECUTIVE_SUMMARY, CHURN_SUMMARY, REVENUE_ANALYSIS] {
        match warehouse.load_model(name).await {
            Ok(table) => tables.push(table),
            Err(e) if e.kind.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    let Some(insights) = BusinessInsights::from_tables(&tables) else {
        println!("No models built yet");
        return Ok(0);
    };

    println!(
        "Customers:        {} ({:.2}% churn)",
        insights.total_customers, insights.overall_churn_rate
    );
    println!("Monthly revenue:  {:.2}", insights.total_monthly_revenue);
    println!(
        "At risk:          {:.2}/month ({:.2}%), {:.2}/year",
        insights.at_risk_revenue, insights.at_risk_percent, insights.annual_revenue_impact
    );
    if let Some(focus) = &insights.priority_segment {
        println!(
            "Priority segment: {} ({:.2}% churn)",
            focus.segment, focus.churn_rate_percent
        );
    }
    if let Some(top) = &insights.top_contract {
        println!(
            "Top contract:     {} ({:.2}/month)",
            top.contract_type, top.total_monthly_revenue
        );
    }
    Ok(0)
}

async fn unlock(ledger: &dyn RunLedger) -> anyhow::Result<i32> {
    match ledger.force_release_lock().await? {
        Some(lock) => println!(
            "Released lock held by run {} since {}",
            lock.run_id, lock.acquired_at
        ),
        None => println!("No run lock held"),
    }
    Ok(0)
}
