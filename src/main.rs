use ocde_bronze::config::{FailurePolicy, IngestConfig, IngestFileConfig};
use ocde_bronze::dataset::DatasetId;
use ocde_bronze::driver::{BronzeDriver, DatasetOutcome, RunReport};
use ocde_bronze::ingestion::LocalEngine;
use ocde_bronze::paths::PathPlan;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ocde-bronze")]
#[command(about = "Incremental ingestion of OCDE GDP datasets into the bronze layer")]
#[command(version)]
struct Args {
    /// JSON config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Root location for landing and bronze paths
    #[arg(long, global = true, env = "OCDE_BASE_PATH")]
    base_path: Option<String>,

    /// Storage account name
    #[arg(long, global = true, env = "OCDE_STORAGE_ACCOUNT")]
    storage_account: Option<String>,

    /// Storage account key
    #[arg(long, global = true, env = "OCDE_STORAGE_KEY", hide_env_values = true)]
    storage_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every configured dataset once
    Run {
        /// Keep going after a dataset fails and report all failures at the end
        #[arg(long)]
        continue_on_error: bool,

        /// Only ingest these datasets (repeatable)
        #[arg(short, long = "dataset")]
        datasets: Vec<String>,

        /// Rows to display per dataset after the write
        #[arg(long)]
        rows: Option<usize>,
    },
    /// Print the derived paths of every dataset
    Paths,
    /// Show the bronze table of a dataset
    Show {
        dataset: String,

        /// Table version to read (time travel)
        #[arg(long)]
        version: Option<u64>,

        #[arg(long)]
        rows: Option<usize>,
    },
    /// Print the normalized schema of a dataset
    Schema { dataset: String },
    /// Print the commit history of a dataset's bronze table
    History { dataset: String },
    /// Delete everything under the base path
    Purge {
        /// Must repeat the base path exactly
        #[arg(long)]
        confirm: String,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let file = match &args.config {
        Some(path) => IngestFileConfig::load(path)?,
        None => IngestFileConfig::default(),
    };
    let failure_policy = match &args.command {
        Commands::Run {
            continue_on_error: true,
            ..
        } => Some(FailurePolicy::ContinueOnError),
        _ => None,
    };
    let mut config = IngestConfig::resolve(
        file,
        args.base_path,
        args.storage_account,
        args.storage_key,
        failure_policy,
    )
    .context("Failed to resolve configuration")?;

    if let Commands::Run { datasets, rows, .. } = &args.command {
        if !datasets.is_empty() {
            let selected = datasets
                .iter()
                .map(DatasetId::parse)
                .collect::<ocde_bronze::Result<Vec<_>>>()?;
            config = config.with_datasets(selected);
        }
        if let Some(rows) = rows {
            config = config.with_display_rows(*rows);
        }
    }
    if let Commands::Show { rows: Some(rows), .. } = &args.command {
        config = config.with_display_rows(*rows);
    }

    if let Commands::Paths = args.command {
        print_paths(&config);
        return Ok(());
    }

    let engine = LocalEngine::connect(&config.storage).context("Failed to connect to storage")?;
    let driver = BronzeDriver::new(engine, config);

    match args.command {
        Commands::Run { .. } => {
            let report = driver.run_with(print_outcome)?;
            print_failures(&report);
            if !report.is_success() {
                report.into_result()?;
            }
            Ok(())
        }
        Commands::Paths => Ok(()),
        Commands::Show { dataset, version, .. } => {
            let dataset = DatasetId::parse(dataset)?;
            let frame = driver.read_back(&dataset, version)?;
            println!("{}", driver.preview(frame)?);
            Ok(())
        }
        Commands::Schema { dataset } => {
            let dataset = DatasetId::parse(dataset)?;
            print!("{}", driver.describe_schema(&dataset)?);
            Ok(())
        }
        Commands::History { dataset } => {
            let dataset = DatasetId::parse(dataset)?;
            for commit in driver.history(&dataset)? {
                let txn = commit
                    .txn
                    .map(|t| format!("batch {} of {}", t.batch_id, t.query_id))
                    .unwrap_or_default();
                println!(
                    "{:>4}  {}  {}  {} rows  {}",
                    commit.version,
                    commit.timestamp.to_rfc3339(),
                    commit.operation,
                    commit.num_rows(),
                    txn
                );
            }
            Ok(())
        }
        Commands::Purge { confirm } => {
            driver.purge(&confirm)?;
            info!("Purge complete");
            Ok(())
        }
    }
}

fn print_paths(config: &IngestConfig) {
    let plan = PathPlan::new(&config.storage.base_path, &config.datasets);
    for (dataset, paths) in plan.iter() {
        println!("{}", dataset);
        println!("  landing:    {}", paths.landing);
        println!("  bronze:     {}", paths.bronze);
        println!("  checkpoint: {}", paths.checkpoint);
        println!("  schema:     {}", paths.schema);
    }
}

fn print_outcome(outcome: &DatasetOutcome) {
    println!("\n{}", "=".repeat(80));
    println!(" {}", outcome.dataset);
    println!("{}", "=".repeat(80));
    match outcome.commit.batch_id {
        Some(batch_id) => println!(
            " batch {}: {} rows from {} files{}",
            batch_id,
            outcome.commit.rows_written,
            outcome.commit.files.len(),
            if outcome.commit.recovered { " (recovered)" } else { "" }
        ),
        None => println!(" no new files"),
    }
    println!(" table: {} rows, columns {:?}", outcome.table_rows, outcome.columns);
    println!("{}", outcome.preview);
}

fn print_failures(report: &RunReport) {
    for failure in &report.failed {
        error!(
            "{} failed (landing: {}): {}",
            failure.dataset, failure.paths.landing, failure.error
        );
    }
}
