//! Processing log inspection and configuration checks.
//!
//! The pipeline itself is embedded by the retrieval runner, which provides
//! the model-backed predictor and the input sources. This binary reports
//! what the pipeline has done so far.

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use retrieval_pipeline::logging::init_tracing;
use retrieval_pipeline::{PipelineConfig, ProcessingLog};

#[derive(Parser, Debug)]
#[command(name = "retrieval-pipeline")]
#[command(about = "Inspect the cloud retrieval processing log")]
struct Args {
    /// Processing log database
    #[arg(long, env = "PROCESSING_DATABASE", default_value = "ccic_processing.db")]
    database: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Count processed and pending files
    Summary,
    /// List files that were never processed successfully
    Failed,
    /// Show the entry and captured log of one input file
    Show {
        /// Input filename
        name: String,
    },
    /// Validate a pipeline configuration file and print the effective settings
    CheckConfig {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment from .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_tracing(&args.log_level, args.json, None)?;

    if let Command::CheckConfig { path } = &args.command {
        let config = PipelineConfig::load(path)?;
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    if !args.database.exists() {
        bail!("processing log not found: {}", args.database.display());
    }
    let log = ProcessingLog::open(&args.database).await?;
    info!(database = %args.database.display(), "Opened processing log");

    match args.command {
        Command::Summary => {
            let stats = log.stats().await?;
            println!("total:     {}", stats.total);
            println!("succeeded: {}", stats.succeeded);
            println!("pending:   {}", stats.pending);
        }
        Command::Failed => {
            for entry in log.failed().await? {
                println!("{}\t{}", entry.input_date.format("%Y-%m-%d %H:%M"), entry.name);
            }
        }
        Command::Show { name } => {
            let Some(entry) = log.entry(&name).await? else {
                bail!("no processing log entry for '{name}'");
            };
            let stat = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
            println!("name:      {}", entry.name);
            println!("input:     {}", entry.input_date.to_rfc3339());
            println!("created:   {}", entry.date.to_rfc3339());
            println!("state:     {:?}", entry.state());
            println!("output:    {}", entry.output_file);
            println!("min:       {}", stat(entry.stat_min));
            println!("max:       {}", stat(entry.stat_max));
            println!("mean:      {}", stat(entry.stat_mean));
            println!("n_missing: {}", entry.n_missing);
            println!();
            print!("{}", entry.log);
        }
        Command::CheckConfig { .. } => {}
    }

    Ok(())
}
