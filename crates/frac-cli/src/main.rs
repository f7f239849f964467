use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use frac_core::ConflictMode;
use frac_storage::hf_size;
use frac_sync::{RunOptions, RunSummary, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "frac-cli")]
#[command(about = "FracFocus registry ingest command-line interface")]
struct Cli {
    /// Log line format written to stderr.
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OnConflict {
    Update,
    Ignore,
}

impl From<OnConflict> for ConflictMode {
    fn from(value: OnConflict) -> Self {
        match value {
            OnConflict::Update => ConflictMode::UpdateOnConflict,
            OnConflict::Ignore => ConflictMode::IgnoreOnConflict,
        }
    }
}

#[derive(Debug, Clone, Default, Args)]
struct RunArgs {
    /// Ingest what is already in the staging directory instead of downloading.
    #[arg(long)]
    offline: bool,
    /// Write to an in-memory store instead of Postgres.
    #[arg(long)]
    dry_run: bool,
    /// Conflict mode for this run; defaults to the collector config.
    #[arg(long, value_enum)]
    on_conflict: Option<OnConflict>,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            offline: self.offline,
            conflict_mode: self.on_conflict.map(Into::into),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, stage and ingest the archive once.
    Sync(RunArgs),
    /// Show staged files grouped by dataset, newest first.
    Files {
        #[arg(long)]
        offline: bool,
    },
    /// Print the first records of a staged file as they would be written.
    Inspect {
        file: PathBuf,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        /// Skip type coercion.
        #[arg(long)]
        raw: bool,
    },
    Migrate,
    /// Run the ingest on FRAC_SYNC_CRON until ctrl-c.
    Schedule(RunArgs),
}

fn init_logging(format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    }
    .context("installing tracing subscriber")
}

fn print_summary(summary: &RunSummary) {
    if let Some(archive) = &summary.archive {
        println!(
            "archive: {} ({}) sha256={}",
            archive.url,
            hf_size(archive.bytes),
            archive.sha256
        );
    }
    for file in &summary.files {
        println!(
            "{:<28} {:?} read={} transformed={} skipped={} committed={} batches={}",
            file.file,
            file.state,
            file.records_read,
            file.transformed,
            file.skipped,
            file.committed,
            file.batches_committed
        );
    }
    println!(
        "sync complete: run_id={} store={} processed={} failed={} reports={}",
        summary.run_id, summary.store, summary.files_processed, summary.files_failed, summary.reports_dir
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;

    match cli.command.unwrap_or(Commands::Sync(RunArgs::default())) {
        Commands::Sync(args) => {
            let summary = frac_sync::run_sync_once_from_env(args.options(), args.dry_run).await?;
            print_summary(&summary);
            if summary.files_failed > 0 {
                bail!("{} file(s) failed to ingest", summary.files_failed);
            }
        }
        Commands::Files { offline } => {
            let pipeline = frac_sync::pipeline_from_env(true).await?;
            for (group, files) in pipeline.list_files(offline).await? {
                let dataset = pipeline
                    .config()
                    .dataset_for_group(&group)
                    .map(|d| d.name.as_str())
                    .unwrap_or("-");
                println!("{group} (dataset: {dataset})");
                for file in files {
                    println!("  {:>6}  {}", file.sequence_key, file.path.display());
                }
            }
        }
        Commands::Inspect { file, limit, raw } => {
            let config = frac_sync::load_config(&SyncConfig::from_env())?;
            for record in config.inspect_file(&file, limit, !raw)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::Migrate => {
            frac_sync::migrate_from_env().await?;
            println!("migrations applied");
        }
        Commands::Schedule(args) => {
            let pipeline = Arc::new(frac_sync::pipeline_from_env(args.dry_run).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler(args.options()).await? else {
                bail!("scheduler disabled; set FRAC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
