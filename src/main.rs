//! channel-lake binary entrypoint.
//! Ingests configured channels into the lake, runs the stage pipeline, and
//! reports per-day readiness.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use channel_lake::config::{check_delay, Config};
use channel_lake::ingest::{self, providers};
use channel_lake::lake::{day_key, DataLakeWriter};
use channel_lake::metrics::Metrics;
use channel_lake::pipeline::Pipeline;
use channel_lake::{enrich, logging};

/// Exit code of `status` when the day is not ready for downstream stages.
const EXIT_NOT_READY: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "channel-lake", version, about = "Channel ingestion and pipeline runner")]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, env = "CHANNEL_LAKE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the lake root from the config; passed on to `@self` stages
    #[arg(long, global = true, env = "CHANNEL_LAKE_ROOT")]
    lake_root: Option<PathBuf>,

    /// Write Prometheus exposition text here on exit
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scrape every configured source into the lake and write the day's manifest
    Ingest(IngestArgs),

    /// Run the stage pipeline in dependency order, stopping at the first failure
    Run {
        /// Run only these stages (plus whatever they depend on)
        #[arg(long = "only")]
        only: Vec<String>,
    },

    /// Show manifest completeness for a day; exits 2 when not ready
    Status {
        #[arg(long)]
        day: Option<NaiveDate>,
    },

    /// Print the stage execution order
    Plan,

    /// Summarize an enrichment result table
    Detections {
        /// Detection CSV written by the enrich stage
        file: PathBuf,
    },
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Partition day (defaults to today, local time)
    #[arg(long)]
    day: Option<NaiveDate>,

    /// Max messages per source
    #[arg(long)]
    limit: Option<usize>,

    /// Seconds to wait after each message
    #[arg(long)]
    message_delay: Option<f64>,

    /// Seconds to wait between sources
    #[arg(long)]
    channel_delay: Option<f64>,

    /// Throttle retries per source before giving up on it
    #[arg(long)]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "channel-lake failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = match &cli.config {
        Some(p) => Config::from_path(p)?,
        None => Config::load_default()?,
    };
    if let Some(root) = &cli.lake_root {
        config.lake_root = root.clone();
    }

    let _log_guard = logging::init(cli.verbose, Some(&config.lake_layout().logs_dir()))?;
    let metrics = Metrics::init()?;

    let code = match cli.command {
        Command::Ingest(args) => cmd_ingest(config, args).await?,
        Command::Run { only } => cmd_run(&config, &only).await?,
        Command::Status { day } => cmd_status(&config, day)?,
        Command::Plan => cmd_plan(&config)?,
        Command::Detections { file } => cmd_detections(&file)?,
    };

    if let Some(path) = &cli.metrics_out {
        metrics.write_to(path)?;
    }
    Ok(code)
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

async fn cmd_ingest(mut config: Config, args: IngestArgs) -> Result<ExitCode> {
    if let Some(limit) = args.limit {
        config.ingest.limit = limit;
    }
    if let Some(d) = args.message_delay {
        check_delay("--message-delay", d)?;
        config.ingest.message_delay_secs = d;
    }
    if let Some(d) = args.channel_delay {
        check_delay("--channel-delay", d)?;
        config.ingest.channel_delay_secs = d;
    }
    if let Some(r) = args.max_retries {
        config.ingest.max_retries = r;
    }
    if config.ingest.sources.is_empty() {
        tracing::warn!("no sources configured; the manifest will be empty");
    }

    let day = args.day.unwrap_or_else(today);
    let source = providers::from_config(&config.upstream)?;
    let writer = DataLakeWriter::new(config.lake_layout());
    let settings = config.ingest_settings();

    let summary = ingest::run_once(source.as_ref(), &writer, &settings, day)
        .await
        .context("ingestion run failed; no manifest written")?;

    println!("ingested {} messages for {}", summary.total(), day_key(day));
    for (source_id, count) in &summary.counts {
        let state = if summary.aborted.contains(source_id) {
            "ABORTED"
        } else {
            "ok"
        };
        println!("  {source_id:<24} {count:>6}  {state}");
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(config: &Config, only: &[String]) -> Result<ExitCode> {
    let self_exe = std::env::current_exe().context("locating own executable")?;
    let mut pipeline = Pipeline::from_config(
        &config.stages,
        &self_exe,
        config.source_path.as_deref(),
        Some(&config.lake_root),
    )?;
    if !only.is_empty() {
        pipeline = pipeline.only(only)?;
    }

    let report = pipeline.run().await?;
    for s in &report.stages {
        println!("  {:<12} ok  {:>8} ms", s.name, s.duration.as_millis());
    }
    println!("pipeline finished: {} stages", report.stages.len());
    Ok(ExitCode::SUCCESS)
}

fn cmd_status(config: &Config, day: Option<NaiveDate>) -> Result<ExitCode> {
    let day = day.unwrap_or_else(today);
    let layout = config.lake_layout();
    let writer = DataLakeWriter::new(layout.clone());
    let configured = &config.ingest.sources;

    let images = enrich::list_images(&layout)?.len();
    let Some(manifest) = writer.read_manifest(day)? else {
        println!("{}: NOT READY (no manifest)", day_key(day));
        println!("  images in lake: {images}");
        return Ok(ExitCode::from(EXIT_NOT_READY));
    };

    for source_id in configured {
        match manifest.get(source_id) {
            Some(n) => println!("  {source_id:<24} {n:>6}"),
            None => println!("  {source_id:<24}  MISSING"),
        }
    }
    println!("  images in lake: {images}");

    if manifest.is_complete(configured) {
        println!("{}: READY ({} messages)", day_key(day), manifest.total());
        Ok(ExitCode::SUCCESS)
    } else {
        let missing = manifest.missing(configured);
        println!("{}: NOT READY (missing: {})", day_key(day), missing.join(", "));
        Ok(ExitCode::from(EXIT_NOT_READY))
    }
}

fn cmd_plan(config: &Config) -> Result<ExitCode> {
    let self_exe = std::env::current_exe().context("locating own executable")?;
    let pipeline = Pipeline::from_config(
        &config.stages,
        &self_exe,
        config.source_path.as_deref(),
        Some(&config.lake_root),
    )?;
    for (i, name) in pipeline.order().into_iter().enumerate() {
        let deps = pipeline
            .stage(name)
            .map(|s| s.depends_on().join(", "))
            .unwrap_or_default();
        if deps.is_empty() {
            println!("{}. {name}", i + 1);
        } else {
            println!("{}. {name}  (after {deps})", i + 1);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_detections(file: &std::path::Path) -> Result<ExitCode> {
    let rows = enrich::read_detections(file)?;
    println!("{} detections in {}", rows.len(), file.display());
    for (category, n) in enrich::category_counts(&rows) {
        println!("  {:<16} {n:>6}", category.as_str());
    }
    Ok(ExitCode::SUCCESS)
}
