//! Ingest Service - Loads fuel transaction spreadsheets into Postgres
//!
//! Responsibilities:
//! - Read XLSX/XLS/ODS/CSV exports into raw rows
//! - Map headers onto canonical fields and coerce values
//! - Get-or-create departments and service stations by normalized name
//! - Insert transactions in chunks, isolating bad rows
//!
//! Re-running the same file never duplicates reference entities.
//! Fact rows are loaded at least once; a rerun inserts them again.

mod columns;
mod config;
mod convert;
mod enrich;
mod error;
mod loader;
mod normalize;
mod pipeline;
mod record;
mod resolver;
mod retry;
mod source;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::columns::AliasTable;
use crate::config::{parse_fields, Config};
use crate::pipeline::RunOptions;

#[derive(Parser, Debug)]
#[command(name = "ingest", about = "Loads fuel transaction spreadsheets into the database")]
struct Args {
    /// Spreadsheet to load (.xlsx, .xlsm, .xls, .xlsb, .ods or .csv)
    file: PathBuf,

    /// Worksheet name (default: first sheet)
    #[arg(long)]
    sheet: Option<String>,

    /// JSON file with extra header aliases: {"quantity": ["litres_dispensed"]}
    #[arg(long)]
    columns: Option<PathBuf>,

    /// Map and convert only - no database access
    #[arg(long, default_value = "false")]
    dry_run: bool,

    /// Rows per insert chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Connection attempts before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Pause between chunks in milliseconds
    #[arg(long)]
    chunk_pause_ms: Option<u64>,

    /// Comma separated canonical fields that must have a source column
    #[arg(long)]
    require: Option<String>,

    /// Print the run summary as JSON
    #[arg(long, default_value = "false")]
    summary_json: bool,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = Config::from_env().context("invalid configuration")?;
    if let Some(n) = args.chunk_size {
        config.load.chunk_size = n;
    }
    if let Some(n) = args.max_attempts {
        config.retry.max_attempts = n;
    }
    if let Some(ms) = args.chunk_pause_ms {
        config.load.pause = Duration::from_millis(ms);
    }
    if let Some(list) = &args.require {
        config.required = parse_fields(list).context("invalid --require")?;
    }
    config.validate().context("invalid command-line override")?;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = build_config(&args)?;

    let mut aliases = AliasTable::default();
    if let Some(path) = &args.columns {
        aliases.load_extra(path)?;
    }

    let options = RunOptions {
        path: args.file,
        sheet: args.sheet,
        aliases,
        dry_run: args.dry_run,
    };
    let summary = pipeline::run(&config, &options).await?;

    if args.summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{summary}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("ingest failed: {e:#}");
        return Err(e);
    }
    Ok(())
}
