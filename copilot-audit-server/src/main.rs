//! copilot-audit: operate the interaction audit pipeline
//!
//! # Subcommands
//! - `check`                connect, report the server version, verify the schema
//! - `provision`            create the audit tables if absent
//! - `ingest [--file F]`    feed NDJSON interaction records through the pipeline
//! - `sweep`                run one retention sweep now

use chrono::Utc;
use clap::{Parser, Subcommand};
use copilot_audit_core::{db, schema, AuditConfig, InteractionRecord, PipelineMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use copilot_audit_server::subsystems::retention::RetentionSweeper;
use copilot_audit_server::telemetry::init_tracing;
use copilot_audit_server::{AuditHandle, SubmitOutcome};

#[derive(Debug, Parser)]
#[command(name = "copilot-audit", version, about = "Interaction audit pipeline")]
struct Cli {
    #[arg(short, long, default_value = "copilot-audit.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Check connectivity and the audit schema
    Check,

    /// Create the audit tables and indexes if they do not exist
    Provision,

    /// Submit one interaction record per input line, then drain and exit
    Ingest {
        /// NDJSON file to read; stdin when omitted
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Delete interactions older than retention.days now
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = match AuditConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", cli.config, e);
            std::process::exit(1);
        }
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Check => check(&config).await,
        Commands::Provision => provision(&config).await,
        Commands::Ingest { file } => ingest(&config, file).await,
        Commands::Sweep => sweep(&config).await,
    }
}

async fn check(config: &AuditConfig) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database).await?;

    match db::health_check(&pool).await {
        Ok(v) => println!("✅ PostgreSQL connected ({}): {}", config.database.describe(), v),
        Err(e) => {
            println!("❌ PostgreSQL connection failed: {}", e);
            std::process::exit(1);
        }
    }

    match schema::verify_schema(&pool).await {
        Ok(tables) => {
            for table in tables {
                println!("✅ {}: {}", table.table, table.columns.join(", "));
            }
        }
        Err(e) => {
            println!("❌ {}", e);
            println!("   run `copilot-audit provision` to create the audit tables");
            std::process::exit(1);
        }
    }

    pool.close().await;
    println!("✅ Audit store ready");
    Ok(())
}

async fn provision(config: &AuditConfig) -> anyhow::Result<()> {
    let pool = db::create_pool(&config.database).await?;
    schema::provision_schema(&pool).await?;
    let tables = schema::verify_schema(&pool).await?;
    pool.close().await;
    println!("✅ Audit schema provisioned ({} tables)", tables.len());
    Ok(())
}

#[derive(Debug, Default)]
struct IngestSummary {
    lines: u64,
    malformed: u64,
    queued: u64,
    dropped: u64,
    disabled: u64,
}

async fn ingest(config: &AuditConfig, file: Option<PathBuf>) -> anyhow::Result<()> {
    let input: Box<dyn AsyncRead + Unpin + Send> = match &file {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    };
    let mut lines = BufReader::new(input).lines();

    let handle = AuditHandle::start(config).await;
    if !handle.is_enabled() {
        tracing::warn!("Audit pipeline is disabled, input will be read and discarded");
    }

    let mut summary = IngestSummary::default();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read input");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                summary.lines += 1;

                let record: InteractionRecord = match serde_json::from_str(&line) {
                    Ok(record) => record,
                    Err(e) => {
                        summary.malformed += 1;
                        tracing::warn!(line = summary.lines, error = %e, "Skipping malformed record");
                        continue;
                    }
                };

                match handle.submit(record) {
                    SubmitOutcome::Queued => summary.queued += 1,
                    SubmitOutcome::Dropped => summary.dropped += 1,
                    SubmitOutcome::Disabled => summary.disabled += 1,
                }
            }
        }
    }

    handle.shutdown().await;

    tracing::info!(
        lines = summary.lines,
        malformed = summary.malformed,
        queued = summary.queued,
        dropped = summary.dropped,
        disabled = summary.disabled,
        "Ingest finished"
    );
    if let Some(snapshot) = handle.metrics() {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

async fn sweep(config: &AuditConfig) -> anyhow::Result<()> {
    if config.retention.days == 0 {
        println!("Retention is unlimited (retention.days = 0), nothing to sweep");
        return Ok(());
    }

    let pool = db::create_pool(&config.database).await?;
    schema::verify_schema(&pool).await?;

    let sweeper = RetentionSweeper::new(
        pool.clone(),
        &config.retention,
        Arc::new(PipelineMetrics::new()),
    );
    let report = sweeper.sweep(Utc::now()).await?;
    pool.close().await;

    println!(
        "✅ Removed {} interactions ({} thoughts, {} tool calls, {} metrics)",
        report.interactions, report.thoughts, report.tool_calls, report.performance_metrics
    );
    Ok(())
}
