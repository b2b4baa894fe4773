use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ratiowatch_core::IngestionSession;
use ratiowatch_storage::{SessionTracker, Store};
use ratiowatch_sync::{export_history, run_scheduled, IngestPipeline, SourceReport, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "ratiowatch")]
#[command(about = "Admission competition-ratio collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create or migrate the database and register configured sources and labels.
    Init,
    /// Run one ingest pass.
    Run {
        /// Only ingest this source code.
        #[arg(long)]
        source: Option<String>,
    },
    /// Run a pass now and then every N minutes until Ctrl-C.
    Schedule {
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Write measurement history and sessions as parquet.
    Export {
        #[arg(long)]
        out: PathBuf,
    },
    /// List recent ingestion sessions.
    Sessions {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { source: None }) {
        Commands::Init => {
            let pipeline = IngestPipeline::from_config(&config).await?;
            let counts = pipeline.store().entity_counts().await?;
            println!(
                "initialized {}: sources={} labels={} measurements={} sessions={}",
                config.database_url, counts.sources, counts.labels, counts.measurements, counts.sessions
            );
        }
        Commands::Run { source } => {
            let pipeline = IngestPipeline::from_config(&config).await?;
            match source {
                Some(code) => print_report(&pipeline.run_source(&code).await?),
                None => {
                    let summary = pipeline.run_once().await?;
                    for report in &summary.sources {
                        print_report(report);
                    }
                    println!(
                        "pass {} complete: sources={} saved={} failed_sources={}",
                        summary.run_id,
                        summary.sources.len(),
                        summary.saved(),
                        summary.failed_sources()
                    );
                }
            }
        }
        Commands::Schedule { interval } => {
            let minutes = interval.unwrap_or(config.interval_minutes);
            if minutes == 0 {
                bail!("--interval must be at least 1 minute");
            }
            let pipeline = Arc::new(IngestPipeline::from_config(&config).await?);
            info!(minutes, "scheduling ingest passes");
            run_scheduled(pipeline, Duration::from_secs(minutes * 60)).await?;
        }
        Commands::Export { out } => {
            let store = Store::open(&config.database_url)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?;
            let manifest = export_history(&store, &out).await?;
            for file in &manifest.files {
                println!("{} rows={} sha256={} -> {}", file.name, file.rows, file.sha256, out.join(&file.path).display());
            }
        }
        Commands::Sessions { source, limit } => {
            let store = Store::open(&config.database_url)
                .await
                .with_context(|| format!("opening store {}", config.database_url))?;
            let tracker = SessionTracker::new(&store);
            let sessions = match source {
                Some(code) => tracker.sessions_for_source(&code, None).await?,
                None => tracker.recent(limit).await?,
            };
            for session in sessions.iter().take(limit as usize) {
                print_session(session);
            }
        }
    }

    Ok(())
}

fn print_report(report: &SourceReport) {
    match &report.error {
        Some(cause) => println!("{} {}: {}", report.source_code, report.status, cause),
        None => println!(
            "{} {}: tables={} rows={} saved={} skipped={} unresolved={} failed={}",
            report.source_code,
            report.status,
            report.tables_seen,
            report.drafts,
            report.saved,
            report.skipped_rows,
            report.unresolved,
            report.failed
        ),
    }
}

fn print_session(session: &IngestionSession) {
    let finished = session
        .finished_at
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {} {} started={} finished={} records={}{}",
        session.id,
        session.source_code,
        session.status,
        session.started_at.format("%Y-%m-%d %H:%M:%S"),
        finished,
        session.records_collected,
        session
            .error_message
            .as_deref()
            .map(|m| format!(" error={m:?}"))
            .unwrap_or_default()
    );
}
