//! Interval scheduling of ingest passes with overlap protection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::pipeline::IngestPipeline;
use crate::RunSummary;

/// Admits one pass at a time. A tick that finds a pass in flight is dropped, not queued.
#[derive(Debug, Clone, Default)]
pub struct ScheduleGate {
    running: Arc<Mutex<()>>,
}

impl ScheduleGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a pass unless one is already running or shutdown has been requested.
    pub async fn run_pass(&self, pipeline: &IngestPipeline) -> Option<RunSummary> {
        let Ok(_running) = self.running.try_lock() else {
            warn!("previous pass still running; skipping tick");
            return None;
        };
        if pipeline.shutdown_signal().is_triggered() {
            return None;
        }
        match pipeline.run_once().await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(error = %err, "pass failed");
                None
            }
        }
    }

    /// Waits for any in-flight pass to finish.
    pub async fn drained(&self) {
        let _idle = self.running.lock().await;
    }
}

/// Runs a pass now, then every `interval`, until Ctrl-C. The source in flight when the
/// signal arrives is finished before returning.
pub async fn run_scheduled(pipeline: Arc<IngestPipeline>, interval: Duration) -> Result<()> {
    let shutdown = pipeline.shutdown_signal();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received; finishing in-flight source");
                shutdown.trigger();
            }
        });
    }

    let gate = ScheduleGate::new();
    gate.run_pass(&pipeline).await;
    if shutdown.is_triggered() {
        return Ok(());
    }

    let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = {
        let pipeline = Arc::clone(&pipeline);
        let gate = gate.clone();
        Job::new_repeated_async(interval, move |_id, _scheduler| {
            let pipeline = Arc::clone(&pipeline);
            let gate = gate.clone();
            Box::pin(async move {
                gate.run_pass(&pipeline).await;
            })
        })
        .context("creating interval job")?
    };
    scheduler.add(job).await.context("adding interval job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(interval_secs = interval.as_secs(), "scheduler started");

    shutdown.triggered().await;
    gate.drained().await;
    scheduler.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}
