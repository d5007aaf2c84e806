//! Pipeline orchestration.
//!
//! Runs the stages in dependency order (ingest, then narratives, then
//! embeddings), skipping a downstream stage when its precondition count
//! is zero, and
//! prints one structured report of per-stage counts and elapsed time. No
//! business logic lives here; the stages own their own selection, retry,
//! and checkpointing.

use anyhow::Result;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::db;
use crate::embed;
use crate::ingest;
use crate::models::{StageOpts, StageOutcome};
use crate::narrative;
use crate::progress::ProgressReporter;

#[derive(Debug, Clone, Default)]
pub struct PipelineOpts {
    /// Source root to ingest; without it the run starts at narratives.
    pub input: Option<PathBuf>,
    /// Ignore the ingest checkpoint and reprocess every period.
    pub full: bool,
    pub stage: StageOpts,
}

struct StageReport {
    name: &'static str,
    outcome: Option<StageOutcome>,
    elapsed: Duration,
}

pub async fn run_pipeline(
    config: &Config,
    opts: &PipelineOpts,
    reporter: &dyn ProgressReporter,
) -> Result<()> {
    let mut reports = Vec::new();

    if let Some(input) = &opts.input {
        let started = Instant::now();
        let outcome = ingest::run_ingest(
            config,
            input,
            opts.full,
            opts.stage.dry_run,
            opts.stage.limit,
            reporter,
        )
        .await?;
        reports.push(StageReport {
            name: "ingest",
            outcome: Some(outcome),
            elapsed: started.elapsed(),
        });
    }

    // Downstream preconditions are checked against the store, not against
    // the previous stage's return value: work left behind by earlier runs
    // still gets picked up.
    let pool = db::connect(config).await?;
    let narratives_pending = narrative::pending_count(&pool, &opts.stage.shard).await?;
    pool.close().await;

    if narratives_pending > 0 {
        let started = Instant::now();
        let outcome = narrative::run_generate(config, &opts.stage, reporter).await?;
        reports.push(StageReport {
            name: "narratives",
            outcome: Some(outcome),
            elapsed: started.elapsed(),
        });
    } else {
        reports.push(StageReport {
            name: "narratives",
            outcome: None,
            elapsed: Duration::ZERO,
        });
    }

    let pool = db::connect(config).await?;
    let embeddings_pending = embed::pending_count(&pool, &opts.stage.shard).await?;
    pool.close().await;

    if embeddings_pending > 0 {
        let started = Instant::now();
        let outcome = embed::run_generate(config, &opts.stage, reporter).await?;
        reports.push(StageReport {
            name: "embeddings",
            outcome: Some(outcome),
            elapsed: started.elapsed(),
        });
    } else {
        reports.push(StageReport {
            name: "embeddings",
            outcome: None,
            elapsed: Duration::ZERO,
        });
    }

    println!("pipeline run");
    for report in &reports {
        match &report.outcome {
            Some(outcome) => println!(
                "  {}: processed {}, succeeded {}, failed {}, skipped {} ({:.1}s)",
                report.name,
                outcome.processed,
                outcome.succeeded,
                outcome.failed,
                outcome.skipped,
                report.elapsed.as_secs_f64()
            ),
            None => println!("  {}: skipped (nothing pending)", report.name),
        }
    }
    println!("ok");

    Ok(())
}
