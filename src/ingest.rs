//! Ingestion: extraction plus upsert over reporting-period directories.
//!
//! Walks the source root for period directories, extracts typed records
//! from each, and hands them to the upsert writer. Periods ingest in name
//! order with a period-level checkpoint, so a rerun continues with the
//! first period not yet committed; `--full` ignores the checkpoint and
//! reprocesses everything (idempotent by upsert).

use anyhow::Result;
use std::path::Path;

use crate::checkpoint::{Checkpoint, ErrorLog};
use crate::config::Config;
use crate::db;
use crate::extract;
use crate::models::StageOutcome;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::upsert;

const STAGE: &str = "ingest";

pub async fn run_ingest(
    config: &Config,
    input_root: &Path,
    full: bool,
    dry_run: bool,
    limit: Option<u64>,
    reporter: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let periods = extract::discover_periods(input_root)?;

    let cp_path = Checkpoint::path_for(&config.state.dir, STAGE, 0);
    let mut checkpoint = if full {
        Checkpoint::new(STAGE, 0)
    } else {
        Checkpoint::load_or_new(&cp_path, STAGE, 0)?
    };
    let errlog = ErrorLog::open(&config.state.dir, STAGE)?;

    let todo: Vec<_> = periods
        .into_iter()
        .filter(|dir| {
            let name = dir.file_name().map(|n| n.to_string_lossy().to_string());
            match (&checkpoint.last_key, name) {
                (Some(last), Some(name)) => name.as_str() > last.as_str(),
                _ => true,
            }
        })
        .collect();

    if dry_run {
        println!("ingest (dry-run)");
        println!("  periods found: {}", todo.len());
        let mut advisers = 0usize;
        let mut funds = 0usize;
        let mut people = 0usize;
        for dir in &todo {
            let extract = extract::extract_period(dir, &config.ingest)?;
            advisers += extract.advisers.len();
            funds += extract.private_funds.len();
            people += extract.control_persons.len();
        }
        println!("  adviser records: {}", advisers);
        println!("  control persons: {}", people);
        println!("  private funds: {}", funds);
        return Ok(StageOutcome::default());
    }

    let pool = db::connect(config).await?;
    let mut outcome = StageOutcome::default();
    let mut inserted = 0u64;
    let mut updated = 0u64;
    let total_periods = todo.len() as u64;
    let mut done_periods = 0u64;

    for dir in &todo {
        let period = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        reporter.report(ProgressEvent::Scanning {
            what: format!("{} {}", STAGE, period),
        });

        let mut extracted = extract::extract_period(dir, &config.ingest)?;
        outcome.skipped += extracted.skipped_rows;

        if let Some(limit) = limit {
            let remaining = limit.saturating_sub(outcome.processed) as usize;
            extracted.advisers.truncate(remaining);
        }

        let result = upsert::upsert_advisers(&pool, &extracted.advisers).await?;
        for failure in &result.failures {
            errlog.append(&failure.crd_number, &failure.reason)?;
        }

        upsert::upsert_filings(&pool, &extracted.advisers).await?;
        upsert::upsert_control_persons(&pool, &extracted.control_persons).await?;
        upsert::upsert_private_funds(&pool, &extracted.private_funds).await?;

        outcome.processed += extracted.advisers.len() as u64;
        outcome.succeeded += result.inserted + result.updated;
        outcome.failed += result.failures.len() as u64;
        outcome.skipped += result.skipped;
        inserted += result.inserted;
        updated += result.updated;

        checkpoint.advance(&period);
        checkpoint.processed += extracted.advisers.len() as u64;
        checkpoint.successful += result.inserted + result.updated;
        checkpoint.failed += result.failures.len() as u64;
        checkpoint.store(&cp_path)?;

        done_periods += 1;
        reporter.report(ProgressEvent::Processing {
            stage: STAGE.to_string(),
            n: done_periods,
            total: total_periods,
        });

        if let Some(limit) = limit {
            if outcome.processed >= limit {
                break;
            }
        }
    }

    println!("ingest");
    println!("  periods processed: {}", done_periods);
    println!("  adviser records: {}", outcome.processed);
    println!("  inserted: {}", inserted);
    println!("  updated: {}", updated);
    println!("  failed: {}", outcome.failed);
    println!("  skipped: {}", outcome.skipped);
    println!("  checkpoint: {}", cp_path.display());
    println!("  error log: {}", errlog.path().display());
    println!("ok");

    pool.close().await;
    Ok(outcome)
}
