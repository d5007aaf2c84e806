//! Narrative generation stage.
//!
//! Scans advisers in ascending natural-key order, selects those with no
//! profile narrative and a usable name, builds a deterministic prompt per
//! adviser, and stores the provider's response verbatim. A narrative that
//! was generated under a placeholder name becomes eligible again once the
//! adviser's real name is known; regeneration overwrites the text and
//! nulls the embedding in the same statement, so a stale vector can never
//! pair with new text.
//!
//! The stage is safe to re-run indefinitely: the selection filter excludes
//! already-narrated advisers, so a second pass over the same range is a
//! no-op. Rate-limit responses lengthen the inter-batch delay and shrink
//! the batch instead of aborting the run.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, ErrorLog};
use crate::config::Config;
use crate::db;
use crate::models::{StageOpts, StageOutcome};
use crate::normalize::is_placeholder_name;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::retry::{with_retry, BackoffPolicy};
use crate::shard::ShardPlan;
use crate::textgen::{self, NarrativeFacts, TextProvider};

const STAGE: &str = "narratives";

/// Longest inter-batch delay the rate-limit adaptation will reach.
const MAX_INTER_BATCH_DELAY: Duration = Duration::from_secs(60);

/// Count advisers still needing narrative work in this shard.
///
/// Slightly over-counts: renames away from a real (non-placeholder) name
/// match here but are filtered during the run. Good enough for the
/// orchestrator's skip decision and dry-run display.
pub async fn pending_count(pool: &SqlitePool, shard: &ShardPlan) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM advisers a
        LEFT JOIN narratives n
            ON n.adviser_crd = a.crd_number AND n.narrative_type = 'profile'
        WHERE (n.id IS NULL OR n.generated_from_name IS NOT a.legal_name)
          AND (?1 IS NULL OR a.crd_number >= ?1)
          AND (?2 IS NULL OR a.crd_number < ?2)
        "#,
    )
    .bind(&shard.start_key)
    .bind(&shard.end_key)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Run narrative generation over this shard's pending advisers.
pub async fn run_generate(
    config: &Config,
    opts: &StageOpts,
    reporter: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let mut narrative_cfg = config.narrative.clone();
    if let Some(provider) = &opts.provider {
        narrative_cfg.provider = provider.clone();
    }

    // Provider construction failures (unknown name, missing credentials)
    // are fatal startup errors, not per-record ones.
    let provider = textgen::create_provider(&narrative_cfg)?;
    let pool = db::connect(config).await?;

    let cp_path = Checkpoint::path_for(&config.state.dir, STAGE, opts.shard.shard_id);
    let mut checkpoint = Checkpoint::load_or_new(&cp_path, STAGE, opts.shard.shard_id)?;
    let errlog = ErrorLog::open(&config.state.dir, STAGE)?;

    reporter.report(ProgressEvent::Scanning {
        what: STAGE.to_string(),
    });
    let total_pending = pending_count(&pool, &opts.shard).await?;

    if opts.dry_run {
        println!("narratives generate (dry-run)");
        println!("  advisers needing narratives: {}", total_pending);
        pool.close().await;
        return Ok(StageOutcome::default());
    }

    let mut outcome = StageOutcome::default();
    let mut batch_size = opts.batch_size.unwrap_or(narrative_cfg.batch_size).max(1);
    let mut delay = Duration::from_millis(narrative_cfg.inter_batch_delay_ms);
    let backoff = BackoffPolicy::fixed(Duration::from_secs(narrative_cfg.retry_delay_secs));
    let mut range_complete = false;

    loop {
        let fetch = match opts.limit {
            Some(limit) => {
                let remaining = limit.saturating_sub(outcome.processed);
                if remaining == 0 {
                    break;
                }
                batch_size.min(remaining as usize)
            }
            None => batch_size,
        };

        let candidates =
            select_candidates(&pool, &opts.shard, checkpoint.last_key.as_deref(), fetch).await?;
        if candidates.is_empty() {
            range_complete = true;
            break;
        }
        let fetched = candidates.len();

        let mut rate_limited = false;

        for candidate in candidates {
            let crd = candidate.crd_number.clone();

            let name = match candidate.usable_name() {
                Some(name) => name.to_string(),
                None => {
                    outcome.skipped += 1;
                    checkpoint.advance(&crd);
                    continue;
                }
            };

            if !candidate.needs_narrative() {
                // Narrative exists and was generated under a real name; a
                // rename alone does not trigger regeneration. Re-stamp the
                // provenance so the row leaves the pending set.
                accept_existing(&pool, &crd, &name).await?;
                outcome.skipped += 1;
                checkpoint.advance(&crd);
                continue;
            }

            let prompt = textgen::build_prompt(&candidate.facts(&name));
            // max_retries counts retries after the first attempt.
            let generated = with_retry(narrative_cfg.max_retries + 1, backoff, || {
                provider.generate_text(&prompt)
            })
            .await;

            outcome.processed += 1;

            match generated {
                Ok(text) if text.trim().is_empty() => {
                    let reason = "narrative text empty after generation";
                    checkpoint.record_failure(&crd, reason);
                    errlog.append(&crd, reason)?;
                    outcome.failed += 1;
                }
                Ok(text) => {
                    store_narrative(&pool, &crd, &name, &text, provider.name()).await?;
                    checkpoint.record_success(&crd);
                    outcome.succeeded += 1;
                }
                Err(e) => {
                    if e.is_rate_limit() {
                        rate_limited = true;
                    }
                    let reason = e.to_string();
                    checkpoint.record_failure(&crd, &reason);
                    errlog.append(&crd, &reason)?;
                    outcome.failed += 1;
                }
            }
        }

        checkpoint.store(&cp_path)?;
        reporter.report(ProgressEvent::Processing {
            stage: STAGE.to_string(),
            n: outcome.processed + outcome.skipped,
            total: total_pending as u64,
        });

        // Repeated rate-limit signals are recoverable: slow down and
        // shrink batches rather than treating them as fatal.
        if rate_limited {
            delay = (delay * 2).min(MAX_INTER_BATCH_DELAY);
            batch_size = (batch_size / 2).max(1);
        }

        if fetched < fetch {
            range_complete = true;
            break;
        }
        tokio::time::sleep(delay).await;
    }

    if range_complete {
        // Clear the cursor so the next invocation is a fresh full pass
        // that re-selects anything that failed this time.
        checkpoint.reset_cursor();
        checkpoint.store(&cp_path)?;
    }

    println!("narratives generate");
    println!("  pending: {}", total_pending);
    println!("  processed: {}", outcome.processed);
    println!("  generated: {}", outcome.succeeded);
    println!("  failed: {}", outcome.failed);
    println!("  skipped: {}", outcome.skipped);
    println!("  checkpoint: {}", cp_path.display());
    println!("  error log: {}", errlog.path().display());
    println!("ok");

    pool.close().await;
    Ok(outcome)
}

struct Candidate {
    crd_number: String,
    legal_name: Option<String>,
    sec_number: Option<String>,
    city: Option<String>,
    state: Option<String>,
    aum: Option<i64>,
    employee_count: Option<i64>,
    services: Option<String>,
    client_types: Option<String>,
    narrative_id: Option<String>,
    generated_from_name: Option<String>,
}

impl Candidate {
    fn usable_name(&self) -> Option<&str> {
        self.legal_name
            .as_deref()
            .filter(|n| !is_placeholder_name(n))
    }

    /// True when the adviser has no narrative, or its narrative was
    /// generated under a placeholder (or unrecorded) name.
    fn needs_narrative(&self) -> bool {
        match (&self.narrative_id, &self.generated_from_name) {
            (None, _) => true,
            (Some(_), None) => true,
            (Some(_), Some(old_name)) => is_placeholder_name(old_name),
        }
    }

    fn facts(&self, name: &str) -> NarrativeFacts {
        NarrativeFacts {
            name: name.to_string(),
            city: self.city.clone(),
            state: self.state.clone(),
            crd_number: if self.crd_number.starts_with("GEN_") {
                None
            } else {
                Some(self.crd_number.clone())
            },
            sec_number: self.sec_number.clone(),
            aum: self.aum,
            employee_count: self.employee_count,
            services: self.services.clone(),
            client_types: self.client_types.clone(),
        }
    }
}

/// Fetch the next batch of candidates after the cursor, in key order.
async fn select_candidates(
    pool: &SqlitePool,
    shard: &ShardPlan,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<Candidate>> {
    let rows = sqlx::query(
        r#"
        SELECT a.crd_number, a.legal_name, a.sec_number, a.city, a.state,
               a.aum, a.employee_count, a.services, a.client_types,
               n.id AS narrative_id, n.generated_from_name
        FROM advisers a
        LEFT JOIN narratives n
            ON n.adviser_crd = a.crd_number AND n.narrative_type = 'profile'
        WHERE (n.id IS NULL OR n.generated_from_name IS NOT a.legal_name)
          AND (?1 IS NULL OR a.crd_number > ?1)
          AND (?2 IS NULL OR a.crd_number >= ?2)
          AND (?3 IS NULL OR a.crd_number < ?3)
        ORDER BY a.crd_number ASC
        LIMIT ?4
        "#,
    )
    .bind(after)
    .bind(&shard.start_key)
    .bind(&shard.end_key)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let candidates = rows
        .iter()
        .map(|row| Candidate {
            crd_number: row.get("crd_number"),
            legal_name: row.get("legal_name"),
            sec_number: row.get("sec_number"),
            city: row.get("city"),
            state: row.get("state"),
            aum: row.get("aum"),
            employee_count: row.get("employee_count"),
            services: row.get("services"),
            client_types: row.get("client_types"),
            narrative_id: row.get("narrative_id"),
            generated_from_name: row.get("generated_from_name"),
        })
        .collect();

    Ok(candidates)
}

/// Keep the existing narrative but record it as accepted under the
/// adviser's current name, so a real-name rename stops matching the
/// pending predicate.
async fn accept_existing(pool: &SqlitePool, crd: &str, name: &str) -> Result<()> {
    sqlx::query(
        "UPDATE narratives SET generated_from_name = ? \
         WHERE adviser_crd = ? AND narrative_type = 'profile'",
    )
    .bind(name)
    .bind(crd)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert or replace the profile narrative and refresh its FTS row.
///
/// Replacing the text nulls the embedding columns in the same statement so
/// the row re-enters the embedding stage's selection set.
async fn store_narrative(
    pool: &SqlitePool,
    crd: &str,
    generated_from_name: &str,
    text: &str,
    source: &str,
) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO narratives (
            id, adviser_crd, narrative_type, narrative_text,
            generated_from_name, source, generated_at
        )
        VALUES (?, ?, 'profile', ?, ?, ?, ?)
        ON CONFLICT(adviser_crd, narrative_type) DO UPDATE SET
            narrative_text = excluded.narrative_text,
            generated_from_name = excluded.generated_from_name,
            source = excluded.source,
            generated_at = excluded.generated_at,
            embedding = NULL,
            embedding_model = NULL,
            embedding_dims = NULL,
            embedded_at = NULL
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(crd)
    .bind(text)
    .bind(generated_from_name)
    .bind(source)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    let narrative_id: String = sqlx::query_scalar(
        "SELECT id FROM narratives WHERE adviser_crd = ? AND narrative_type = 'profile'",
    )
    .bind(crd)
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM narratives_fts WHERE narrative_id = ?")
        .bind(&narrative_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO narratives_fts (narrative_id, adviser_crd, text) VALUES (?, ?, ?)")
        .bind(&narrative_id)
        .bind(crd)
        .bind(text)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: Option<&str>, narrative: Option<(&str, Option<&str>)>) -> Candidate {
        Candidate {
            crd_number: "100001".to_string(),
            legal_name: name.map(|s| s.to_string()),
            sec_number: None,
            city: None,
            state: None,
            aum: None,
            employee_count: None,
            services: None,
            client_types: None,
            narrative_id: narrative.map(|(id, _)| id.to_string()),
            generated_from_name: narrative.and_then(|(_, n)| n.map(|s| s.to_string())),
        }
    }

    #[test]
    fn placeholder_names_are_not_usable() {
        assert!(candidate(Some("Acme Capital"), None).usable_name().is_some());
        assert!(candidate(Some("UNKNOWN"), None).usable_name().is_none());
        assert!(candidate(None, None).usable_name().is_none());
    }

    #[test]
    fn fresh_adviser_needs_narrative() {
        assert!(candidate(Some("Acme Capital"), None).needs_narrative());
    }

    #[test]
    fn placeholder_era_narrative_regenerates() {
        let c = candidate(Some("Acme Capital"), Some(("n1", Some("UNKNOWN"))));
        assert!(c.needs_narrative());
    }

    #[test]
    fn real_name_rename_does_not_regenerate() {
        let c = candidate(Some("Acme Capital II"), Some(("n1", Some("Acme Capital"))));
        assert!(!c.needs_narrative());
    }

    #[test]
    fn synthetic_keys_are_not_shown_as_crd() {
        let mut c = candidate(Some("Acme Capital"), None);
        c.crd_number = "GEN_AB12CD34EF56".to_string();
        assert_eq!(c.facts("Acme Capital").crd_number, None);
    }
}
