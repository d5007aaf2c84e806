//! Embedding generation stage.
//!
//! Scans narrative rows with non-empty text and no vector, in ascending
//! adviser-key order, embeds them in batches, and writes the vector plus
//! provenance columns. A returned vector whose length differs from the
//! configured dimensionality is a hard error for that row; it is never
//! truncated, padded, or stored.
//!
//! Embedding providers are typically the tighter rate-limit bottleneck,
//! so this stage defaults to smaller batches and longer inter-batch
//! delays than narrative generation, and applies the same
//! slow-down-and-shrink adaptation on 429s. An optional fallback provider
//! is tried when the primary fails a whole batch after retries.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::checkpoint::{Checkpoint, ErrorLog};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, vec_to_blob, EmbeddingProvider};
use crate::models::{StageOpts, StageOutcome};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::retry::{with_retry, BackoffPolicy, ProviderError};
use crate::shard::ShardPlan;

const STAGE: &str = "embeddings";

const MAX_INTER_BATCH_DELAY: Duration = Duration::from_secs(120);

/// Count narrative rows still needing a vector in this shard.
pub async fn pending_count(pool: &SqlitePool, shard: &ShardPlan) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM narratives n
        WHERE n.embedding IS NULL
          AND length(trim(n.narrative_text)) > 0
          AND (?1 IS NULL OR n.adviser_crd >= ?1)
          AND (?2 IS NULL OR n.adviser_crd < ?2)
        "#,
    )
    .bind(&shard.start_key)
    .bind(&shard.end_key)
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// Run embedding generation over this shard's pending narratives.
pub async fn run_generate(
    config: &Config,
    opts: &StageOpts,
    reporter: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let mut embedding_cfg = config.embedding.clone();
    if let Some(provider) = &opts.provider {
        embedding_cfg.provider = provider.clone();
    }

    let provider = embedding::create_provider(&embedding_cfg, &embedding_cfg.provider)?;
    let fallback = match &embedding_cfg.fallback_provider {
        Some(name) if name != &embedding_cfg.provider => {
            Some(embedding::create_provider(&embedding_cfg, name)?)
        }
        _ => None,
    };

    let pool = db::connect(config).await?;

    let cp_path = Checkpoint::path_for(&config.state.dir, STAGE, opts.shard.shard_id);
    let mut checkpoint = Checkpoint::load_or_new(&cp_path, STAGE, opts.shard.shard_id)?;
    let errlog = ErrorLog::open(&config.state.dir, STAGE)?;

    reporter.report(ProgressEvent::Scanning {
        what: STAGE.to_string(),
    });
    let total_pending = pending_count(&pool, &opts.shard).await?;

    if opts.dry_run {
        println!("embeddings generate (dry-run)");
        println!("  narratives needing vectors: {}", total_pending);
        pool.close().await;
        return Ok(StageOutcome::default());
    }

    let mut outcome = StageOutcome::default();
    let mut batch_size = opts.batch_size.unwrap_or(embedding_cfg.batch_size).max(1);
    let mut delay = Duration::from_millis(embedding_cfg.inter_batch_delay_ms);
    let backoff = BackoffPolicy::fixed(Duration::from_secs(embedding_cfg.retry_delay_secs));
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

        let pending =
            select_pending(&pool, &opts.shard, checkpoint.last_key.as_deref(), fetch).await?;
        if pending.is_empty() {
            range_complete = true;
            break;
        }
        let fetched = pending.len();

        let texts: Vec<String> = pending.iter().map(|p| p.narrative_text.clone()).collect();

        let mut batch_result = with_retry(embedding_cfg.max_retries + 1, backoff, || {
            provider.embed(&texts)
        })
        .await;

        let mut model_name = provider.model_name();
        if batch_result.is_err() {
            if let Some(fallback) = &fallback {
                let fallback_result = with_retry(embedding_cfg.max_retries + 1, backoff, || {
                    fallback.embed(&texts)
                })
                .await;
                if fallback_result.is_ok() {
                    model_name = fallback.model_name();
                    batch_result = fallback_result;
                }
            }
        }

        let mut rate_limited = false;

        match batch_result {
            Ok(vectors) => {
                for (row, vector) in pending.iter().zip(vectors.iter()) {
                    if vector.len() != embedding_cfg.dims {
                        let reason = ProviderError::DimensionMismatch {
                            expected: embedding_cfg.dims,
                            got: vector.len(),
                        }
                        .to_string();
                        checkpoint.record_failure(&row.adviser_crd, &reason);
                        errlog.append(&row.adviser_crd, &reason)?;
                        outcome.processed += 1;
                        outcome.failed += 1;
                        continue;
                    }

                    match store_vector(&pool, row, vector, model_name).await? {
                        true => {
                            checkpoint.record_success(&row.adviser_crd);
                            outcome.processed += 1;
                            outcome.succeeded += 1;
                        }
                        false => {
                            // Text regenerated since selection; the row
                            // re-enters the pending set on its own.
                            checkpoint.advance(&row.adviser_crd);
                            outcome.skipped += 1;
                        }
                    }
                }
            }
            Err(e) => {
                if e.is_rate_limit() {
                    rate_limited = true;
                }
                let reason = e.to_string();
                for row in &pending {
                    outcome.processed += 1;
                    checkpoint.record_failure(&row.adviser_crd, &reason);
                    errlog.append(&row.adviser_crd, &reason)?;
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
        checkpoint.reset_cursor();
        checkpoint.store(&cp_path)?;
    }

    println!("embeddings generate");
    println!("  pending: {}", total_pending);
    println!("  processed: {}", outcome.processed);
    println!("  embedded: {}", outcome.succeeded);
    println!("  failed: {}", outcome.failed);
    println!("  skipped: {}", outcome.skipped);
    println!("  checkpoint: {}", cp_path.display());
    println!("  error log: {}", errlog.path().display());
    println!("ok");

    pool.close().await;
    Ok(outcome)
}

/// Clear every stored vector and regenerate from scratch.
///
/// Used when switching embedding models or dimensions.
pub async fn run_rebuild(
    config: &Config,
    opts: &StageOpts,
    reporter: &dyn ProgressReporter,
) -> Result<StageOutcome> {
    let pool = db::connect(config).await?;

    sqlx::query(
        r#"
        UPDATE narratives SET
            embedding = NULL,
            embedding_model = NULL,
            embedding_dims = NULL,
            embedded_at = NULL
        "#,
    )
    .execute(&pool)
    .await?;
    pool.close().await;

    // Start the pass from the top of the key range.
    let cp_path = Checkpoint::path_for(&config.state.dir, STAGE, opts.shard.shard_id);
    Checkpoint::new(STAGE, opts.shard.shard_id).store(&cp_path)?;

    println!("embeddings rebuild — cleared existing vectors");

    run_generate(config, opts, reporter).await
}

struct PendingNarrative {
    id: String,
    adviser_crd: String,
    narrative_text: String,
}

async fn select_pending(
    pool: &SqlitePool,
    shard: &ShardPlan,
    after: Option<&str>,
    limit: usize,
) -> Result<Vec<PendingNarrative>> {
    let rows = sqlx::query(
        r#"
        SELECT n.id, n.adviser_crd, n.narrative_text
        FROM narratives n
        WHERE n.embedding IS NULL
          AND length(trim(n.narrative_text)) > 0
          AND (?1 IS NULL OR n.adviser_crd > ?1)
          AND (?2 IS NULL OR n.adviser_crd >= ?2)
          AND (?3 IS NULL OR n.adviser_crd < ?3)
        ORDER BY n.adviser_crd ASC
        LIMIT ?4
        "#,
    )
    .bind(after)
    .bind(&shard.start_key)
    .bind(&shard.end_key)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    let pending = rows
        .iter()
        .map(|row| PendingNarrative {
            id: row.get("id"),
            adviser_crd: row.get("adviser_crd"),
            narrative_text: row.get("narrative_text"),
        })
        .collect();

    Ok(pending)
}

/// Write the vector and provenance. Guarded on the text the vector was
/// computed from: returns false when the narrative changed underneath us.
async fn store_vector(
    pool: &SqlitePool,
    row: &PendingNarrative,
    vector: &[f32],
    model: &str,
) -> Result<bool> {
    let now = chrono::Utc::now().timestamp();
    let blob = vec_to_blob(vector);

    let result = sqlx::query(
        r#"
        UPDATE narratives SET
            embedding = ?,
            embedding_model = ?,
            embedding_dims = ?,
            embedded_at = ?
        WHERE id = ? AND narrative_text = ?
        "#,
    )
    .bind(&blob)
    .bind(model)
    .bind(vector.len() as i64)
    .bind(now)
    .bind(&row.id)
    .bind(&row.narrative_text)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
