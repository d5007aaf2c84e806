//! Database statistics and coverage overview.
//!
//! Provides a quick summary of pipeline state: adviser and filing counts,
//! narrative and embedding coverage, and a per-state breakdown. Used by
//! `ria stats` to give confidence that ingest and the generation stages
//! are keeping up with each other.

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

struct StateStats {
    state: String,
    advisers: i64,
    narratives: i64,
    embedded: i64,
}

pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let advisers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM advisers")
        .fetch_one(&pool)
        .await?;
    let filings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM filings")
        .fetch_one(&pool)
        .await?;
    let control_persons: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM control_persons")
        .fetch_one(&pool)
        .await?;
    let private_funds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM private_funds")
        .fetch_one(&pool)
        .await?;
    let narratives: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM narratives")
        .fetch_one(&pool)
        .await?;
    let embedded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM narratives WHERE embedding IS NOT NULL")
            .fetch_one(&pool)
            .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("RIA Pipeline — Database Stats");
    println!("=============================");
    println!();
    println!("  Database:        {}", config.db.path.display());
    println!("  Size:            {}", format_bytes(db_size));
    println!();
    println!("  Advisers:        {}", advisers);
    println!("  Filings:         {}", filings);
    println!("  Control persons: {}", control_persons);
    println!("  Private funds:   {}", private_funds);
    println!(
        "  Narratives:      {} / {} ({}%)",
        narratives,
        advisers,
        percent(narratives, advisers)
    );
    println!(
        "  Embedded:        {} / {} ({}%)",
        embedded,
        narratives,
        percent(embedded, narratives)
    );

    let state_rows = sqlx::query(
        r#"
        SELECT
            COALESCE(a.state, '??') AS state,
            COUNT(DISTINCT a.crd_number) AS advisers,
            COUNT(DISTINCT n.id) AS narratives,
            COUNT(DISTINCT CASE WHEN n.embedding IS NOT NULL THEN n.id END) AS embedded
        FROM advisers a
        LEFT JOIN narratives n ON n.adviser_crd = a.crd_number
        GROUP BY COALESCE(a.state, '??')
        ORDER BY advisers DESC
        LIMIT 10
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let state_stats: Vec<StateStats> = state_rows
        .iter()
        .map(|row| StateStats {
            state: row.get("state"),
            advisers: row.get("advisers"),
            narratives: row.get("narratives"),
            embedded: row.get("embedded"),
        })
        .collect();

    if !state_stats.is_empty() {
        println!();
        println!("  By state:");
        println!(
            "  {:<8} {:>10} {:>12} {:>10}",
            "STATE", "ADVISERS", "NARRATIVES", "EMBEDDED"
        );
        println!("  {}", "-".repeat(44));
        for s in &state_stats {
            println!(
                "  {:<8} {:>10} {:>12} {:>10}",
                s.state, s.advisers, s.narratives, s.embedded
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

fn percent(part: i64, whole: i64) -> i64 {
    if whole > 0 {
        (part * 100) / whole
    } else {
        0
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
