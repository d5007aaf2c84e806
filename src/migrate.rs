use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // Advisers: one row per registrant, keyed by CRD number (or a GEN_
    // synthetic key when the filing carries none).
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS advisers (
            crd_number TEXT PRIMARY KEY,
            legal_name TEXT,
            sec_number TEXT,
            street1 TEXT,
            street2 TEXT,
            city TEXT,
            state TEXT,
            postal TEXT,
            phone TEXT,
            fax TEXT,
            website TEXT,
            aum INTEGER,
            employee_count INTEGER,
            services TEXT,
            client_types TEXT,
            private_fund_count INTEGER NOT NULL DEFAULT 0,
            private_fund_aum INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS filings (
            filing_id INTEGER PRIMARY KEY,
            adviser_crd TEXT NOT NULL,
            filing_date TEXT,
            filing_period TEXT,
            form_type TEXT NOT NULL DEFAULT 'ADV',
            total_aum INTEGER,
            employee_count INTEGER,
            source_file TEXT,
            ingested_at INTEGER NOT NULL,
            FOREIGN KEY (adviser_crd) REFERENCES advisers(crd_number)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS control_persons (
            id INTEGER PRIMARY KEY,
            adviser_crd TEXT NOT NULL,
            filing_id INTEGER,
            person_name TEXT NOT NULL,
            title TEXT NOT NULL,
            ownership_code TEXT,
            ownership_percent REAL,
            ingested_at INTEGER NOT NULL,
            UNIQUE(adviser_crd, person_name, title)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS private_funds (
            id INTEGER PRIMARY KEY,
            adviser_crd TEXT NOT NULL,
            filing_id INTEGER NOT NULL,
            reference_id TEXT NOT NULL,
            fund_name TEXT,
            fund_type TEXT,
            gross_asset_value INTEGER,
            min_investment INTEGER,
            is_master_fund INTEGER,
            is_fund_of_funds INTEGER,
            exclusion_type TEXT,
            UNIQUE(adviser_crd, filing_id, reference_id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // One narrative per (adviser, type). The embedding column is populated
    // later, asynchronously, by the embedding stage; regeneration of the
    // text nulls it again.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS narratives (
            id TEXT PRIMARY KEY,
            adviser_crd TEXT NOT NULL,
            narrative_type TEXT NOT NULL DEFAULT 'profile',
            narrative_text TEXT NOT NULL,
            generated_from_name TEXT,
            source TEXT NOT NULL,
            generated_at INTEGER NOT NULL,
            embedding BLOB,
            embedding_model TEXT,
            embedding_dims INTEGER,
            embedded_at INTEGER,
            UNIQUE(adviser_crd, narrative_type),
            FOREIGN KEY (adviser_crd) REFERENCES advisers(crd_number)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // FTS5 virtual table over narrative text for the lexical search signal.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='narratives_fts'",
    )
    .fetch_one(&pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE narratives_fts USING fts5(
                narrative_id UNINDEXED,
                adviser_crd UNINDEXED,
                text
            )
            "#,
        )
        .execute(&pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_advisers_state ON advisers(state)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_advisers_aum ON advisers(aum DESC)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_filings_adviser ON filings(adviser_crd)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_private_funds_adviser ON private_funds(adviser_crd)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_control_persons_adviser ON control_persons(adviser_crd)")
        .execute(&pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_narratives_adviser ON narratives(adviser_crd)")
        .execute(&pool)
        .await?;

    pool.close().await;
    Ok(())
}
