//! Library-level consistency properties: vector/text invalidation,
//! dimension invariants, resumability, and shard disjointness. These
//! drive the stage functions directly so they can inspect the store
//! between steps.

use std::path::Path;

use ria_pipeline::checkpoint::{Checkpoint, ErrorLog};
use ria_pipeline::config::{
    Config, DbConfig, EmbeddingConfig, IngestConfig, NarrativeConfig, SearchConfig, StateConfig,
};
use ria_pipeline::embedding::blob_to_vec;
use ria_pipeline::models::{AdviserRecord, SearchFilters, StageOpts};
use ria_pipeline::progress::NoProgress;
use ria_pipeline::shard::ShardPlan;
use ria_pipeline::{db, embed, migrate, narrative, search, upsert};

const DIMS: usize = 64;

fn test_config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("data/ria.sqlite"),
        },
        state: StateConfig {
            dir: root.join("state"),
        },
        ingest: IngestConfig::default(),
        narrative: NarrativeConfig::default(),
        embedding: EmbeddingConfig {
            dims: DIMS,
            ..Default::default()
        },
        search: SearchConfig::default(),
    }
}

fn adviser(crd: &str, name: &str, city: &str, state: &str, aum: Option<i64>) -> AdviserRecord {
    AdviserRecord {
        crd_number: crd.to_string(),
        legal_name: Some(name.to_string()),
        city: Some(city.to_string()),
        state: Some(state.to_string()),
        aum,
        ..Default::default()
    }
}

async fn seed(config: &Config, advisers: &[AdviserRecord]) {
    migrate::run_migrations(config).await.unwrap();
    let pool = db::connect(config).await.unwrap();
    let result = upsert::upsert_advisers(&pool, advisers).await.unwrap();
    assert!(result.failures.is_empty());
    pool.close().await;
}

#[tokio::test]
async fn upsert_twice_leaves_identical_state() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    let batch = vec![
        adviser("100001", "Acme Capital Management LLC", "ST. LOUIS", "MO", Some(5_000_000)),
        adviser("100002", "Beacon Advisers", "CHICAGO", "IL", None),
    ];

    seed(&config, &batch).await;

    let pool = db::connect(&config).await.unwrap();
    let result = upsert::upsert_advisers(&pool, &batch).await.unwrap();
    assert_eq!(result.inserted, 0);
    assert_eq!(result.updated, 2);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM advisers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    let aum: Option<i64> =
        sqlx::query_scalar("SELECT aum FROM advisers WHERE crd_number = '100001'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(aum, Some(5_000_000));
    pool.close().await;
}

#[tokio::test]
async fn partial_update_does_not_null_known_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[adviser("100001", "Acme Capital", "ST. LOUIS", "MO", Some(42))],
    )
    .await;

    // A later record that knows the name but not the location or AUM.
    let sparse = AdviserRecord {
        crd_number: "100001".to_string(),
        legal_name: Some("Acme Capital Management LLC".to_string()),
        ..Default::default()
    };

    let pool = db::connect(&config).await.unwrap();
    upsert::upsert_advisers(&pool, &[sparse]).await.unwrap();

    let row: (Option<String>, Option<String>, Option<i64>) = sqlx::query_as(
        "SELECT legal_name, city, aum FROM advisers WHERE crd_number = '100001'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();

    assert_eq!(row.0.as_deref(), Some("Acme Capital Management LLC"));
    assert_eq!(row.1.as_deref(), Some("ST. LOUIS"));
    assert_eq!(row.2, Some(42));
    pool.close().await;
}

#[tokio::test]
async fn narrative_generation_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[
            adviser("100001", "Acme Capital", "ST. LOUIS", "MO", Some(5_000_000)),
            adviser("100002", "Beacon Advisers", "CHICAGO", "IL", None),
        ],
    )
    .await;

    let opts = StageOpts::default();
    let first = narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    assert_eq!(first.succeeded, 2);

    let second = narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.processed, 0);

    let pool = db::connect(&config).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM narratives")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
    pool.close().await;
}

#[tokio::test]
async fn stored_vectors_always_match_configured_dims() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[
            adviser("100001", "Acme Capital", "ST. LOUIS", "MO", Some(5_000_000)),
            adviser("100002", "Beacon Advisers", "CHICAGO", "IL", None),
        ],
    )
    .await;

    let opts = StageOpts::default();
    narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    let outcome = embed::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, 2);

    let pool = db::connect(&config).await.unwrap();
    let blobs: Vec<Vec<u8>> =
        sqlx::query_scalar("SELECT embedding FROM narratives WHERE embedding IS NOT NULL")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(blobs.len(), 2);
    for blob in &blobs {
        assert_eq!(blob_to_vec(blob).len(), DIMS);
    }

    let dims: Vec<i64> = sqlx::query_scalar(
        "SELECT embedding_dims FROM narratives WHERE embedding IS NOT NULL",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert!(dims.iter().all(|d| *d == DIMS as i64));
    pool.close().await;
}

#[tokio::test]
async fn regenerated_text_nulls_vector_until_next_pass() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[adviser("100001", "Acme Capital Management LLC", "ST. LOUIS", "MO", None)],
    )
    .await;

    let opts = StageOpts::default();
    narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    embed::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();

    let pool = db::connect(&config).await.unwrap();
    let embedded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM narratives WHERE embedding IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(embedded, 1);

    // Mark the narrative as generated under a placeholder name, the state
    // older loads left behind before the name was corrected.
    sqlx::query("UPDATE narratives SET generated_from_name = 'UNKNOWN'")
        .execute(&pool)
        .await
        .unwrap();
    pool.close().await;

    let outcome = narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, 1);

    // Regeneration nulled the vector; the row is pending again.
    let pool = db::connect(&config).await.unwrap();
    let embedded: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM narratives WHERE embedding IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(embedded, 0);
    let from_name: Option<String> =
        sqlx::query_scalar("SELECT generated_from_name FROM narratives")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(from_name.as_deref(), Some("Acme Capital Management LLC"));
    pool.close().await;

    // The next embedding pass recomputes a vector of the right length.
    let outcome = embed::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, 1);

    let pool = db::connect(&config).await.unwrap();
    let blob: Vec<u8> =
        sqlx::query_scalar("SELECT embedding FROM narratives WHERE embedding IS NOT NULL")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(blob_to_vec(&blob).len(), DIMS);
    pool.close().await;
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_end_state() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[
            adviser("100001", "Acme Capital", "ST. LOUIS", "MO", None),
            adviser("100002", "Beacon Advisers", "CHICAGO", "IL", None),
            adviser("100003", "Cypress Partners", "AUSTIN", "TX", None),
        ],
    )
    .await;

    // "Crash" after one committed record.
    let partial = StageOpts {
        limit: Some(1),
        ..Default::default()
    };
    let outcome = narrative::run_generate(&config, &partial, &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, 1);

    let cp_path = Checkpoint::path_for(&config.state.dir, "narratives", 0);
    let checkpoint = Checkpoint::load_or_new(&cp_path, "narratives", 0).unwrap();
    assert_eq!(checkpoint.last_key.as_deref(), Some("100001"));

    // Restarting with the same checkpoint finishes without reprocessing.
    let outcome = narrative::run_generate(&config, &StageOpts::default(), &NoProgress)
        .await
        .unwrap();
    assert_eq!(outcome.succeeded, 2);

    let pool = db::connect(&config).await.unwrap();
    let keys: Vec<String> =
        sqlx::query_scalar("SELECT adviser_crd FROM narratives ORDER BY adviser_crd")
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(keys, vec!["100001", "100002", "100003"]);
    pool.close().await;
}

#[tokio::test]
async fn shards_process_disjoint_ranges() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[
            adviser("100001", "Acme Capital", "ST. LOUIS", "MO", None),
            adviser("100002", "Beacon Advisers", "CHICAGO", "IL", None),
            adviser("100003", "Cypress Partners", "AUSTIN", "TX", None),
            adviser("100004", "Dunmore Wealth", "BOSTON", "MA", None),
        ],
    )
    .await;

    let shard_a = StageOpts {
        shard: ShardPlan {
            shard_id: 0,
            start_key: None,
            end_key: Some("100003".to_string()),
        },
        ..Default::default()
    };
    let shard_b = StageOpts {
        shard: ShardPlan {
            shard_id: 1,
            start_key: Some("100003".to_string()),
            end_key: None,
        },
        ..Default::default()
    };

    let a = narrative::run_generate(&config, &shard_a, &NoProgress)
        .await
        .unwrap();
    assert_eq!(a.succeeded, 2);

    let b = narrative::run_generate(&config, &shard_b, &NoProgress)
        .await
        .unwrap();
    assert_eq!(b.succeeded, 2);

    // Each shard kept its own checkpoint file.
    assert!(Checkpoint::path_for(&config.state.dir, "narratives", 0).exists());
    assert!(Checkpoint::path_for(&config.state.dir, "narratives", 1).exists());

    let pool = db::connect(&config).await.unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM narratives")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 4);
    pool.close().await;
}

#[tokio::test]
async fn degenerate_query_vector_returns_empty_not_error() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[adviser("100001", "Acme Capital", "ST. LOUIS", "MO", None)],
    )
    .await;

    let opts = StageOpts::default();
    narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    embed::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();

    let pool = db::connect(&config).await.unwrap();
    let errlog = ErrorLog::open(&config.state.dir, "search").unwrap();

    let zeroes = vec![0.0f32; DIMS];
    let hits = search::match_narratives(
        &pool,
        &zeroes,
        0.0,
        10,
        &SearchFilters::default(),
        &errlog,
    )
    .await
    .unwrap();
    assert!(hits.is_empty());

    // The offending query was logged rather than raised.
    let log = std::fs::read_to_string(errlog.path()).unwrap();
    assert!(log.contains("degenerate query vector"));
    pool.close().await;
}

#[tokio::test]
async fn query_dimension_mismatch_is_logged_and_empty() {
    let tmp = tempfile::tempdir().unwrap();
    let config = test_config(tmp.path());
    seed(
        &config,
        &[adviser("100001", "Acme Capital", "ST. LOUIS", "MO", None)],
    )
    .await;

    let opts = StageOpts::default();
    narrative::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();
    embed::run_generate(&config, &opts, &NoProgress)
        .await
        .unwrap();

    let pool = db::connect(&config).await.unwrap();
    let errlog = ErrorLog::open(&config.state.dir, "search").unwrap();

    let wrong_dims = vec![1.0f32; DIMS * 2];
    let hits = search::match_narratives(
        &pool,
        &wrong_dims,
        0.0,
        10,
        &SearchFilters::default(),
        &errlog,
    )
    .await
    .unwrap();
    assert!(hits.is_empty());

    let log = std::fs::read_to_string(errlog.path()).unwrap();
    assert!(log.contains("do not match query dims"));
    pool.close().await;
}
