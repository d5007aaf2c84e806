//! # RIA Pipeline CLI (`ria`)
//!
//! The `ria` binary drives the Form ADV pipeline: database
//! initialization, period-extract ingestion, narrative generation,
//! embedding generation, semantic/hybrid search, and shard planning for
//! parallel runs.
//!
//! ## Usage
//!
//! ```bash
//! ria --config ./config/ria.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ria init` | Create the SQLite database and run schema migrations |
//! | `ria ingest <root>` | Extract and upsert period CSV directories |
//! | `ria narratives generate` | Generate narratives for advisers lacking one |
//! | `ria embeddings generate` | Embed narratives lacking a vector |
//! | `ria embeddings rebuild` | Clear all vectors and re-embed |
//! | `ria search "<query>"` | Semantic or hybrid search over narratives |
//! | `ria pipeline` | Run ingest → narratives → embeddings in order |
//! | `ria shards` | Print key-range shard plans for parallel workers |
//! | `ria stats` | Database coverage summary |
//! | `ria show <crd>` | Print one adviser in full |
//!
//! Exit code is 0 on a clean pass, including "nothing left to do";
//! unrecoverable errors (missing credentials, malformed config, absent
//! input directories) exit non-zero.

use anyhow::bail;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ria_pipeline::models::{SearchFilters, StageOpts};
use ria_pipeline::progress::ProgressMode;
use ria_pipeline::shard::{plan_shards, ShardPlan};
use ria_pipeline::{config, db, embed, ingest, migrate, narrative, pipeline, search, show, stats};

/// RIA Pipeline — SEC Form ADV ingestion, narrative generation, and
/// semantic search for registered investment advisers.
#[derive(Parser)]
#[command(
    name = "ria",
    about = "RIA Pipeline — Form ADV ingestion, narratives, embeddings, and semantic search",
    version,
    long_about = "Ingests SEC Form ADV period extracts into a relational store, generates a \
    textual narrative per registered investment adviser, computes vector embeddings for the \
    narratives, and serves semantic + hybrid search over the result. Stages are resumable via \
    per-shard checkpoint files and safe to re-run indefinitely."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ria.toml")]
    config: PathBuf,

    /// Progress output on stderr: auto, off, human, or json.
    #[arg(long, global = true, default_value = "auto")]
    progress: String,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (advisers, filings, control_persons, private_funds, narratives,
    /// narratives_fts). Idempotent; running it again is safe.
    Init,

    /// Extract and upsert Form ADV period directories.
    ///
    /// Scans the source root for `ADV_Filing_Data_*` period directories
    /// and ingests adviser base records, control persons, and private
    /// funds. Periods already committed to the ingest checkpoint are
    /// skipped unless --full is given.
    Ingest {
        /// Source root containing one directory per reporting period.
        input: PathBuf,

        /// Ignore the checkpoint and reprocess every period from scratch.
        #[arg(long)]
        full: bool,

        /// Show record counts without writing to the database.
        #[arg(long)]
        dry_run: bool,

        /// Maximum adviser records to process this run.
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Generate adviser narratives.
    Narratives {
        #[command(subcommand)]
        action: NarrativesAction,
    },

    /// Generate narrative embeddings.
    Embeddings {
        #[command(subcommand)]
        action: EmbeddingsAction,
    },

    /// Search adviser narratives.
    ///
    /// Embeds the query text with the configured provider, then ranks
    /// narratives by cosine similarity (`semantic`) or by a weighted
    /// blend of similarity and lexical rank (`hybrid`).
    Search {
        /// The search query string.
        query: String,

        /// Search mode: `semantic` (vector only) or `hybrid`.
        #[arg(long, default_value = "semantic")]
        mode: String,

        /// Filter: exact state code (e.g. MO).
        #[arg(long)]
        state: Option<String>,

        /// Filter: minimum assets under management, in dollars.
        #[arg(long)]
        min_aum: Option<i64>,

        /// Filter: case-insensitive city substring.
        #[arg(long)]
        city: Option<String>,

        /// Minimum similarity for the vector signal.
        #[arg(long)]
        threshold: Option<f64>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Run the full pipeline: ingest → narratives → embeddings.
    ///
    /// A downstream stage is skipped when it has nothing pending. Prints
    /// one report of per-stage counts and elapsed time.
    Pipeline {
        /// Source root to ingest first; omit to start at narratives.
        #[arg(long)]
        input: Option<PathBuf>,

        /// Ignore the ingest checkpoint and reprocess every period.
        #[arg(long)]
        full: bool,

        #[command(flatten)]
        stage: StageArgs,
    },

    /// Print key-range shard plans for parallel stage processes.
    ///
    /// Partitions the current adviser key space into N disjoint ranges;
    /// each worker passes its range via --start-key/--end-key --shard.
    Shards {
        /// Number of shards to plan.
        #[arg(long, default_value_t = 4)]
        count: u32,
    },

    /// Database coverage summary.
    Stats,

    /// Print one adviser with narrative, filings, people, and funds.
    Show {
        /// Adviser natural key (CRD number or GEN_ synthetic key).
        crd: String,
    },
}

/// Narrative management subcommands.
#[derive(Subcommand)]
enum NarrativesAction {
    /// Generate narratives for advisers that lack one.
    ///
    /// Selects advisers in natural-key order with no profile narrative
    /// and a usable name, plus narratives generated under a placeholder
    /// name whose adviser has since been corrected. Safe to re-run; the
    /// selection filter makes completed work a no-op.
    Generate {
        #[command(flatten)]
        stage: StageArgs,
    },
}

/// Embedding management subcommands.
#[derive(Subcommand)]
enum EmbeddingsAction {
    /// Embed narratives that have text but no vector.
    Generate {
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Clear all vectors and re-embed every narrative.
    ///
    /// Useful when switching embedding models or dimensions.
    Rebuild {
        #[command(flatten)]
        stage: StageArgs,
    },
}

/// Flags shared by the batch stages.
#[derive(clap::Args)]
struct StageArgs {
    /// Override the configured batch size.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum records to process this run.
    #[arg(long)]
    limit: Option<u64>,

    /// Shard range start key (inclusive).
    #[arg(long)]
    start_key: Option<String>,

    /// Shard range end key (exclusive).
    #[arg(long)]
    end_key: Option<String>,

    /// Shard id, names the checkpoint file for this range.
    #[arg(long, default_value_t = 0)]
    shard: u32,

    /// Override the configured provider for this run.
    #[arg(long)]
    provider: Option<String>,

    /// Show pending counts without calling any provider.
    #[arg(long)]
    dry_run: bool,
}

impl StageArgs {
    fn into_opts(self) -> StageOpts {
        StageOpts {
            batch_size: self.batch_size,
            limit: self.limit,
            shard: ShardPlan {
                shard_id: self.shard,
                start_key: self.start_key,
                end_key: self.end_key,
            },
            provider: self.provider,
            dry_run: self.dry_run,
        }
    }
}

fn progress_mode(raw: &str) -> anyhow::Result<ProgressMode> {
    match raw {
        "auto" => Ok(ProgressMode::default_for_tty()),
        "off" => Ok(ProgressMode::Off),
        "human" => Ok(ProgressMode::Human),
        "json" => Ok(ProgressMode::Json),
        other => bail!("Unknown progress mode: {}. Use auto, off, human, or json.", other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    let reporter = progress_mode(&cli.progress)?.reporter();

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            input,
            full,
            dry_run,
            limit,
        } => {
            ingest::run_ingest(&cfg, &input, full, dry_run, limit, reporter.as_ref()).await?;
        }
        Commands::Narratives { action } => match action {
            NarrativesAction::Generate { stage } => {
                narrative::run_generate(&cfg, &stage.into_opts(), reporter.as_ref()).await?;
            }
        },
        Commands::Embeddings { action } => match action {
            EmbeddingsAction::Generate { stage } => {
                embed::run_generate(&cfg, &stage.into_opts(), reporter.as_ref()).await?;
            }
            EmbeddingsAction::Rebuild { stage } => {
                embed::run_rebuild(&cfg, &stage.into_opts(), reporter.as_ref()).await?;
            }
        },
        Commands::Search {
            query,
            mode,
            state,
            min_aum,
            city,
            threshold,
            limit,
        } => {
            let filters = SearchFilters {
                state,
                min_aum,
                city,
            };
            search::run_search(&cfg, &query, &mode, &filters, threshold, limit).await?;
        }
        Commands::Pipeline { input, full, stage } => {
            let opts = pipeline::PipelineOpts {
                input,
                full,
                stage: stage.into_opts(),
            };
            pipeline::run_pipeline(&cfg, &opts, reporter.as_ref()).await?;
        }
        Commands::Shards { count } => {
            run_shards(&cfg, count).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
        Commands::Show { crd } => {
            show::run_show(&cfg, &crd).await?;
        }
    }

    Ok(())
}

/// Plan shard ranges over the current adviser key space and print the
/// flags each worker should pass.
async fn run_shards(cfg: &config::Config, count: u32) -> anyhow::Result<()> {
    let pool = db::connect(cfg).await?;
    let keys: Vec<String> =
        sqlx::query_scalar("SELECT crd_number FROM advisers ORDER BY crd_number ASC")
            .fetch_all(&pool)
            .await?;
    pool.close().await;

    if keys.is_empty() {
        println!("No advisers ingested yet; nothing to shard.");
        return Ok(());
    }

    let plans = plan_shards(&keys, count);
    println!("shard plans over {} advisers:", keys.len());
    for plan in &plans {
        let start = plan
            .start_key
            .as_deref()
            .map(|k| format!(" --start-key {}", k))
            .unwrap_or_default();
        let end = plan
            .end_key
            .as_deref()
            .map(|k| format!(" --end-key {}", k))
            .unwrap_or_default();
        println!("  --shard {}{}{}", plan.shard_id, start, end);
    }

    Ok(())
}
