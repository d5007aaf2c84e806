use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub narrative: NarrativeConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Directory holding checkpoint files and error logs, one per stage/shard.
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./state"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IngestConfig {
    /// Source extracts sometimes report 5F.(2) AUM in thousands of dollars.
    /// When set, base AUM values are scaled to whole dollars on extraction.
    #[serde(default)]
    pub aum_in_thousands: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NarrativeConfig {
    #[serde(default = "default_text_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_narrative_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_narrative_delay_ms")]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        Self {
            provider: default_text_provider(),
            model: None,
            batch_size: default_narrative_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            inter_batch_delay_ms: default_narrative_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Secondary provider tried when the primary fails a whole batch.
    #[serde(default)]
    pub fallback_provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    // Embedding providers are the tighter rate-limit bottleneck, so the
    // defaults here are smaller batches and longer delays than [narrative].
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_embedding_delay_ms")]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            fallback_provider: None,
            model: None,
            dims: default_dims(),
            batch_size: default_embedding_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            inter_batch_delay_ms: default_embedding_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            lexical_weight: default_lexical_weight(),
            threshold: default_threshold(),
            limit: default_limit(),
            candidate_k: default_candidate_k(),
        }
    }
}

fn default_text_provider() -> String {
    "template".to_string()
}
fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_narrative_batch_size() -> usize {
    50
}
fn default_embedding_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> u64 {
    2
}
fn default_narrative_delay_ms() -> u64 {
    250
}
fn default_embedding_delay_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_dims() -> usize {
    384
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_lexical_weight() -> f64 {
    0.3
}
fn default_threshold() -> f64 {
    0.0
}
fn default_limit() -> i64 {
    10
}
fn default_candidate_k() -> i64 {
    80
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.embedding.dims == 0 {
        anyhow::bail!("embedding.dims must be > 0");
    }

    match config.narrative.provider.as_str() {
        "template" | "openai" => {}
        other => anyhow::bail!(
            "Unknown text provider: '{}'. Must be template or openai.",
            other
        ),
    }

    for provider in std::iter::once(config.embedding.provider.as_str())
        .chain(config.embedding.fallback_provider.as_deref())
    {
        match provider {
            "hash" | "openai" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash or openai.",
                other
            ),
        }
    }

    if !(0.0..=1.0).contains(&config.search.vector_weight)
        || !(0.0..=1.0).contains(&config.search.lexical_weight)
    {
        anyhow::bail!("search.vector_weight and search.lexical_weight must be in [0.0, 1.0]");
    }

    if !(-1.0..=1.0).contains(&config.search.threshold) {
        anyhow::bail!("search.threshold must be in [-1.0, 1.0]");
    }

    if config.search.limit < 1 {
        anyhow::bail!("search.limit must be >= 1");
    }

    if config.narrative.batch_size == 0 || config.embedding.batch_size == 0 {
        anyhow::bail!("batch_size must be > 0");
    }

    Ok(config)
}
