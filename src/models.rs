//! Core data models used throughout the pipeline.
//!
//! These types represent the adviser, filing, control-person, and
//! private-fund records that flow from the extractor through the upsert
//! writer, plus the result types returned by batch stages and search.

/// Normalized adviser record produced by the extractor.
///
/// `crd_number` is the natural key: the SEC CRD number when the filing
/// carries one, otherwise a synthetic `GEN_…` key derived from the firm's
/// name and location so every adviser is addressable.
#[derive(Debug, Clone, Default)]
pub struct AdviserRecord {
    pub crd_number: String,
    pub legal_name: Option<String>,
    pub sec_number: Option<String>,
    pub street1: Option<String>,
    pub street2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal: Option<String>,
    /// E.164 form, e.g. `+13145551234`.
    pub phone: Option<String>,
    pub fax: Option<String>,
    /// `https://…` form.
    pub website: Option<String>,
    /// Assets under management, in dollars.
    pub aum: Option<i64>,
    pub employee_count: Option<i64>,
    pub services: Option<String>,
    pub client_types: Option<String>,
    pub has_private_funds: bool,
    pub filing_id: Option<i64>,
    /// `YYYY-MM-DD` as submitted.
    pub filing_date: Option<String>,
    pub filing_period: Option<String>,
    pub source_file: Option<String>,
}

/// Officer/owner row from Schedule A/B.
#[derive(Debug, Clone)]
pub struct ControlPersonRecord {
    pub adviser_crd: String,
    pub filing_id: Option<i64>,
    pub person_name: String,
    pub title: String,
    pub ownership_code: Option<String>,
    pub ownership_percent: Option<f64>,
}

/// Private fund row from Schedule D 7.B.1.
#[derive(Debug, Clone)]
pub struct PrivateFundRecord {
    pub adviser_crd: String,
    pub filing_id: i64,
    /// SEC fund identifier (`805-…`), unique within a filing.
    pub reference_id: String,
    pub fund_name: Option<String>,
    /// Normalized category, see [`crate::normalize::classify_fund_type`].
    pub fund_type: String,
    pub gross_asset_value: Option<i64>,
    pub min_investment: Option<i64>,
    pub is_master_fund: Option<bool>,
    pub is_fund_of_funds: Option<bool>,
    pub exclusion_type: Option<String>,
}

/// Per-record failure from a batch upsert.
#[derive(Debug, Clone)]
pub struct UpsertFailure {
    pub crd_number: String,
    pub reason: String,
}

/// Outcome of one adviser upsert batch.
///
/// `skipped` counts records collapsed by in-batch dedup. Failures are
/// reported per record; a failed row never aborts its siblings.
#[derive(Debug, Default)]
pub struct UpsertResult {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub failures: Vec<UpsertFailure>,
}

/// Aggregate counts returned by a pipeline stage run.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageOutcome {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Common knobs for one narrative or embedding stage run.
#[derive(Debug, Clone)]
pub struct StageOpts {
    /// Override the configured batch size for this run.
    pub batch_size: Option<usize>,
    /// Maximum records to process this run.
    pub limit: Option<u64>,
    /// Key range this process owns.
    pub shard: crate::shard::ShardPlan,
    /// Override the configured provider for this run.
    pub provider: Option<String>,
    pub dry_run: bool,
}

impl Default for StageOpts {
    fn default() -> Self {
        Self {
            batch_size: None,
            limit: None,
            shard: crate::shard::ShardPlan::full(),
            provider: None,
            dry_run: false,
        }
    }
}

/// Structured pre-filters applied by the search service.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Exact state match (two-letter code).
    pub state: Option<String>,
    /// Minimum assets under management, in dollars.
    pub min_aum: Option<i64>,
    /// Case-insensitive city substring.
    pub city: Option<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.min_aum.is_none() && self.city.is_none()
    }
}

/// One ranked row returned by the search service.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub crd_number: String,
    pub legal_name: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub narrative_text: String,
    /// Cosine similarity of the stored vector to the query vector.
    pub similarity: f64,
    /// Present only for hybrid search.
    pub combined_score: Option<f64>,
}
