//! Vector and hybrid search over adviser narratives.
//!
//! `match_narratives` ranks stored narrative vectors by cosine similarity
//! to a query vector; `hybrid_search` blends that signal with a normalized
//! FTS5 lexical rank. Structured filters (state, minimum AUM, city
//! substring) are applied as a pre-filter joined against the adviser
//! table, never as a post-filter on the top-K. Degenerate inputs and
//! datastore faults are reported to the search error log and yield an
//! empty result instead of an escaping error.

use anyhow::{bail, Result};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use crate::checkpoint::ErrorLog;
use crate::config::Config;
use crate::db;
use crate::embedding::{self, blob_to_vec, cosine_similarity, EmbeddingProvider};
use crate::models::{SearchFilters, SearchHit};

/// Top-K narratives by vector similarity.
///
/// Results below `threshold` are excluded; ordering is strictly
/// descending similarity with ties broken by natural key ascending.
pub async fn match_narratives(
    pool: &SqlitePool,
    query_vector: &[f32],
    threshold: f64,
    limit: i64,
    filters: &SearchFilters,
    errlog: &ErrorLog,
) -> Result<Vec<SearchHit>> {
    if is_degenerate(query_vector) {
        errlog.append(
            "query",
            "degenerate query vector (empty or all zeros); returning no results",
        )?;
        return Ok(Vec::new());
    }

    let candidates = fetch_vector_candidates(pool, filters).await?;

    let mut hits = Vec::new();
    for candidate in candidates {
        let stored = blob_to_vec(&candidate.embedding);
        if stored.len() != query_vector.len() {
            errlog.append(
                &candidate.crd_number,
                &format!(
                    "stored vector dims {} do not match query dims {}; returning no results",
                    stored.len(),
                    query_vector.len()
                ),
            )?;
            return Ok(Vec::new());
        }

        let similarity = cosine_similarity(query_vector, &stored) as f64;
        if similarity >= threshold {
            hits.push(SearchHit {
                crd_number: candidate.crd_number,
                legal_name: candidate.legal_name,
                city: candidate.city,
                state: candidate.state,
                narrative_text: candidate.narrative_text,
                similarity,
                combined_score: None,
            });
        }
    }

    sort_ranked(&mut hits, |h| h.similarity);
    hits.truncate(limit.max(0) as usize);
    Ok(hits)
}

/// Blend vector similarity and lexical rank into one score.
///
/// `weights` is `(vector_weight, lexical_weight)`. A row matching only
/// one signal still appears, with the missing signal contributing zero.
/// The vector `threshold` gates only the vector signal.
#[allow(clippy::too_many_arguments)]
pub async fn hybrid_search(
    pool: &SqlitePool,
    query_text: &str,
    query_vector: &[f32],
    threshold: f64,
    limit: i64,
    weights: (f64, f64),
    candidate_k: i64,
    filters: &SearchFilters,
    errlog: &ErrorLog,
) -> Result<Vec<SearchHit>> {
    struct Meta {
        legal_name: Option<String>,
        city: Option<String>,
        state: Option<String>,
        narrative_text: String,
    }

    let mut meta: HashMap<String, Meta> = HashMap::new();
    let mut vector_scores: HashMap<String, f64> = HashMap::new();
    let mut lexical_raw: Vec<(String, f64)> = Vec::new();

    // Vector signal
    if !is_degenerate(query_vector) {
        for candidate in fetch_vector_candidates(pool, filters).await? {
            let stored = blob_to_vec(&candidate.embedding);
            if stored.len() != query_vector.len() {
                errlog.append(
                    &candidate.crd_number,
                    &format!(
                        "stored vector dims {} do not match query dims {}; returning no results",
                        stored.len(),
                        query_vector.len()
                    ),
                )?;
                return Ok(Vec::new());
            }

            let similarity = cosine_similarity(query_vector, &stored) as f64;
            if similarity >= threshold {
                vector_scores.insert(candidate.crd_number.clone(), similarity);
                meta.insert(
                    candidate.crd_number,
                    Meta {
                        legal_name: candidate.legal_name,
                        city: candidate.city,
                        state: candidate.state,
                        narrative_text: candidate.narrative_text,
                    },
                );
            }
        }
    } else {
        errlog.append(
            "query",
            "degenerate query vector (empty or all zeros); lexical signal only",
        )?;
    }

    // Lexical signal
    let match_expr = fts_query(query_text);
    if !match_expr.is_empty() {
        let lexical = match fetch_lexical_candidates(pool, &match_expr, candidate_k, filters).await
        {
            Ok(rows) => rows,
            Err(e) => {
                errlog.append(
                    "query",
                    &format!("lexical search failed for {:?}: {}; returning no results", query_text, e),
                )?;
                return Ok(Vec::new());
            }
        };

        for row in lexical {
            lexical_raw.push((row.crd_number.clone(), row.raw_score));
            meta.entry(row.crd_number).or_insert(Meta {
                legal_name: row.legal_name,
                city: row.city,
                state: row.state,
                narrative_text: row.narrative_text,
            });
        }
    }

    let lexical_scores = normalize_scores(&lexical_raw);

    let (vector_weight, lexical_weight) = weights;
    let mut hits: Vec<SearchHit> = meta
        .into_iter()
        .map(|(crd, m)| {
            let similarity = vector_scores.get(&crd).copied().unwrap_or(0.0);
            let lexical = lexical_scores.get(&crd).copied().unwrap_or(0.0);
            let combined = vector_weight * similarity + lexical_weight * lexical;
            SearchHit {
                crd_number: crd,
                legal_name: m.legal_name,
                city: m.city,
                state: m.state,
                narrative_text: m.narrative_text,
                similarity,
                combined_score: Some(combined),
            }
        })
        .collect();

    sort_ranked(&mut hits, |h| h.combined_score.unwrap_or(0.0));
    hits.truncate(limit.max(0) as usize);
    Ok(hits)
}

/// An all-zero or empty query vector never produces a spurious match.
fn is_degenerate(query_vector: &[f32]) -> bool {
    query_vector.is_empty() || query_vector.iter().all(|v| *v == 0.0)
}

/// Descending by score, ties broken by natural key ascending so results
/// are deterministic.
fn sort_ranked<F>(hits: &mut [SearchHit], score: F)
where
    F: Fn(&SearchHit) -> f64,
{
    hits.sort_by(|a, b| {
        score(b)
            .partial_cmp(&score(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.crd_number.cmp(&b.crd_number))
    });
}

// ============ Candidate fetching ============

struct VectorCandidate {
    crd_number: String,
    legal_name: Option<String>,
    city: Option<String>,
    state: Option<String>,
    narrative_text: String,
    embedding: Vec<u8>,
}

/// Embedded narratives joined with adviser attributes, pre-filtered.
async fn fetch_vector_candidates(
    pool: &SqlitePool,
    filters: &SearchFilters,
) -> Result<Vec<VectorCandidate>> {
    let mut sql = String::from(
        "SELECT n.adviser_crd, n.narrative_text, n.embedding, \
                a.legal_name, a.city, a.state \
         FROM narratives n \
         JOIN advisers a ON a.crd_number = n.adviser_crd \
         WHERE n.embedding IS NOT NULL",
    );
    push_filter_sql(&mut sql, filters);

    let mut query = sqlx::query(&sql);
    query = bind_filters(query, filters);

    let rows = query.fetch_all(pool).await?;

    let candidates = rows
        .iter()
        .map(|row| VectorCandidate {
            crd_number: row.get("adviser_crd"),
            legal_name: row.get("legal_name"),
            city: row.get("city"),
            state: row.get("state"),
            narrative_text: row.get("narrative_text"),
            embedding: row.get("embedding"),
        })
        .collect();

    Ok(candidates)
}

struct LexicalCandidate {
    crd_number: String,
    legal_name: Option<String>,
    city: Option<String>,
    state: Option<String>,
    narrative_text: String,
    raw_score: f64,
}

async fn fetch_lexical_candidates(
    pool: &SqlitePool,
    match_expr: &str,
    candidate_k: i64,
    filters: &SearchFilters,
) -> Result<Vec<LexicalCandidate>> {
    let mut sql = String::from(
        "SELECT narratives_fts.adviser_crd, bm25(narratives_fts) AS rank, \
                n.narrative_text, a.legal_name, a.city, a.state \
         FROM narratives_fts \
         JOIN narratives n ON n.id = narratives_fts.narrative_id \
         JOIN advisers a ON a.crd_number = narratives_fts.adviser_crd \
         WHERE narratives_fts MATCH ?",
    );
    push_filter_sql(&mut sql, filters);
    sql.push_str(" ORDER BY rank LIMIT ?");

    let mut query = sqlx::query(&sql).bind(match_expr);
    query = bind_filters(query, filters);
    query = query.bind(candidate_k);

    let rows = query.fetch_all(pool).await?;

    let candidates = rows
        .iter()
        .map(|row| {
            let rank: f64 = row.get("rank");
            LexicalCandidate {
                crd_number: row.get("adviser_crd"),
                legal_name: row.get("legal_name"),
                city: row.get("city"),
                state: row.get("state"),
                narrative_text: row.get("narrative_text"),
                raw_score: -rank, // negate so higher = better
            }
        })
        .collect();

    Ok(candidates)
}

fn push_filter_sql(sql: &mut String, filters: &SearchFilters) {
    if filters.state.is_some() {
        sql.push_str(" AND a.state = ?");
    }
    if filters.min_aum.is_some() {
        sql.push_str(" AND a.aum >= ?");
    }
    if filters.city.is_some() {
        sql.push_str(" AND instr(lower(a.city), lower(?)) > 0");
    }
}

fn bind_filters<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filters: &'q SearchFilters,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(state) = &filters.state {
        query = query.bind(state);
    }
    if let Some(min_aum) = filters.min_aum {
        query = query.bind(min_aum);
    }
    if let Some(city) = &filters.city {
        query = query.bind(city);
    }
    query
}

/// Quote the query terms so user input cannot inject FTS5 syntax; terms
/// are OR-ed for recall since the lexical signal is one of two.
fn fts_query(input: &str) -> String {
    input
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{}\"", term))
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Min-max normalize raw scores to [0, 1]; a single candidate (or all
/// equal) normalizes to 1.0.
fn normalize_scores(raw: &[(String, f64)]) -> HashMap<String, f64> {
    if raw.is_empty() {
        return HashMap::new();
    }

    let min = raw.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
    let max = raw
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    raw.iter()
        .map(|(key, score)| {
            let norm = if (max - min).abs() < f64::EPSILON {
                1.0
            } else {
                (score - min) / (max - min)
            };
            (key.clone(), norm)
        })
        .collect()
}

// ============ CLI entry point ============

pub async fn run_search(
    config: &Config,
    query: &str,
    mode: &str,
    filters: &SearchFilters,
    threshold: Option<f64>,
    limit: Option<i64>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    match mode {
        "semantic" | "hybrid" => {}
        _ => bail!("Unknown search mode: {}. Use semantic or hybrid.", mode),
    }

    let provider = embedding::create_provider(&config.embedding, &config.embedding.provider)?;
    let vectors = provider.embed(&[query.to_string()]).await?;
    let query_vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Empty embedding response for query"))?;

    let pool = db::connect(config).await?;
    let errlog = ErrorLog::open(&config.state.dir, "search")?;

    let threshold = threshold.unwrap_or(config.search.threshold);
    let limit = limit.unwrap_or(config.search.limit);

    let hits = match mode {
        "semantic" => {
            match_narratives(&pool, &query_vector, threshold, limit, filters, &errlog).await?
        }
        _ => {
            hybrid_search(
                &pool,
                query,
                &query_vector,
                threshold,
                limit,
                (config.search.vector_weight, config.search.lexical_weight),
                config.search.candidate_k,
                filters,
                &errlog,
            )
            .await?
        }
    };

    if hits.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let score = hit.combined_score.unwrap_or(hit.similarity);
        let name = hit.legal_name.as_deref().unwrap_or("(unnamed)");
        let location = match (&hit.city, &hit.state) {
            (Some(city), Some(state)) => format!("{}, {}", city, state),
            (Some(city), None) => city.clone(),
            (None, Some(state)) => state.clone(),
            (None, None) => "-".to_string(),
        };

        println!("{}. [{:.3}] {}", i + 1, score, name);
        println!("    location: {}", location);
        println!("    crd: {}", hit.crd_number);
        if hit.combined_score.is_some() {
            println!("    similarity: {:.3}", hit.similarity);
        }
        let excerpt: String = hit.narrative_text.chars().take(160).collect();
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " "));
        println!();
    }

    pool.close().await;
    Ok(())
}
