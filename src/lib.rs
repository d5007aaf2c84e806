//! # RIA Pipeline
//!
//! An ETL and semantic-search pipeline over SEC Form ADV filing data:
//! period CSV extracts are normalized into a relational store, each
//! registered investment adviser gets a generated narrative, narratives
//! get vector embeddings, and a search service ranks them by cosine
//! similarity, optionally blended with a lexical FTS5 signal.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Extractor  │──▶│   Upsert   │──▶│ Narratives  │──▶│ Embeddings │
//! │ period CSV │   │   writer   │   │ (textgen)   │   │ (vectors)  │
//! └────────────┘   └─────┬──────┘   └──────┬──────┘   └─────┬──────┘
//!                        ▼                 ▼                ▼
//!                  ┌───────────────────────────────────────────┐
//!                  │          SQLite (FTS5 + f32 BLOBs)        │
//!                  └─────────────────────┬─────────────────────┘
//!                                        ▼
//!                                 ┌────────────┐
//!                                 │   search   │
//!                                 └────────────┘
//! ```
//!
//! Stages pull pages of pending rows in natural-key order, process them
//! against rate-limited providers with bounded retry, and advance a
//! per-shard checkpoint file after every batch, so killed runs resume
//! instead of restarting.
//!
//! ## Quick start
//!
//! ```bash
//! ria init                          # create database
//! ria ingest ./raw                  # load period extracts
//! ria narratives generate           # generate adviser narratives
//! ria embeddings generate           # embed narratives
//! ria search "st louis hedge fund adviser" --mode hybrid
//! ```

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod embed;
pub mod embedding;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod narrative;
pub mod normalize;
pub mod pipeline;
pub mod progress;
pub mod retry;
pub mod search;
pub mod shard;
pub mod show;
pub mod stats;
pub mod textgen;
pub mod upsert;
