//! # docintel
//!
//! A local-first document intelligence engine.
//!
//! docintel ingests heterogeneous documents (text, Markdown, source code,
//! PDF, Office), classifies every passage into a privacy tier, embeds it,
//! and stores it in one SQLite collection per tier. Semantic search and
//! related-document queries never return a passage above the caller's tier
//! ceiling.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │ Extract  │──▶│  Chunk   │──▶│ Classify │──▶│  Embed   │──▶│ Tier store   │
//! │ by format│   │ +overlap │   │ max tier │   │ adapter  │   │ public/bus./ │
//! └──────────┘   └──────────┘   └──────────┘   └──────────┘   │ personal     │
//!                                                             └──────┬───────┘
//!                                  ┌─────────────────────────────────┤
//!                                  ▼                                 ▼
//!                            ┌──────────┐                      ┌──────────┐
//!                            │  query   │                      │ related  │
//!                            └──────────┘                      └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docintel init                           # write config, create store
//! docintel sync ~/notes                   # ingest a directory
//! docintel privacy-scan ~/notes/tax.md    # classify without storing
//! docintel query "deployment checklist" --max-tier business
//! docintel related ~/notes/plan.md
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`hardware`] | Host profile and resource budget |
//! | [`privacy`] | Privacy tier classifier |
//! | [`extract`] | Multi-format text extraction |
//! | [`links`] | Wiki-link extraction |
//! | [`chunk`] | Structure-aware chunking |
//! | [`embedding`] | Embedding capability abstraction |
//! | [`store`] | Tiered vector store |
//! | [`catalog`] | Document index and lifetime counters |
//! | [`scan`] | Input discovery |
//! | [`ingest`] | Ingestion pipeline |
//! | [`query`] | Search and related documents |
//! | [`engine`] | Facade over all of the above |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Processing statistics |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Schema migrations |

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod hardware;
pub mod ingest;
pub mod links;
pub mod migrate;
pub mod models;
pub mod privacy;
pub mod progress;
pub mod query;
pub mod scan;
pub mod stats;
pub mod store;
