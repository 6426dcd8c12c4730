//! Error taxonomy for the engine.
//!
//! Each component owns one error type. The ingestion pipeline maps them
//! onto [`FailureCategory`] for reports and statistics:
//!
//! | Error | Policy |
//! |-------|--------|
//! | [`ExtractionError`] | recorded, document skipped, never retried |
//! | [`ClassificationError`] | tier forced to Personal, logged |
//! | [`EmbeddingError`] | batch halved and retried while [`EmbeddingError::is_transient`] |
//! | [`StoreError`] | collection marked unavailable; [`StoreError::Corrupt`] aborts the run |

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Category under which a per-document failure is reported and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Io,
    Extraction,
    Embedding,
    Store,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Io => "io",
            FailureCategory::Extraction => "extraction",
            FailureCategory::Embedding => "embedding",
            FailureCategory::Store => "store",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "io" => Some(FailureCategory::Io),
            "extraction" => Some(FailureCategory::Extraction),
            "embedding" => Some(FailureCategory::Embedding),
            "store" => Some(FailureCategory::Store),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text extraction failed. Permanent: the pipeline never retries it.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported format: {0}")]
    Unsupported(String),
    #[error("corrupt content: {0}")]
    Corrupt(String),
    #[error("encoding failure: {0}")]
    Encoding(String),
    #[error("no extractable text: {0}")]
    NoText(String),
    #[error("file exceeds size limit ({size} > {limit} bytes)")]
    TooLarge { size: u64, limit: u64 },
}

impl ExtractionError {
    /// Human-readable reason stored in the document index.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn category(&self) -> FailureCategory {
        FailureCategory::Extraction
    }
}

/// A privacy detector could not run.
#[derive(Debug, Error)]
#[error("detector {detector} unavailable: {reason}")]
pub struct ClassificationError {
    pub detector: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding capability unreachable: {0}")]
    Unavailable(String),
    #[error("embedding capability out of resources: {0}")]
    ResourceExhausted(String),
    #[error("embedding request rejected: {0}")]
    Rejected(String),
    #[error("embedding provider is disabled")]
    Disabled,
    #[error("expected {expected} vectors, got {actual}")]
    CountMismatch { expected: usize, actual: usize },
    #[error("model {model} returned {actual}-dim vector, expected {expected}")]
    DimensionMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },
    #[error("stored vectors use {stored}, active model is {active}; run `docintel reembed`")]
    ModelMismatch { stored: String, active: String },
}

impl EmbeddingError {
    pub fn category(&self) -> FailureCategory {
        FailureCategory::Embedding
    }

    /// Whether a retry with a smaller batch may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EmbeddingError::Unavailable(_)
                | EmbeddingError::ResourceExhausted(_)
                | EmbeddingError::CountMismatch { .. }
                | EmbeddingError::DimensionMismatch { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection {collection} unavailable: {reason}")]
    Unavailable { collection: String, reason: String },
    #[error("collection {collection} is corrupt: {reason}")]
    Corrupt { collection: String, reason: String },
    #[error("chunk {chunk} has tier {tier} and cannot be stored in collection {collection}")]
    Misrouted {
        chunk: String,
        tier: String,
        collection: String,
    },
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// SQLITE_CORRUPT and SQLITE_NOTADB primary result codes.
const SQLITE_CORRUPT: &str = "11";
const SQLITE_NOTADB: &str = "26";

impl StoreError {
    /// Map a database error for `collection`, separating corruption from
    /// recoverable failures such as a full disk or a locked file.
    pub fn from_sqlx(collection: &str, err: sqlx::Error) -> Self {
        let corrupt = match &err {
            sqlx::Error::Database(db) => db
                .code()
                .map(|c| {
                    let primary = c.parse::<u32>().map(|n| (n & 0xff).to_string());
                    let primary = primary.unwrap_or_else(|_| c.to_string());
                    primary == SQLITE_CORRUPT || primary == SQLITE_NOTADB
                })
                .unwrap_or(false),
            _ => false,
        };
        if corrupt {
            StoreError::Corrupt {
                collection: collection.to_string(),
                reason: err.to_string(),
            }
        } else {
            StoreError::Unavailable {
                collection: collection.to_string(),
                reason: err.to_string(),
            }
        }
    }

    pub fn category(&self) -> FailureCategory {
        FailureCategory::Store
    }

    /// Only corruption escalates to a run-level abort.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupt { .. })
    }
}

/// Run-level failure of an ingestion batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingestion aborted: {0}")]
    Aborted(#[source] StoreError),
    #[error("input discovery failed: {0}")]
    Discovery(String),
}

/// A query could not be answered.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("document not indexed: {0}")]
    NotIndexed(String),
}
