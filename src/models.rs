//! Core data models shared by the pipeline, the store and the query engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::FailureCategory;

/// Sensitivity tier of a unit of text.
///
/// Ordered `Public < Business < Personal`; classification always takes the
/// maximum over firing signals.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyTier {
    #[default]
    Public,
    Business,
    Personal,
}

impl PrivacyTier {
    pub const ALL: [PrivacyTier; 3] = [
        PrivacyTier::Public,
        PrivacyTier::Business,
        PrivacyTier::Personal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyTier::Public => "public",
            PrivacyTier::Business => "business",
            PrivacyTier::Personal => "personal",
        }
    }

    /// Numeric rank stored in collection rows so SQL can filter `tier <= ?`.
    pub fn rank(&self) -> i64 {
        match self {
            PrivacyTier::Public => 0,
            PrivacyTier::Business => 1,
            PrivacyTier::Personal => 2,
        }
    }

    /// Unknown ranks map to Personal.
    pub fn from_rank(rank: i64) -> Self {
        match rank {
            0 => PrivacyTier::Public,
            1 => PrivacyTier::Business,
            _ => PrivacyTier::Personal,
        }
    }

    /// Name of the collection holding chunks of this tier.
    pub fn collection(&self) -> &'static str {
        self.as_str()
    }

    /// Tiers visible under `ceiling`, lowest first.
    pub fn up_to(ceiling: PrivacyTier) -> impl Iterator<Item = PrivacyTier> {
        PrivacyTier::ALL.into_iter().filter(move |t| *t <= ceiling)
    }
}

impl std::fmt::Display for PrivacyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PrivacyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "public" => Ok(PrivacyTier::Public),
            "business" => Ok(PrivacyTier::Business),
            "personal" => Ok(PrivacyTier::Personal),
            other => Err(format!(
                "unknown privacy tier '{}': expected public, business or personal",
                other
            )),
        }
    }
}

/// Extraction status of a document in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Pending => "pending",
            ExtractionStatus::Succeeded => "succeeded",
            ExtractionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "succeeded" => ExtractionStatus::Succeeded,
            "failed" => ExtractionStatus::Failed,
            _ => ExtractionStatus::Pending,
        }
    }
}

/// Storage lifecycle of a chunk.
///
/// ```text
/// Pending ─▶ Embedded ─▶ Indexed ─┬─▶ Deleted
///                                 └─▶ Superseded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkState {
    Pending,
    Embedded,
    Indexed,
    Deleted,
    Superseded,
}

impl ChunkState {
    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(&self, next: ChunkState) -> bool {
        matches!(
            (self, next),
            (ChunkState::Pending, ChunkState::Embedded)
                | (ChunkState::Embedded, ChunkState::Indexed)
                | (ChunkState::Indexed, ChunkState::Deleted)
                | (ChunkState::Indexed, ChunkState::Superseded)
        )
    }
}

/// A source file tracked by the document index.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// Stable hash of source path and modification time.
    pub id: String,
    pub path: PathBuf,
    pub format: String,
    pub size_bytes: u64,
    pub modified_at: i64,
    pub content_hash: String,
    pub status: ExtractionStatus,
    pub chunk_count: usize,
    pub max_tier: Option<PrivacyTier>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCategory>,
    pub links: Vec<String>,
    pub updated_at: i64,
}

/// Free-form metadata extracted for a chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub source_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub signals: Vec<String>,
    pub byte_start: usize,
    pub byte_end: usize,
}

/// A passage of a document, the unit of embedding and storage.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// `{document_id}_{position}`
    pub id: String,
    pub document_id: String,
    pub position: usize,
    pub text: String,
    pub tier: PrivacyTier,
    pub metadata: ChunkMetadata,
    pub state: ChunkState,
}

impl Chunk {
    pub fn chunk_id(document_id: &str, position: usize) -> String {
        format!("{}_{}", document_id, position)
    }
}

/// A chunk as persisted in a collection, with its vector.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: String,
    pub document_id: String,
    pub position: usize,
    pub text: String,
    pub tier: PrivacyTier,
    pub model: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
    pub ingested_seq: i64,
}

/// A ranked search hit returned to callers. Never carries the vector.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub document_id: String,
    pub source_path: String,
    pub position: usize,
    pub tier: PrivacyTier,
    pub score: f32,
    pub text: String,
    pub metadata: ChunkMetadata,
    #[serde(skip)]
    pub ingested_seq: i64,
}
