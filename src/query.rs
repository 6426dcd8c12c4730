//! Semantic search and related-document lookup.
//!
//! Queries are embedded with the active model and compared only against
//! vectors carrying the same model id and dimensionality. When every
//! visible vector comes from another model the query is rejected with
//! [`EmbeddingError::ModelMismatch`] instead of returning nothing silently.

use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::RetrievalConfig;
use crate::embedding::{EmbeddingAdapter, TaggedVector};
use crate::error::{EmbeddingError, QueryError};
use crate::links;
use crate::models::{PrivacyTier, SearchHit, StoredChunk};
use crate::stats::ProcessingStats;
use crate::store::VectorStore;

/// Ranked hits for one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: String,
    pub max_tier: PrivacyTier,
    pub model: String,
    pub hits: Vec<SearchHit>,
    /// Visible chunks skipped because another model embedded them.
    pub incompatible_chunks: u64,
}

/// A document similar to, or linked with, another.
#[derive(Debug, Clone, Serialize)]
pub struct RelatedDocument {
    pub document_id: String,
    pub path: PathBuf,
    pub score: f32,
    /// Highest tier among the matching chunks.
    pub tier: PrivacyTier,
    /// Linked by a `[[wiki link]]` in either direction.
    pub linked: bool,
    pub best_chunk: String,
}

pub struct QueryEngine {
    store: Arc<VectorStore>,
    catalog: Arc<Catalog>,
    adapter: EmbeddingAdapter,
    retrieval: RetrievalConfig,
}

impl QueryEngine {
    pub fn new(
        store: Arc<VectorStore>,
        catalog: Arc<Catalog>,
        adapter: EmbeddingAdapter,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            adapter,
            retrieval,
        }
    }

    fn clamp_k(&self, k: Option<usize>) -> usize {
        k.unwrap_or(self.retrieval.default_k)
            .min(self.retrieval.max_k)
    }

    /// Top-`k` chunks for `text` with tier at most `max_tier`.
    pub async fn query(
        &self,
        text: &str,
        max_tier: PrivacyTier,
        k: Option<usize>,
    ) -> Result<QueryResult, QueryError> {
        let k = self.clamp_k(k);
        let mut result = QueryResult {
            query: text.to_string(),
            max_tier,
            model: self.adapter.model_id().to_string(),
            hits: Vec::new(),
            incompatible_chunks: 0,
        };
        if text.trim().is_empty() || k == 0 {
            return Ok(result);
        }

        let vector = self.adapter.embed_query(text).await?;
        let hits = self.search(&vector, k, max_tier).await?;
        result.incompatible_chunks = hits.incompatible;
        result.hits = hits
            .hits
            .into_iter()
            .map(|(chunk, score)| to_hit(chunk, score))
            .collect();

        let delta = ProcessingStats {
            queries_executed: 1,
            ..Default::default()
        };
        if let Err(e) = self.catalog.add_stats(&delta).await {
            warn!(error = %e, "could not count query");
        }

        debug!(hits = result.hits.len(), max_tier = %max_tier, "query answered");
        Ok(result)
    }

    async fn search(
        &self,
        vector: &TaggedVector,
        k: usize,
        max_tier: PrivacyTier,
    ) -> Result<crate::store::SearchOutcome, QueryError> {
        let live = self.catalog.live_document_ids().await?;
        let collections: Vec<&str> = PrivacyTier::up_to(max_tier)
            .map(|t| t.collection())
            .collect();
        let outcome = self
            .store
            .search(&collections, vector, k, max_tier, &live)
            .await?;

        if outcome.incompatible > 0 {
            let stored = outcome
                .incompatible_model
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            if outcome.hits.is_empty() {
                return Err(EmbeddingError::ModelMismatch {
                    stored,
                    active: vector.model.clone(),
                }
                .into());
            }
            warn!(
                skipped = outcome.incompatible,
                stored = %stored,
                active = %vector.model,
                "some chunks were embedded by another model; run `docintel reembed`"
            );
        }
        Ok(outcome)
    }

    /// Documents most similar to the one at `path`, plus wiki-link
    /// annotations. Only chunks at or below `max_tier` take part on either
    /// side.
    pub async fn related(
        &self,
        path: &Path,
        max_tier: PrivacyTier,
        k: Option<usize>,
    ) -> Result<Vec<RelatedDocument>, QueryError> {
        let k = self.clamp_k(k);
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let doc = self
            .catalog
            .get(&path)
            .await?
            .filter(|d| d.status == crate::models::ExtractionStatus::Succeeded)
            .ok_or_else(|| QueryError::NotIndexed(path.display().to_string()))?;

        let own: Vec<StoredChunk> = self
            .store
            .chunks_for_document(&doc.id, max_tier)
            .await?
            .into_iter()
            .filter(|c| c.model == self.adapter.model_id() && c.vector.len() == self.adapter.dims())
            .collect();
        if own.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let query = TaggedVector {
            model: self.adapter.model_id().to_string(),
            values: mean_vector(&own),
        };
        // Over-fetch: several chunks per document collapse into one result.
        let candidates = (k + 1) * 8 + own.len();
        let outcome = self.search(&query, candidates, max_tier).await?;

        let mut best: HashMap<String, (f32, PrivacyTier, String)> = HashMap::new();
        for (chunk, score) in outcome.hits {
            if chunk.document_id == doc.id {
                continue;
            }
            let entry = best
                .entry(chunk.document_id.clone())
                .or_insert((score, chunk.tier, chunk.text.clone()));
            if score > entry.0 {
                entry.0 = score;
                entry.2 = chunk.text.clone();
            }
            entry.1 = entry.1.max(chunk.tier);
        }

        let mut related = Vec::with_capacity(best.len());
        for (document_id, (score, tier, best_chunk)) in best {
            let Some(other) = self.catalog.get_by_id(&document_id).await? else {
                continue;
            };
            let linked = links::links_to(&doc.links, &other.path.to_string_lossy())
                || links::links_to(&other.links, &doc.path.to_string_lossy());
            related.push(RelatedDocument {
                document_id,
                path: other.path,
                score,
                tier,
                linked,
                best_chunk,
            });
        }
        related.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
        });
        related.truncate(k);
        Ok(related)
    }
}

fn to_hit(chunk: StoredChunk, score: f32) -> SearchHit {
    SearchHit {
        chunk_id: chunk.id,
        document_id: chunk.document_id,
        source_path: chunk.metadata.source_path.clone(),
        position: chunk.position,
        tier: chunk.tier,
        score,
        text: chunk.text,
        metadata: chunk.metadata,
        ingested_seq: chunk.ingested_seq,
    }
}

fn mean_vector(chunks: &[StoredChunk]) -> Vec<f32> {
    let dims = chunks.first().map(|c| c.vector.len()).unwrap_or(0);
    let mut mean = vec![0.0f32; dims];
    for chunk in chunks {
        for (m, v) in mean.iter_mut().zip(&chunk.vector) {
            *m += v;
        }
    }
    let n = chunks.len().max(1) as f32;
    for m in &mut mean {
        *m /= n;
    }
    mean
}

/// Shorten `text` to at most `max_chars` characters for display.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}
