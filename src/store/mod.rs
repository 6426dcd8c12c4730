//! Tiered vector store.
//!
//! Chunks live in one SQLite collection per [`PrivacyTier`] under
//! `<store>/collections/`. Each collection has a single writer at a time
//! and is taken out of service after a failed write without affecting the
//! others.
//!
//! Search never opens a collection above the requested ceiling, filters
//! `tier <= ceiling` in SQL and re-checks every hit before returning it.
//! Only chunks of *visible* documents (committed in the catalog) are
//! returned, so a document being re-ingested is seen either entirely in its
//! old version or entirely in its new one.

mod collection;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::{cosine_similarity, TaggedVector};
use crate::error::StoreError;
use crate::models::{Chunk, PrivacyTier, StoredChunk};
use collection::Collection;

/// Per-collection counters for `stats` and `health`.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub tier: PrivacyTier,
    pub chunks: u64,
    pub available: bool,
    pub models: Vec<ModelCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelCount {
    pub model: String,
    pub dims: usize,
    pub chunks: u64,
}

/// Result of a similarity search.
#[derive(Debug, Default)]
pub struct SearchOutcome {
    /// Best matches first, at most `k`.
    pub hits: Vec<(StoredChunk, f32)>,
    /// Visible chunks skipped because they were embedded by another model.
    pub incompatible: u64,
    /// A model seen among the incompatible chunks.
    pub incompatible_model: Option<String>,
}

pub struct VectorStore {
    dir: PathBuf,
    collections: Vec<Collection>,
    seq: AtomicI64,
}

impl VectorStore {
    /// Open (creating if needed) every tier collection under `dir`.
    pub async fn open(dir: &Path, cache_entries: usize) -> Result<Self, StoreError> {
        let dir = dir.join("collections");
        std::fs::create_dir_all(&dir)?;

        let mut collections = Vec::with_capacity(PrivacyTier::ALL.len());
        let mut max_seq = 0i64;
        for tier in PrivacyTier::ALL {
            let collection = Collection::open(&dir, tier, cache_entries).await?;
            max_seq = max_seq.max(collection.max_seq().await?);
            collections.push(collection);
        }

        debug!(dir = %dir.display(), "opened vector store");
        Ok(Self {
            dir,
            collections,
            seq: AtomicI64::new(max_seq),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Name of the collection a chunk of `tier` belongs to.
    pub fn collection_for(tier: PrivacyTier) -> &'static str {
        tier.collection()
    }

    fn collection(&self, name: &str) -> Result<&Collection, StoreError> {
        let tier: PrivacyTier = name.parse().map_err(|e: String| StoreError::Unavailable {
            collection: name.to_string(),
            reason: e,
        })?;
        self.by_tier(tier).ok_or_else(|| StoreError::Unavailable {
            collection: name.to_string(),
            reason: "no such collection".to_string(),
        })
    }

    fn by_tier(&self, tier: PrivacyTier) -> Option<&Collection> {
        self.collections.iter().find(|c| c.tier == tier)
    }

    /// Next ingestion sequence number. Larger means more recent.
    pub fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_available(&self, collection: &str) -> bool {
        self.collection(collection)
            .map(|c| c.is_available())
            .unwrap_or(false)
    }

    /// Insert or replace one chunk. A chunk with the same id in any other
    /// collection is removed once the new copy is written.
    pub async fn upsert(
        &self,
        collection: &str,
        chunk: &Chunk,
        vector: &TaggedVector,
    ) -> Result<(), StoreError> {
        let target = self.collection(collection)?;
        target.write(&[(chunk, vector)], self.next_seq()).await?;
        for other in self.collections.iter().filter(|c| c.tier != target.tier) {
            other.delete_chunk(&chunk.id).await?;
        }
        Ok(())
    }

    /// Insert or replace several chunks of one document in a single
    /// transaction.
    pub async fn upsert_batch(
        &self,
        collection: &str,
        items: &[(&Chunk, &TaggedVector)],
        seq: i64,
    ) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        self.collection(collection)?.write(items, seq).await
    }

    /// Remove a document's chunks from one collection. Idempotent.
    pub async fn delete(&self, collection: &str, document_id: &str) -> Result<u64, StoreError> {
        self.collection(collection)?.delete_document(document_id).await
    }

    /// Remove a document's chunks from every collection that is in
    /// service. A collection that fails is taken out of service and
    /// skipped; chunks left there belong to no visible document and are
    /// collected later. Only corruption is returned as an error.
    pub async fn delete_document(&self, document_id: &str) -> Result<u64, StoreError> {
        let mut removed = 0;
        for collection in self.collections.iter().filter(|c| c.is_available()) {
            match collection.delete_document(document_id).await {
                Ok(n) => removed += n,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(document = %document_id, error = %e, "skipping collection"),
            }
        }
        Ok(removed)
    }

    /// Move a chunk into the collection for `to`. The new copy is written
    /// before the old one is deleted, so a failed write leaves the chunk
    /// where it was.
    pub async fn move_chunk(&self, chunk: &StoredChunk, to: PrivacyTier) -> Result<(), StoreError> {
        let from = self.collection(chunk.tier.collection())?;
        let target = self.collection(to.collection())?;
        let (moved, vector) = restore(chunk, chunk.id.clone(), chunk.document_id.clone(), to);
        target
            .write(&[(&moved, &vector)], chunk.ingested_seq)
            .await?;
        if from.tier != target.tier {
            from.delete_chunk(&chunk.id).await?;
        }
        Ok(())
    }

    /// Copy every chunk of `from_id` under the document id `to_id`,
    /// keeping tiers and vectors. Returns the number of chunks copied.
    pub async fn copy_document(
        &self,
        from_id: &str,
        to_id: &str,
        seq: i64,
    ) -> Result<u64, StoreError> {
        let mut copied = 0;
        for collection in &self.collections {
            let restored: Vec<(Chunk, TaggedVector)> = collection
                .chunks_for_document(from_id)
                .await?
                .iter()
                .map(|c| restore(c, Chunk::chunk_id(to_id, c.position), to_id.to_string(), c.tier))
                .collect();
            if restored.is_empty() {
                continue;
            }
            let items: Vec<(&Chunk, &TaggedVector)> = restored.iter().map(|(c, v)| (c, v)).collect();
            collection.write(&items, seq).await?;
            copied += items.len() as u64;
        }
        Ok(copied)
    }

    pub async fn replace_vector(
        &self,
        chunk: &StoredChunk,
        vector: &TaggedVector,
    ) -> Result<(), StoreError> {
        self.collection(chunk.tier.collection())?
            .replace_vector(&chunk.id, vector)
            .await
    }

    /// All chunks of a document at or below `ceiling`, by position.
    pub async fn chunks_for_document(
        &self,
        document_id: &str,
        ceiling: PrivacyTier,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let mut out = Vec::new();
        for tier in PrivacyTier::up_to(ceiling) {
            if let Some(collection) = self.by_tier(tier) {
                out.extend(collection.chunks_for_document(document_id).await?);
            }
        }
        out.sort_by_key(|c| c.position);
        Ok(out)
    }

    /// Every chunk in one collection.
    pub async fn chunks_in(&self, collection: &str) -> Result<Vec<StoredChunk>, StoreError> {
        self.collection(collection)?.all().await
    }

    /// Up to `limit` chunks across all collections whose vector was not
    /// produced by `model` with `dims` dimensions.
    pub async fn stale_chunks(
        &self,
        model: &str,
        dims: usize,
        limit: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let mut out = Vec::new();
        for collection in &self.collections {
            if out.len() >= limit {
                break;
            }
            out.extend(collection.stale(model, dims, limit - out.len()).await?);
        }
        Ok(out)
    }

    /// Document ids that have chunks, per collection in service. A
    /// collection that cannot be read is left out.
    pub async fn document_ids(&self) -> Result<Vec<(PrivacyTier, HashSet<String>)>, StoreError> {
        let mut out = Vec::with_capacity(self.collections.len());
        for collection in self.collections.iter().filter(|c| c.is_available()) {
            match collection.document_ids().await {
                Ok(ids) => out.push((collection.tier, ids)),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(collection = collection.name(), error = %e, "skipping collection"),
            }
        }
        Ok(out)
    }

    /// Delete the chunks of documents listed in `stored` but not in `keep`.
    ///
    /// `stored` must be read before `keep`: an id registered after the
    /// listing is then either absent from `stored` or present in `keep`.
    pub async fn remove_orphans(
        &self,
        stored: &[(PrivacyTier, HashSet<String>)],
        keep: &HashSet<String>,
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        for (tier, ids) in stored {
            let Some(collection) = self.by_tier(*tier) else { continue };
            for orphan in ids.difference(keep) {
                match collection.delete_document(orphan).await {
                    Ok(n) => removed += n,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(collection = collection.name(), error = %e, "skipping collection");
                        break;
                    }
                }
            }
        }
        if removed > 0 {
            info!(chunks = removed, "removed orphaned chunks");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<Vec<CollectionStats>, StoreError> {
        let mut out = Vec::with_capacity(self.collections.len());
        for collection in &self.collections {
            let models = collection
                .models()
                .await?
                .into_iter()
                .map(|(model, dims, chunks)| ModelCount {
                    model,
                    dims,
                    chunks,
                })
                .collect();
            out.push(CollectionStats {
                name: collection.name().to_string(),
                tier: collection.tier,
                chunks: collection.count().await?,
                available: collection.is_available(),
                models,
            });
        }
        Ok(out)
    }

    /// Top-`k` chunks from `collections` most similar to `query`.
    ///
    /// Collections above `ceiling` are skipped without being read. Only
    /// chunks of documents in `visible` whose vector has the query's model
    /// and dimensionality are scored. Ties on score go to the most recently
    /// ingested chunk, then to the lower chunk id.
    pub async fn search(
        &self,
        collections: &[&str],
        query: &TaggedVector,
        k: usize,
        ceiling: PrivacyTier,
        visible: &HashSet<String>,
    ) -> Result<SearchOutcome, StoreError> {
        let mut outcome = SearchOutcome::default();
        if k == 0 {
            return Ok(outcome);
        }

        let mut seen: HashSet<&str> = HashSet::new();
        let mut scored: Vec<(StoredChunk, f32)> = Vec::new();
        for name in collections {
            let collection = self.collection(name)?;
            if collection.tier > ceiling || !seen.insert(collection.name()) {
                continue;
            }
            let rows = collection.candidates(ceiling).await?;
            for row in rows.iter() {
                if row.tier > ceiling || !visible.contains(&row.document_id) {
                    continue;
                }
                if row.model != query.model || row.vector.len() != query.dims() {
                    outcome.incompatible += 1;
                    if outcome.incompatible_model.is_none() {
                        outcome.incompatible_model = Some(row.model.clone());
                    }
                    continue;
                }
                let score = cosine_similarity(&query.values, &row.vector);
                scored.push((row.clone(), score));
            }
        }

        scored.sort_by(|(a, sa), (b, sb)| {
            sb.total_cmp(sa)
                .then(b.ingested_seq.cmp(&a.ingested_seq))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);

        // Final gate: nothing above the ceiling leaves the store.
        let before = scored.len();
        scored.retain(|(c, _)| c.tier <= ceiling);
        if scored.len() != before {
            warn!(
                dropped = before - scored.len(),
                "search dropped chunks above the tier ceiling"
            );
        }

        outcome.hits = scored;
        Ok(outcome)
    }

    /// Chunk counts per document id across all collections.
    pub async fn document_chunk_counts(&self) -> Result<HashMap<String, u64>, StoreError> {
        let mut out: HashMap<String, u64> = HashMap::new();
        for collection in &self.collections {
            for chunk in collection.all().await? {
                *out.entry(chunk.document_id).or_insert(0) += 1;
            }
        }
        Ok(out)
    }
}

/// A stored chunk as a writable chunk and vector.
fn restore(
    chunk: &StoredChunk,
    id: String,
    document_id: String,
    tier: PrivacyTier,
) -> (Chunk, TaggedVector) {
    (
        Chunk {
            id,
            document_id,
            position: chunk.position,
            text: chunk.text.clone(),
            tier,
            metadata: chunk.metadata.clone(),
            state: crate::models::ChunkState::Indexed,
        },
        TaggedVector {
            model: chunk.model.clone(),
            values: chunk.vector.clone(),
        },
    )
}
