//! A single tier collection: one SQLite file, one writer at a time.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

use crate::db;
use crate::embedding::{blob_to_vec, vec_to_blob, TaggedVector};
use crate::error::StoreError;
use crate::migrate;
use crate::models::{Chunk, ChunkMetadata, PrivacyTier, StoredChunk};

pub(crate) struct Collection {
    pub(crate) tier: PrivacyTier,
    pool: SqlitePool,
    writer: tokio::sync::Mutex<()>,
    available: AtomicBool,
    cache: Mutex<Option<Arc<Vec<StoredChunk>>>>,
    cache_entries: usize,
}

impl Collection {
    pub(crate) async fn open(
        dir: &Path,
        tier: PrivacyTier,
        cache_entries: usize,
    ) -> Result<Self, StoreError> {
        let name = tier.collection();
        let path = dir.join(format!("{}.sqlite", name));
        let pool = db::connect(&path)
            .await
            .map_err(|e| StoreError::from_sqlx(name, e))?;

        let intact = db::is_intact(&pool)
            .await
            .map_err(|e| StoreError::from_sqlx(name, e))?;
        if !intact {
            return Err(StoreError::Corrupt {
                collection: name.to_string(),
                reason: format!("integrity check failed for {}", path.display()),
            });
        }

        migrate::migrate_collection(&pool)
            .await
            .map_err(|e| StoreError::from_sqlx(name, e))?;

        Ok(Self {
            tier,
            pool,
            writer: tokio::sync::Mutex::new(()),
            available: AtomicBool::new(true),
            cache: Mutex::new(None),
            cache_entries,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.tier.collection()
    }

    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Convert a failed write, taking the collection out of service.
    fn write_failed(&self, err: sqlx::Error) -> StoreError {
        let err = StoreError::from_sqlx(self.name(), err);
        self.available.store(false, Ordering::SeqCst);
        error!(collection = self.name(), error = %err, "collection marked unavailable");
        err
    }

    fn read_failed(&self, err: sqlx::Error) -> StoreError {
        StoreError::from_sqlx(self.name(), err)
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable {
                collection: self.name().to_string(),
                reason: "disabled after an earlier write failure".to_string(),
            })
        }
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    /// Insert or replace `items` in one transaction, all stamped with `seq`.
    pub(crate) async fn write(
        &self,
        items: &[(&Chunk, &TaggedVector)],
        seq: i64,
    ) -> Result<(), StoreError> {
        for (chunk, _) in items {
            if chunk.tier != self.tier {
                return Err(StoreError::Misrouted {
                    chunk: chunk.id.clone(),
                    tier: chunk.tier.to_string(),
                    collection: self.name().to_string(),
                });
            }
        }

        self.ensure_writable()?;
        let _guard = self.writer.lock().await;

        let mut tx = self.pool.begin().await.map_err(|e| self.write_failed(e))?;
        for (chunk, vector) in items {
            let metadata = serde_json::to_string(&chunk.metadata).unwrap_or_else(|_| "{}".into());
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, position, text, tier, model, dims, vector, metadata_json, ingested_seq)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    document_id = excluded.document_id,
                    position = excluded.position,
                    text = excluded.text,
                    tier = excluded.tier,
                    model = excluded.model,
                    dims = excluded.dims,
                    vector = excluded.vector,
                    metadata_json = excluded.metadata_json,
                    ingested_seq = excluded.ingested_seq
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.position as i64)
            .bind(&chunk.text)
            .bind(chunk.tier.rank())
            .bind(&vector.model)
            .bind(vector.dims() as i64)
            .bind(vec_to_blob(&vector.values))
            .bind(&metadata)
            .bind(seq)
            .execute(&mut *tx)
            .await
            .map_err(|e| self.write_failed(e))?;
        }
        tx.commit().await.map_err(|e| self.write_failed(e))?;
        self.invalidate();

        debug!(collection = self.name(), chunks = items.len(), "wrote chunks");
        Ok(())
    }

    pub(crate) async fn delete_document(&self, document_id: &str) -> Result<u64, StoreError> {
        self.ensure_writable()?;
        let _guard = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_failed(e))?;
        if result.rows_affected() > 0 {
            self.invalidate();
        }
        Ok(result.rows_affected())
    }

    pub(crate) async fn delete_chunk(&self, chunk_id: &str) -> Result<u64, StoreError> {
        self.ensure_writable()?;
        let _guard = self.writer.lock().await;
        let result = sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_failed(e))?;
        if result.rows_affected() > 0 {
            self.invalidate();
        }
        Ok(result.rows_affected())
    }

    pub(crate) async fn replace_vector(
        &self,
        chunk_id: &str,
        vector: &TaggedVector,
    ) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let _guard = self.writer.lock().await;
        sqlx::query("UPDATE chunks SET model = ?, dims = ?, vector = ? WHERE id = ?")
            .bind(&vector.model)
            .bind(vector.dims() as i64)
            .bind(vec_to_blob(&vector.values))
            .bind(chunk_id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.write_failed(e))?;
        self.invalidate();
        Ok(())
    }

    pub(crate) async fn document_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT DISTINCT document_id FROM chunks")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.read_failed(e))?;
        Ok(ids.into_iter().collect())
    }

    pub(crate) async fn max_seq(&self) -> Result<i64, StoreError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(ingested_seq) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.read_failed(e))?;
        Ok(max.unwrap_or(0))
    }

    pub(crate) async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.read_failed(e))?;
        Ok(count as u64)
    }

    /// `(model, dims, chunk count)` for every embedding model present.
    pub(crate) async fn models(&self) -> Result<Vec<(String, usize, u64)>, StoreError> {
        let rows = sqlx::query(
            "SELECT model, dims, COUNT(*) AS n FROM chunks GROUP BY model, dims ORDER BY model",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.read_failed(e))?;
        Ok(rows
            .iter()
            .map(|r| {
                let dims: i64 = r.get("dims");
                let n: i64 = r.get("n");
                (r.get("model"), dims as usize, n as u64)
            })
            .collect())
    }

    pub(crate) async fn chunks_for_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY position")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.read_failed(e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    pub(crate) async fn all(&self) -> Result<Vec<StoredChunk>, StoreError> {
        Ok(self.snapshot().await?.as_ref().clone())
    }

    /// Chunks not embedded with `model`/`dims`, oldest first.
    pub(crate) async fn stale(
        &self,
        model: &str,
        dims: usize,
        limit: usize,
    ) -> Result<Vec<StoredChunk>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE NOT (model = ? AND dims = ?) ORDER BY ingested_seq, id LIMIT ?",
        )
        .bind(model)
        .bind(dims as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.read_failed(e))?;
        Ok(rows.iter().map(decode_row).collect())
    }

    /// Rows at or below `ceiling`, from the decoded cache when the
    /// collection fits in it.
    pub(crate) async fn candidates(
        &self,
        ceiling: PrivacyTier,
    ) -> Result<Arc<Vec<StoredChunk>>, StoreError> {
        if let Some(cached) = self.cached() {
            return Ok(cached);
        }
        let rows = sqlx::query("SELECT * FROM chunks WHERE tier <= ?")
            .bind(ceiling.rank())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.read_failed(e))?;
        let decoded: Vec<StoredChunk> = rows.iter().map(decode_row).collect();
        if decoded.len() <= self.cache_entries && ceiling >= self.tier {
            let decoded = Arc::new(decoded);
            if let Ok(mut cache) = self.cache.lock() {
                *cache = Some(decoded.clone());
            }
            return Ok(decoded);
        }
        Ok(Arc::new(decoded))
    }

    async fn snapshot(&self) -> Result<Arc<Vec<StoredChunk>>, StoreError> {
        self.candidates(PrivacyTier::Personal).await
    }

    fn cached(&self) -> Option<Arc<Vec<StoredChunk>>> {
        self.cache.lock().ok().and_then(|c| c.clone())
    }
}

fn decode_row(row: &SqliteRow) -> StoredChunk {
    let blob: Vec<u8> = row.get("vector");
    let metadata: String = row.get("metadata_json");
    let position: i64 = row.get("position");
    StoredChunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        position: position as usize,
        text: row.get("text"),
        tier: PrivacyTier::from_rank(row.get("tier")),
        model: row.get("model"),
        vector: blob_to_vec(&blob),
        metadata: serde_json::from_str::<ChunkMetadata>(&metadata).unwrap_or_default(),
        ingested_seq: row.get("ingested_seq"),
    }
}
