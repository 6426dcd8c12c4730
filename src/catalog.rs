//! Document index and lifetime counters (`<store>/catalog.sqlite`).
//!
//! A document row whose status is `succeeded` makes the chunks carrying its
//! id visible to search. Writing that row is the commit point of an
//! ingestion: it happens in one transaction with the run's counter delta for
//! the document, after every chunk is already in its collection.
//!
//! While a sync writes chunks for a new document id, the id is recorded in
//! `in_flight` so garbage collection in another process leaves them alone.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::db;
use crate::error::{FailureCategory, StoreError};
use crate::migrate;
use crate::models::{Document, ExtractionStatus, PrivacyTier};
use crate::stats::ProcessingStats;

const NAME: &str = "catalog";

fn err(e: sqlx::Error) -> StoreError {
    StoreError::from_sqlx(NAME, e)
}

pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub async fn open(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join("catalog.sqlite");
        let pool = db::connect(&path).await.map_err(err)?;
        if !db::is_intact(&pool).await.map_err(err)? {
            return Err(StoreError::Corrupt {
                collection: NAME.to_string(),
                reason: format!("integrity check failed for {}", path.display()),
            });
        }
        migrate::migrate_catalog(&pool).await.map_err(err)?;
        Ok(Self { pool })
    }

    pub async fn get(&self, path: &Path) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE path = ?")
            .bind(path_key(path))
            .fetch_optional(&self.pool)
            .await
            .map_err(err)?;
        Ok(row.as_ref().map(decode_row))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(err)?;
        Ok(row.as_ref().map(decode_row))
    }

    pub async fn list(&self) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query("SELECT * FROM documents ORDER BY path")
            .fetch_all(&self.pool)
            .await
            .map_err(err)?;
        Ok(rows.iter().map(decode_row).collect())
    }

    /// Documents at or below `root`.
    pub async fn documents_under(&self, root: &Path) -> Result<Vec<Document>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.path.starts_with(root))
            .collect())
    }

    /// Ids of documents whose chunks search may return.
    pub async fn live_document_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE status = 'succeeded'")
                .fetch_all(&self.pool)
                .await
                .map_err(err)?;
        Ok(ids.into_iter().collect())
    }

    /// Ids whose chunks must survive garbage collection: visible and
    /// pending documents plus every id a sync is writing.
    pub async fn protected_document_ids(&self) -> Result<HashSet<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM documents WHERE status IN ('succeeded', 'pending') UNION SELECT id FROM in_flight",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(err)?;
        Ok(ids.into_iter().collect())
    }

    /// Record a document as queued and its id as in flight. A row that is
    /// currently visible is left alone so the indexed version stays
    /// searchable until it is replaced.
    pub async fn mark_pending(&self, doc: &Document) -> Result<(), StoreError> {
        let key = path_key(&doc.path);
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(err)?;
        sqlx::query(
            r#"
            INSERT INTO documents (path, id, format, size_bytes, modified_at, content_hash, status, chunk_count, max_tier, error, failure_category, links_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, NULL, NULL, NULL, '[]', ?)
            ON CONFLICT(path) DO UPDATE SET
                id = excluded.id,
                format = excluded.format,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                content_hash = excluded.content_hash,
                status = 'pending',
                chunk_count = 0,
                max_tier = NULL,
                error = NULL,
                failure_category = NULL,
                updated_at = excluded.updated_at
            WHERE documents.status != 'succeeded'
            "#,
        )
        .bind(&key)
        .bind(&doc.id)
        .bind(&doc.format)
        .bind(doc.size_bytes as i64)
        .bind(doc.modified_at)
        .bind(&doc.content_hash)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(err)?;

        sqlx::query(
            "INSERT INTO in_flight (path, id, started_at) VALUES (?, ?, ?) ON CONFLICT(path) DO UPDATE SET id = excluded.id, started_at = excluded.started_at",
        )
        .bind(&key)
        .bind(&doc.id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(err)?;

        tx.commit().await.map_err(err)?;
        Ok(())
    }

    /// Forget the in-flight id of `path` without committing a row.
    pub async fn release(&self, path: &Path) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM in_flight WHERE path = ?")
            .bind(path_key(path))
            .execute(&self.pool)
            .await
            .map_err(err)?;
        Ok(())
    }

    /// Write the final row for `doc` and add `delta` to the lifetime
    /// counters in one transaction. Returns the id the row carried before,
    /// when it differs from `doc.id`.
    pub async fn commit(
        &self,
        doc: &Document,
        delta: &ProcessingStats,
    ) -> Result<Option<String>, StoreError> {
        let key = path_key(&doc.path);
        let links = serde_json::to_string(&doc.links).unwrap_or_else(|_| "[]".into());

        let mut tx = self.pool.begin().await.map_err(err)?;
        let previous: Option<String> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(err)?;

        sqlx::query(
            r#"
            INSERT INTO documents (path, id, format, size_bytes, modified_at, content_hash, status, chunk_count, max_tier, error, failure_category, links_json, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                id = excluded.id,
                format = excluded.format,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                content_hash = excluded.content_hash,
                status = excluded.status,
                chunk_count = excluded.chunk_count,
                max_tier = excluded.max_tier,
                error = excluded.error,
                failure_category = excluded.failure_category,
                links_json = excluded.links_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key)
        .bind(&doc.id)
        .bind(&doc.format)
        .bind(doc.size_bytes as i64)
        .bind(doc.modified_at)
        .bind(&doc.content_hash)
        .bind(doc.status.as_str())
        .bind(doc.chunk_count as i64)
        .bind(doc.max_tier.map(|t| t.rank()))
        .bind(&doc.error)
        .bind(doc.failure.map(|c| c.as_str()))
        .bind(&links)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(err)?;

        sqlx::query("DELETE FROM in_flight WHERE path = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await
            .map_err(err)?;

        for (k, v) in delta.to_pairs() {
            sqlx::query(
                "INSERT INTO stats (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
            )
            .bind(&k)
            .bind(v as i64)
            .execute(&mut *tx)
            .await
            .map_err(err)?;
        }

        tx.commit().await.map_err(err)?;
        Ok(previous.filter(|p| *p != doc.id))
    }

    /// Update the modification time and id of an unchanged document that
    /// has no chunks.
    pub async fn touch(&self, path: &Path, modified_at: i64, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE documents SET modified_at = ?, id = ? WHERE path = ?")
            .bind(modified_at)
            .bind(id)
            .bind(path_key(path))
            .execute(&self.pool)
            .await
            .map_err(err)?;
        Ok(())
    }

    /// Take a visible document out of search. Returns false when the row
    /// was not visible.
    pub async fn hide(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'pending', updated_at = ? WHERE id = ? AND status = 'succeeded'",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(err)?;
        Ok(result.rows_affected() > 0)
    }

    /// Make a document hidden by [`Catalog::hide`] visible again.
    pub async fn reveal(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE documents SET status = 'succeeded', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(err)?;
        Ok(())
    }

    /// Settle a document as failed. It stays out of search and the next
    /// sync ingests it again.
    pub async fn mark_failed(
        &self,
        id: &str,
        category: FailureCategory,
        reason: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE documents SET status = 'failed', failure_category = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(category.as_str())
        .bind(reason)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(err)?;
        Ok(())
    }

    pub async fn set_max_tier(&self, id: &str, tier: PrivacyTier) -> Result<(), StoreError> {
        sqlx::query("UPDATE documents SET max_tier = ?, updated_at = ? WHERE id = ?")
            .bind(tier.rank())
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(err)?;
        Ok(())
    }

    /// Drop the row for `path`, returning the id it carried.
    pub async fn remove(&self, path: &Path) -> Result<Option<String>, StoreError> {
        let id: Option<String> =
            sqlx::query_scalar("DELETE FROM documents WHERE path = ? RETURNING id")
                .bind(path_key(path))
                .fetch_optional(&self.pool)
                .await
                .map_err(err)?;
        Ok(id)
    }

    pub async fn add_stats(&self, delta: &ProcessingStats) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(err)?;
        for (k, v) in delta.to_pairs() {
            sqlx::query(
                "INSERT INTO stats (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = value + excluded.value",
            )
            .bind(&k)
            .bind(v as i64)
            .execute(&mut *tx)
            .await
            .map_err(err)?;
        }
        tx.commit().await.map_err(err)?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<ProcessingStats, StoreError> {
        let rows = sqlx::query("SELECT key, value FROM stats")
            .fetch_all(&self.pool)
            .await
            .map_err(err)?;
        Ok(ProcessingStats::from_pairs(rows.iter().map(|r| {
            let value: i64 = r.get("value");
            (r.get::<String, _>("key"), value.max(0) as u64)
        })))
    }

    pub async fn status_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(err)?;
        Ok(rows
            .iter()
            .map(|r| {
                let n: i64 = r.get("n");
                (r.get::<String, _>("status"), n as u64)
            })
            .collect())
    }

    pub async fn last_update(&self) -> Result<Option<i64>, StoreError> {
        sqlx::query_scalar("SELECT MAX(updated_at) FROM documents")
            .fetch_one(&self.pool)
            .await
            .map_err(err)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn decode_row(row: &SqliteRow) -> Document {
    let path: String = row.get("path");
    let size: i64 = row.get("size_bytes");
    let chunk_count: i64 = row.get("chunk_count");
    let status: String = row.get("status");
    let max_tier: Option<i64> = row.get("max_tier");
    let failure: Option<String> = row.get("failure_category");
    let links: String = row.get("links_json");
    Document {
        id: row.get("id"),
        path: PathBuf::from(path),
        format: row.get("format"),
        size_bytes: size.max(0) as u64,
        modified_at: row.get("modified_at"),
        content_hash: row.get("content_hash"),
        status: ExtractionStatus::parse(&status),
        chunk_count: chunk_count.max(0) as usize,
        max_tier: max_tier.map(PrivacyTier::from_rank),
        error: row.get("error"),
        failure: failure.as_deref().and_then(FailureCategory::parse),
        links: serde_json::from_str(&links).unwrap_or_default(),
        updated_at: row.get("updated_at"),
    }
}
