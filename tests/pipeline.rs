//! End-to-end tests of the engine: sync, search under tier ceilings,
//! failure handling and store maintenance.
//!
//! Every test runs against a fresh store in a temp directory with the
//! offline hash embedder, so no network or model download is needed.

use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use docintel::config::{Config, KeywordRule};
use docintel::embedding::{Embedder, HashEmbedder};
use docintel::engine::{self, Engine};
use docintel::error::{EmbeddingError, FailureCategory, QueryError};
use docintel::models::PrivacyTier;
use docintel::progress::NoProgress;

struct Workspace {
    _tmp: TempDir,
    store: PathBuf,
    docs: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let store = tmp.path().join("store");
        let docs = tmp.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        Self {
            _tmp: tmp,
            store,
            docs,
        }
    }

    fn write(&self, name: &str, body: impl AsRef<[u8]>) -> PathBuf {
        let path = self.docs.join(name);
        fs::write(&path, body).unwrap();
        path
    }

    fn config(&self) -> Config {
        let mut config = Config::with_store_dir(&self.store);
        config.resources.workers = Some(1);
        config.embedding.retry_backoff_ms = 0;
        config
    }
}

async fn sync(engine: &Engine, path: &Path) -> docintel::ingest::ProcessingReport {
    engine
        .sync(&[path.to_path_buf()], None, &NoProgress)
        .await
        .unwrap()
}

async fn total_chunks(engine: &Engine) -> u64 {
    engine
        .stats()
        .await
        .unwrap()
        .collections
        .iter()
        .map(|c| c.chunks)
        .sum()
}

fn from_file(source_path: &str, name: &str) -> bool {
    Path::new(source_path)
        .file_name()
        .map(|f| f == name)
        .unwrap_or(false)
}

#[tokio::test]
async fn second_sync_of_unchanged_files_is_a_no_op() {
    let ws = Workspace::new();
    ws.write("one.md", "# Tides\n\nthe lighthouse keeper records the tide every hour.");
    ws.write("two.txt", "notes on rust ownership and borrowing.");
    ws.write("three.md", "gardening notes: tomatoes need full sun and steady water.");
    let engine = Engine::open(ws.config()).await.unwrap();

    let first = sync(&engine, &ws.docs).await;
    assert_eq!(first.documents_total, 3);
    assert_eq!(first.succeeded, 3);
    assert_eq!(first.exit_code(), 0);
    let chunks = total_chunks(&engine).await;
    assert!(chunks >= 3);

    let second = sync(&engine, &ws.docs).await;
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped_unchanged, 3);
    assert_eq!(second.chunks_indexed, 0);
    assert_eq!(second.lifetime, first.lifetime);
    assert_eq!(total_chunks(&engine).await, chunks);
}

#[tokio::test]
async fn one_corrupt_file_does_not_stop_the_batch() {
    let ws = Workspace::new();
    for i in 0..9 {
        ws.write(
            &format!("note{}.md", i),
            format!("note number {} about harbour maintenance and rope.", i),
        );
    }
    let mut broken = b"not a pdf".to_vec();
    broken.extend(std::iter::repeat(0u8).take(256));
    ws.write("broken.pdf", &broken);

    let engine = Engine::open(ws.config()).await.unwrap();
    let report = sync(&engine, &ws.docs).await;

    assert_eq!(report.documents_total, 10);
    assert_eq!(report.succeeded, 9);
    assert_eq!(report.failed, 1);
    assert_eq!(
        report.failures_by_category.get(&FailureCategory::Extraction),
        Some(&1)
    );
    assert!(report.failures[0].path.ends_with("broken.pdf"));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(
        report.lifetime.failures.get(&FailureCategory::Extraction),
        Some(&1)
    );

    // Extraction failures are settled: the same bytes are not retried.
    let again = sync(&engine, &ws.docs).await;
    assert_eq!(again.skipped_unchanged, 10);
    assert_eq!(again.failed, 0);
}

#[tokio::test]
async fn personal_document_never_reaches_public_queries() {
    let ws = Workspace::new();
    ws.write("public.md", "the lighthouse keeper logs the tide at dawn.");
    let private = ws.write(
        "record.md",
        "lighthouse keeper employee record. ssn 123-45-6789 kept on file.",
    );

    let scan = engine::privacy_scan(&ws.config(), &[private.clone()], None).unwrap();
    assert_eq!(scan.items.len(), 1);
    assert_eq!(scan.items[0].tier, PrivacyTier::Personal);
    assert!(scan.items[0].signals.iter().any(|s| s.contains("ssn")));
    // Scanning writes nothing.
    assert!(!ws.store.join("catalog.sqlite").exists());

    let engine = Engine::open(ws.config()).await.unwrap();
    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 2);
    assert!(report.tier_counts.get(&PrivacyTier::Personal).copied().unwrap_or(0) >= 1);

    let public = engine
        .query("lighthouse keeper record", PrivacyTier::Public, Some(10))
        .await
        .unwrap();
    assert!(!public.hits.is_empty());
    assert!(public
        .hits
        .iter()
        .all(|h| !from_file(&h.source_path, "record.md")));

    let personal = engine
        .query("lighthouse keeper record", PrivacyTier::Personal, Some(10))
        .await
        .unwrap();
    assert!(personal
        .hits
        .iter()
        .any(|h| from_file(&h.source_path, "record.md")));
}

#[tokio::test]
async fn no_hit_exceeds_the_tier_ceiling() {
    let ws = Workspace::new();
    ws.write("a.md", "quarterly planning notes for the harbour crew.");
    ws.write("b.md", "our customer contract for harbour repairs is attached.");
    ws.write("c.md", "harbour crew member phone 555-123-4567 and ssn 987-65-4321.");
    ws.write("d.md", "confidential harbour budget. password is tide.");

    let engine = Engine::open(ws.config()).await.unwrap();
    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 4);

    for ceiling in PrivacyTier::ALL {
        for q in ["harbour", "crew notes", "contract", "ssn phone", "budget password"] {
            let result = engine.query(q, ceiling, Some(50)).await.unwrap();
            for hit in &result.hits {
                assert!(
                    hit.tier <= ceiling,
                    "{} hit at {} under ceiling {}",
                    hit.source_path,
                    hit.tier,
                    ceiling
                );
            }
        }
    }

    let all = engine
        .query("harbour", PrivacyTier::Personal, Some(50))
        .await
        .unwrap();
    let tiers: Vec<PrivacyTier> = all.hits.iter().map(|h| h.tier).collect();
    assert!(tiers.contains(&PrivacyTier::Public));
    assert!(tiers.contains(&PrivacyTier::Business));
    assert!(tiers.contains(&PrivacyTier::Personal));
}

#[tokio::test]
async fn modified_file_replaces_its_chunks() {
    let ws = Workspace::new();
    let path = ws.write("log.md", "the ferry schedule mentions pelicans nesting.");
    let engine = Engine::open(ws.config()).await.unwrap();
    sync(&engine, &ws.docs).await;

    fs::write(&path, "the ferry schedule now lists winter sailings only.").unwrap();
    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped_unchanged, 0);

    let result = engine
        .query("pelicans nesting", PrivacyTier::Personal, Some(10))
        .await
        .unwrap();
    assert!(result.hits.iter().all(|h| !h.text.contains("pelicans")));
    assert!(result.hits.iter().any(|h| h.text.contains("winter sailings")));
    assert_eq!(total_chunks(&engine).await, 1);
}

#[tokio::test]
async fn deleted_file_is_removed_on_next_sync() {
    let ws = Workspace::new();
    ws.write("keep.md", "anchors and chains for the small boat.");
    let gone = ws.write("gone.md", "sails and masts for the tall ship.");
    let engine = Engine::open(ws.config()).await.unwrap();
    sync(&engine, &ws.docs).await;

    fs::remove_file(&gone).unwrap();
    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.removed, 1);
    assert_eq!(report.skipped_unchanged, 1);

    let result = engine
        .query("sails and masts", PrivacyTier::Personal, Some(10))
        .await
        .unwrap();
    assert!(result
        .hits
        .iter()
        .all(|h| !from_file(&h.source_path, "gone.md")));
}

#[tokio::test]
async fn cancelled_run_leaves_documents_unstarted() {
    let ws = Workspace::new();
    for i in 0..5 {
        ws.write(&format!("f{}.md", i), format!("file {} about knots.", i));
    }
    let engine = Engine::open(ws.config()).await.unwrap();
    engine.cancel_token().cancel();

    let report = sync(&engine, &ws.docs).await;
    assert!(report.cancelled);
    assert_eq!(report.succeeded, 0);
    assert_eq!(report.not_started, 5);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(total_chunks(&engine).await, 0);
}

/// Fails the first `failures` calls, then delegates to the hash embedder.
struct Flaky {
    inner: HashEmbedder,
    failures: AtomicU32,
    calls: AtomicU32,
}

#[async_trait]
impl Embedder for Flaky {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(EmbeddingError::Unavailable("warming up".to_string()));
        }
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn transient_embedding_errors_are_retried() {
    let ws = Workspace::new();
    ws.write("a.md", "buoys mark the channel entrance.");
    let flaky = Arc::new(Flaky {
        inner: HashEmbedder::new(64),
        failures: AtomicU32::new(2),
        calls: AtomicU32::new(0),
    });
    let engine = Engine::open_with(ws.config(), flaky.clone()).await.unwrap();

    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert!(flaky.calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_document() {
    let ws = Workspace::new();
    ws.write("a.md", "buoys mark the channel entrance.");
    let flaky = Arc::new(Flaky {
        inner: HashEmbedder::new(64),
        failures: AtomicU32::new(100),
        calls: AtomicU32::new(0),
    });
    let mut config = ws.config();
    config.embedding.max_retries = 2;
    let engine = Engine::open_with(config, flaky.clone()).await.unwrap();

    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.failed, 1);
    assert_eq!(
        report.failures_by_category.get(&FailureCategory::Embedding),
        Some(&1)
    );
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
}

/// Rejects any batch mentioning "poison".
struct Picky(HashEmbedder);

#[async_trait]
impl Embedder for Picky {
    fn model_id(&self) -> &str {
        self.0.model_id()
    }

    fn dims(&self) -> usize {
        self.0.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.iter().any(|t| t.contains("poison")) {
            return Err(EmbeddingError::Rejected("input refused".to_string()));
        }
        self.0.embed(texts).await
    }
}

#[tokio::test]
async fn permanent_embedding_error_is_not_retried_and_hides_nothing_else() {
    let ws = Workspace::new();
    ws.write("good.md", "seagulls circle the fishing boats.");
    ws.write("bad.md", "poison ivy grows by the seagulls.");
    let engine = Engine::open_with(ws.config(), Arc::new(Picky(HashEmbedder::new(64))))
        .await
        .unwrap();

    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].path.ends_with("bad.md"));

    let result = engine
        .query("seagulls", PrivacyTier::Personal, Some(10))
        .await
        .unwrap();
    assert!(!result.hits.is_empty());
    assert!(result
        .hits
        .iter()
        .all(|h| from_file(&h.source_path, "good.md")));

    // Not settled: retried on the next run.
    let again = sync(&engine, &ws.docs).await;
    assert_eq!(again.failed, 1);
    assert_eq!(again.skipped_unchanged, 1);
}

#[tokio::test]
async fn reclassify_only_raises_and_set_tier_can_lower() {
    let ws = Workspace::new();
    let path = ws.write("plan.md", "timeline for project falcon and the dock rebuild.");
    {
        let engine = Engine::open(ws.config()).await.unwrap();
        sync(&engine, &ws.docs).await;
        let hits = engine
            .query("project falcon", PrivacyTier::Public, Some(5))
            .await
            .unwrap();
        assert!(!hits.hits.is_empty());
    }

    let mut config = ws.config();
    config.privacy.keyword_rules.push(KeywordRule {
        pattern: r"(?i)project\s+falcon".to_string(),
        tier: PrivacyTier::Business,
    });
    let engine = Engine::open(config).await.unwrap();

    let report = engine.reclassify().await.unwrap();
    assert!(report.examined >= 1);
    assert!(report.upgraded >= 1);
    assert!(report.upgrades.contains_key(&PrivacyTier::Business));

    let public = engine
        .query("project falcon", PrivacyTier::Public, Some(5))
        .await
        .unwrap();
    assert!(public.hits.is_empty());
    let business = engine
        .query("project falcon", PrivacyTier::Business, Some(5))
        .await
        .unwrap();
    assert!(business.hits.iter().all(|h| h.tier == PrivacyTier::Business));
    assert!(!business.hits.is_empty());

    // Running again finds nothing new to upgrade.
    assert_eq!(engine.reclassify().await.unwrap().upgraded, 0);

    let moved = engine.set_tier(&path, PrivacyTier::Public).await.unwrap();
    assert!(moved >= 1);
    let public = engine
        .query("project falcon", PrivacyTier::Public, Some(5))
        .await
        .unwrap();
    assert!(!public.hits.is_empty());
}

#[tokio::test]
async fn model_change_is_reported_until_reembed() {
    let ws = Workspace::new();
    ws.write("a.md", "tide tables for the northern coast.");
    ws.write("b.md", "wind charts for the southern coast.");

    let mut small = ws.config();
    small.embedding.dims = Some(32);
    {
        let engine = Engine::open(small).await.unwrap();
        sync(&engine, &ws.docs).await;
    }

    let mut large = ws.config();
    large.embedding.dims = Some(64);
    let engine = Engine::open(large).await.unwrap();

    let err = engine
        .query("tide tables", PrivacyTier::Personal, None)
        .await
        .unwrap_err();
    match err {
        QueryError::Embedding(EmbeddingError::ModelMismatch { stored, active }) => {
            assert_eq!(stored, "hash-v1-32");
            assert_eq!(active, "hash-v1-64");
        }
        other => panic!("expected model mismatch, got {:?}", other),
    }

    let health = engine.health().await;
    assert!(health.chunks_needing_reembed >= 2);

    let chunks = total_chunks(&engine).await;
    let updated = engine.reembed(Some(1)).await.unwrap();
    assert_eq!(updated, chunks);

    let result = engine
        .query("tide tables", PrivacyTier::Personal, None)
        .await
        .unwrap();
    assert!(!result.hits.is_empty());
    assert_eq!(result.incompatible_chunks, 0);
    assert_eq!(engine.health().await.chunks_needing_reembed, 0);
}

#[tokio::test]
async fn related_documents_rank_similar_and_mark_links() {
    let ws = Workspace::new();
    let a = ws.write(
        "a.md",
        "see [[b]]\n\nrust ownership and borrowing rules keep memory safe.",
    );
    ws.write(
        "b.md",
        "rust ownership and borrowing rules explained with lifetimes.",
    );
    ws.write("c.md", "growing tomatoes in a small garden bed.");

    let engine = Engine::open(ws.config()).await.unwrap();
    sync(&engine, &ws.docs).await;

    let related = engine.related(&a, PrivacyTier::Public, Some(2)).await.unwrap();
    assert!(!related.is_empty());
    assert!(related.len() <= 2);
    assert!(related[0].path.ends_with("b.md"));
    assert!(related[0].linked);
    assert!(related.iter().all(|r| !r.path.ends_with("a.md")));
}

#[tokio::test]
async fn related_requires_an_indexed_document() {
    let ws = Workspace::new();
    let stray = ws.write("stray.md", "never synced.");
    let engine = Engine::open(ws.config()).await.unwrap();
    let err = engine
        .related(&stray, PrivacyTier::Public, None)
        .await
        .unwrap_err();
    assert!(matches!(err, QueryError::NotIndexed(_)));
}

#[tokio::test]
async fn empty_document_succeeds_with_no_chunks() {
    let ws = Workspace::new();
    ws.write("empty.md", "");
    let engine = Engine::open(ws.config()).await.unwrap();
    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.chunks_indexed, 0);
}

#[tokio::test]
async fn hint_raises_every_chunk() {
    let ws = Workspace::new();
    ws.write("plain.md", "a harmless note about sandcastles.");
    let engine = Engine::open(ws.config()).await.unwrap();
    let report = engine
        .sync(&[ws.docs.clone()], Some(PrivacyTier::Business), &NoProgress)
        .await
        .unwrap();
    assert_eq!(report.tier_counts.get(&PrivacyTier::Public), None);
    assert!(report.tier_counts.get(&PrivacyTier::Business).is_some());

    let public = engine
        .query("sandcastles", PrivacyTier::Public, None)
        .await
        .unwrap();
    assert!(public.hits.is_empty());
}

#[tokio::test]
async fn stats_persist_across_reopen() {
    let ws = Workspace::new();
    ws.write("a.md", "oars and paddles.");
    {
        let engine = Engine::open(ws.config()).await.unwrap();
        sync(&engine, &ws.docs).await;
        engine
            .query("oars", PrivacyTier::Public, None)
            .await
            .unwrap();
    }
    let engine = Engine::open(ws.config()).await.unwrap();
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.lifetime.documents_processed, 1);
    assert_eq!(stats.lifetime.queries_executed, 1);
    assert!(stats.lifetime.chunks_embedded >= 1);
    assert_eq!(stats.documents_by_status.get("succeeded"), Some(&1));
    assert!(stats.last_update.is_some());
}

async fn drop_chunks_table(store: &Path, collection: &str) {
    let file = store.join("collections").join(format!("{}.sqlite", collection));
    let pool = docintel::db::connect(&file).await.unwrap();
    sqlx::query("DROP TABLE chunks").execute(&pool).await.unwrap();
    pool.close().await;
}

fn write_garbage(file: &Path) {
    fs::write(file, b"definitely not a database file. ".repeat(128)).unwrap();
}

#[tokio::test]
async fn failed_tier_move_hides_the_document_until_resync() {
    let ws = Workspace::new();
    ws.write("plan.md", "timeline for project falcon and the dock rebuild.");
    {
        let engine = Engine::open(ws.config()).await.unwrap();
        sync(&engine, &ws.docs).await;
    }

    let mut config = ws.config();
    config.privacy.keyword_rules.push(KeywordRule {
        pattern: r"(?i)project\s+falcon".to_string(),
        tier: PrivacyTier::Business,
    });
    {
        let engine = Engine::open(config.clone()).await.unwrap();
        let before = engine
            .query("project falcon", PrivacyTier::Business, Some(5))
            .await
            .unwrap();
        assert_eq!(before.hits.len(), 1);
        assert_eq!(before.hits[0].tier, PrivacyTier::Public);

        drop_chunks_table(&ws.store, "business").await;
        assert!(engine.reclassify().await.is_err());

        let public = engine
            .query("project falcon", PrivacyTier::Public, Some(5))
            .await
            .unwrap();
        assert!(public.hits.is_empty());
        let catalog = docintel::catalog::Catalog::open(&ws.store).await.unwrap();
        let doc = catalog.list().await.unwrap().remove(0);
        assert_eq!(doc.status, docintel::models::ExtractionStatus::Failed);
        assert_eq!(doc.failure, Some(FailureCategory::Store));
    }

    // Reopening recreates the collection; the next sync rebuilds the document.
    let engine = Engine::open(config).await.unwrap();
    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 1);
    let business = engine
        .query("project falcon", PrivacyTier::Business, Some(5))
        .await
        .unwrap();
    assert!(!business.hits.is_empty());
    assert!(business.hits.iter().all(|h| h.tier == PrivacyTier::Business));
}

#[tokio::test]
async fn other_processes_keep_chunks_of_a_sync_in_progress() {
    use docintel::catalog::Catalog;
    use docintel::embedding::TaggedVector;
    use docintel::models::{Chunk, ChunkMetadata, ChunkState, ExtractionStatus};
    use docintel::store::VectorStore;

    let ws = Workspace::new();
    ws.write("a.md", "kelp forests shelter young fish.");
    {
        let engine = Engine::open(ws.config()).await.unwrap();
        sync(&engine, &ws.docs).await;
    }

    // A writer that has stored chunks for a new version but not committed.
    let catalog = Catalog::open(&ws.store).await.unwrap();
    let store = VectorStore::open(&ws.store, 100).await.unwrap();
    let indexed = catalog.list().await.unwrap().remove(0);
    let mut next = indexed.clone();
    next.id = "in-progress".to_string();
    next.status = ExtractionStatus::Pending;
    catalog.mark_pending(&next).await.unwrap();
    let chunk = Chunk {
        id: Chunk::chunk_id("in-progress", 0),
        document_id: "in-progress".to_string(),
        position: 0,
        text: "kelp forests shelter young fish and seals.".to_string(),
        tier: PrivacyTier::Public,
        metadata: ChunkMetadata::default(),
        state: ChunkState::Embedded,
    };
    let vector = TaggedVector {
        model: "hash-v1-64".to_string(),
        values: vec![0.5; 64],
    };
    store.upsert("public", &chunk, &vector).await.unwrap();

    let empty = ws.docs.join("empty");
    fs::create_dir_all(&empty).unwrap();
    let other = Engine::open(ws.config()).await.unwrap();
    other
        .query("kelp", PrivacyTier::Personal, Some(5))
        .await
        .unwrap();
    sync(&other, &empty).await;
    let kept = store
        .chunks_for_document("in-progress", PrivacyTier::Personal)
        .await
        .unwrap();
    assert_eq!(kept.len(), 1);

    // Once the writer gives up, the chunks are garbage.
    catalog.release(&indexed.path).await.unwrap();
    sync(&other, &empty).await;
    let kept = store
        .chunks_for_document("in-progress", PrivacyTier::Personal)
        .await
        .unwrap();
    assert!(kept.is_empty());
    let hits = other
        .query("kelp forests", PrivacyTier::Public, Some(5))
        .await
        .unwrap();
    assert!(!hits.hits.is_empty());
}

#[tokio::test]
async fn broken_collection_only_fails_documents_routed_to_it() {
    let ws = Workspace::new();
    ws.write("notes.md", "harbor crane maintenance notes.");
    ws.write("record.md", "employee record. ssn 123-45-6789 on file.");
    ws.write("tides.md", "tide tables for the harbor entrance.");

    let engine = Engine::open(ws.config()).await.unwrap();
    drop_chunks_table(&ws.store, "personal").await;

    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.succeeded, 2, "failures: {:?}", report.failures);
    assert_eq!(report.failed, 1);
    assert!(report.failures[0].path.ends_with("record.md"));
    assert_eq!(report.failures[0].category, FailureCategory::Store);
    assert_eq!(report.exit_code(), 1);

    let hits = engine
        .query("harbor crane", PrivacyTier::Public, Some(5))
        .await
        .unwrap();
    assert!(hits.hits.iter().any(|h| from_file(&h.source_path, "notes.md")));
}

#[tokio::test]
async fn corrupt_collection_refuses_to_open() {
    use docintel::error::StoreError;

    let ws = Workspace::new();
    let collections = ws.store.join("collections");
    fs::create_dir_all(&collections).unwrap();
    write_garbage(&collections.join("business.sqlite"));

    let err = match Engine::open(ws.config()).await {
        Ok(_) => panic!("opened a corrupt store"),
        Err(e) => e,
    };
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::Corrupt { collection, .. }) => assert_eq!(collection, "business"),
        other => panic!("unexpected error: {:?} ({:#})", other, err),
    }
}

#[tokio::test]
async fn touched_file_keeps_its_chunks_under_a_new_id() {
    use docintel::catalog::Catalog;
    use docintel::ingest::document_id;
    use docintel::store::VectorStore;

    let ws = Workspace::new();
    let path = ws.write("a.md", "sea glass collects along the north beach.");
    let counter = Arc::new(Flaky {
        inner: HashEmbedder::new(64),
        failures: AtomicU32::new(0),
        calls: AtomicU32::new(0),
    });
    let engine = Engine::open_with(ws.config(), counter.clone()).await.unwrap();
    sync(&engine, &ws.docs).await;
    let calls = counter.calls.load(Ordering::SeqCst);
    let chunks = total_chunks(&engine).await;

    let later = std::time::SystemTime::now() + std::time::Duration::from_secs(120);
    fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(later)
        .unwrap();

    let report = sync(&engine, &ws.docs).await;
    assert_eq!(report.skipped_unchanged, 1);
    assert_eq!(counter.calls.load(Ordering::SeqCst), calls);
    assert_eq!(total_chunks(&engine).await, chunks);

    let catalog = Catalog::open(&ws.store).await.unwrap();
    let doc = catalog.list().await.unwrap().remove(0);
    assert_eq!(doc.id, document_id(&doc.path, doc.modified_at));
    let store = VectorStore::open(&ws.store, 100).await.unwrap();
    let stored = store
        .chunks_for_document(&doc.id, PrivacyTier::Personal)
        .await
        .unwrap();
    assert_eq!(stored.len() as u64, chunks);

    let hits = engine
        .query("sea glass", PrivacyTier::Public, Some(5))
        .await
        .unwrap();
    assert!(!hits.hits.is_empty());
}
