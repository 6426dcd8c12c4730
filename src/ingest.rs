//! Ingestion pipeline orchestration.
//!
//! Coordinates a sync run: discovery → extraction → chunking →
//! classification → embedding → storage → commit. Documents are processed
//! concurrently by a bounded worker pool; each one settles on its own and a
//! failure never stops the batch. Only corruption of the store aborts a run.
//!
//! Per document:
//!
//! 1. Hash the bytes; skip when the indexed content hash is unchanged.
//! 2. Extract text (on a blocking thread) and cut it into chunks.
//! 3. Classify every chunk, never below the caller's hint.
//! 4. Embed in batches sized by [`BatchSizer`], retrying transient errors.
//! 5. Write chunks to their tier collections.
//! 6. Commit the catalog row and counter delta in one transaction. This is
//!    the point the new version becomes searchable; the chunks of the
//!    version it replaces are deleted afterwards.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::chunk::chunk_with_boundaries;
use crate::config::{ChunkingConfig, Config, ScanConfig};
use crate::embedding::{backoff_delay, EmbeddingAdapter, TaggedVector};
use crate::error::{EmbeddingError, FailureCategory, IngestError, StoreError};
use crate::extract::{Extracted, Extractor};
use crate::hardware::{self, HardwareProfile};
use crate::models::{Chunk, ChunkMetadata, ChunkState, Document, ExtractionStatus, PrivacyTier};
use crate::privacy::{ClassifyContext, PrivacyClassifier};
use crate::progress::{Phase, ProgressEvent, ProgressReporter};
use crate::scan::{self, SourceFile};
use crate::stats::ProcessingStats;
use crate::store::VectorStore;

/// Cooperative cancellation flag, checked between documents.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Embedding batch size controller.
///
/// Starts at the hardware profile's batch size, halves (down to 1) on each
/// transient embedding error or memory pressure, and returns to the base
/// size after a document completes.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    base: usize,
    current: usize,
}

impl BatchSizer {
    pub fn new(base: usize) -> Self {
        let base = base.max(1);
        Self {
            base,
            current: base,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn shrink(&mut self) -> usize {
        self.current = (self.current / 2).max(1);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

/// One document that did not make it into the index.
#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub path: PathBuf,
    pub category: FailureCategory,
    pub reason: String,
}

/// Outcome of a sync run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingReport {
    pub run_id: String,
    pub documents_total: u64,
    pub succeeded: u64,
    pub skipped_unchanged: u64,
    pub failed: u64,
    /// Documents whose source disappeared and were dropped from the index.
    pub removed: u64,
    /// Documents never started because the run was cancelled.
    pub not_started: u64,
    pub chunks_indexed: u64,
    pub tier_counts: BTreeMap<PrivacyTier, u64>,
    pub classification_fallbacks: u64,
    pub failures: Vec<FailureRecord>,
    pub failures_by_category: BTreeMap<FailureCategory, u64>,
    pub cancelled: bool,
    pub duration_ms: u64,
    /// Lifetime counters after the run.
    pub lifetime: ProcessingStats,
}

impl ProcessingReport {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            documents_total: 0,
            succeeded: 0,
            skipped_unchanged: 0,
            failed: 0,
            removed: 0,
            not_started: 0,
            chunks_indexed: 0,
            tier_counts: BTreeMap::new(),
            classification_fallbacks: 0,
            failures: Vec::new(),
            failures_by_category: BTreeMap::new(),
            cancelled: false,
            duration_ms: 0,
            lifetime: ProcessingStats::default(),
        }
    }

    fn record_failure(&mut self, path: PathBuf, category: FailureCategory, reason: String) {
        self.failed += 1;
        *self.failures_by_category.entry(category).or_insert(0) += 1;
        self.failures.push(FailureRecord {
            path,
            category,
            reason,
        });
    }

    /// `0` when every document settled successfully, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.cancelled {
            1
        } else {
            0
        }
    }

    pub fn print(&self) {
        println!("sync {}", self.run_id);
        println!("  documents:        {}", self.documents_total);
        println!("  indexed:          {}", self.succeeded);
        println!("  unchanged:        {}", self.skipped_unchanged);
        println!("  failed:           {}", self.failed);
        if self.removed > 0 {
            println!("  removed:          {}", self.removed);
        }
        println!("  chunks indexed:   {}", self.chunks_indexed);
        for (tier, n) in &self.tier_counts {
            println!("    {:<10} {}", tier, n);
        }
        if self.classification_fallbacks > 0 {
            println!("  detector fallbacks: {}", self.classification_fallbacks);
        }
        for f in &self.failures {
            println!("  ! {} [{}] {}", f.path.display(), f.category, f.reason);
        }
        if self.cancelled {
            println!("  cancelled ({} not started)", self.not_started);
        }
        println!("  took {} ms", self.duration_ms);
        if self.failed == 0 && !self.cancelled {
            println!("ok");
        }
    }
}

/// Settled state of one document.
enum DocOutcome {
    Indexed {
        chunks: u64,
        tiers: BTreeMap<PrivacyTier, u64>,
        fallbacks: u64,
    },
    Unchanged,
    Failed {
        category: FailureCategory,
        reason: String,
    },
    Aborted(StoreError),
}

struct Inner {
    store: Arc<VectorStore>,
    catalog: Arc<Catalog>,
    extractor: Extractor,
    classifier: PrivacyClassifier,
    adapter: EmbeddingAdapter,
    chunking: ChunkingConfig,
    scan: ScanConfig,
    max_retries: u32,
    retry_backoff: Duration,
    memory_budget: u64,
    workers: usize,
    sizer: Mutex<BatchSizer>,
    cancel: CancelToken,
    abort: AtomicBool,
}

/// The ingestion pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Arc<VectorStore>,
        catalog: Arc<Catalog>,
        adapter: EmbeddingAdapter,
        classifier: PrivacyClassifier,
        profile: &HardwareProfile,
    ) -> Self {
        Self::with_extractor(
            config,
            store,
            catalog,
            adapter,
            classifier,
            profile,
            Extractor::new().with_max_bytes(config.scan.max_file_bytes),
        )
    }

    pub fn with_extractor(
        config: &Config,
        store: Arc<VectorStore>,
        catalog: Arc<Catalog>,
        adapter: EmbeddingAdapter,
        classifier: PrivacyClassifier,
        profile: &HardwareProfile,
        extractor: Extractor,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                catalog,
                extractor,
                classifier,
                adapter,
                chunking: config.chunking.clone(),
                scan: config.scan.clone(),
                max_retries: config.embedding.max_retries,
                retry_backoff: Duration::from_millis(config.embedding.retry_backoff_ms),
                memory_budget: profile.memory_budget_bytes,
                workers: profile.cpu_workers.max(1),
                sizer: Mutex::new(BatchSizer::new(profile.batch_size)),
                cancel: CancelToken::new(),
                abort: AtomicBool::new(false),
            }),
        }
    }

    /// Token that stops the run before the next document starts.
    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    /// Ingest every file under `inputs`. `hint` is a tier floor applied to
    /// every chunk.
    pub async fn ingest(
        &self,
        inputs: &[PathBuf],
        hint: Option<PrivacyTier>,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingReport, IngestError> {
        let started = Instant::now();
        let mut report = ProcessingReport::new();
        let hint = hint.unwrap_or_default();
        let inner = &self.inner;
        inner.abort.store(false, Ordering::SeqCst);

        progress.report(&ProgressEvent {
            document_count_total: 0,
            document_count_done: 0,
            current_phase: Phase::Discovering,
        });

        self.collect_garbage().await.map_err(IngestError::Aborted)?;

        let discovery = scan::discover(inputs, &inner.scan)
            .map_err(|e| IngestError::Discovery(format!("{:#}", e)))?;
        info!(
            run = %report.run_id,
            files = discovery.files.len(),
            roots = discovery.roots.len(),
            "starting sync"
        );

        for (path, reason) in &discovery.unreadable {
            report.documents_total += 1;
            report.record_failure(path.clone(), FailureCategory::Io, reason.clone());
            if let Err(e) = inner
                .catalog
                .add_stats(&ProcessingStats::failure(FailureCategory::Io))
                .await
            {
                if e.is_fatal() {
                    return Err(IngestError::Aborted(e));
                }
                warn!(error = %e, "could not record failure");
            }
        }

        report.removed = self
            .remove_vanished(&discovery.roots, &discovery.files)
            .await
            .map_err(IngestError::Aborted)?;

        let total = discovery.files.len() as u64;
        report.documents_total += total;
        let mut done = 0u64;
        let emit = |done: u64| {
            progress.report(&ProgressEvent {
                document_count_total: total,
                document_count_done: done,
                current_phase: Phase::Ingesting,
            })
        };
        emit(0);

        let semaphore = Arc::new(Semaphore::new(inner.workers));
        let mut set: JoinSet<(PathBuf, DocOutcome)> = JoinSet::new();
        let mut aborted: Option<StoreError> = None;
        let mut files = discovery.files.into_iter();

        loop {
            if inner.cancel.is_cancelled() || inner.abort.load(Ordering::SeqCst) {
                break;
            }
            let Some(file) = files.next() else { break };
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            // Re-check after waiting for a slot.
            if inner.cancel.is_cancelled() || inner.abort.load(Ordering::SeqCst) {
                report.not_started += 1;
                drop(permit);
                break;
            }
            let task_inner = inner.clone();
            set.spawn(async move {
                let _permit = permit;
                let path = file.path.clone();
                let outcome = task_inner.process(file, hint).await;
                (path, outcome)
            });

            while let Some(joined) = set.try_join_next() {
                done += 1;
                settle(&mut report, &mut aborted, joined, inner);
                emit(done);
            }
        }
        report.not_started += files.len() as u64;

        while let Some(joined) = set.join_next().await {
            done += 1;
            settle(&mut report, &mut aborted, joined, inner);
            emit(done);
        }

        progress.report(&ProgressEvent {
            document_count_total: total,
            document_count_done: done,
            current_phase: Phase::Finished,
        });

        if let Some(err) = aborted {
            warn!(run = %report.run_id, error = %err, "sync aborted");
            return Err(IngestError::Aborted(err));
        }

        report.cancelled = inner.cancel.is_cancelled();
        report.duration_ms = started.elapsed().as_millis() as u64;
        report.lifetime = inner
            .catalog
            .stats()
            .await
            .map_err(IngestError::Aborted)?;

        info!(
            run = %report.run_id,
            indexed = report.succeeded,
            unchanged = report.skipped_unchanged,
            failed = report.failed,
            cancelled = report.cancelled,
            "sync finished"
        );
        Ok(report)
    }

    /// Delete chunks left behind by runs that never committed. Ids that are
    /// visible, pending or in flight in any process are kept.
    async fn collect_garbage(&self) -> Result<u64, StoreError> {
        let stored = self.inner.store.document_ids().await?;
        let keep = self.inner.catalog.protected_document_ids().await?;
        self.inner.store.remove_orphans(&stored, &keep).await
    }

    /// Drop indexed documents under fully walked `roots` whose file is gone.
    async fn remove_vanished(
        &self,
        roots: &[PathBuf],
        found: &[SourceFile],
    ) -> Result<u64, StoreError> {
        let found: HashSet<&Path> = found.iter().map(|f| f.path.as_path()).collect();
        let mut removed = 0;
        for root in roots {
            for doc in self.inner.catalog.documents_under(root).await? {
                if found.contains(doc.path.as_path()) || doc.path.exists() {
                    continue;
                }
                self.inner.store.delete_document(&doc.id).await?;
                self.inner.catalog.remove(&doc.path).await?;
                debug!(path = %doc.path.display(), "removed vanished document");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn settle(
    report: &mut ProcessingReport,
    aborted: &mut Option<StoreError>,
    joined: Result<(PathBuf, DocOutcome), tokio::task::JoinError>,
    inner: &Inner,
) {
    match joined {
        Ok((_, DocOutcome::Indexed {
            chunks,
            tiers,
            fallbacks,
        })) => {
            report.succeeded += 1;
            report.chunks_indexed += chunks;
            report.classification_fallbacks += fallbacks;
            for (tier, n) in tiers {
                *report.tier_counts.entry(tier).or_insert(0) += n;
            }
        }
        Ok((_, DocOutcome::Unchanged)) => report.skipped_unchanged += 1,
        Ok((path, DocOutcome::Failed { category, reason })) => {
            report.record_failure(path, category, reason);
        }
        Ok((path, DocOutcome::Aborted(err))) => {
            inner.abort.store(true, Ordering::SeqCst);
            report.record_failure(path, FailureCategory::Store, err.to_string());
            if aborted.is_none() {
                *aborted = Some(err);
            }
        }
        Err(e) => {
            report.record_failure(
                PathBuf::from("<worker>"),
                FailureCategory::Io,
                format!("worker task failed: {}", e),
            );
        }
    }
}

/// Stable document id: hash of path and modification time.
pub fn document_id(path: &Path, modified_at: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(b"\0");
    hasher.update(modified_at.to_le_bytes());
    hex::encode(hasher.finalize())
}

fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl Inner {
    async fn process(&self, file: SourceFile, hint: PrivacyTier) -> DocOutcome {
        let existing = match self.catalog.get(&file.path).await {
            Ok(e) => e,
            Err(e) => return store_failure(e),
        };

        let limit = self.scan.max_file_bytes;
        let too_large = file.size_bytes > limit;
        let bytes = if too_large {
            Vec::new()
        } else {
            match tokio::fs::read(&file.path).await {
                Ok(b) => b,
                Err(e) => {
                    let doc = self.new_document(&file, existing.as_ref(), String::new());
                    return self
                        .fail(doc, existing.as_ref(), FailureCategory::Io, e.to_string())
                        .await;
                }
            }
        };
        let hash = if too_large {
            format!("size:{}:{}", file.size_bytes, file.modified_at)
        } else {
            content_hash(&bytes)
        };

        if let Some(prev) = &existing {
            if prev.content_hash == hash && is_settled(prev) {
                if prev.modified_at != file.modified_at {
                    if let Err(e) = self.rekey(prev, &file).await {
                        return store_failure(e);
                    }
                }
                debug!(path = %file.path.display(), "unchanged");
                return DocOutcome::Unchanged;
            }
        }

        let mut doc = self.new_document(&file, existing.as_ref(), hash);
        if let Err(e) = self.catalog.mark_pending(&doc).await {
            return store_failure(e);
        }

        if too_large {
            let reason = crate::error::ExtractionError::TooLarge {
                size: file.size_bytes,
                limit,
            }
            .reason();
            return self
                .fail(doc, existing.as_ref(), FailureCategory::Extraction, reason)
                .await;
        }

        let extractor = self.extractor.clone();
        let path = file.path.clone();
        let extracted =
            tokio::task::spawn_blocking(move || extractor.extract_bytes(&path, &bytes)).await;
        let extracted: Extracted = match extracted {
            Ok(Ok(x)) => x,
            Ok(Err(e)) => {
                return self
                    .fail(doc, existing.as_ref(), e.category(), e.reason())
                    .await
            }
            Err(e) => {
                return self
                    .fail(
                        doc,
                        existing.as_ref(),
                        FailureCategory::Extraction,
                        format!("extractor crashed: {}", e),
                    )
                    .await
            }
        };
        doc.format = extracted.metadata.format.name();
        doc.links = extracted.metadata.links.clone();

        let mut chunks = self.build_chunks(&doc, &extracted, hint);
        let fallbacks = chunks.iter().filter(|(_, fail_safe)| *fail_safe).count() as u64;

        let texts: Vec<String> = chunks.iter().map(|(c, _)| c.text.clone()).collect();
        let vectors = match self.embed_all(&texts).await {
            Ok(v) => v,
            Err(e) => {
                return self
                    .fail(doc, existing.as_ref(), e.category(), e.to_string())
                    .await
            }
        };
        for (chunk, _) in chunks.iter_mut() {
            debug_assert!(chunk.state.can_advance_to(ChunkState::Embedded));
            chunk.state = ChunkState::Embedded;
        }

        // Leftovers of an earlier attempt at this exact version.
        if let Err(e) = self.store.delete_document(&doc.id).await {
            return self.fail_store(doc, existing.as_ref(), e).await;
        }

        let seq = self.store.next_seq();
        let mut by_tier: BTreeMap<PrivacyTier, Vec<(&Chunk, &TaggedVector)>> = BTreeMap::new();
        for ((chunk, _), vector) in chunks.iter().zip(vectors.iter()) {
            by_tier.entry(chunk.tier).or_default().push((chunk, vector));
        }
        for (tier, items) in &by_tier {
            if let Err(e) = self
                .store
                .upsert_batch(VectorStore::collection_for(*tier), items, seq)
                .await
            {
                return self.fail_store(doc, existing.as_ref(), e).await;
            }
        }

        let tiers: BTreeMap<PrivacyTier, u64> = by_tier
            .iter()
            .map(|(t, items)| (*t, items.len() as u64))
            .collect();
        doc.status = ExtractionStatus::Succeeded;
        doc.chunk_count = chunks.len();
        doc.max_tier = tiers.keys().next_back().copied().or(Some(hint));

        let mut delta = ProcessingStats {
            documents_processed: 1,
            chunks_embedded: chunks.len() as u64,
            classification_fallbacks: fallbacks,
            ..Default::default()
        };
        delta.classifications = tiers.clone();

        match self.catalog.commit(&doc, &delta).await {
            Ok(previous) => {
                if let Some(old) = previous {
                    match self.store.delete_document(&old).await {
                        Ok(n) => debug!(document = %old, chunks = n, "superseded"),
                        Err(e) if e.is_fatal() => return DocOutcome::Aborted(e),
                        // Unreferenced now; removed at next sync.
                        Err(e) => warn!(document = %old, error = %e, "could not delete superseded chunks"),
                    }
                }
            }
            Err(e) => return self.fail_store(doc, existing.as_ref(), e).await,
        }

        debug!(
            path = %doc.path.display(),
            chunks = doc.chunk_count,
            tier = ?doc.max_tier,
            "indexed"
        );
        DocOutcome::Indexed {
            chunks: chunks.len() as u64,
            tiers,
            fallbacks,
        }
    }

    /// Move an unchanged document to the id of its new modification time.
    /// Indexed chunks are copied under the new id and committed like a new
    /// version, so the document stays visible throughout.
    async fn rekey(&self, prev: &Document, file: &SourceFile) -> Result<(), StoreError> {
        let id = document_id(&file.path, file.modified_at);
        if prev.status != ExtractionStatus::Succeeded {
            return self.catalog.touch(&file.path, file.modified_at, &id).await;
        }

        let mut doc = prev.clone();
        doc.id = id;
        doc.modified_at = file.modified_at;
        self.catalog.mark_pending(&doc).await?;
        let copied = self
            .store
            .copy_document(&prev.id, &doc.id, self.store.next_seq())
            .await?;
        debug!(path = %doc.path.display(), chunks = copied, "re-keyed after mtime change");

        if let Some(old) = self.catalog.commit(&doc, &ProcessingStats::default()).await? {
            if let Err(e) = self.store.delete_document(&old).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(document = %old, error = %e, "could not delete superseded chunks");
            }
        }
        Ok(())
    }

    fn new_document(&self, file: &SourceFile, existing: Option<&Document>, hash: String) -> Document {
        let mut id = document_id(&file.path, file.modified_at);
        // Same path and mtime with new content: never reuse the visible id.
        if existing.map(|d| d.id == id && d.content_hash != hash).unwrap_or(false) {
            id = document_id(&file.path.join(&hash), file.modified_at);
        }
        Document {
            id,
            path: file.path.clone(),
            format: String::new(),
            size_bytes: file.size_bytes,
            modified_at: file.modified_at,
            content_hash: hash,
            status: ExtractionStatus::Pending,
            chunk_count: 0,
            max_tier: None,
            error: None,
            failure: None,
            links: Vec::new(),
            updated_at: 0,
        }
    }

    /// Chunks with their tier, paired with whether a detector failed.
    fn build_chunks(
        &self,
        doc: &Document,
        extracted: &Extracted,
        hint: PrivacyTier,
    ) -> Vec<(Chunk, bool)> {
        let pieces = chunk_with_boundaries(
            &extracted.text,
            self.chunking.target_size,
            self.chunking.overlap,
            &extracted.metadata.boundaries,
        );
        let source_path = doc.path.to_string_lossy().to_string();
        pieces
            .into_iter()
            .map(|piece| {
                let classification = self.classifier.classify_detailed(
                    &piece.text,
                    ClassifyContext {
                        path: Some(&doc.path),
                        floor: hint,
                    },
                );
                let heading = extracted
                    .metadata
                    .headings
                    .iter()
                    .take_while(|h| h.offset <= piece.core_start)
                    .last()
                    .map(|h| h.title.clone());
                let chunk = Chunk {
                    id: Chunk::chunk_id(&doc.id, piece.position),
                    document_id: doc.id.clone(),
                    position: piece.position,
                    tier: classification.tier,
                    metadata: ChunkMetadata {
                        source_path: source_path.clone(),
                        heading,
                        entities: classification.entities,
                        language: extracted.metadata.language.clone(),
                        signals: classification.signals.iter().map(|s| s.describe()).collect(),
                        byte_start: piece.start,
                        byte_end: piece.end,
                    },
                    text: piece.text,
                    state: ChunkState::Pending,
                };
                (chunk, classification.fail_safe)
            })
            .collect()
    }

    /// Embed all texts, shrinking the batch and backing off on transient
    /// errors. Gives up after `max_retries` consecutive failures.
    async fn embed_all(&self, texts: &[String]) -> Result<Vec<TaggedVector>, EmbeddingError> {
        let mut out = Vec::with_capacity(texts.len());
        let mut done = 0usize;
        let mut attempts = 0u32;
        while done < texts.len() {
            let size = {
                let mut sizer = self.sizer.lock().unwrap_or_else(|p| p.into_inner());
                if hardware::memory_pressure(self.memory_budget) {
                    let shrunk = sizer.shrink();
                    info!(batch = shrunk, "memory pressure; shrinking batch");
                }
                sizer.current()
            };
            let end = (done + size).min(texts.len());
            match self.adapter.embed(&texts[done..end]).await {
                Ok(vectors) => {
                    out.extend(vectors);
                    done = end;
                    attempts = 0;
                }
                Err(e) if e.is_transient() && attempts < self.max_retries => {
                    attempts += 1;
                    let shrunk = self
                        .sizer
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .shrink();
                    let delay = backoff_delay(self.retry_backoff, attempts);
                    warn!(
                        error = %e,
                        attempt = attempts,
                        batch = shrunk,
                        delay_ms = delay.as_millis() as u64,
                        "embedding failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.sizer
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reset();
        Ok(out)
    }

    async fn fail_store(
        &self,
        doc: Document,
        existing: Option<&Document>,
        err: StoreError,
    ) -> DocOutcome {
        if err.is_fatal() {
            return DocOutcome::Aborted(err);
        }
        self.fail(doc, existing, err.category(), err.to_string())
            .await
    }

    /// Settle `doc` as failed and clean up partial writes.
    ///
    /// Io and extraction failures replace the catalog row, so a previously
    /// indexed version of the same path stops being searchable. Embedding
    /// and store failures leave an indexed version in place; the changed
    /// content hash makes the next run try again.
    async fn fail(
        &self,
        mut doc: Document,
        existing: Option<&Document>,
        category: FailureCategory,
        reason: String,
    ) -> DocOutcome {
        warn!(path = %doc.path.display(), category = %category, reason = %reason, "document failed");

        if let Err(e) = self.store.delete_document(&doc.id).await {
            if e.is_fatal() {
                return DocOutcome::Aborted(e);
            }
            debug!(error = %e, "partial chunks left for cleanup at next sync");
        }

        let delta = ProcessingStats::failure(category);
        let keep_indexed = matches!(category, FailureCategory::Embedding | FailureCategory::Store)
            && existing
                .map(|d| d.status == ExtractionStatus::Succeeded)
                .unwrap_or(false);

        let result = if keep_indexed {
            match self.catalog.add_stats(&delta).await {
                Ok(()) => self.catalog.release(&doc.path).await.map(|_| None),
                Err(e) => Err(e),
            }
        } else {
            doc.status = ExtractionStatus::Failed;
            doc.error = Some(reason.clone());
            doc.failure = Some(category);
            doc.chunk_count = 0;
            self.catalog.commit(&doc, &delta).await
        };

        match result {
            Ok(Some(previous)) => {
                if let Err(e) = self.store.delete_document(&previous).await {
                    if e.is_fatal() {
                        return DocOutcome::Aborted(e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) if e.is_fatal() => return DocOutcome::Aborted(e),
            Err(e) => warn!(error = %e, "could not record failure"),
        }

        DocOutcome::Failed { category, reason }
    }
}

/// Whether a stored row needs no further work for the same content.
fn is_settled(doc: &Document) -> bool {
    match doc.status {
        ExtractionStatus::Succeeded => true,
        ExtractionStatus::Failed => matches!(doc.failure, Some(FailureCategory::Extraction)),
        ExtractionStatus::Pending => false,
    }
}

fn store_failure(err: StoreError) -> DocOutcome {
    if err.is_fatal() {
        DocOutcome::Aborted(err)
    } else {
        DocOutcome::Failed {
            category: FailureCategory::Store,
            reason: err.to_string(),
        }
    }
}
