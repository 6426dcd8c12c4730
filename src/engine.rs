//! Engine facade: one opened store plus everything that operates on it.
//!
//! Every command of the CLI maps onto one method here. Library callers use
//! the same surface.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::chunk::chunk_with_boundaries;
use crate::config::Config;
use crate::embedding::{self, Embedder, EmbeddingAdapter};
use crate::error::{FailureCategory, IngestError, QueryError, StoreError};
use crate::extract::Extractor;
use crate::hardware::{self, HardwareProfile};
use crate::ingest::{CancelToken, Pipeline, ProcessingReport};
use crate::models::{PrivacyTier, StoredChunk};
use crate::privacy::{reclassified, ClassifyContext, PrivacyClassifier};
use crate::progress::ProgressReporter;
use crate::query::{QueryEngine, QueryResult, RelatedDocument};
use crate::scan;
use crate::stats::{self, StatsReport};
use crate::store::{CollectionStats, VectorStore};

pub struct Engine {
    config: Config,
    profile: HardwareProfile,
    store: Arc<VectorStore>,
    catalog: Arc<Catalog>,
    adapter: EmbeddingAdapter,
    classifier: PrivacyClassifier,
    pipeline: Pipeline,
    query: QueryEngine,
}

impl Engine {
    /// Open the store configured in `config` with the configured embedder.
    pub async fn open(config: Config) -> Result<Self> {
        let embedder = embedding::create_embedder(&config.embedding)?;
        Self::open_with(config, embedder).await
    }

    /// Open with an explicit embedding capability.
    pub async fn open_with(config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        crate::config::validate(&config)?;
        let profile = hardware::profile().with_limits(&config.resources);
        info!(
            class = ?profile.class,
            workers = profile.cpu_workers,
            batch = profile.batch_size,
            "hardware profile"
        );

        std::fs::create_dir_all(&config.store.dir).with_context(|| {
            format!("Failed to create store dir: {}", config.store.dir.display())
        })?;
        let catalog = Arc::new(Catalog::open(&config.store.dir).await?);
        let store = Arc::new(VectorStore::open(&config.store.dir, profile.cache_entries).await?);

        let adapter = EmbeddingAdapter::new(embedder);
        let classifier = PrivacyClassifier::from_config(&config.privacy)?;
        let pipeline = Pipeline::new(
            &config,
            store.clone(),
            catalog.clone(),
            adapter.clone(),
            classifier.clone(),
            &profile,
        );
        let query = QueryEngine::new(
            store.clone(),
            catalog.clone(),
            adapter.clone(),
            config.retrieval.clone(),
        );

        Ok(Self {
            config,
            profile,
            store,
            catalog,
            adapter,
            classifier,
            pipeline,
            query,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn profile(&self) -> &HardwareProfile {
        &self.profile
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.pipeline.cancel_token()
    }

    pub async fn sync(
        &self,
        paths: &[PathBuf],
        hint: Option<PrivacyTier>,
        progress: &dyn ProgressReporter,
    ) -> Result<ProcessingReport, IngestError> {
        self.pipeline.ingest(paths, hint, progress).await
    }

    pub async fn query(
        &self,
        text: &str,
        max_tier: PrivacyTier,
        k: Option<usize>,
    ) -> Result<QueryResult, QueryError> {
        self.query.query(text, max_tier, k).await
    }

    pub async fn related(
        &self,
        path: &Path,
        max_tier: PrivacyTier,
        k: Option<usize>,
    ) -> Result<Vec<RelatedDocument>, QueryError> {
        self.query.related(path, max_tier, k).await
    }

    /// Re-run the classifier over every chunk of every visible document.
    /// Tiers only go up; upgraded chunks move to their new collection.
    pub async fn reclassify(&self) -> Result<ReclassifyReport, StoreError> {
        let mut report = ReclassifyReport::default();
        let live = self.catalog.live_document_ids().await?;
        let mut doc_tiers: HashMap<String, PrivacyTier> = HashMap::new();
        let mut moves: BTreeMap<String, Vec<(StoredChunk, PrivacyTier)>> = BTreeMap::new();

        for tier in PrivacyTier::ALL {
            for chunk in self.store.chunks_in(tier.collection()).await? {
                if !live.contains(&chunk.document_id) {
                    continue;
                }
                report.examined += 1;
                let path = PathBuf::from(&chunk.metadata.source_path);
                let candidate = self.classifier.classify(
                    &chunk.text,
                    ClassifyContext {
                        path: Some(&path),
                        floor: PrivacyTier::Public,
                    },
                );
                let next = reclassified(chunk.tier, candidate);
                let entry = doc_tiers
                    .entry(chunk.document_id.clone())
                    .or_insert(next);
                *entry = (*entry).max(next);
                if next > chunk.tier {
                    report.upgraded += 1;
                    *report.upgrades.entry(next).or_insert(0) += 1;
                    moves
                        .entry(chunk.document_id.clone())
                        .or_default()
                        .push((chunk, next));
                }
            }
        }

        for (doc_id, doc_moves) in &moves {
            self.relocate(doc_id, doc_moves).await?;
        }

        for doc in self.catalog.list().await? {
            if let Some(tier) = doc_tiers.get(&doc.id) {
                if doc.max_tier.map(|t| *tier > t).unwrap_or(true) {
                    self.catalog.set_max_tier(&doc.id, *tier).await?;
                }
            }
        }
        info!(examined = report.examined, upgraded = report.upgraded, "reclassified");
        Ok(report)
    }

    /// Move chunks of one document between collections while the document
    /// is out of search. After a failed move the document stays hidden,
    /// marked failed, until the next sync rebuilds it.
    async fn relocate(
        &self,
        doc_id: &str,
        moves: &[(StoredChunk, PrivacyTier)],
    ) -> Result<(), StoreError> {
        if moves.is_empty() {
            return Ok(());
        }
        let hidden = self.catalog.hide(doc_id).await?;
        for (chunk, to) in moves {
            if let Err(e) = self.store.move_chunk(chunk, *to).await {
                warn!(document = %doc_id, error = %e, "tier move failed; document needs a re-sync");
                if hidden {
                    if let Err(mark) = self
                        .catalog
                        .mark_failed(doc_id, FailureCategory::Store, &e.to_string())
                        .await
                    {
                        warn!(document = %doc_id, error = %mark, "could not record failed move");
                    }
                }
                return Err(e);
            }
        }
        if hidden {
            self.catalog.reveal(doc_id).await?;
        }
        Ok(())
    }

    /// Explicitly set every chunk of the document at `path` to `tier`. The
    /// only operation that may lower a tier.
    pub async fn set_tier(&self, path: &Path, tier: PrivacyTier) -> Result<u64> {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let Some(doc) = self.catalog.get(&path).await? else {
            bail!("document not indexed: {}", path.display());
        };
        let chunks = self
            .store
            .chunks_for_document(&doc.id, PrivacyTier::Personal)
            .await?;
        let moves: Vec<(StoredChunk, PrivacyTier)> = chunks
            .iter()
            .filter(|c| c.tier != tier)
            .map(|c| (c.clone(), tier))
            .collect();
        self.relocate(&doc.id, &moves).await?;
        let moved = moves.len() as u64;
        if !chunks.is_empty() {
            self.catalog.set_max_tier(&doc.id, tier).await?;
        }
        if chunks.iter().any(|c| c.tier > tier) {
            warn!(path = %path.display(), tier = %tier, "tier lowered by explicit request");
        }
        Ok(moved)
    }

    /// Re-embed chunks whose vectors came from another model, `batch` at a
    /// time. Returns the number of chunks updated.
    pub async fn reembed(&self, batch: Option<usize>) -> Result<u64> {
        let batch = batch.unwrap_or(self.profile.batch_size).max(1);
        let model = self.adapter.model_id().to_string();
        let dims = self.adapter.dims();
        let mut updated = 0u64;
        loop {
            let stale: Vec<StoredChunk> = self.store.stale_chunks(&model, dims, batch).await?;
            if stale.is_empty() {
                break;
            }
            let texts: Vec<String> = stale.iter().map(|c| c.text.clone()).collect();
            let vectors = self.adapter.embed(&texts).await?;
            for (chunk, vector) in stale.iter().zip(vectors.iter()) {
                self.store.replace_vector(chunk, vector).await?;
                updated += 1;
            }
            info!(updated, model = %model, "re-embedded batch");
        }
        if updated > 0 {
            let delta = crate::stats::ProcessingStats {
                chunks_embedded: updated,
                ..Default::default()
            };
            self.catalog.add_stats(&delta).await?;
        }
        Ok(updated)
    }

    pub async fn stats(&self) -> Result<StatsReport> {
        Ok(StatsReport {
            store_dir: self.config.store.dir.clone(),
            size_bytes: stats::dir_size(&self.config.store.dir),
            documents_by_status: self.catalog.status_counts().await?,
            collections: self.store.stats().await?,
            active_model: format!("{} ({}d)", self.adapter.model_id(), self.adapter.dims()),
            last_update: self.catalog.last_update().await?,
            lifetime: self.catalog.stats().await?,
        })
    }

    /// Check every collaborator and report what is reachable.
    pub async fn health(&self) -> HealthReport {
        let collections = match self.store.stats().await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "collection stats unavailable");
                Vec::new()
            }
        };
        let catalog = match self.catalog.status_counts().await {
            Ok(_) => Check::ok(),
            Err(e) => Check::failed(e.to_string()),
        };
        let marker = self.config.store.dir.join(".health-check");
        let store = match std::fs::write(&marker, b"ok").and_then(|_| std::fs::remove_file(&marker)) {
            Ok(()) => Check::ok(),
            Err(e) => Check::failed(format!("store dir not writable: {}", e)),
        };
        let embedder = if self.config.embedding.is_enabled() {
            match self.adapter.embed_query("health check").await {
                Ok(_) => Check::ok(),
                Err(e) => Check::failed(e.to_string()),
            }
        } else {
            Check::failed("embedding provider disabled".to_string())
        };
        let mismatched = collections
            .iter()
            .flat_map(|c| c.models.iter())
            .filter(|m| m.model != self.adapter.model_id() || m.dims != self.adapter.dims())
            .map(|m| m.chunks)
            .sum();

        HealthReport {
            healthy: store.ok
                && catalog.ok
                && embedder.ok
                && collections.len() == PrivacyTier::ALL.len()
                && collections.iter().all(|c| c.available),
            store_dir: self.config.store.dir.clone(),
            store,
            catalog,
            embedder,
            model: self.adapter.model_id().to_string(),
            chunks_needing_reembed: mismatched,
            collections,
            hardware: self.profile.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ReclassifyReport {
    pub examined: u64,
    pub upgraded: u64,
    pub upgrades: BTreeMap<PrivacyTier, u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Check {
    fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            ok: false,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub store_dir: PathBuf,
    pub store: Check,
    pub catalog: Check,
    pub embedder: Check,
    pub model: String,
    pub chunks_needing_reembed: u64,
    pub collections: Vec<CollectionStats>,
    pub hardware: HardwareProfile,
}

/// Per-document result of a privacy scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanItem {
    pub path: PathBuf,
    pub tier: PrivacyTier,
    pub chunks: usize,
    pub signals: Vec<String>,
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrivacyScanReport {
    pub items: Vec<ScanItem>,
    pub tier_counts: BTreeMap<PrivacyTier, u64>,
    pub failed: u64,
}

impl PrivacyScanReport {
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

/// Classify the documents under `paths` exactly as `sync` would, without
/// opening or writing the store.
pub fn privacy_scan(
    config: &Config,
    paths: &[PathBuf],
    hint: Option<PrivacyTier>,
) -> Result<PrivacyScanReport> {
    let classifier = PrivacyClassifier::from_config(&config.privacy)?;
    let extractor = Extractor::new().with_max_bytes(config.scan.max_file_bytes);
    let discovery = scan::discover(paths, &config.scan)?;
    let floor = hint.unwrap_or_default();

    let mut report = PrivacyScanReport {
        items: Vec::new(),
        tier_counts: BTreeMap::new(),
        failed: 0,
    };

    for (path, reason) in discovery.unreadable {
        report.failed += 1;
        report.items.push(ScanItem {
            path,
            tier: PrivacyTier::Personal,
            chunks: 0,
            signals: Vec::new(),
            entities: Vec::new(),
            error: Some(reason),
            category: Some(FailureCategory::Io),
        });
    }

    for file in discovery.files {
        let item = match extractor.extract(&file.path) {
            Ok(extracted) => {
                let pieces = chunk_with_boundaries(
                    &extracted.text,
                    config.chunking.target_size,
                    config.chunking.overlap,
                    &extracted.metadata.boundaries,
                );
                let mut tier = floor;
                let mut signals: Vec<String> = Vec::new();
                let mut entities: Vec<String> = Vec::new();
                for piece in &pieces {
                    let c = classifier.classify_detailed(
                        &piece.text,
                        ClassifyContext {
                            path: Some(&file.path),
                            floor,
                        },
                    );
                    tier = tier.max(c.tier);
                    for s in c.signals.iter().map(|s| s.describe()) {
                        if !signals.contains(&s) {
                            signals.push(s);
                        }
                    }
                    for e in c.entities {
                        if !entities.contains(&e) {
                            entities.push(e);
                        }
                    }
                }
                ScanItem {
                    path: file.path,
                    tier,
                    chunks: pieces.len(),
                    signals,
                    entities,
                    error: None,
                    category: None,
                }
            }
            Err(e) => {
                report.failed += 1;
                ScanItem {
                    path: file.path,
                    tier: PrivacyTier::Personal,
                    chunks: 0,
                    signals: Vec::new(),
                    entities: Vec::new(),
                    error: Some(e.reason()),
                    category: Some(FailureCategory::Extraction),
                }
            }
        };
        if item.error.is_none() {
            *report.tier_counts.entry(item.tier).or_insert(0) += 1;
        }
        report.items.push(item);
    }
    Ok(report)
}
