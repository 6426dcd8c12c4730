//! Processing statistics and the `stats` overview.
//!
//! [`ProcessingStats`] counters accumulate for the lifetime of a store and
//! are persisted in the catalog. A run applies its delta in the same
//! transaction that commits each document, so an interrupted run never
//! leaves counters ahead of the indexed data.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::FailureCategory;
use crate::models::PrivacyTier;
use crate::store::CollectionStats;

/// Cumulative engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub documents_processed: u64,
    pub chunks_embedded: u64,
    pub failures: BTreeMap<FailureCategory, u64>,
    pub classifications: BTreeMap<PrivacyTier, u64>,
    /// Chunks forced to Personal because a detector failed.
    pub classification_fallbacks: u64,
    pub queries_executed: u64,
}

impl ProcessingStats {
    pub fn merge(&mut self, other: &ProcessingStats) {
        self.documents_processed += other.documents_processed;
        self.chunks_embedded += other.chunks_embedded;
        for (k, v) in &other.failures {
            *self.failures.entry(*k).or_insert(0) += v;
        }
        for (k, v) in &other.classifications {
            *self.classifications.entry(*k).or_insert(0) += v;
        }
        self.classification_fallbacks += other.classification_fallbacks;
        self.queries_executed += other.queries_executed;
    }

    pub fn is_zero(&self) -> bool {
        *self == ProcessingStats::default()
    }

    pub fn failure(category: FailureCategory) -> Self {
        let mut stats = ProcessingStats {
            documents_processed: 1,
            ..Default::default()
        };
        stats.failures.insert(category, 1);
        stats
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }

    /// Flatten into `(key, value)` rows for the catalog's `stats` table.
    pub fn to_pairs(&self) -> Vec<(String, u64)> {
        let mut pairs = vec![
            ("documents_processed".to_string(), self.documents_processed),
            ("chunks_embedded".to_string(), self.chunks_embedded),
            (
                "classification_fallbacks".to_string(),
                self.classification_fallbacks,
            ),
            ("queries_executed".to_string(), self.queries_executed),
        ];
        for (k, v) in &self.failures {
            pairs.push((format!("failures.{}", k), *v));
        }
        for (k, v) in &self.classifications {
            pairs.push((format!("classifications.{}", k), *v));
        }
        pairs.retain(|(_, v)| *v > 0);
        pairs
    }

    /// Inverse of [`ProcessingStats::to_pairs`]. Unknown keys are ignored.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, u64)>,
    {
        let mut stats = ProcessingStats::default();
        for (key, value) in pairs {
            match key.as_str() {
                "documents_processed" => stats.documents_processed = value,
                "chunks_embedded" => stats.chunks_embedded = value,
                "classification_fallbacks" => stats.classification_fallbacks = value,
                "queries_executed" => stats.queries_executed = value,
                other => {
                    if let Some(cat) = other
                        .strip_prefix("failures.")
                        .and_then(FailureCategory::parse)
                    {
                        stats.failures.insert(cat, value);
                    } else if let Some(tier) = other
                        .strip_prefix("classifications.")
                        .and_then(|t| t.parse::<PrivacyTier>().ok())
                    {
                        stats.classifications.insert(tier, value);
                    }
                }
            }
        }
        stats
    }
}

/// Everything `docintel stats` prints.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub store_dir: PathBuf,
    pub size_bytes: u64,
    pub documents_by_status: BTreeMap<String, u64>,
    pub collections: Vec<CollectionStats>,
    pub active_model: String,
    pub last_update: Option<i64>,
    pub lifetime: ProcessingStats,
}

pub fn print_stats(report: &StatsReport) {
    println!("docintel store stats");
    println!("====================");
    println!();
    println!("  Store:       {}", report.store_dir.display());
    println!("  Size:        {}", format_bytes(report.size_bytes));
    println!("  Model:       {}", report.active_model);
    println!(
        "  Last update: {}",
        report
            .last_update
            .map(format_ts_relative)
            .unwrap_or_else(|| "never".to_string())
    );
    println!();

    let total_docs: u64 = report.documents_by_status.values().sum();
    println!("  Documents:   {}", total_docs);
    for (status, count) in &report.documents_by_status {
        println!("    {:<12} {:>8}", status, count);
    }

    println!();
    println!(
        "  {:<12} {:>8}  {:<10} {}",
        "COLLECTION", "CHUNKS", "STATE", "MODELS"
    );
    println!("  {}", "-".repeat(60));
    for c in &report.collections {
        let models = c
            .models
            .iter()
            .map(|m| format!("{} ({}d): {}", m.model, m.dims, m.chunks))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {:<12} {:>8}  {:<10} {}",
            c.name,
            c.chunks,
            if c.available { "ok" } else { "unavailable" },
            models
        );
    }

    let l = &report.lifetime;
    println!();
    println!("  Lifetime:");
    println!("    documents processed  {}", l.documents_processed);
    println!("    chunks embedded      {}", l.chunks_embedded);
    println!("    queries executed     {}", l.queries_executed);
    println!("    detector fallbacks   {}", l.classification_fallbacks);
    for (tier, n) in &l.classifications {
        println!("    classified {:<9} {}", tier, n);
    }
    for (cat, n) in &l.failures {
        println!("    failed ({:<10}) {}", cat, n);
    }
    println!();
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Total size of the files directly under `dir` and one level below.
pub fn dir_size(dir: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .max_depth(2)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
