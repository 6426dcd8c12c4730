use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::PrivacyTier;
use crate::privacy::PrivacyPolicy;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("./data/docintel")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_size")]
    pub target_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_size: default_target_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_target_size() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base delay before the first retry; doubles per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_backoff_ms() -> u64 {
    500
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// A glob over source paths mapped to a minimum tier.
#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryRule {
    pub pattern: String,
    pub tier: PrivacyTier,
}

/// A regular expression over chunk text mapped to a tier.
#[derive(Debug, Deserialize, Clone)]
pub struct KeywordRule {
    pub pattern: String,
    pub tier: PrivacyTier,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrivacyConfig {
    #[serde(default = "default_true")]
    pub builtin_patterns: bool,
    /// Entities above this count raise a chunk to Business. 0 disables.
    #[serde(default = "default_entity_threshold")]
    pub entity_threshold: usize,
    #[serde(default)]
    pub directory_rules: Vec<DirectoryRule>,
    #[serde(default)]
    pub keyword_rules: Vec<KeywordRule>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            builtin_patterns: true,
            entity_threshold: default_entity_threshold(),
            directory_rules: Vec::new(),
            keyword_rules: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_entity_threshold() -> usize {
    5
}

/// Overrides for the detected hardware profile.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ResourceLimits {
    pub batch_size: Option<usize>,
    pub memory_ceiling_mb: Option<u64>,
    pub workers: Option<usize>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_max_k() -> usize {
    100
}
fn default_snippet_chars() -> usize {
    240
}

/// Annotated configuration written by `docintel init`.
pub const DEFAULT_CONFIG: &str = include_str!("../config/docintel.example.toml");

impl Config {
    /// Defaults rooted at `store_dir`.
    pub fn with_store_dir(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: StoreConfig {
                dir: store_dir.into(),
            },
            ..Default::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate a TOML config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.chunking.target_size < 16 {
        bail!("chunking.target_size must be >= 16");
    }
    if config.chunking.overlap * 2 > config.chunking.target_size {
        bail!("chunking.overlap must be at most half of chunking.target_size");
    }

    if config.retrieval.default_k == 0 || config.retrieval.max_k == 0 {
        bail!("retrieval.default_k and retrieval.max_k must be >= 1");
    }
    if config.retrieval.default_k > config.retrieval.max_k {
        bail!("retrieval.default_k must not exceed retrieval.max_k");
    }

    if config.resources.batch_size == Some(0) {
        bail!("resources.batch_size must be >= 1");
    }
    if config.resources.workers == Some(0) {
        bail!("resources.workers must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "hash" | "disabled" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash, ollama, openai, local, or disabled.",
            other
        ),
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    // Compiles every configured pattern.
    PrivacyPolicy::from_config(&config.privacy)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.chunking.target_size, 512);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.max_retries, 3);
        assert!(config.privacy.builtin_patterns);
        assert_eq!(config.privacy.entity_threshold, 5);
        assert_eq!(config.store.dir, PathBuf::from("./data/docintel"));
    }

    #[test]
    fn default_config_template_parses() {
        let config = parse_config(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.retrieval.default_k, 10);
        assert_eq!(config.scan.max_file_bytes, 50 * 1024 * 1024);
        assert!(config.resources.workers.is_none());
    }

    #[test]
    fn privacy_rules_parse() {
        let config = parse_config(
            r#"
[[privacy.directory_rules]]
pattern = "**/finance/**"
tier = "personal"

[[privacy.keyword_rules]]
pattern = "(?i)project\\s+falcon"
tier = "business"
"#,
        )
        .unwrap();
        assert_eq!(config.privacy.directory_rules.len(), 1);
        assert_eq!(config.privacy.directory_rules[0].tier, PrivacyTier::Personal);
        assert_eq!(config.privacy.keyword_rules[0].tier, PrivacyTier::Business);
    }

    #[test]
    fn invalid_keyword_pattern_is_rejected() {
        let err = parse_config(
            r#"
[[privacy.keyword_rules]]
pattern = "(unclosed"
tier = "business"
"#,
        )
        .unwrap_err();
        assert!(format!("{:#}", err).contains("keyword rule"));
    }

    #[test]
    fn overlap_must_fit_target() {
        let err = parse_config("[chunking]\ntarget_size = 64\noverlap = 40\n").unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn remote_provider_requires_model_and_dims() {
        assert!(parse_config("[embedding]\nprovider = \"ollama\"\n").is_err());
        assert!(parse_config(
            "[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n"
        )
        .is_ok());
    }

    #[test]
    fn unknown_provider_is_rejected() {
        assert!(parse_config("[embedding]\nprovider = \"magic\"\n").is_err());
    }

    #[test]
    fn resource_overrides() {
        let config =
            parse_config("[resources]\nbatch_size = 4\nmemory_ceiling_mb = 2048\n").unwrap();
        assert_eq!(config.resources.batch_size, Some(4));
        assert_eq!(config.resources.memory_ceiling_mb, Some(2048));
        assert!(parse_config("[resources]\nbatch_size = 0\n").is_err());
    }
}
