//! Privacy tier classification.
//!
//! A [`PrivacyClassifier`] runs a fixed sequence of [`Detector`] variants over
//! a unit of text and reduces their signals with `max`:
//!
//! ```text
//!   text ──▶ Lexical ──┐
//!   path ──▶ PathHint ─┼──▶ max(signals ∪ {floor}) ──▶ PrivacyTier
//!   text ──▶ Entities ─┘
//! ```
//!
//! Signals only ever escalate. No signal means `Public`; a detector that
//! errors forces `Personal`. Classification is deterministic for a given
//! text, context and policy.

use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use crate::config::PrivacyConfig;
use crate::error::ClassificationError;
use crate::models::PrivacyTier;

const PERSONAL_PATTERNS: &[(&str, &str)] = &[
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
    ("email", r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b"),
    ("payment_card", r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b"),
    ("credential", r"(?i)\b(?:password|passwd|secret|private key)\b"),
    ("phone", r"(?i)\bphone\b[^\n]{0,20}?\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b"),
];

const BUSINESS_PATTERNS: &[(&str, &str)] = &[
    ("confidential", r"(?i)\b(?:confidential|proprietary|internal only)\b"),
    ("credential_ref", r"(?i)\b(?:api[_\s]key|access[_\s]token)\b"),
    ("commercial", r"(?i)\b(?:client|customer|revenue|profit)s?\b"),
    ("legal", r"(?i)\b(?:contract|agreement|deal)s?\b"),
];

/// The closed set of detectors, evaluated in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    Lexical,
    PathHint,
    Entities,
}

impl Detector {
    pub const ALL: [Detector; 3] = [Detector::Lexical, Detector::PathHint, Detector::Entities];

    pub fn name(&self) -> &'static str {
        match self {
            Detector::Lexical => "lexical",
            Detector::PathHint => "path_hint",
            Detector::Entities => "entities",
        }
    }
}

/// One fired detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub detector: &'static str,
    pub tier: PrivacyTier,
    pub label: String,
}

impl Signal {
    pub fn describe(&self) -> String {
        format!("{}:{}", self.detector, self.label)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub tier: PrivacyTier,
    pub signals: Vec<Signal>,
    /// Entity surface forms seen by the entity detector.
    pub entities: Vec<String>,
    /// A detector failed and the tier was forced to Personal.
    pub fail_safe: bool,
}

/// Caller-supplied context for one classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassifyContext<'a> {
    pub path: Option<&'a Path>,
    /// Document-level hint; the result is never below it.
    pub floor: PrivacyTier,
}

#[derive(Debug, Clone)]
struct PatternRule {
    label: String,
    regex: Regex,
    tier: PrivacyTier,
}

#[derive(Debug, Clone)]
struct DirectoryHint {
    pattern: String,
    matcher: GlobMatcher,
    tier: PrivacyTier,
}

/// Compiled privacy rules.
#[derive(Debug, Clone)]
pub struct PrivacyPolicy {
    patterns: Vec<PatternRule>,
    directories: Vec<DirectoryHint>,
    entity_threshold: usize,
}

impl PrivacyPolicy {
    pub fn from_config(config: &PrivacyConfig) -> Result<Self> {
        let mut patterns = Vec::new();
        if config.builtin_patterns {
            let builtin = PERSONAL_PATTERNS
                .iter()
                .map(|p| (p, PrivacyTier::Personal))
                .chain(BUSINESS_PATTERNS.iter().map(|p| (p, PrivacyTier::Business)));
            for ((label, pattern), tier) in builtin {
                patterns.push(PatternRule {
                    label: label.to_string(),
                    regex: Regex::new(pattern)
                        .with_context(|| format!("builtin pattern {}", label))?,
                    tier,
                });
            }
        }
        for rule in &config.keyword_rules {
            patterns.push(PatternRule {
                label: format!("keyword:{}", rule.pattern),
                regex: Regex::new(&rule.pattern).with_context(|| {
                    format!("invalid privacy keyword rule pattern '{}'", rule.pattern)
                })?,
                tier: rule.tier,
            });
        }

        let mut directories = Vec::new();
        for rule in &config.directory_rules {
            let glob = Glob::new(&rule.pattern).with_context(|| {
                format!("invalid privacy directory rule pattern '{}'", rule.pattern)
            })?;
            directories.push(DirectoryHint {
                pattern: rule.pattern.clone(),
                matcher: glob.compile_matcher(),
                tier: rule.tier,
            });
        }

        Ok(Self {
            patterns,
            directories,
            entity_threshold: config.entity_threshold,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum EntityKind {
    Person,
    Organization,
    Money,
    Date,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entity {
    pub kind: EntityKind,
    pub text: String,
}

/// Named-entity capability. Replaceable by an NLP backend.
pub trait EntityRecognizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn recognize(&self, text: &str) -> Result<Vec<Entity>, ClassificationError>;
}

/// Regex-based recognizer for names, organizations, money and dates.
pub struct HeuristicEntities {
    rules: Vec<EntityRule>,
}

struct EntityRule {
    kind: EntityKind,
    regex: Regex,
    /// Title-cased pairs on a Markdown heading line are section names.
    skip_headings: bool,
}

impl HeuristicEntities {
    pub fn new() -> Result<Self, ClassificationError> {
        let specs = [
            (
                EntityKind::Person,
                r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?[ \t]+[A-Z][a-z]+(?:[ \t]+[A-Z][a-z]+)?",
                false,
            ),
            (
                EntityKind::Person,
                r"\b[A-Z][a-z]{1,20}[ \t]+[A-Z][a-z]{1,20}\b",
                true,
            ),
            (
                EntityKind::Organization,
                r"\b(?:[A-Z][A-Za-z&]+[ \t]+)+(?:Inc|LLC|Ltd|Corp|Corporation|GmbH|Company|Bank)\b",
                false,
            ),
            (
                EntityKind::Money,
                r"[$€£]\s?\d[\d,]*(?:\.\d+)?|\b\d[\d,]*(?:\.\d+)?\s?(?:USD|EUR|GBP|dollars)\b",
                false,
            ),
            (
                EntityKind::Date,
                r"\b\d{4}-\d{2}-\d{2}\b|\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\.?\s+\d{1,2}(?:,\s*\d{4})?",
                false,
            ),
        ];
        let mut rules = Vec::with_capacity(specs.len());
        for (kind, pattern, skip_headings) in specs {
            let regex = Regex::new(pattern).map_err(|e| ClassificationError {
                detector: "entities",
                reason: e.to_string(),
            })?;
            rules.push(EntityRule {
                kind,
                regex,
                skip_headings,
            });
        }
        Ok(Self { rules })
    }
}

impl EntityRecognizer for HeuristicEntities {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn recognize(&self, text: &str) -> Result<Vec<Entity>, ClassificationError> {
        let mut found = BTreeSet::new();
        for rule in &self.rules {
            for m in rule.regex.find_iter(text) {
                if rule.skip_headings && on_heading_line(text, m.start()) {
                    continue;
                }
                found.insert(Entity {
                    kind: rule.kind,
                    text: m.as_str().trim().to_string(),
                });
            }
        }
        Ok(found.into_iter().collect())
    }
}

fn on_heading_line(text: &str, offset: usize) -> bool {
    let line_start = text[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    text[line_start..].trim_start().starts_with('#')
}

/// Assigns privacy tiers to text.
#[derive(Clone)]
pub struct PrivacyClassifier {
    policy: Arc<PrivacyPolicy>,
    recognizer: Option<Arc<dyn EntityRecognizer>>,
}

impl PrivacyClassifier {
    /// Classifier with the built-in heuristic recognizer when the policy
    /// enables entity detection.
    pub fn new(policy: PrivacyPolicy) -> Self {
        let recognizer: Option<Arc<dyn EntityRecognizer>> = if policy.entity_threshold > 0 {
            match HeuristicEntities::new() {
                Ok(r) => Some(Arc::new(r)),
                Err(e) => Some(Arc::new(UnavailableRecognizer(e.reason))),
            }
        } else {
            None
        };
        Self {
            policy: Arc::new(policy),
            recognizer,
        }
    }

    pub fn from_config(config: &PrivacyConfig) -> Result<Self> {
        Ok(Self::new(PrivacyPolicy::from_config(config)?))
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn EntityRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn classify(&self, text: &str, ctx: ClassifyContext<'_>) -> PrivacyTier {
        self.classify_detailed(text, ctx).tier
    }

    pub fn classify_detailed(&self, text: &str, ctx: ClassifyContext<'_>) -> Classification {
        let mut signals = Vec::new();
        let mut entities = Vec::new();
        let mut fail_safe = false;

        if ctx.floor > PrivacyTier::Public {
            signals.push(Signal {
                detector: "hint",
                tier: ctx.floor,
                label: "caller".to_string(),
            });
        }

        for detector in Detector::ALL {
            match self.run(detector, text, ctx, &mut entities) {
                Ok(fired) => signals.extend(fired),
                Err(e) => {
                    warn!(detector = detector.name(), error = %e, "privacy detector failed; classifying as personal");
                    fail_safe = true;
                    signals.push(Signal {
                        detector: detector.name(),
                        tier: PrivacyTier::Personal,
                        label: "detector_error".to_string(),
                    });
                }
            }
        }

        let tier = signals
            .iter()
            .map(|s| s.tier)
            .fold(ctx.floor, PrivacyTier::max);

        Classification {
            tier,
            signals,
            entities,
            fail_safe,
        }
    }

    fn run(
        &self,
        detector: Detector,
        text: &str,
        ctx: ClassifyContext<'_>,
        entities: &mut Vec<String>,
    ) -> Result<Vec<Signal>, ClassificationError> {
        match detector {
            Detector::Lexical => Ok(self
                .policy
                .patterns
                .iter()
                .filter(|p| p.regex.is_match(text))
                .map(|p| Signal {
                    detector: detector.name(),
                    tier: p.tier,
                    label: p.label.clone(),
                })
                .collect()),
            Detector::PathHint => {
                let Some(path) = ctx.path else {
                    return Ok(Vec::new());
                };
                let path = path.to_string_lossy();
                Ok(self
                    .policy
                    .directories
                    .iter()
                    .filter(|d| d.matcher.is_match(path.as_ref()))
                    .map(|d| Signal {
                        detector: detector.name(),
                        tier: d.tier,
                        label: d.pattern.clone(),
                    })
                    .collect())
            }
            Detector::Entities => {
                let Some(recognizer) = &self.recognizer else {
                    return Ok(Vec::new());
                };
                let found = recognizer.recognize(text)?;
                entities.extend(found.iter().map(|e| e.text.clone()));
                let threshold = self.policy.entity_threshold;
                if threshold > 0 && found.len() > threshold {
                    Ok(vec![Signal {
                        detector: detector.name(),
                        tier: PrivacyTier::Business,
                        label: format!("{} entities via {}", found.len(), recognizer.name()),
                    }])
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }
}

/// Tier after a re-classification pass. Never lowers `previous`.
pub fn reclassified(previous: PrivacyTier, candidate: PrivacyTier) -> PrivacyTier {
    previous.max(candidate)
}

struct UnavailableRecognizer(String);

impl EntityRecognizer for UnavailableRecognizer {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn recognize(&self, _text: &str) -> Result<Vec<Entity>, ClassificationError> {
        Err(ClassificationError {
            detector: "entities",
            reason: self.0.clone(),
        })
    }
}
