//! Wiki-style `[[target]]` link extraction.

use regex::Regex;
use std::sync::OnceLock;

fn wiki_link() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]\|\n]+)(?:\|[^\]\n]*)?\]\]").ok())
        .as_ref()
}

/// Link targets in order of first appearance, aliases stripped, deduplicated.
pub fn extract_wiki_links(text: &str) -> Vec<String> {
    let Some(re) = wiki_link() else {
        return Vec::new();
    };
    let mut out: Vec<String> = Vec::new();
    for cap in re.captures_iter(text) {
        let target = cap[1].trim();
        // `[[Note#Section]]` links to Note.
        let target = target.split('#').next().unwrap_or(target).trim();
        if !target.is_empty() && !out.iter().any(|t| t == target) {
            out.push(target.to_string());
        }
    }
    out
}

/// Whether `links` reference the document at `path` by file stem.
pub fn links_to(links: &[String], path: &str) -> bool {
    let stem = std::path::Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase());
    match stem {
        Some(stem) => links.iter().any(|l| l.to_lowercase() == stem),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_targets_without_aliases() {
        let links = extract_wiki_links("See [[Alpha]], [[Beta|b]] and [[Alpha]] again.");
        assert_eq!(links, vec!["Alpha", "Beta"]);
    }

    #[test]
    fn section_links_point_at_note() {
        assert_eq!(extract_wiki_links("[[Gamma#Intro]]"), vec!["Gamma"]);
    }

    #[test]
    fn ignores_unclosed_links() {
        assert!(extract_wiki_links("[[broken\nlink]]").is_empty());
    }

    #[test]
    fn links_to_matches_file_stem() {
        let links = vec!["Project Plan".to_string()];
        assert!(links_to(&links, "/vault/notes/project plan.md"));
        assert!(!links_to(&links, "/vault/notes/other.md"));
    }
}
