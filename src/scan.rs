//! Input discovery: expand the paths given to `sync` into source files.
//!
//! Directories are walked recursively with include/exclude globs matched
//! against the path relative to the directory. Files named explicitly are
//! always taken. Output is sorted for deterministic ordering.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ScanConfig;

/// A file to ingest, with the filesystem facts that identify its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Seconds since the Unix epoch.
    pub modified_at: i64,
}

#[derive(Debug, Default)]
pub struct Discovery {
    pub files: Vec<SourceFile>,
    /// Directories that were walked completely.
    pub roots: Vec<PathBuf>,
    /// Inputs or entries that could not be read, with the reason.
    pub unreadable: Vec<(PathBuf, String)>,
}

pub fn discover(inputs: &[PathBuf], config: &ScanConfig) -> Result<Discovery> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut out = Discovery::default();
    for input in inputs {
        let root = match std::fs::canonicalize(input) {
            Ok(p) => p,
            Err(e) => {
                out.unreadable.push((input.clone(), e.to_string()));
                continue;
            }
        };

        if root.is_file() {
            match source_file(&root) {
                Ok(f) => out.files.push(f),
                Err(e) => out.unreadable.push((root, e.to_string())),
            }
            continue;
        }

        let mut complete = true;
        let walker = WalkDir::new(&root).follow_links(config.follow_symlinks);
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    complete = false;
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    out.unreadable.push((path, e.to_string()));
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }

            match source_file(path) {
                Ok(f) => out.files.push(f),
                Err(e) => out.unreadable.push((path.to_path_buf(), e.to_string())),
            }
        }
        if complete {
            out.roots.push(root);
        }
    }

    out.files.sort_by(|a, b| a.path.cmp(&b.path));
    out.files.dedup_by(|a, b| a.path == b.path);
    Ok(out)
}

pub fn source_file(path: &Path) -> std::io::Result<SourceFile> {
    let metadata = std::fs::metadata(path)?;
    let modified = metadata
        .modified()
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
    let modified_at = modified
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Ok(SourceFile {
        path: path.to_path_buf(),
        size_bytes: metadata.len(),
        modified_at,
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn walks_directories_with_default_excludes() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.md"), "a").unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.txt"), "b").unwrap();
        std::fs::create_dir_all(tmp.path().join(".git")).unwrap();
        std::fs::write(tmp.path().join(".git/config"), "x").unwrap();

        let found = discover(&[tmp.path().to_path_buf()], &ScanConfig::default()).unwrap();
        let names: Vec<_> = found
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.md", "b.txt"]);
        assert_eq!(found.roots.len(), 1);
    }

    #[test]
    fn explicit_files_and_missing_inputs() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("only.txt");
        std::fs::write(&file, "hello").unwrap();

        let found = discover(
            &[file.clone(), tmp.path().join("missing.txt")],
            &ScanConfig::default(),
        )
        .unwrap();
        assert_eq!(found.files.len(), 1);
        assert_eq!(found.files[0].size_bytes, 5);
        assert_eq!(found.unreadable.len(), 1);
        assert!(found.roots.is_empty());
    }

    #[test]
    fn exclude_globs_apply() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("keep.md"), "k").unwrap();
        std::fs::write(tmp.path().join("skip.log"), "s").unwrap();
        let config = ScanConfig {
            exclude_globs: vec!["*.log".to_string()],
            ..Default::default()
        };
        let found = discover(&[tmp.path().to_path_buf()], &config).unwrap();
        assert_eq!(found.files.len(), 1);
    }
}
