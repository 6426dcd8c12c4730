//! Tests of the `docintel` binary: commands, JSON output and exit codes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docintel_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docintel");
    path
}

fn setup() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    let files = root.join("files");
    fs::create_dir_all(&files).unwrap();
    fs::write(
        files.join("alpha.md"),
        "# Alpha\n\nnotes about rust programming with cargo and crates.",
    )
    .unwrap();
    fs::write(
        files.join("beta.txt"),
        "deployment notes: containers and infrastructure.",
    )
    .unwrap();
    fs::write(
        files.join("secret.md"),
        "payroll sheet. ssn 123-45-6789 for the new hire.",
    )
    .unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("docintel.toml");
    fs::write(
        &config_path,
        format!(
            r#"[store]
dir = "{}/data"

[resources]
workers = 1
"#,
            root.display()
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run(config: &Path, args: &[&str]) -> (String, String, i32) {
    let output = Command::new(docintel_binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .output()
        .expect("failed to run docintel binary");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.code().unwrap_or(-1),
    )
}

#[test]
fn init_creates_store() {
    let (tmp, config) = setup();
    let (stdout, stderr, code) = run(&config, &["init"]);
    assert_eq!(code, 0, "init failed: {}", stderr);
    assert!(stdout.contains("Store initialized"));
    assert!(tmp.path().join("data/catalog.sqlite").exists());
    assert!(tmp.path().join("data/collections/personal.sqlite").exists());
}

#[test]
fn init_writes_missing_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("nested/docintel.toml");
    let output = Command::new(docintel_binary())
        .current_dir(tmp.path())
        .arg("--config")
        .arg(&config)
        .arg("init")
        .output()
        .unwrap();
    assert!(output.status.success());
    let written = fs::read_to_string(&config).unwrap();
    assert!(written.contains("[embedding]"));
}

#[test]
fn sync_then_query_json() {
    let (tmp, config) = setup();
    let files = tmp.path().join("files");
    let files = files.to_str().unwrap();

    let (stdout, stderr, code) = run(&config, &["sync", files, "--json", "--progress", "off"]);
    assert_eq!(code, 0, "sync failed: {} {}", stdout, stderr);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["succeeded"], 3);
    assert_eq!(report["failed"], 0);

    let (stdout, _, code) = run(&config, &["query", "rust cargo crates", "--json"]);
    assert_eq!(code, 0);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let hits = result["hits"].as_array().unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0]["source_path"].as_str().unwrap().ends_with("alpha.md"));
    assert!(hits.iter().all(|h| h["tier"] == "public"));
    assert!(hits.iter().all(|h| h.get("vector").is_none()));
}

#[test]
fn public_query_hides_personal_text() {
    let (tmp, config) = setup();
    let files = tmp.path().join("files");
    run(&config, &["sync", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, _, code) = run(&config, &["query", "payroll ssn new hire"]);
    assert_eq!(code, 0);
    assert!(!stdout.contains("123-45-6789"));

    let (stdout, _, _) = run(&config, &["query", "payroll ssn new hire", "--max-tier", "personal"]);
    assert!(stdout.contains("secret.md"));
}

#[test]
fn privacy_scan_reports_tiers() {
    let (tmp, config) = setup();
    let secret = tmp.path().join("files/secret.md");
    let (stdout, _, code) = run(&config, &["privacy-scan", secret.to_str().unwrap(), "--json"]);
    assert_eq!(code, 0);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["items"][0]["tier"], "personal");
    assert!(!tmp.path().join("data").exists());
}

#[test]
fn failed_document_sets_exit_code_one() {
    let (tmp, config) = setup();
    let files = tmp.path().join("files");
    let mut junk = b"not a pdf".to_vec();
    junk.extend(std::iter::repeat(0u8).take(256));
    fs::write(files.join("junk.pdf"), junk).unwrap();

    let (stdout, _, code) = run(&config, &["sync", files.to_str().unwrap(), "--progress", "off"]);
    assert_eq!(code, 1, "{}", stdout);
    assert!(stdout.contains("junk.pdf"));
    assert!(stdout.contains("extraction"));
}

#[test]
fn invalid_config_exits_two() {
    let (_tmp, config) = setup();
    fs::write(&config, "[chunking]\ntarget_size = 64\noverlap = 60\n").unwrap();
    let (_, stderr, code) = run(&config, &["stats"]);
    assert_eq!(code, 2);
    assert!(stderr.contains("overlap"));
}

#[test]
fn stats_and_health_json() {
    let (tmp, config) = setup();
    let files = tmp.path().join("files");
    run(&config, &["sync", files.to_str().unwrap(), "--progress", "off"]);

    let (stdout, _, code) = run(&config, &["stats", "--json"]);
    assert_eq!(code, 0);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["lifetime"]["documents_processed"], 3);
    assert_eq!(stats["collections"].as_array().unwrap().len(), 3);

    let (stdout, _, code) = run(&config, &["health", "--json"]);
    assert_eq!(code, 0, "{}", stdout);
    let health: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(health["healthy"], true);
    assert_eq!(health["chunks_needing_reembed"], 0);
}

#[test]
fn corrupt_catalog_exits_two() {
    let (tmp, config) = setup();
    let data = tmp.path().join("data");
    fs::create_dir_all(&data).unwrap();
    fs::write(data.join("catalog.sqlite"), b"definitely not a database file. ".repeat(128)).unwrap();

    let files = tmp.path().join("files");
    let (_, stderr, code) = run(&config, &["sync", files.to_str().unwrap(), "--progress", "off"]);
    assert_eq!(code, 2, "{}", stderr);
    assert!(stderr.contains("corrupt"), "{}", stderr);
}
