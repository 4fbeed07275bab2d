//! Maintenance CLI tests

use assert_cmd::{cargo::cargo_bin_cmd, Command};
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn chunkcache() -> Command {
    let mut cmd = cargo_bin_cmd!("chunkcache");
    cmd.env_remove("CHUNKCACHE_CONFIG");
    cmd
}

/// Write a config pointing at `<temp>/cache` and return its path
fn write_config(temp: &TempDir, size: &str) -> PathBuf {
    let path = temp.path().join("config.toml");
    let content = format!(
        "[cache]\nsize = \"{}\"\nlocation = \"{}\"\ncache_line_size = \"10\"\nsidecar = \"json\"\n",
        size,
        cache_dir(temp).display()
    );
    std::fs::write(&path, content).unwrap();
    path
}

fn cache_dir(temp: &TempDir) -> PathBuf {
    temp.path().join("cache")
}

fn put_entry(root: &Path, name: &str, len: usize) {
    std::fs::create_dir_all(root).unwrap();
    std::fs::write(root.join(name), vec![7u8; len]).unwrap();
    std::fs::write(
        root.join(format!("{name}.meta.json")),
        r#"{"etag":"abc","cache_line_size":null,"total_size":null}"#,
    )
    .unwrap();
}

#[test]
fn help_displays() {
    chunkcache()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Partial-file disk cache"));
}

#[test]
fn version_displays() {
    chunkcache()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("chunkcache"));
}

#[test]
fn config_path_honors_flag() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("custom.toml");
    chunkcache()
        .args(["config", "path", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("custom.toml"));
}

#[test]
fn config_show_prints_toml() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1M");
    chunkcache()
        .args(["config", "show", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("[general]"))
        .stdout(predicate::str::contains("cache_line_size = \"10\""));
}

#[test]
fn config_init_creates_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("config.toml");
    chunkcache()
        .args(["config", "init", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration initialized"));
    assert!(path.exists());
}

#[test]
fn invalid_config_reports_hint() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");
    std::fs::write(&path, "[cache]\ncache_line_size = \"0\"\nlocation = \"/tmp/x\"\n").unwrap();

    chunkcache()
        .args(["stats", "-c"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"))
        .stderr(predicate::str::contains("Hint:"));
}

#[test]
fn stats_json_counts_entries() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1K");
    put_entry(&cache_dir(&temp).join("default"), "a", 10);
    put_entry(&cache_dir(&temp).join("default").join("dir"), ".b#chunk0", 10);

    chunkcache()
        .args(["stats", "--format", "json", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"entries\": 2"))
        .stdout(predicate::str::contains("\"total_bytes\": 20"))
        .stdout(predicate::str::contains("\"limit_bytes\": 1024"))
        .stdout(predicate::str::contains("\"status\": \"ok\""));
}

#[test]
fn stats_plain_on_empty_cache() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1K");

    chunkcache()
        .args(["stats", "--format", "plain", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::eq("0\n0\n1024\n"));
}

#[test]
fn refresh_evicts_over_limit() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "15");
    let root = cache_dir(&temp).join("default");
    put_entry(&root, "a", 10);
    put_entry(&root, "b", 10);

    chunkcache()
        .args(["refresh", "--format", "json", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"evicted\": 1"))
        .stdout(predicate::str::contains("\"remaining_bytes\": 10"));

    let left = ["a", "b"].iter().filter(|n| root.join(n).exists()).count();
    assert_eq!(left, 1);
}

#[test]
fn refresh_table_within_limit() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1K");
    put_entry(&cache_dir(&temp).join("default"), "a", 10);

    chunkcache()
        .args(["refresh", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Cache within limit"));
}

#[test]
fn clear_with_yes_removes_only_selected_profile() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1K");
    put_entry(&cache_dir(&temp).join("default"), "a", 10);
    put_entry(&cache_dir(&temp).join("other"), "a", 10);

    chunkcache()
        .args(["clear", "--yes", "--profile", "other", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Cache cleared"));

    assert!(!cache_dir(&temp).join("other").exists());
    assert!(cache_dir(&temp).join("default").join("a").exists());
}

#[test]
fn clear_declined_keeps_entries() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1K");
    put_entry(&cache_dir(&temp).join("default"), "a", 10);

    chunkcache()
        .args(["clear", "-c"])
        .arg(&path)
        .write_stdin("n\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Aborted."));

    assert!(cache_dir(&temp).join("default").join("a").exists());
}

#[test]
fn clear_empty_profile() {
    let temp = TempDir::new().unwrap();
    let path = write_config(&temp, "1K");

    chunkcache()
        .args(["clear", "--yes", "-c"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("already empty"));
}
