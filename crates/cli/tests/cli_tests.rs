//! Binary-level tests for the cohorts CLI

use assert_cmd::Command;
use cohorts_cache::{CacheStore, Params, ProvenanceSnapshot, derive_key};
use predicates::prelude::*;
use tempfile::TempDir;

fn seeded(versions: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::new(temp.path());
    for (patient, version) in versions {
        let params = Params::new().with("merge_type", "union");
        let key = derive_key("effects", patient, &params).unwrap();
        let provenance = ProvenanceSnapshot::new()
            .with("cohorts", "0.4.0")
            .with("varcode", *version);
        store.put(&key, &vec![1_u32, 2, 3], &provenance).unwrap();
    }
    temp
}

fn cohorts(cache: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cohorts").unwrap();
    cmd.env_remove("RUST_LOG").arg("--cache-dir").arg(cache.path());
    cmd
}

#[test]
fn summarize_consistent_cache_succeeds() {
    let cache = seeded(&[("p1", "0.5.10"), ("p2", "0.5.10")]);
    cohorts(&cache)
        .arg("summarize")
        .assert()
        .success()
        .stdout(predicate::str::contains("effects: consistent (2 entries)"))
        .stdout(predicate::str::contains("varcode==0.5.10"));
}

#[test]
fn summarize_split_cache_exits_with_two() {
    let cache = seeded(&[("p1", "0.5.10"), ("p2", "0.6.0")]);
    cohorts(&cache)
        .arg("summarize")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("overall: error"));
}

#[test]
fn list_json_reports_every_entry() {
    let cache = seeded(&[("p1", "0.5.10"), ("p2", "0.5.10"), ("p3", "0.5.10")]);
    let output = cohorts(&cache)
        .args(["list", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["entries"].as_array().unwrap().len(), 3);
    assert_eq!(value["entries"][0]["key"]["computation"], "effects");
}

#[test]
fn clear_all_empties_the_cache() {
    let cache = seeded(&[("p1", "0.5.10")]);
    cohorts(&cache).args(["clear", "--all"]).assert().success();
    cohorts(&cache)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn delete_rejects_malformed_fingerprint() {
    let cache = seeded(&[("p1", "0.5.10")]);
    cohorts(&cache)
        .args(["delete", "-c", "effects", "-p", "p1", "-f", "not-hex"])
        .assert()
        .failure();
}
