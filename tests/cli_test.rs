//! Tests for the civicvault binary's command line surface

use assert_cmd::Command;
use predicates::prelude::*;

fn civicvault() -> Command {
    Command::cargo_bin("civicvault").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    civicvault()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("manager"))
        .stdout(predicate::str::contains("node"))
        .stdout(predicate::str::contains("store"))
        .stdout(predicate::str::contains("fetch"));
}

#[test]
fn test_node_requires_id() {
    civicvault()
        .arg("node")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--id"));
}

#[test]
fn test_zero_node_count_rejected() {
    let dir = tempfile::tempdir().unwrap();
    civicvault()
        .args(["--node-count", "0", "nodes", "--wait", "0"])
        .args(["--total-disk-size", "3072"])
        .arg("--data-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("node_count"));
}

#[test]
fn test_fetch_unknown_hash_fails() {
    let dir = tempfile::tempdir().unwrap();
    civicvault()
        .args(["fetch", "0000", "--wait", "0"])
        .args(["--discovery-addr", "127.0.0.1:0"])
        .args(["--total-disk-size", "3072"])
        .arg("--data-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("NotFound"));
}

#[test]
fn test_store_without_nodes_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.txt");
    std::fs::write(&input, b"some civic data").unwrap();

    civicvault()
        .arg("store")
        .arg(&input)
        .args(["--wait", "0", "--discovery-addr", "127.0.0.1:0"])
        .args(["--total-disk-size", "3072"])
        .arg("--data-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("NoNodesOnline"));

    assert!(!dir.path().join("catalog.json").exists());
}

#[test]
fn test_nodes_lists_empty_cluster() {
    let dir = tempfile::tempdir().unwrap();
    civicvault()
        .args(["nodes", "--wait", "0", "--discovery-addr", "127.0.0.1:0"])
        .args(["--total-disk-size", "3072"])
        .arg("--data-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("0 files"));
}
