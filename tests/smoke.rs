//! Smoke tests -- verify the binary runs and key subcommands exist.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("arcsent")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Host security monitoring daemon"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("arcsent")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("arcsent"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("arcsent")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_check_config_validates() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(
        &path,
        r#"{"storage": {"db_path": "/tmp/arcsent-smoke-db"}}"#,
    )
    .unwrap();

    Command::cargo_bin("arcsent")
        .unwrap()
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicates::str::contains("OK"));
}

#[test]
fn test_check_config_rejects_bad_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"storage": {"db_path": "relative"}}"#).unwrap();

    Command::cargo_bin("arcsent")
        .unwrap()
        .args(["check-config", "--config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn test_fingerprint_prints_digest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob");
    std::fs::write(&path, b"abc").unwrap();

    Command::cargo_bin("arcsent")
        .unwrap()
        .args(["fingerprint", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        ));
}
