//! End-to-end tests for the CLI surface: exit codes and setup failures.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn harvester_cmd() -> Command {
    Command::cargo_bin("harvester").expect("binary should build")
}

fn write_empty_manifest(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("manifest.json");
    std::fs::write(&path, r#"{ "courses": [] }"#).expect("failed to write manifest");
    path
}

#[test]
fn test_help_shows_usage() {
    harvester_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("harvester"))
        .stdout(predicate::str::contains("--dir"));
}

#[test]
fn test_version_flag() {
    harvester_cmd().arg("--version").assert().success();
}

#[test]
fn test_missing_manifest_is_setup_fatal() {
    let temp_dir = TempDir::new().unwrap();

    harvester_cmd()
        .args(["-m", "/nonexistent/manifest.json"])
        .arg("-d")
        .arg(temp_dir.path().join("out"))
        .args(["--headless", "-q"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_mirror_without_credential_is_setup_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = write_empty_manifest(&temp_dir);

    harvester_cmd()
        .arg("-m")
        .arg(&manifest)
        .arg("-d")
        .arg(temp_dir.path().join("out"))
        .args(["--mirror", "Backup"])
        .args(["--token-file", "/nonexistent/token.json"])
        .args(["--headless", "-q"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn test_empty_manifest_completes_cleanly() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = write_empty_manifest(&temp_dir);

    harvester_cmd()
        .arg("-m")
        .arg(&manifest)
        .arg("-d")
        .arg(temp_dir.path().join("out"))
        .args(["--headless", "-q"])
        .assert()
        .success();
}

#[test]
fn test_reset_flag_accepted() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = write_empty_manifest(&temp_dir);

    harvester_cmd()
        .arg("-m")
        .arg(&manifest)
        .arg("-d")
        .arg(temp_dir.path().join("out"))
        .args(["--headless", "-q", "-r"])
        .assert()
        .success();
}

#[test]
fn test_partial_item_failure_still_exits_zero() {
    let temp_dir = TempDir::new().unwrap();
    let manifest_path = temp_dir.path().join("manifest.json");
    // Port 9 (discard) refuses connections immediately; the single material
    // fails but item failures never escalate to the exit code.
    let manifest = serde_json::json!({
        "courses": [
            {
                "title": "Course A",
                "lessons": [
                    {
                        "title": "Lesson 01",
                        "materials": [
                            { "url": "http://127.0.0.1:9/file.pdf", "file_name": "file.pdf" }
                        ]
                    }
                ]
            }
        ]
    });
    std::fs::write(&manifest_path, serde_json::to_string(&manifest).unwrap()).unwrap();

    harvester_cmd()
        .arg("-m")
        .arg(&manifest_path)
        .arg("-d")
        .arg(temp_dir.path().join("out"))
        .args(["--headless", "-q", "--max-retries", "1", "--item-timeout", "30"])
        .assert()
        .success();
}

#[test]
fn test_unwritable_download_dir_is_setup_fatal() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = write_empty_manifest(&temp_dir);
    // A path under an existing file cannot be created as a directory.
    let blocker = temp_dir.path().join("blocker");
    std::fs::write(&blocker, b"file, not dir").unwrap();

    harvester_cmd()
        .arg("-m")
        .arg(&manifest)
        .arg("-d")
        .arg(blocker.join("out"))
        .args(["--headless", "-q"])
        .assert()
        .failure()
        .code(1);
}
