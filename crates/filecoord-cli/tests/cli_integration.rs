#![allow(deprecated)] // cargo_bin! macro doesn't exist yet in assert_cmd 2.1

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn filecoord() -> Command {
    let mut cmd = Command::cargo_bin("filecoord").unwrap();
    cmd.env_remove("FILECOORD_TIMEOUT");
    cmd.env_remove("FILECOORD_CONCURRENCY");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Create a temp dir holding `db.kdbx` with the given content
fn fixture(content: &[u8]) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let path = temp_dir.path().join("db.kdbx");
    fs::write(&path, content).expect("Failed to write fixture");
    (temp_dir, path)
}

#[test]
fn test_help() {
    filecoord()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bookmark"))
        .stdout(predicate::str::contains("append"));
}

#[test]
fn test_cat() {
    let (_dir, path) = fixture(b"hello world");
    filecoord()
        .arg("cat")
        .arg(&path)
        .assert()
        .success()
        .stdout("hello world");
}

#[test]
fn test_cat_missing_file() {
    let dir = TempDir::new().unwrap();
    filecoord()
        .arg("cat")
        .arg(dir.path().join("missing.kdbx"))
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Failed to read"));
}

#[test]
fn test_expired_timeout_exit_code() {
    let (_dir, path) = fixture(b"content");
    filecoord()
        .args(["--timeout", "0", "cat"])
        .arg(&path)
        .assert()
        .code(3)
        .stderr(predicate::str::contains("timed out"));
}

#[test]
fn test_write_then_cat() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("new.kdbx");

    filecoord()
        .arg("write")
        .arg(&path)
        .write_stdin("fresh content")
        .assert()
        .success();

    assert_eq!(fs::read(&path).unwrap(), b"fresh content");
    filecoord()
        .arg("cat")
        .arg(&path)
        .assert()
        .success()
        .stdout("fresh content");
}

#[test]
fn test_append() {
    let (_dir, path) = fixture(b"line one\n");
    filecoord()
        .arg("append")
        .arg(&path)
        .write_stdin("line two\n")
        .assert()
        .success();
    assert_eq!(fs::read(&path).unwrap(), b"line one\nline two\n");
}

#[test]
fn test_sequential_appends_accumulate() {
    let (_dir, path) = fixture(b"");
    for line in ["one\n", "two\n", "three\n"] {
        filecoord()
            .arg("append")
            .arg(&path)
            .write_stdin(line)
            .assert()
            .success();
    }
    assert_eq!(fs::read(&path).unwrap(), b"one\ntwo\nthree\n");
}

#[test]
fn test_append_empty_input_leaves_file() {
    let (_dir, path) = fixture(b"unchanged");
    let before = fs::metadata(&path).unwrap().modified().unwrap();

    filecoord()
        .arg("append")
        .arg(&path)
        .write_stdin("")
        .assert()
        .success();

    assert_eq!(fs::read(&path).unwrap(), b"unchanged");
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
}

#[test]
fn test_info() {
    let (_dir, path) = fixture(&[0u8; 2048]);
    filecoord()
        .arg("info")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("db.kdbx"))
        .stdout(predicate::str::contains("2.0K"));
}

#[test]
fn test_bookmark_prints_reference() {
    let (_dir, path) = fixture(b"content");
    filecoord()
        .args(["bookmark", "--location", "local"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"bookmark\""))
        .stdout(predicate::str::contains("\"location\": \"internal-documents\""))
        .stdout(predicate::str::contains("db.kdbx"));
}

#[test]
fn test_bookmark_then_open() {
    let (dir, path) = fixture(b"through a reference");
    let reference = dir.path().join("db.ref.json");

    filecoord()
        .arg("bookmark")
        .arg(&path)
        .arg("--output")
        .arg(&reference)
        .assert()
        .success();
    assert!(reference.exists());

    filecoord()
        .arg("open")
        .arg(&reference)
        .assert()
        .success()
        .stdout("through a reference");
}

#[test]
fn test_open_after_file_removed() {
    let (dir, path) = fixture(b"soon gone");
    let reference = dir.path().join("db.ref.json");

    filecoord()
        .arg("bookmark")
        .arg(&path)
        .arg("--output")
        .arg(&reference)
        .assert()
        .success();
    fs::remove_file(&path).unwrap();

    filecoord().arg("open").arg(&reference).assert().code(4);
}

#[test]
fn test_invalid_location_is_usage_error() {
    let (_dir, path) = fixture(b"content");
    filecoord()
        .args(["bookmark", "--location", "moon"])
        .arg(&path)
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown location kind"));
}
