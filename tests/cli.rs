//! CLI test cases.
//!
//! Anything that actually reaches the recognition service needs real
//! credentials and Poppler installed, so these stick to argument handling
//! and early failures.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::str::contains;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("searchify").unwrap();
    // Make sure an ambient key doesn't change argument handling.
    cmd.env_remove("GOOGLE_VISION_API_KEY");
    cmd
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_convert_requires_api_key() {
    cmd()
        .arg("convert")
        .arg("tests/fixtures/does-not-matter.pdf")
        .assert()
        .failure()
        .stderr(contains("GOOGLE_VISION_API_KEY"));
}

#[test]
fn test_convert_fails_on_missing_input() {
    cmd()
        .arg("convert")
        .arg("tests/fixtures/no-such-file.pdf")
        .arg("--api-key")
        .arg("not-a-real-key")
        .assert()
        .failure();
}
