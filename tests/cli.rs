//! CLI test cases.
//!
//! The happy-path `extract` run needs OCR tools and model weights on the
//! machine, so it is `#[ignore]`d by default; everything else exercises the
//! argument handling and the failure paths that must not depend on any
//! external tool.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("textlift").unwrap()
}

/// Write a tiny decodable PNG for pipeline input.
fn write_test_png(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("input.png");
    let img = image::GrayImage::from_fn(8, 8, |x, _| {
        image::Luma([if x < 4 { 10 } else { 240 }])
    });
    img.save(&path).unwrap();
    path
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
fn backends_lists_the_catalog() {
    cmd()
        .arg("backends")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"phi3\""))
        .stdout(predicate::str::contains("\"qwen25\""))
        .stdout(predicate::str::contains("requires_accelerator"));
}

#[test]
fn extract_rejects_an_unknown_backend_before_doing_any_work() {
    let tmpdir = tempfile::tempdir().unwrap();
    let image_path = write_test_png(tmpdir.path());
    cmd()
        .arg("extract")
        .arg(&image_path)
        .args(["--backend", "not-a-model"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown backend"));
}

#[test]
fn extract_rejects_a_missing_input_file() {
    cmd()
        .arg("extract")
        .arg("definitely-missing.png")
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
#[ignore = "needs tesseract, easyocr and local model weights"]
fn extract_runs_end_to_end_with_the_text_backend() {
    let tmpdir = tempfile::tempdir().unwrap();
    let image_path = write_test_png(tmpdir.path());
    cmd()
        .arg("extract")
        .arg(&image_path)
        .args(["--backend", "qwen25"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"enhanced_text\""));
}
