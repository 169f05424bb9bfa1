//! Integration tests for the CLI binary
//!
//! These invoke the compiled `medir` binary with real arguments and real
//! files; nothing here touches the network.

mod common;

use std::process::Command;

use assert_cmd::{assert::OutputAssertExt, cargo::CommandCargoExt};
use predicates::prelude::*;

use common::{build_safetensors, le16, write_archive};

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Usage: medir"));
}

#[test]
fn test_cli_version_flag() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("medir"));
}

#[test]
fn test_cli_unknown_command() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("unknown");
    cmd.assert().failure();
}

#[test]
fn test_cli_analyze_requires_repo() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("analyze");
    cmd.assert().failure();
}

#[test]
fn test_cli_analyze_rejects_malformed_repo() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("analyze").arg("--hf-repo").arg("not-a-repo");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("OWNER/REPO"));
}

#[test]
fn test_cli_analyze_help_lists_flags() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("analyze").arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("--hf-repo"))
        .stdout(predicate::str::contains("--hf-glob"))
        .stdout(predicate::str::contains("--json"));
}

#[test]
fn test_cli_metadata_requires_source() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("metadata");
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("--name or --hf-repo"));
}

#[test]
fn test_cli_metadata_local_file() {
    let bytes = build_safetensors(
        &[
            ("a", "BF16", vec![2], le16(&[0x3F80, 0xBF80])),
            ("b", "BF16", vec![1], le16(&[0x0000])),
            ("c", "F32", vec![1], vec![0u8; 4]),
        ],
        &[("format", "pt")],
    );
    let f = write_archive(&bytes);

    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("metadata").arg("--name").arg(f.path());
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("2 tensors of type BF16"))
        .stdout(predicate::str::contains("1 tensors of type F32"))
        .stdout(predicate::str::contains("- format: pt"));
}

#[test]
fn test_cli_metadata_missing_file() {
    let mut cmd = Command::cargo_bin("medir").expect("test");
    cmd.arg("metadata").arg("--name").arg("/no/such/file.safetensors");
    cmd.assert().failure().code(1);
}
