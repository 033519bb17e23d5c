//! Behavioural smoke test for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("mist");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn cli_help_lists_both_subcommands() {
    let mut cmd = cargo_bin_cmd!("mist");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("route"))
        .stdout(predicate::str::contains("connect"));
}
