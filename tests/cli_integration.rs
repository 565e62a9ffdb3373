use assert_cmd::Command;
use predicates::prelude::*;

/// The CLI confined to loopback with an ephemeral discovery port
fn ddalab_lsl() -> Command {
    let mut cmd = Command::cargo_bin("ddalab-lsl").unwrap();
    cmd.env("LSL_MULTICAST_ENABLED", "false")
        .env("LSL_DISCOVERY_PORT", "0")
        .env("LSL_BIND_ADDR", "127.0.0.1")
        .env_remove("RUST_LOG");
    cmd
}

// =============================================================================
// GENERAL
// =============================================================================

#[test]
fn test_no_args_shows_help() {
    ddalab_lsl()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}

#[test]
fn test_version_flag() {
    ddalab_lsl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ddalab-lsl"));
}

#[test]
fn test_help_flag() {
    ddalab_lsl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("send"))
        .stdout(predicate::str::contains("receive"));
}

// =============================================================================
// LIST
// =============================================================================

#[test]
fn test_list_without_streams() {
    ddalab_lsl()
        .args(["list", "--wait-ms", "100"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No streams found"));
}

#[test]
fn test_list_json_without_streams() {
    ddalab_lsl()
        .args(["list", "--wait-ms", "100", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[]"));
}

#[test]
fn test_list_rejects_bad_predicate() {
    ddalab_lsl()
        .args(["list", "--wait-ms", "100", "--predicate", "name="])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid predicate"));
}

#[test]
fn test_bad_environment_is_an_input_error() {
    ddalab_lsl()
        .env("LSL_DISCOVERY_PORT", "not-a-port")
        .args(["list", "--wait-ms", "100"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("LSL_DISCOVERY_PORT"));
}

// =============================================================================
// SEND
// =============================================================================

#[test]
fn test_send_rejects_unknown_format() {
    ddalab_lsl()
        .args(["send", "--format", "complex"])
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unsupported value encoding"));
}

#[test]
fn test_send_rejects_zero_channels() {
    ddalab_lsl()
        .args(["send", "--channels", "0"])
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Channel count"));
}

#[test]
fn test_send_skips_malformed_lines() {
    ddalab_lsl()
        .args(["send", "--name", "CliSend", "--format", "int32", "--channels", "2"])
        .write_stdin("1 2\nthree four\n5 6 7\n8 9\n")
        .assert()
        .success()
        .stderr(predicate::str::contains("Skipping line 2"))
        .stderr(predicate::str::contains("Skipping line 3"))
        .stderr(predicate::str::contains("Sent 2 sample(s), skipped 2"));
}

// =============================================================================
// RECEIVE
// =============================================================================

#[test]
fn test_receive_reports_missing_stream() {
    ddalab_lsl()
        .args(["receive", "--name", "Nobody", "--timeout-secs", "0.2", "--no-recover"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("No stream named 'Nobody' found"));
}

#[test]
fn test_receive_rejects_unknown_format() {
    ddalab_lsl()
        .args(["receive", "--format", "complex", "--timeout-secs", "0.2"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Unsupported value encoding"));
}
