//! Behavioural smoke tests for the CLI entrypoint.

#[path = "common/cli_env.rs"]
mod cli_env;

use assert_cmd::cargo::cargo_bin_cmd;
use cli_env::CliEnv;
use predicates::str::contains;
use rstest::{fixture, rstest};

#[fixture]
fn env() -> CliEnv {
    CliEnv::new()
}

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("drydock");
    cmd.assert().code(2).stderr(contains("Usage"));
}

#[test]
fn help_lists_every_subcommand() {
    let mut cmd = cargo_bin_cmd!("drydock");
    let output = cmd
        .arg("--help")
        .output()
        .unwrap_or_else(|err| panic!("run drydock: {err}"));
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for name in ["create", "list", "status", "exec", "console", "destroy", "reap"] {
        assert!(help.contains(name), "missing {name} in:\n{help}");
    }
}

#[rstest]
fn list_with_no_sessions_prints_nothing(env: CliEnv) {
    env.command().arg("list").assert().success().stdout("");
}

#[rstest]
fn destroy_unknown_session_fails(env: CliEnv) {
    env.command()
        .args(["destroy", "ghost"])
        .assert()
        .code(1)
        .stderr(contains("no session named 'ghost'"));
}

#[rstest]
fn create_rejects_invalid_names(env: CliEnv) {
    env.command()
        .args(["create", "Not_A_Hostname"])
        .assert()
        .code(1)
        .stderr(contains("invalid name"));
}

#[rstest]
fn create_rejects_unknown_provider(env: CliEnv) {
    env.command()
        .args(["create", "dev-box", "--provider", "nowhere"])
        .assert()
        .code(1)
        .stderr(contains("known providers: scaleway, sprites"));
}

#[rstest]
fn create_rejects_both_payload_sources(env: CliEnv) {
    env.command()
        .args([
            "create",
            "dev-box",
            "--user-data",
            "#cloud-config",
            "--boot-script",
            "boot.sh",
        ])
        .assert()
        .code(2)
        .stderr(contains("cannot be used with"));
}

#[rstest]
fn create_reports_missing_boot_script(env: CliEnv) {
    let missing = env.path("missing.sh");
    env.command()
        .args(["create", "dev-box", "--boot-script", missing.as_str()])
        .assert()
        .code(1)
        .stderr(contains("failed to read boot payload file"));
}

#[rstest]
fn exec_rejects_control_characters(env: CliEnv) {
    env.command()
        .args(["exec", "dev-box", "--", "echo", "a\tb"])
        .assert()
        .code(1)
        .stderr(contains("control characters"));
}

#[rstest]
fn invalid_configuration_names_the_variable(env: CliEnv) {
    env.command()
        .env("DRYDOCK_WAIT_TIMEOUT_SECS", "0")
        .arg("list")
        .assert()
        .code(1)
        .stderr(contains("DRYDOCK_WAIT_TIMEOUT_SECS"));
}
