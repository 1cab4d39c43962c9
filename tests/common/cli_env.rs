//! Isolated environment for driving the `drydock` binary.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Shared helpers live under `tests/common/` and are pulled in via:
//!
//! ```rust,ignore
//! #[path = "common/cli_env.rs"]
//! mod cli_env;
//! ```

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Temporary home directory with an empty configuration file.
pub struct CliEnv {
    tmp: TempDir,
}

impl CliEnv {
    /// Creates the directory and its empty `drydock.toml`.
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        std::fs::write(tmp.path().join("drydock.toml"), "")
            .unwrap_or_else(|err| panic!("write config: {err}"));
        Self { tmp }
    }

    /// Absolute path of `relative` inside the directory.
    pub fn path(&self, relative: &str) -> String {
        self.tmp
            .path()
            .join(relative)
            .to_str()
            .unwrap_or_else(|| panic!("temp path should be utf8"))
            .to_owned()
    }

    /// `drydock` with `HOME`, configuration and state redirected into the
    /// temporary directory and no SSH agent.
    pub fn command(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("drydock");
        cmd.env("HOME", self.path(""))
            .env("DRYDOCK_CONFIG_PATH", self.path("drydock.toml"))
            .env("DRYDOCK_SESSIONS_FILE", self.path("state/sessions.toml"))
            .env("DRYDOCK_CONSOLE_INCLUDE", self.path("ssh/drydock.conf"))
            .env_remove("SSH_AUTH_SOCK")
            .env_remove("DRYDOCK_DEFAULT_PROVIDER")
            .env_remove("RUST_LOG");
        cmd
    }
}
