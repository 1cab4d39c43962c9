//! Agent socket discovery.
//!
//! Candidates, in order: the `IdentityAgent` from the user's SSH client
//! configuration, the 1Password SSH agent socket, then `SSH_AUTH_SOCK`. The
//! first two are only offered when their socket path exists.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use super::{AgentEndpoint, EndpointOrigin};
use crate::util::{expand_home, home_dir, read_optional};

const LINUX_ONEPASSWORD_SOCKET: &str = ".1password/agent.sock";
const MACOS_ONEPASSWORD_SOCKET: &str =
    "Library/Group Containers/2BUA8C4S2C.com.1password/t/agent.sock";

/// Host platform, which decides where the 1Password agent lives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Platform {
    /// Linux and other Unix systems using the XDG-style location.
    Linux,
    /// macOS, using the group container location.
    MacOs,
}

impl Platform {
    /// Platform of the running process.
    #[must_use]
    pub const fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }
}

/// Inputs to agent discovery, captured from the environment or set
/// explicitly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Discovery {
    home: Option<Utf8PathBuf>,
    ssh_auth_sock: Option<String>,
    ssh_config: Option<String>,
    platform: Platform,
}

impl Discovery {
    /// Discovery inputs for an explicit home directory and nothing else.
    #[must_use]
    pub const fn new(home: Option<Utf8PathBuf>, platform: Platform) -> Self {
        Self {
            home,
            ssh_auth_sock: None,
            ssh_config: None,
            platform,
        }
    }

    /// Reads `HOME`, `SSH_AUTH_SOCK` and `~/.ssh/config`.
    #[must_use]
    pub fn from_env() -> Self {
        let home = home_dir();
        let ssh_config = home.as_ref().and_then(|dir| {
            let path = dir.join(".ssh/config");
            read_optional(&path).unwrap_or_else(|err| {
                debug!(path = %path, error = %err, "ignoring unreadable ssh config");
                None
            })
        });
        Self {
            home,
            ssh_auth_sock: std::env::var("SSH_AUTH_SOCK").ok(),
            ssh_config,
            platform: Platform::current(),
        }
    }

    /// Sets the `SSH_AUTH_SOCK` value.
    #[must_use]
    pub fn with_auth_sock(mut self, value: Option<String>) -> Self {
        self.ssh_auth_sock = value;
        self
    }

    /// Sets the SSH client configuration contents.
    #[must_use]
    pub fn with_ssh_config(mut self, contents: Option<String>) -> Self {
        self.ssh_config = contents;
        self
    }

    /// Returns the candidate endpoints in lookup order, de-duplicated by
    /// path.
    #[must_use]
    pub fn endpoints(&self) -> Vec<AgentEndpoint> {
        let home = self.home.as_deref();
        let mut endpoints: Vec<AgentEndpoint> = Vec::new();
        let mut push = |path: Utf8PathBuf, origin: EndpointOrigin| {
            if endpoints.iter().any(|known| known.path == path) {
                return;
            }
            endpoints.push(AgentEndpoint { path, origin });
        };

        if let Some(path) = self
            .ssh_config
            .as_deref()
            .and_then(|contents| identity_agent_from_config(contents, home))
            .filter(|path| path.exists())
        {
            push(path, EndpointOrigin::SshConfig);
        }

        if let Some(path) = self.onepassword_socket().filter(|path| path.exists()) {
            push(path, EndpointOrigin::OnePassword);
        }

        if let Some(sock) = self
            .ssh_auth_sock
            .as_deref()
            .map(str::trim)
            .filter(|sock| !sock.is_empty())
        {
            push(Utf8PathBuf::from(sock), EndpointOrigin::Environment);
        }

        endpoints
    }

    fn onepassword_socket(&self) -> Option<Utf8PathBuf> {
        let home = self.home.as_deref()?;
        Some(match self.platform {
            Platform::Linux => home.join(LINUX_ONEPASSWORD_SOCKET),
            Platform::MacOs => home.join(MACOS_ONEPASSWORD_SOCKET),
        })
    }
}

/// Discovers agent endpoints from the current environment.
#[must_use]
pub fn discover() -> Vec<AgentEndpoint> {
    Discovery::from_env().endpoints()
}

/// Returns the first `IdentityAgent` value that applies to every host.
///
/// Directives before the first `Host`/`Match` block, inside `Host *`, or
/// inside `Match all` apply to every host. `none` and references to
/// `SSH_AUTH_SOCK` yield `None` so the environment candidate is used.
pub(crate) fn identity_agent_from_config(
    contents: &str,
    home: Option<&Utf8Path>,
) -> Option<Utf8PathBuf> {
    let mut applies = true;
    for line in contents.lines() {
        let Some((keyword, value)) = split_directive(line) else {
            continue;
        };
        match keyword.to_ascii_lowercase().as_str() {
            "host" => applies = value.split_whitespace().any(|pattern| pattern == "*"),
            "match" => applies = value.eq_ignore_ascii_case("all"),
            "identityagent" if applies => return agent_path(unquote(value), home),
            _ => {}
        }
    }
    None
}

fn agent_path(value: &str, home: Option<&Utf8Path>) -> Option<Utf8PathBuf> {
    if value.eq_ignore_ascii_case("none") || value.trim_start_matches('$') == "SSH_AUTH_SOCK" {
        return None;
    }
    let expanded = match (value.strip_prefix("%d"), home) {
        (Some(rest), Some(dir)) => Utf8PathBuf::from(format!("{dir}{rest}")),
        _ => expand_home(value, home),
    };
    Some(expanded)
}

fn split_directive(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (keyword, rest) = trimmed.split_once(|ch: char| ch.is_whitespace() || ch == '=')?;
    let value = rest
        .trim_start_matches(|ch: char| ch.is_whitespace() || ch == '=')
        .trim();
    Some((keyword, value))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn home() -> Utf8PathBuf {
        Utf8PathBuf::from("/home/ops")
    }

    #[rstest]
    #[case("IdentityAgent ~/.agent.sock\n", Some("/home/ops/.agent.sock"))]
    #[case("IdentityAgent=\"/run/agent.sock\"\n", Some("/run/agent.sock"))]
    #[case("Host *\n  IdentityAgent %d/a.sock\n", Some("/home/ops/a.sock"))]
    #[case("Host build\n  IdentityAgent /b.sock\n", None)]
    #[case("Host build\n  IdentityAgent /b.sock\nHost *\n  IdentityAgent /c.sock\n", Some("/c.sock"))]
    #[case("Match all\n  identityagent /m.sock\n", Some("/m.sock"))]
    #[case("IdentityAgent none\nHost *\n  IdentityAgent /late.sock\n", None)]
    #[case("IdentityAgent SSH_AUTH_SOCK\n", None)]
    #[case("# IdentityAgent /commented.sock\n", None)]
    fn parses_identity_agent(#[case] contents: &str, #[case] expected: Option<&str>) {
        let parsed = identity_agent_from_config(contents, Some(&home()));
        assert_eq!(parsed.as_deref().map(Utf8Path::as_str), expected);
    }

    struct Sockets {
        _tmp: TempDir,
        home: Utf8PathBuf,
    }

    fn sockets(create: &[&str]) -> Sockets {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        for relative in create {
            crate::util::write_ambient(&home.join(relative), "")
                .unwrap_or_else(|err| panic!("create {relative}: {err}"));
        }
        Sockets { _tmp: tmp, home }
    }

    #[test]
    fn endpoints_follow_lookup_order() {
        let fixture = sockets(&["custom.sock", ".1password/agent.sock"]);
        let discovery = Discovery::new(Some(fixture.home.clone()), Platform::Linux)
            .with_ssh_config(Some(String::from("IdentityAgent ~/custom.sock\n")))
            .with_auth_sock(Some(String::from("/tmp/ssh-agent.sock")));

        let endpoints = discovery.endpoints();

        let origins: Vec<_> = endpoints.iter().map(|endpoint| endpoint.origin).collect();
        assert_eq!(
            origins,
            vec![
                EndpointOrigin::SshConfig,
                EndpointOrigin::OnePassword,
                EndpointOrigin::Environment,
            ]
        );
        assert_eq!(
            endpoints.first().map(|endpoint| endpoint.path.clone()),
            Some(fixture.home.join("custom.sock"))
        );
    }

    #[test]
    fn missing_sockets_are_skipped_but_environment_is_kept() {
        let fixture = sockets(&[]);
        let discovery = Discovery::new(Some(fixture.home.clone()), Platform::MacOs)
            .with_ssh_config(Some(String::from("IdentityAgent ~/absent.sock\n")))
            .with_auth_sock(Some(String::from("/tmp/ssh-agent.sock")));

        let endpoints = discovery.endpoints();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(
            endpoints.first().map(|endpoint| endpoint.origin),
            Some(EndpointOrigin::Environment)
        );
    }

    #[test]
    fn duplicate_paths_are_listed_once() {
        let fixture = sockets(&[".1password/agent.sock"]);
        let onepassword = fixture.home.join(".1password/agent.sock");
        let discovery = Discovery::new(Some(fixture.home.clone()), Platform::Linux)
            .with_ssh_config(Some(format!("IdentityAgent {onepassword}\n")))
            .with_auth_sock(Some(onepassword.to_string()));

        let endpoints = discovery.endpoints();

        assert_eq!(endpoints.len(), 1);
        assert_eq!(
            endpoints.first().map(|endpoint| endpoint.origin),
            Some(EndpointOrigin::SshConfig)
        );
    }

    #[test]
    fn nothing_configured_yields_no_endpoints() {
        let discovery = Discovery::new(None, Platform::Linux).with_auth_sock(Some(String::from("  ")));
        assert!(discovery.endpoints().is_empty());
    }
}
