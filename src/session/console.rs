//! SSH host aliases for running sessions.
//!
//! Each SSH-reachable session gets a `Host <name>` block in an include file
//! owned by this tool, so `ssh <name>` works once the operator adds
//! `Include <file>` to their SSH client configuration. Blocks for other
//! names are preserved on every rewrite.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::util::{read_optional, write_ambient};

const HEADER: &str = "# Managed by drydock. Manual edits are overwritten.\n";

/// One `Host` block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsoleAlias {
    /// Alias name; the session name.
    pub name: String,
    /// Address the alias resolves to.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub user: String,
}

impl ConsoleAlias {
    fn render(&self) -> String {
        format!(
            "Host {}\n    HostName {}\n    Port {}\n    User {}\n",
            self.name, self.host, self.port, self.user
        )
    }
}

/// Writes and removes aliases in the include file.
#[derive(Debug)]
pub struct ConsoleRegistry {
    path: Utf8PathBuf,
    lock: Mutex<()>,
}

/// Splits the file into blocks keyed by host name. Lines before the first
/// `Host` keyword are dropped.
fn parse_blocks(contents: &str) -> BTreeMap<String, String> {
    let mut blocks = BTreeMap::new();
    let mut current: Option<(String, String)> = None;
    for line in contents.lines() {
        let trimmed = line.trim();
        let host_name = trimmed
            .strip_prefix("Host ")
            .map(str::trim)
            .filter(|name| !name.is_empty());
        if let Some(name) = host_name {
            if let Some((finished, body)) = current.take() {
                blocks.insert(finished, body);
            }
            current = Some((name.to_owned(), format!("{line}\n")));
        } else if let Some((_, body)) = current.as_mut() {
            if !trimmed.is_empty() {
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    if let Some((finished, body)) = current {
        blocks.insert(finished, body);
    }
    blocks
}

fn render_blocks(blocks: &BTreeMap<String, String>) -> String {
    let mut out = String::from(HEADER);
    for body in blocks.values() {
        out.push('\n');
        out.push_str(body);
    }
    out
}

impl ConsoleRegistry {
    /// Registry writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Path of the include file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, String> {
        Ok(read_optional(&self.path)?
            .map(|contents| parse_blocks(&contents))
            .unwrap_or_default())
    }

    /// Adds or replaces the block for `alias.name`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error message when the file cannot be read or written.
    pub async fn register(&self, alias: &ConsoleAlias) -> Result<(), String> {
        let _guard = self.lock.lock().await;
        let mut blocks = self.load()?;
        blocks.insert(alias.name.clone(), alias.render());
        write_ambient(&self.path, &render_blocks(&blocks))?;
        debug!(alias = %alias.name, path = %self.path, "console alias written");
        Ok(())
    }

    /// Removes the block for `name`, returning whether one existed. A missing
    /// file counts as no block.
    ///
    /// # Errors
    ///
    /// Returns the I/O error message when the file cannot be read or written.
    pub async fn remove(&self, name: &str) -> Result<bool, String> {
        let _guard = self.lock.lock().await;
        let mut blocks = self.load()?;
        if blocks.remove(name).is_none() {
            return Ok(false);
        }
        write_ambient(&self.path, &render_blocks(&blocks))?;
        debug!(alias = name, path = %self.path, "console alias removed");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;
    use crate::util::read_to_string_ambient;

    struct Fixture {
        _tmp: TempDir,
        registry: ConsoleRegistry,
    }

    #[fixture]
    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        Fixture {
            registry: ConsoleRegistry::new(dir.join("ssh/drydock.conf")),
            _tmp: tmp,
        }
    }

    fn alias(name: &str, host: &str) -> ConsoleAlias {
        ConsoleAlias {
            name: name.to_owned(),
            host: host.to_owned(),
            port: 22,
            user: String::from("ubuntu"),
        }
    }

    fn contents(registry: &ConsoleRegistry) -> String {
        read_to_string_ambient(registry.path()).unwrap_or_else(|err| panic!("read: {err}"))
    }

    #[rstest]
    #[tokio::test]
    async fn writes_a_host_block(fixture: Fixture) {
        fixture
            .registry
            .register(&alias("dev-box", "51.15.1.2"))
            .await
            .unwrap_or_else(|err| panic!("register: {err}"));

        let text = contents(&fixture.registry);
        assert!(text.starts_with(HEADER), "{text}");
        assert!(
            text.contains("Host dev-box\n    HostName 51.15.1.2\n    Port 22\n    User ubuntu\n"),
            "{text}"
        );
    }

    #[rstest]
    #[tokio::test]
    async fn replacing_keeps_other_blocks(fixture: Fixture) {
        for entry in [alias("a", "10.0.0.1"), alias("b", "10.0.0.2"), alias("a", "10.0.0.3")] {
            fixture
                .registry
                .register(&entry)
                .await
                .unwrap_or_else(|err| panic!("register: {err}"));
        }

        let text = contents(&fixture.registry);
        assert_eq!(text.matches("Host ").count(), 2, "{text}");
        assert!(text.contains("HostName 10.0.0.3"), "{text}");
        assert!(text.contains("HostName 10.0.0.2"), "{text}");
        assert!(!text.contains("HostName 10.0.0.1"), "{text}");
    }

    #[rstest]
    #[tokio::test]
    async fn remove_drops_only_the_named_block(fixture: Fixture) {
        for entry in [alias("a", "10.0.0.1"), alias("b", "10.0.0.2")] {
            fixture
                .registry
                .register(&entry)
                .await
                .unwrap_or_else(|err| panic!("register: {err}"));
        }

        let removed = fixture
            .registry
            .remove("a")
            .await
            .unwrap_or_else(|err| panic!("remove: {err}"));
        let again = fixture
            .registry
            .remove("a")
            .await
            .unwrap_or_else(|err| panic!("remove again: {err}"));

        assert!(removed);
        assert!(!again);
        let text = contents(&fixture.registry);
        assert!(!text.contains("Host a\n"), "{text}");
        assert!(text.contains("Host b\n"), "{text}");
    }

    #[rstest]
    #[tokio::test]
    async fn removing_from_a_missing_file_is_a_no_op(fixture: Fixture) {
        let removed = fixture
            .registry
            .remove("ghost")
            .await
            .unwrap_or_else(|err| panic!("remove: {err}"));
        assert!(!removed);
    }

    #[test]
    fn parse_ignores_preamble_and_blank_lines() {
        let blocks = parse_blocks("# header\n\nHost x\n    HostName 1.2.3.4\n\nHost y\n    Port 2222\n");
        assert_eq!(
            blocks.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["x", "y"]
        );
        assert_eq!(
            blocks.get("x").map(String::as_str),
            Some("Host x\n    HostName 1.2.3.4\n")
        );
    }
}
