//! Boot payload resolution and the remote commands that act on it.
//!
//! A boot payload can be provided inline (for example `#cloud-config`) or via
//! a file path. Providers that consume cloud-init receive it as user-data and
//! the session waits for cloud-init to finish; providers that cannot get it
//! executed as a first-boot script instead.

use shell_escape::unix::escape;
use thiserror::Error;

use crate::util::{expand_tilde, read_to_string_ambient};

/// File cloud-init writes once every boot stage has completed.
pub const BOOT_FINISHED_MARKER: &str = "/var/lib/cloud/instance/boot-finished";

const FIRST_BOOT_SCRIPT: &str = "/tmp/drydock-first-boot";
const MARKER_POLL_SECS: u32 = 2;

/// Errors raised while resolving a boot payload.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum CloudInitError {
    /// Raised when both inline and file sources are provided.
    #[error("boot payload cannot be provided both inline and via file")]
    BothProvided,
    /// Raised when an inline payload is empty or only whitespace.
    #[error("boot payload must not be empty")]
    InlineEmpty,
    /// Raised when a file path is empty or only whitespace.
    #[error("boot payload file path must not be empty")]
    FilePathEmpty,
    /// Raised when a file resolves to empty or only whitespace.
    #[error("boot payload file must not be empty")]
    FileEmpty,
    /// Raised when reading the file source fails.
    #[error("failed to read boot payload file `{path}`: {message}")]
    FileRead {
        /// Expanded path that failed to read.
        path: String,
        /// Underlying error message.
        message: String,
    },
}

/// Resolves a boot payload from either an inline value or a file.
///
/// Inline and file sources are mutually exclusive. Both values are trimmed for
/// emptiness checks, but the returned payload preserves the original content.
///
/// # Errors
///
/// Returns [`CloudInitError`] when the inputs are invalid or the file cannot be
/// read.
pub fn resolve_boot_payload(
    inline: Option<&str>,
    file: Option<&str>,
) -> Result<Option<String>, CloudInitError> {
    if inline.is_some() && file.is_some() {
        return Err(CloudInitError::BothProvided);
    }

    if let Some(payload) = inline {
        validate_payload(payload)?;
        return Ok(Some(payload.to_owned()));
    }

    let Some(path) = file else {
        return Ok(None);
    };

    if path.trim().is_empty() {
        return Err(CloudInitError::FilePathEmpty);
    }

    let expanded = expand_tilde(path);
    let content = read_to_string_ambient(&expanded).map_err(|message| CloudInitError::FileRead {
        path: expanded.to_string(),
        message,
    })?;

    validate_payload(&content).map_err(|err| match err {
        CloudInitError::InlineEmpty => CloudInitError::FileEmpty,
        other => other,
    })?;

    Ok(Some(content))
}

/// Validates that a payload is not empty/whitespace.
pub(crate) fn validate_payload(payload: &str) -> Result<(), CloudInitError> {
    if payload.trim().is_empty() {
        return Err(CloudInitError::InlineEmpty);
    }
    Ok(())
}

/// Remote command that blocks until cloud-init has finished. Falls back to
/// polling [`BOOT_FINISHED_MARKER`] on images without `cloud-init status`.
#[must_use]
pub fn wait_for_boot_command() -> String {
    let marker = escape(BOOT_FINISHED_MARKER.into());
    format!(
        "if command -v cloud-init >/dev/null 2>&1; then cloud-init status --wait >/dev/null; \
         fi; while [ ! -e {marker} ]; do sleep {MARKER_POLL_SECS}; done"
    )
}

/// Remote command that writes `payload` to a script and runs it once.
/// Payloads without a shebang are run with `sh`.
#[must_use]
pub fn first_boot_command(payload: &str) -> String {
    let script = escape(FIRST_BOOT_SCRIPT.into());
    let body = escape(payload.into());
    let runner = if payload.starts_with("#!") {
        format!("chmod +x {script} && {script}")
    } else {
        format!("sh {script}")
    };
    format!("printf '%s' {body} > {script} && {runner}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[rstest]
    #[case(Some("#cloud-config\n"), Some("/tmp/x"), Err(CloudInitError::BothProvided))]
    #[case(Some("  \n"), None, Err(CloudInitError::InlineEmpty))]
    #[case(None, Some("   "), Err(CloudInitError::FilePathEmpty))]
    #[case(None, None, Ok(None))]
    #[case(Some("#!/bin/sh\necho hi\n"), None, Ok(Some(String::from("#!/bin/sh\necho hi\n"))))]
    fn resolves_inline_sources(
        #[case] inline: Option<&str>,
        #[case] file: Option<&str>,
        #[case] expected: Result<Option<String>, CloudInitError>,
    ) {
        assert_eq!(resolve_boot_payload(inline, file), expected);
    }

    #[test]
    fn reads_payload_from_file() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = tmp.path().join("boot.sh");
        std::fs::write(&path, "#!/bin/sh\ntouch /ready\n")
            .unwrap_or_else(|err| panic!("write payload: {err}"));
        let path_str = path.to_str().unwrap_or_else(|| panic!("utf8 temp path"));

        let payload = resolve_boot_payload(None, Some(path_str))
            .unwrap_or_else(|err| panic!("resolve: {err}"));

        assert_eq!(payload.as_deref(), Some("#!/bin/sh\ntouch /ready\n"));
    }

    #[test]
    fn blank_file_is_rejected() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = tmp.path().join("empty.yaml");
        std::fs::write(&path, "\n\n").unwrap_or_else(|err| panic!("write payload: {err}"));
        let path_str = path.to_str().unwrap_or_else(|| panic!("utf8 temp path"));

        assert_eq!(
            resolve_boot_payload(None, Some(path_str)),
            Err(CloudInitError::FileEmpty)
        );
    }

    #[test]
    fn missing_file_reports_path() {
        let err = resolve_boot_payload(None, Some("/nonexistent/boot.sh"))
            .expect_err("missing file should fail");
        assert!(
            matches!(err, CloudInitError::FileRead { ref path, .. } if path == "/nonexistent/boot.sh"),
            "{err}"
        );
    }

    #[test]
    fn first_boot_command_quotes_payload() {
        let command = first_boot_command("#!/bin/bash\necho 'hi'\n");
        assert!(command.starts_with("printf '%s' '#"), "{command}");
        assert!(command.contains("/bin/bash"), "{command}");
        assert!(command.contains("'\\''hi'\\''"), "{command}");
        assert!(command.ends_with("chmod +x /tmp/drydock-first-boot && /tmp/drydock-first-boot"));
    }

    #[test]
    fn first_boot_command_without_shebang_uses_sh() {
        let command = first_boot_command("apt-get update\n");
        assert!(command.ends_with("sh /tmp/drydock-first-boot"), "{command}");
    }

    #[test]
    fn wait_command_polls_the_marker() {
        let command = wait_for_boot_command();
        assert!(command.contains("cloud-init status --wait"), "{command}");
        assert!(command.contains(BOOT_FINISHED_MARKER), "{command}");
    }
}
