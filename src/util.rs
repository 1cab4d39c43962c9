//! Path expansion and capability-scoped file helpers.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

/// Returns the user's home directory from `HOME`, when set and UTF-8.
#[must_use]
pub fn home_dir() -> Option<Utf8PathBuf> {
    std::env::var("HOME")
        .ok()
        .filter(|home| !home.trim().is_empty())
        .map(Utf8PathBuf::from)
}

/// Expands a leading `~/` (or a bare `~`) against `home`.
///
/// Paths without the prefix, or calls without a home directory, are
/// returned unchanged.
///
/// ```
/// # use camino::Utf8Path;
/// # use drydock::util::expand_home;
/// let home = Utf8Path::new("/home/ops");
/// assert_eq!(expand_home("~/.ssh/config", Some(home)).as_str(), "/home/ops/.ssh/config");
/// assert_eq!(expand_home("/tmp/agent.sock", Some(home)).as_str(), "/tmp/agent.sock");
/// ```
#[must_use]
pub fn expand_home(path: &str, home: Option<&Utf8Path>) -> Utf8PathBuf {
    match home {
        Some(dir) if path == "~" => dir.to_path_buf(),
        Some(dir) => path
            .strip_prefix("~/")
            .map_or_else(|| Utf8PathBuf::from(path), |rest| dir.join(rest)),
        None => Utf8PathBuf::from(path),
    }
}

/// Expands a leading `~/` using `HOME`.
#[must_use]
pub fn expand_tilde(path: &str) -> Utf8PathBuf {
    expand_home(path, home_dir().as_deref())
}

fn split_parent(path: &Utf8Path) -> Result<(&Utf8Path, &str), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("path has no file name: {path}"))?;
    let parent = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    Ok((parent, file_name))
}

/// Reads a UTF-8 file through a capability handle on its parent directory.
///
/// # Errors
///
/// Returns the I/O error message when the directory or file cannot be read.
pub fn read_to_string_ambient(path: &Utf8Path) -> Result<String, String> {
    let (parent, file_name) = split_parent(path)?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.read_to_string(file_name).map_err(|err| err.to_string())
}

/// Reads a file, returning `Ok(None)` when it does not exist.
///
/// # Errors
///
/// Returns the I/O error message for failures other than a missing file or
/// directory.
pub fn read_optional(path: &Utf8Path) -> Result<Option<String>, String> {
    let (parent, file_name) = split_parent(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.to_string()),
    };
    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.to_string()),
    }
}

/// Writes `contents` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns the I/O error message when a directory cannot be created or the
/// file cannot be written.
pub fn write_ambient(path: &Utf8Path, contents: &str) -> Result<(), String> {
    let (parent, file_name) = split_parent(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| err.to_string())?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| err.to_string())?;
    dir.write(file_name, contents).map_err(|err| err.to_string())
}
