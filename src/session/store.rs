//! Session persistence.
//!
//! Stores expose a small load/save interface. The file-backed store keeps
//! every record in one TOML document keyed by session name and serialises
//! access through a `tokio::sync::RwLock` so concurrent provisioning tasks
//! never interleave a read-modify-write.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::toml;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use super::Session;
use crate::util::{read_optional, write_ambient};

/// Errors raised by session stores.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum StoreError {
    /// Raised when a record with the same name already exists.
    #[error("session '{0}' already exists")]
    Duplicate(String),
    /// Raised when the backing file cannot be read or written.
    #[error("failed to access session file {path}: {message}")]
    Io {
        /// Path of the session file.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the backing file is not valid session TOML.
    #[error("failed to parse session file {path}: {message}")]
    Parse {
        /// Path of the session file.
        path: Utf8PathBuf,
        /// Parser error message.
        message: String,
    },
}

/// Future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Load/save interface over session records.
pub trait SessionStore: Send + Sync {
    /// Loads one record.
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>>;

    /// Loads every record, ordered by name.
    fn load_all(&self) -> StoreFuture<'_, Vec<Session>>;

    /// Inserts a new record, failing with [`StoreError::Duplicate`] when the
    /// name is taken. The check and the write are atomic.
    fn insert<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()>;

    /// Inserts or replaces a record.
    fn save<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()>;

    /// Replaces `expected` with `updated` only while the stored record still
    /// equals `expected`, returning whether the write happened. A record
    /// changed or removed since `expected` was loaded is left alone.
    fn replace<'a>(
        &'a self,
        expected: &'a Session,
        updated: &'a Session,
    ) -> StoreFuture<'a, bool>;

    /// Removes a record, returning whether it existed.
    fn remove<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool>;
}

fn replace_in(
    sessions: &mut BTreeMap<String, Session>,
    expected: &Session,
    updated: &Session,
) -> bool {
    match sessions.get_mut(&expected.id) {
        Some(current) if current == expected => {
            current.clone_from(updated);
            true
        }
        _ => false,
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct SessionFile {
    #[serde(default)]
    sessions: BTreeMap<String, Session>,
}

/// Store backed by a TOML file.
#[derive(Debug)]
pub struct FileSessionStore {
    path: Utf8PathBuf,
    lock: RwLock<()>,
}

impl FileSessionStore {
    /// Creates a store persisting to `path`. The file is created on first
    /// write.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: RwLock::new(()),
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read(&self) -> Result<SessionFile, StoreError> {
        let contents = read_optional(&self.path).map_err(|message| StoreError::Io {
            path: self.path.clone(),
            message,
        })?;
        let Some(text) = contents.filter(|text| !text.trim().is_empty()) else {
            return Ok(SessionFile::default());
        };
        toml::from_str(&text).map_err(|err| StoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn write(&self, file: &SessionFile) -> Result<(), StoreError> {
        let rendered = toml::to_string_pretty(file).map_err(|err| StoreError::Parse {
            path: self.path.clone(),
            message: err.to_string(),
        })?;
        write_ambient(&self.path, &rendered).map_err(|message| StoreError::Io {
            path: self.path.clone(),
            message,
        })?;
        debug!(path = %self.path, sessions = file.sessions.len(), "session file written");
        Ok(())
    }

    async fn modify<T>(
        &self,
        change: impl FnOnce(&mut SessionFile) -> Result<T, StoreError> + Send,
    ) -> Result<T, StoreError> {
        let _guard = self.lock.write().await;
        let mut file = self.read()?;
        let outcome = change(&mut file)?;
        self.write(&file)?;
        Ok(outcome)
    }
}

impl SessionStore for FileSessionStore {
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move {
            let _guard = self.lock.read().await;
            Ok(self.read()?.sessions.remove(id))
        })
    }

    fn load_all(&self) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move {
            let _guard = self.lock.read().await;
            Ok(self.read()?.sessions.into_values().collect())
        })
    }

    fn insert<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(self.modify(move |file| {
            if file.sessions.contains_key(&session.id) {
                return Err(StoreError::Duplicate(session.id.clone()));
            }
            file.sessions.insert(session.id.clone(), session.clone());
            Ok(())
        }))
    }

    fn save<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(self.modify(move |file| {
            file.sessions.insert(session.id.clone(), session.clone());
            Ok(())
        }))
    }

    fn replace<'a>(
        &'a self,
        expected: &'a Session,
        updated: &'a Session,
    ) -> StoreFuture<'a, bool> {
        Box::pin(self.modify(move |file| Ok(replace_in(&mut file.sessions, expected, updated))))
    }

    fn remove<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(self.modify(move |file| Ok(file.sessions.remove(id).is_some())))
    }
}

/// In-memory store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<BTreeMap<String, Session>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Session>> {
        Box::pin(async move { Ok(self.sessions.read().await.get(id).cloned()) })
    }

    fn load_all(&self) -> StoreFuture<'_, Vec<Session>> {
        Box::pin(async move { Ok(self.sessions.read().await.values().cloned().collect()) })
    }

    fn insert<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&session.id) {
                return Err(StoreError::Duplicate(session.id.clone()));
            }
            sessions.insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    fn save<'a>(&'a self, session: &'a Session) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.sessions
                .write()
                .await
                .insert(session.id.clone(), session.clone());
            Ok(())
        })
    }

    fn replace<'a>(
        &'a self,
        expected: &'a Session,
        updated: &'a Session,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut sessions = self.sessions.write().await;
            Ok(replace_in(&mut sessions, expected, updated))
        })
    }

    fn remove<'a>(&'a self, id: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.sessions.write().await.remove(id).is_some()) })
    }
}
