//! Shared test utilities for serialising environment mutation.

use std::env;
use std::ffi::OsString;

use tokio::sync::{Mutex, MutexGuard};

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets environment variables while holding a global mutex. Variables
    /// listed in `unset` are removed for the guard's lifetime.
    pub async fn set_vars(pairs: &[(&str, &str)], unset: &[&str]) -> Self {
        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len() + unset.len());
        for (key, value) in pairs {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: ENV_LOCK serialises every test that touches the
            // environment.
            unsafe { env::set_var(key, value) };
        }
        for key in unset {
            previous.push(((*key).to_owned(), env::var_os(key)));
            // SAFETY: as above.
            unsafe { env::remove_var(key) };
        }
        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in self.previous.drain(..).rev() {
            match value {
                // SAFETY: the guard still holds ENV_LOCK.
                Some(old) => unsafe { env::set_var(&key, old) },
                // SAFETY: the guard still holds ENV_LOCK.
                None => unsafe { env::remove_var(&key) },
            }
        }
    }
}
