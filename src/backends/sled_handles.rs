//! Shared sled handles
//!
//! sled locks its directory, so every adapter opened on the same path must share one
//! `sled::Db`. Handles are reference counted per path in a process-wide registry and the
//! database is released when the last adapter using it closes. Acquisition holds the
//! registry lock across `sled::open`, so concurrent first opens of a path are race-free.
//! Temporary stores are private to their adapter and never registered.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

struct Entry {
    db: sled::Db,
    users: usize,
}

static HANDLES: OnceLock<Mutex<HashMap<PathBuf, Entry>>> = OnceLock::new();

fn handles() -> &'static Mutex<HashMap<PathBuf, Entry>> {
    HANDLES.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A counted reference to a sled database
///
/// Dropping the last handle for a path removes it from the registry.
pub(crate) struct SledHandle {
    db: sled::Db,
    key: Option<PathBuf>,
}

impl SledHandle {
    /// Open `path`, or a fresh temporary database when `path` is `None`
    ///
    /// Blocking; call from the blocking pool.
    pub(crate) fn acquire(path: Option<&Path>) -> Result<Self, sled::Error> {
        let Some(path) = path else {
            let db = sled::Config::default().temporary(true).open()?;
            return Ok(Self { db, key: None });
        };

        std::fs::create_dir_all(path)?;
        let key = path.canonicalize()?;

        let mut handles = handles().lock();
        if let Some(entry) = handles.get_mut(&key) {
            entry.users += 1;
            tracing::debug!(path = %key.display(), users = entry.users, "sharing sled handle");
            return Ok(Self {
                db: entry.db.clone(),
                key: Some(key),
            });
        }

        let db = sled::Config::default().path(&key).open()?;
        handles.insert(
            key.clone(),
            Entry {
                db: db.clone(),
                users: 1,
            },
        );
        Ok(Self { db, key: Some(key) })
    }

    pub(crate) fn db(&self) -> &sled::Db {
        &self.db
    }
}

impl Drop for SledHandle {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };

        let mut handles = handles().lock();
        let last = match handles.get_mut(&key) {
            Some(entry) => {
                entry.users -= 1;
                entry.users == 0
            }
            None => false,
        };
        if last {
            handles.remove(&key);
            tracing::debug!(path = %key.display(), "sled handle released");
        }
    }
}
