//! Adapter configuration
//!
//! Each adapter family takes its configuration explicitly at construction. The structs
//! deserialize with `serde` so hosts can load them from their own config files; every
//! field has a default.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::{BridgeError, Result};
use super::reactive::DEFAULT_NOTIFY_CAPACITY;

/// In-memory SQLite database path
pub const MEMORY_PATH: &str = ":memory:";

/// Default time a caller waits for one SQL operation (30 seconds)
pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 30_000;

/// Default SQLite busy timeout (5 seconds)
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Configuration for the relational adapters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Database file, or `:memory:`
    pub path: String,
    /// How long a caller waits for an operation before giving up
    pub operation_timeout_ms: u64,
    /// Enforce foreign key constraints
    pub foreign_keys: bool,
    /// How long SQLite retries on a locked database file
    pub busy_timeout_ms: u64,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            path: MEMORY_PATH.to_string(),
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
            foreign_keys: true,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl SqlConfig {
    /// Configuration for an in-memory database
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Configuration for a database file
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Set the operation timeout
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Enable or disable foreign key enforcement
    #[must_use]
    pub fn with_foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }

    /// Set the busy timeout
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Operation timeout as a `Duration`
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// Busy timeout as a `Duration`
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Configuration for the embedded object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    /// Store directory; `None` opens a temporary store removed on close
    pub path: Option<PathBuf>,
    /// Flush to disk after every write
    pub flush_on_write: bool,
    /// Capacity of the change-notification channel
    pub notify_capacity: usize,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            flush_on_write: false,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl ObjectStoreConfig {
    /// A temporary store
    pub fn temporary() -> Self {
        Self::default()
    }

    /// A store in `path`
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Flush after every write
    #[must_use]
    pub fn with_flush_on_write(mut self, flush: bool) -> Self {
        self.flush_on_write = flush;
        self
    }

    /// Set the notification channel capacity
    #[must_use]
    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }
}

/// Configuration for the embedded key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueConfig {
    /// Store directory; `None` opens a temporary store removed on close
    pub path: Option<PathBuf>,
    /// Name of the box (keyspace) inside the store
    pub box_name: String,
    /// Flush to disk after every write
    pub flush_on_write: bool,
    /// Capacity of the change-notification channel
    pub notify_capacity: usize,
}

impl Default for KeyValueConfig {
    fn default() -> Self {
        Self {
            path: None,
            box_name: "default".to_string(),
            flush_on_write: false,
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl KeyValueConfig {
    /// A temporary store with the given box
    pub fn temporary(box_name: impl Into<String>) -> Self {
        Self {
            box_name: box_name.into(),
            ..Self::default()
        }
    }

    /// A store in `path` with the given box
    pub fn at(path: impl Into<PathBuf>, box_name: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            box_name: box_name.into(),
            ..Self::default()
        }
    }

    /// Flush after every write
    #[must_use]
    pub fn with_flush_on_write(mut self, flush: bool) -> Self {
        self.flush_on_write = flush;
        self
    }

    /// Set the notification channel capacity
    #[must_use]
    pub fn with_notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity;
        self
    }
}

/// Separator between a secure store's namespace and its keys
pub const NAMESPACE_SEPARATOR: char = '.';

/// Configuration for the secure key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecureStoreConfig {
    /// Prefix separating this store's keys from other vault users
    pub namespace: String,
}

impl Default for SecureStoreConfig {
    fn default() -> Self {
        Self {
            namespace: "bridge".to_string(),
        }
    }
}

impl SecureStoreConfig {
    /// Use the given namespace
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Check the namespace can be told apart from every other namespace in the vault
    ///
    /// The namespace is separated from store keys by `.`, so it must be non-empty and
    /// must not contain `.` itself.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(BridgeError::validation("namespace is empty"));
        }
        if self.namespace.contains(NAMESPACE_SEPARATOR) {
            return Err(BridgeError::validation(format!(
                "namespace '{}' must not contain '{}'",
                self.namespace, NAMESPACE_SEPARATOR
            )));
        }
        Ok(())
    }

    /// Full vault key for a store key
    pub fn vault_key(&self, key: &str) -> String {
        format!("{}{}{}", self.namespace, NAMESPACE_SEPARATOR, key)
    }

    /// Store key for a vault key in this namespace
    pub fn store_key<'a>(&self, vault_key: &'a str) -> Option<&'a str> {
        vault_key
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
    }
}
