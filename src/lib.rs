//! # Rust Storage Bridge
//!
//! One storage contract over several heterogeneous persistence backends, so client code can
//! switch or combine backends without rewriting call sites.
//!
//! ## Features
//!
//! - **Uniform contract**: every adapter implements [`Adapter`] plus [`KeyValueAdapter`] or a
//!   record/object API, with one error type, [`BridgeError`]
//! - **Honest capabilities**: transactions, best-effort batches, change notification and
//!   aggregation are separate traits, implemented only where the backend can keep the promise
//! - **Aggregation**: grouped and scalar aggregation, SQL-native or in memory
//! - **Live queries**: [`ChangeStream`]s that re-emit full snapshots after committed writes
//! - **Encryption**: AES-256-GCM boxes and vaults, with keys kept in a [`SecretVault`]
//!
//! ## Backends
//!
//! | Adapter | Family | Transactions | Change notification | Aggregation |
//! |---------|--------|--------------|---------------------|-------------|
//! | `SqliteDatabase` | relational-raw | native, queued | - | SQL |
//! | `ReactiveSqlStore` | relational-typed | native, queued | per table | SQL |
//! | `ObjectStore` | embedded-object (sled) | native, fail fast | per type | in memory |
//! | `KeyValueStore` | embedded-keyvalue (sled) | best-effort | per box | - |
//! | `SecureStore` | secure-keyvalue | best-effort | - | - |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rust_storage_bridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let db = SqliteDatabase::in_memory();
//!     db.open().await?;
//!
//!     db.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
//!         .await?;
//!     db.insert("users", &record([("name", FieldValue::from("Alice")), ("age", 30.into())]))
//!         .await?;
//!
//!     let spec = AggregationSpec::scalar(Aggregate::Avg("age".into()), None);
//!     let rows = db.aggregate("users", &spec).await?;
//!     println!("{:?}", rows);
//!
//!     db.close().await
//! }
//! ```
//!
//! ### Key-value boxes
//!
//! ```rust,no_run
//! use rust_storage_bridge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = KeyValueStore::temporary("settings");
//!     store.open().await?;
//!
//!     store.write("theme", &"dark").await?;
//!     let theme: String = store.read("theme", "light".to_string()).await?;
//!     assert_eq!(theme, "dark");
//!     Ok(())
//! }
//! ```

/// Backend-independent contract, value model and coordination
pub mod core;

/// Adapter implementations
pub mod backends;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::core::{
        record, Adapter, Aggregate, AggregationSpec, BackendKind, BridgeError, ChangeStream,
        Comparison, EncryptionKey, ErrorKind, FieldValue, KeyManager, KeyValueAdapter,
        KvOperation, MemoryVault, Operator, OrderBy, Outcome, Page, Record, RecordAdapter,
        Result, SecretVault, SupportsAggregation, SupportsBestEffortBatch,
        SupportsChangeNotification, SupportsTransactions,
    };

    pub use crate::backends::{FileVault, SecureStore};

    #[cfg(feature = "sqlite")]
    pub use crate::backends::{
        ColumnDef, ColumnType, ReactiveSqlStore, SqlOperation, SqlPredicate, SqliteDatabase,
        TableRow,
    };

    #[cfg(feature = "embedded")]
    pub use crate::backends::{
        entry_filter, object_filter, record_predicate, KeyValueStore, ObjectId, ObjectOp,
        ObjectStore, StoredObject,
    };
}

// Re-export at root level for convenience
pub use core::{
    record, Adapter, Aggregate, AggregationSpec, BackendKind, BridgeError, ChangeStream,
    ErrorKind, FieldValue, KeyValueAdapter, Outcome, Record, RecordAdapter, Result,
    SecretVault,
};
