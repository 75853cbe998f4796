//! Adapter implementations
//!
//! One module per backend family, plus the SQL rendering helper shared by the relational
//! adapters and the file-backed secret vault.

pub mod file_vault;
pub mod secure_store;

#[cfg(feature = "sqlite")]
pub mod reactive_sql;
#[cfg(feature = "sqlite")]
pub mod sql_builder;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "embedded")]
pub mod kv_store;
#[cfg(feature = "embedded")]
pub mod object_store;
#[cfg(feature = "embedded")]
mod sled_handles;

pub use file_vault::FileVault;
pub use secure_store::SecureStore;

#[cfg(feature = "sqlite")]
pub use reactive_sql::{ColumnDef, ColumnType, ReactiveSqlStore, TableRow};
#[cfg(feature = "sqlite")]
pub use sql_builder::SqlPredicate;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqlOperation, SqliteDatabase};

#[cfg(feature = "embedded")]
pub use kv_store::{entry_filter, EntryFilter, KeyValueStore};
#[cfg(feature = "embedded")]
pub use object_store::{
    object_filter, record_predicate, ObjectFilter, ObjectId, ObjectOp, ObjectStore,
    RecordPredicate, StoredObject,
};
