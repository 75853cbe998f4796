//! Core storage bridge types and traits
//!
//! This module provides the backend-independent building blocks: the adapter contract and
//! capability traits, the value model, errors, transaction coordination, aggregation, live
//! queries, configuration and key management.

pub mod adapter;
pub mod aggregation;
pub mod backend_types;
pub mod config;
pub mod crypto;
pub mod error;
pub mod query;
pub mod reactive;
pub mod transaction;
pub mod value;
pub mod vault;

// Re-export commonly used types
pub use adapter::{
    Adapter, KeyValueAdapter, KvOperation, RecordAdapter, SupportsAggregation,
    SupportsBestEffortBatch, SupportsChangeNotification, SupportsTransactions,
};
pub use aggregation::{aggregate_records, Aggregate, AggregationSpec};
pub use backend_types::{BackendKind, Capabilities};
pub use config::{KeyValueConfig, ObjectStoreConfig, SecureStoreConfig, SqlConfig};
pub use crypto::{Cipher, EncryptionKey, KeyManager};
pub use error::{BridgeError, ErrorKind, Result};
pub use query::{Comparison, Operator, OrderBy, OrderDirection, Page};
pub use reactive::{
    ChangeNotice, ChangeNotifier, ChangeStream, NoticeKind, WatchScope, ANY_COLLECTION,
};
pub use transaction::{ConcurrencyPolicy, ScopeState, ScopeTracker, TransactionGate};
pub use value::{record, FieldValue, Outcome, Record};
pub use vault::{MemoryVault, SecretVault};
