//! The uniform adapter contract
//!
//! Every backend implements [`Adapter`] plus the operation family that fits its data
//! model: [`KeyValueAdapter`] for keyed stores, [`RecordAdapter`] for tables of records.
//! What a backend can additionally guarantee is expressed through capability traits, so an
//! adapter never has to implement a method only to fail with "not supported":
//!
//! | Capability | Trait |
//! |---|---|
//! | all-or-nothing multi-operation scopes | [`SupportsTransactions`] |
//! | sequential batches without rollback | [`SupportsBestEffortBatch`] |
//! | mutation notifications / live queries | [`SupportsChangeNotification`] |
//! | grouped and scalar aggregation | [`SupportsAggregation`] |
//!
//! The atomic and best-effort batch entry points have different names on purpose:
//! `run_atomic` never leaves a partial result behind, `run_best_effort` may.

use super::aggregation::{scalar_value, Aggregate, AggregationSpec};
use super::backend_types::{BackendKind, Capabilities};
use super::error::{BridgeError, Result};
use super::query::{OrderBy, Page};
use super::reactive::ChangeNotice;
use super::transaction::run_sequential;
use super::value::{FieldValue, Outcome, Record};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Lifecycle shared by every adapter
///
/// Operations issued before a successful [`open`](Adapter::open), or after
/// [`close`](Adapter::close), fail with `NotInitialized`.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend family of this adapter
    fn backend_kind(&self) -> BackendKind;

    /// What this adapter guarantees
    fn capabilities(&self) -> Capabilities {
        self.backend_kind().capabilities()
    }

    /// Open the underlying store, creating it if absent
    ///
    /// Idempotent: opening an open adapter succeeds without doing anything, and concurrent
    /// calls open the store once.
    async fn open(&self) -> Result<()>;

    /// Whether the adapter is open
    fn is_open(&self) -> bool;

    /// Release native resources; closing a closed adapter is a no-op
    async fn close(&self) -> Result<()>;
}

/// Keyed single-item operations
///
/// Values are serialized with `serde`. Deleting an absent key succeeds. Each adapter
/// documents whether `write_many` and `delete_many` are all-or-nothing.
#[async_trait]
pub trait KeyValueAdapter: Adapter {
    /// Insert or replace the value under `key`
    async fn write<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize + Sync;

    /// Read the value under `key`, or `default` when the key is absent
    async fn read<V>(&self, key: &str, default: V) -> Result<V>
    where
        V: DeserializeOwned + Send;

    /// Write several entries
    async fn write_many<V>(&self, entries: &[(String, V)]) -> Result<()>
    where
        V: Serialize + Sync;

    /// Every entry, ordered by key
    async fn read_all<V>(&self) -> Result<BTreeMap<String, V>>
    where
        V: DeserializeOwned + Send;

    /// Remove the entry under `key`
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove several entries
    async fn delete_many(&self, keys: &[String]) -> Result<()>;

    /// Remove every entry, returning how many were removed
    async fn delete_all(&self) -> Result<u64>;

    /// Whether `key` is present
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Number of entries
    async fn count(&self) -> Result<u64>;

    /// Every key, in order
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Record operations over named tables
///
/// `Filter` is the adapter's own predicate type. It is passed through to the native query
/// path untouched; a filter built for one adapter must not be given to another.
#[async_trait]
pub trait RecordAdapter: Adapter {
    /// Native predicate type
    type Filter: Send + Sync;

    /// Insert one record, returning its row id
    async fn insert(&self, table: &str, record: &Record) -> Result<i64>;

    /// Insert several records; all or none are stored
    async fn insert_many(&self, table: &str, records: &[Record]) -> Result<Vec<i64>>;

    /// Insert a record or replace the row with the same key
    async fn upsert(&self, table: &str, record: &Record) -> Result<i64>;

    /// The first record matching `filter`, or `default` when none does
    async fn read(&self, table: &str, filter: &Self::Filter, default: Record) -> Result<Record>;

    /// Matching records, ordered then paged; `None` matches everything
    async fn query(
        &self,
        table: &str,
        filter: Option<&Self::Filter>,
        order: &[OrderBy],
        page: Page,
    ) -> Result<Vec<Record>>;

    /// Apply `changes` to every matching record, returning the number updated
    async fn update(&self, table: &str, filter: &Self::Filter, changes: &Record) -> Result<u64>;

    /// Remove matching records, returning the number removed
    async fn delete(&self, table: &str, filter: &Self::Filter) -> Result<u64>;

    /// Remove every record in the table
    async fn delete_all(&self, table: &str) -> Result<u64>;

    /// Number of matching records, counted natively
    async fn count(&self, table: &str, filter: Option<&Self::Filter>) -> Result<u64>;

    /// Whether any record matches, checked natively
    async fn exists(&self, table: &str, filter: Option<&Self::Filter>) -> Result<bool>;
}

/// Native all-or-nothing execution of a batch
#[async_trait]
pub trait SupportsTransactions: Adapter {
    /// One queued operation
    type Operation: Send;

    /// Run `operations` in order inside one native transaction
    ///
    /// Commits when every operation succeeds. On the first failure the whole scope is
    /// rolled back and that failure is returned; none of the operations stay visible.
    /// Calling this from inside an open scope on the same adapter fails with
    /// `TransactionState`.
    async fn run_atomic(&self, operations: Vec<Self::Operation>) -> Result<Vec<Outcome>>;
}

/// Sequential batches for backends without native transactions
///
/// Nothing is rolled back. A failure stops the batch and surfaces as `BatchAborted`,
/// which carries the failing index and the outcomes of the operations already applied.
#[async_trait]
pub trait SupportsBestEffortBatch: Adapter {
    /// One queued operation
    type Operation: Send + 'static;

    /// Apply a single operation
    async fn apply(&self, operation: Self::Operation) -> Result<Outcome>;

    /// Apply `operations` in order, stopping at the first failure
    async fn run_best_effort(&self, operations: Vec<Self::Operation>) -> Result<Vec<Outcome>> {
        tracing::debug!(
            backend = %self.backend_kind(),
            operations = operations.len(),
            "running best-effort batch"
        );
        run_sequential(operations, |operation| self.apply(operation)).await
    }
}

/// Mutation notifications
pub trait SupportsChangeNotification: Adapter {
    /// Subscribe to notices for every committed mutation on this adapter
    fn change_notices(&self) -> broadcast::Receiver<ChangeNotice>;
}

/// Grouped and scalar aggregation
///
/// The scalar shortcuts are one-group cases of [`aggregate`](Self::aggregate) and agree
/// with it: `count` over nothing is `0`; `sum`, `avg`, `min` and `max` over nothing are
/// `None`/null.
#[async_trait]
pub trait SupportsAggregation: Adapter {
    /// Native predicate type used as the pre-grouping filter
    type Predicate: Send + Sync;

    /// Run a grouped aggregation against `target` (a table or type name)
    async fn aggregate(
        &self,
        target: &str,
        spec: &AggregationSpec<Self::Predicate>,
    ) -> Result<Vec<Record>>;

    /// Number of matching rows
    async fn aggregate_count(&self, target: &str, filter: Option<Self::Predicate>) -> Result<u64> {
        let spec = AggregationSpec::scalar(Aggregate::Count, filter);
        let value = scalar_value(self.aggregate(target, &spec).await?);
        value
            .as_long()
            .map(|n| n.max(0) as u64)
            .ok_or_else(|| BridgeError::validation("count did not produce an integer"))
    }

    /// Sum of a column over matching rows
    async fn aggregate_sum(
        &self,
        target: &str,
        column: &str,
        filter: Option<Self::Predicate>,
    ) -> Result<Option<f64>> {
        let spec = AggregationSpec::scalar(Aggregate::Sum(column.to_string()), filter);
        Ok(scalar_value(self.aggregate(target, &spec).await?).as_double())
    }

    /// Average of a column over matching rows
    async fn aggregate_avg(
        &self,
        target: &str,
        column: &str,
        filter: Option<Self::Predicate>,
    ) -> Result<Option<f64>> {
        let spec = AggregationSpec::scalar(Aggregate::Avg(column.to_string()), filter);
        Ok(scalar_value(self.aggregate(target, &spec).await?).as_double())
    }

    /// Smallest value of a column over matching rows
    async fn aggregate_min(
        &self,
        target: &str,
        column: &str,
        filter: Option<Self::Predicate>,
    ) -> Result<FieldValue> {
        let spec = AggregationSpec::scalar(Aggregate::Min(column.to_string()), filter);
        Ok(scalar_value(self.aggregate(target, &spec).await?))
    }

    /// Largest value of a column over matching rows
    async fn aggregate_max(
        &self,
        target: &str,
        column: &str,
        filter: Option<Self::Predicate>,
    ) -> Result<FieldValue> {
        let spec = AggregationSpec::scalar(Aggregate::Max(column.to_string()), filter);
        Ok(scalar_value(self.aggregate(target, &spec).await?))
    }
}

/// One operation in a key-value batch
#[derive(Debug, Clone, PartialEq)]
pub enum KvOperation {
    /// Insert or replace an entry (value already encoded as JSON)
    Write {
        /// Entry key
        key: String,
        /// Encoded value
        value: serde_json::Value,
    },
    /// Remove an entry
    Delete {
        /// Entry key
        key: String,
    },
    /// Check for an entry
    Contains {
        /// Entry key
        key: String,
    },
}

impl KvOperation {
    /// A write of any serializable value
    pub fn write<V: Serialize>(key: impl Into<String>, value: &V) -> Result<Self> {
        Ok(KvOperation::Write {
            key: key.into(),
            value: serde_json::to_value(value)?,
        })
    }

    /// A delete
    pub fn delete(key: impl Into<String>) -> Self {
        KvOperation::Delete { key: key.into() }
    }

    /// A presence check
    pub fn contains(key: impl Into<String>) -> Self {
        KvOperation::Contains { key: key.into() }
    }

    /// Key the operation targets
    pub fn key(&self) -> &str {
        match self {
            KvOperation::Write { key, .. }
            | KvOperation::Delete { key }
            | KvOperation::Contains { key } => key,
        }
    }
}
