//! Typed reactive tables over SQLite (relational-typed/reactive)
//!
//! Rows are Rust structs implementing [`TableRow`]; they map to table columns through
//! `serde`. Every committed write publishes a change notice for its table, which drives
//! the live queries returned by [`ReactiveSqlStore::watch`].
//!
//! # Guarantees
//!
//! - Transactions are native and delegate to [`SqliteDatabase`]: one scope at a time, a
//!   second concurrent scope queues, nesting fails with `TransactionState`.
//! - Writes made inside a scope notify only after the scope commits. A rolled-back scope
//!   notifies nothing.
//! - `watch` is table-scoped. `watch_sql` cannot know which tables its SQL reads and
//!   re-runs after a write to any table, which may cause harmless extra emissions.

use super::sql_builder::{quote_identifier, SqlPredicate};
use super::sqlite::{SqlOperation, SqliteDatabase};
use crate::core::adapter::{
    Adapter, RecordAdapter, SupportsAggregation, SupportsChangeNotification, SupportsTransactions,
};
use crate::core::aggregation::AggregationSpec;
use crate::core::backend_types::BackendKind;
use crate::core::config::SqlConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::query::{OrderBy, Page};
use crate::core::reactive::{
    spawn_watch, ChangeNotice, ChangeNotifier, ChangeStream, WatchScope, ANY_COLLECTION,
};
use crate::core::value::{
    record_from_serializable, record_into_deserializable, FieldValue, Outcome, Record,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Storage class of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit integer
    Integer,
    /// Floating point
    Real,
    /// UTF-8 text
    Text,
    /// Raw bytes
    Blob,
    /// Boolean, stored as 0/1
    Boolean,
}

impl ColumnType {
    fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

/// One column of a typed table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name; must match the serialized field name
    pub name: &'static str,
    /// Storage class
    pub column_type: ColumnType,
    /// Whether NULL is allowed
    pub nullable: bool,
}

impl ColumnDef {
    /// A NOT NULL column
    pub const fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
        }
    }

    /// A nullable column
    pub const fn nullable(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: true,
        }
    }
}

/// A struct stored as one row of a typed table
///
/// Fields serialize to scalar values named like the columns. An `Integer` primary key
/// that serializes to null is assigned by SQLite on insert.
pub trait TableRow: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Table name
    const TABLE: &'static str;
    /// Primary key column
    const PRIMARY_KEY: &'static str;
    /// Every column, primary key included
    const COLUMNS: &'static [ColumnDef];
}

fn create_table_sql<T: TableRow>() -> Result<String> {
    if !T::COLUMNS.iter().any(|c| c.name == T::PRIMARY_KEY) {
        return Err(BridgeError::validation(format!(
            "primary key '{}' is not a column of '{}'",
            T::PRIMARY_KEY,
            T::TABLE
        )));
    }

    let columns = T::COLUMNS
        .iter()
        .map(|column| {
            let mut def = format!(
                "{} {}",
                quote_identifier(column.name)?,
                column.column_type.as_sql()
            );
            if column.name == T::PRIMARY_KEY {
                def.push_str(" PRIMARY KEY");
            } else if !column.nullable {
                def.push_str(" NOT NULL");
            }
            Ok(def)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(T::TABLE)?,
        columns.join(", ")
    ))
}

fn encode_row<T: TableRow>(row: &T) -> Result<Record> {
    let mut record = record_from_serializable(row)?;
    for field in record.keys() {
        if !T::COLUMNS.iter().any(|c| c.name == field.as_str()) {
            return Err(BridgeError::validation(format!(
                "field '{}' is not a column of '{}'",
                field,
                T::TABLE
            )));
        }
    }
    if record.get(T::PRIMARY_KEY).is_some_and(FieldValue::is_null) {
        record.remove(T::PRIMARY_KEY);
    }
    Ok(record)
}

fn decode_row<T: TableRow>(mut record: Record) -> Result<T> {
    for column in T::COLUMNS {
        if column.column_type == ColumnType::Boolean {
            if let Some(value) = record.get_mut(column.name) {
                if let FieldValue::Long(n) = *value {
                    *value = FieldValue::Bool(n != 0);
                }
            }
        }
    }
    record_into_deserializable(record)
}

fn decode_rows<T: TableRow>(rows: Vec<Record>) -> Result<Vec<T>> {
    rows.into_iter().map(decode_row::<T>).collect()
}

/// Reactive typed-table store
///
/// Cheap to clone; clones share the database, the notifier and the transaction gate.
#[derive(Clone)]
pub struct ReactiveSqlStore {
    db: SqliteDatabase,
    notifier: ChangeNotifier,
    pending: Arc<Mutex<BTreeSet<String>>>,
}

impl ReactiveSqlStore {
    /// Create a store; call [`Adapter::open`] before use
    pub fn new(config: SqlConfig) -> Self {
        Self {
            db: SqliteDatabase::new(config),
            notifier: ChangeNotifier::default(),
            pending: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Create a store over an in-memory database
    pub fn in_memory() -> Self {
        Self::new(SqlConfig::in_memory())
    }

    /// Record a committed or pending change to `table`
    fn touched(&self, table: &str) {
        if self.db.gate().in_scope() {
            self.pending.lock().insert(table.to_string());
        } else {
            self.notifier.publish(table);
        }
    }

    /// Record a change whose table is unknown; re-runs every watch
    fn touched_any(&self) {
        self.touched(ANY_COLLECTION);
    }

    /// Create the table for `T` if it does not exist
    pub async fn register<T: TableRow>(&self) -> Result<()> {
        let sql = create_table_sql::<T>()?;
        self.db.execute(&sql).await?;
        tracing::debug!(table = T::TABLE, "table registered");
        Ok(())
    }

    /// Insert a row, returning its primary key
    pub async fn insert<T: TableRow>(&self, row: &T) -> Result<i64> {
        let id = self.db.insert(T::TABLE, &encode_row(row)?).await?;
        self.touched(T::TABLE);
        Ok(id)
    }

    /// Insert several rows; all or none are stored
    pub async fn insert_many<T: TableRow>(&self, rows: &[T]) -> Result<Vec<i64>> {
        let records = rows.iter().map(encode_row).collect::<Result<Vec<_>>>()?;
        let ids = self.db.insert_many(T::TABLE, &records).await?;
        if !ids.is_empty() {
            self.touched(T::TABLE);
        }
        Ok(ids)
    }

    /// Insert a row or replace the row with the same primary key
    pub async fn upsert<T: TableRow>(&self, row: &T) -> Result<i64> {
        let id = self.db.upsert(T::TABLE, &encode_row(row)?).await?;
        self.touched(T::TABLE);
        Ok(id)
    }

    fn key_filter<T: TableRow>(id: impl Into<FieldValue>) -> Result<SqlPredicate> {
        SqlPredicate::eq(T::PRIMARY_KEY, id)
    }

    /// The row with primary key `id`
    pub async fn get<T: TableRow>(&self, id: impl Into<FieldValue>) -> Result<Option<T>> {
        let filter = Self::key_filter::<T>(id)?;
        let rows = RecordAdapter::query(&self.db, T::TABLE, Some(&filter), &[], Page::first(1))
            .await?;
        rows.into_iter().next().map(decode_row::<T>).transpose()
    }

    /// The row with primary key `id`, or `default` when absent
    pub async fn get_or<T: TableRow>(&self, id: impl Into<FieldValue>, default: T) -> Result<T> {
        Ok(self.get::<T>(id).await?.unwrap_or(default))
    }

    /// Matching rows, ordered then paged
    pub async fn query<T: TableRow>(
        &self,
        filter: Option<&SqlPredicate>,
        order: &[OrderBy],
        page: Page,
    ) -> Result<Vec<T>> {
        let rows = RecordAdapter::query(&self.db, T::TABLE, filter, order, page).await?;
        decode_rows(rows)
    }

    /// Set `changes` on every matching row
    pub async fn update_where<T: TableRow>(
        &self,
        filter: &SqlPredicate,
        changes: &Record,
    ) -> Result<u64> {
        let updated = self.db.update(T::TABLE, filter, changes).await?;
        if updated > 0 {
            self.touched(T::TABLE);
        }
        Ok(updated)
    }

    /// Delete the row with primary key `id`; deleting an absent row succeeds
    pub async fn delete<T: TableRow>(&self, id: impl Into<FieldValue>) -> Result<()> {
        self.delete_where::<T>(&Self::key_filter::<T>(id)?).await?;
        Ok(())
    }

    /// Delete matching rows
    pub async fn delete_where<T: TableRow>(&self, filter: &SqlPredicate) -> Result<u64> {
        let deleted = RecordAdapter::delete(&self.db, T::TABLE, filter).await?;
        if deleted > 0 {
            self.touched(T::TABLE);
        }
        Ok(deleted)
    }

    /// Delete every row of `T`'s table
    pub async fn delete_all<T: TableRow>(&self) -> Result<u64> {
        let deleted = RecordAdapter::delete_all(&self.db, T::TABLE).await?;
        if deleted > 0 {
            self.touched(T::TABLE);
        }
        Ok(deleted)
    }

    /// Number of matching rows
    pub async fn count<T: TableRow>(&self, filter: Option<&SqlPredicate>) -> Result<u64> {
        RecordAdapter::count(&self.db, T::TABLE, filter).await
    }

    /// Whether any row matches
    pub async fn exists<T: TableRow>(&self, filter: Option<&SqlPredicate>) -> Result<bool> {
        RecordAdapter::exists(&self.db, T::TABLE, filter).await
    }

    /// Live query over `T`'s table
    ///
    /// Emits the current result immediately, then a fresh full result after every
    /// committed write to the table.
    pub fn watch<T: TableRow>(
        &self,
        filter: Option<SqlPredicate>,
        order: Vec<OrderBy>,
        page: Page,
    ) -> ChangeStream<Vec<T>> {
        let store = self.clone();
        spawn_watch(
            self.notifier.subscribe(),
            WatchScope::Collection(T::TABLE.to_string()),
            move || {
                let store = store.clone();
                let filter = filter.clone();
                let order = order.clone();
                async move { store.query::<T>(filter.as_ref(), &order, page).await }
            },
        )
    }

    /// Live query over arbitrary SQL, re-run after a write to any table
    pub fn watch_sql(&self, sql: impl Into<String>, params: Vec<FieldValue>) -> ChangeStream<Vec<Record>> {
        let db = self.db.clone();
        let sql = sql.into();
        spawn_watch(self.notifier.subscribe(), WatchScope::All, move || {
            let db = db.clone();
            let sql = sql.clone();
            let params = params.clone();
            async move { db.query_with_params(&sql, &params).await }
        })
    }

    /// Execute operations in a transaction scope
    ///
    /// Change notices for writes made by `f` are published when the scope commits and
    /// discarded when it rolls back.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Self) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
        T: Send,
    {
        let pending = Arc::clone(&self.pending);
        let notifier = self.notifier.clone();
        self.db
            .scope(f(self), move |committed| {
                let tables = std::mem::take(&mut *pending.lock());
                if committed {
                    for table in &tables {
                        notifier.publish(table);
                    }
                } else if !tables.is_empty() {
                    tracing::debug!(tables = tables.len(), "discarding notices of rolled-back scope");
                }
            })
            .await
    }
}

#[async_trait]
impl Adapter for ReactiveSqlStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::RelationalReactive
    }

    async fn open(&self) -> Result<()> {
        self.db.open().await
    }

    fn is_open(&self) -> bool {
        self.db.is_open()
    }

    async fn close(&self) -> Result<()> {
        let was_open = self.db.is_open();
        self.db.close().await?;
        if was_open {
            self.notifier.publish_closed();
        }
        Ok(())
    }
}

#[async_trait]
impl SupportsTransactions for ReactiveSqlStore {
    type Operation = SqlOperation;

    async fn run_atomic(&self, operations: Vec<SqlOperation>) -> Result<Vec<Outcome>> {
        let mut written: BTreeSet<String> = BTreeSet::new();
        let mut unknown = false;
        for operation in operations.iter().filter(|op| op.is_write()) {
            match operation.table() {
                Some(table) => {
                    written.insert(table.to_string());
                }
                None => unknown = true,
            }
        }

        let outcomes = self.db.run_atomic(operations).await?;
        if unknown {
            self.touched_any();
        }
        for table in &written {
            self.touched(table);
        }
        Ok(outcomes)
    }
}

impl SupportsChangeNotification for ReactiveSqlStore {
    fn change_notices(&self) -> broadcast::Receiver<ChangeNotice> {
        self.notifier.subscribe()
    }
}

#[async_trait]
impl SupportsAggregation for ReactiveSqlStore {
    type Predicate = SqlPredicate;

    async fn aggregate(
        &self,
        table: &str,
        spec: &AggregationSpec<SqlPredicate>,
    ) -> Result<Vec<Record>> {
        self.db.aggregate(table, spec).await
    }
}
