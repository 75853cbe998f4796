//! SQLite adapter (relational-raw)
//!
//! Raw SQL plus the [`RecordAdapter`] operations over an embedded SQLite database.
//!
//! # Guarantees
//!
//! - Transactions are native (`BEGIN`/`COMMIT`/`ROLLBACK`). [`SqliteDatabase::run_atomic`]
//!   and [`SqliteDatabase::transaction`] roll the whole scope back on the first failure.
//! - One scope at a time per adapter. A second concurrent scope queues behind the open
//!   one; a scope opened from inside a scope fails with `TransactionState`.
//! - Operations outside a scope wait until another task's open scope has closed, so they
//!   never observe or join uncommitted work.
//! - `insert_many` is all-or-nothing. Inside an open scope it joins that scope.
//! - A timeout stops the caller waiting; the native call still runs to completion. An
//!   atomic batch keeps the scope gate closed until it has finished, and `BEGIN`/`COMMIT`
//!   either run before the deadline passes unstarted or are skipped, never run orphaned.
//!
//! Filters are [`SqlPredicate`]s and are passed through to SQLite verbatim.

use super::sql_builder::{
    build_aggregate, build_delete, build_insert, build_update, validate_identifier, Conflict,
    SelectBuilder, SqlPredicate, SqlStatement,
};
use crate::core::adapter::{Adapter, RecordAdapter, SupportsAggregation, SupportsTransactions};
use crate::core::aggregation::{normalize_row, AggregationSpec};
use crate::core::backend_types::BackendKind;
use crate::core::config::SqlConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::query::{OrderBy, Page};
use crate::core::transaction::{ConcurrencyPolicy, ScopePermit, ScopeTracker, TransactionGate};
use crate::core::value::{FieldValue, Outcome, Record};
use async_trait::async_trait;
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const BACKEND: &str = "sqlite";

const CONTROL_QUEUED: u8 = 0;
const CONTROL_STARTED: u8 = 1;
const CONTROL_SKIPPED: u8 = 2;

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            FieldValue::Null => ToSqlOutput::Owned(Value::Null),
            FieldValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            FieldValue::Int(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            FieldValue::Long(v) | FieldValue::Timestamp(v) => {
                ToSqlOutput::Owned(Value::Integer(*v))
            }
            FieldValue::Float(v) => ToSqlOutput::Owned(Value::Real(f64::from(*v))),
            FieldValue::Double(v) => ToSqlOutput::Owned(Value::Real(*v)),
            FieldValue::String(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            FieldValue::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

/// Convert a rusqlite row to a record
fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
    let statement = row.as_ref();
    let mut record = Record::with_capacity(statement.column_count());

    for i in 0..statement.column_count() {
        let column_name = statement.column_name(i)?.to_string();
        record.insert(column_name, value_from_ref(row.get_ref(i)?));
    }

    Ok(record)
}

fn value_from_ref(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(v) => FieldValue::Long(v),
        ValueRef::Real(v) => FieldValue::Double(v),
        ValueRef::Text(v) => FieldValue::String(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => FieldValue::Bytes(v.to_vec()),
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[FieldValue]) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), row_to_record)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn execute_statement(conn: &Connection, sql: &str, params: &[FieldValue]) -> Result<u64> {
    let mut stmt = conn.prepare(sql)?;
    Ok(stmt.execute(params_from_iter(params.iter()))? as u64)
}

/// First column of the first row, or null when there are no rows
fn query_value(conn: &Connection, sql: &str, params: &[FieldValue]) -> Result<FieldValue> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params_from_iter(params.iter()))?;
    match rows.next()? {
        Some(row) => Ok(value_from_ref(row.get_ref(0)?)),
        None => Ok(FieldValue::Null),
    }
}

fn insert_statement(conn: &Connection, stmt: &SqlStatement) -> Result<i64> {
    execute_statement(conn, &stmt.sql, &stmt.params)?;
    Ok(conn.last_insert_rowid())
}

/// Roll back the native transaction if one is open
fn rollback_open(conn: &Connection, in_transaction: &AtomicBool) {
    if in_transaction.swap(false, Ordering::AcqRel) {
        if let Err(e) = conn.execute_batch("ROLLBACK") {
            tracing::error!(error = %e, "automatic rollback failed");
        }
    }
}

/// One operation of an atomic SQLite batch
#[derive(Debug, Clone)]
pub enum SqlOperation {
    /// Run a statement; outcome is the number of affected rows
    Execute {
        /// SQL text
        sql: String,
        /// Bound parameters
        params: Vec<FieldValue>,
    },
    /// Run a query; outcome is the returned rows
    Query {
        /// SQL text
        sql: String,
        /// Bound parameters
        params: Vec<FieldValue>,
    },
    /// Insert a record; outcome is its row id
    Insert {
        /// Target table
        table: String,
        /// Record to insert
        record: Record,
    },
    /// Insert or replace a record; outcome is its row id
    Upsert {
        /// Target table
        table: String,
        /// Record to store
        record: Record,
    },
    /// Update matching rows; outcome is the number updated
    Update {
        /// Target table
        table: String,
        /// Rows to update
        filter: SqlPredicate,
        /// Column values to set
        changes: Record,
    },
    /// Delete matching rows; outcome is the number deleted
    Delete {
        /// Target table
        table: String,
        /// Rows to delete
        filter: SqlPredicate,
    },
}

impl SqlOperation {
    /// A statement with parameters
    pub fn execute(sql: impl Into<String>, params: Vec<FieldValue>) -> Self {
        SqlOperation::Execute {
            sql: sql.into(),
            params,
        }
    }

    /// A query with parameters
    pub fn query(sql: impl Into<String>, params: Vec<FieldValue>) -> Self {
        SqlOperation::Query {
            sql: sql.into(),
            params,
        }
    }

    /// An insert
    pub fn insert(table: impl Into<String>, record: Record) -> Self {
        SqlOperation::Insert {
            table: table.into(),
            record,
        }
    }

    /// An insert-or-replace
    pub fn upsert(table: impl Into<String>, record: Record) -> Self {
        SqlOperation::Upsert {
            table: table.into(),
            record,
        }
    }

    /// An update
    pub fn update(table: impl Into<String>, filter: SqlPredicate, changes: Record) -> Self {
        SqlOperation::Update {
            table: table.into(),
            filter,
            changes,
        }
    }

    /// A delete
    pub fn delete(table: impl Into<String>, filter: SqlPredicate) -> Self {
        SqlOperation::Delete {
            table: table.into(),
            filter,
        }
    }

    /// Table written by this operation, if known
    pub fn table(&self) -> Option<&str> {
        match self {
            SqlOperation::Execute { .. } | SqlOperation::Query { .. } => None,
            SqlOperation::Insert { table, .. }
            | SqlOperation::Upsert { table, .. }
            | SqlOperation::Update { table, .. }
            | SqlOperation::Delete { table, .. } => Some(table),
        }
    }

    /// Whether the operation can change data
    pub fn is_write(&self) -> bool {
        !matches!(self, SqlOperation::Query { .. })
    }

    fn apply(&self, conn: &Connection) -> Result<Outcome> {
        match self {
            SqlOperation::Execute { sql, params } => {
                Ok(Outcome::Affected(execute_statement(conn, sql, params)?))
            }
            SqlOperation::Query { sql, params } => Ok(Outcome::Rows(query_rows(conn, sql, params)?)),
            SqlOperation::Insert { table, record } => Ok(Outcome::Id(insert_statement(
                conn,
                &build_insert(table, record, Conflict::Abort)?,
            )?)),
            SqlOperation::Upsert { table, record } => Ok(Outcome::Id(insert_statement(
                conn,
                &build_insert(table, record, Conflict::Replace)?,
            )?)),
            SqlOperation::Update {
                table,
                filter,
                changes,
            } => {
                let stmt = build_update(table, changes, filter)?;
                Ok(Outcome::Affected(execute_statement(conn, &stmt.sql, &stmt.params)?))
            }
            SqlOperation::Delete { table, filter } => {
                let stmt = build_delete(table, Some(filter))?;
                Ok(Outcome::Affected(execute_statement(conn, &stmt.sql, &stmt.params)?))
            }
        }
    }
}

struct SqliteInner {
    config: SqlConfig,
    connection: Arc<Mutex<Option<Connection>>>,
    in_transaction: Arc<AtomicBool>,
    opened: AtomicBool,
    gate: TransactionGate,
}

/// SQLite database adapter
///
/// Cheap to clone; clones share the connection and the transaction gate.
#[derive(Clone)]
pub struct SqliteDatabase {
    inner: Arc<SqliteInner>,
}

/// An open native transaction; rolls back if dropped before it is closed
struct OpenScope {
    connection: Arc<Mutex<Option<Connection>>>,
    in_transaction: Arc<AtomicBool>,
    permit: Option<ScopePermit>,
    tracker: ScopeTracker,
}

impl OpenScope {
    fn close(self, committed: bool) -> Result<()> {
        if committed {
            self.tracker.mark_committed()
        } else {
            self.tracker.mark_rolled_back()
        }
    }
}

impl Drop for OpenScope {
    fn drop(&mut self) {
        if self.tracker.mark_rolled_back().is_err() {
            return;
        }

        tracing::warn!("transaction scope abandoned before completion; rolling back");
        let connection = Arc::clone(&self.connection);
        let in_transaction = Arc::clone(&self.in_transaction);
        let permit = self.permit.take();

        // The permit is held until the rollback has run, so no new scope can begin first
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || {
                    if let Some(conn) = connection.blocking_lock().as_ref() {
                        rollback_open(conn, &in_transaction);
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                if let Ok(guard) = connection.try_lock() {
                    if let Some(conn) = guard.as_ref() {
                        rollback_open(conn, &in_transaction);
                    }
                }
            }
        }
    }
}

impl SqliteDatabase {
    /// Create an adapter; call [`Adapter::open`] before use
    pub fn new(config: SqlConfig) -> Self {
        Self {
            inner: Arc::new(SqliteInner {
                config,
                connection: Arc::new(Mutex::new(None)),
                in_transaction: Arc::new(AtomicBool::new(false)),
                opened: AtomicBool::new(false),
                gate: TransactionGate::new(BACKEND, ConcurrencyPolicy::Queue),
            }),
        }
    }

    /// Create an adapter over an in-memory database
    pub fn in_memory() -> Self {
        Self::new(SqlConfig::in_memory())
    }

    /// Configuration this adapter was created with
    pub fn config(&self) -> &SqlConfig {
        &self.inner.config
    }

    pub(crate) fn gate(&self) -> &TransactionGate {
        &self.inner.gate
    }

    /// Check if a native transaction is open
    pub fn in_transaction(&self) -> bool {
        self.inner.in_transaction.load(Ordering::Acquire)
    }

    /// Run `f` against the connection on the blocking pool
    ///
    /// The caller waits at most the configured operation timeout. On timeout the call is
    /// detached, not aborted.
    async fn call_unguarded<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.inner.connection);
        let timeout = self.inner.config.operation_timeout();

        let mut task = tokio::task::spawn_blocking(move || -> Result<T> {
            let connection = connection.blocking_lock();
            let conn = connection
                .as_ref()
                .ok_or_else(|| BridgeError::not_initialized(BACKEND))?;
            f(conn)
        });

        tokio::select! {
            result = &mut task => result?,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "sqlite operation timed out");
                Err(BridgeError::timeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Like `call_unguarded`, but first waits for another task's open scope to close
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let _pass = self.inner.gate.pass().await;
        self.call_unguarded(f).await
    }

    /// Run `f` all-or-nothing, joining the current scope if there is one
    async fn atomically<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        if self.inner.gate.in_scope() {
            return self.call_unguarded(f).await;
        }

        let permit = self.inner.gate.enter().await?;
        self.call_unguarded(move |conn| {
            let _permit = permit;
            let tx = conn.unchecked_transaction()?;
            let value = f(&*tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }

    /// Run a transaction-control statement
    ///
    /// The operation timeout only bounds the wait for the connection. A statement still
    /// queued at the deadline is skipped and the caller gets `Timeout`; one that has started
    /// is awaited to completion, so the reported outcome always matches the native state.
    async fn control<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Connection) -> Result<()> + Send + 'static,
    {
        let connection = Arc::clone(&self.inner.connection);
        let timeout = self.inner.config.operation_timeout();
        let claim = Arc::new(AtomicU8::new(CONTROL_QUEUED));
        let task_claim = Arc::clone(&claim);

        let mut task = tokio::task::spawn_blocking(move || -> Result<()> {
            let connection = connection.blocking_lock();
            if task_claim
                .compare_exchange(CONTROL_QUEUED, CONTROL_STARTED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return Ok(());
            }
            let conn = connection
                .as_ref()
                .ok_or_else(|| BridgeError::not_initialized(BACKEND))?;
            f(conn)
        });

        tokio::select! {
            result = &mut task => result?,
            _ = tokio::time::sleep(timeout) => {
                let abandoned = claim
                    .compare_exchange(CONTROL_QUEUED, CONTROL_SKIPPED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if abandoned {
                    tracing::warn!(timeout_ms = timeout.as_millis() as u64, "transaction control timed out before it started");
                    Err(BridgeError::timeout(timeout.as_millis() as u64))
                } else {
                    task.await?
                }
            }
        }
    }

    async fn begin_native(&self) -> Result<()> {
        let in_transaction = Arc::clone(&self.inner.in_transaction);
        self.control(move |conn| {
            conn.execute_batch("BEGIN")?;
            in_transaction.store(true, Ordering::Release);
            Ok(())
        })
        .await
    }

    async fn commit_native(&self) -> Result<()> {
        let in_transaction = Arc::clone(&self.inner.in_transaction);
        self.control(move |conn| {
            conn.execute_batch("COMMIT")?;
            in_transaction.store(false, Ordering::Release);
            Ok(())
        })
        .await
    }

    /// Roll back the open native transaction
    ///
    /// Not bounded by the operation timeout: the scope's permit is only released once the
    /// rollback has run.
    async fn rollback_native(&self) -> Result<()> {
        let connection = Arc::clone(&self.inner.connection);
        let in_transaction = Arc::clone(&self.inner.in_transaction);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let connection = connection.blocking_lock();
            if let Some(conn) = connection.as_ref() {
                if in_transaction.swap(false, Ordering::AcqRel) {
                    conn.execute_batch("ROLLBACK")?;
                }
            }
            Ok(())
        })
        .await?
    }

    /// Run `body` inside one native transaction scope
    ///
    /// Operations `body` issues on this adapter join the scope. Commits when `body`
    /// succeeds, otherwise rolls back and returns `body`'s error. `on_close` learns
    /// whether the scope committed, before any other scope can open.
    pub(crate) async fn scope<T, Fut, C>(&self, body: Fut, on_close: C) -> Result<T>
    where
        T: Send,
        Fut: Future<Output = Result<T>> + Send,
        C: FnOnce(bool) + Send,
    {
        let permit = self.inner.gate.enter().await?;
        self.begin_native().await?;
        tracing::debug!("transaction scope opened");

        let scope = OpenScope {
            connection: Arc::clone(&self.inner.connection),
            in_transaction: Arc::clone(&self.inner.in_transaction),
            permit: Some(permit),
            tracker: ScopeTracker::open(),
        };

        match self.inner.gate.scoped(body).await {
            Ok(value) => match self.commit_native().await {
                Ok(()) => {
                    on_close(true);
                    scope.close(true)?;
                    tracing::debug!("transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback) = self.rollback_native().await {
                        tracing::error!(error = %rollback, "rollback after failed commit failed");
                    }
                    on_close(false);
                    scope.close(false)?;
                    Err(e)
                }
            },
            Err(e) => {
                if let Err(rollback) = self.rollback_native().await {
                    tracing::error!(error = %rollback, "rollback failed");
                }
                on_close(false);
                scope.close(false)?;
                tracing::warn!(error = %e, "transaction rolled back");
                Err(e)
            }
        }
    }

    /// Execute operations in a transaction scope
    ///
    /// ```rust,no_run
    /// use rust_storage_bridge::prelude::*;
    ///
    /// # async fn demo(db: SqliteDatabase) -> Result<()> {
    /// db.transaction(|db| {
    ///     Box::pin(async move {
    ///         db.execute("UPDATE accounts SET balance = balance - 10 WHERE id = 1").await?;
    ///         db.execute("UPDATE accounts SET balance = balance + 10 WHERE id = 2").await?;
    ///         Ok(())
    ///     })
    /// })
    /// .await
    /// # }
    /// ```
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Self) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>
            + Send,
        T: Send,
    {
        self.scope(f(self), |_| {}).await
    }

    /// Execute a statement that doesn't return rows
    ///
    /// # Security Warning
    ///
    /// The SQL is run as given. Use [`execute_with_params`](Self::execute_with_params) for
    /// any caller-supplied value.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.execute_with_params(sql, &[]).await
    }

    /// Execute a parameterized statement, returning the number of affected rows
    pub async fn execute_with_params(&self, sql: &str, params: &[FieldValue]) -> Result<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.call(move |conn| execute_statement(conn, &sql, &params))
            .await
    }

    /// Execute several `;`-separated statements without parameters
    pub async fn execute_script(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.call(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    /// Execute a query and return every row
    pub async fn query(&self, sql: &str) -> Result<Vec<Record>> {
        self.query_with_params(sql, &[]).await
    }

    /// Execute a parameterized query and return every row
    pub async fn query_with_params(&self, sql: &str, params: &[FieldValue]) -> Result<Vec<Record>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.call(move |conn| query_rows(conn, &sql, &params)).await
    }

    /// Execute a query and return the first column of the first row
    ///
    /// Returns null when the query yields no rows.
    pub async fn query_scalar(&self, sql: &str, params: &[FieldValue]) -> Result<FieldValue> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.call(move |conn| query_value(conn, &sql, &params)).await
    }

    /// Column names of `table`, in declaration order; empty if the table does not exist
    pub async fn columns(&self, table: &str) -> Result<Vec<String>> {
        validate_identifier(table)?;
        let table = table.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
            let names = stmt.query_map(rusqlite::params![table], |row| row.get::<_, String>(0))?;
            Ok(names.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// Run a statement inside the current scope, or on its own outside one
    async fn run_statement(&self, stmt: SqlStatement) -> Result<u64> {
        self.call(move |conn| execute_statement(conn, &stmt.sql, &stmt.params))
            .await
    }
}

impl Drop for SqliteInner {
    fn drop(&mut self) {
        // Best-effort cleanup since Drop cannot be async
        if self.in_transaction.load(Ordering::Acquire) {
            if let Ok(connection) = self.connection.try_lock() {
                if let Some(conn) = connection.as_ref() {
                    rollback_open(conn, &self.in_transaction);
                }
            }
        }
    }
}

#[async_trait]
impl Adapter for SqliteDatabase {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::RelationalRaw
    }

    async fn open(&self) -> Result<()> {
        let mut connection = Arc::clone(&self.inner.connection).lock_owned().await;
        if connection.is_some() {
            return Ok(());
        }

        let config = self.inner.config.clone();
        let timeout = config.operation_timeout();
        let mut task = tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = Connection::open(&config.path).map_err(|e| {
                BridgeError::initialization_with_source(
                    BACKEND,
                    format!("cannot open '{}'", config.path),
                    e,
                )
            })?;

            let pragmas = if config.foreign_keys {
                "PRAGMA foreign_keys = ON"
            } else {
                "PRAGMA foreign_keys = OFF"
            };
            conn.execute_batch(pragmas)
                .and_then(|_| conn.busy_timeout(config.busy_timeout()))
                .map_err(|e| {
                    BridgeError::initialization_with_source(BACKEND, "cannot configure connection", e)
                })?;

            *connection = Some(conn);
            Ok(())
        });

        tokio::select! {
            result = &mut task => result??,
            _ = tokio::time::sleep(timeout) => {
                return Err(BridgeError::timeout(timeout.as_millis() as u64));
            }
        }

        self.inner.opened.store(true, Ordering::Release);
        tracing::info!(path = %self.inner.config.path, "sqlite database opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.opened.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if self.inner.gate.in_scope() {
            return Err(BridgeError::transaction_state(
                "cannot close the database inside a transaction scope",
            ));
        }

        let _pass = self.inner.gate.pass().await;
        let mut connection = self.inner.connection.lock().await;
        if connection.take().is_some() {
            self.inner.in_transaction.store(false, Ordering::Release);
            self.inner.opened.store(false, Ordering::Release);
            tracing::info!(path = %self.inner.config.path, "sqlite database closed");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordAdapter for SqliteDatabase {
    type Filter = SqlPredicate;

    async fn insert(&self, table: &str, record: &Record) -> Result<i64> {
        let stmt = build_insert(table, record, Conflict::Abort)?;
        self.call(move |conn| insert_statement(conn, &stmt)).await
    }

    async fn insert_many(&self, table: &str, records: &[Record]) -> Result<Vec<i64>> {
        let statements = records
            .iter()
            .map(|record| build_insert(table, record, Conflict::Abort))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(table, rows = statements.len(), "inserting batch");
        self.atomically(move |conn| {
            statements
                .iter()
                .map(|stmt| insert_statement(conn, stmt))
                .collect()
        })
        .await
    }

    async fn upsert(&self, table: &str, record: &Record) -> Result<i64> {
        let stmt = build_insert(table, record, Conflict::Replace)?;
        self.call(move |conn| insert_statement(conn, &stmt)).await
    }

    async fn read(&self, table: &str, filter: &SqlPredicate, default: Record) -> Result<Record> {
        let stmt = SelectBuilder::new(table)
            .filter(Some(filter))
            .page(Page::first(1))
            .build()?;
        let rows = self
            .call(move |conn| query_rows(conn, &stmt.sql, &stmt.params))
            .await?;
        Ok(rows.into_iter().next().unwrap_or(default))
    }

    async fn query(
        &self,
        table: &str,
        filter: Option<&SqlPredicate>,
        order: &[OrderBy],
        page: Page,
    ) -> Result<Vec<Record>> {
        let stmt = SelectBuilder::new(table)
            .filter(filter)
            .order_by(order)
            .page(page)
            .build()?;
        self.call(move |conn| query_rows(conn, &stmt.sql, &stmt.params))
            .await
    }

    async fn update(&self, table: &str, filter: &SqlPredicate, changes: &Record) -> Result<u64> {
        self.run_statement(build_update(table, changes, filter)?)
            .await
    }

    async fn delete(&self, table: &str, filter: &SqlPredicate) -> Result<u64> {
        self.run_statement(build_delete(table, Some(filter))?).await
    }

    async fn delete_all(&self, table: &str) -> Result<u64> {
        self.run_statement(build_delete(table, None)?).await
    }

    async fn count(&self, table: &str, filter: Option<&SqlPredicate>) -> Result<u64> {
        let stmt = SelectBuilder::new(table).filter(filter).build_count()?;
        let value = self
            .call(move |conn| query_value(conn, &stmt.sql, &stmt.params))
            .await?;
        Ok(value.as_long().unwrap_or(0).max(0) as u64)
    }

    async fn exists(&self, table: &str, filter: Option<&SqlPredicate>) -> Result<bool> {
        let stmt = SelectBuilder::new(table).filter(filter).build_exists()?;
        let value = self
            .call(move |conn| query_value(conn, &stmt.sql, &stmt.params))
            .await?;
        Ok(value.as_long().unwrap_or(0) != 0)
    }
}

#[async_trait]
impl SupportsTransactions for SqliteDatabase {
    type Operation = SqlOperation;

    async fn run_atomic(&self, operations: Vec<SqlOperation>) -> Result<Vec<Outcome>> {
        let permit = self.inner.gate.enter().await?;
        tracing::debug!(operations = operations.len(), "running atomic batch");

        self.call_unguarded(move |conn| {
            let _permit = permit;
            let tx = conn.unchecked_transaction()?;
            let mut outcomes = Vec::with_capacity(operations.len());
            for (index, operation) in operations.iter().enumerate() {
                match operation.apply(&tx) {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        tracing::warn!(index, error = %e, "atomic batch failed; rolling back");
                        return Err(e);
                    }
                }
            }
            tx.commit()?;
            Ok(outcomes)
        })
        .await
    }
}

#[async_trait]
impl SupportsAggregation for SqliteDatabase {
    type Predicate = SqlPredicate;

    async fn aggregate(
        &self,
        table: &str,
        spec: &AggregationSpec<SqlPredicate>,
    ) -> Result<Vec<Record>> {
        let columns = self.columns(table).await?;
        if columns.is_empty() {
            return Err(BridgeError::validation(format!("unknown table '{}'", table)));
        }
        spec.validate(|column| columns.iter().any(|c| c == column))?;

        let stmt = build_aggregate(table, spec)?;
        let rows = self
            .call(move |conn| query_rows(conn, &stmt.sql, &stmt.params))
            .await?;
        Ok(rows.into_iter().map(|row| normalize_row(row, spec)).collect())
    }
}
