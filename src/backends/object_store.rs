//! Embedded typed object store on sled (embedded-object)
//!
//! Each object type lives in its own sled tree, keyed by a big-endian [`ObjectId`]. Ids
//! come from a per-type counter kept in a metadata tree and updated in the same sled
//! transaction as the write, so an id is never handed out twice, even after the object
//! holding it was deleted.
//!
//! # Guarantees
//!
//! - `put_many`, `delete_many` and [`run_atomic`](SupportsTransactions::run_atomic) are
//!   all-or-nothing: they run as one sled multi-tree transaction.
//! - Only one `run_atomic` scope may be open per store; a concurrent second scope fails
//!   fast with `TransactionState` instead of queueing.
//! - Change notices are type-scoped and published only after the write committed.
//! - Aggregation runs in memory over the decoded objects of one type.

use super::sled_handles::SledHandle;
use crate::core::adapter::{
    Adapter, SupportsAggregation, SupportsChangeNotification, SupportsTransactions,
};
use crate::core::aggregation::{aggregate_records, AggregationSpec};
use crate::core::backend_types::BackendKind;
use crate::core::config::ObjectStoreConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::query::{compare_by, OrderBy, Page};
use crate::core::reactive::{spawn_watch, ChangeNotice, ChangeNotifier, ChangeStream, WatchScope};
use crate::core::transaction::{ConcurrencyPolicy, TransactionGate};
use crate::core::value::{record_from_serializable, Outcome, Record};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::Transactional;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const BACKEND: &str = "object-store";
const META_TREE: &str = "__bridge_meta";

/// A type stored in the object store
///
/// `FIELDS` lists the serialized field names that ordering and aggregation may reference.
pub trait StoredObject: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespace of this type inside the store
    const TYPE_NAME: &'static str;
    /// Serialized field names
    const FIELDS: &'static [&'static str];
}

/// Identifier of a stored object, unique within its type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    fn key(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn from_key(key: &[u8]) -> Option<Self> {
        decode_u64(key).map(ObjectId)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed filter over stored objects
pub type ObjectFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Filter over the record form of stored objects, used for aggregation
pub type RecordPredicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Wrap a closure as an [`ObjectFilter`]
pub fn object_filter<T, F>(f: F) -> ObjectFilter<T>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Wrap a closure as a [`RecordPredicate`]
pub fn record_predicate<F>(f: F) -> RecordPredicate
where
    F: Fn(&Record) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// One write in an atomic object batch
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectOp {
    /// Store an object; a new id is assigned when `id` is `None`
    Put {
        /// Object type
        type_name: &'static str,
        /// Explicit id, or `None` for the next one
        id: Option<ObjectId>,
        /// Serialized field names of the type, persisted for aggregation
        fields: &'static [&'static str],
        /// JSON encoding of the object
        payload: Vec<u8>,
    },
    /// Remove an object; removing an absent id succeeds
    Delete {
        /// Object type
        type_name: &'static str,
        /// Id to remove
        id: ObjectId,
    },
}

impl ObjectOp {
    /// Store `value` under a new id
    pub fn put<T: StoredObject>(value: &T) -> Result<Self> {
        Ok(ObjectOp::Put {
            type_name: T::TYPE_NAME,
            id: None,
            fields: T::FIELDS,
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Store `value` under `id`, replacing any object already there
    pub fn put_with_id<T: StoredObject>(id: ObjectId, value: &T) -> Result<Self> {
        Ok(ObjectOp::Put {
            type_name: T::TYPE_NAME,
            id: Some(id),
            fields: T::FIELDS,
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Remove the object of type `T` with `id`
    pub fn delete<T: StoredObject>(id: ObjectId) -> Self {
        ObjectOp::Delete {
            type_name: T::TYPE_NAME,
            id,
        }
    }

    /// Type the operation writes to
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjectOp::Put { type_name, .. } | ObjectOp::Delete { type_name, .. } => type_name,
        }
    }
}

fn tree_name(type_name: &str) -> String {
    format!("objects/{}", type_name)
}

fn counter_key(type_name: &str) -> Vec<u8> {
    format!("seq/{}", type_name).into_bytes()
}

fn fields_key(type_name: &str) -> Vec<u8> {
    format!("fields/{}", type_name).into_bytes()
}

/// Field names persisted for `type_name`, if any object of it was ever stored
fn stored_fields(db: &sled::Db, type_name: &str) -> Result<Option<Vec<String>>> {
    let meta = db.open_tree(META_TREE)?;
    meta.get(fields_key(type_name))?
        .map(|bytes| Ok(serde_json::from_slice(&bytes)?))
        .transpose()
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(bytes).ok().map(u64::from_be_bytes)
}

fn decode_object<T: StoredObject>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn abort(error: BridgeError) -> ConflictableTransactionError<BridgeError> {
    ConflictableTransactionError::Abort(error)
}

fn read_counter(
    meta: &TransactionalTree,
    key: &[u8],
) -> ConflictableTransactionResult<u64, BridgeError> {
    match meta.get(key)? {
        Some(bytes) => decode_u64(&bytes)
            .ok_or_else(|| abort(BridgeError::validation("corrupt object id counter"))),
        None => Ok(0),
    }
}

/// Apply every operation in one sled transaction over the touched trees
fn apply_ops(db: &sled::Db, ops: &[ObjectOp]) -> Result<Vec<Outcome>> {
    let names: Vec<&'static str> = ops
        .iter()
        .map(ObjectOp::type_name)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut trees = Vec::with_capacity(names.len() + 1);
    trees.push(db.open_tree(META_TREE)?);
    for name in &names {
        trees.push(db.open_tree(tree_name(name))?);
    }

    let mut schemas: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for op in ops {
        if let ObjectOp::Put {
            type_name, fields, ..
        } = op
        {
            let key = fields_key(type_name);
            if !schemas.iter().any(|(k, _)| *k == key) {
                schemas.push((key, serde_json::to_vec(fields)?));
            }
        }
    }

    let result = trees.as_slice().transaction(|views| {
        let meta = &views[0];
        let mut outcomes = Vec::with_capacity(ops.len());
        for (key, fields) in &schemas {
            meta.insert(key.clone(), fields.clone())?;
        }

        for op in ops {
            let index = names
                .iter()
                .position(|name| *name == op.type_name())
                .ok_or_else(|| abort(BridgeError::validation("object type not in batch")))?;
            let tree = &views[index + 1];

            match op {
                ObjectOp::Put {
                    type_name,
                    id,
                    payload,
                    ..
                } => {
                    let key = counter_key(type_name);
                    let last = read_counter(meta, &key)?;
                    let id = match id {
                        Some(id) => {
                            if id.0 > last {
                                meta.insert(key, id.0.to_be_bytes().to_vec())?;
                            }
                            *id
                        }
                        None => {
                            let next = last.checked_add(1).ok_or_else(|| {
                                abort(BridgeError::validation("object id space exhausted"))
                            })?;
                            meta.insert(key, next.to_be_bytes().to_vec())?;
                            ObjectId(next)
                        }
                    };
                    tree.insert(id.key().to_vec(), payload.clone())?;
                    outcomes.push(Outcome::Id(id.0 as i64));
                }
                ObjectOp::Delete { id, .. } => {
                    let existed = tree.remove(id.key().to_vec())?.is_some();
                    outcomes.push(Outcome::Flag(existed));
                }
            }
        }

        Ok(outcomes)
    });

    match result {
        Ok(outcomes) => Ok(outcomes),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

struct ObjectInner {
    config: ObjectStoreConfig,
    db: RwLock<Option<SledHandle>>,
    open_lock: Mutex<()>,
    notifier: ChangeNotifier,
    gate: TransactionGate,
    schemas: RwLock<HashMap<String, Vec<String>>>,
}

/// Typed object store
///
/// Cheap to clone; clones share the sled handle, the notifier and the transaction gate.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<ObjectInner>,
}

impl ObjectStore {
    /// Create a store; call [`Adapter::open`] before use
    pub fn new(config: ObjectStoreConfig) -> Self {
        let notifier = ChangeNotifier::new(config.notify_capacity);
        Self {
            inner: Arc::new(ObjectInner {
                config,
                db: RwLock::new(None),
                open_lock: Mutex::new(()),
                notifier,
                gate: TransactionGate::new(BACKEND, ConcurrencyPolicy::FailFast),
                schemas: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Create a temporary store, removed when closed
    pub fn temporary() -> Self {
        Self::new(ObjectStoreConfig::temporary())
    }

    /// Store configuration
    pub fn config(&self) -> &ObjectStoreConfig {
        &self.inner.config
    }

    fn handle(&self) -> Result<sled::Db> {
        self.inner
            .db
            .read()
            .as_ref()
            .map(|shared| shared.db().clone())
            .ok_or_else(|| BridgeError::not_initialized(BACKEND))
    }

    fn learn<T: StoredObject>(&self) {
        if !self.inner.schemas.read().contains_key(T::TYPE_NAME) {
            let fields = T::FIELDS.iter().map(|f| f.to_string()).collect();
            self.inner
                .schemas
                .write()
                .insert(T::TYPE_NAME.to_string(), fields);
        }
    }

    /// Run a blocking sled call off the async runtime
    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&sled::Db) -> Result<R> + Send + 'static,
    {
        let db = self.handle()?;
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    async fn tree_call<T, R, F>(&self, f: F) -> Result<R>
    where
        T: StoredObject,
        R: Send + 'static,
        F: FnOnce(&sled::Tree) -> Result<R> + Send + 'static,
    {
        self.learn::<T>();
        self.blocking(move |db| {
            let tree = db.open_tree(tree_name(T::TYPE_NAME))?;
            f(&tree)
        })
        .await
    }

    async fn commit(&self, ops: Vec<ObjectOp>) -> Result<Vec<Outcome>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let flush = self.inner.config.flush_on_write;
        let touched: BTreeSet<&'static str> = ops.iter().map(ObjectOp::type_name).collect();

        let outcomes = self
            .blocking(move |db| {
                let outcomes = apply_ops(db, &ops)?;
                if flush {
                    db.flush()?;
                }
                Ok(outcomes)
            })
            .await?;

        for type_name in touched {
            self.inner.notifier.publish(type_name);
        }
        Ok(outcomes)
    }

    /// Make `T` known to aggregation by type name
    pub fn register<T: StoredObject>(&self) {
        self.learn::<T>();
    }

    /// Store `value` under a new id
    pub async fn put<T: StoredObject>(&self, value: &T) -> Result<ObjectId> {
        self.learn::<T>();
        let outcomes = self.commit(vec![ObjectOp::put(value)?]).await?;
        first_id(&outcomes)
    }

    /// Store `value` under `id`, replacing any object already there
    pub async fn put_with_id<T: StoredObject>(&self, id: ObjectId, value: &T) -> Result<()> {
        self.learn::<T>();
        self.commit(vec![ObjectOp::put_with_id(id, value)?]).await?;
        Ok(())
    }

    /// Store several objects under new ids; all or none are stored
    pub async fn put_many<T: StoredObject>(&self, values: &[T]) -> Result<Vec<ObjectId>> {
        self.learn::<T>();
        let ops = values.iter().map(ObjectOp::put).collect::<Result<Vec<_>>>()?;
        let outcomes = self.commit(ops).await?;
        outcomes
            .iter()
            .map(|outcome| first_id(std::slice::from_ref(outcome)))
            .collect()
    }

    /// The object with `id`
    pub async fn get<T: StoredObject>(&self, id: ObjectId) -> Result<Option<T>> {
        self.tree_call::<T, _, _>(move |tree| {
            tree.get(id.key())?
                .map(|bytes| decode_object::<T>(&bytes))
                .transpose()
        })
        .await
    }

    /// The object with `id`, or `default` when absent
    pub async fn get_or<T: StoredObject>(&self, id: ObjectId, default: T) -> Result<T> {
        Ok(self.get::<T>(id).await?.unwrap_or(default))
    }

    /// The objects with `ids`, in the same order; absent ids yield `None`
    pub async fn get_many<T: StoredObject>(&self, ids: &[ObjectId]) -> Result<Vec<Option<T>>> {
        let ids = ids.to_vec();
        self.tree_call::<T, _, _>(move |tree| {
            ids.iter()
                .map(|id| {
                    tree.get(id.key())?
                        .map(|bytes| decode_object::<T>(&bytes))
                        .transpose()
                })
                .collect()
        })
        .await
    }

    /// Remove the object with `id`; removing an absent id succeeds
    pub async fn delete<T: StoredObject>(&self, id: ObjectId) -> Result<()> {
        self.learn::<T>();
        self.commit(vec![ObjectOp::delete::<T>(id)]).await?;
        Ok(())
    }

    /// Remove several objects; all or none are removed
    ///
    /// Returns how many of the ids were present.
    pub async fn delete_many<T: StoredObject>(&self, ids: &[ObjectId]) -> Result<u64> {
        self.learn::<T>();
        let ops = ids.iter().map(|id| ObjectOp::delete::<T>(*id)).collect();
        let outcomes = self.commit(ops).await?;
        Ok(outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Outcome::Flag(true)))
            .count() as u64)
    }

    /// Remove every object of type `T`, returning how many were removed
    ///
    /// The id counter is kept, so ids stay unique across clears.
    pub async fn delete_all<T: StoredObject>(&self) -> Result<u64> {
        let flush = self.inner.config.flush_on_write;
        let removed = self
            .tree_call::<T, _, _>(move |tree| {
                let mut batch = sled::Batch::default();
                let mut removed = 0u64;
                for key in tree.iter().keys() {
                    batch.remove(key?);
                    removed += 1;
                }
                tree.apply_batch(batch)?;
                if flush {
                    tree.flush()?;
                }
                Ok(removed)
            })
            .await?;

        if removed > 0 {
            self.inner.notifier.publish(T::TYPE_NAME);
        }
        Ok(removed)
    }

    /// Number of stored objects of type `T`
    pub async fn count<T: StoredObject>(&self) -> Result<u64> {
        self.tree_call::<T, _, _>(|tree| Ok(tree.len() as u64)).await
    }

    /// Whether an object with `id` exists
    pub async fn exists<T: StoredObject>(&self, id: ObjectId) -> Result<bool> {
        self.tree_call::<T, _, _>(move |tree| Ok(tree.contains_key(id.key())?))
            .await
    }

    /// Matching objects with their ids, ordered then paged
    ///
    /// Without ordering keys, objects come back in id order. Ordering keys must name
    /// fields of `T`.
    pub async fn query<T: StoredObject>(
        &self,
        filter: Option<ObjectFilter<T>>,
        order: &[OrderBy],
        page: Page,
    ) -> Result<Vec<(ObjectId, T)>> {
        for key in order {
            if !T::FIELDS.contains(&key.column.as_str()) {
                return Err(BridgeError::validation(format!(
                    "'{}' is not a field of '{}'",
                    key.column,
                    T::TYPE_NAME
                )));
            }
        }

        let order = order.to_vec();
        self.tree_call::<T, _, _>(move |tree| {
            let mut matches: Vec<(Record, ObjectId, T)> = Vec::new();
            for item in tree.iter() {
                let (key, bytes) = item?;
                let id = ObjectId::from_key(&key)
                    .ok_or_else(|| BridgeError::validation("corrupt object key"))?;
                let object = decode_object::<T>(&bytes)?;
                if filter.as_ref().map_or(true, |f| f(&object)) {
                    let sort_key = if order.is_empty() {
                        Record::new()
                    } else {
                        record_from_serializable(&object)?
                    };
                    matches.push((sort_key, id, object));
                }
            }

            if !order.is_empty() {
                matches.sort_by(|a, b| compare_by(&a.0, &b.0, &order));
            }
            Ok(page.apply(matches.into_iter().map(|(_, id, object)| (id, object))))
        })
        .await
    }

    /// Live query over objects of type `T`
    ///
    /// Emits the current result immediately, then a fresh full result after every
    /// committed write to `T`.
    pub fn watch<T: StoredObject>(
        &self,
        filter: Option<ObjectFilter<T>>,
        order: Vec<OrderBy>,
        page: Page,
    ) -> ChangeStream<Vec<(ObjectId, T)>> {
        self.learn::<T>();
        let store = self.clone();
        spawn_watch(
            self.inner.notifier.subscribe(),
            WatchScope::Collection(T::TYPE_NAME.to_string()),
            move || {
                let store = store.clone();
                let filter = filter.clone();
                let order = order.clone();
                async move { store.query::<T>(filter, &order, page).await }
            },
        )
    }
}

fn first_id(outcomes: &[Outcome]) -> Result<ObjectId> {
    match outcomes.first() {
        Some(Outcome::Id(id)) => Ok(ObjectId(*id as u64)),
        _ => Err(BridgeError::validation("store did not report an object id")),
    }
}

#[async_trait]
impl Adapter for ObjectStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::EmbeddedObject
    }

    async fn open(&self) -> Result<()> {
        let _guard = self.inner.open_lock.lock().await;
        if self.inner.db.read().is_some() {
            return Ok(());
        }

        let path = self.inner.config.path.clone();
        let db = tokio::task::spawn_blocking(move || {
            SledHandle::acquire(path.as_deref()).map_err(|e| {
                BridgeError::initialization_with_source(BACKEND, "failed to open sled store", e)
            })
        })
        .await??;

        *self.inner.db.write() = Some(db);
        tracing::info!(path = ?self.inner.config.path, "object store opened");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.db.read().is_some()
    }

    async fn close(&self) -> Result<()> {
        if self.inner.gate.in_scope() {
            return Err(BridgeError::transaction_state(
                "cannot close the object store inside a transaction scope",
            ));
        }

        let _guard = self.inner.open_lock.lock().await;
        let db = self.inner.db.write().take();
        if let Some(shared) = db {
            tokio::task::spawn_blocking(move || shared.db().flush()).await??;
            self.inner.notifier.publish_closed();
            tracing::info!("object store closed");
        }
        Ok(())
    }
}

#[async_trait]
impl SupportsTransactions for ObjectStore {
    type Operation = ObjectOp;

    async fn run_atomic(&self, operations: Vec<ObjectOp>) -> Result<Vec<Outcome>> {
        let _permit = self.inner.gate.enter().await?;
        tracing::debug!(operations = operations.len(), "running atomic object batch");

        self.inner
            .gate
            .scoped(self.commit(operations))
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "object batch rolled back"))
    }
}

impl SupportsChangeNotification for ObjectStore {
    fn change_notices(&self) -> broadcast::Receiver<ChangeNotice> {
        self.inner.notifier.subscribe()
    }
}

#[async_trait]
impl SupportsAggregation for ObjectStore {
    type Predicate = RecordPredicate;

    async fn aggregate(
        &self,
        type_name: &str,
        spec: &AggregationSpec<RecordPredicate>,
    ) -> Result<Vec<Record>> {
        let known = self.inner.schemas.read().get(type_name).cloned();
        let fields = match known {
            Some(fields) => fields,
            None => {
                let name = type_name.to_string();
                let stored = self.blocking(move |db| stored_fields(db, &name)).await?;
                let fields = stored.ok_or_else(|| {
                    BridgeError::validation(format!("unknown object type '{}'", type_name))
                })?;
                self.inner
                    .schemas
                    .write()
                    .insert(type_name.to_string(), fields.clone());
                fields
            }
        };
        spec.validate(|column| fields.iter().any(|f| f == column))?;

        let tree = tree_name(type_name);
        let filter = spec.filter.clone();
        let records = self
            .blocking(move |db| {
                let tree = db.open_tree(tree)?;
                let mut records = Vec::new();
                for item in tree.iter().values() {
                    let value: serde_json::Value = serde_json::from_slice(&item?)?;
                    let record = record_from_serializable(&value)?;
                    if filter.as_ref().map_or(true, |f| f(&record)) {
                        records.push(record);
                    }
                }
                Ok(records)
            })
            .await?;

        Ok(aggregate_records(records, spec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aggregation::Aggregate;
    use crate::core::error::ErrorKind;
    use crate::core::value::FieldValue;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Person {
        name: String,
        dept: String,
        age: i64,
    }

    impl StoredObject for Person {
        const TYPE_NAME: &'static str = "person";
        const FIELDS: &'static [&'static str] = &["name", "dept", "age"];
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    impl StoredObject for Note {
        const TYPE_NAME: &'static str = "note";
        const FIELDS: &'static [&'static str] = &["text"];
    }

    fn person(name: &str, dept: &str, age: i64) -> Person {
        Person {
            name: name.to_string(),
            dept: dept.to_string(),
            age,
        }
    }

    async fn open_store() -> ObjectStore {
        let store = ObjectStore::temporary();
        store.open().await.unwrap();
        store.open().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = open_store().await;
        let id = store.put(&person("ann", "A", 30)).await.unwrap();

        assert_eq!(store.get::<Person>(id).await.unwrap().unwrap().name, "ann");
        assert!(store.exists::<Person>(id).await.unwrap());
        assert_eq!(store.count::<Person>().await.unwrap(), 1);

        store.delete::<Person>(id).await.unwrap();
        store.delete::<Person>(id).await.unwrap();
        assert!(store.get::<Person>(id).await.unwrap().is_none());

        let fallback = store
            .get_or(id, person("nobody", "-", 0))
            .await
            .unwrap();
        assert_eq!(fallback.name, "nobody");
    }

    #[tokio::test]
    async fn test_ids_are_never_reused() {
        let store = open_store().await;
        let first = store.put(&person("a", "A", 1)).await.unwrap();
        store.delete::<Person>(first).await.unwrap();
        let second = store.put(&person("b", "A", 2)).await.unwrap();
        assert!(second > first);

        store.put_with_id(ObjectId(100), &person("c", "A", 3)).await.unwrap();
        let third = store.put(&person("d", "A", 4)).await.unwrap();
        assert_eq!(third, ObjectId(101));

        assert_eq!(store.delete_all::<Person>().await.unwrap(), 3);
        let fourth = store.put(&person("e", "A", 5)).await.unwrap();
        assert_eq!(fourth, ObjectId(102));
    }

    #[tokio::test]
    async fn test_query_filter_order_page() {
        let store = open_store().await;
        store
            .put_many(&[
                person("ann", "A", 30),
                person("bob", "B", 20),
                person("cid", "A", 40),
            ])
            .await
            .unwrap();

        let in_a = object_filter(|p: &Person| p.dept == "A");
        let rows = store
            .query::<Person>(Some(in_a), &[OrderBy::desc("age")], Page::all())
            .await
            .unwrap();
        let names: Vec<_> = rows.iter().map(|(_, p)| p.name.as_str()).collect();
        assert_eq!(names, vec!["cid", "ann"]);

        let paged = store
            .query::<Person>(None, &[OrderBy::asc("age")], Page::first(1).offset(1))
            .await
            .unwrap();
        assert_eq!(paged[0].1.name, "ann");

        let err = store
            .query::<Person>(None, &[OrderBy::asc("salary")], Page::all())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_run_atomic_spans_types() {
        let store = open_store().await;
        let ops = vec![
            ObjectOp::put(&person("ann", "A", 30)).unwrap(),
            ObjectOp::put(&Note { text: "hi".into() }).unwrap(),
        ];
        let outcomes = store.run_atomic(ops).await.unwrap();
        assert_eq!(outcomes, vec![Outcome::Id(1), Outcome::Id(1)]);
        assert_eq!(store.count::<Note>().await.unwrap(), 1);

        let meta = store.handle().unwrap().open_tree(META_TREE).unwrap();
        meta.insert(counter_key(Person::TYPE_NAME), b"bad".to_vec())
            .unwrap();

        let doomed = vec![
            ObjectOp::put(&Note { text: "lost".into() }).unwrap(),
            ObjectOp::put(&person("bob", "B", 1)).unwrap(),
        ];
        let err = store.run_atomic(doomed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.count::<Note>().await.unwrap(), 1);
        assert_eq!(store.count::<Person>().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_scope_fails_fast() {
        let store = open_store().await;
        let permit = store.inner.gate.enter().await.unwrap();

        let err = store
            .run_atomic(vec![ObjectOp::put(&person("x", "X", 1)).unwrap()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransactionState);
        drop(permit);

        assert!(store
            .run_atomic(vec![ObjectOp::put(&person("x", "X", 1)).unwrap()])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_aggregation_over_objects() {
        let store = open_store().await;
        store
            .put_many(&[
                person("a", "A", 10),
                person("b", "A", 20),
                person("c", "B", 5),
            ])
            .await
            .unwrap();

        let spec = AggregationSpec::new()
            .group_by(["dept"])
            .aggregate("avg_age", Aggregate::Avg("age".into()))
            .order_by(OrderBy::asc("dept"));
        let rows = store.aggregate("person", &spec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["avg_age"], FieldValue::Double(15.0));
        assert_eq!(rows[1]["avg_age"], FieldValue::Double(5.0));

        let only_a = record_predicate(|r| r.get("dept").and_then(FieldValue::as_str) == Some("A"));
        assert_eq!(store.aggregate_count("person", Some(only_a)).await.unwrap(), 2);
        assert_eq!(store.aggregate_sum("person", "age", None).await.unwrap(), Some(35.0));

        let err = store.aggregate("ghost", &spec).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_watch_is_type_scoped() {
        let store = open_store().await;
        let mut stream = store.watch::<Person>(None, vec![], Page::all());
        assert!(stream.next().await.unwrap().unwrap().is_empty());

        store.put(&Note { text: "ignored".into() }).await.unwrap();
        store.put(&person("ann", "A", 30)).await.unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = open_store().await;
        store.close().await.unwrap();
        store.close().await.unwrap();

        let err = store.count::<Person>().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_reopen_on_disk_keeps_objects() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig::at(dir.path().join("objects")).with_flush_on_write(true);

        let store = ObjectStore::new(config.clone());
        store.open().await.unwrap();
        let id = store.put(&person("ann", "A", 30)).await.unwrap();
        store.close().await.unwrap();
        drop(store);

        let reopened = ObjectStore::new(config);
        reopened.open().await.unwrap();
        assert_eq!(reopened.get::<Person>(id).await.unwrap().unwrap().age, 30);
        let next = reopened.put(&person("bob", "B", 1)).await.unwrap();
        assert!(next > id);
    }

    #[tokio::test]
    async fn test_aggregate_after_reopen_without_typed_calls() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig::at(dir.path().join("objects"));

        let store = ObjectStore::new(config.clone());
        store.open().await.unwrap();
        store
            .put_many(&[person("a", "A", 10), person("b", "A", 20), person("c", "B", 5)])
            .await
            .unwrap();
        store.close().await.unwrap();
        drop(store);

        let reopened = ObjectStore::new(config);
        reopened.open().await.unwrap();
        let spec = AggregationSpec::new()
            .group_by(["dept"])
            .aggregate("n", Aggregate::Count)
            .order_by(OrderBy::asc("dept"));
        let rows = reopened.aggregate("person", &spec).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["n"].as_long(), Some(2));

        let bad = AggregationSpec::new().aggregate("total", Aggregate::Sum("salary".into()));
        let err = reopened.aggregate("person", &bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
