//! Embedded key-value boxes on sled (embedded-keyvalue)
//!
//! A box is one sled tree holding JSON-encoded values under string keys. With an
//! [`EncryptionKey`] every value is sealed with AES-256-GCM, using the entry key as
//! associated data so a sealed value cannot be moved to another key unnoticed.
//!
//! # Guarantees
//!
//! - `write_many` and `delete_many` are all-or-nothing: each is one sled batch.
//! - There are no transaction scopes. [`run_best_effort`](SupportsBestEffortBatch::run_best_effort)
//!   applies operations one by one and rolls nothing back; a failure reports the
//!   operations already applied.
//! - Change notices are box-scoped. `watch_key` re-reads its key after any write to the
//!   box, so it may emit an unchanged value.

use super::sled_handles::SledHandle;
use crate::core::adapter::{
    Adapter, KeyValueAdapter, KvOperation, SupportsBestEffortBatch, SupportsChangeNotification,
};
use crate::core::backend_types::BackendKind;
use crate::core::config::KeyValueConfig;
use crate::core::crypto::{Cipher, EncryptionKey};
use crate::core::error::{BridgeError, Result};
use crate::core::query::{compare_by, OrderBy, Page};
use crate::core::reactive::{spawn_watch, ChangeNotice, ChangeNotifier, ChangeStream, WatchScope};
use crate::core::value::{FieldValue, Outcome, Record};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const BACKEND: &str = "kv-store";

/// Pseudo-column holding the entry key when ordering query results
pub const KEY_COLUMN: &str = "key";

/// Pseudo-column holding a scalar value when ordering query results
pub const VALUE_COLUMN: &str = "value";

/// Filter over decoded entries
pub type EntryFilter<V> = Arc<dyn Fn(&str, &V) -> bool + Send + Sync>;

/// Wrap a closure as an [`EntryFilter`]
pub fn entry_filter<V, F>(f: F) -> EntryFilter<V>
where
    F: Fn(&str, &V) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Encodes values for one box
#[derive(Clone)]
struct Codec {
    cipher: Option<Arc<Cipher>>,
}

impl Codec {
    fn encode_json(&self, key: &str, json: &serde_json::Value) -> Result<Vec<u8>> {
        let plain = serde_json::to_vec(json)?;
        match &self.cipher {
            Some(cipher) => cipher.seal(&plain, key.as_bytes()),
            None => Ok(plain),
        }
    }

    fn encode<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> Result<Vec<u8>> {
        self.encode_json(key, &serde_json::to_value(value)?)
    }

    fn decode<V: DeserializeOwned>(&self, key: &[u8], bytes: &[u8]) -> Result<V> {
        match &self.cipher {
            Some(cipher) => Ok(serde_json::from_slice(&cipher.open(bytes, key)?)?),
            None => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

fn key_string(key: &[u8]) -> Result<String> {
    String::from_utf8(key.to_vec())
        .map_err(|_| BridgeError::validation("stored key is not valid UTF-8"))
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BridgeError::validation("empty keys are not allowed"));
    }
    Ok(())
}

/// Ordering view of one entry: the key plus the value's fields, or the scalar value
fn sort_record<V: Serialize>(key: &str, value: &V) -> Result<Record> {
    let mut record = Record::new();
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => {
            for (field, json) in map {
                record.insert(field, FieldValue::from_json(json));
            }
        }
        scalar => {
            record.insert(VALUE_COLUMN.to_string(), FieldValue::from_json(scalar));
        }
    }
    record.insert(KEY_COLUMN.to_string(), FieldValue::from(key));
    Ok(record)
}

struct KvInner {
    config: KeyValueConfig,
    codec: Codec,
    handle: RwLock<Option<(SledHandle, sled::Tree)>>,
    open_lock: Mutex<()>,
    notifier: ChangeNotifier,
}

/// One key-value box
///
/// Cheap to clone; clones share the sled handle and the notifier.
#[derive(Clone)]
pub struct KeyValueStore {
    inner: Arc<KvInner>,
}

impl KeyValueStore {
    /// Create an unencrypted box; call [`Adapter::open`] before use
    pub fn new(config: KeyValueConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a box whose values are sealed with `key`
    pub fn encrypted(config: KeyValueConfig, key: &EncryptionKey) -> Self {
        Self::build(config, Some(Arc::new(Cipher::new(key))))
    }

    /// Create an unencrypted temporary box
    pub fn temporary(box_name: impl Into<String>) -> Self {
        Self::new(KeyValueConfig::temporary(box_name))
    }

    fn build(config: KeyValueConfig, cipher: Option<Arc<Cipher>>) -> Self {
        let notifier = ChangeNotifier::new(config.notify_capacity);
        Self {
            inner: Arc::new(KvInner {
                config,
                codec: Codec { cipher },
                handle: RwLock::new(None),
                open_lock: Mutex::new(()),
                notifier,
            }),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &KeyValueConfig {
        &self.inner.config
    }

    /// Whether values are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.inner.codec.cipher.is_some()
    }

    fn box_name(&self) -> &str {
        &self.inner.config.box_name
    }

    /// Run a blocking call against the box tree off the async runtime
    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&sled::Tree, &Codec) -> Result<R> + Send + 'static,
    {
        let tree = self
            .inner
            .handle
            .read()
            .as_ref()
            .map(|(_, tree)| tree.clone())
            .ok_or_else(|| BridgeError::not_initialized(BACKEND))?;
        let codec = self.inner.codec.clone();
        tokio::task::spawn_blocking(move || f(&tree, &codec)).await?
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&sled::Tree, &Codec) -> Result<(R, bool)> + Send + 'static,
    {
        let flush = self.inner.config.flush_on_write;
        let (result, changed) = self
            .blocking(move |tree, codec| {
                let (result, changed) = f(tree, codec)?;
                if changed && flush {
                    tree.flush()?;
                }
                Ok((result, changed))
            })
            .await?;

        if changed {
            self.inner.notifier.publish(self.box_name());
        }
        Ok(result)
    }

    async fn write_json(&self, key: &str, json: serde_json::Value) -> Result<()> {
        validate_key(key)?;
        let key = key.to_string();
        self.mutate(move |tree, codec| {
            let bytes = codec.encode_json(&key, &json)?;
            tree.insert(key.as_bytes(), bytes)?;
            Ok(((), true))
        })
        .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.mutate(move |tree, _| {
            let existed = tree.remove(key.as_bytes())?.is_some();
            Ok((existed, existed))
        })
        .await
    }

    /// Read the value under `key`, or `None` when absent
    pub async fn get<V>(&self, key: &str) -> Result<Option<V>>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.blocking(move |tree, codec| {
            tree.get(key.as_bytes())?
                .map(|bytes| codec.decode::<V>(key.as_bytes(), &bytes))
                .transpose()
        })
        .await
    }

    /// Matching entries, ordered then paged
    ///
    /// Ordering keys name fields of the value, [`KEY_COLUMN`] for the entry key, or
    /// [`VALUE_COLUMN`] for scalar values. Without ordering keys, entries come back in
    /// key order.
    pub async fn query<V>(
        &self,
        filter: Option<EntryFilter<V>>,
        order: &[OrderBy],
        page: Page,
    ) -> Result<Vec<(String, V)>>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
    {
        let order = order.to_vec();
        self.blocking(move |tree, codec| {
            let mut matches: Vec<(Record, String, V)> = Vec::new();
            for item in tree.iter() {
                let (key, bytes) = item?;
                let value = codec.decode::<V>(&key, &bytes)?;
                let key = key_string(&key)?;
                if filter.as_ref().map_or(true, |f| f(&key, &value)) {
                    let sort_key = if order.is_empty() {
                        Record::new()
                    } else {
                        sort_record(&key, &value)?
                    };
                    matches.push((sort_key, key, value));
                }
            }

            if !order.is_empty() {
                matches.sort_by(|a, b| compare_by(&a.0, &b.0, &order));
            }
            Ok(page.apply(matches.into_iter().map(|(_, key, value)| (key, value))))
        })
        .await
    }

    /// Live view of the whole box
    pub fn watch<V>(&self) -> ChangeStream<BTreeMap<String, V>>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let store = self.clone();
        spawn_watch(
            self.inner.notifier.subscribe(),
            WatchScope::Collection(self.box_name().to_string()),
            move || {
                let store = store.clone();
                async move { store.read_all::<V>().await }
            },
        )
    }

    /// Live view of one key
    pub fn watch_key<V>(&self, key: &str) -> ChangeStream<Option<V>>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let store = self.clone();
        let key = key.to_string();
        spawn_watch(
            self.inner.notifier.subscribe(),
            WatchScope::Collection(self.box_name().to_string()),
            move || {
                let store = store.clone();
                let key = key.clone();
                async move { store.get::<V>(&key).await }
            },
        )
    }
}

#[async_trait]
impl Adapter for KeyValueStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::EmbeddedKeyValue
    }

    async fn open(&self) -> Result<()> {
        let _guard = self.inner.open_lock.lock().await;
        if self.inner.handle.read().is_some() {
            return Ok(());
        }
        if self.box_name().is_empty() {
            return Err(BridgeError::initialization(BACKEND, "box name is empty"));
        }

        let path = self.inner.config.path.clone();
        let tree_name = format!("box/{}", self.box_name());
        let handle = tokio::task::spawn_blocking(move || {
            let shared = SledHandle::acquire(path.as_deref()).map_err(|e| {
                BridgeError::initialization_with_source(BACKEND, "failed to open sled store", e)
            })?;
            let tree = shared.db().open_tree(tree_name).map_err(|e| {
                BridgeError::initialization_with_source(BACKEND, "failed to open box", e)
            })?;
            Ok::<_, BridgeError>((shared, tree))
        })
        .await??;

        *self.inner.handle.write() = Some(handle);
        tracing::info!(
            box_name = %self.box_name(),
            encrypted = self.is_encrypted(),
            "key-value box opened"
        );
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.handle.read().is_some()
    }

    async fn close(&self) -> Result<()> {
        let _guard = self.inner.open_lock.lock().await;
        let handle = self.inner.handle.write().take();
        if let Some((shared, tree)) = handle {
            tokio::task::spawn_blocking(move || {
                tree.flush()?;
                drop(tree);
                shared.db().flush()
            })
            .await??;
            self.inner.notifier.publish_closed();
            tracing::info!(box_name = %self.box_name(), "key-value box closed");
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueAdapter for KeyValueStore {
    async fn write<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize + Sync,
    {
        self.write_json(key, serde_json::to_value(value)?).await
    }

    async fn read<V>(&self, key: &str, default: V) -> Result<V>
    where
        V: DeserializeOwned + Send,
    {
        let key = key.to_string();
        let bytes = self
            .blocking(move |tree, _| Ok(tree.get(key.as_bytes())?.map(|b| (key, b))))
            .await?;
        match bytes {
            Some((key, bytes)) => self.inner.codec.decode(key.as_bytes(), &bytes),
            None => Ok(default),
        }
    }

    async fn write_many<V>(&self, entries: &[(String, V)]) -> Result<()>
    where
        V: Serialize + Sync,
    {
        if entries.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for (key, value) in entries {
            validate_key(key)?;
            batch.insert(key.as_bytes(), self.inner.codec.encode(key, value)?);
        }
        let count = entries.len();
        self.mutate(move |tree, _| {
            tree.apply_batch(batch)?;
            Ok(((), true))
        })
        .await?;
        tracing::debug!(box_name = %self.box_name(), count, "batch written");
        Ok(())
    }

    async fn read_all<V>(&self) -> Result<BTreeMap<String, V>>
    where
        V: DeserializeOwned + Send,
    {
        let raw = self
            .blocking(|tree, _| {
                tree.iter()
                    .map(|item| item.map_err(BridgeError::from))
                    .collect::<Result<Vec<_>>>()
            })
            .await?;
        raw.into_iter()
            .map(|(key, bytes)| {
                let value = self.inner.codec.decode(&key, &bytes)?;
                Ok((key_string(&key)?, value))
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let keys = keys.to_vec();
        self.mutate(move |tree, _| {
            let mut batch = sled::Batch::default();
            let mut changed = false;
            for key in &keys {
                changed |= tree.contains_key(key.as_bytes())?;
                batch.remove(key.as_bytes());
            }
            tree.apply_batch(batch)?;
            Ok(((), changed))
        })
        .await
    }

    async fn delete_all(&self) -> Result<u64> {
        self.mutate(|tree, _| {
            let mut batch = sled::Batch::default();
            let mut removed = 0u64;
            for key in tree.iter().keys() {
                batch.remove(key?);
                removed += 1;
            }
            tree.apply_batch(batch)?;
            Ok((removed, removed > 0))
        })
        .await
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.blocking(move |tree, _| Ok(tree.contains_key(key.as_bytes())?))
            .await
    }

    async fn count(&self) -> Result<u64> {
        self.blocking(|tree, _| Ok(tree.len() as u64)).await
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.blocking(|tree, _| {
            tree.iter()
                .keys()
                .map(|key| key_string(&key?))
                .collect()
        })
        .await
    }
}

#[async_trait]
impl SupportsBestEffortBatch for KeyValueStore {
    type Operation = KvOperation;

    async fn apply(&self, operation: KvOperation) -> Result<Outcome> {
        match operation {
            KvOperation::Write { key, value } => {
                self.write_json(&key, value).await?;
                Ok(Outcome::Done)
            }
            KvOperation::Delete { key } => Ok(Outcome::Flag(self.remove(&key).await?)),
            KvOperation::Contains { key } => Ok(Outcome::Flag(self.contains(&key).await?)),
        }
    }
}

impl SupportsChangeNotification for KeyValueStore {
    fn change_notices(&self) -> broadcast::Receiver<ChangeNotice> {
        self.inner.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        volume: i64,
    }

    async fn open_box() -> KeyValueStore {
        let store = KeyValueStore::temporary("settings");
        store.open().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let store = open_box().await;
        let settings = Settings {
            theme: "dark".into(),
            volume: 7,
        };
        store.write("user", &settings).await.unwrap();

        let loaded: Settings = store
            .read(
                "user",
                Settings {
                    theme: "light".into(),
                    volume: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(loaded, settings);

        let missing: i64 = store.read("absent", 42).await.unwrap();
        assert_eq!(missing, 42);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = open_box().await;
        store.write("k", &1).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert!(!store.contains("k").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_and_read_all() {
        let store = open_box().await;
        store.write("pre", &0).await.unwrap();
        let entries: Vec<(String, i64)> = (1..=5).map(|i| (format!("k{}", i), i)).collect();
        store.write_many(&entries).await.unwrap();

        let all: BTreeMap<String, i64> = store.read_all().await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(all["k3"], 3);

        store
            .delete_many(&["k1".to_string(), "k2".to_string()])
            .await
            .unwrap();
        assert_eq!(store.keys().await.unwrap(), vec!["k3", "k4", "k5", "pre"]);
        assert_eq!(store.delete_all().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_write_many_rejects_whole_batch() {
        let store = open_box().await;
        let entries = vec![("ok".to_string(), 1), (String::new(), 2)];
        let err = store.write_many(&entries).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_best_effort_batch_reports_progress() {
        let store = open_box().await;
        let ops = vec![
            KvOperation::write("a", &1).unwrap(),
            KvOperation::contains("a"),
            KvOperation::write("", &2).unwrap(),
            KvOperation::write("c", &3).unwrap(),
        ];

        match store.run_best_effort(ops).await.unwrap_err() {
            BridgeError::BatchAborted {
                index, completed, ..
            } => {
                assert_eq!(index, 2);
                assert_eq!(completed, vec![Outcome::Done, Outcome::Flag(true)]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.contains("a").await.unwrap());
        assert!(!store.contains("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_orders_by_field() {
        let store = open_box().await;
        for (key, volume) in [("a", 5), ("b", 1), ("c", 9)] {
            store
                .write(
                    key,
                    &Settings {
                        theme: "x".into(),
                        volume,
                    },
                )
                .await
                .unwrap();
        }

        let loud = entry_filter(|_: &str, s: &Settings| s.volume > 2);
        let rows = store
            .query::<Settings>(Some(loud), &[OrderBy::desc("volume")], Page::all())
            .await
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "a"]);

        let scalars = open_box().await;
        scalars.write("x", &3).await.unwrap();
        scalars.write("y", &1).await.unwrap();
        let rows = scalars
            .query::<i64>(None, &[OrderBy::asc(VALUE_COLUMN)], Page::first(1))
            .await
            .unwrap();
        assert_eq!(rows, vec![("y".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_encrypted_box() {
        let dir = tempfile::tempdir().unwrap();
        let config = KeyValueConfig::at(dir.path().join("kv"), "secrets");
        let key = EncryptionKey::generate();

        let store = KeyValueStore::encrypted(config.clone(), &key);
        store.open().await.unwrap();
        store.write("token", &"abc123").await.unwrap();
        assert_eq!(
            store.read("token", String::new()).await.unwrap(),
            "abc123"
        );
        store.close().await.unwrap();
        drop(store);

        let plain = KeyValueStore::new(config.clone());
        plain.open().await.unwrap();
        let err = plain.read("token", String::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Serialization);
        plain.close().await.unwrap();
        drop(plain);

        let wrong = KeyValueStore::encrypted(config, &EncryptionKey::generate());
        wrong.open().await.unwrap();
        let err = wrong.read("token", String::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Crypto);
    }

    #[tokio::test]
    async fn test_boxes_share_one_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv");
        let prefs = KeyValueStore::new(KeyValueConfig::at(&path, "prefs"));
        let cache = KeyValueStore::new(KeyValueConfig::at(&path, "cache"));
        prefs.open().await.unwrap();
        cache.open().await.unwrap();

        prefs.write("theme", &"dark").await.unwrap();
        cache.write("theme", &"stale").await.unwrap();
        assert_eq!(cache.delete_all().await.unwrap(), 1);
        assert_eq!(prefs.read("theme", String::new()).await.unwrap(), "dark");

        prefs.close().await.unwrap();
        cache.write("etag", &7).await.unwrap();
        cache.close().await.unwrap();

        let reopened = KeyValueStore::new(KeyValueConfig::at(&path, "cache"));
        reopened.open().await.unwrap();
        assert_eq!(reopened.read("etag", 0).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_watch_key_follows_writes() {
        let store = open_box().await;
        let mut stream = store.watch_key::<i64>("counter");
        assert_eq!(stream.next().await.unwrap().unwrap(), None);

        store.write("counter", &1).await.unwrap();
        let value = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(value, Some(1));

        store.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_unopened_box_fails() {
        let store = KeyValueStore::temporary("never");
        let err = store.count().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }
}
