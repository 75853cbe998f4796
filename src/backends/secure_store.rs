//! Key-value store over a secret vault (secure-keyvalue)
//!
//! Values are JSON-encoded into vault strings under `"<namespace>.<key>"`. The vault is
//! an external collaborator with no batch or transaction primitive, so every multi-entry
//! operation here is best-effort: entries are applied one by one, nothing is rolled back,
//! and a failure surfaces as `BatchAborted` with the outcomes applied before it.

use crate::core::adapter::{Adapter, KeyValueAdapter, KvOperation, SupportsBestEffortBatch};
use crate::core::backend_types::BackendKind;
use crate::core::config::SecureStoreConfig;
use crate::core::error::{BridgeError, Result};
use crate::core::transaction::run_sequential;
use crate::core::value::Outcome;
use crate::core::vault::SecretVault;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const BACKEND: &str = "secure-store";

/// Key-value adapter over any [`SecretVault`]
#[derive(Clone)]
pub struct SecureStore {
    vault: Arc<dyn SecretVault>,
    config: SecureStoreConfig,
    opened: Arc<AtomicBool>,
}

impl SecureStore {
    /// Create a store over `vault`; call [`Adapter::open`] before use
    pub fn new(vault: Arc<dyn SecretVault>, config: SecureStoreConfig) -> Self {
        Self {
            vault,
            config,
            opened: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store configuration
    pub fn config(&self) -> &SecureStoreConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BridgeError::not_initialized(BACKEND))
        }
    }

    fn vault_key(&self, key: &str) -> Result<String> {
        if key.is_empty() {
            return Err(BridgeError::validation("empty keys are not allowed"));
        }
        Ok(self.config.vault_key(key))
    }

    async fn write_json(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.ensure_open()?;
        let vault_key = self.vault_key(key)?;
        self.vault
            .set_secret(&vault_key, &serde_json::to_string(value)?)
            .await
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let vault_key = self.vault_key(key)?;
        let existed = self.vault.get_secret(&vault_key).await?.is_some();
        self.vault.delete_secret(&vault_key).await?;
        Ok(existed)
    }

    async fn own_keys(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut keys: Vec<String> = self
            .vault
            .list_keys()
            .await?
            .iter()
            .filter_map(|vault_key| self.config.store_key(vault_key))
            .map(str::to_string)
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl Adapter for SecureStore {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::SecureKeyValue
    }

    async fn open(&self) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            return Ok(());
        }
        self.config.validate().map_err(|e| {
            BridgeError::initialization_with_source(BACKEND, "invalid namespace", e)
        })?;

        self.vault.list_keys().await.map_err(|e| {
            BridgeError::initialization_with_source(BACKEND, "secret vault is unavailable", e)
        })?;
        if !self.opened.swap(true, Ordering::AcqRel) {
            tracing::info!(namespace = %self.config.namespace, "secure store opened");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if self.opened.swap(false, Ordering::AcqRel) {
            tracing::info!(namespace = %self.config.namespace, "secure store closed");
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueAdapter for SecureStore {
    async fn write<V>(&self, key: &str, value: &V) -> Result<()>
    where
        V: Serialize + Sync,
    {
        self.write_json(key, &serde_json::to_value(value)?).await
    }

    async fn read<V>(&self, key: &str, default: V) -> Result<V>
    where
        V: DeserializeOwned + Send,
    {
        self.ensure_open()?;
        let vault_key = self.vault_key(key)?;
        match self.vault.get_secret(&vault_key).await? {
            Some(encoded) => Ok(serde_json::from_str(&encoded)?),
            None => Ok(default),
        }
    }

    /// Best-effort: entries before a failing one stay written
    async fn write_many<V>(&self, entries: &[(String, V)]) -> Result<()>
    where
        V: Serialize + Sync,
    {
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), serde_json::to_value(value)?)))
            .collect::<Result<Vec<_>>>()?;

        run_sequential(encoded, |(key, value)| async move {
            self.write_json(&key, &value).await.map(|_| Outcome::Done)
        })
        .await?;
        Ok(())
    }

    async fn read_all<V>(&self) -> Result<BTreeMap<String, V>>
    where
        V: DeserializeOwned + Send,
    {
        let mut all = BTreeMap::new();
        for key in self.own_keys().await? {
            if let Some(encoded) = self.vault.get_secret(&self.config.vault_key(&key)).await? {
                all.insert(key, serde_json::from_str(&encoded)?);
            }
        }
        Ok(all)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.remove(key).await?;
        Ok(())
    }

    /// Best-effort: keys before a failing one stay deleted
    async fn delete_many(&self, keys: &[String]) -> Result<()> {
        run_sequential(keys.to_vec(), |key| async move {
            self.remove(&key).await.map(Outcome::Flag)
        })
        .await?;
        Ok(())
    }

    /// Best-effort: on failure the keys removed so far stay removed
    async fn delete_all(&self) -> Result<u64> {
        let keys = self.own_keys().await?;
        let removed = run_sequential(keys, |key| async move {
            self.vault
                .delete_secret(&self.config.vault_key(&key))
                .await
                .map(|_| Outcome::Done)
        })
        .await?;
        Ok(removed.len() as u64)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let vault_key = self.vault_key(key)?;
        Ok(self.vault.get_secret(&vault_key).await?.is_some())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.own_keys().await?.len() as u64)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.own_keys().await
    }
}

#[async_trait]
impl SupportsBestEffortBatch for SecureStore {
    type Operation = KvOperation;

    async fn apply(&self, operation: KvOperation) -> Result<Outcome> {
        match operation {
            KvOperation::Write { key, value } => {
                self.write_json(&key, &value).await?;
                Ok(Outcome::Done)
            }
            KvOperation::Delete { key } => Ok(Outcome::Flag(self.remove(&key).await?)),
            KvOperation::Contains { key } => Ok(Outcome::Flag(self.contains(&key).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use crate::core::vault::MemoryVault;

    async fn open_store(namespace: &str, vault: Arc<dyn SecretVault>) -> SecureStore {
        let store = SecureStore::new(vault, SecureStoreConfig::namespace(namespace));
        store.open().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_roundtrip_and_default() {
        let store = open_store("app", Arc::new(MemoryVault::new())).await;
        store.write("pin", &1234).await.unwrap();
        assert_eq!(store.read("pin", 0).await.unwrap(), 1234);
        assert_eq!(store.read("missing", -1).await.unwrap(), -1);

        store.delete("pin").await.unwrap();
        store.delete("pin").await.unwrap();
        assert!(!store.contains("pin").await.unwrap());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let vault: Arc<dyn SecretVault> = Arc::new(MemoryVault::new());
        let app = open_store("app", Arc::clone(&vault)).await;
        let other = open_store("other", Arc::clone(&vault)).await;

        app.write_many(&[("a".to_string(), "1"), ("b".to_string(), "2")])
            .await
            .unwrap();
        other.write("a", &"x").await.unwrap();

        assert_eq!(app.keys().await.unwrap(), vec!["a", "b"]);
        assert_eq!(other.count().await.unwrap(), 1);

        let all: BTreeMap<String, String> = app.read_all().await.unwrap();
        assert_eq!(all["b"], "2");

        assert_eq!(app.delete_all().await.unwrap(), 2);
        assert_eq!(other.read("a", String::new()).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_write_many_is_best_effort() {
        let store = open_store("app", Arc::new(MemoryVault::new())).await;
        let entries = vec![
            ("first".to_string(), 1),
            (String::new(), 2),
            ("third".to_string(), 3),
        ];

        let err = store.write_many(&entries).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Batch);
        assert!(store.contains("first").await.unwrap());
        assert!(!store.contains("third").await.unwrap());
    }

    #[tokio::test]
    async fn test_dotted_namespace_is_rejected() {
        let vault: Arc<dyn SecretVault> = Arc::new(MemoryVault::new());
        let app = open_store("app", Arc::clone(&vault)).await;

        let nested = SecureStore::new(Arc::clone(&vault), SecureStoreConfig::namespace("app.cache"));
        let err = nested.open().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert!(!nested.is_open());

        let cache = open_store("app_cache", Arc::clone(&vault)).await;
        cache.write("token", &"t").await.unwrap();
        assert_eq!(app.delete_all().await.unwrap(), 0);
        assert!(cache.contains("token").await.unwrap());
    }

    /// Vault whose deletes fail for one key
    struct FailingDeleteVault {
        inner: MemoryVault,
        broken: String,
    }

    #[async_trait]
    impl SecretVault for FailingDeleteVault {
        async fn get_secret(&self, key: &str) -> Result<Option<String>> {
            self.inner.get_secret(key).await
        }

        async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
            self.inner.set_secret(key, value).await
        }

        async fn delete_secret(&self, key: &str) -> Result<()> {
            if key == self.broken {
                return Err(BridgeError::native(
                    "test-vault",
                    std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"),
                ));
            }
            self.inner.delete_secret(key).await
        }

        async fn list_keys(&self) -> Result<Vec<String>> {
            self.inner.list_keys().await
        }
    }

    #[tokio::test]
    async fn test_delete_all_reports_removed_prefix() {
        let vault = Arc::new(FailingDeleteVault {
            inner: MemoryVault::new(),
            broken: "app.b".to_string(),
        });
        let store = open_store("app", vault).await;
        for key in ["a", "b", "c"] {
            store.write(key, &1).await.unwrap();
        }

        match store.delete_all().await.unwrap_err() {
            BridgeError::BatchAborted { index, completed, .. } => {
                assert_eq!(index, 1);
                assert_eq!(completed.len(), 1);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(store.keys().await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_closed_store_fails() {
        let store = open_store("app", Arc::new(MemoryVault::new())).await;
        store.close().await.unwrap();
        store.close().await.unwrap();

        let err = store.read("pin", 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }
}
