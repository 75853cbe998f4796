//! Secret vault backed by one encrypted JSON file
//!
//! Each secret is sealed with AES-256-GCM under the vault key, using its own name as
//! associated data, and stored base64-encoded. The file is rewritten through a temporary
//! sibling and an atomic rename, so a crash leaves either the old or the new file.

use crate::core::crypto::{Cipher, EncryptionKey};
use crate::core::error::{BridgeError, Result};
use crate::core::vault::SecretVault;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

const BACKEND: &str = "file-vault";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    entries: BTreeMap<String, String>,
}

/// Secret vault persisted in a single sealed file
pub struct FileVault {
    path: PathBuf,
    cipher: Cipher,
    entries: Mutex<Option<BTreeMap<String, String>>>,
}

impl FileVault {
    /// Vault at `path`, sealed with `key`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>, key: &EncryptionKey) -> Self {
        Self {
            path: path.into(),
            cipher: Cipher::new(key),
            entries: Mutex::new(None),
        }
    }

    /// Location of the vault file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let file: VaultFile = serde_json::from_slice(&bytes).map_err(|e| {
            BridgeError::initialization_with_source(BACKEND, "vault file is not valid JSON", e)
        })?;
        if file.version != FORMAT_VERSION {
            return Err(BridgeError::initialization(
                BACKEND,
                format!("unsupported vault file version {}", file.version),
            ));
        }
        tracing::debug!(path = %self.path.display(), entries = file.entries.len(), "vault loaded");
        Ok(file.entries)
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let file = VaultFile {
            version: FORMAT_VERSION,
            entries: entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("tmp");
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    async fn loaded(&self) -> Result<MutexGuard<'_, Option<BTreeMap<String, String>>>> {
        let mut guard = self.entries.lock().await;
        if guard.is_none() {
            *guard = Some(self.load().await?);
        }
        Ok(guard)
    }

    /// Read the loaded entries while holding the vault lock
    async fn read_entries<R>(&self, f: impl FnOnce(&BTreeMap<String, String>) -> R) -> Result<R> {
        let guard = self.loaded().await?;
        let entries = guard
            .as_ref()
            .ok_or_else(|| BridgeError::initialization(BACKEND, "vault not loaded"))?;
        Ok(f(entries))
    }

    /// Apply `f` to a copy of the entries and persist it when `f` reports a change
    ///
    /// The in-memory entries are only replaced once the file has been written.
    async fn update_entries(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> bool,
    ) -> Result<()> {
        let mut guard = self.loaded().await?;
        let entries = guard
            .as_mut()
            .ok_or_else(|| BridgeError::initialization(BACKEND, "vault not loaded"))?;

        let mut updated = entries.clone();
        if f(&mut updated) {
            self.persist(&updated).await?;
            *entries = updated;
        }
        Ok(())
    }
}

#[async_trait]
impl SecretVault for FileVault {
    async fn get_secret(&self, key: &str) -> Result<Option<String>> {
        let sealed = self.read_entries(|entries| entries.get(key).cloned()).await?;
        let Some(sealed) = sealed else {
            return Ok(None);
        };

        let bytes = STANDARD
            .decode(sealed.as_bytes())
            .map_err(|e| BridgeError::crypto(format!("malformed secret '{}': {}", key, e)))?;
        let plain = self.cipher.open(&bytes, key.as_bytes())?;
        String::from_utf8(plain)
            .map(Some)
            .map_err(|_| BridgeError::crypto(format!("secret '{}' is not UTF-8", key)))
    }

    async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        let sealed = STANDARD.encode(self.cipher.seal(value.as_bytes(), key.as_bytes())?);
        self.update_entries(|entries| {
            entries.insert(key.to_string(), sealed);
            true
        })
        .await
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        self.update_entries(|entries| entries.remove(key).is_some())
            .await
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        self.read_entries(|entries| entries.keys().cloned().collect())
            .await
    }
}

impl std::fmt::Debug for FileVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileVault").field("path", &self.path).finish()
    }
}
