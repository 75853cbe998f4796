//! Secret vault collaborator interface
//!
//! The platform credential vault is outside this crate. The bridge consumes it through
//! [`SecretVault`]; [`MemoryVault`] is an in-process implementation for tests and for
//! hosts without a native vault.

use super::error::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Narrow interface over a secure credential store
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Read a secret; `None` when absent
    async fn get_secret(&self, key: &str) -> Result<Option<String>>;

    /// Store or replace a secret
    async fn set_secret(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a secret; removing an absent key succeeds
    async fn delete_secret(&self, key: &str) -> Result<()>;

    /// Keys of every stored secret
    async fn list_keys(&self) -> Result<Vec<String>>;
}

/// Vault kept in process memory
#[derive(Debug, Default)]
pub struct MemoryVault {
    secrets: RwLock<BTreeMap<String, String>>,
}

impl MemoryVault {
    /// Create an empty vault
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretVault for MemoryVault {
    async fn get_secret(&self, key: &str) -> Result<Option<String>> {
        Ok(self.secrets.read().get(key).cloned())
    }

    async fn set_secret(&self, key: &str, value: &str) -> Result<()> {
        self.secrets
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_secret(&self, key: &str) -> Result<()> {
        self.secrets.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.secrets.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_vault_roundtrip() {
        let vault = MemoryVault::new();
        assert_eq!(vault.get_secret("token").await.unwrap(), None);

        vault.set_secret("token", "abc").await.unwrap();
        assert_eq!(vault.get_secret("token").await.unwrap().as_deref(), Some("abc"));
        assert_eq!(vault.list_keys().await.unwrap(), vec!["token".to_string()]);

        vault.delete_secret("token").await.unwrap();
        vault.delete_secret("token").await.unwrap();
        assert!(vault.list_keys().await.unwrap().is_empty());
    }
}
