//! Encryption at rest and key management
//!
//! Values written to an encrypted key-value box or a file vault are sealed with
//! AES-256-GCM. Sealed output is `nonce (12 bytes) || ciphertext || tag (16 bytes)`, and
//! the entry's key is bound in as associated data so a ciphertext cannot be moved to a
//! different key unnoticed.
//!
//! Key material only ever lives in memory (zeroized on drop) or inside a [`SecretVault`];
//! [`KeyManager`] never writes it anywhere else.

use super::error::{BridgeError, Result};
use super::vault::SecretVault;
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::Mutex;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Encryption key for AES-256-GCM.
///
/// The key is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random encryption key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns a crypto error if the slice is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(BridgeError::crypto(format!(
                "invalid key size: expected {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }

        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Returns the key as a byte slice. Do not log or persist the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    fn from_base64(encoded: &str) -> Result<Self> {
        let mut decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| BridgeError::crypto(format!("key material is not base64: {}", e)))?;
        let key = Self::from_bytes(&decoded);
        decoded.zeroize();
        key
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-256-GCM sealing bound to an entry key
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl Cipher {
    /// Creates a cipher for the given key.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let key_array = GenericArray::from_slice(key.as_bytes());
        Self {
            cipher: Aes256Gcm::new(key_array),
        }
    }

    /// Seal `plaintext`, authenticating `aad` alongside it.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| BridgeError::crypto("encryption error"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    /// Open data produced by [`seal`](Self::seal) with the same `aad`.
    ///
    /// # Errors
    ///
    /// Returns a crypto error on a wrong key, wrong `aad` or corrupted input.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(BridgeError::crypto("ciphertext too short"));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[NONCE_SIZE..],
                    aad,
                },
            )
            .map_err(|_| BridgeError::crypto("decryption error"))
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").field("cipher", &"Aes256Gcm").finish()
    }
}

/// Loads and creates encryption keys kept in a secret vault
pub struct KeyManager {
    vault: Arc<dyn SecretVault>,
    lock: Mutex<()>,
}

impl KeyManager {
    /// Create a key manager over a vault
    pub fn new(vault: Arc<dyn SecretVault>) -> Self {
        Self {
            vault,
            lock: Mutex::new(()),
        }
    }

    /// Generate a fresh random key
    #[must_use]
    pub fn generate_key() -> EncryptionKey {
        EncryptionKey::generate()
    }

    /// Load the key stored under `name`, creating and storing one if absent
    ///
    /// Concurrent first-time calls agree on a single key.
    ///
    /// # Errors
    ///
    /// Returns `Initialization` if the stored material is not a valid key, or the vault's
    /// error if it cannot be read or written.
    pub async fn load_or_create_key(&self, name: &str) -> Result<EncryptionKey> {
        let _guard = self.lock.lock().await;

        if let Some(encoded) = self.vault.get_secret(name).await? {
            return EncryptionKey::from_base64(&encoded).map_err(|e| {
                BridgeError::initialization_with_source(
                    "key-manager",
                    format!("stored key '{}' is invalid", name),
                    e,
                )
            });
        }

        let key = Self::generate_key();
        self.vault.set_secret(name, &key.to_base64()).await?;
        tracing::info!(name, "generated new encryption key");
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::vault::MemoryVault;
    use crate::core::ErrorKind;

    #[test]
    fn test_generate_key() {
        let key1 = EncryptionKey::generate();
        let key2 = EncryptionKey::generate();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_key_wrong_size() {
        assert!(EncryptionKey::from_bytes(&[0u8; 16]).is_err());
        assert!(EncryptionKey::from_bytes(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = EncryptionKey::from_bytes(&[7u8; KEY_SIZE]).unwrap();
        assert!(format!("{:?}", key).contains("REDACTED"));
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = Cipher::new(&EncryptionKey::generate());
        let sealed = cipher.seal(b"hello", b"greeting").unwrap();
        assert_ne!(&sealed[NONCE_SIZE..], b"hello");
        assert_eq!(cipher.open(&sealed, b"greeting").unwrap(), b"hello");
    }

    #[test]
    fn test_open_rejects_wrong_aad_and_wrong_key() {
        let cipher = Cipher::new(&EncryptionKey::generate());
        let sealed = cipher.seal(b"secret", b"a").unwrap();
        assert!(cipher.open(&sealed, b"b").is_err());

        let other = Cipher::new(&EncryptionKey::generate());
        assert!(other.open(&sealed, b"a").is_err());

        assert!(cipher.open(&[0u8; 10], b"a").is_err());
    }

    #[tokio::test]
    async fn test_load_or_create_key_is_stable() {
        let vault: Arc<dyn SecretVault> = Arc::new(MemoryVault::new());
        let manager = KeyManager::new(Arc::clone(&vault));

        let first = manager.load_or_create_key("box-key").await.unwrap();
        let second = manager.load_or_create_key("box-key").await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());

        let stored = vault.get_secret("box-key").await.unwrap().unwrap();
        assert_eq!(EncryptionKey::from_base64(&stored).unwrap().as_bytes(), first.as_bytes());
    }

    #[tokio::test]
    async fn test_concurrent_first_load_agrees() {
        let vault: Arc<dyn SecretVault> = Arc::new(MemoryVault::new());
        let manager = Arc::new(KeyManager::new(vault));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.load_or_create_key("shared").await })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap());
        }
        assert!(keys.windows(2).all(|w| w[0].as_bytes() == w[1].as_bytes()));
    }

    #[tokio::test]
    async fn test_corrupt_stored_key_is_initialization_error() {
        let vault: Arc<dyn SecretVault> = Arc::new(MemoryVault::new());
        vault.set_secret("bad", "not-a-key").await.unwrap();

        let manager = KeyManager::new(vault);
        let err = manager.load_or_create_key("bad").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Initialization);
        assert!(err.cause().is_some());
    }
}
