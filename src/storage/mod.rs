//! Persistent blob store and the records the accessory keeps in it

mod identity;

pub use identity::{
    format_device_id, provision_setup_code, validate_setup_code, AccessoryIdentity,
    ControllerRecord, ControllerTable, IdentityError, ProvisionError, SetupCodeError,
    SetupVerifier, WifiCredentials, CONTROLLER_CAPACITY,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Well-known store keys
pub mod keys {
    /// Device ID and long-term key pair
    pub const ACCESSORY: &str = "ACCESSORY";
    /// Paired-controller table
    pub const CONTROLLERS: &str = "CONTROLLERS";
    /// SRP salt and verifier from provisioning
    pub const VERIFYDATA: &str = "VERIFYDATA";
    /// Wi-Fi credentials
    pub const WIFIDATA: &str = "WIFIDATA";
    /// Config number and database hash
    pub const HAPHASH: &str = "HAPHASH";
}

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored record failed to serialize or deserialize
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persistent blob store keyed by short strings.
///
/// Writes are staged with [`set_blob`](Store::set_blob) and made durable by
/// [`commit`](Store::commit); the server commits before answering any
/// request that changed persistent state.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a blob, or `None` if the key has never been written.
    async fn get_blob(&self, key: &str) -> Option<Vec<u8>>;

    /// Stage a blob write.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be staged.
    async fn set_blob(&mut self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError>;

    /// Remove a blob.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    async fn remove_blob(&mut self, key: &str) -> Result<(), StorageError>;

    /// Make staged writes durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing medium rejects the write.
    async fn commit(&mut self) -> Result<(), StorageError>;
}

/// In-memory store, for tests and ephemeral accessories.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.get(key).cloned()
    }

    async fn set_blob(&mut self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.blobs.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove_blob(&mut self, key: &str) -> Result<(), StorageError> {
        self.blobs.remove(key);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// File-backed store: one JSON document holding every blob.
pub struct FileStore {
    path: PathBuf,
    cache: HashMap<String, Vec<u8>>,
}

impl FileStore {
    /// Open or create a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let cache = if tokio::fs::try_exists(&path).await? {
            let bytes = tokio::fs::read(&path).await?;
            if bytes.is_empty() {
                HashMap::new()
            } else {
                serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?
            }
        } else {
            HashMap::new()
        };

        Ok(Self { path, cache })
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_blob(&self, key: &str) -> Option<Vec<u8>> {
        self.cache.get(key).cloned()
    }

    async fn set_blob(&mut self, key: &str, bytes: Vec<u8>) -> Result<(), StorageError> {
        self.cache.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn remove_blob(&mut self, key: &str) -> Result<(), StorageError> {
        self.cache.remove(key);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&self.cache)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}
