//! Accessory identity, paired controllers, and setup-code provisioning

use super::{keys, Store, StorageError};
use crate::protocol::crypto::{compute_srp_verifier, Ed25519KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed capacity of the paired-controller table.
pub const CONTROLLER_CAPACITY: usize = 16;

/// Errors loading or creating identity records
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persisted record did not parse
    #[error("corrupt {key} record: {reason}")]
    Corrupt {
        /// Store key of the bad record
        key: &'static str,
        /// Parse failure detail
        reason: String,
    },

    /// The controller table is full
    #[error("controller table is full")]
    TableFull,
}

/// Format a 6-byte value as the `XX:XX:XX:XX:XX:XX` device ID.
#[must_use]
pub fn format_device_id(bytes: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

#[derive(Serialize, Deserialize)]
struct IdentityRecord {
    device_id: String,
    ltsk: [u8; 32],
}

/// The accessory's long-term identity: device ID and Ed25519 key pair.
///
/// Generated on first boot and persisted under the `ACCESSORY` key; stable
/// for the life of the device, surviving unpairing.
pub struct AccessoryIdentity {
    device_id: String,
    signing_key: Ed25519KeyPair,
}

impl AccessoryIdentity {
    /// Load the identity, creating and persisting one on first boot.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or holds a corrupt record.
    pub async fn load_or_create(store: &mut dyn Store) -> Result<Self, IdentityError> {
        if let Some(bytes) = store.get_blob(keys::ACCESSORY).await {
            let record: IdentityRecord =
                serde_json::from_slice(&bytes).map_err(|e| IdentityError::Corrupt {
                    key: keys::ACCESSORY,
                    reason: e.to_string(),
                })?;
            let signing_key =
                Ed25519KeyPair::from_bytes(&record.ltsk).map_err(|e| IdentityError::Corrupt {
                    key: keys::ACCESSORY,
                    reason: e.to_string(),
                })?;
            return Ok(Self {
                device_id: record.device_id,
                signing_key,
            });
        }

        use rand::rngs::OsRng;
        use rand::RngCore;
        let mut id_bytes = [0u8; 6];
        OsRng.fill_bytes(&mut id_bytes);

        let identity = Self {
            device_id: format_device_id(&id_bytes),
            signing_key: Ed25519KeyPair::generate(),
        };

        let record = IdentityRecord {
            device_id: identity.device_id.clone(),
            ltsk: identity.signing_key.secret_bytes(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        store.set_blob(keys::ACCESSORY, bytes).await?;
        store.commit().await?;

        tracing::info!(device_id = %identity.device_id, "generated accessory identity");
        Ok(identity)
    }

    /// The `XX:XX:XX:XX:XX:XX` device ID.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The long-term signing key.
    #[must_use]
    pub fn signing_key(&self) -> &Ed25519KeyPair {
        &self.signing_key
    }
}

/// One enrolled controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerRecord {
    /// 36-byte UTF-8 pairing identifier
    pub pairing_id: Vec<u8>,
    /// Controller long-term Ed25519 public key
    pub ltpk: [u8; 32],
    /// Whether the controller may administer pairings
    pub admin: bool,
}

/// The paired-controller table, persisted as one blob.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ControllerTable {
    controllers: Vec<ControllerRecord>,
}

impl ControllerTable {
    /// Load the table, empty if never persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted record is corrupt.
    pub async fn load(store: &dyn Store) -> Result<Self, IdentityError> {
        match store.get_blob(keys::CONTROLLERS).await {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| IdentityError::Corrupt {
                key: keys::CONTROLLERS,
                reason: e.to_string(),
            }),
            None => Ok(Self::default()),
        }
    }

    /// Persist the table.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn save(&self, store: &mut dyn Store) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        store.set_blob(keys::CONTROLLERS, bytes).await?;
        store.commit().await
    }

    /// Add a controller, updating the record if the ID is already present.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::TableFull`] at capacity.
    pub fn add(&mut self, record: ControllerRecord) -> Result<(), IdentityError> {
        if let Some(existing) = self
            .controllers
            .iter_mut()
            .find(|c| c.pairing_id == record.pairing_id)
        {
            *existing = record;
            return Ok(());
        }
        if self.controllers.len() >= CONTROLLER_CAPACITY {
            return Err(IdentityError::TableFull);
        }
        self.controllers.push(record);
        Ok(())
    }

    /// Remove a controller by pairing ID.
    pub fn remove(&mut self, pairing_id: &[u8]) -> Option<ControllerRecord> {
        let index = self
            .controllers
            .iter()
            .position(|c| c.pairing_id == pairing_id)?;
        Some(self.controllers.remove(index))
    }

    /// Look up a controller by pairing ID.
    #[must_use]
    pub fn find(&self, pairing_id: &[u8]) -> Option<&ControllerRecord> {
        self.controllers.iter().find(|c| c.pairing_id == pairing_id)
    }

    /// Whether at least one admin controller is enrolled.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.controllers.iter().any(|c| c.admin)
    }

    /// All enrolled controllers.
    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, ControllerRecord> {
        self.controllers.iter()
    }

    /// Drop every controller (administrative unpair).
    pub fn clear(&mut self) {
        self.controllers.clear();
    }
}

/// Setup-code validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SetupCodeError {
    /// Not exactly eight decimal digits
    #[error("setup code must be 8 decimal digits")]
    Malformed,

    /// On the HAP list of forbidden trivial codes
    #[error("setup code is too easily guessed")]
    Trivial,
}

/// Validate an 8-digit setup code against the HAP rules.
///
/// # Errors
///
/// Returns an error for non-8-digit input and for the trivial codes
/// (`12345678`, `87654321`, and any single repeated digit).
pub fn validate_setup_code(code: &str) -> Result<(), SetupCodeError> {
    if code.len() != 8 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SetupCodeError::Malformed);
    }
    if code == "12345678" || code == "87654321" {
        return Err(SetupCodeError::Trivial);
    }
    if code.bytes().all(|b| b == code.as_bytes()[0]) {
        return Err(SetupCodeError::Trivial);
    }
    Ok(())
}

/// SRP salt and verifier cached at provisioning time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupVerifier {
    /// 16-byte SRP salt
    pub salt: [u8; 16],
    /// 384-byte SRP verifier for the 3072-bit group
    pub verifier: Vec<u8>,
}

impl SetupVerifier {
    /// Load the verifier, or `None` if the device was never provisioned.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted record is corrupt.
    pub async fn load(store: &dyn Store) -> Result<Option<Self>, IdentityError> {
        match store.get_blob(keys::VERIFYDATA).await {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| IdentityError::Corrupt {
                    key: keys::VERIFYDATA,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }
}

/// Provisioning failures
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The code failed validation
    #[error(transparent)]
    Code(#[from] SetupCodeError),

    /// Store failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Validate a setup code and cache its SRP salt and verifier in the store.
///
/// The code itself is never persisted.
///
/// # Errors
///
/// Returns an error for invalid codes or store failures.
pub async fn provision_setup_code(
    store: &mut dyn Store,
    code: &str,
) -> Result<(), ProvisionError> {
    validate_setup_code(code)?;

    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);

    let record = SetupVerifier {
        salt,
        verifier: compute_srp_verifier(code, &salt),
    };
    let bytes =
        serde_json::to_vec(&record).map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.set_blob(keys::VERIFYDATA, bytes).await?;
    store.commit().await?;
    Ok(())
}

/// Wi-Fi credentials held for the provisioning layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiCredentials {
    /// Network SSID
    pub ssid: String,
    /// Network passphrase
    pub password: String,
}

impl WifiCredentials {
    /// Load stored credentials, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the persisted record is corrupt.
    pub async fn load(store: &dyn Store) -> Result<Option<Self>, IdentityError> {
        match store.get_blob(keys::WIFIDATA).await {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| IdentityError::Corrupt {
                    key: keys::WIFIDATA,
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Persist credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub async fn save(&self, store: &mut dyn Store) -> Result<(), StorageError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| StorageError::Serialization(e.to_string()))?;
        store.set_blob(keys::WIFIDATA, bytes).await?;
        store.commit().await
    }
}
