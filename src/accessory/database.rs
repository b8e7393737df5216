//! The accessory tree and its JSON projection

use super::catalog;
use super::characteristic::{projection, Characteristic};
use super::service::Service;
use serde_json::json;
use sha2::{Digest, Sha384};
use thiserror::Error;

/// Projection flags used for `/accessories` and for the config hash.
pub(crate) const FULL_PROJECTION: u8 =
    projection::META | projection::PERMS | projection::TYPE | projection::DESC;

/// Configuration errors detected while validating the database.
///
/// All of them are collected and reported together; any one aborts boot.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The database holds no accessories
    #[error("database contains no accessories")]
    NoAccessories,

    /// The first accessory must have aid 1
    #[error("first accessory has aid {0}, expected 1")]
    FirstAidNotOne(u32),

    /// Two accessories share an aid
    #[error("duplicate accessory id {0}")]
    DuplicateAid(u32),

    /// Every accessory needs an AccessoryInformation service
    #[error("accessory {0} has no AccessoryInformation service")]
    MissingInformationService(u32),

    /// AccessoryInformation must be declared first (iid 1)
    #[error("accessory {0}: AccessoryInformation service must have iid 1")]
    InformationServiceNotFirst(u32),

    /// The first accessory of a device needs HAPProtocolInformation
    #[error("accessory {0} has no HAPProtocolInformation service")]
    MissingProtocolService(u32),

    /// A characteristic type outside the service's allowed set
    #[error("accessory {aid}, service {service}: characteristic type {hap_type} not supported")]
    CharacteristicNotAllowed {
        /// Owning accessory
        aid: u32,
        /// Service type name
        service: &'static str,
        /// Offending characteristic type
        hap_type: String,
    },

    /// Two characteristics of one service share a type
    #[error("accessory {aid}, service {service}: duplicate characteristic type {hap_type}")]
    DuplicateCharacteristic {
        /// Owning accessory
        aid: u32,
        /// Service type name
        service: &'static str,
        /// Duplicated characteristic type
        hap_type: String,
    },
}

/// One accessory: an ordered list of services with a shared IID counter.
pub struct Accessory {
    pub(crate) aid: u32,
    iid_count: u32,
    pub(crate) services: Vec<Service>,
}

impl Accessory {
    /// Create an accessory; its aid is assigned when it joins a database
    /// (declaration order, starting at 1).
    #[must_use]
    pub fn new() -> Self {
        Self {
            aid: 0,
            iid_count: 0,
            services: Vec::new(),
        }
    }

    /// Create an accessory with an explicit aid.
    #[must_use]
    pub fn with_aid(aid: u32) -> Self {
        Self {
            aid,
            iid_count: 0,
            services: Vec::new(),
        }
    }

    /// Append a service, assigning its iid and its characteristics' iids.
    pub fn add_service(&mut self, mut service: Service) -> &mut Self {
        self.iid_count += 1;
        service.iid = self.iid_count;
        for characteristic in &mut service.characteristics {
            self.iid_count += 1;
            characteristic.iid = self.iid_count;
        }
        self.services.push(service);
        self
    }

    /// Accessory ID.
    #[must_use]
    pub fn aid(&self) -> u32 {
        self.aid
    }

    /// Services in declaration order.
    #[must_use]
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    fn to_json(&self, slot: usize, flags: u8) -> serde_json::Value {
        let services: Vec<serde_json::Value> = self
            .services
            .iter()
            .map(|s| s.to_json(self.aid, slot, flags))
            .collect();
        json!({ "aid": self.aid, "services": services })
    }
}

impl Default for Accessory {
    fn default() -> Self {
        Self::new()
    }
}

/// The attribute database: every accessory the device exposes.
pub struct Database {
    accessories: Vec<Accessory>,
}

impl Database {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self {
            accessories: Vec::new(),
        }
    }

    /// Append an accessory, assigning the next aid unless one was set.
    pub fn add_accessory(&mut self, mut accessory: Accessory) -> &mut Self {
        if accessory.aid == 0 {
            let next = self.accessories.iter().map(|a| a.aid).max().unwrap_or(0) + 1;
            accessory.aid = next;
        }
        self.accessories.push(accessory);
        self
    }

    /// Accessories in declaration order.
    #[must_use]
    pub fn accessories(&self) -> &[Accessory] {
        &self.accessories
    }

    /// Whether the device is a bridge: the first accessory carries only
    /// AccessoryInformation and HAPProtocolInformation.
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.accessories.first().is_some_and(|first| {
            first.services.iter().all(|s| {
                let id = s.service_type().id;
                id == catalog::ACCESSORY_INFORMATION.id || id == catalog::PROTOCOL_INFORMATION.id
            })
        })
    }

    /// Validate the tree, collecting every violation.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.accessories.is_empty() {
            errors.push(ConfigError::NoAccessories);
            return errors;
        }

        let first_aid = self.accessories[0].aid;
        if first_aid != 1 {
            errors.push(ConfigError::FirstAidNotOne(first_aid));
        }

        let mut seen_aids = Vec::new();
        let is_bridge = self.is_bridge();

        for accessory in &self.accessories {
            if seen_aids.contains(&accessory.aid) {
                errors.push(ConfigError::DuplicateAid(accessory.aid));
            }
            seen_aids.push(accessory.aid);

            match accessory
                .services
                .iter()
                .find(|s| s.service_type().id == catalog::ACCESSORY_INFORMATION.id)
            {
                None => errors.push(ConfigError::MissingInformationService(accessory.aid)),
                Some(info) if info.iid != 1 => {
                    errors.push(ConfigError::InformationServiceNotFirst(accessory.aid));
                }
                Some(_) => {}
            }

            let needs_protocol = accessory.aid == 1 || !is_bridge;
            if needs_protocol
                && !accessory
                    .services
                    .iter()
                    .any(|s| s.service_type().id == catalog::PROTOCOL_INFORMATION.id)
            {
                errors.push(ConfigError::MissingProtocolService(accessory.aid));
            }

            for service in &accessory.services {
                let st = service.service_type();
                let mut seen_types: Vec<&str> = Vec::new();
                for characteristic in service.characteristics() {
                    let hap_type = characteristic.hap_type();
                    if !st.required.contains(&hap_type) && !st.optional.contains(&hap_type) {
                        errors.push(ConfigError::CharacteristicNotAllowed {
                            aid: accessory.aid,
                            service: st.name,
                            hap_type: hap_type.to_string(),
                        });
                    }
                    if seen_types.contains(&hap_type) {
                        errors.push(ConfigError::DuplicateCharacteristic {
                            aid: accessory.aid,
                            service: st.name,
                            hap_type: hap_type.to_string(),
                        });
                    }
                    seen_types.push(hap_type);
                }
            }
        }

        errors
    }

    /// Size every characteristic's subscription array for `slots`
    /// connections. Called once before serving.
    pub(crate) fn prepare(&mut self, slots: usize) {
        for accessory in &mut self.accessories {
            for service in &mut accessory.services {
                for characteristic in &mut service.characteristics {
                    characteristic.ev = vec![false; slots];
                }
            }
        }
    }

    /// Locate a characteristic by `(aid, iid)`. Linear scan; the tree is
    /// small.
    #[must_use]
    pub fn find(&self, aid: u32, iid: u32) -> Option<&Characteristic> {
        self.accessories
            .iter()
            .find(|a| a.aid == aid)?
            .services
            .iter()
            .flat_map(|s| s.characteristics())
            .find(|c| c.iid == iid)
    }

    pub(crate) fn find_mut(&mut self, aid: u32, iid: u32) -> Option<&mut Characteristic> {
        self.accessories
            .iter_mut()
            .find(|a| a.aid == aid)?
            .services
            .iter_mut()
            .flat_map(|s| s.characteristics.iter_mut())
            .find(|c| c.iid == iid)
    }

    /// Locate the service owning `(aid, iid)`, as indices into the tree.
    pub(crate) fn find_service_of(&self, aid: u32, iid: u32) -> Option<(usize, usize)> {
        let (acc_index, accessory) = self
            .accessories
            .iter()
            .enumerate()
            .find(|(_, a)| a.aid == aid)?;
        let svc_index = accessory
            .services
            .iter()
            .position(|s| s.characteristics().iter().any(|c| c.iid == iid))?;
        Some((acc_index, svc_index))
    }

    pub(crate) fn accessory_mut(&mut self, index: usize) -> &mut Accessory {
        &mut self.accessories[index]
    }

    /// Project the whole tree to JSON.
    #[must_use]
    pub fn to_json(&self, slot: usize, flags: u8) -> serde_json::Value {
        let accessories: Vec<serde_json::Value> = self
            .accessories
            .iter()
            .map(|a| a.to_json(slot, flags))
            .collect();
        json!({ "accessories": accessories })
    }

    /// Serialize the full tree the way `/accessories` returns it.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        self.to_json(0, FULL_PROJECTION).to_string().into_bytes()
    }

    /// SHA-384 over the canonical serialization; a changed hash bumps the
    /// advertised configuration number.
    #[must_use]
    pub fn config_hash(&self) -> [u8; 48] {
        let digest = Sha384::digest(self.serialize());
        let mut hash = [0u8; 48];
        hash.copy_from_slice(&digest);
        hash
    }

    /// Clear every subscription flag held by a connection slot.
    pub(crate) fn clear_notify(&mut self, slot: usize) {
        for accessory in &mut self.accessories {
            for service in &mut accessory.services {
                for characteristic in &mut service.characteristics {
                    if let Some(entry) = characteristic.ev.get_mut(slot) {
                        *entry = false;
                    }
                }
            }
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}
