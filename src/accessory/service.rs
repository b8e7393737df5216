//! Services: capability groups with application-supplied behavior

use super::characteristic::Characteristic;
use super::value::Value;
use serde_json::json;

/// Static service metadata: the HAP type plus the characteristic types it
/// may contain. Instances live in [`catalog`](super::catalog).
#[derive(Debug, Clone, Copy)]
pub struct ServiceType {
    /// Short-form HAP UUID, e.g. `"3E"`
    pub id: &'static str,
    /// Human-readable name for diagnostics
    pub name: &'static str,
    /// Characteristic types every instance must contain
    pub required: &'static [&'static str],
    /// Characteristic types an instance may contain
    pub optional: &'static [&'static str],
}

/// One staged characteristic write handed to a service update callback.
pub struct CharacteristicChange {
    /// Owning accessory ID
    pub aid: u32,
    /// Characteristic instance ID
    pub iid: u32,
    /// Characteristic HAP type
    pub hap_type: String,
    /// Committed value before this write
    pub current: Value,
    /// Staged value the controller asked for
    pub staged: Value,
}

/// Application behavior attached to a service.
///
/// `update` runs once per service per PUT, after every staged write in
/// that request has been validated; returning false rolls the whole
/// service's batch back. `poll` runs every event-loop tick and may push
/// value changes of its own.
pub trait ServiceHandler: Send {
    /// Apply a batch of staged writes to the underlying device.
    fn update(&mut self, changes: &[CharacteristicChange]) -> bool {
        let _ = changes;
        true
    }

    /// Produce server-side value changes, as `(characteristic type, value)`.
    fn poll(&mut self, now_ms: u64) -> Vec<(String, Value)> {
        let _ = now_ms;
        Vec::new()
    }
}

/// A capability group inside an accessory.
pub struct Service {
    pub(crate) iid: u32,
    service_type: ServiceType,
    primary: bool,
    hidden: bool,
    pub(crate) characteristics: Vec<Characteristic>,
    pub(crate) handler: Option<Box<dyn ServiceHandler>>,
}

impl Service {
    /// Create an empty service of the given type.
    #[must_use]
    pub fn new(service_type: ServiceType) -> Self {
        Self {
            iid: 0,
            service_type,
            primary: false,
            hidden: false,
            characteristics: Vec::new(),
            handler: None,
        }
    }

    /// Append a characteristic. IIDs are assigned when the service joins
    /// an accessory.
    #[must_use]
    pub fn with(mut self, characteristic: Characteristic) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Mark as the accessory's primary service.
    #[must_use]
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Hide from users.
    #[must_use]
    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Attach application behavior.
    #[must_use]
    pub fn with_handler(mut self, handler: Box<dyn ServiceHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Instance ID inside the owning accessory.
    #[must_use]
    pub fn iid(&self) -> u32 {
        self.iid
    }

    /// Static service metadata.
    #[must_use]
    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    /// Characteristics in declaration order.
    #[must_use]
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.characteristics
    }

    /// Find a characteristic by HAP type.
    #[must_use]
    pub fn characteristic(&self, hap_type: &str) -> Option<&Characteristic> {
        self.characteristics
            .iter()
            .find(|c| c.hap_type() == hap_type)
    }

    /// Project to JSON with the given per-characteristic flags.
    #[must_use]
    pub fn to_json(&self, aid: u32, slot: usize, flags: u8) -> serde_json::Value {
        let characteristics: Vec<serde_json::Value> = self
            .characteristics
            .iter()
            .map(|c| c.to_json(aid, slot, flags))
            .collect();

        let mut object = serde_json::Map::new();
        object.insert("iid".into(), json!(self.iid));
        object.insert("type".into(), json!(self.service_type.id));
        if self.primary {
            object.insert("primary".into(), json!(true));
        }
        if self.hidden {
            object.insert("hidden".into(), json!(true));
        }
        object.insert(
            "characteristics".into(),
            serde_json::Value::Array(characteristics),
        );
        serde_json::Value::Object(object)
    }
}
