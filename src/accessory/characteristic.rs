//! Characteristics: typed values with permissions and subscriptions

use super::value::{Format, Range, Value};
use serde_json::json;

/// Permission bit flags (HAP Table 6-4)
pub mod perms {
    /// Paired read
    pub const PR: u8 = 1;
    /// Paired write
    pub const PW: u8 = 2;
    /// Event notification
    pub const EV: u8 = 4;
    /// Additional authorization
    pub const AA: u8 = 8;
    /// Timed write required
    pub const TW: u8 = 16;
    /// Hidden from users
    pub const HD: u8 = 32;
    /// Write response
    pub const WR: u8 = 64;
    /// Value omitted from notifications and plain reads
    pub const NV: u8 = 128;
}

/// Projection flag bits controlling which fields serialize
pub mod projection {
    /// Include `aid`
    pub const AID: u8 = 1;
    /// Include `format` and range metadata
    pub const META: u8 = 2;
    /// Include `perms`
    pub const PERMS: u8 = 4;
    /// Include `type`
    pub const TYPE: u8 = 8;
    /// Include the per-connection `ev` flag
    pub const EV: u8 = 16;
    /// Include `description`
    pub const DESC: u8 = 32;
    /// Project the real value even when the NV permission is set
    pub const NV: u8 = 64;
}

/// Per-object HAP status codes (HAP Table 6-11)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapStatus {
    /// Success
    Ok,
    /// Request aborted before the service update ran
    Tbd,
    /// Insufficient privileges
    InsufficientPrivileges,
    /// The service update callback refused the write
    Unable,
    /// Write to a characteristic without PW
    ReadOnly,
    /// Read of a characteristic without PR
    WriteOnly,
    /// Notification not supported
    NotifyNotAllowed,
    /// No characteristic with the requested aid/iid
    UnknownResource,
    /// Malformed value, or a timed write that expired
    InvalidValue,
}

impl HapStatus {
    /// Numeric code used in response bodies.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            HapStatus::Ok | HapStatus::Tbd => 0,
            HapStatus::InsufficientPrivileges => -70_401,
            HapStatus::Unable => -70_402,
            HapStatus::ReadOnly => -70_404,
            HapStatus::WriteOnly => -70_405,
            HapStatus::NotifyNotAllowed => -70_406,
            HapStatus::UnknownResource => -70_409,
            HapStatus::InvalidValue => -70_410,
        }
    }
}

/// A typed value owned by a service.
pub struct Characteristic {
    pub(crate) iid: u32,
    hap_type: String,
    perms: u8,
    value: Value,
    new_value: Value,
    range: Option<Range>,
    description: Option<String>,
    update_time_ms: u64,
    is_updated: bool,
    pub(crate) ev: Vec<bool>,
}

impl Characteristic {
    /// Create a characteristic with an initial value.
    #[must_use]
    pub fn new(hap_type: impl Into<String>, perms: u8, value: Value) -> Self {
        Self {
            iid: 0,
            hap_type: hap_type.into(),
            perms,
            new_value: value.clone(),
            value,
            range: None,
            description: None,
            update_time_ms: 0,
            is_updated: false,
            ev: Vec::new(),
        }
    }

    /// Attach min/max/step metadata.
    #[must_use]
    pub fn with_range(mut self, min: i32, max: i32, step: i32) -> Self {
        self.range = Some(Range { min, max, step });
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Instance ID inside the owning accessory.
    #[must_use]
    pub fn iid(&self) -> u32 {
        self.iid
    }

    /// HAP type (short-form UUID).
    #[must_use]
    pub fn hap_type(&self) -> &str {
        &self.hap_type
    }

    /// Permission bitmask.
    #[must_use]
    pub fn perms(&self) -> u8 {
        self.perms
    }

    /// Current committed value.
    #[must_use]
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// The staged value from an uncommitted write, if any.
    #[must_use]
    pub fn staged_value(&self) -> &Value {
        &self.new_value
    }

    /// Whether a write has been staged and not yet committed.
    #[must_use]
    pub fn is_updated(&self) -> bool {
        self.is_updated
    }

    /// Milliseconds since the last committed change.
    #[must_use]
    pub fn time_since_update(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.update_time_ms)
    }

    /// Overwrite the value from the application side (`setVal`).
    ///
    /// Returns false if the new value's format does not match.
    pub fn set_value(&mut self, value: Value, now_ms: u64) -> bool {
        if value.format() != self.value.format() {
            return false;
        }
        self.value = value.clone();
        self.new_value = value;
        self.update_time_ms = now_ms;
        true
    }

    /// Stage a controller write and/or subscription change.
    ///
    /// Performs format parsing and permission checks; a successful value
    /// stage leaves the characteristic `Tbd` until the owning service's
    /// update callback decides commit or rollback.
    pub fn load_update(
        &mut self,
        value: Option<&serde_json::Value>,
        ev: Option<&serde_json::Value>,
        slot: usize,
        now_ms: u64,
    ) -> HapStatus {
        if let Some(ev_json) = ev {
            let Some(Value::Bool(flag)) = Value::parse(Format::Bool, ev_json) else {
                return HapStatus::InvalidValue;
            };
            if flag && self.perms & perms::EV == 0 {
                return HapStatus::NotifyNotAllowed;
            }
            if let Some(entry) = self.ev.get_mut(slot) {
                *entry = flag;
            }
        }

        let Some(value_json) = value else {
            return HapStatus::Ok;
        };

        if self.perms & perms::PW == 0 {
            return HapStatus::ReadOnly;
        }

        let Some(parsed) = Value::parse(self.value.format(), value_json) else {
            return HapStatus::InvalidValue;
        };

        self.new_value = parsed;
        self.is_updated = true;
        self.update_time_ms = now_ms;
        HapStatus::Tbd
    }

    /// Commit or roll back a staged write.
    pub(crate) fn finish_update(&mut self, commit: bool) {
        if commit {
            self.value = self.new_value.clone();
        } else {
            self.new_value = self.value.clone();
        }
        self.is_updated = false;
    }

    /// Whether the connection in `slot` subscribed to change events.
    #[must_use]
    pub fn subscribed(&self, slot: usize) -> bool {
        self.ev.get(slot).copied().unwrap_or(false)
    }

    /// Project to JSON under the given flags.
    #[must_use]
    pub fn to_json(&self, aid: u32, slot: usize, flags: u8) -> serde_json::Value {
        let mut object = serde_json::Map::new();

        if flags & projection::AID != 0 {
            object.insert("aid".into(), json!(aid));
        }
        object.insert("iid".into(), json!(self.iid));

        if flags & projection::TYPE != 0 {
            object.insert("type".into(), json!(self.hap_type));
        }

        if self.perms & perms::PR != 0 {
            if self.perms & perms::NV != 0 && flags & projection::NV == 0 {
                object.insert("value".into(), serde_json::Value::Null);
            } else {
                object.insert("value".into(), self.value.to_json());
            }
        }

        if flags & projection::META != 0 {
            object.insert("format".into(), json!(self.value.format().as_str()));
            if let Some(range) = self.range {
                object.insert("minValue".into(), json!(range.min));
                object.insert("maxValue".into(), json!(range.max));
                object.insert("minStep".into(), json!(range.step));
            }
        }

        if flags & projection::DESC != 0 {
            if let Some(description) = &self.description {
                object.insert("description".into(), json!(description));
            }
        }

        if flags & projection::PERMS != 0 {
            const CODES: [(u8, &str); 7] = [
                (perms::PR, "pr"),
                (perms::PW, "pw"),
                (perms::EV, "ev"),
                (perms::AA, "aa"),
                (perms::TW, "tw"),
                (perms::HD, "hd"),
                (perms::WR, "wr"),
            ];
            let listed: Vec<&str> = CODES
                .iter()
                .filter(|(bit, _)| self.perms & bit != 0)
                .map(|(_, code)| *code)
                .collect();
            object.insert("perms".into(), json!(listed));
        }

        if flags & projection::EV != 0 {
            object.insert("ev".into(), json!(self.subscribed(slot)));
        }

        serde_json::Value::Object(object)
    }
}
