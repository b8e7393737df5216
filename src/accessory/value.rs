//! Typed characteristic values

use serde::{Deserialize, Serialize};

/// Characteristic value formats (HAP Table 6-5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    /// Boolean
    Bool,
    /// Unsigned 8-bit integer
    Uint8,
    /// Unsigned 16-bit integer
    Uint16,
    /// Unsigned 32-bit integer
    Uint32,
    /// Unsigned 64-bit integer
    Uint64,
    /// Signed 32-bit integer
    Int,
    /// 64-bit float
    Float,
    /// UTF-8 string
    String,
}

impl Format {
    /// The format name used in JSON metadata.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Format::Bool => "bool",
            Format::Uint8 => "uint8",
            Format::Uint16 => "uint16",
            Format::Uint32 => "uint32",
            Format::Uint64 => "uint64",
            Format::Int => "int",
            Format::Float => "float",
            Format::String => "string",
        }
    }
}

/// A characteristic value, tagged by its format.
///
/// The sum type replaces the original's side-by-side format tag and
/// untagged union: a value cannot disagree with its format.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Unsigned 8-bit value
    Uint8(u8),
    /// Unsigned 16-bit value
    Uint16(u16),
    /// Unsigned 32-bit value
    Uint32(u32),
    /// Unsigned 64-bit value
    Uint64(u64),
    /// Signed 32-bit value
    Int(i32),
    /// Float value
    Float(f64),
    /// String value
    String(String),
}

impl Value {
    /// The format this value carries.
    #[must_use]
    pub fn format(&self) -> Format {
        match self {
            Value::Bool(_) => Format::Bool,
            Value::Uint8(_) => Format::Uint8,
            Value::Uint16(_) => Format::Uint16,
            Value::Uint32(_) => Format::Uint32,
            Value::Uint64(_) => Format::Uint64,
            Value::Int(_) => Format::Int,
            Value::Float(_) => Format::Float,
            Value::String(_) => Format::String,
        }
    }

    /// Project to a JSON value.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(v) => serde_json::Value::Bool(*v),
            Value::Uint8(v) => serde_json::json!(v),
            Value::Uint16(v) => serde_json::json!(v),
            Value::Uint32(v) => serde_json::json!(v),
            Value::Uint64(v) => serde_json::json!(v),
            Value::Int(v) => serde_json::json!(v),
            Value::Float(v) => serde_json::json!(v),
            Value::String(v) => serde_json::Value::String(v.clone()),
        }
    }

    /// Parse a controller-supplied JSON value against a format.
    ///
    /// Booleans additionally accept `0`/`1` numbers, matching what
    /// controllers actually send.
    ///
    /// Returns `None` when the JSON value does not fit the format; the
    /// caller maps this to the `InvalidValue` HAP status.
    #[must_use]
    pub fn parse(format: Format, json: &serde_json::Value) -> Option<Self> {
        match format {
            Format::Bool => match json {
                serde_json::Value::Bool(v) => Some(Value::Bool(*v)),
                serde_json::Value::Number(n) => match n.as_u64() {
                    Some(0) => Some(Value::Bool(false)),
                    Some(1) => Some(Value::Bool(true)),
                    _ => None,
                },
                _ => None,
            },
            Format::Uint8 => json
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .map(Value::Uint8),
            Format::Uint16 => json
                .as_u64()
                .and_then(|n| u16::try_from(n).ok())
                .map(Value::Uint16),
            Format::Uint32 => json
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Value::Uint32),
            Format::Uint64 => json.as_u64().map(Value::Uint64),
            Format::Int => json
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .map(Value::Int),
            Format::Float => json.as_f64().map(Value::Float),
            Format::String => json
                .as_str()
                .map(|s| Value::String(s.to_string())),
        }
    }
}

/// Metadata range for numeric characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    /// Minimum value
    pub min: i32,
    /// Maximum value
    pub max: i32,
    /// Step size
    pub step: i32,
}
