//! Well-known HAP services and characteristics
//!
//! Short-form UUIDs per the HAP service and characteristic tables. The
//! set covers the service types this crate is commonly deployed with;
//! applications can declare further types with [`ServiceType`] values of
//! their own.

use super::characteristic::{perms, Characteristic};
use super::service::{Service, ServiceType};
use super::value::Value;

/// Accessory Information, required in every accessory
pub const ACCESSORY_INFORMATION: ServiceType = ServiceType {
    id: "3E",
    name: "AccessoryInformation",
    required: &["14", "20", "21", "23", "30", "52"],
    optional: &["53"],
};

/// HAP Protocol Information, required on the first accessory
pub const PROTOCOL_INFORMATION: ServiceType = ServiceType {
    id: "A2",
    name: "HAPProtocolInformation",
    required: &["37"],
    optional: &[],
};

/// Light bulb
pub const LIGHT_BULB: ServiceType = ServiceType {
    id: "43",
    name: "LightBulb",
    required: &["25"],
    optional: &["23", "8", "13", "2F"],
};

/// Switch
pub const SWITCH: ServiceType = ServiceType {
    id: "49",
    name: "Switch",
    required: &["25"],
    optional: &["23"],
};

/// Outlet
pub const OUTLET: ServiceType = ServiceType {
    id: "47",
    name: "Outlet",
    required: &["25", "26"],
    optional: &["23"],
};

/// Temperature sensor
pub const TEMPERATURE_SENSOR: ServiceType = ServiceType {
    id: "8A",
    name: "TemperatureSensor",
    required: &["11"],
    optional: &["23"],
};

/// Motion sensor
pub const MOTION_SENSOR: ServiceType = ServiceType {
    id: "85",
    name: "MotionSensor",
    required: &["22"],
    optional: &["23"],
};

/// Identify routine trigger (write-only)
#[must_use]
pub fn identify() -> Characteristic {
    Characteristic::new("14", perms::PW, Value::Bool(false))
}

/// Manufacturer name
#[must_use]
pub fn manufacturer(value: impl Into<String>) -> Characteristic {
    Characteristic::new("20", perms::PR, Value::String(value.into()))
}

/// Model name
#[must_use]
pub fn model(value: impl Into<String>) -> Characteristic {
    Characteristic::new("21", perms::PR, Value::String(value.into()))
}

/// Display name
#[must_use]
pub fn name(value: impl Into<String>) -> Characteristic {
    Characteristic::new("23", perms::PR, Value::String(value.into()))
}

/// Serial number
#[must_use]
pub fn serial_number(value: impl Into<String>) -> Characteristic {
    Characteristic::new("30", perms::PR, Value::String(value.into()))
}

/// Firmware revision
#[must_use]
pub fn firmware_revision(value: impl Into<String>) -> Characteristic {
    Characteristic::new("52", perms::PR, Value::String(value.into()))
}

/// HAP protocol version
#[must_use]
pub fn version() -> Characteristic {
    Characteristic::new("37", perms::PR, Value::String("1.1.0".into()))
}

/// On/Off state
#[must_use]
pub fn on(value: bool) -> Characteristic {
    Characteristic::new("25", perms::PR | perms::PW | perms::EV, Value::Bool(value))
}

/// Brightness percentage
#[must_use]
pub fn brightness(value: i32) -> Characteristic {
    Characteristic::new("8", perms::PR | perms::PW | perms::EV, Value::Int(value))
        .with_range(0, 100, 1)
}

/// Hue in degrees
#[must_use]
pub fn hue(value: f64) -> Characteristic {
    Characteristic::new("13", perms::PR | perms::PW | perms::EV, Value::Float(value))
        .with_range(0, 360, 1)
}

/// Saturation percentage
#[must_use]
pub fn saturation(value: f64) -> Characteristic {
    Characteristic::new("2F", perms::PR | perms::PW | perms::EV, Value::Float(value))
        .with_range(0, 100, 1)
}

/// Current temperature in Celsius
#[must_use]
pub fn current_temperature(value: f64) -> Characteristic {
    Characteristic::new("11", perms::PR | perms::EV, Value::Float(value)).with_range(0, 100, 1)
}

/// Motion detected flag
#[must_use]
pub fn motion_detected(value: bool) -> Characteristic {
    Characteristic::new("22", perms::PR | perms::EV, Value::Bool(value))
}

/// Outlet-in-use flag
#[must_use]
pub fn outlet_in_use(value: bool) -> Characteristic {
    Characteristic::new("26", perms::PR | perms::EV, Value::Bool(value))
}

/// A fully populated Accessory Information service.
#[must_use]
pub fn accessory_information(
    display_name: &str,
    manufacturer_name: &str,
    model_name: &str,
    serial: &str,
    firmware: &str,
) -> Service {
    Service::new(ACCESSORY_INFORMATION)
        .with(identify())
        .with(manufacturer(manufacturer_name))
        .with(model(model_name))
        .with(name(display_name))
        .with(serial_number(serial))
        .with(firmware_revision(firmware))
}

/// A Protocol Information service advertising HAP 1.1.0.
#[must_use]
pub fn protocol_information() -> Service {
    Service::new(PROTOCOL_INFORMATION).with(version())
}
