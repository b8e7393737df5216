//! Sans-IO protocol building blocks for the HAP wire format

pub mod crypto;
pub mod http;
pub mod pairing;
pub mod tlv;
