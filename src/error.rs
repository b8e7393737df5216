//! Top-level error type

use crate::accessory::ConfigError;
use crate::discovery::AdvertiserError;
use crate::protocol::crypto::CryptoError;
use crate::protocol::http::ParseError;
use crate::protocol::pairing::PairingError;
use crate::protocol::tlv::TlvError;
use crate::storage::{IdentityError, ProvisionError, StorageError};
use thiserror::Error;

/// Errors surfaced by the HAP server
#[derive(Debug, Error)]
pub enum HapError {
    /// The attribute database failed validation; every violation listed
    #[error("invalid accessory configuration: {}", format_config_errors(.0))]
    Config(Vec<ConfigError>),

    /// Persistent store failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Identity or controller record failure
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// Setup-code provisioning failure
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Pairing exchange failure
    #[error(transparent)]
    Pairing(#[from] PairingError),

    /// TLV codec failure
    #[error(transparent)]
    Tlv(#[from] TlvError),

    /// Cryptographic failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// HTTP parsing failure
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// mDNS advertisement failure
    #[error(transparent)]
    Advertiser(#[from] AdvertiserError),

    /// Socket-level failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_config_errors(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
