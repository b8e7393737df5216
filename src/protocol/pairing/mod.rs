//! Accessory-side HAP pairing state machines
//!
//! Pair-Setup enrolls a controller through a six-message SRP-6a exchange;
//! Pair-Verify authenticates an enrolled controller and yields the
//! per-session transport keys. Both machines are sans-IO: the router feeds
//! them TLV bodies and writes back the TLV replies they produce.

pub mod setup;
pub mod verify;


pub use setup::{PairSetupContext, PairSetupServer, SetupStep};
pub use verify::{PairVerifyContext, PairVerifyServer, VerifyStep};

use crate::protocol::crypto::CryptoError;
use crate::protocol::tlv::TlvError;
use thiserror::Error;

/// Pairing message numbers
pub mod states {
    /// First controller message of either flow
    pub const M1: u8 = 1;
    /// First accessory reply
    pub const M2: u8 = 2;
    /// Second controller message
    pub const M3: u8 = 3;
    /// Second accessory reply
    pub const M4: u8 = 4;
    /// Third controller message (Pair-Setup only)
    pub const M5: u8 = 5;
    /// Final accessory reply (Pair-Setup only)
    pub const M6: u8 = 6;
}

/// Transport keys derived at the end of Pair-Verify.
///
/// `tx` encrypts accessory-to-controller traffic (the controller's read
/// key); `rx` decrypts controller-to-accessory traffic.
#[derive(Debug)]
pub struct TransportKeys {
    /// Accessory-to-controller key
    pub tx_key: [u8; 32],
    /// Controller-to-accessory key
    pub rx_key: [u8; 32],
}

/// Failures that abort a pairing exchange at the transport level.
///
/// Protocol-level failures (bad proof, unknown controller) do not surface
/// here; the machines answer those with TLV `Error` replies instead.
#[derive(Debug, Error)]
pub enum PairingError {
    /// Message arrived with an unexpected state number
    #[error("unexpected pairing state {got}, expected {expected}")]
    UnexpectedState {
        /// State the machine was waiting for
        expected: u8,
        /// State the message carried
        got: u8,
    },

    /// Body was not valid TLV8
    #[error("TLV error: {0}")]
    Tlv(#[from] TlvError),

    /// Cryptographic primitive failed outside the proof/signature checks
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Pair-Setup attempted without a provisioned SRP verifier
    #[error("no setup code has been provisioned")]
    NotProvisioned,
}
