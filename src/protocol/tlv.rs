//! TLV8 codec for the HAP pairing protocol
//!
//! Values are carried as `tag, len, bytes` fragments with `len <= 255`;
//! longer values continue in consecutive fragments with the same tag. The
//! decoder merges adjacent same-tag fragments back into one logical item.

use thiserror::Error;

/// TLV item types used during pairing (HAP Table 5-6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TlvType {
    /// Pairing method
    Method = 0x00,
    /// Pairing identifier (36-byte UTF-8)
    Identifier = 0x01,
    /// SRP salt
    Salt = 0x02,
    /// SRP or Curve25519 public key
    PublicKey = 0x03,
    /// SRP proof
    Proof = 0x04,
    /// ChaCha20-Poly1305 sealed sub-TLV
    EncryptedData = 0x05,
    /// Pairing state (M1..M6)
    State = 0x06,
    /// Error code
    Error = 0x07,
    /// Seconds to wait before retrying
    RetryDelay = 0x08,
    /// MFi certificate (unused with software authentication)
    Certificate = 0x09,
    /// Ed25519 signature
    Signature = 0x0A,
    /// Controller permissions (bit 0 = admin)
    Permissions = 0x0B,
    /// Fragment data
    FragmentData = 0x0C,
    /// Fragment last
    FragmentLast = 0x0D,
    /// Pairing type flags
    Flags = 0x13,
    /// Zero-length separator between list items
    Separator = 0xFF,
}

/// TLV codec errors
#[derive(Debug, Error)]
pub enum TlvError {
    /// A fragment header or value ran past the end of the buffer
    #[error("truncated TLV stream")]
    Truncated,

    /// A required item was absent
    #[error("missing required TLV item 0x{0:02x}")]
    MissingItem(u8),

    /// An item had an unusable value (e.g. multi-byte state)
    #[error("invalid value for TLV item 0x{0:02x}")]
    InvalidItem(u8),
}

/// Builder-style TLV8 encoder.
pub struct TlvEncoder {
    buffer: Vec<u8>,
}

impl TlvEncoder {
    /// Create an empty encoder.
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append an item, fragmenting values longer than 255 bytes.
    #[must_use]
    pub fn add(mut self, tlv_type: TlvType, value: &[u8]) -> Self {
        if value.is_empty() {
            self.buffer.push(tlv_type as u8);
            self.buffer.push(0);
            return self;
        }
        for chunk in value.chunks(255) {
            self.buffer.push(tlv_type as u8);
            #[allow(clippy::cast_possible_truncation)]
            self.buffer.push(chunk.len() as u8);
            self.buffer.extend_from_slice(chunk);
        }
        self
    }

    /// Append a one-byte item.
    #[must_use]
    pub fn add_u8(self, tlv_type: TlvType, value: u8) -> Self {
        self.add(tlv_type, &[value])
    }

    /// Append the pairing state item.
    #[must_use]
    pub fn add_state(self, state: u8) -> Self {
        self.add_u8(TlvType::State, state)
    }

    /// Append an error item.
    #[must_use]
    pub fn add_error(self, code: u8) -> Self {
        self.add_u8(TlvType::Error, code)
    }

    /// Append a zero-length separator.
    #[must_use]
    pub fn add_separator(self) -> Self {
        self.add(TlvType::Separator, &[])
    }

    /// Finish and return the encoded bytes.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for TlvEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded TLV8 stream.
///
/// Items keep their wire order; adjacent fragments with the same tag have
/// been merged. Non-adjacent repeats (list replies separated by 0xFF) stay
/// distinct items.
pub struct TlvDecoder {
    items: Vec<(u8, Vec<u8>)>,
}

impl TlvDecoder {
    /// Decode a TLV8 byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`TlvError::Truncated`] if a fragment runs past the buffer.
    pub fn decode(data: &[u8]) -> Result<Self, TlvError> {
        let mut items: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut pos = 0;

        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(TlvError::Truncated);
            }
            let tag = data[pos];
            let len = data[pos + 1] as usize;
            pos += 2;

            if pos + len > data.len() {
                return Err(TlvError::Truncated);
            }
            let value = &data[pos..pos + len];
            pos += len;

            match items.last_mut() {
                // A preceding 255-byte fragment of the same tag continues here.
                Some((last_tag, last_value)) if *last_tag == tag && last_value.len() % 255 == 0
                    && !last_value.is_empty() =>
                {
                    last_value.extend_from_slice(value);
                }
                _ => items.push((tag, value.to_vec())),
            }
        }

        Ok(Self { items })
    }

    /// First item with the given type.
    #[must_use]
    pub fn get(&self, tlv_type: TlvType) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(tag, _)| *tag == tlv_type as u8)
            .map(|(_, value)| value.as_slice())
    }

    /// First item with the given type, or an error if absent.
    ///
    /// # Errors
    ///
    /// Returns [`TlvError::MissingItem`] if the item is absent.
    pub fn get_required(&self, tlv_type: TlvType) -> Result<&[u8], TlvError> {
        self.get(tlv_type)
            .ok_or(TlvError::MissingItem(tlv_type as u8))
    }

    /// One-byte item with the given type.
    #[must_use]
    pub fn get_u8(&self, tlv_type: TlvType) -> Option<u8> {
        self.get(tlv_type).and_then(|v| v.first().copied())
    }

    /// The pairing state item.
    ///
    /// # Errors
    ///
    /// Returns an error if the state item is absent or not one byte.
    pub fn get_state(&self) -> Result<u8, TlvError> {
        let value = self.get_required(TlvType::State)?;
        if value.len() != 1 {
            return Err(TlvError::InvalidItem(TlvType::State as u8));
        }
        Ok(value[0])
    }
}

/// Pairing method codes (HAP Table 5-3)
pub mod methods {
    /// Pair-Setup
    pub const PAIR_SETUP: u8 = 0;
    /// Pair-Setup with MFi auth
    pub const PAIR_SETUP_AUTH: u8 = 1;
    /// Pair-Verify
    pub const PAIR_VERIFY: u8 = 2;
    /// Add pairing
    pub const ADD_PAIRING: u8 = 3;
    /// Remove pairing
    pub const REMOVE_PAIRING: u8 = 4;
    /// List pairings
    pub const LIST_PAIRINGS: u8 = 5;
}

/// Pairing error codes (HAP Table 5-5)
pub mod error_codes {
    /// Generic failure
    pub const UNKNOWN: u8 = 0x01;
    /// Setup code or signature mismatch
    pub const AUTHENTICATION: u8 = 0x02;
    /// Retry later
    pub const BACKOFF: u8 = 0x03;
    /// Controller table is full
    pub const MAX_PEERS: u8 = 0x04;
    /// Too many failed attempts
    pub const MAX_TRIES: u8 = 0x05;
    /// Already paired
    pub const UNAVAILABLE: u8 = 0x06;
    /// Another pairing exchange is in flight
    pub const BUSY: u8 = 0x07;
}
