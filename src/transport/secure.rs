//! Framed ChaCha20-Poly1305 session encryption
//!
//! After Pair-Verify M4 every byte on the socket is wrapped in frames of
//! `len (2 bytes LE) || ciphertext || tag (16 bytes)`, where the length
//! prefix is the AAD and the nonce is a zero-padded little-endian frame
//! counter. Counters run per direction and never reset within a session.

use crate::protocol::pairing::TransportKeys;
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BytesMut};
use chacha20poly1305::{AeadInPlace, ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};
use thiserror::Error;

/// Maximum plaintext bytes carried by one frame.
pub const MAX_FRAME_PLAINTEXT: usize = 1024;

/// Frame overhead: 2-byte length prefix plus 16-byte tag.
const FRAME_OVERHEAD: usize = 18;

/// Errors from the secure session
#[derive(Debug, Error)]
pub enum SecureSessionError {
    /// A frame failed tag verification; the connection must close
    #[error("frame authentication failed")]
    BadFrame,
}

/// Encrypted session state for one connection.
pub struct SecureSession {
    tx_cipher: ChaCha20Poly1305,
    rx_cipher: ChaCha20Poly1305,
    tx_count: u64,
    rx_count: u64,
}

impl SecureSession {
    /// Create a session from the keys derived in Pair-Verify M4.
    #[must_use]
    pub fn new(keys: &TransportKeys) -> Self {
        Self {
            tx_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.tx_key)),
            rx_cipher: ChaCha20Poly1305::new(Key::from_slice(&keys.rx_key)),
            tx_count: 0,
            rx_count: 0,
        }
    }

    /// Encrypt outbound plaintext into one or more frames.
    ///
    /// # Errors
    ///
    /// Returns [`SecureSessionError::BadFrame`] if AEAD sealing fails.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, SecureSessionError> {
        let frames = plaintext.len() / MAX_FRAME_PLAINTEXT + 1;
        let mut output = Vec::with_capacity(plaintext.len() + frames * FRAME_OVERHEAD);

        // An empty write still produces one (empty) frame.
        let mut chunks = plaintext.chunks(MAX_FRAME_PLAINTEXT);
        let first: &[u8] = chunks.next().unwrap_or(&[]);

        for chunk in std::iter::once(first).chain(chunks) {
            let mut len_bytes = [0u8; 2];
            #[allow(clippy::cast_possible_truncation)]
            LittleEndian::write_u16(&mut len_bytes, chunk.len() as u16);

            let mut nonce_bytes = [0u8; 12];
            LittleEndian::write_u64(&mut nonce_bytes[4..], self.tx_count);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let mut buffer = chunk.to_vec();
            let tag = self
                .tx_cipher
                .encrypt_in_place_detached(nonce, &len_bytes, &mut buffer)
                .map_err(|_| SecureSessionError::BadFrame)?;

            output.extend_from_slice(&len_bytes);
            output.extend_from_slice(&buffer);
            output.extend_from_slice(tag.as_slice());

            self.tx_count += 1;
        }

        Ok(output)
    }

    /// Decrypt every complete inbound frame buffered in `input`.
    ///
    /// Consumed frames are drained from `input`; a trailing partial frame
    /// is left for the next read. Returns the concatenated plaintext.
    ///
    /// # Errors
    ///
    /// Returns [`SecureSessionError::BadFrame`] on tag mismatch, which
    /// terminates the connection.
    pub fn decrypt(&mut self, input: &mut BytesMut) -> Result<Vec<u8>, SecureSessionError> {
        let mut plaintext = Vec::new();

        while input.len() >= 2 {
            let len = LittleEndian::read_u16(&input[..2]) as usize;
            if input.len() < 2 + len + 16 {
                break;
            }

            let mut nonce_bytes = [0u8; 12];
            LittleEndian::write_u64(&mut nonce_bytes[4..], self.rx_count);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let len_bytes = [input[0], input[1]];
            let mut buffer = input[2..2 + len].to_vec();
            let tag = Tag::clone_from_slice(&input[2 + len..2 + len + 16]);

            self.rx_cipher
                .decrypt_in_place_detached(nonce, &len_bytes, &mut buffer, &tag)
                .map_err(|_| SecureSessionError::BadFrame)?;

            input.advance(2 + len + 16);
            self.rx_count += 1;
            plaintext.extend_from_slice(&buffer);
        }

        Ok(plaintext)
    }
}
