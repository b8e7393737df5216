use super::{lengths, CryptoError};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305 as ChaChaImpl, Nonce as ChaChaNonce,
};

/// 12-byte ChaCha20-Poly1305 nonce.
///
/// HAP uses two nonce shapes: an 8-character ASCII message label padded
/// with four zero bytes during pairing (`PS-Msg05`, `PV-Msg02`, ...) and a
/// zero-padded little-endian frame counter for session traffic.
#[derive(Clone, Copy)]
pub struct Nonce([u8; 12]);

impl Nonce {
    /// Nonce from an 8-byte pairing message label.
    #[must_use]
    pub fn from_label(label: &[u8; 8]) -> Self {
        let mut arr = [0u8; 12];
        arr[4..].copy_from_slice(label);
        Self(arr)
    }

    /// Nonce from a per-direction 64-bit frame counter.
    #[must_use]
    pub fn from_counter(counter: u64) -> Self {
        let mut arr = [0u8; 12];
        arr[4..].copy_from_slice(&counter.to_le_bytes());
        Self(arr)
    }

    /// Raw nonce bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// ChaCha20-Poly1305 AEAD cipher keyed for one purpose.
pub struct ChaCha20Poly1305Cipher {
    cipher: ChaChaImpl,
}

impl ChaCha20Poly1305Cipher {
    /// Create a cipher from a 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly 32 bytes are supplied.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher =
            ChaChaImpl::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
                expected: lengths::CHACHA_KEY,
                actual: key.len(),
            })?;
        Ok(Self { cipher })
    }

    /// Encrypt, returning ciphertext with the 16-byte tag appended.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(ChaChaNonce::from_slice(&nonce.0), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Encrypt with associated data.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::EncryptionFailed`] on AEAD failure.
    pub fn encrypt_with_aad(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .encrypt(
                ChaChaNonce::from_slice(&nonce.0),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt ciphertext carrying an appended 16-byte tag.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the tag does not verify.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(ChaChaNonce::from_slice(&nonce.0), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Decrypt with associated data.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] if the tag does not verify.
    pub fn decrypt_with_aad(
        &self,
        nonce: &Nonce,
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.cipher
            .decrypt(
                ChaChaNonce::from_slice(&nonce.0),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
