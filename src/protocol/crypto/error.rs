use thiserror::Error;

/// Errors from the cryptographic primitives
#[derive(Debug, Error)]
pub enum CryptoError {
    /// A key or signature had the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected byte length
        expected: usize,
        /// Actual byte length
        actual: usize,
    },

    /// A public key failed to decompress
    #[error("invalid public key")]
    InvalidPublicKey,

    /// A signature failed verification or parsing
    #[error("invalid signature")]
    InvalidSignature,

    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption or tag verification failed
    #[error("decryption failed")]
    DecryptionFailed,

    /// HKDF expansion failed
    #[error("key derivation failed")]
    KeyDerivationFailed,

    /// SRP protocol failure (bad proof or malformed ephemeral)
    #[error("SRP failure: {0}")]
    Srp(String),
}
