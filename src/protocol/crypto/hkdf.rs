use super::CryptoError;
use hkdf::Hkdf;
use sha2::Sha512;

/// HKDF-SHA512, the only KDF HAP uses.
pub struct HkdfSha512 {
    hkdf: Hkdf<Sha512>,
}

impl HkdfSha512 {
    /// Create an HKDF instance from a salt and input key material.
    #[must_use]
    pub fn new(salt: &[u8], ikm: &[u8]) -> Self {
        Self {
            hkdf: Hkdf::<Sha512>::new(Some(salt), ikm),
        }
    }

    /// Expand into a fixed-size output.
    ///
    /// # Errors
    ///
    /// Returns an error if `N` exceeds the HKDF output limit.
    pub fn expand_fixed<const N: usize>(&self, info: &[u8]) -> Result<[u8; N], CryptoError> {
        let mut okm = [0u8; N];
        self.hkdf
            .expand(info, &mut okm)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        Ok(okm)
    }
}

/// One-shot derivation of a 32-byte key, the shape every HAP KDF step takes.
///
/// # Errors
///
/// Returns an error if HKDF expansion fails.
pub fn derive_key32(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32], CryptoError> {
    HkdfSha512::new(salt, ikm).expand_fixed::<32>(info)
}
