use super::{lengths, CryptoError};
use x25519_dalek::{PublicKey, StaticSecret};

/// Ephemeral X25519 key pair for the Pair-Verify exchange.
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    /// Generate a fresh ephemeral key pair.
    #[must_use]
    pub fn generate() -> Self {
        use rand::rngs::OsRng;
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// The public half of the key pair.
    #[must_use]
    pub fn public_key(&self) -> X25519PublicKey {
        X25519PublicKey { inner: self.public }
    }

    /// Diffie-Hellman agreement with the peer's public key.
    #[must_use]
    pub fn diffie_hellman(&self, their_public: &X25519PublicKey) -> X25519SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.inner);
        X25519SharedSecret {
            bytes: shared.to_bytes(),
        }
    }
}

/// X25519 public key
#[derive(Clone, Copy)]
pub struct X25519PublicKey {
    inner: PublicKey,
}

impl X25519PublicKey {
    /// Parse a 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns an error unless exactly 32 bytes are supplied.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: lengths::X25519_PUBLIC_KEY,
            actual: bytes.len(),
        })?;
        Ok(Self {
            inner: PublicKey::from(bytes),
        })
    }

    /// Raw public key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.inner.as_bytes()
    }
}

/// Shared secret from the ephemeral exchange.
pub struct X25519SharedSecret {
    bytes: [u8; 32],
}

impl X25519SharedSecret {
    /// Raw shared secret bytes, fed into HKDF.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl Drop for X25519SharedSecret {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.bytes.zeroize();
    }
}
