use super::CryptoError;
use sha2::Sha512;
use srp::client::SrpClient;
use srp::groups::G_3072;
use srp::server::SrpServer;
use zeroize::Zeroize;

/// Fixed SRP username for HAP Pair-Setup.
pub const SRP_USERNAME: &[u8] = b"Pair-Setup";

/// Server side of one SRP-6a exchange (3072-bit group, SHA-512).
///
/// Created when M1 arrives, consumed when the client proof in M3 has been
/// checked. The verifier comes from the persistent store, pre-computed at
/// provisioning so the setup code itself is never kept.
pub struct SrpSession {
    server: SrpServer<'static, Sha512>,
    private: Vec<u8>,
    public: Vec<u8>,
    verifier: Vec<u8>,
}

impl SrpSession {
    /// Begin an exchange with a fresh random server ephemeral.
    #[must_use]
    pub fn start(verifier: &[u8]) -> Self {
        use rand::rngs::OsRng;
        use rand::RngCore;

        let server = SrpServer::new(&G_3072);
        let mut private = vec![0u8; 64];
        OsRng.fill_bytes(&mut private);
        let public = server.compute_public_ephemeral(&private, verifier);

        Self {
            server,
            private,
            public,
            verifier: verifier.to_vec(),
        }
    }

    /// The server public ephemeral `B`, sent in M2.
    #[must_use]
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Check the client proof from M3 against the client ephemeral `A`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Srp`] if `A` is malformed or the proof does
    /// not match the stored verifier.
    pub fn verify_client(
        &self,
        client_public: &[u8],
        client_proof: &[u8],
    ) -> Result<SrpProof, CryptoError> {
        let verifier = self
            .server
            .process_reply(&self.private, &self.verifier, client_public)
            .map_err(|e| CryptoError::Srp(e.to_string()))?;

        verifier
            .verify_client(client_proof)
            .map_err(|e| CryptoError::Srp(e.to_string()))?;

        Ok(SrpProof {
            server_proof: verifier.proof().to_vec(),
            session_key: verifier.key().to_vec(),
        })
    }
}

impl Drop for SrpSession {
    fn drop(&mut self) {
        self.private.zeroize();
    }
}

/// Outcome of a successful client-proof check.
pub struct SrpProof {
    server_proof: Vec<u8>,
    session_key: Vec<u8>,
}

impl SrpProof {
    /// The server proof `M_s`, sent back in M4.
    #[must_use]
    pub fn server_proof(&self) -> &[u8] {
        &self.server_proof
    }

    /// The shared session key `K`, input to the M5/M6 key derivations.
    #[must_use]
    pub fn session_key(&self) -> &[u8] {
        &self.session_key
    }
}

impl Drop for SrpProof {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}

/// Compute the SRP verifier for a setup code, done once at provisioning.
#[must_use]
pub fn compute_srp_verifier(setup_code: &str, salt: &[u8]) -> Vec<u8> {
    SrpClient::<Sha512>::new(&G_3072).compute_verifier(
        SRP_USERNAME,
        setup_code.as_bytes(),
        salt,
    )
}
