//! Pair-Setup: SRP-6a enrollment of the first controller
//!
//! Six messages alternate controller to accessory. M1/M2 exchange the SRP
//! ephemerals and salt, M3/M4 the proofs, and M5/M6 the long-term public
//! keys sealed under a key derived from the SRP session key.

use super::{states, PairingError};
use crate::protocol::crypto::{
    derive_key32, ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature,
    Nonce, SrpSession,
};
use crate::protocol::tlv::{error_codes, TlvDecoder, TlvEncoder, TlvType};
use crate::storage::{ControllerRecord, SetupVerifier};
use zeroize::Zeroize;

/// Borrowed context the machine needs to answer each message.
pub struct PairSetupContext<'a> {
    /// The accessory's `XX:XX:...` device ID
    pub accessory_id: &'a str,
    /// The accessory's long-term signing key
    pub signing_key: &'a Ed25519KeyPair,
    /// Cached SRP salt and verifier, `None` if never provisioned
    pub verifier: Option<&'a SetupVerifier>,
    /// Whether an admin controller already exists
    pub paired: bool,
}

/// Result of feeding one controller message into the machine.
pub enum SetupStep {
    /// A TLV reply to send; the exchange continues (or was refused)
    Reply(Vec<u8>),
    /// The exchange finished: send the reply, persist the controller
    Complete {
        /// The M6 TLV reply
        reply: Vec<u8>,
        /// The newly enrolled admin controller
        controller: ControllerRecord,
    },
}

enum State {
    Idle,
    AwaitingProof(SrpSession),
    AwaitingExchange { session_key: Vec<u8> },
}

/// Accessory-side Pair-Setup state machine, one per connection slot.
pub struct PairSetupServer {
    state: State,
}

impl PairSetupServer {
    /// Create a machine in the idle (M1-expected) state.
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Abandon any exchange in progress.
    pub fn reset(&mut self) {
        if let State::AwaitingExchange { session_key } = &mut self.state {
            session_key.zeroize();
        }
        self.state = State::Idle;
    }

    /// Whether an exchange is mid-flight on this slot.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    /// Feed one controller TLV message, producing the reply.
    ///
    /// Authentication failures produce TLV `Error` replies and reset the
    /// machine; transport-level problems (bad TLV, wrong state number)
    /// surface as [`PairingError`] and the caller answers 400.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError`] for malformed or out-of-order messages.
    pub fn handle(
        &mut self,
        body: &[u8],
        ctx: &PairSetupContext<'_>,
    ) -> Result<SetupStep, PairingError> {
        let tlv = TlvDecoder::decode(body)?;
        let state = tlv.get_state()?;
        let expected = self.expected_state();

        if state != expected {
            self.reset();
            return Err(PairingError::UnexpectedState {
                expected,
                got: state,
            });
        }

        match state {
            states::M1 => self.handle_m1(ctx),
            states::M3 => self.handle_m3(&tlv),
            _ => self.handle_m5(&tlv, ctx),
        }
    }

    fn expected_state(&self) -> u8 {
        match self.state {
            State::Idle => states::M1,
            State::AwaitingProof(_) => states::M3,
            State::AwaitingExchange { .. } => states::M5,
        }
    }

    fn handle_m1(&mut self, ctx: &PairSetupContext<'_>) -> Result<SetupStep, PairingError> {
        if ctx.paired {
            tracing::warn!("pair-setup attempted while already paired");
            return Ok(SetupStep::Reply(
                TlvEncoder::new()
                    .add_state(states::M2)
                    .add_error(error_codes::UNAVAILABLE)
                    .build(),
            ));
        }
        let Some(verifier) = ctx.verifier else {
            return Err(PairingError::NotProvisioned);
        };

        let srp = SrpSession::start(&verifier.verifier);
        let reply = TlvEncoder::new()
            .add_state(states::M2)
            .add(TlvType::PublicKey, srp.public_key())
            .add(TlvType::Salt, &verifier.salt)
            .build();

        self.state = State::AwaitingProof(srp);
        Ok(SetupStep::Reply(reply))
    }

    fn handle_m3(&mut self, tlv: &TlvDecoder) -> Result<SetupStep, PairingError> {
        let client_public = tlv.get_required(TlvType::PublicKey)?;
        let client_proof = tlv.get_required(TlvType::Proof)?;

        let State::AwaitingProof(srp) = &self.state else {
            unreachable!("checked by handle()");
        };

        match srp.verify_client(client_public, client_proof) {
            Ok(proof) => {
                let reply = TlvEncoder::new()
                    .add_state(states::M4)
                    .add(TlvType::Proof, proof.server_proof())
                    .build();
                self.state = State::AwaitingExchange {
                    session_key: proof.session_key().to_vec(),
                };
                Ok(SetupStep::Reply(reply))
            }
            Err(_) => {
                tracing::warn!("pair-setup SRP proof mismatch");
                self.reset();
                Ok(SetupStep::Reply(
                    TlvEncoder::new()
                        .add_state(states::M4)
                        .add_error(error_codes::AUTHENTICATION)
                        .build(),
                ))
            }
        }
    }

    fn handle_m5(
        &mut self,
        tlv: &TlvDecoder,
        ctx: &PairSetupContext<'_>,
    ) -> Result<SetupStep, PairingError> {
        let encrypted = tlv.get_required(TlvType::EncryptedData)?;

        let State::AwaitingExchange { session_key } = &self.state else {
            unreachable!("checked by handle()");
        };

        let envelope_key = derive_key32(
            b"Pair-Setup-Encrypt-Salt",
            session_key,
            b"Pair-Setup-Encrypt-Info",
        )?;
        let cipher = ChaCha20Poly1305Cipher::new(&envelope_key)?;

        let authentication_failure = || {
            TlvEncoder::new()
                .add_state(states::M6)
                .add_error(error_codes::AUTHENTICATION)
                .build()
        };

        let Ok(inner) = cipher.decrypt(&Nonce::from_label(b"PS-Msg05"), encrypted) else {
            tracing::warn!("pair-setup M5 envelope failed to open");
            self.reset();
            return Ok(SetupStep::Reply(authentication_failure()));
        };

        let inner_tlv = TlvDecoder::decode(&inner)?;
        let controller_id = inner_tlv.get_required(TlvType::Identifier)?.to_vec();
        let controller_ltpk = inner_tlv.get_required(TlvType::PublicKey)?.to_vec();
        let signature = inner_tlv.get_required(TlvType::Signature)?;

        // iOSDeviceInfo = iOSDeviceX || iOSDevicePairingId || iOSDeviceLTPK
        let device_x = derive_key32(
            b"Pair-Setup-Controller-Sign-Salt",
            session_key,
            b"Pair-Setup-Controller-Sign-Info",
        )?;
        let mut signed_data = Vec::with_capacity(32 + controller_id.len() + 32);
        signed_data.extend_from_slice(&device_x);
        signed_data.extend_from_slice(&controller_id);
        signed_data.extend_from_slice(&controller_ltpk);

        let ltpk: [u8; 32] = match controller_ltpk.as_slice().try_into() {
            Ok(ltpk) => ltpk,
            Err(_) => {
                self.reset();
                return Ok(SetupStep::Reply(authentication_failure()));
            }
        };

        let verified = Ed25519PublicKey::from_bytes(&ltpk)
            .and_then(|key| {
                Ed25519Signature::from_bytes(signature).map(|sig| (key, sig))
            })
            .and_then(|(key, sig)| key.verify(&signed_data, &sig));

        if verified.is_err() {
            tracing::warn!("pair-setup M5 controller signature rejected");
            self.reset();
            return Ok(SetupStep::Reply(authentication_failure()));
        }

        // AccessoryInfo = AccessoryX || AccessoryPairingId || AccessoryLTPK
        let accessory_x = derive_key32(
            b"Pair-Setup-Accessory-Sign-Salt",
            session_key,
            b"Pair-Setup-Accessory-Sign-Info",
        )?;
        let accessory_ltpk = ctx.signing_key.public_key();
        let mut accessory_info =
            Vec::with_capacity(32 + ctx.accessory_id.len() + 32);
        accessory_info.extend_from_slice(&accessory_x);
        accessory_info.extend_from_slice(ctx.accessory_id.as_bytes());
        accessory_info.extend_from_slice(accessory_ltpk.as_bytes());
        let accessory_signature = ctx.signing_key.sign(&accessory_info);

        let exchange = TlvEncoder::new()
            .add(TlvType::Identifier, ctx.accessory_id.as_bytes())
            .add(TlvType::PublicKey, accessory_ltpk.as_bytes())
            .add(TlvType::Signature, &accessory_signature.to_bytes())
            .build();
        let sealed = cipher.encrypt(&Nonce::from_label(b"PS-Msg06"), &exchange)?;

        let reply = TlvEncoder::new()
            .add_state(states::M6)
            .add(TlvType::EncryptedData, &sealed)
            .build();

        tracing::info!("pair-setup complete, controller enrolled as admin");
        self.reset();

        Ok(SetupStep::Complete {
            reply,
            controller: ControllerRecord {
                pairing_id: controller_id,
                ltpk,
                admin: true,
            },
        })
    }
}

impl Default for PairSetupServer {
    fn default() -> Self {
        Self::new()
    }
}
