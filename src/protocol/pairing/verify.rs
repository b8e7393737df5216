//! Pair-Verify: per-session authentication of an enrolled controller
//!
//! Four messages: M1 carries the controller's Curve25519 ephemeral, M2 the
//! accessory's ephemeral plus a sealed signature, M3 the controller's
//! sealed signature, M4 the verdict. Success yields the session transport
//! keys.

use super::{states, PairingError, TransportKeys};
use crate::protocol::crypto::{
    derive_key32, ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature,
    Nonce, X25519KeyPair, X25519PublicKey,
};
use crate::protocol::tlv::{error_codes, TlvDecoder, TlvEncoder, TlvType};
use crate::storage::ControllerTable;
use zeroize::Zeroize;

/// Borrowed context the machine needs to answer each message.
pub struct PairVerifyContext<'a> {
    /// The accessory's `XX:XX:...` device ID
    pub accessory_id: &'a str,
    /// The accessory's long-term signing key
    pub signing_key: &'a Ed25519KeyPair,
    /// The enrolled-controller table
    pub controllers: &'a ControllerTable,
}

/// Result of feeding one controller message into the machine.
pub enum VerifyStep {
    /// A TLV reply to send; the exchange continues (or was refused)
    Reply(Vec<u8>),
    /// Verification succeeded: send the reply, then switch the connection
    /// to the derived transport keys
    Verified {
        /// The M4 TLV reply (sent in plaintext, before encryption starts)
        reply: Vec<u8>,
        /// Pairing ID of the authenticated controller
        controller_id: Vec<u8>,
        /// Session transport keys
        keys: TransportKeys,
    },
}

struct Exchange {
    shared_secret: [u8; 32],
    session_key: [u8; 32],
    our_public: [u8; 32],
    their_public: [u8; 32],
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
        self.session_key.zeroize();
    }
}

enum State {
    Idle,
    AwaitingFinish(Exchange),
}

/// Accessory-side Pair-Verify state machine, one per connection slot.
pub struct PairVerifyServer {
    state: State,
}

impl PairVerifyServer {
    /// Create a machine in the idle (M1-expected) state.
    #[must_use]
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Abandon any exchange in progress.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Feed one controller TLV message, producing the reply.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError`] for malformed or out-of-order messages.
    pub fn handle(
        &mut self,
        body: &[u8],
        ctx: &PairVerifyContext<'_>,
    ) -> Result<VerifyStep, PairingError> {
        let tlv = TlvDecoder::decode(body)?;
        let state = tlv.get_state()?;
        let expected = match self.state {
            State::Idle => states::M1,
            State::AwaitingFinish(_) => states::M3,
        };

        if state != expected {
            self.reset();
            return Err(PairingError::UnexpectedState {
                expected,
                got: state,
            });
        }

        match state {
            states::M1 => self.handle_m1(&tlv, ctx),
            _ => self.handle_m3(&tlv, ctx),
        }
    }

    fn handle_m1(
        &mut self,
        tlv: &TlvDecoder,
        ctx: &PairVerifyContext<'_>,
    ) -> Result<VerifyStep, PairingError> {
        let controller_public = X25519PublicKey::from_bytes(tlv.get_required(TlvType::PublicKey)?)?;

        let ephemeral = X25519KeyPair::generate();
        let our_public = *ephemeral.public_key().as_bytes();
        let shared = ephemeral.diffie_hellman(&controller_public);

        let session_key = derive_key32(
            b"Pair-Verify-Encrypt-Salt",
            shared.as_bytes(),
            b"Pair-Verify-Encrypt-Info",
        )?;

        // AccessoryInfo = our ephemeral || accessory id || their ephemeral
        let mut info = Vec::with_capacity(32 + ctx.accessory_id.len() + 32);
        info.extend_from_slice(&our_public);
        info.extend_from_slice(ctx.accessory_id.as_bytes());
        info.extend_from_slice(controller_public.as_bytes());
        let signature = ctx.signing_key.sign(&info);

        let inner = TlvEncoder::new()
            .add(TlvType::Identifier, ctx.accessory_id.as_bytes())
            .add(TlvType::Signature, &signature.to_bytes())
            .build();

        let cipher = ChaCha20Poly1305Cipher::new(&session_key)?;
        let sealed = cipher.encrypt(&Nonce::from_label(b"PV-Msg02"), &inner)?;

        let reply = TlvEncoder::new()
            .add_state(states::M2)
            .add(TlvType::PublicKey, &our_public)
            .add(TlvType::EncryptedData, &sealed)
            .build();

        self.state = State::AwaitingFinish(Exchange {
            shared_secret: *shared.as_bytes(),
            session_key,
            our_public,
            their_public: *controller_public.as_bytes(),
        });

        Ok(VerifyStep::Reply(reply))
    }

    fn handle_m3(
        &mut self,
        tlv: &TlvDecoder,
        ctx: &PairVerifyContext<'_>,
    ) -> Result<VerifyStep, PairingError> {
        let encrypted = tlv.get_required(TlvType::EncryptedData)?;

        let State::AwaitingFinish(exchange) = &self.state else {
            unreachable!("checked by handle()");
        };

        let authentication_failure = || {
            TlvEncoder::new()
                .add_state(states::M4)
                .add_error(error_codes::AUTHENTICATION)
                .build()
        };

        let cipher = ChaCha20Poly1305Cipher::new(&exchange.session_key)?;
        let Ok(inner) = cipher.decrypt(&Nonce::from_label(b"PV-Msg03"), encrypted) else {
            tracing::warn!("pair-verify M3 envelope failed to open");
            self.reset();
            return Ok(VerifyStep::Reply(authentication_failure()));
        };

        let inner_tlv = TlvDecoder::decode(&inner)?;
        let controller_id = inner_tlv.get_required(TlvType::Identifier)?.to_vec();
        let signature = inner_tlv.get_required(TlvType::Signature)?;

        let Some(record) = ctx.controllers.find(&controller_id) else {
            tracing::warn!("pair-verify from unknown controller");
            self.reset();
            return Ok(VerifyStep::Reply(authentication_failure()));
        };

        // iOSDeviceInfo = their ephemeral || controller id || our ephemeral
        let mut info = Vec::with_capacity(32 + controller_id.len() + 32);
        info.extend_from_slice(&exchange.their_public);
        info.extend_from_slice(&controller_id);
        info.extend_from_slice(&exchange.our_public);

        let verified = Ed25519PublicKey::from_bytes(&record.ltpk)
            .and_then(|key| Ed25519Signature::from_bytes(signature).map(|sig| (key, sig)))
            .and_then(|(key, sig)| key.verify(&info, &sig));

        if verified.is_err() {
            tracing::warn!("pair-verify controller signature rejected");
            self.reset();
            return Ok(VerifyStep::Reply(authentication_failure()));
        }

        let keys = TransportKeys {
            tx_key: derive_key32(
                b"Control-Salt",
                &exchange.shared_secret,
                b"Control-Read-Encryption-Key",
            )?,
            rx_key: derive_key32(
                b"Control-Salt",
                &exchange.shared_secret,
                b"Control-Write-Encryption-Key",
            )?,
        };

        let reply = TlvEncoder::new().add_state(states::M4).build();

        tracing::debug!("pair-verify complete, session established");
        self.reset();

        Ok(VerifyStep::Verified {
            reply,
            controller_id,
            keys,
        })
    }
}

impl Default for PairVerifyServer {
    fn default() -> Self {
        Self::new()
    }
}
