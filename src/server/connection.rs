//! Per-slot protocol state

use crate::protocol::http::HttpServerCodec;
use crate::protocol::pairing::{PairSetupServer, PairVerifyServer};
use crate::transport::SecureSession;
use bytes::BytesMut;
use std::net::SocketAddr;

/// Everything a connection slot holds besides its socket.
///
/// Slots are fully reset on (re)assignment: a fresh `Connection` carries
/// no session keys, no pairing progress, and no verified controller.
pub(crate) struct Connection {
    pub(crate) remote: SocketAddr,
    pub(crate) http: HttpServerCodec,
    /// Raw socket bytes awaiting frame decryption (post-verify only)
    pub(crate) crypt_buf: BytesMut,
    pub(crate) secure: Option<SecureSession>,
    pub(crate) pair_setup: PairSetupServer,
    pub(crate) pair_verify: PairVerifyServer,
    /// Pairing ID of the controller this session authenticated as
    pub(crate) verified: Option<Vec<u8>>,
    pub(crate) last_active_ms: u64,
}

impl Connection {
    pub(crate) fn new(remote: SocketAddr, now_ms: u64) -> Self {
        Self {
            remote,
            http: HttpServerCodec::new(),
            crypt_buf: BytesMut::new(),
            secure: None,
            pair_setup: PairSetupServer::new(),
            pair_verify: PairVerifyServer::new(),
            verified: None,
            last_active_ms: now_ms,
        }
    }

    pub(crate) fn is_verified(&self) -> bool {
        self.verified.is_some()
    }
}
