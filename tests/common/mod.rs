//! Shared test harness: a minimal HAP controller speaking to a running
//! server over real sockets.

#![allow(dead_code)]

use bytes::BytesMut;
use hap_server::accessory::{catalog, Accessory, Database, Service};
use hap_server::clock::Clock;
use hap_server::protocol::crypto::{
    derive_key32, ChaCha20Poly1305Cipher, Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature,
    Nonce,
};
use hap_server::protocol::pairing::TransportKeys;
use hap_server::protocol::tlv::{TlvDecoder, TlvEncoder, TlvType};
use hap_server::storage::{provision_setup_code, MemoryStore};
use hap_server::transport::SecureSession;
use hap_server::{Category, HapServer, ServerConfig, ServerEvent, ServerHandle};
use sha2::Sha512;
use srp::client::SrpClient;
use srp::groups::G_3072;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use x25519_dalek::{PublicKey, StaticSecret};

pub const SETUP_CODE: &str = "46637726";
pub const CONTROLLER_ID: &[u8] = b"F1D3E9A2-77B4-4E21-9C55-0A61B2C3D4E5";

/// Bridge + lamp database used by most scenarios. The lamp's On
/// characteristic is (2, 9).
pub fn test_database() -> Database {
    let mut db = Database::new();

    let mut bridge = Accessory::new();
    bridge.add_service(catalog::accessory_information(
        "Bridge", "Acme", "B100", "0001", "1.0.0",
    ));
    bridge.add_service(catalog::protocol_information());
    db.add_accessory(bridge);

    let mut lamp = Accessory::new();
    lamp.add_service(catalog::accessory_information(
        "Lamp", "Acme", "L200", "0002", "1.0.0",
    ));
    lamp.add_service(
        Service::new(catalog::LIGHT_BULB)
            .with(catalog::on(false))
            .primary(),
    );
    db.add_accessory(lamp);
    db
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        name: "Test Bridge".into(),
        model: "T-1000".into(),
        category: Category::Bridge,
        port: 0,
        max_connections: 8,
        advertise: false,
    }
}

/// Boot a server on an ephemeral port with a provisioned setup code.
pub async fn start_server(
    db: Database,
    clock: Option<Box<dyn Clock>>,
) -> (ServerHandle, u16, broadcast::Receiver<ServerEvent>) {
    let mut store = Box::new(MemoryStore::new());
    provision_setup_code(store.as_mut(), SETUP_CODE)
        .await
        .unwrap();

    let server = match clock {
        Some(clock) => HapServer::with_clock(test_config(), db, store, clock)
            .await
            .unwrap(),
        None => HapServer::new(test_config(), db, store).await.unwrap(),
    };

    let handle = server.handle();
    let mut events = server.subscribe();
    tokio::spawn(server.run());

    let port = loop {
        match events.recv().await.unwrap() {
            ServerEvent::Started { port } => break port,
            _ => continue,
        }
    };

    (handle, port, events)
}

/// Wait for a specific event, skipping others.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ServerEvent>,
    mut predicate: impl FnMut(&ServerEvent) -> bool,
) -> ServerEvent {
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        if predicate(&event) {
            return event;
        }
    }
}

/// One parsed message off the session: a response or an event.
pub enum Message {
    Response { status: u16, body: Vec<u8> },
    Event { body: Vec<u8> },
}

/// A controller-side connection.
pub struct Controller {
    stream: TcpStream,
    session: Option<SecureSession>,
    /// Encrypted bytes not yet framed
    wire_buf: BytesMut,
    /// Decrypted (or plaintext) bytes not yet parsed
    plain_buf: BytesMut,
    /// Events that arrived while waiting for a response
    pending_events: Vec<Vec<u8>>,
    pub signing_key: Ed25519KeyPair,
    /// Accessory identity learned during Pair-Setup
    pub accessory_id: Option<Vec<u8>>,
    pub accessory_ltpk: Option<Vec<u8>>,
}

impl Controller {
    pub async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        Self::with_stream(stream)
    }

    pub fn with_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            session: None,
            wire_buf: BytesMut::new(),
            plain_buf: BytesMut::new(),
            pending_events: Vec::new(),
            signing_key: Ed25519KeyPair::generate(),
            accessory_id: None,
            accessory_ltpk: None,
        }
    }

    pub fn secured(&self) -> bool {
        self.session.is_some()
    }

    /// Send a request and wait for its response, stashing any events that
    /// arrive first.
    pub async fn request(
        &mut self,
        method: &str,
        path: &str,
        content_type: &str,
        body: &[u8],
    ) -> (u16, Vec<u8>) {
        let mut head = format!("{method} {path} HTTP/1.1\r\n");
        if !body.is_empty() {
            head.push_str(&format!(
                "Content-Type: {content_type}\r\nContent-Length: {}\r\n",
                body.len()
            ));
        }
        head.push_str("\r\n");

        let mut wire = head.into_bytes();
        wire.extend_from_slice(body);
        if let Some(session) = self.session.as_mut() {
            wire = session.encrypt(&wire).unwrap();
        }
        self.stream.write_all(&wire).await.unwrap();

        loop {
            match self.read_message().await {
                Message::Response { status, body } => return (status, body),
                Message::Event { body } => self.pending_events.push(body),
            }
        }
    }

    /// Wait for the next EVENT frame.
    pub async fn read_event(&mut self) -> serde_json::Value {
        if !self.pending_events.is_empty() {
            let body = self.pending_events.remove(0);
            return serde_json::from_slice(&body).unwrap();
        }
        loop {
            match self.read_message().await {
                Message::Event { body } => return serde_json::from_slice(&body).unwrap(),
                Message::Response { .. } => panic!("unexpected response while awaiting event"),
            }
        }
    }

    /// True if the server closed the connection (EOF before a message).
    pub async fn read_until_eof(&mut self) -> bool {
        let mut buf = [0u8; 1024];
        loop {
            match tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.stream.read(&mut buf),
            )
            .await
            {
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(_)) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn read_message(&mut self) -> Message {
        loop {
            if let Some(message) = self.try_parse() {
                return message;
            }

            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                self.stream.read(&mut buf),
            )
            .await
            .expect("timed out reading from server")
            .expect("read failed");
            assert!(n > 0, "server closed connection mid-message");

            if let Some(session) = self.session.as_mut() {
                self.wire_buf.extend_from_slice(&buf[..n]);
                let plain = session.decrypt(&mut self.wire_buf).unwrap();
                self.plain_buf.extend_from_slice(&plain);
            } else {
                self.plain_buf.extend_from_slice(&buf[..n]);
            }
        }
    }

    fn try_parse(&mut self) -> Option<Message> {
        let head_end = self
            .plain_buf
            .windows(4)
            .position(|w| w == b"\r\n\r\n")?;

        let head = String::from_utf8_lossy(&self.plain_buf[..head_end]).to_string();
        let mut content_length = 0usize;
        for line in head.lines().skip(1) {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }

        let total = head_end + 4 + content_length;
        if self.plain_buf.len() < total {
            return None;
        }

        let message: Vec<u8> = self.plain_buf.split_to(total).to_vec();
        let body = message[head_end + 4..].to_vec();

        let first_line = head.lines().next().unwrap_or_default().to_string();
        if first_line.starts_with("EVENT/") {
            return Some(Message::Event { body });
        }
        let status: u16 = first_line
            .split_whitespace()
            .nth(1)
            .expect("status code")
            .parse()
            .unwrap();
        Some(Message::Response { status, body })
    }

    /// Run the full six-message Pair-Setup exchange.
    pub async fn pair_setup(&mut self, code: &str) -> Result<(), String> {
        let m1 = TlvEncoder::new().add_state(1).add_u8(TlvType::Method, 0).build();
        let (status, m2) = self
            .request("POST", "/pair-setup", "application/pairing+tlv8", &m1)
            .await;
        assert_eq!(status, 200);

        let m2 = TlvDecoder::decode(&m2).unwrap();
        if let Some(error) = m2.get_u8(TlvType::Error) {
            return Err(format!("M2 error {error}"));
        }
        let salt = m2.get_required(TlvType::Salt).unwrap().to_vec();
        let server_public = m2.get_required(TlvType::PublicKey).unwrap().to_vec();

        let client = SrpClient::<Sha512>::new(&G_3072);
        let a = rand::random::<[u8; 32]>();
        let a_pub = client.compute_public_ephemeral(&a);
        let verifier = client
            .process_reply(&a, b"Pair-Setup", code.as_bytes(), &salt, &server_public)
            .map_err(|e| e.to_string())?;

        let m3 = TlvEncoder::new()
            .add_state(3)
            .add(TlvType::PublicKey, &a_pub)
            .add(TlvType::Proof, verifier.proof())
            .build();
        let (status, m4) = self
            .request("POST", "/pair-setup", "application/pairing+tlv8", &m3)
            .await;
        assert_eq!(status, 200);

        let m4 = TlvDecoder::decode(&m4).unwrap();
        if let Some(error) = m4.get_u8(TlvType::Error) {
            return Err(format!("M4 error {error}"));
        }
        verifier
            .verify_server(m4.get_required(TlvType::Proof).unwrap())
            .map_err(|e| e.to_string())?;
        let session_key = verifier.key();

        let device_x = derive_key32(
            b"Pair-Setup-Controller-Sign-Salt",
            session_key,
            b"Pair-Setup-Controller-Sign-Info",
        )
        .unwrap();
        let ltpk = self.signing_key.public_key();
        let mut signed = Vec::new();
        signed.extend_from_slice(&device_x);
        signed.extend_from_slice(CONTROLLER_ID);
        signed.extend_from_slice(ltpk.as_bytes());
        let signature = self.signing_key.sign(&signed);

        let inner = TlvEncoder::new()
            .add(TlvType::Identifier, CONTROLLER_ID)
            .add(TlvType::PublicKey, ltpk.as_bytes())
            .add(TlvType::Signature, &signature.to_bytes())
            .build();
        let envelope_key = derive_key32(
            b"Pair-Setup-Encrypt-Salt",
            session_key,
            b"Pair-Setup-Encrypt-Info",
        )
        .unwrap();
        let cipher = ChaCha20Poly1305Cipher::new(&envelope_key).unwrap();
        let sealed = cipher
            .encrypt(&Nonce::from_label(b"PS-Msg05"), &inner)
            .unwrap();

        let m5 = TlvEncoder::new()
            .add_state(5)
            .add(TlvType::EncryptedData, &sealed)
            .build();
        let (status, m6) = self
            .request("POST", "/pair-setup", "application/pairing+tlv8", &m5)
            .await;
        assert_eq!(status, 200);

        let m6 = TlvDecoder::decode(&m6).unwrap();
        if let Some(error) = m6.get_u8(TlvType::Error) {
            return Err(format!("M6 error {error}"));
        }
        let sealed = m6.get_required(TlvType::EncryptedData).unwrap();
        let opened = cipher
            .decrypt(&Nonce::from_label(b"PS-Msg06"), sealed)
            .map_err(|e| e.to_string())?;
        let exchange = TlvDecoder::decode(&opened).unwrap();

        let accessory_id = exchange.get_required(TlvType::Identifier).unwrap().to_vec();
        let accessory_ltpk = exchange.get_required(TlvType::PublicKey).unwrap().to_vec();
        let accessory_sig = exchange.get_required(TlvType::Signature).unwrap();

        let accessory_x = derive_key32(
            b"Pair-Setup-Accessory-Sign-Salt",
            session_key,
            b"Pair-Setup-Accessory-Sign-Info",
        )
        .unwrap();
        let mut info = Vec::new();
        info.extend_from_slice(&accessory_x);
        info.extend_from_slice(&accessory_id);
        info.extend_from_slice(&accessory_ltpk);
        Ed25519PublicKey::from_bytes(&accessory_ltpk)
            .unwrap()
            .verify(&info, &Ed25519Signature::from_bytes(accessory_sig).unwrap())
            .map_err(|_| "accessory signature invalid".to_string())?;

        self.accessory_id = Some(accessory_id);
        self.accessory_ltpk = Some(accessory_ltpk);
        Ok(())
    }

    /// Run Pair-Verify and switch this connection to the session keys.
    pub async fn pair_verify(
        &mut self,
        accessory_ltpk: &[u8],
    ) -> Result<(), String> {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let our_public = PublicKey::from(&secret);

        let m1 = TlvEncoder::new()
            .add_state(1)
            .add(TlvType::PublicKey, our_public.as_bytes())
            .build();
        let (status, m2) = self
            .request("POST", "/pair-verify", "application/pairing+tlv8", &m1)
            .await;
        assert_eq!(status, 200);

        let m2 = TlvDecoder::decode(&m2).unwrap();
        if let Some(error) = m2.get_u8(TlvType::Error) {
            return Err(format!("M2 error {error}"));
        }
        let accessory_public: [u8; 32] = m2
            .get_required(TlvType::PublicKey)
            .unwrap()
            .try_into()
            .unwrap();
        let sealed = m2.get_required(TlvType::EncryptedData).unwrap();

        let shared = secret.diffie_hellman(&PublicKey::from(accessory_public));
        let session_key = derive_key32(
            b"Pair-Verify-Encrypt-Salt",
            shared.as_bytes(),
            b"Pair-Verify-Encrypt-Info",
        )
        .unwrap();
        let cipher = ChaCha20Poly1305Cipher::new(&session_key).unwrap();
        let opened = cipher
            .decrypt(&Nonce::from_label(b"PV-Msg02"), sealed)
            .map_err(|e| e.to_string())?;

        let inner = TlvDecoder::decode(&opened).unwrap();
        let accessory_id = inner.get_required(TlvType::Identifier).unwrap();
        let accessory_sig = inner.get_required(TlvType::Signature).unwrap();

        let mut info = Vec::new();
        info.extend_from_slice(&accessory_public);
        info.extend_from_slice(accessory_id);
        info.extend_from_slice(our_public.as_bytes());
        Ed25519PublicKey::from_bytes(accessory_ltpk)
            .unwrap()
            .verify(&info, &Ed25519Signature::from_bytes(accessory_sig).unwrap())
            .map_err(|_| "accessory signature invalid".to_string())?;

        let mut info = Vec::new();
        info.extend_from_slice(our_public.as_bytes());
        info.extend_from_slice(CONTROLLER_ID);
        info.extend_from_slice(&accessory_public);
        let signature = self.signing_key.sign(&info);

        let inner = TlvEncoder::new()
            .add(TlvType::Identifier, CONTROLLER_ID)
            .add(TlvType::Signature, &signature.to_bytes())
            .build();
        let sealed = cipher
            .encrypt(&Nonce::from_label(b"PV-Msg03"), &inner)
            .unwrap();

        let m3 = TlvEncoder::new()
            .add_state(3)
            .add(TlvType::EncryptedData, &sealed)
            .build();
        let (status, m4) = self
            .request("POST", "/pair-verify", "application/pairing+tlv8", &m3)
            .await;
        assert_eq!(status, 200);

        let m4 = TlvDecoder::decode(&m4).unwrap();
        if let Some(error) = m4.get_u8(TlvType::Error) {
            return Err(format!("M4 error {error}"));
        }

        // Mirror of the accessory's key assignment.
        let tx_key = derive_key32(
            b"Control-Salt",
            shared.as_bytes(),
            b"Control-Write-Encryption-Key",
        )
        .unwrap();
        let rx_key = derive_key32(
            b"Control-Salt",
            shared.as_bytes(),
            b"Control-Read-Encryption-Key",
        )
        .unwrap();
        self.session = Some(SecureSession::new(&TransportKeys { tx_key, rx_key }));
        Ok(())
    }

    /// PUT one characteristic value over the secured session.
    pub async fn put_value(&mut self, aid: u32, iid: u32, value: serde_json::Value) -> u16 {
        let body = serde_json::json!({
            "characteristics": [{ "aid": aid, "iid": iid, "value": value }]
        })
        .to_string()
        .into_bytes();
        let (status, _) = self
            .request("PUT", "/characteristics", "application/hap+json", &body)
            .await;
        status
    }

    /// Subscribe to a characteristic's events.
    pub async fn subscribe(&mut self, aid: u32, iid: u32) -> u16 {
        let body = serde_json::json!({
            "characteristics": [{ "aid": aid, "iid": iid, "ev": true }]
        })
        .to_string()
        .into_bytes();
        let (status, _) = self
            .request("PUT", "/characteristics", "application/hap+json", &body)
            .await;
        status
    }
}

/// Convenience: boot, pair, verify, return a secured controller.
pub async fn paired_controller(port: u16) -> Controller {
    let mut controller = Controller::connect(port).await;
    controller.pair_setup(SETUP_CODE).await.unwrap();
    let ltpk = controller.accessory_ltpk.clone().unwrap();
    controller.pair_verify(&ltpk).await.unwrap();
    controller
}

/// A further verified connection reusing an enrolled controller's
/// identity (controllers hold several connections in practice).
pub async fn additional_session(port: u16, primary: &Controller) -> Controller {
    let mut controller = Controller::connect(port).await;
    controller.signing_key =
        Ed25519KeyPair::from_bytes(&primary.signing_key.secret_bytes()).unwrap();
    let ltpk = primary.accessory_ltpk.clone().unwrap();
    controller.pair_verify(&ltpk).await.unwrap();
    controller
}
