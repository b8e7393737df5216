//! # hap-server
//!
//! A pure Rust server-side implementation of the `HomeKit` Accessory
//! Protocol (HAP over IP).
//!
//! ## Features
//!
//! - Accessory attribute database with JSON projection
//! - Pair-Setup (SRP-6a) and Pair-Verify (X25519 + Ed25519) state machines
//! - Encrypted sessions (framed ChaCha20-Poly1305)
//! - Event notifications to subscribed controllers
//! - mDNS `_hap._tcp` advertisement
//!
//! ## Example
//!
//! ```rust,no_run
//! use hap_server::accessory::{catalog, Accessory, Database};
//! use hap_server::storage::{provision_setup_code, MemoryStore};
//! use hap_server::{HapServer, ServerConfig};
//!
//! # async fn example() -> Result<(), hap_server::HapError> {
//! let mut db = Database::new();
//! let mut bridge = Accessory::new();
//! bridge.add_service(catalog::accessory_information("Bridge", "Acme", "B1", "001", "1.0"));
//! bridge.add_service(catalog::protocol_information());
//! db.add_accessory(bridge);
//!
//! let mut store = Box::new(MemoryStore::new());
//! provision_setup_code(store.as_mut(), "46637726").await?;
//!
//! let server = HapServer::new(ServerConfig::default(), db, store).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Accessory attribute database
pub mod accessory;
/// Monotonic clock abstraction
pub mod clock;
/// mDNS service advertisement
pub mod discovery;
/// Error types
pub mod error;
/// Wire protocol building blocks (TLV8, crypto, HTTP, pairing)
pub mod protocol;
/// The HAP server and its event loop
pub mod server;
/// Persistent blob store and accessory identity
pub mod storage;
/// Encrypted session transport
pub mod transport;

pub use accessory::{Accessory, Characteristic, Database, Format, Service, Value};
pub use error::HapError;
pub use server::{Category, HapServer, ServerConfig, ServerEvent, ServerHandle};
pub use storage::{provision_setup_code, FileStore, MemoryStore, Store};
