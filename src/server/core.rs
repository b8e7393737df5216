//! The event-loop-owned server state
//!
//! `ServerCore` owns the attribute database, identity, controller table,
//! and every connection slot's protocol state. It performs no I/O: the
//! tokio front feeds it accepted connections and socket bytes, and applies
//! the [`Action`]s it returns. All mutation happens on the event loop.

use super::connection::Connection;
use super::pool::{ConnectionPool, SlotAssignment};
use super::{Category, ServerConfig, ServerEvent};
use crate::accessory::{Database, Value};
use crate::clock::Clock;
use crate::discovery::TxtRecords;
use crate::error::HapError;
use crate::storage::{
    keys, AccessoryIdentity, ControllerTable, SetupVerifier, Store, StorageError,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Side effects the front must apply, in order.
pub(crate) enum Action {
    /// Write wire bytes to a slot's socket
    Send {
        /// Target slot
        slot: usize,
        /// Wire bytes (already encrypted when the session is secured)
        bytes: Vec<u8>,
    },
    /// Force-close a slot's socket (state is already released)
    Close {
        /// Target slot
        slot: usize,
    },
    /// Push fresh TXT records to the advertiser
    RefreshTxt,
    /// Broadcast a server event to subscribers
    Emit(ServerEvent),
}

#[derive(Serialize, Deserialize)]
struct ConfigRecord {
    config_number: u32,
    hash: Vec<u8>,
}

pub(crate) struct ServerCore {
    pub(crate) config: ServerConfig,
    pub(crate) db: Database,
    pub(crate) identity: AccessoryIdentity,
    pub(crate) controllers: ControllerTable,
    pub(crate) verifier: Option<SetupVerifier>,
    pub(crate) store: Box<dyn Store>,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) slots: Vec<Option<Connection>>,
    pub(crate) pool: ConnectionPool,
    /// Timed-write correlation ids and their expiry deadlines
    pub(crate) timed_writes: HashMap<u64, u64>,
    /// Slot owning the single in-flight Pair-Setup exchange
    pub(crate) setup_slot: Option<usize>,
    pub(crate) config_number: u32,
}

impl ServerCore {
    pub(crate) async fn new(
        config: ServerConfig,
        mut db: Database,
        mut store: Box<dyn Store>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, HapError> {
        let errors = db.validate();
        if !errors.is_empty() {
            for error in &errors {
                tracing::error!(%error, "configuration error");
            }
            return Err(HapError::Config(errors));
        }

        let capacity = config.max_connections.max(8);
        db.prepare(capacity);

        let identity = AccessoryIdentity::load_or_create(store.as_mut()).await?;
        let controllers = ControllerTable::load(store.as_ref()).await?;
        let verifier = SetupVerifier::load(store.as_ref()).await?;
        if verifier.is_none() {
            tracing::warn!("no setup code provisioned; pair-setup will be refused");
        }

        let config_number = Self::refresh_config_number(&db, store.as_mut()).await?;

        let slots = (0..capacity).map(|_| None).collect();
        Ok(Self {
            config,
            db,
            identity,
            controllers,
            verifier,
            store,
            clock,
            slots,
            pool: ConnectionPool::new(capacity),
            timed_writes: HashMap::new(),
            setup_slot: None,
            config_number,
        })
    }

    /// Compare the database hash against the persisted one and bump the
    /// configuration number when it changed.
    async fn refresh_config_number(
        db: &Database,
        store: &mut dyn Store,
    ) -> Result<u32, HapError> {
        let hash = db.config_hash().to_vec();

        let previous: Option<ConfigRecord> = match store.get_blob(keys::HAPHASH).await {
            Some(bytes) => serde_json::from_slice(&bytes).ok(),
            None => None,
        };

        let config_number = match &previous {
            Some(record) if record.hash == hash => record.config_number,
            Some(record) => {
                let bumped = record.config_number.wrapping_add(1).max(1);
                tracing::info!(config_number = bumped, "attribute database changed");
                bumped
            }
            None => 1,
        };

        let dirty = previous.map_or(true, |record| record.config_number != config_number);
        if dirty {
            let record = ConfigRecord {
                config_number,
                hash,
            };
            let bytes = serde_json::to_vec(&record)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            store.set_blob(keys::HAPHASH, bytes).await?;
            store.commit().await?;
        }

        Ok(config_number)
    }

    pub(crate) fn txt_records(&self) -> TxtRecords {
        TxtRecords {
            config_number: self.config_number,
            model: self.config.model.clone(),
            category: self.config.category.code(),
            device_id: self.identity.device_id().to_string(),
            paired: self.controllers.is_paired(),
        }
    }

    /// Place an accepted connection into a slot, evicting if necessary.
    pub(crate) fn accept(&mut self, remote: SocketAddr) -> (usize, Vec<Action>) {
        let mut actions = Vec::new();

        let slot = match self.pool.assign() {
            SlotAssignment::Fresh(slot) => slot,
            SlotAssignment::Evicted(slot) => {
                tracing::info!(slot, "connection table full, evicting");
                self.release_slot(slot);
                self.pool.release(slot);
                // Claim it again for the new connection.
                let SlotAssignment::Fresh(reused) = self.pool.assign() else {
                    unreachable!("slot was just released");
                };
                actions.push(Action::Close { slot });
                actions.push(Action::Emit(ServerEvent::ClientDisconnected { slot }));
                reused
            }
        };

        let now = self.clock.now_ms();
        self.slots[slot] = Some(Connection::new(remote, now));
        self.db.clear_notify(slot);

        tracing::debug!(slot, %remote, "client connected");
        actions.push(Action::Emit(ServerEvent::ClientConnected { slot, remote }));
        (slot, actions)
    }

    /// The transport saw EOF or an error on a slot's socket.
    pub(crate) fn connection_closed(&mut self, slot: usize) {
        if self.slots.get(slot).is_some_and(Option::is_some) {
            tracing::debug!(slot, "client disconnected");
            self.release_slot(slot);
            self.pool.release(slot);
        }
    }

    /// Drop all protocol state a slot holds. The pool entry is released
    /// separately so eviction can reuse the slot atomically.
    fn release_slot(&mut self, slot: usize) {
        self.slots[slot] = None;
        self.db.clear_notify(slot);
        if self.setup_slot == Some(slot) {
            self.setup_slot = None;
        }
    }

    /// Feed socket bytes into a slot: decrypt if the session is secured,
    /// then parse and route every complete request.
    pub(crate) async fn process_data(&mut self, slot: usize, data: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();

        {
            let Some(conn) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
                return actions;
            };
            conn.last_active_ms = self.clock.now_ms();

            if let Some(secure) = conn.secure.as_mut() {
                conn.crypt_buf.extend_from_slice(data);
                match secure.decrypt(&mut conn.crypt_buf) {
                    Ok(plaintext) => conn.http.feed(&plaintext),
                    Err(_) => {
                        tracing::warn!(slot, "session decrypt failed, closing");
                        self.release_slot(slot);
                        self.pool.release(slot);
                        actions.push(Action::Close { slot });
                        actions.push(Action::Emit(ServerEvent::ClientDisconnected { slot }));
                        return actions;
                    }
                }
            } else {
                conn.http.feed(data);
            }
        }

        loop {
            let decoded = {
                let Some(conn) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
                    break;
                };
                conn.http.decode()
            };

            match decoded {
                Ok(Some(request)) => {
                    let closed = self.handle_request(slot, &request, &mut actions).await;
                    if closed {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(slot, %error, "malformed request");
                    let verified = self.slots[slot]
                        .as_ref()
                        .is_some_and(Connection::is_verified);
                    if !verified {
                        let reply = crate::protocol::http::ResponseBuilder::new(
                            crate::protocol::http::StatusCode::BAD_REQUEST,
                        )
                        .encode();
                        actions.push(Action::Send { slot, bytes: reply });
                    }
                    self.release_slot(slot);
                    self.pool.release(slot);
                    actions.push(Action::Close { slot });
                    actions.push(Action::Emit(ServerEvent::ClientDisconnected { slot }));
                    break;
                }
            }
        }

        actions
    }

    /// Route one request and translate its outcome into actions.
    /// Returns true when the slot was closed.
    async fn handle_request(
        &mut self,
        slot: usize,
        request: &crate::protocol::http::HttpRequest,
        actions: &mut Vec<Action>,
    ) -> bool {
        let outcome = self.route(slot, request).await;

        // Encrypt under the session that was active when the request
        // arrived; Pair-Verify M4 installs its keys after the reply.
        let wire = {
            let Some(conn) = self.slots.get_mut(slot).and_then(Option::as_mut) else {
                return true;
            };
            match conn.secure.as_mut() {
                Some(secure) => match secure.encrypt(&outcome.response) {
                    Ok(wire) => wire,
                    Err(_) => {
                        self.release_slot(slot);
                        self.pool.release(slot);
                        actions.push(Action::Close { slot });
                        return true;
                    }
                },
                None => outcome.response,
            }
        };
        actions.push(Action::Send { slot, bytes: wire });

        if let Some((controller_id, keys)) = outcome.install_keys {
            if let Some(conn) = self.slots.get_mut(slot).and_then(Option::as_mut) {
                conn.secure = Some(crate::transport::SecureSession::new(&keys));
                conn.verified = Some(controller_id);
            }
            actions.push(Action::Emit(ServerEvent::SessionVerified { slot }));
        }

        if !outcome.notify.is_empty() {
            let events = self.notify_subscribers(&outcome.notify, Some(slot));
            actions.extend(events);
        }

        for event in outcome.emit {
            actions.push(Action::Emit(event));
        }

        if outcome.txt_refresh {
            actions.push(Action::RefreshTxt);
        }

        if outcome.close_all {
            for victim in 0..self.slots.len() {
                if self.slots[victim].is_some() {
                    self.release_slot(victim);
                    self.pool.release(victim);
                    actions.push(Action::Close { slot: victim });
                }
            }
            return true;
        }

        if outcome.close {
            self.release_slot(slot);
            self.pool.release(slot);
            actions.push(Action::Close { slot });
            return true;
        }

        false
    }

    /// Application-side value change (`setVal`).
    pub(crate) fn set_value(&mut self, aid: u32, iid: u32, value: Value) -> Vec<Action> {
        let now = self.clock.now_ms();
        let Some(characteristic) = self.db.find_mut(aid, iid) else {
            tracing::warn!(aid, iid, "set_value on unknown characteristic");
            return Vec::new();
        };
        if !characteristic.set_value(value, now) {
            tracing::warn!(aid, iid, "set_value format mismatch");
            return Vec::new();
        }

        let mut actions = self.notify_subscribers(&[(aid, iid)], None);
        actions.push(Action::Emit(ServerEvent::CharacteristicChanged { aid, iid }));
        actions
    }

    /// One event-loop tick: run service poll callbacks and sweep expired
    /// timed writes.
    pub(crate) fn poll(&mut self) -> Vec<Action> {
        let now = self.clock.now_ms();
        self.timed_writes.retain(|_, deadline| *deadline >= now);

        let mut changed = Vec::new();
        for acc_index in 0..self.db.accessories().len() {
            let svc_count = self.db.accessories()[acc_index].services().len();
            for svc_index in 0..svc_count {
                changed.extend(self.poll_service(acc_index, svc_index, now));
            }
        }

        if changed.is_empty() {
            return Vec::new();
        }

        let mut actions = self.notify_subscribers(&changed, None);
        for (aid, iid) in changed {
            actions.push(Action::Emit(ServerEvent::CharacteristicChanged { aid, iid }));
        }
        actions
    }

    /// Run one service's poll callback and apply the values it pushes.
    pub(crate) fn poll_service(
        &mut self,
        acc_index: usize,
        svc_index: usize,
        now: u64,
    ) -> Vec<(u32, u32)> {
        let accessory = self.db.accessory_mut(acc_index);
        let aid = accessory.aid();
        let service = &mut accessory.services[svc_index];

        let Some(mut handler) = service.handler.take() else {
            return Vec::new();
        };
        let pushed = handler.poll(now);
        self.db.accessory_mut(acc_index).services[svc_index].handler = Some(handler);

        let mut changed = Vec::new();
        for (hap_type, value) in pushed {
            let Some(iid) = self.db.accessories()[acc_index].services()[svc_index]
                .characteristic(&hap_type)
                .map(crate::accessory::Characteristic::iid)
            else {
                tracing::warn!(aid, hap_type, "poll pushed unknown characteristic type");
                continue;
            };
            if self
                .db
                .find_mut(aid, iid)
                .is_some_and(|c| c.set_value(value, now))
            {
                changed.push((aid, iid));
            }
        }
        changed
    }

    /// Build encrypted EVENT frames for every subscribed slot except the
    /// originator. Changes coalesce into one frame per slot.
    pub(crate) fn notify_subscribers(
        &mut self,
        changed: &[(u32, u32)],
        origin: Option<usize>,
    ) -> Vec<Action> {
        let mut unique: Vec<(u32, u32)> = Vec::new();
        for entry in changed {
            if !unique.contains(entry) {
                unique.push(*entry);
            }
        }

        let mut actions = Vec::new();
        for slot in 0..self.slots.len() {
            if origin == Some(slot) {
                continue;
            }
            if !self.slots[slot].as_ref().is_some_and(Connection::is_verified) {
                continue;
            }

            let objects: Vec<serde_json::Value> = unique
                .iter()
                .filter_map(|&(aid, iid)| {
                    let characteristic = self.db.find(aid, iid)?;
                    characteristic.subscribed(slot).then(|| {
                        json!({
                            "aid": aid,
                            "iid": iid,
                            "value": characteristic.value().to_json(),
                        })
                    })
                })
                .collect();

            if objects.is_empty() {
                continue;
            }

            let frame = super::events::encode_event(&objects);
            let Some(conn) = self.slots[slot].as_mut() else {
                continue;
            };
            let Some(secure) = conn.secure.as_mut() else {
                continue;
            };
            match secure.encrypt(&frame) {
                Ok(wire) => actions.push(Action::Send { slot, bytes: wire }),
                Err(_) => tracing::warn!(slot, "failed to seal event frame"),
            }
        }
        actions
    }
}

/// Result of routing one request, applied by [`ServerCore::handle_request`].
pub(crate) struct RouteOutcome {
    pub(crate) response: Vec<u8>,
    pub(crate) close: bool,
    pub(crate) close_all: bool,
    pub(crate) install_keys: Option<(Vec<u8>, crate::protocol::pairing::TransportKeys)>,
    pub(crate) notify: Vec<(u32, u32)>,
    pub(crate) txt_refresh: bool,
    pub(crate) emit: Vec<ServerEvent>,
}

impl RouteOutcome {
    pub(crate) fn respond(response: Vec<u8>) -> Self {
        Self {
            response,
            close: false,
            close_all: false,
            install_keys: None,
            notify: Vec::new(),
            txt_refresh: false,
            emit: Vec::new(),
        }
    }
}

impl Category {
    /// Numeric category code for the `ci` TXT record (HAP Section 13).
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Category::Other => 1,
            Category::Bridge => 2,
            Category::Fan => 3,
            Category::GarageDoorOpener => 4,
            Category::Lighting => 5,
            Category::Lock => 6,
            Category::Outlet => 7,
            Category::Switch => 8,
            Category::Thermostat => 9,
            Category::Sensor => 10,
        }
    }
}
