//! The HAP accessory server
//!
//! One tokio task owns all protocol state ([`core::ServerCore`]); reader
//! tasks forward socket bytes into it over a channel and it writes
//! replies back through each slot's write half. Application code talks
//! to the running server through a [`ServerHandle`].

mod connection;
mod core;
mod events;
mod pool;
mod router;

#[cfg(test)]
mod tests;

use crate::accessory::{Database, Value};
use crate::clock::{Clock, MonotonicClock};
use crate::discovery::MdnsAdvertiser;
use crate::error::HapError;
use crate::storage::Store;
use self::core::{Action, ServerCore};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Accessory category codes advertised in the `ci` TXT record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Anything without a better fit
    Other,
    /// Bridge exposing further accessories
    Bridge,
    /// Fan
    Fan,
    /// Garage door opener
    GarageDoorOpener,
    /// Light fixture
    Lighting,
    /// Lock
    Lock,
    /// Power outlet
    Outlet,
    /// Switch
    Switch,
    /// Thermostat
    Thermostat,
    /// Sensor
    Sensor,
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Display name, also the mDNS instance name
    pub name: String,
    /// Model string for the `md` TXT record
    pub model: String,
    /// Accessory category
    pub category: Category,
    /// TCP port; HAP uses 80, tests pass 0 for an ephemeral port
    pub port: u16,
    /// Concurrent controller connections; HAP requires at least 8
    pub max_connections: usize,
    /// Whether to advertise over mDNS
    pub advertise: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "Rust Accessory".to_string(),
            model: "HAP-Server-1".to_string(),
            category: Category::Other,
            port: 80,
            max_connections: 8,
            advertise: true,
        }
    }
}

/// Events the server broadcasts to interested application code.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The listener is bound and serving
    Started {
        /// Actual bound port
        port: u16,
    },
    /// A controller connection landed in a slot
    ClientConnected {
        /// Slot index
        slot: usize,
        /// Peer address
        remote: SocketAddr,
    },
    /// A slot's connection ended (close, error, or eviction)
    ClientDisconnected {
        /// Slot index
        slot: usize,
    },
    /// A connection completed Pair-Verify
    SessionVerified {
        /// Slot index
        slot: usize,
    },
    /// Pair-Setup enrolled an admin controller
    Paired,
    /// The last admin was removed; the device is unpaired
    Unpaired,
    /// A controller asked the accessory to identify itself
    IdentifyRequested,
    /// A characteristic value changed (controller write or `set_value`)
    CharacteristicChanged {
        /// Owning accessory
        aid: u32,
        /// Characteristic instance
        iid: u32,
    },
    /// The server shut down
    Stopped,
}

enum Command {
    SetValue { aid: u32, iid: u32, value: Value },
    Shutdown,
}

/// Cloneable handle for talking to a running server.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<Command>,
}

impl ServerHandle {
    /// Update a characteristic from the application side, notifying
    /// subscribed controllers.
    pub async fn set_value(&self, aid: u32, iid: u32, value: Value) {
        let _ = self.tx.send(Command::SetValue { aid, iid, value }).await;
    }

    /// Stop the server.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

enum NetMsg {
    Data {
        slot: usize,
        generation: u64,
        bytes: Vec<u8>,
    },
    Closed {
        slot: usize,
        generation: u64,
    },
}

struct NetSlot {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    generation: u64,
}

/// The HAP accessory server.
pub struct HapServer {
    core: ServerCore,
    event_tx: broadcast::Sender<ServerEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
}

impl HapServer {
    /// Validate the database, load (or create) the accessory identity,
    /// and prepare a server.
    ///
    /// # Errors
    ///
    /// Returns [`HapError::Config`] listing every database violation, or
    /// a storage error.
    pub async fn new(
        config: ServerConfig,
        db: Database,
        store: Box<dyn Store>,
    ) -> Result<Self, HapError> {
        Self::with_clock(config, db, store, Box::new(MonotonicClock::new())).await
    }

    /// [`HapServer::new`] with an explicit clock (used by tests).
    ///
    /// # Errors
    ///
    /// Same as [`HapServer::new`].
    pub async fn with_clock(
        config: ServerConfig,
        db: Database,
        store: Box<dyn Store>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, HapError> {
        let core = ServerCore::new(config, db, store, clock).await?;
        let (event_tx, _) = broadcast::channel(64);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        Ok(Self {
            core,
            event_tx,
            cmd_tx,
            cmd_rx,
        })
    }

    /// Subscribe to server events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// A handle for `set_value` and shutdown.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    /// Bind, advertise, and serve until [`ServerHandle::shutdown`].
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind or the advertiser
    /// fails to start.
    pub async fn run(mut self) -> Result<(), HapError> {
        let listener = TcpListener::bind(("0.0.0.0", self.core.config.port)).await?;
        let port = listener.local_addr()?.port();

        let advertiser = if self.core.config.advertise {
            Some(MdnsAdvertiser::start(
                &self.core.config.name,
                port,
                &self.core.txt_records(),
            )?)
        } else {
            None
        };

        tracing::info!(name = %self.core.config.name, port, "HAP server running");
        let _ = self.event_tx.send(ServerEvent::Started { port });

        let capacity = self.core.pool.capacity();
        let (msg_tx, mut msg_rx) = mpsc::channel::<NetMsg>(64);
        let mut net_slots: Vec<Option<NetSlot>> = (0..capacity).map(|_| None).collect();
        let mut generations: Vec<u64> = vec![0; capacity];

        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            let (slot, actions) = self.core.accept(remote);
                            apply_actions(
                                actions,
                                &mut self.core,
                                &mut net_slots,
                                &self.event_tx,
                                advertiser.as_ref(),
                            ).await;

                            generations[slot] += 1;
                            let generation = generations[slot];
                            let (read_half, writer) = stream.into_split();
                            let reader = tokio::spawn(read_loop(
                                read_half,
                                slot,
                                generation,
                                msg_tx.clone(),
                            ));
                            net_slots[slot] = Some(NetSlot { writer, reader, generation });
                        }
                        Err(error) => tracing::warn!(%error, "accept failed"),
                    }
                }

                Some(msg) = msg_rx.recv() => {
                    match msg {
                        NetMsg::Data { slot, generation, bytes }
                            if net_slots[slot].as_ref().is_some_and(|n| n.generation == generation) =>
                        {
                            let actions = self.core.process_data(slot, &bytes).await;
                            apply_actions(
                                actions,
                                &mut self.core,
                                &mut net_slots,
                                &self.event_tx,
                                advertiser.as_ref(),
                            ).await;
                        }
                        NetMsg::Closed { slot, generation }
                            if net_slots[slot].as_ref().is_some_and(|n| n.generation == generation) =>
                        {
                            self.core.connection_closed(slot);
                            net_slots[slot] = None;
                            let _ = self.event_tx.send(ServerEvent::ClientDisconnected { slot });
                        }
                        _ => {} // stale message from an evicted connection
                    }
                }

                Some(command) = self.cmd_rx.recv() => {
                    match command {
                        Command::SetValue { aid, iid, value } => {
                            let actions = self.core.set_value(aid, iid, value);
                            apply_actions(
                                actions,
                                &mut self.core,
                                &mut net_slots,
                                &self.event_tx,
                                advertiser.as_ref(),
                            ).await;
                        }
                        Command::Shutdown => break,
                    }
                }

                _ = tick.tick() => {
                    let actions = self.core.poll();
                    apply_actions(
                        actions,
                        &mut self.core,
                        &mut net_slots,
                        &self.event_tx,
                        advertiser.as_ref(),
                    ).await;
                }
            }
        }

        for net_slot in net_slots.into_iter().flatten() {
            net_slot.reader.abort();
        }
        if let Some(advertiser) = advertiser {
            advertiser.shutdown();
        }
        tracing::info!("HAP server stopped");
        let _ = self.event_tx.send(ServerEvent::Stopped);
        Ok(())
    }
}

/// Pump one connection's socket into the event loop.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    slot: usize,
    generation: u64,
    tx: mpsc::Sender<NetMsg>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = tx.send(NetMsg::Closed { slot, generation }).await;
                break;
            }
            Ok(n) => {
                let msg = NetMsg::Data {
                    slot,
                    generation,
                    bytes: buf[..n].to_vec(),
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Apply the core's side effects: socket writes, closes, TXT refreshes,
/// event broadcasts.
async fn apply_actions(
    actions: Vec<Action>,
    core: &mut ServerCore,
    net_slots: &mut [Option<NetSlot>],
    event_tx: &broadcast::Sender<ServerEvent>,
    advertiser: Option<&MdnsAdvertiser>,
) {
    for action in actions {
        match action {
            Action::Send { slot, bytes } => {
                let Some(net_slot) = net_slots[slot].as_mut() else {
                    continue;
                };
                if net_slot.writer.write_all(&bytes).await.is_err() {
                    tracing::debug!(slot, "write failed, dropping connection");
                    core.connection_closed(slot);
                    if let Some(dead) = net_slots[slot].take() {
                        dead.reader.abort();
                    }
                    let _ = event_tx.send(ServerEvent::ClientDisconnected { slot });
                }
            }
            Action::Close { slot } => {
                if let Some(net_slot) = net_slots[slot].take() {
                    net_slot.reader.abort();
                }
            }
            Action::RefreshTxt => {
                if let Some(advertiser) = advertiser {
                    if let Err(error) = advertiser.update(&core.txt_records()) {
                        tracing::warn!(%error, "TXT refresh failed");
                    }
                }
            }
            Action::Emit(event) => {
                let _ = event_tx.send(event);
            }
        }
    }
}
