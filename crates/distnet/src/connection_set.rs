//! Waiting on many connections.
//!
//! The `ConnectionSet` is the single place the runtime blocks on I/O
//! readiness. Each added connection gets a packet pump that reads exactly
//! one framed packet at a time and forwards it on the set's event channel;
//! `select` pops the next event. The channel also serves as the interrupt
//! path: connections added while a `select` is in flight start delivering
//! without breaking it.
//!
//! A pump reads its connection sequentially and the channel preserves
//! per-sender order, so packets from one peer reach the receiver in send
//! order.

use crate::connection::{Connection, ConnectionRef, Listener, ListenerRef};
use crate::error::NetError;
use crate::packet::{PacketHeader, RawPacket, HEADER_SIZE};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// The next thing that happened across the set.
pub enum SetEvent<O> {
    /// A listener produced a new connection.
    Connect(ConnectionRef),
    /// A complete packet arrived.
    Data { connection: ConnectionRef, owner: Option<O>, packet: RawPacket },
    /// A connection closed or failed; the pump has stopped.
    Disconnect { connection: ConnectionRef, owner: Option<O> },
    /// `select` hit its timeout.
    Timeout,
    /// A framing error on a connection; a `Disconnect` for it follows.
    Error { connection: ConnectionRef, error: NetError },
}

struct PumpEntry<O> {
    owner: Arc<RwLock<Option<O>>>,
    task: JoinHandle<()>,
}

struct Shared<O> {
    pumps: Mutex<HashMap<usize, PumpEntry<O>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle for mutating the set from any task.
pub struct SetHandle<O> {
    tx: mpsc::UnboundedSender<SetEvent<O>>,
    shared: Arc<Shared<O>>,
}

impl<O> Clone for SetHandle<O> {
    fn clone(&self) -> Self {
        SetHandle { tx: self.tx.clone(), shared: Arc::clone(&self.shared) }
    }
}

fn connection_key(connection: &ConnectionRef) -> usize {
    Arc::as_ptr(connection) as *const () as usize
}

impl<O: Clone + Send + Sync + 'static> SetHandle<O> {
    /// Add a connection and start its packet pump. The owner may be bound
    /// later via [`SetHandle::set_owner`], e.g. once a handshake resolves
    /// the peer.
    pub fn add_connection(&self, connection: ConnectionRef, owner: Option<O>) {
        let owner = Arc::new(RwLock::new(owner));
        let task = tokio::spawn(pump(connection.clone(), Arc::clone(&owner), self.tx.clone()));
        let mut pumps = self.shared.pumps.lock();
        pumps.insert(connection_key(&connection), PumpEntry { owner, task });
    }

    /// Bind or replace the owner of a connection.
    pub fn set_owner(&self, connection: &ConnectionRef, owner: O) {
        let pumps = self.shared.pumps.lock();
        if let Some(entry) = pumps.get(&connection_key(connection)) {
            *entry.owner.write() = Some(owner);
        }
    }

    /// Stop pumping a connection and forget it.
    pub fn remove_connection(&self, connection: &ConnectionRef) {
        let mut pumps = self.shared.pumps.lock();
        if let Some(entry) = pumps.remove(&connection_key(connection)) {
            entry.task.abort();
        }
    }

    /// Add a listener; accepted connections surface as `Connect` events.
    pub fn add_listener(&self, listener: ListenerRef) {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(connection) => {
                        if tx.send(SetEvent::Connect(connection)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("listener {} closed: {e}", listener.description());
                        return;
                    }
                }
            }
        });
        self.shared.listeners.lock().push(task);
    }

    /// Stop all pumps and listeners.
    pub fn shutdown(&self) {
        let mut pumps = self.shared.pumps.lock();
        for (_, entry) in pumps.drain() {
            entry.task.abort();
        }
        for task in self.shared.listeners.lock().drain(..) {
            task.abort();
        }
    }
}

async fn pump<O: Clone + Send + Sync + 'static>(
    connection: ConnectionRef,
    owner: Arc<RwLock<Option<O>>>,
    tx: mpsc::UnboundedSender<SetEvent<O>>,
) {
    loop {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if let Err(e) = connection.recv_exact(&mut header_bytes).await {
            if !e.is_connection_closed() {
                warn!("read error on {}: {e}", connection.description());
            }
            let owner = owner.read().clone();
            tx.send(SetEvent::Disconnect { connection, owner }).ok();
            return;
        }

        let header = match PacketHeader::decode(&header_bytes) {
            Ok(header) => header,
            Err(error) => {
                // A framing error poisons the stream; drop the connection.
                tx.send(SetEvent::Error { connection: connection.clone(), error }).ok();
                let owner = owner.read().clone();
                tx.send(SetEvent::Disconnect { connection, owner }).ok();
                return;
            }
        };

        let mut payload = vec![0u8; header.payload_len()];
        if let Err(e) = connection.recv_exact(&mut payload).await {
            // Peer lost mid-frame.
            if !e.is_connection_closed() {
                warn!("read error on {}: {e}", connection.description());
            }
            let owner = owner.read().clone();
            tx.send(SetEvent::Disconnect { connection, owner }).ok();
            return;
        }

        trace!(
            "packet datatype {} command {} ({} bytes) from {}",
            header.datatype,
            header.command,
            header.size,
            connection.description()
        );

        let event = SetEvent::Data {
            connection: connection.clone(),
            owner: owner.read().clone(),
            packet: RawPacket { header, payload: Bytes::from(payload) },
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}

/// The receiving side; owned by the one task allowed to block on I/O.
pub struct ConnectionSet<O> {
    rx: mpsc::UnboundedReceiver<SetEvent<O>>,
    handle: SetHandle<O>,
}

impl<O: Clone + Send + Sync + 'static> ConnectionSet<O> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pumps: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        });
        ConnectionSet { rx, handle: SetHandle { tx, shared } }
    }

    pub fn handle(&self) -> SetHandle<O> {
        self.handle.clone()
    }

    /// Wait for the next event. `None` blocks indefinitely.
    pub async fn select(&mut self, timeout: Option<Duration>) -> SetEvent<O> {
        match timeout {
            None => self.rx.recv().await.unwrap_or(SetEvent::Timeout),
            Some(timeout) => match tokio::time::timeout(timeout, self.rx.recv()).await {
                Ok(event) => event.unwrap_or(SetEvent::Timeout),
                Err(_) => SetEvent::Timeout,
            },
        }
    }
}

impl<O: Clone + Send + Sync + 'static> Default for ConnectionSet<O> {
    fn default() -> Self {
        Self::new()
    }
}
