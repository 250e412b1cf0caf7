//! The connection abstraction and its transports.
//!
//! A connection is a bidirectional reliable ordered byte stream. Writers are
//! serialized by an internal per-connection send lock, and a single `send`
//! call is delivered atomically with respect to other senders on multicast
//! transports, so callers can frame packets by issuing one send per packet.
//!
//! The trait stays open: new transports (RDMA, real wire multicast) plug in
//! without touching the layers above.

mod description;
mod group;
mod pipe;
mod tcp;

pub use description::{ConnectionDescription, ConnectionType};
pub use group::GroupConnection;
pub use pipe::PipeConnection;
pub use tcp::{TcpConnection, TcpListenerConnection};

use crate::error::{NetError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Closed = 0,
    Connecting = 1,
    Connected = 2,
    Listening = 3,
    Closing = 4,
}

/// Atomic [`ConnectionState`] holder shared by the transports.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Acquire) {
            0 => ConnectionState::Closed,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Listening,
            _ => ConnectionState::Closing,
        }
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// A reliable, ordered, bidirectional byte stream.
#[async_trait]
pub trait Connection: Send + Sync {
    fn description(&self) -> &ConnectionDescription;

    fn state(&self) -> ConnectionState;

    /// The stable group identifier for multicast transports, used by
    /// receivers to deduplicate across unicast and multicast paths.
    fn multicast_group(&self) -> Option<&str> {
        None
    }

    /// Reliable ordered send of the whole buffer. Fails only with
    /// [`NetError::ConnectionClosed`] once the peer is gone.
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Block until `buf` is completely filled or the connection closes.
    async fn recv_exact(&self, buf: &mut [u8]) -> Result<()>;

    async fn close(&self);
}

pub type ConnectionRef = Arc<dyn Connection>;

/// A bound listener producing connected connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// The bound description; the port is the actual one after binding.
    fn description(&self) -> &ConnectionDescription;

    async fn accept(&self) -> Result<ConnectionRef>;

    async fn close(&self);
}

pub type ListenerRef = Arc<dyn Listener>;

/// Establish an outgoing connection for the given description.
pub async fn connect(description: &ConnectionDescription) -> Result<ConnectionRef> {
    match description.conn_type {
        ConnectionType::TcpIp | ConnectionType::Sdp => {
            TcpConnection::connect(description.clone()).await
        }
        ConnectionType::Rsp => GroupConnection::join(&description.hostname),
        ConnectionType::Pipe => Err(NetError::BadDescription(
            "pipe connections are created in pairs, not connected".into(),
        )),
    }
}

/// Bind a listener for the given description.
pub async fn listen(description: &ConnectionDescription) -> Result<ListenerRef> {
    match description.conn_type {
        ConnectionType::TcpIp | ConnectionType::Sdp => {
            TcpListenerConnection::bind(description.clone()).await
        }
        other => Err(NetError::BadDescription(format!("cannot listen on {other} connections"))),
    }
}
