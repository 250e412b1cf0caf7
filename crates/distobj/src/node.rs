//! Peer node handles.
//!
//! A `Node` represents a reachable process. It carries no mutable user
//! state beyond its connection binding; the process-local runtime lives in
//! [`crate::LocalNode`].

use crate::error::Result;
use distnet::{assemble, Connection, ConnectionDescription, ConnectionRef, NetError, NodeId};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Closed,
    /// Launched by this process, connection pending.
    Launched,
    Connected,
    /// The local node while it serves connections.
    Listening,
    Closing,
}

/// A reachable peer (or the local node itself).
pub struct Node {
    id: RwLock<NodeId>,
    node_type: u32,
    state: Mutex<NodeState>,
    descriptions: RwLock<Vec<ConnectionDescription>>,
    connection: RwLock<Option<ConnectionRef>>,
    multicast: RwLock<Option<ConnectionRef>>,
    capabilities: AtomicU64,
    /// Peer sends big-endian packets.
    big_endian: AtomicBool,
}

pub type NodeRef = Arc<Node>;

impl Node {
    pub fn new(node_type: u32) -> NodeRef {
        Self::with_id(NodeId::generate(), node_type)
    }

    pub fn with_id(id: NodeId, node_type: u32) -> NodeRef {
        Arc::new(Node {
            id: RwLock::new(id),
            node_type,
            state: Mutex::new(NodeState::Closed),
            descriptions: RwLock::new(Vec::new()),
            connection: RwLock::new(None),
            multicast: RwLock::new(None),
            capabilities: AtomicU64::new(0),
            big_endian: AtomicBool::new(false),
        })
    }

    pub fn node_id(&self) -> NodeId {
        *self.id.read()
    }

    pub(crate) fn set_node_id(&self, id: NodeId) {
        *self.id.write() = id;
    }

    pub fn node_type(&self) -> u32 {
        self.node_type
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        *self.state.lock() = state;
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state(), NodeState::Connected | NodeState::Listening)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == NodeState::Closed
    }

    pub fn capabilities(&self) -> u64 {
        self.capabilities.load(Ordering::Relaxed)
    }

    pub(crate) fn set_capabilities(&self, capabilities: u64) {
        self.capabilities.store(capabilities, Ordering::Relaxed);
    }

    pub fn is_big_endian(&self) -> bool {
        self.big_endian.load(Ordering::Relaxed)
    }

    pub(crate) fn set_big_endian(&self, big_endian: bool) {
        self.big_endian.store(big_endian, Ordering::Relaxed);
    }

    /// Ordered list of ways to reach this node.
    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.descriptions.read().clone()
    }

    pub fn add_description(&self, description: ConnectionDescription) {
        self.descriptions.write().push(description);
    }

    pub(crate) fn set_descriptions(&self, descriptions: Vec<ConnectionDescription>) {
        *self.descriptions.write() = descriptions;
    }

    /// Parse and adopt the textual descriptions from a handshake packet,
    /// skipping any that do not parse.
    pub(crate) fn adopt_description_strings(&self, strings: &[String]) {
        let descriptions = strings
            .iter()
            .filter_map(|s| ConnectionDescription::from_str(s).ok())
            .collect();
        self.set_descriptions(descriptions);
    }

    pub(crate) fn description_strings(&self) -> Vec<String> {
        self.descriptions.read().iter().map(|d| d.to_string()).collect()
    }

    /// The multicast group this node is reachable through, if any.
    pub fn multicast_group(&self) -> Option<String> {
        self.descriptions
            .read()
            .iter()
            .find_map(|d| d.group_name().map(str::to_string))
    }

    pub(crate) fn connection(&self) -> Option<ConnectionRef> {
        self.connection.read().clone()
    }

    pub(crate) fn bind_connection(&self, connection: ConnectionRef) {
        *self.connection.write() = Some(connection);
        self.set_state(NodeState::Connected);
    }

    pub(crate) fn multicast_connection(&self) -> Option<ConnectionRef> {
        self.multicast.read().clone()
    }

    pub(crate) fn bind_multicast(&self, connection: ConnectionRef) {
        *self.multicast.write() = Some(connection);
    }

    pub(crate) fn clear_connections(&self) {
        *self.connection.write() = None;
        *self.multicast.write() = None;
    }

    /// Send one packet on the bound unicast connection. The connection's
    /// internal send lock serializes concurrent senders; header and payload
    /// go out as one write.
    pub async fn send(&self, datatype: u32, command: u32, payload: &[u8]) -> Result<()> {
        let connection = self
            .connection()
            .ok_or(NetError::ConnectionClosed)?;
        connection.send(&assemble(datatype, command, payload)).await?;
        Ok(())
    }

    /// Send on the multicast path if one is bound; returns false when the
    /// caller must fall back to unicast.
    pub async fn multicast(&self, datatype: u32, command: u32, payload: &[u8]) -> bool {
        let Some(connection) = self.multicast_connection() else {
            return false;
        };
        connection.send(&assemble(datatype, command, payload)).await.is_ok()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.node_id())
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.node_id())
    }
}
