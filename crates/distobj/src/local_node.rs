//! The process-local node runtime.
//!
//! One `LocalNode` per process. `listen()` spawns the two long-lived tasks:
//! the receiver (sole reader of all connections, executes direct-dispatch
//! commands inline) and the command task (sole consumer of the node command
//! queue). Self-addressed packets travel through an in-process pipe so they
//! take the same path as remote ones.

use crate::command::Command;
use crate::commands::{NodeCommand, ObjectCommand, SessionCommand};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::{Node, NodeRef, NodeState};
use crate::object::Object;
use crate::object_store::{MapRequest, ObjectStore, StoreStatsSnapshot};
use crate::packets::*;
use crate::request::{PendingRequest, RequestHandler, RequestValue};
use crate::session::{IdPool, Session};
use bytes::Bytes;
use distnet::{
    assemble, Connection, ConnectionDescription, ConnectionRef, ConnectionSet, ConnectionType,
    DataIStream, GroupConnection, Listener, NodeId, ObjectId, PacketHeader, PipeConnection,
    RawPacket, SessionId, SetEvent, SetHandle, Version, DATATYPE_CUSTOM, DATATYPE_NODE,
    DATATYPE_OBJECT, DATATYPE_SESSION,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Callback for reassembled push data: `(group_id, type_id, object_id,
/// stream)`. Runs on the command task; must not block.
pub type PushHandler = Arc<dyn Fn(u128, u128, ObjectId, DataIStream) + Send + Sync>;

/// Callback for a user packet datatype. Runs on the receiver task when
/// registered direct, on the command task when registered queued.
pub type CommandHandler = Arc<dyn Fn(Command) + Send + Sync>;

pub(crate) struct LocalNodeInner {
    node: NodeRef,
    /// Placeholder origin for packets arriving over the multicast group;
    /// group transports merge senders, the packets carry their own origin.
    group_owner: NodeRef,
    config: Config,
    requests: RequestHandler,
    peers: RwLock<HashMap<NodeId, NodeRef>>,
    /// Outgoing handshakes by request ticket.
    pending_connects: Mutex<HashMap<u32, NodeRef>>,
    command_tx: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    set: Mutex<Option<ConnectionSet<NodeRef>>>,
    set_handle: SetHandle<NodeRef>,
    pub(crate) store: ObjectStore,
    sessions: RwLock<HashMap<SessionId, Session>>,
    push_handlers: RwLock<HashMap<u128, PushHandler>>,
    custom_handlers: RwLock<HashMap<u32, (CommandHandler, bool)>>,
    /// Write end of the self pipe, present while listening.
    self_send: RwLock<Option<ConnectionRef>>,
    group: RwLock<Option<ConnectionRef>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: Notify,
}

impl LocalNodeInner {
    pub fn node_id(&self) -> NodeId {
        self.node.node_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn requests(&self) -> &RequestHandler {
        &self.requests
    }

    pub async fn wait(&self, pending: PendingRequest) -> Result<RequestValue> {
        self.requests.wait(pending, self.config.request_timeout).await
    }

    pub fn get_node(&self, id: NodeId) -> Option<NodeRef> {
        if id == self.node.node_id() {
            return Some(self.node.clone());
        }
        self.peers.read().get(&id).cloned()
    }

    pub fn connected_nodes(&self) -> Vec<NodeRef> {
        self.peers.read().values().filter(|n| n.is_connected()).cloned().collect()
    }

    pub fn group_connection(&self) -> Option<ConnectionRef> {
        self.group.read().clone()
    }

    /// Send a packet to this node itself through the self pipe, so it is
    /// dispatched like any received packet.
    pub async fn send_to_self(&self, datatype: u32, command: u32, payload: &[u8]) -> Result<()> {
        let conn = self
            .self_send
            .read()
            .clone()
            .ok_or_else(|| Error::state("node is not listening"))?;
        conn.send(&assemble(datatype, command, payload)).await?;
        Ok(())
    }

    /// Connect an already-described peer node.
    pub async fn connect_peer(&self, node: NodeRef) -> Result<()> {
        if self.node.state() != NodeState::Listening {
            return Err(Error::state("local node is not listening"));
        }
        if node.is_connected() {
            return Ok(());
        }
        let descriptions = node.descriptions();
        if descriptions.is_empty() {
            return Err(Error::state("peer has no connection descriptions"));
        }

        let mut connection: Option<ConnectionRef> = None;
        let mut last_error: Option<Error> = None;
        for description in &descriptions {
            if description.conn_type == ConnectionType::Rsp {
                continue;
            }
            match distnet::connect(description).await {
                Ok(conn) => {
                    connection = Some(conn);
                    break;
                }
                Err(e) => last_error = Some(Error::Network(e)),
            }
        }
        let connection = match connection {
            Some(conn) => conn,
            None => {
                return Err(last_error
                    .unwrap_or_else(|| Error::state("no usable connection description")));
            }
        };

        let pending = self.requests.register(None);
        let request_id = pending.id;
        self.pending_connects.lock().insert(request_id, node.clone());
        self.set_handle.add_connection(connection.clone(), None);

        let packet = ConnectPacket {
            request_id,
            node_id: self.node.node_id(),
            node_type: self.node.node_type(),
            capabilities: self.node.capabilities(),
            launch_token: 0,
            descriptions: self.node.description_strings(),
        };
        connection
            .send(&assemble(DATATYPE_NODE, NodeCommand::Connect as u32, &packet.encode()))
            .await
            .map_err(Error::Network)?;

        match self.wait(pending).await {
            Ok(RequestValue::NodeId(_)) => Ok(()),
            Ok(_) => Err(Error::state("connect rejected by peer")),
            Err(e) => {
                self.pending_connects.lock().remove(&request_id);
                connection.close().await;
                Err(e)
            }
        }
    }

    /// Resolve and connect a node by identifier, asking connected peers for
    /// its connection data when it is unknown locally.
    pub async fn connect_by_id(&self, id: NodeId) -> Result<NodeRef> {
        if id == self.node.node_id() {
            return Ok(self.node.clone());
        }
        if let Some(node) = self.get_node(id) {
            if node.is_connected() {
                return Ok(node);
            }
            self.connect_peer(node.clone()).await?;
            return Ok(node);
        }

        for peer in self.connected_nodes() {
            let pending = self.requests.register(None);
            let packet = GetNodeDataPacket { request_id: pending.id, node_id: id };
            if peer
                .send(DATATYPE_NODE, NodeCommand::GetNodeData as u32, &packet.encode())
                .await
                .is_err()
            {
                self.requests.unregister(packet.request_id);
                continue;
            }
            if let Ok(RequestValue::NodeId(found)) = self.wait(pending).await {
                if !found.is_zero() {
                    if let Some(node) = self.get_node(found) {
                        self.connect_peer(node.clone()).await?;
                        return Ok(node);
                    }
                }
            }
        }
        Err(Error::NotFound(format!("node {id} is not reachable")))
    }

    pub fn deliver_push(
        &self,
        group_id: u128,
        type_id: u128,
        object_id: ObjectId,
        stream: DataIStream,
    ) -> bool {
        let handler = self.push_handlers.read().get(&group_id).cloned();
        match handler {
            Some(handler) => {
                handler(group_id, type_id, object_id, stream);
                true
            }
            None => {
                debug!("no push handler for group {group_id:#x}");
                false
            }
        }
    }

    fn session(&self, id: SessionId) -> Option<Session> {
        self.sessions.read().get(&id).cloned()
    }

    // ---- receiver task ------------------------------------------------

    async fn run_receiver(self: Arc<Self>, mut set: ConnectionSet<NodeRef>) {
        info!("{} listening", self.node);
        loop {
            match set.select(None).await {
                SetEvent::Connect(connection) => {
                    trace!("new connection from {}", connection.description());
                    self.set_handle.add_connection(connection, None);
                }
                SetEvent::Data { connection, owner, packet } => match owner {
                    None => self.handle_handshake(connection, packet).await,
                    Some(node) => {
                        let command = Command::new(packet, node);
                        if self.handle_command(command).await {
                            break;
                        }
                    }
                },
                SetEvent::Disconnect { connection, owner } => {
                    self.handle_disconnect(connection, owner).await;
                }
                SetEvent::Error { connection, error } => {
                    warn!("protocol error on {}: {error}", connection.description());
                }
                SetEvent::Timeout => {}
            }
        }
        self.shutdown().await;
    }

    /// First packet on a connection without a bound owner: the handshake.
    async fn handle_handshake(&self, connection: ConnectionRef, packet: RawPacket) {
        let command = NodeCommand::from_u32(packet.header.command);
        let mut is = DataIStream::from_bytes(packet.payload.clone(), packet.header.big_endian);
        match (packet.header.datatype, command) {
            (DATATYPE_NODE, Some(NodeCommand::Connect)) => {
                let connect = match ConnectPacket::decode(&mut is) {
                    Ok(connect) => connect,
                    Err(e) => {
                        warn!("malformed CONNECT: {e}");
                        connection.close().await;
                        return;
                    }
                };
                self.accept_peer(connection, connect, packet.header.big_endian).await;
            }
            (DATATYPE_NODE, Some(NodeCommand::ConnectReply)) => {
                let reply = match ConnectReplyPacket::decode(&mut is) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("malformed CONNECT_REPLY: {e}");
                        connection.close().await;
                        return;
                    }
                };
                self.complete_connect(connection, reply, packet.header.big_endian).await;
            }
            _ => {
                warn!(
                    "unexpected packet (datatype {}, command {}) before handshake",
                    packet.header.datatype, packet.header.command
                );
                connection.close().await;
            }
        }
    }

    async fn accept_peer(&self, connection: ConnectionRef, packet: ConnectPacket, big_endian: bool) {
        let peer_id = packet.node_id;
        let local_id = self.node.node_id();

        // Simultaneous connect in both directions: the node with the lower
        // identifier keeps the socket it initiated.
        let outgoing_in_flight = self
            .pending_connects
            .lock()
            .iter()
            .find(|(_, n)| n.node_id() == peer_id)
            .map(|(request_id, node)| (*request_id, node.clone()));
        if let Some((request_id, node)) = outgoing_in_flight {
            if local_id < peer_id {
                debug!("rejecting concurrent connect from {peer_id}; keeping our socket");
                let reply = self.connect_reply(packet.request_id, false);
                connection
                    .send(&assemble(
                        DATATYPE_NODE,
                        NodeCommand::ConnectReply as u32,
                        &reply.encode(),
                    ))
                    .await
                    .ok();
                connection.close().await;
                return;
            }
            // Adopt the incoming socket and complete our own connect with
            // it; the peer rejects our outgoing attempt.
            debug!("adopting concurrent connect from {peer_id}");
            self.pending_connects.lock().remove(&request_id);
            self.bind_peer(&node, &connection, &packet, big_endian);
            let reply = self.connect_reply(packet.request_id, true);
            connection
                .send(&assemble(DATATYPE_NODE, NodeCommand::ConnectReply as u32, &reply.encode()))
                .await
                .ok();
            self.requests.serve(request_id, RequestValue::NodeId(peer_id));
            return;
        }

        // The create-node factory path: a previously known (launched or
        // described) peer, or a brand new one.
        let node = self
            .get_node(peer_id)
            .unwrap_or_else(|| Node::with_id(peer_id, packet.node_type));
        self.bind_peer(&node, &connection, &packet, big_endian);

        let reply = self.connect_reply(packet.request_id, true);
        if connection
            .send(&assemble(DATATYPE_NODE, NodeCommand::ConnectReply as u32, &reply.encode()))
            .await
            .is_err()
        {
            warn!("peer {peer_id} vanished during handshake");
            self.drop_peer(&node).await;
            return;
        }
        if packet.launch_token != 0 {
            // The peer was launched by us; resolve the launch request.
            self.requests.serve(packet.launch_token, RequestValue::NodeId(peer_id));
        }
        info!("accepted {}", node);
    }

    async fn complete_connect(
        &self,
        connection: ConnectionRef,
        reply: ConnectReplyPacket,
        big_endian: bool,
    ) {
        let node = self.pending_connects.lock().remove(&reply.request_id);
        let Some(node) = node else {
            // Rejected concurrent connect resolves through the adopted
            // socket; nothing to do here either way.
            debug!("connect reply for request {} without a pending node", reply.request_id);
            connection.close().await;
            return;
        };
        if !reply.accepted {
            debug!("connect to {} rejected (concurrent connect tie-break)", reply.node_id);
            // Put the pending entry back under the peer's id so the
            // adoption of their incoming CONNECT can serve the request.
            self.pending_connects.lock().insert(reply.request_id, node);
            connection.close().await;
            return;
        }

        node.set_node_id(reply.node_id);
        node.set_capabilities(reply.capabilities);
        node.set_big_endian(big_endian);
        node.adopt_description_strings(&reply.descriptions);
        self.bind_peer_connection(&node, &connection);
        info!("connected {}", node);
        self.requests.serve(reply.request_id, RequestValue::NodeId(reply.node_id));
    }

    fn connect_reply(&self, request_id: u32, accepted: bool) -> ConnectReplyPacket {
        ConnectReplyPacket {
            request_id,
            node_id: self.node.node_id(),
            node_type: self.node.node_type(),
            capabilities: self.node.capabilities(),
            accepted,
            descriptions: self.node.description_strings(),
        }
    }

    fn bind_peer(
        &self,
        node: &NodeRef,
        connection: &ConnectionRef,
        packet: &ConnectPacket,
        big_endian: bool,
    ) {
        node.set_node_id(packet.node_id);
        node.set_capabilities(packet.capabilities);
        node.set_big_endian(big_endian);
        node.adopt_description_strings(&packet.descriptions);
        self.bind_peer_connection(node, connection);
    }

    fn bind_peer_connection(&self, node: &NodeRef, connection: &ConnectionRef) {
        node.bind_connection(connection.clone());
        if let Some(group) = self.group_connection() {
            let ours = group.multicast_group().map(str::to_string);
            if ours.is_some() && node.multicast_group() == ours {
                node.bind_multicast(group);
            }
        }
        self.set_handle.set_owner(connection, node.clone());
        self.peers.write().insert(node.node_id(), node.clone());
    }

    async fn drop_peer(&self, node: &NodeRef) {
        if let Some(connection) = node.connection() {
            self.set_handle.remove_connection(&connection);
            connection.close().await;
        }
        node.clear_connections();
        node.set_state(NodeState::Closed);
        self.peers.write().remove(&node.node_id());
    }

    /// A connection died: localize the failure to that peer.
    async fn handle_disconnect(&self, connection: ConnectionRef, owner: Option<NodeRef>) {
        self.set_handle.remove_connection(&connection);
        connection.close().await;
        let Some(node) = owner else {
            return; // unfinished handshake
        };
        if Arc::ptr_eq(&node, &self.node) {
            return; // the self pipe only closes at shutdown
        }
        let stale = node
            .connection()
            .map(|bound| !Arc::ptr_eq(&bound, &connection))
            .unwrap_or(false);
        if stale {
            return; // superseded by a newer connection (tie-break)
        }

        info!("{} disconnected", node);
        node.clear_connections();
        node.set_state(NodeState::Closed);
        self.peers.write().remove(&node.node_id());

        // Purge the departed node's object state on the command task. The
        // receiver must not wait on its own queue, so this is
        // fire-and-forget.
        let payload =
            RemoveNodePacket { request_id: distnet::REQUEST_INVALID, node_id: node.node_id() }
                .encode();
        let header =
            PacketHeader::new(DATATYPE_NODE, NodeCommand::RemoveNode as u32, payload.len());
        let command = Command { header, payload, node: self.node.clone() };
        self.command_tx.send(command).ok();
    }

    /// Dispatch one received command. Returns true on STOP.
    async fn handle_command(&self, command: Command) -> bool {
        let queued = match command.header.datatype {
            DATATYPE_NODE => match command.node_command() {
                // Only the node itself may stop its receiver.
                Some(NodeCommand::Stop) => return Arc::ptr_eq(&command.node, &self.node),
                // Receiver-direct handlers.
                Some(NodeCommand::AttachObject) => {
                    self.log_err(self.store.cmd_attach_object(&command));
                    false
                }
                Some(NodeCommand::DetachObject) => {
                    self.log_err(self.store.cmd_detach_object(&command));
                    false
                }
                Some(NodeCommand::MapObjectSuccess) => {
                    self.log_err(self.store.cmd_map_object_success(&command));
                    false
                }
                Some(NodeCommand::MapObjectReply) => {
                    self.log_err(self.store.cmd_map_object_reply(&command));
                    false
                }
                Some(NodeCommand::UnmapObject) => {
                    self.log_err(self.store.cmd_unmap_object(&command));
                    false
                }
                Some(NodeCommand::FindMasterNodeIdReply) => {
                    self.log_err(self.store.cmd_find_master_node_id_reply(&command));
                    false
                }
                Some(
                    kind @ (NodeCommand::ObjectInstance
                    | NodeCommand::ObjectInstanceMap
                    | NodeCommand::ObjectInstanceCommit
                    | NodeCommand::ObjectInstancePush),
                ) => {
                    self.log_err(self.store.cmd_instance(kind, &command));
                    false
                }
                Some(NodeCommand::GetNodeData) => {
                    self.log_err(self.cmd_get_node_data(&command).await);
                    false
                }
                Some(NodeCommand::GetNodeDataReply) => {
                    self.log_err(self.cmd_get_node_data_reply(&command));
                    false
                }
                // Command-task handlers.
                Some(
                    NodeCommand::FindMasterNodeId
                    | NodeCommand::RegisterObject
                    | NodeCommand::DeregisterObject
                    | NodeCommand::MapObject
                    | NodeCommand::UnsubscribeObject
                    | NodeCommand::DisableSendOnRegister
                    | NodeCommand::RemoveNode
                    | NodeCommand::ObjectPush,
                ) => true,
                Some(NodeCommand::Connect | NodeCommand::ConnectReply) => {
                    warn!("handshake packet on an established connection");
                    false
                }
                None => {
                    warn!("unknown node command {}", command.header.command);
                    false
                }
            },
            DATATYPE_SESSION => match command.session_command() {
                Some(SessionCommand::GenIds) => true,
                Some(SessionCommand::GenIdsReply) => {
                    self.log_err(self.cmd_gen_ids_reply(&command));
                    false
                }
                None => {
                    warn!("unknown session command {}", command.header.command);
                    false
                }
            },
            DATATYPE_OBJECT => match command.object_command() {
                Some(ObjectCommand::Commit | ObjectCommand::Sync | ObjectCommand::Push) => true,
                _ => {
                    // Instance, delta and user commands dispatch straight to
                    // the local instances.
                    self.log_err(self.store.dispatch_object_command(&command));
                    false
                }
            },
            datatype if datatype >= DATATYPE_CUSTOM => {
                let handler = self.custom_handlers.read().get(&datatype).cloned();
                match handler {
                    Some((handler, queued)) => {
                        if queued {
                            true
                        } else {
                            handler(command.clone());
                            false
                        }
                    }
                    None => {
                        warn!("no handler for custom datatype {datatype}");
                        false
                    }
                }
            }
            datatype => {
                warn!("unroutable datatype {datatype}");
                false
            }
        };

        if queued {
            self.command_tx.send(command).ok();
        }
        false
    }

    fn log_err(&self, result: Result<()>) {
        if let Err(e) = result {
            warn!("command failed: {e}");
        }
    }

    async fn cmd_get_node_data(&self, command: &Command) -> Result<()> {
        let packet = GetNodeDataPacket::decode(&mut command.istream())?;
        let known = self.get_node(packet.node_id);
        let reply = match known {
            Some(node) => GetNodeDataReplyPacket {
                request_id: packet.request_id,
                node_id: node.node_id(),
                node_type: node.node_type(),
                descriptions: node.description_strings(),
            },
            None => GetNodeDataReplyPacket {
                request_id: packet.request_id,
                node_id: NodeId::ZERO,
                node_type: 0,
                descriptions: Vec::new(),
            },
        };
        command
            .node
            .send(DATATYPE_NODE, NodeCommand::GetNodeDataReply as u32, &reply.encode())
            .await
    }

    fn cmd_get_node_data_reply(&self, command: &Command) -> Result<()> {
        let packet = GetNodeDataReplyPacket::decode(&mut command.istream())?;
        if !packet.node_id.is_zero() {
            let node = self
                .get_node(packet.node_id)
                .unwrap_or_else(|| Node::with_id(packet.node_id, packet.node_type));
            node.adopt_description_strings(&packet.descriptions);
            self.peers.write().entry(packet.node_id).or_insert_with(|| node.clone());
        }
        self.requests.serve(packet.request_id, RequestValue::NodeId(packet.node_id));
        Ok(())
    }

    async fn cmd_gen_ids(&self, command: &Command) -> Result<()> {
        let packet = GenIdsPacket::decode(&mut command.istream())?;
        let start = self
            .session(packet.session_id)
            .filter(|s| s.is_master())
            .and_then(|s| s.allocate_block(packet.count))
            .unwrap_or(0);
        let reply =
            GenIdsReplyPacket { request_id: packet.request_id, start, count: packet.count };
        command
            .node
            .send(DATATYPE_SESSION, SessionCommand::GenIdsReply as u32, &reply.encode())
            .await
    }

    fn cmd_gen_ids_reply(&self, command: &Command) -> Result<()> {
        let packet = GenIdsReplyPacket::decode(&mut command.istream())?;
        self.requests.serve(packet.request_id, RequestValue::U32(packet.start));
        Ok(())
    }

    // ---- command task -------------------------------------------------

    async fn run_commands(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let command = match rx.try_recv() {
                Ok(command) => command,
                Err(mpsc::error::TryRecvError::Empty) => {
                    // Idle: opportunistically drain the send-on-register
                    // queue before blocking.
                    if self.store.notify_command_thread_idle().await {
                        continue;
                    }
                    match rx.recv().await {
                        Some(command) => command,
                        None => break,
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };
            if command.header.datatype == DATATYPE_NODE
                && command.node_command() == Some(NodeCommand::Stop)
            {
                break;
            }
            self.execute_queued(command).await;
        }
        debug!("command task finished");
    }

    async fn execute_queued(&self, command: Command) {
        let result = match command.header.datatype {
            DATATYPE_NODE => match command.node_command() {
                Some(NodeCommand::FindMasterNodeId) => {
                    self.store.cmd_find_master_node_id(&command).await
                }
                Some(NodeCommand::RegisterObject) => self.store.cmd_register_object(&command),
                Some(NodeCommand::DeregisterObject) => self.store.cmd_deregister_object(&command),
                Some(NodeCommand::MapObject) => self.store.cmd_map_object(&command).await,
                Some(NodeCommand::UnsubscribeObject) => {
                    self.store.cmd_unsubscribe_object(&command).await
                }
                Some(NodeCommand::DisableSendOnRegister) => {
                    self.store.cmd_disable_send_on_register(&command)
                }
                Some(NodeCommand::RemoveNode) => self.store.cmd_remove_node(&command).await,
                Some(NodeCommand::ObjectPush) => self.store.cmd_object_push(&command),
                other => Err(Error::protocol(format!("{other:?} is not a queued command"))),
            },
            DATATYPE_SESSION => self.cmd_gen_ids(&command).await,
            DATATYPE_OBJECT => match command.object_command() {
                Some(ObjectCommand::Commit) => self.store.cmd_object_commit(&command).await,
                Some(ObjectCommand::Sync) => self.store.cmd_object_sync(&command).await,
                Some(ObjectCommand::Push) => self.store.cmd_object_push_exec(&command).await,
                other => Err(Error::protocol(format!("{other:?} is not a queued command"))),
            },
            datatype if datatype >= DATATYPE_CUSTOM => {
                let handler = self.custom_handlers.read().get(&datatype).cloned();
                if let Some((handler, _)) = handler {
                    handler(command);
                }
                Ok(())
            }
            datatype => Err(Error::protocol(format!("unroutable queued datatype {datatype}"))),
        };
        if let Err(e) = result {
            warn!("queued command failed: {e}");
        }
    }

    // ---- shutdown -----------------------------------------------------

    async fn shutdown(&self) {
        debug!("receiver shutting down");
        self.requests.fail_all();

        let peers: Vec<NodeRef> = self.peers.write().drain().map(|(_, n)| n).collect();
        for node in peers {
            if let Some(connection) = node.connection() {
                connection.close().await;
            }
            node.clear_connections();
            node.set_state(NodeState::Closed);
        }
        let group = self.group.write().take();
        if let Some(group) = group {
            group.close().await;
        }
        *self.self_send.write() = None;
        self.set_handle.shutdown();
        self.store.clear();

        // Stop the command task as well.
        let header = PacketHeader::new(DATATYPE_NODE, NodeCommand::Stop as u32, 0);
        let command = Command { header, payload: Bytes::new(), node: self.node.clone() };
        self.command_tx.send(command).ok();

        self.node.set_state(NodeState::Closed);
        self.closed.notify_waiters();
        info!("{} closed", self.node);
    }
}

/// The public handle to the process-local node runtime.
#[derive(Clone)]
pub struct LocalNode {
    inner: Arc<LocalNodeInner>,
}

impl LocalNode {
    /// Create a closed local node. Add listen descriptions, then call
    /// [`LocalNode::listen`].
    pub fn new(config: Config) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let set = ConnectionSet::new();
        let set_handle = set.handle();
        let group_owner = Node::with_id(NodeId::ZERO, 0);
        group_owner.set_state(NodeState::Connected);

        let inner = Arc::new_cyclic(|weak| LocalNodeInner {
            node: Node::new(0),
            group_owner,
            store: ObjectStore::new(weak.clone(), &config),
            config,
            requests: RequestHandler::new(),
            peers: RwLock::new(HashMap::new()),
            pending_connects: Mutex::new(HashMap::new()),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            set: Mutex::new(Some(set)),
            set_handle,
            sessions: RwLock::new(HashMap::new()),
            push_handlers: RwLock::new(HashMap::new()),
            custom_handlers: RwLock::new(HashMap::new()),
            self_send: RwLock::new(None),
            group: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            closed: Notify::new(),
        });
        LocalNode { inner }
    }

    /// This node as a peer-visible [`Node`].
    pub fn node(&self) -> NodeRef {
        self.inner.node.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node.node_id()
    }

    /// Describe how peers reach this node. TCP descriptions with port 0
    /// bind an ephemeral port, visible here after [`LocalNode::listen`].
    pub fn add_listen_description(&self, description: ConnectionDescription) {
        self.inner.node.add_description(description);
    }

    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.inner.node.descriptions()
    }

    /// Bind listeners and start the receiver and command tasks.
    pub async fn listen(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.node.state() != NodeState::Closed {
            return Err(Error::state("node is already listening"));
        }
        let set = inner
            .set
            .lock()
            .take()
            .ok_or_else(|| Error::state("node was already closed"))?;

        // The self pipe: self-addressed packets go through the receiver
        // like everything else.
        let (send_end, recv_end) = PipeConnection::pair();
        inner.set_handle.add_connection(recv_end, Some(inner.node.clone()));
        *inner.self_send.write() = Some(send_end);

        let mut bound = Vec::new();
        for description in inner.node.descriptions() {
            match description.conn_type {
                ConnectionType::TcpIp | ConnectionType::Sdp => {
                    let listener = distnet::listen(&description).await?;
                    bound.push(listener.description().clone());
                    inner.set_handle.add_listener(listener);
                }
                ConnectionType::Rsp => {
                    let group = GroupConnection::join(&description.hostname)?;
                    inner
                        .set_handle
                        .add_connection(group.clone(), Some(inner.group_owner.clone()));
                    *inner.group.write() = Some(group);
                    bound.push(description.clone());
                }
                ConnectionType::Pipe => bound.push(description.clone()),
            }
        }
        // Re-publish with actual ports.
        inner.node.set_descriptions(bound);

        inner.node.set_state(NodeState::Listening);
        let command_rx = inner.command_rx.lock().take().expect("fresh command queue");
        let mut tasks = inner.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(inner).run_receiver(set)));
        tasks.push(tokio::spawn(Arc::clone(inner).run_commands(command_rx)));
        Ok(())
    }

    /// Stop the node: pending requests fail, peers are disconnected, both
    /// tasks exit. All object state is torn down; nothing persists.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.node.state() != NodeState::Listening {
            return Ok(());
        }
        inner.node.set_state(NodeState::Closing);
        // Arm the wakeup before the STOP is in flight; the receiver may
        // finish shutting down before this task gets polled again.
        let notified = inner.closed.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        inner.send_to_self(DATATYPE_NODE, NodeCommand::Stop as u32, &[]).await?;
        notified.await;
        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    /// Connect a described peer node.
    pub async fn connect_node(&self, node: NodeRef) -> Result<()> {
        self.inner.connect_peer(node).await
    }

    /// Connect a peer by identifier, resolving its connection data through
    /// already-connected peers if necessary.
    pub async fn connect(&self, node_id: NodeId) -> Result<NodeRef> {
        self.inner.connect_by_id(node_id).await
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<NodeRef> {
        self.inner.get_node(node_id)
    }

    /// Currently connected peers.
    pub fn nodes(&self) -> Vec<NodeRef> {
        self.inner.connected_nodes()
    }

    // ---- objects ------------------------------------------------------

    /// Register `object` as the master instance of its identifier.
    pub async fn register_object(&self, object: &Object) -> Result<()> {
        self.inner.store.register_object(object).await
    }

    /// Deregister a master, notifying subscribed slaves.
    pub async fn deregister_object(&self, object: &Object) -> Result<()> {
        self.inner.store.deregister_object(object).await
    }

    /// Map `object` as a slave of `id` and sync it to `version`.
    pub async fn map_object(&self, object: &Object, id: ObjectId, version: Version) -> Result<Version> {
        let request = self.inner.store.map_object_nb(object, id, version).await?;
        self.inner.store.map_object_sync(request).await
    }

    /// Start a map without waiting for the reply.
    pub async fn map_object_nb(
        &self,
        object: &Object,
        id: ObjectId,
        version: Version,
    ) -> Result<MapRequest> {
        self.inner.store.map_object_nb(object, id, version).await
    }

    /// Finish a map started with [`LocalNode::map_object_nb`].
    pub async fn map_object_sync(&self, request: MapRequest) -> Result<Version> {
        self.inner.store.map_object_sync(request).await
    }

    /// Unmap a slave, unsubscribing from its master.
    pub async fn unmap_object(&self, object: &Object) -> Result<()> {
        self.inner.store.unmap_object(object).await
    }

    /// Block until the command task purged all state of a departed node.
    pub async fn remove_node(&self, node_id: NodeId) -> Result<()> {
        self.inner.store.remove_node(node_id).await
    }

    /// Drop cached instance data older than `age`.
    pub fn expire_instance_data(&self, age: std::time::Duration) {
        self.inner.store.expire_instance_data(age);
    }

    /// Current instance cache size in bytes.
    pub fn instance_cache_size(&self) -> u64 {
        self.inner.store.cache.size()
    }

    pub fn stats(&self) -> StoreStatsSnapshot {
        self.inner.store.stats.snapshot()
    }

    /// Re-enable send-on-register after a disable.
    pub fn enable_send_on_register(&self) {
        self.inner.store.enable_send_on_register();
    }

    /// Stop the opportunistic instance broadcast and flush the queue.
    pub async fn disable_send_on_register(&self) -> Result<()> {
        self.inner.store.disable_send_on_register().await
    }

    // ---- handlers -----------------------------------------------------

    /// Register the callback receiving pushed object data for a group.
    pub fn register_push_handler<F>(&self, group_id: u128, handler: F)
    where
        F: Fn(u128, u128, ObjectId, DataIStream) + Send + Sync + 'static,
    {
        self.inner.push_handlers.write().insert(group_id, Arc::new(handler));
    }

    /// Register a handler for a user packet datatype (>= 128). Queued
    /// handlers run on the command task, direct ones on the receiver.
    pub fn register_command_handler<F>(&self, datatype: u32, queued: bool, handler: F) -> Result<()>
    where
        F: Fn(Command) + Send + Sync + 'static,
    {
        if datatype < DATATYPE_CUSTOM {
            return Err(Error::state("user datatypes start at 128"));
        }
        self.inner.custom_handlers.write().insert(datatype, (Arc::new(handler), queued));
        Ok(())
    }

    // ---- sessions -----------------------------------------------------

    /// Host a new identifier-allocation session on this node.
    pub fn host_session(&self, name: &str) -> Session {
        let session = Session::new_master(
            SessionId::generate(),
            name,
            self.inner.node.clone(),
            Arc::downgrade(&self.inner),
            IdPool::new(),
        );
        self.inner.sessions.write().insert(session.id(), session.clone());
        session
    }

    /// Attach to a session hosted on `server`.
    pub fn map_session(&self, server: NodeRef, id: SessionId, name: &str) -> Session {
        let session =
            Session::new_client(id, name, server, Arc::downgrade(&self.inner));
        self.inner.sessions.write().insert(id, session.clone());
        session
    }

    pub fn get_session(&self, id: SessionId) -> Option<Session> {
        self.inner.sessions.read().get(&id).cloned()
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.node_id())
            .field("state", &self.inner.node.state())
            .finish()
    }
}
