//! Received command objects.

use crate::commands::{NodeCommand, ObjectCommand, SessionCommand};
use crate::node::NodeRef;
use distnet::{DataIStream, PacketHeader, RawPacket};

/// A received packet bound to its originating node.
///
/// The payload is refcounted, so cloning a command for fan-out to several
/// local instances shares the bytes instead of copying them.
#[derive(Clone)]
pub struct Command {
    pub header: PacketHeader,
    pub payload: bytes::Bytes,
    /// The node the packet came from.
    pub node: NodeRef,
}

impl Command {
    pub fn new(packet: RawPacket, node: NodeRef) -> Self {
        Command { header: packet.header, payload: packet.payload, node }
    }

    /// Payload reader honoring the sender's byte order.
    pub fn istream(&self) -> DataIStream {
        DataIStream::from_bytes(self.payload.clone(), self.header.big_endian)
    }

    pub fn node_command(&self) -> Option<NodeCommand> {
        NodeCommand::from_u32(self.header.command)
    }

    pub fn object_command(&self) -> Option<ObjectCommand> {
        ObjectCommand::from_u32(self.header.command)
    }

    pub fn session_command(&self) -> Option<SessionCommand> {
        SessionCommand::from_u32(self.header.command)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("datatype", &self.header.datatype)
            .field("command", &self.header.command)
            .field("size", &self.header.size)
            .field("from", &self.node.node_id())
            .finish()
    }
}
