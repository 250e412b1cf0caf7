//! Transport layer of the distributed object synchronization core.
//!
//! This crate provides the pieces below the object model:
//!
//! - [`Connection`]: reliable ordered byte streams over TCP, in-process
//!   pipes, or reliable multicast groups, plus listeners and the textual
//!   [`ConnectionDescription`] form
//! - [`ConnectionSet`]: the single blocking wait over many connections,
//!   delivering framed packets as events
//! - [`PacketHeader`] framing with byte-order negotiation
//! - [`DataOStream`]/[`DataIStream`] typed payload streams
//! - the cluster-visible identifier and version primitives
//!
//! The object layer lives in the `distobj` crate.

mod connection;
mod connection_set;
mod data_stream;
mod error;
mod packet;
mod types;

pub use connection::{
    connect, listen, Connection, ConnectionDescription, ConnectionRef, ConnectionState,
    ConnectionType, GroupConnection, Listener, ListenerRef, PipeConnection, TcpConnection,
    TcpListenerConnection,
};
pub use connection_set::{ConnectionSet, SetEvent, SetHandle};
pub use data_stream::{DataIStream, DataOStream};
pub use error::{NetError, Result};
pub use packet::{
    assemble, native_byte_order, PacketHeader, RawPacket, DATATYPE_CUSTOM, DATATYPE_NODE,
    DATATYPE_OBJECT, DATATYPE_SESSION, HEADER_SIZE, MAX_PACKET_SIZE,
};
pub use types::{
    InstanceId, NodeId, ObjectId, RequestId, SessionId, Version, INSTANCE_ALL, INSTANCE_INVALID,
    INSTANCE_MAX, INSTANCE_NONE, REQUEST_INVALID,
};
