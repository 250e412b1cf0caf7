//! Typed packet payloads, one struct per wire command.
//!
//! Payloads are encoded in the sender's native byte order through
//! [`DataOStream`] and decoded through [`DataIStream`], which swaps when the
//! packet header flags a foreign order. Layouts are the closed contract of
//! the protocol; fields are documented where the name alone is ambiguous.

use crate::error::{Error, Result};
use bytes::Bytes;
use distnet::{
    DataIStream, DataOStream, InstanceId, NodeId, ObjectId, RequestId, SessionId, Version,
};

fn malformed(e: distnet::NetError) -> Error {
    Error::Protocol(format!("malformed packet: {e}"))
}

fn read_descriptions(is: &mut DataIStream) -> Result<Vec<String>> {
    let count = is.read_u32().map_err(malformed)?;
    let mut descriptions = Vec::with_capacity(count.min(16) as usize);
    for _ in 0..count {
        descriptions.push(is.read_string().map_err(malformed)?);
    }
    Ok(descriptions)
}

fn write_descriptions(os: &mut DataOStream, descriptions: &[String]) {
    os.write_u32(descriptions.len() as u32);
    for description in descriptions {
        os.write_string(description);
    }
}

/// NODE/CONNECT: first packet on every new connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectPacket {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub node_type: u32,
    pub capabilities: u64,
    /// Request identifier minted at launch time, zero unless the connecting
    /// peer was launched by the receiving node.
    pub launch_token: u32,
    pub descriptions: Vec<String>,
}

impl ConnectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_node_id(self.node_id);
        os.write_u32(self.node_type);
        os.write_u64(self.capabilities);
        os.write_u32(self.launch_token);
        write_descriptions(&mut os, &self.descriptions);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ConnectPacket {
            request_id: is.read_u32().map_err(malformed)?,
            node_id: is.read_node_id().map_err(malformed)?,
            node_type: is.read_u32().map_err(malformed)?,
            capabilities: is.read_u64().map_err(malformed)?,
            launch_token: is.read_u32().map_err(malformed)?,
            descriptions: read_descriptions(is)?,
        })
    }
}

/// NODE/CONNECT_REPLY: accepts or rejects a CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectReplyPacket {
    /// The request identifier from the CONNECT being answered.
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub node_type: u32,
    pub capabilities: u64,
    pub accepted: bool,
    pub descriptions: Vec<String>,
}

impl ConnectReplyPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_node_id(self.node_id);
        os.write_u32(self.node_type);
        os.write_u64(self.capabilities);
        os.write_bool(self.accepted);
        write_descriptions(&mut os, &self.descriptions);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ConnectReplyPacket {
            request_id: is.read_u32().map_err(malformed)?,
            node_id: is.read_node_id().map_err(malformed)?,
            node_type: is.read_u32().map_err(malformed)?,
            capabilities: is.read_u64().map_err(malformed)?,
            accepted: is.read_bool().map_err(malformed)?,
            descriptions: read_descriptions(is)?,
        })
    }
}

/// NODE/GET_NODE_DATA: ask a peer for the connection data of a third node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetNodeDataPacket {
    pub request_id: RequestId,
    pub node_id: NodeId,
}

impl GetNodeDataPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_node_id(self.node_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(GetNodeDataPacket {
            request_id: is.read_u32().map_err(malformed)?,
            node_id: is.read_node_id().map_err(malformed)?,
        })
    }
}

/// NODE/GET_NODE_DATA_REPLY: `node_id` is zero when the peer does not know
/// the requested node.
#[derive(Debug, Clone, PartialEq)]
pub struct GetNodeDataReplyPacket {
    pub request_id: RequestId,
    pub node_id: NodeId,
    pub node_type: u32,
    pub descriptions: Vec<String>,
}

impl GetNodeDataReplyPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_node_id(self.node_id);
        os.write_u32(self.node_type);
        write_descriptions(&mut os, &self.descriptions);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(GetNodeDataReplyPacket {
            request_id: is.read_u32().map_err(malformed)?,
            node_id: is.read_node_id().map_err(malformed)?,
            node_type: is.read_u32().map_err(malformed)?,
            descriptions: read_descriptions(is)?,
        })
    }
}

/// NODE/FIND_MASTER_NODE_ID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FindMasterNodeIdPacket {
    pub request_id: RequestId,
    pub object_id: ObjectId,
}

impl FindMasterNodeIdPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(FindMasterNodeIdPacket {
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
        })
    }
}

/// NODE/FIND_MASTER_NODE_ID_REPLY: `master_node_id` is zero when unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FindMasterNodeIdReplyPacket {
    pub request_id: RequestId,
    pub master_node_id: NodeId,
}

impl FindMasterNodeIdReplyPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_node_id(self.master_node_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(FindMasterNodeIdReplyPacket {
            request_id: is.read_u32().map_err(malformed)?,
            master_node_id: is.read_node_id().map_err(malformed)?,
        })
    }
}

/// NODE/ATTACH_OBJECT and NODE/DETACH_OBJECT share one layout: both are
/// self-addressed so the mutation runs on the receiver task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachObjectPacket {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
}

impl AttachObjectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.write_u32(self.instance_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(AttachObjectPacket {
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
            instance_id: is.read_u32().map_err(malformed)?,
        })
    }
}

pub type DetachObjectPacket = AttachObjectPacket;

/// NODE/REGISTER_OBJECT: self-addressed send-queue enqueue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterObjectPacket {
    pub object_id: ObjectId,
}

impl RegisterObjectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_object_id(self.object_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(RegisterObjectPacket { object_id: is.read_object_id().map_err(malformed)? })
    }
}

/// NODE/DEREGISTER_OBJECT: self-addressed send-queue removal, ACKed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeregisterObjectPacket {
    pub request_id: RequestId,
    pub object_id: ObjectId,
}

impl DeregisterObjectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(DeregisterObjectPacket {
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
        })
    }
}

/// NODE/MAP_OBJECT: slave subscription request sent to the master node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapObjectPacket {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub requested_version: Version,
    /// Flow-control bound advertised by the slave; 0 means unbounded.
    pub max_versions: u64,
    /// The instance identifier the slave picked for itself.
    pub instance_id: InstanceId,
    /// Cache hint: the slave holds versions `[min_cached, max_cached]` of
    /// this object, written by `master_instance_id`.
    pub use_cache: bool,
    pub master_instance_id: InstanceId,
    pub min_cached_version: Version,
    pub max_cached_version: Version,
}

impl MapObjectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.write_version(self.requested_version);
        os.write_u64(self.max_versions);
        os.write_u32(self.instance_id);
        os.write_bool(self.use_cache);
        os.write_u32(self.master_instance_id);
        os.write_version(self.min_cached_version);
        os.write_version(self.max_cached_version);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(MapObjectPacket {
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
            requested_version: is.read_version().map_err(malformed)?,
            max_versions: is.read_u64().map_err(malformed)?,
            instance_id: is.read_u32().map_err(malformed)?,
            use_cache: is.read_bool().map_err(malformed)?,
            master_instance_id: is.read_u32().map_err(malformed)?,
            min_cached_version: is.read_version().map_err(malformed)?,
            max_cached_version: is.read_version().map_err(malformed)?,
        })
    }
}

/// NODE/MAP_OBJECT_SUCCESS: sets up the slave change manager. Potentially
/// multicast; `node_id` names the intended receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapObjectSuccessPacket {
    pub node_id: NodeId,
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    pub change_type: u32,
    pub master_instance_id: InstanceId,
}

impl MapObjectSuccessPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_node_id(self.node_id);
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.write_u32(self.instance_id);
        os.write_u32(self.change_type);
        os.write_u32(self.master_instance_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(MapObjectSuccessPacket {
            node_id: is.read_node_id().map_err(malformed)?,
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
            instance_id: is.read_u32().map_err(malformed)?,
            change_type: is.read_u32().map_err(malformed)?,
            master_instance_id: is.read_u32().map_err(malformed)?,
        })
    }
}

/// NODE/MAP_OBJECT_REPLY: completes the map protocol on the slave.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapObjectReplyPacket {
    pub node_id: NodeId,
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub version: Version,
    pub result: bool,
    /// The master authorizes applying the slave's cached versions.
    pub use_cache: bool,
    /// The slave pinned its cache entry when it sent the hint; it must
    /// release that pin.
    pub release_cache: bool,
}

impl MapObjectReplyPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_node_id(self.node_id);
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.write_version(self.version);
        os.write_bool(self.result);
        os.write_bool(self.use_cache);
        os.write_bool(self.release_cache);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(MapObjectReplyPacket {
            node_id: is.read_node_id().map_err(malformed)?,
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
            version: is.read_version().map_err(malformed)?,
            result: is.read_bool().map_err(malformed)?,
            use_cache: is.read_bool().map_err(malformed)?,
            release_cache: is.read_bool().map_err(malformed)?,
        })
    }
}

/// NODE/UNMAP_OBJECT: drop every local instance and cached version of an
/// object whose master went away.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnmapObjectPacket {
    pub object_id: ObjectId,
}

impl UnmapObjectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_object_id(self.object_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(UnmapObjectPacket { object_id: is.read_object_id().map_err(malformed)? })
    }
}

/// NODE/UNSUBSCRIBE_OBJECT: slave asks the master to drop it; the master
/// answers with DETACH_OBJECT carrying the same request identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnsubscribeObjectPacket {
    pub request_id: RequestId,
    pub object_id: ObjectId,
    pub master_instance_id: InstanceId,
    pub slave_instance_id: InstanceId,
}

impl UnsubscribeObjectPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_object_id(self.object_id);
        os.write_u32(self.master_instance_id);
        os.write_u32(self.slave_instance_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(UnsubscribeObjectPacket {
            request_id: is.read_u32().map_err(malformed)?,
            object_id: is.read_object_id().map_err(malformed)?,
            master_instance_id: is.read_u32().map_err(malformed)?,
            slave_instance_id: is.read_u32().map_err(malformed)?,
        })
    }
}

/// One chunk of versioned object data; payload of OBJECT/INSTANCE and
/// OBJECT/DELTA and the body of the `OBJECT_INSTANCE_*` carriers.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDataPacket {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    pub version: Version,
    /// Chunk number within this version, starting at 0.
    pub sequence: u32,
    pub last: bool,
    pub data: Bytes,
}

impl ObjectDataPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::with_capacity(64 + self.data.len());
        self.encode_into(&mut os);
        os.into_bytes()
    }

    pub fn encode_into(&self, os: &mut DataOStream) {
        os.write_object_id(self.object_id);
        os.write_u32(self.instance_id);
        os.write_version(self.version);
        os.write_u32(self.sequence);
        os.write_bool(self.last);
        os.write_bytes(&self.data);
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ObjectDataPacket {
            object_id: is.read_object_id().map_err(malformed)?,
            instance_id: is.read_u32().map_err(malformed)?,
            version: is.read_version().map_err(malformed)?,
            sequence: is.read_u32().map_err(malformed)?,
            last: is.read_bool().map_err(malformed)?,
            data: Bytes::from(is.read_bytes().map_err(malformed)?),
        })
    }
}

/// NODE/OBJECT_INSTANCE_* carrier: instance data plus addressing for the
/// cache and for targeted map payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInstancePacket {
    /// Intended receiver for INSTANCE_MAP; zero for broadcast variants.
    pub node_id: NodeId,
    /// The node holding the master instance; keys the cache contribution.
    pub master_node_id: NodeId,
    pub master_instance_id: InstanceId,
    pub data: ObjectDataPacket,
}

impl ObjectInstancePacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::with_capacity(96 + self.data.data.len());
        os.write_node_id(self.node_id);
        os.write_node_id(self.master_node_id);
        os.write_u32(self.master_instance_id);
        self.data.encode_into(&mut os);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ObjectInstancePacket {
            node_id: is.read_node_id().map_err(malformed)?,
            master_node_id: is.read_node_id().map_err(malformed)?,
            master_instance_id: is.read_u32().map_err(malformed)?,
            data: ObjectDataPacket::decode(is)?,
        })
    }
}

/// NODE/OBJECT_PUSH: marker closing a sequence of OBJECT_INSTANCE_PUSH
/// fragments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectPushPacket {
    pub object_id: ObjectId,
    pub group_id: u128,
    pub type_id: u128,
}

impl ObjectPushPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_object_id(self.object_id);
        os.write_u128(self.group_id);
        os.write_u128(self.type_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ObjectPushPacket {
            object_id: is.read_object_id().map_err(malformed)?,
            group_id: is.read_u128().map_err(malformed)?,
            type_id: is.read_u128().map_err(malformed)?,
        })
    }
}

/// NODE/DISABLE_SEND_ON_REGISTER: self-addressed, ACKed through the request
/// handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisableSendOnRegisterPacket {
    pub request_id: RequestId,
}

impl DisableSendOnRegisterPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(DisableSendOnRegisterPacket { request_id: is.read_u32().map_err(malformed)? })
    }
}

/// NODE/REMOVE_NODE: self-addressed purge of a departed peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoveNodePacket {
    pub request_id: RequestId,
    pub node_id: NodeId,
}

impl RemoveNodePacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_node_id(self.node_id);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(RemoveNodePacket {
            request_id: is.read_u32().map_err(malformed)?,
            node_id: is.read_node_id().map_err(malformed)?,
        })
    }
}

/// Leading fields of every OBJECT-datatype payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectAddress {
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
}

impl ObjectAddress {
    pub fn encode_into(&self, os: &mut DataOStream) {
        os.write_object_id(self.object_id);
        os.write_u32(self.instance_id);
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ObjectAddress {
            object_id: is.read_object_id().map_err(malformed)?,
            instance_id: is.read_u32().map_err(malformed)?,
        })
    }
}

/// OBJECT/COMMIT: self-addressed master commit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectCommitPacket {
    pub address: ObjectAddress,
    pub request_id: RequestId,
    pub incarnation: u32,
}

impl ObjectCommitPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        self.address.encode_into(&mut os);
        os.write_u32(self.request_id);
        os.write_u32(self.incarnation);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ObjectCommitPacket {
            address: ObjectAddress::decode(is)?,
            request_id: is.read_u32().map_err(malformed)?,
            incarnation: is.read_u32().map_err(malformed)?,
        })
    }
}

/// OBJECT/SYNC: a slave that detected a delta gap asks its master for a
/// full instance resend.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectSyncPacket {
    /// Addresses the master instance.
    pub address: ObjectAddress,
    pub slave_node_id: NodeId,
    pub slave_instance_id: InstanceId,
    /// The version the slave is stuck at.
    pub version: Version,
}

impl ObjectSyncPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        self.address.encode_into(&mut os);
        os.write_node_id(self.slave_node_id);
        os.write_u32(self.slave_instance_id);
        os.write_version(self.version);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(ObjectSyncPacket {
            address: ObjectAddress::decode(is)?,
            slave_node_id: is.read_node_id().map_err(malformed)?,
            slave_instance_id: is.read_u32().map_err(malformed)?,
            version: is.read_version().map_err(malformed)?,
        })
    }
}

/// OBJECT/PUSH: self-addressed push execution on the command queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectPushExecPacket {
    pub address: ObjectAddress,
    pub request_id: RequestId,
    pub group_id: u128,
    pub type_id: u128,
    pub nodes: Vec<NodeId>,
}

impl ObjectPushExecPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        self.address.encode_into(&mut os);
        os.write_u32(self.request_id);
        os.write_u128(self.group_id);
        os.write_u128(self.type_id);
        os.write_u32(self.nodes.len() as u32);
        for node in &self.nodes {
            os.write_node_id(*node);
        }
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        let address = ObjectAddress::decode(is)?;
        let request_id = is.read_u32().map_err(malformed)?;
        let group_id = is.read_u128().map_err(malformed)?;
        let type_id = is.read_u128().map_err(malformed)?;
        let count = is.read_u32().map_err(malformed)?;
        let mut nodes = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            nodes.push(is.read_node_id().map_err(malformed)?);
        }
        Ok(ObjectPushExecPacket { address, request_id, group_id, type_id, nodes })
    }
}

/// SESSION/GEN_IDS: identifier block allocation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenIdsPacket {
    pub session_id: SessionId,
    pub request_id: RequestId,
    pub count: u32,
}

impl GenIdsPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_session_id(self.session_id);
        os.write_u32(self.request_id);
        os.write_u32(self.count);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(GenIdsPacket {
            session_id: is.read_session_id().map_err(malformed)?,
            request_id: is.read_u32().map_err(malformed)?,
            count: is.read_u32().map_err(malformed)?,
        })
    }
}

/// SESSION/GEN_IDS_REPLY: `start` is zero when allocation failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenIdsReplyPacket {
    pub request_id: RequestId,
    pub start: u32,
    pub count: u32,
}

impl GenIdsReplyPacket {
    pub fn encode(&self) -> Bytes {
        let mut os = DataOStream::new();
        os.write_u32(self.request_id);
        os.write_u32(self.start);
        os.write_u32(self.count);
        os.into_bytes()
    }

    pub fn decode(is: &mut DataIStream) -> Result<Self> {
        Ok(GenIdsReplyPacket {
            request_id: is.read_u32().map_err(malformed)?,
            start: is.read_u32().map_err(malformed)?,
            count: is.read_u32().map_err(malformed)?,
        })
    }
}
