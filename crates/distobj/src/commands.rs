//! The closed command vocabulary per packet datatype.

/// Node-level commands (datatype [`distnet::DATATYPE_NODE`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NodeCommand {
    Connect = 0,
    ConnectReply = 1,
    Stop = 2,
    FindMasterNodeId = 3,
    FindMasterNodeIdReply = 4,
    AttachObject = 5,
    DetachObject = 6,
    RegisterObject = 7,
    DeregisterObject = 8,
    MapObject = 9,
    MapObjectSuccess = 10,
    MapObjectReply = 11,
    UnmapObject = 12,
    UnsubscribeObject = 13,
    ObjectInstance = 14,
    ObjectInstanceMap = 15,
    ObjectInstanceCommit = 16,
    ObjectInstancePush = 17,
    ObjectPush = 18,
    DisableSendOnRegister = 19,
    RemoveNode = 20,
    GetNodeData = 21,
    GetNodeDataReply = 22,
}

impl NodeCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Connect),
            1 => Some(Self::ConnectReply),
            2 => Some(Self::Stop),
            3 => Some(Self::FindMasterNodeId),
            4 => Some(Self::FindMasterNodeIdReply),
            5 => Some(Self::AttachObject),
            6 => Some(Self::DetachObject),
            7 => Some(Self::RegisterObject),
            8 => Some(Self::DeregisterObject),
            9 => Some(Self::MapObject),
            10 => Some(Self::MapObjectSuccess),
            11 => Some(Self::MapObjectReply),
            12 => Some(Self::UnmapObject),
            13 => Some(Self::UnsubscribeObject),
            14 => Some(Self::ObjectInstance),
            15 => Some(Self::ObjectInstanceMap),
            16 => Some(Self::ObjectInstanceCommit),
            17 => Some(Self::ObjectInstancePush),
            18 => Some(Self::ObjectPush),
            19 => Some(Self::DisableSendOnRegister),
            20 => Some(Self::RemoveNode),
            21 => Some(Self::GetNodeData),
            22 => Some(Self::GetNodeDataReply),
            _ => None,
        }
    }
}

/// Object-level commands (datatype [`distnet::DATATYPE_OBJECT`]).
///
/// Values at or above [`OBJECT_COMMAND_CUSTOM`] are dispatched to the
/// object's own command handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectCommand {
    /// Versioned full instance data for slave instances.
    Instance = 0,
    /// Versioned delta data for slave instances.
    Delta = 1,
    /// Self-addressed: run a master commit on the command queue.
    Commit = 2,
    /// Slave request for a full resend after a delta gap.
    Sync = 3,
    /// Self-addressed: run a push on the command queue.
    Push = 4,
}

/// First object command value routed to user handlers.
pub const OBJECT_COMMAND_CUSTOM: u32 = 128;

impl ObjectCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Instance),
            1 => Some(Self::Delta),
            2 => Some(Self::Commit),
            3 => Some(Self::Sync),
            4 => Some(Self::Push),
            _ => None,
        }
    }
}

/// Session commands (datatype [`distnet::DATATYPE_SESSION`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SessionCommand {
    GenIds = 0,
    GenIdsReply = 1,
}

impl SessionCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::GenIds),
            1 => Some(Self::GenIdsReply),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_command_roundtrip() {
        for value in 0..23u32 {
            let command = NodeCommand::from_u32(value).unwrap();
            assert_eq!(command as u32, value);
        }
        assert!(NodeCommand::from_u32(23).is_none());
    }

    #[test]
    fn test_object_command_roundtrip() {
        for value in 0..5u32 {
            let command = ObjectCommand::from_u32(value).unwrap();
            assert_eq!(command as u32, value);
        }
        assert!(ObjectCommand::from_u32(5).is_none());
    }
}
