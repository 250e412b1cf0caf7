//! Identifier and version primitives shared by the wire protocol.
//!
//! All cluster-visible identifiers are 128 bit. The zero value means
//! "none/any"; any nonzero value counts as generated. Generation uses a
//! random UUID, which is collision-resistant without being cryptographic.

use bytes::{Buf, BufMut};
use std::fmt;

macro_rules! wire_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; 16]);

        impl $name {
            /// The none/any identifier.
            pub const ZERO: $name = $name([0; 16]);

            /// Size of the identifier on the wire.
            pub const SIZE: usize = 16;

            /// Generate a new random identifier.
            pub fn generate() -> Self {
                Self(*uuid::Uuid::new_v4().as_bytes())
            }

            pub fn is_zero(&self) -> bool {
                self.0 == [0; 16]
            }

            /// True if this identifier was generated, i.e. is nonzero.
            pub fn is_generated(&self) -> bool {
                !self.is_zero()
            }

            /// Identifiers are raw bytes on the wire, independent of the
            /// sender's byte order.
            pub fn encode<B: BufMut>(&self, buf: &mut B) {
                buf.put_slice(&self.0);
            }

            pub fn decode<B: Buf>(buf: &mut B) -> Self {
                let mut bytes = [0u8; 16];
                buf.copy_to_slice(&mut bytes);
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if self.is_zero() {
                    return write!(f, "zero");
                }
                // Short form: first four bytes are enough to tell nodes apart
                // in a log line.
                write!(
                    f,
                    "{:02x}{:02x}{:02x}{:02x}",
                    self.0[0], self.0[1], self.0[2], self.0[3]
                )
            }
        }
    };
}

wire_id! {
    /// Unique identifier of a node (process) in the cluster.
    NodeId
}

wire_id! {
    /// Unique identifier of a distributed object.
    ObjectId
}

wire_id! {
    /// Unique identifier of a session.
    SessionId
}

/// Addresses one local instance of an object on a node.
///
/// Values `0..=INSTANCE_MAX` address a specific instance. The remaining
/// values are sentinels.
pub type InstanceId = u32;

/// The biggest addressable instance identifier.
pub const INSTANCE_MAX: InstanceId = 0xffff_fffc;
/// Broadcast to all instances of the object.
pub const INSTANCE_NONE: InstanceId = 0xffff_fffd;
/// Unbound/unset instance identifier.
pub const INSTANCE_INVALID: InstanceId = 0xffff_fffe;
/// All object instances, including the master.
pub const INSTANCE_ALL: InstanceId = 0xffff_ffff;

/// Token correlating an asynchronous reply packet with its request.
pub type RequestId = u32;

/// The invalid/unset request identifier.
pub const REQUEST_INVALID: RequestId = u32::MAX;

/// A 128-bit object version.
///
/// Master commits produce the continuous sequence `FIRST, FIRST+1, ...`
/// with `high == 0`. The sentinels live at the top of the value range so
/// that any concrete version orders below them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Version {
    pub high: u64,
    pub low: u64,
}

impl Version {
    /// No version; the version of unversioned objects.
    pub const NONE: Version = Version { high: 0, low: 0 };
    /// The first user-visible version after registration.
    pub const FIRST: Version = Version { high: 0, low: 1 };
    /// Sync sentinel: the oldest version still available.
    pub const OLDEST: Version = Version { high: u64::MAX, low: u64::MAX - 3 };
    /// Sync sentinel: apply exactly one pending version.
    pub const NEXT: Version = Version { high: u64::MAX, low: u64::MAX - 2 };
    /// Sync sentinel: all pending versions, non-blocking.
    pub const HEAD: Version = Version { high: u64::MAX, low: u64::MAX - 1 };
    /// Invalid/unset version.
    pub const INVALID: Version = Version { high: u64::MAX, low: u64::MAX };

    /// Size of a version on the wire.
    pub const SIZE: usize = 16;

    pub const fn new(high: u64, low: u64) -> Self {
        Version { high, low }
    }

    /// True for the sync sentinels, which never name a concrete version.
    pub fn is_sentinel(&self) -> bool {
        *self >= Version::OLDEST
    }

    /// The version following this one in the master commit sequence.
    pub fn next(&self) -> Version {
        debug_assert!(!self.is_sentinel());
        Version { high: self.high, low: self.low + 1 }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_ne(self.high);
        buf.put_u64_ne(self.low);
    }

    pub fn decode<B: Buf>(buf: &mut B, big_endian: bool) -> Self {
        let (high, low) = if big_endian {
            (buf.get_u64(), buf.get_u64())
        } else {
            (buf.get_u64_le(), buf.get_u64_le())
        };
        Version { high, low }
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Version::NONE => write!(f, "none"),
            Version::OLDEST => write!(f, "oldest"),
            Version::NEXT => write!(f, "next"),
            Version::HEAD => write!(f, "head"),
            Version::INVALID => write!(f, "invalid"),
            Version { high: 0, low } => write!(f, "{low}"),
            Version { high, low } => write!(f, "{high}.{low}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert!(a.is_generated());
        assert_ne!(a, b);
        assert!(!NodeId::ZERO.is_generated());
    }

    #[test]
    fn test_id_roundtrip() {
        let id = ObjectId::generate();
        let mut buf = BytesMut::new();
        id.encode(&mut buf);
        assert_eq!(buf.len(), ObjectId::SIZE);
        assert_eq!(ObjectId::decode(&mut buf.freeze()), id);
    }

    #[test]
    fn test_version_ordering() {
        assert!(Version::NONE < Version::FIRST);
        assert!(Version::FIRST < Version::new(0, 2));
        assert!(Version::new(0, u64::MAX) < Version::OLDEST);
        assert!(Version::OLDEST < Version::NEXT);
        assert!(Version::NEXT < Version::HEAD);
        assert!(Version::HEAD < Version::INVALID);
        assert!(Version::new(0, 5).is_sentinel() == false);
        assert!(Version::HEAD.is_sentinel());
    }

    #[test]
    fn test_version_roundtrip_both_orders() {
        let v = Version::new(3, 0x0102_0304_0506_0708);
        let mut buf = BytesMut::new();
        v.encode(&mut buf);
        let big_endian = cfg!(target_endian = "big");
        assert_eq!(Version::decode(&mut buf.freeze(), big_endian), v);

        // A big-endian peer writes the same value in its own order.
        let mut be = BytesMut::new();
        be.put_u64(v.high);
        be.put_u64(v.low);
        assert_eq!(Version::decode(&mut be.freeze(), true), v);
    }
}
