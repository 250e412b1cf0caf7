//! Packet framing.
//!
//! Every packet on a connection starts with a fixed 20-byte header:
//!
//! ```text
//! +--------+--------+--------+--------+
//! |              size (u64)           |
//! +--------+--------+--------+--------+
//! |   datatype      |    command      |
//! +--------+--------+--------+--------+
//! | order  |        padding           |
//! +--------+--------+-----------------+
//! ```
//!
//! `size` counts the whole packet including the header. All header and
//! payload integers are written in the sender's native byte order; the
//! `order` byte tells the receiver which one that was, and mismatched
//! receivers swap while decoding.

use crate::error::{NetError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed packet header.
pub const HEADER_SIZE: usize = 20;

/// Upper bound for a single framed packet, header included. Larger
/// payloads are carried as sequences of data packets.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Packet datatype: node-level commands.
pub const DATATYPE_NODE: u32 = 0;
/// Packet datatype: session commands.
pub const DATATYPE_SESSION: u32 = 1;
/// Packet datatype: object commands.
pub const DATATYPE_OBJECT: u32 = 2;
/// First datatype available to user commands.
pub const DATATYPE_CUSTOM: u32 = 128;

const ORDER_LITTLE_ENDIAN: u8 = 0;
const ORDER_BIG_ENDIAN: u8 = 1;

/// The byte-order flag value this host writes.
pub const fn native_byte_order() -> u8 {
    if cfg!(target_endian = "big") {
        ORDER_BIG_ENDIAN
    } else {
        ORDER_LITTLE_ENDIAN
    }
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub size: u64,
    pub datatype: u32,
    pub command: u32,
    /// Byte order of the sender; true for big-endian.
    pub big_endian: bool,
}

impl PacketHeader {
    /// Header for a packet with the given payload length.
    pub fn new(datatype: u32, command: u32, payload_len: usize) -> Self {
        PacketHeader {
            size: (HEADER_SIZE + payload_len) as u64,
            datatype,
            command,
            big_endian: cfg!(target_endian = "big"),
        }
    }

    /// Payload length, without the header.
    pub fn payload_len(&self) -> usize {
        self.size as usize - HEADER_SIZE
    }

    /// Encode in native byte order.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64_ne(self.size);
        buf.put_u32_ne(self.datatype);
        buf.put_u32_ne(self.command);
        buf.put_u8(native_byte_order());
        buf.put_slice(&[0u8; 3]);
    }

    /// Decode a header from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        let big_endian = match bytes[16] {
            ORDER_LITTLE_ENDIAN => false,
            ORDER_BIG_ENDIAN => true,
            flag => {
                return Err(NetError::Framing(format!("bad byte-order flag {flag:#x}")));
            }
        };

        let mut buf = &bytes[..16];
        let (size, datatype, command) = if big_endian {
            (buf.get_u64(), buf.get_u32(), buf.get_u32())
        } else {
            (buf.get_u64_le(), buf.get_u32_le(), buf.get_u32_le())
        };

        if size < HEADER_SIZE as u64 {
            return Err(NetError::Framing(format!("packet size {size} below header size")));
        }
        if size > MAX_PACKET_SIZE as u64 {
            return Err(NetError::PacketTooLarge { size, max: MAX_PACKET_SIZE as u64 });
        }

        Ok(PacketHeader { size, datatype, command, big_endian })
    }
}

/// One received packet: decoded header plus the raw payload bytes.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// Assemble a complete packet buffer from command and payload.
pub fn assemble(datatype: u32, command: u32, payload: &[u8]) -> Bytes {
    let header = PacketHeader::new(datatype, command, payload.len());
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = PacketHeader::new(DATATYPE_OBJECT, 7, 100);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&buf);
        let decoded = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.payload_len(), 100);
    }

    #[test]
    fn test_decode_foreign_byte_order() {
        // Hand-crafted big-endian header from a hypothetical peer.
        let mut buf = BytesMut::new();
        buf.put_u64((HEADER_SIZE + 4) as u64);
        buf.put_u32(DATATYPE_NODE);
        buf.put_u32(3);
        buf.put_u8(1);
        buf.put_slice(&[0u8; 3]);

        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&buf);
        let header = PacketHeader::decode(&bytes).unwrap();
        assert!(header.big_endian);
        assert_eq!(header.datatype, DATATYPE_NODE);
        assert_eq!(header.command, 3);
        assert_eq!(header.payload_len(), 4);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[16] = 0x7f; // bad order flag
        assert!(PacketHeader::decode(&bytes).is_err());

        let mut short = [0u8; HEADER_SIZE];
        short[0] = 4; // size below header size, little-endian
        assert!(PacketHeader::decode(&short).is_err());
    }

    #[test]
    fn test_assemble() {
        let packet = assemble(DATATYPE_SESSION, 1, b"abcd");
        assert_eq!(packet.len(), HEADER_SIZE + 4);
        let mut bytes = [0u8; HEADER_SIZE];
        bytes.copy_from_slice(&packet[..HEADER_SIZE]);
        let header = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(header.datatype, DATATYPE_SESSION);
        assert_eq!(&packet[HEADER_SIZE..], b"abcd");
    }
}
