//! Reassembly of chunked object data.
//!
//! Payloads larger than the packet size arrive as numbered chunks; an
//! `ObjectDataIStream` collects them in order until the `last` marker and
//! then reads back as one typed stream. Chunks share their backing buffers
//! with the received packets, so reassembly does not copy payload bytes.

use crate::error::{Error, Result};
use crate::packets::ObjectDataPacket;
use bytes::{Bytes, BytesMut};
use distnet::{DataIStream, Version};

/// Maximum payload bytes carried in one object data packet.
pub(crate) const DATA_CHUNK_SIZE: usize = 32 * 1024;

/// One version's worth of object data, possibly still arriving.
#[derive(Debug)]
pub(crate) struct ObjectDataIStream {
    version: Version,
    big_endian: bool,
    /// Delta data applies through `unpack`, instance data through
    /// `apply_instance_data`.
    delta: bool,
    chunks: Vec<Bytes>,
    next_sequence: u32,
    ready: bool,
}

impl ObjectDataIStream {
    pub fn new(version: Version, delta: bool, big_endian: bool) -> Self {
        ObjectDataIStream {
            version,
            big_endian,
            delta,
            chunks: Vec::new(),
            next_sequence: 0,
            ready: false,
        }
    }

    /// A ready stream over already-assembled bytes (cache replay).
    pub fn from_bytes(version: Version, big_endian: bool, data: Bytes) -> Self {
        ObjectDataIStream {
            version,
            big_endian,
            delta: false,
            chunks: vec![data],
            next_sequence: 1,
            ready: true,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_delta(&self) -> bool {
        self.delta
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Append one received chunk. Chunks of one version arrive in sequence
    /// order on their connection; anything else is a protocol violation.
    pub fn add_chunk(&mut self, packet: &ObjectDataPacket) -> Result<()> {
        if self.ready {
            return Err(Error::protocol(format!(
                "data chunk after last marker for v{}",
                self.version
            )));
        }
        if packet.version != self.version {
            return Err(Error::protocol(format!(
                "data chunk version {} in stream at {}",
                packet.version, self.version
            )));
        }
        if packet.sequence != self.next_sequence {
            return Err(Error::protocol(format!(
                "data chunk sequence {} where {} was expected",
                packet.sequence, self.next_sequence
            )));
        }
        self.next_sequence += 1;
        self.chunks.push(packet.data.clone());
        if packet.last {
            self.ready = true;
        }
        Ok(())
    }

    /// Total payload size collected so far.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    /// Reader over the assembled payload. Only valid once ready.
    pub fn istream(&self) -> DataIStream {
        debug_assert!(self.ready);
        DataIStream::from_chunks(self.chunks.iter().cloned(), self.big_endian)
    }

    /// The assembled payload as one buffer, for the instance cache.
    pub fn concat(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut buf = BytesMut::with_capacity(self.len());
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

/// Split a serialized payload into data packets of at most
/// [`DATA_CHUNK_SIZE`] bytes. A zero-length payload still produces one
/// (empty, last) packet so the version is delivered.
pub(crate) fn chunk_payload(
    object_id: distnet::ObjectId,
    instance_id: distnet::InstanceId,
    version: Version,
    payload: &Bytes,
) -> Vec<ObjectDataPacket> {
    let mut packets = Vec::new();
    let mut offset = 0;
    let mut sequence = 0;
    loop {
        let end = (offset + DATA_CHUNK_SIZE).min(payload.len());
        let last = end == payload.len();
        packets.push(ObjectDataPacket {
            object_id,
            instance_id,
            version,
            sequence,
            last,
            data: payload.slice(offset..end),
        });
        if last {
            break;
        }
        offset = end;
        sequence += 1;
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;
    use distnet::{ObjectId, INSTANCE_NONE};

    #[test]
    fn test_single_chunk_roundtrip() {
        let id = ObjectId::generate();
        let payload = Bytes::from_static(b"hello world");
        let packets = chunk_payload(id, INSTANCE_NONE, Version::FIRST, &payload);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].last);

        let mut stream = ObjectDataIStream::new(Version::FIRST, false, false);
        stream.add_chunk(&packets[0]).unwrap();
        assert!(stream.is_ready());
        assert_eq!(stream.concat(), payload);
    }

    #[test]
    fn test_large_payload_fragments() {
        let id = ObjectId::generate();
        let payload = Bytes::from(vec![7u8; DATA_CHUNK_SIZE * 2 + 100]);
        let packets = chunk_payload(id, INSTANCE_NONE, Version::FIRST, &payload);
        assert_eq!(packets.len(), 3);
        assert!(!packets[0].last);
        assert!(packets[2].last);
        assert_eq!(packets[2].sequence, 2);

        let mut stream = ObjectDataIStream::new(Version::FIRST, false, false);
        for packet in &packets {
            stream.add_chunk(packet).unwrap();
        }
        assert!(stream.is_ready());
        assert_eq!(stream.concat(), payload);
    }

    #[test]
    fn test_zero_length_payload() {
        let id = ObjectId::generate();
        let packets = chunk_payload(id, INSTANCE_NONE, Version::FIRST, &Bytes::new());
        assert_eq!(packets.len(), 1);
        assert!(packets[0].last);
        assert!(packets[0].data.is_empty());
    }

    #[test]
    fn test_out_of_order_chunk_rejected() {
        let id = ObjectId::generate();
        let payload = Bytes::from(vec![1u8; DATA_CHUNK_SIZE + 1]);
        let packets = chunk_payload(id, INSTANCE_NONE, Version::FIRST, &payload);
        assert_eq!(packets.len(), 2);

        let mut stream = ObjectDataIStream::new(Version::FIRST, false, false);
        assert!(stream.add_chunk(&packets[1]).is_err());
    }
}
