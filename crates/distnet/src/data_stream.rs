//! Typed payload streams.
//!
//! A [`DataOStream`] accumulates the serialized state of an object; the
//! object layer slices the finished buffer into data packets when it exceeds
//! the packet size. A [`DataIStream`] reassembles the received chunks and
//! reads the values back, swapping byte order when the sender's differs.
//!
//! Strings are `{len:u32}{utf8}{NUL}`; identifiers are raw 16-byte values;
//! everything else is fixed-width integers in the sender's byte order.

use crate::error::{NetError, Result};
use crate::types::{NodeId, ObjectId, SessionId, Version};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Output stream for serializing object state.
#[derive(Default)]
pub struct DataOStream {
    buf: BytesMut,
}

impl DataOStream {
    pub fn new() -> Self {
        DataOStream { buf: BytesMut::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        DataOStream { buf: BytesMut::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16_ne(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32_ne(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_ne(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_ne(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_ne(value);
    }

    pub fn write_u128(&mut self, value: u128) {
        self.buf.put_u128_ne(value);
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.put_u32_ne(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.put_u64_ne(value.to_bits());
    }

    pub fn write_version(&mut self, value: Version) {
        value.encode(&mut self.buf);
    }

    pub fn write_node_id(&mut self, value: NodeId) {
        value.encode(&mut self.buf);
    }

    pub fn write_object_id(&mut self, value: ObjectId) {
        value.encode(&mut self.buf);
    }

    pub fn write_session_id(&mut self, value: SessionId) {
        value.encode(&mut self.buf);
    }

    /// Length-prefixed, NUL-terminated string.
    pub fn write_string(&mut self, value: &str) {
        self.buf.put_u32_ne(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
        self.buf.put_u8(0);
    }

    /// Length-prefixed opaque byte span.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.buf.put_u64_ne(value.len() as u64);
        self.buf.put_slice(value);
    }

    /// Raw bytes without a length prefix.
    pub fn write_raw(&mut self, value: &[u8]) {
        self.buf.put_slice(value);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Input stream over one or more received payload chunks.
pub struct DataIStream {
    chunks: std::collections::VecDeque<Bytes>,
    current: Bytes,
    big_endian: bool,
    remaining: usize,
}

impl DataIStream {
    /// Stream over a single contiguous buffer.
    pub fn from_bytes(data: Bytes, big_endian: bool) -> Self {
        let remaining = data.len();
        DataIStream {
            chunks: std::collections::VecDeque::new(),
            current: data,
            big_endian,
            remaining,
        }
    }

    /// Stream over received chunks in arrival order.
    pub fn from_chunks<I: IntoIterator<Item = Bytes>>(chunks: I, big_endian: bool) -> Self {
        let mut queue: std::collections::VecDeque<Bytes> = chunks.into_iter().collect();
        let remaining = queue.iter().map(Bytes::len).sum();
        let current = queue.pop_front().unwrap_or_default();
        DataIStream { chunks: queue, current, big_endian, remaining }
    }

    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// Fill `out` from the stream, crossing chunk boundaries as needed.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.remaining {
            return Err(NetError::StreamUnderflow {
                needed: out.len(),
                remaining: self.remaining,
            });
        }
        let mut filled = 0;
        while filled < out.len() {
            if !self.current.has_remaining() {
                self.current = self
                    .chunks
                    .pop_front()
                    .expect("chunk accounting out of sync");
                continue;
            }
            let n = (out.len() - filled).min(self.current.remaining());
            self.current.copy_to_slice(&mut out[filled..filled + n]);
            filled += n;
        }
        self.remaining -= out.len();
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(if self.big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(if self.big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(if self.big_endian { u64::from_be_bytes(b) } else { u64::from_le_bytes(b) })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_u128(&mut self) -> Result<u128> {
        let mut b = [0u8; 16];
        self.read_exact(&mut b)?;
        Ok(if self.big_endian { u128::from_be_bytes(b) } else { u128::from_le_bytes(b) })
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_version(&mut self) -> Result<Version> {
        let high = self.read_u64()?;
        let low = self.read_u64()?;
        Ok(Version::new(high, low))
    }

    pub fn read_node_id(&mut self) -> Result<NodeId> {
        let mut b = [0u8; 16];
        self.read_exact(&mut b)?;
        Ok(NodeId(b))
    }

    pub fn read_object_id(&mut self) -> Result<ObjectId> {
        let mut b = [0u8; 16];
        self.read_exact(&mut b)?;
        Ok(ObjectId(b))
    }

    pub fn read_session_id(&mut self) -> Result<SessionId> {
        let mut b = [0u8; 16];
        self.read_exact(&mut b)?;
        Ok(SessionId(b))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        let nul = self.read_u8()?;
        if nul != 0 {
            return Err(NetError::Framing("string missing NUL terminator".into()));
        }
        String::from_utf8(bytes).map_err(|e| NetError::Framing(format!("bad utf-8 string: {e}")))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u64()? as usize;
        if len > self.remaining {
            return Err(NetError::StreamUnderflow { needed: len, remaining: self.remaining });
        }
        let mut bytes = vec![0u8; len];
        self.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn native_big_endian() -> bool {
        cfg!(target_endian = "big")
    }

    #[test]
    fn test_roundtrip_primitives() {
        let mut os = DataOStream::new();
        os.write_u8(0xab);
        os.write_bool(true);
        os.write_u16(0x1234);
        os.write_u32(0xdead_beef);
        os.write_u64(0x0123_4567_89ab_cdef);
        os.write_i32(-42);
        os.write_f64(std::f64::consts::PI);
        os.write_version(Version::new(0, 7));
        os.write_string("So long, and thanks for all the fish");
        os.write_bytes(b"payload");
        os.write_bytes(b"");

        let mut is = DataIStream::from_bytes(os.into_bytes(), native_big_endian());
        assert_eq!(is.read_u8().unwrap(), 0xab);
        assert!(is.read_bool().unwrap());
        assert_eq!(is.read_u16().unwrap(), 0x1234);
        assert_eq!(is.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(is.read_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(is.read_i32().unwrap(), -42);
        assert_eq!(is.read_f64().unwrap(), std::f64::consts::PI);
        assert_eq!(is.read_version().unwrap(), Version::new(0, 7));
        assert_eq!(is.read_string().unwrap(), "So long, and thanks for all the fish");
        assert_eq!(is.read_bytes().unwrap(), b"payload");
        assert_eq!(is.read_bytes().unwrap(), b"");
        assert!(is.is_empty());
    }

    #[test]
    fn test_reads_cross_chunk_boundaries() {
        let mut os = DataOStream::new();
        os.write_u64(0x1122_3344_5566_7788);
        os.write_string("chunked");
        let data = os.into_bytes();

        // Split mid-integer to force a boundary crossing.
        let chunks = vec![data.slice(..3), data.slice(3..10), data.slice(10..)];
        let mut is = DataIStream::from_chunks(chunks, native_big_endian());
        assert_eq!(is.read_u64().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(is.read_string().unwrap(), "chunked");
    }

    #[test]
    fn test_underflow_is_an_error() {
        let mut is = DataIStream::from_bytes(Bytes::from_static(&[1, 2]), false);
        assert!(matches!(is.read_u32(), Err(NetError::StreamUnderflow { .. })));
    }

    proptest! {
        #[test]
        fn prop_roundtrip(
            a in any::<u32>(),
            b in any::<u64>(),
            s in "\\PC{0,64}",
            data in proptest::collection::vec(any::<u8>(), 0..512),
            split in 0usize..64,
        ) {
            let mut os = DataOStream::new();
            os.write_u32(a);
            os.write_u64(b);
            os.write_string(&s);
            os.write_bytes(&data);
            let bytes = os.into_bytes();

            let cut = split.min(bytes.len());
            let chunks = vec![bytes.slice(..cut), bytes.slice(cut..)];
            let mut is = DataIStream::from_chunks(chunks, native_big_endian());
            prop_assert_eq!(is.read_u32().unwrap(), a);
            prop_assert_eq!(is.read_u64().unwrap(), b);
            prop_assert_eq!(is.read_string().unwrap(), s);
            prop_assert_eq!(is.read_bytes().unwrap(), data);
            prop_assert!(is.is_empty());
        }
    }
}
