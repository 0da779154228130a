use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Boolean wire sentinels.
///
/// Booleans cross the process boundary as one distinctive byte each rather
/// than a compiler-dependent width; any other value fails decoding.
pub const BOOL_TRUE: u8 = 0xB1;
pub const BOOL_FALSE: u8 = 0xB0;

/// Serializes a command payload field by field.
///
/// All primitives have a fixed little-endian wire width. Variable-length
/// data is length-prefixed. A blob (bulk byte region) is encoded the same
/// way but must be the final field of a payload; the worker reads it last,
/// after all the parameters that describe it.
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
        }
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64_le(value);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32_le(value);
        self
    }

    pub fn put_f32(&mut self, value: f32) -> &mut Self {
        self.buf.put_f32_le(value);
        self
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(if value { BOOL_TRUE } else { BOOL_FALSE });
        self
    }

    /// Length-prefixed byte field.
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Bulk byte region; must be the last field of the payload.
    pub fn put_blob(&mut self, value: &[u8]) -> &mut Self {
        self.put_bytes(value)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and hand back the encoded payload.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Deserializes a command payload, mirroring [`PayloadWriter`] exactly.
///
/// Decoding is positional: the reader must consume fields in the order the
/// writer produced them, and [`PayloadReader::finish`] verifies the byte
/// count consumed equals the byte count produced. A mismatch means the two
/// processes disagree about a message layout, which poisons the stream.
#[derive(Debug)]
pub struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    pub fn new(payload: Bytes) -> Self {
        Self { buf: payload }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.buf.remaining() < n {
            return Err(WireError::Truncated {
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        self.need(4)?;
        Ok(self.buf.get_f32_le())
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        self.need(1)?;
        match self.buf.get_u8() {
            BOOL_TRUE => Ok(true),
            BOOL_FALSE => Ok(false),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    /// Length-prefixed byte field.
    pub fn get_bytes(&mut self) -> Result<Bytes> {
        let len = self.get_u32()? as usize;
        self.need(len)?;
        Ok(self.buf.split_to(len))
    }

    /// Bulk byte region; by convention the last field of the payload.
    pub fn get_blob(&mut self) -> Result<Bytes> {
        self.get_bytes()
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    /// Verify the payload was consumed exactly.
    pub fn finish(self) -> Result<()> {
        if self.buf.remaining() > 0 {
            return Err(WireError::TrailingBytes {
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }
}
