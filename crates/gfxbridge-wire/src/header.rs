use bytes::{Buf, BufMut};

use crate::error::{Result, WireError};
use crate::opcode::{CommandFlags, Opcode};

/// Fixed-layout command header, 20 bytes little-endian:
///
/// ```text
/// ┌────────────┬───────────┬─────────────┬──────────────────┬─────────────────┬────────────────────┐
/// │ opcode u16 │ flags u16 │ target u32  │ correlation u32  │ payload_size u32│ payload_offset u32 │
/// └────────────┴───────────┴─────────────┴──────────────────┴─────────────────┴────────────────────┘
/// ```
///
/// `target` is the narrowed wire handle of the object the command operates
/// on (0 for control traffic). `correlation` ties a response back to the
/// request that asked for it (0 for fire-and-forget). `payload_offset` is
/// the producer's data-ring position immediately after the payload was
/// written; the consumer checks its own position against it after decoding,
/// which catches producer/consumer desync before it can corrupt later
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub opcode: Opcode,
    pub flags: CommandFlags,
    pub target: u32,
    pub correlation: u32,
    pub payload_size: u32,
    pub payload_offset: u32,
}

/// Encoded size of [`CommandHeader`]; also the command ring slot size.
pub const HEADER_SIZE: usize = 20;

impl CommandHeader {
    /// A control header with no target object.
    pub fn control(opcode: Opcode) -> Self {
        Self {
            opcode,
            flags: CommandFlags::NONE,
            target: 0,
            correlation: 0,
            payload_size: 0,
            payload_offset: 0,
        }
    }

    /// Encode into exactly [`HEADER_SIZE`] bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        {
            let mut dst = &mut buf[..];
            dst.put_u16_le(self.opcode.as_u16());
            dst.put_u16_le(self.flags.bits());
            dst.put_u32_le(self.target);
            dst.put_u32_le(self.correlation);
            dst.put_u32_le(self.payload_size);
            dst.put_u32_le(self.payload_offset);
        }
        buf
    }

    /// Decode from a slot. Unknown opcodes are a protocol error.
    pub fn decode(mut src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(WireError::HeaderTooShort {
                len: src.len(),
                need: HEADER_SIZE,
            });
        }
        let opcode = Opcode::from_u16(src.get_u16_le())?;
        let flags = CommandFlags::from_bits(src.get_u16_le());
        let target = src.get_u32_le();
        let correlation = src.get_u32_le();
        let payload_size = src.get_u32_le();
        let payload_offset = src.get_u32_le();
        Ok(Self {
            opcode,
            flags,
            target,
            correlation,
            payload_size,
            payload_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let header = CommandHeader {
            opcode: Opcode::DeviceClear,
            flags: CommandFlags::DATA_IN_HEAP,
            target: 17,
            correlation: 9001,
            payload_size: 128,
            payload_offset: 4096,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(CommandHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn control_header_is_empty_addressed() {
        let header = CommandHeader::control(Opcode::Syn);
        assert_eq!(header.target, 0);
        assert_eq!(header.correlation, 0);
        assert_eq!(header.payload_size, 0);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = CommandHeader::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, WireError::HeaderTooShort { len: 10, .. }));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let mut bytes = CommandHeader::control(Opcode::Ack).encode();
        bytes[0] = 0x99;
        bytes[1] = 0x99;
        assert!(matches!(
            CommandHeader::decode(&bytes),
            Err(WireError::UnknownOpcode(0x9999))
        ));
    }
}
