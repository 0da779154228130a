/// Errors that can occur while encoding or decoding wire messages.
///
/// Every variant except `HandleOverflow` indicates a protocol error: the
/// channel byte stream can no longer be trusted and the bridge session must
/// shut down (payload framing is positional, so one bad message poisons
/// everything after it).
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The opcode value does not name a known command.
    #[error("unknown opcode 0x{0:04x}")]
    UnknownOpcode(u16),

    /// The header buffer is shorter than the fixed header layout.
    #[error("header too short ({len} bytes, need {need})")]
    HeaderTooShort { len: usize, need: usize },

    /// A payload read ran past the end of the payload.
    #[error("payload truncated (need {need} more bytes, {have} available)")]
    Truncated { need: usize, have: usize },

    /// Decoding finished without consuming the full payload.
    #[error("payload size mismatch ({remaining} bytes left undecoded)")]
    TrailingBytes { remaining: usize },

    /// A boolean field held neither sentinel value.
    #[error("invalid boolean sentinel 0x{0:02x}")]
    InvalidBool(u8),

    /// An object id does not fit the wire handle width.
    #[error("object id {0} exceeds the u32 wire handle width")]
    HandleOverflow(u64),

    /// A wire handle was zero where a live object was required.
    #[error("null wire handle")]
    NullHandle,
}

pub type Result<T> = std::result::Result<T, WireError>;
