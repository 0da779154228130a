//! Object identity and the command wire format for gfxbridge.
//!
//! The interceptor and the worker are separate processes built separately;
//! everything in this crate is part of their bit-exact contract:
//!
//! - [`ObjectId`] / [`IdFactory`] — process-wide-unique object identity,
//!   narrowed to a checked `u32` wire handle
//! - [`Opcode`] / [`CommandFlags`] — the command vocabulary
//! - [`CommandHeader`] — the fixed 20-byte little-endian header
//! - [`PayloadWriter`] / [`PayloadReader`] — symmetric field-by-field
//!   payload codec with exact-consumption validation
//!
//! All multi-byte fields are little-endian; booleans are one-byte
//! sentinels. Any decoding surprise is a [`WireError`] and fatal to the
//! session, because payload framing is positional.

mod error;
mod header;
mod id;
mod opcode;
mod payload;
mod status;
mod types;

pub use error::{Result, WireError};
pub use header::{CommandHeader, HEADER_SIZE};
pub use id::{IdFactory, ObjectId};
pub use opcode::{CommandFlags, Opcode};
pub use payload::{PayloadReader, PayloadWriter, BOOL_FALSE, BOOL_TRUE};
pub use status::{LegacyResult, LegacyStatus};
pub use types::{BufferDesc, DeviceDesc, LockFlags, Rect, TextureDesc, Viewport};
