use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, WireError};

/// Process-wide-unique identity of a bridged object.
///
/// Assigned once at proxy construction and never reused; the sole key the
/// interceptor and the worker share when referring to "the same" object.
/// Zero is reserved as the "no identity" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The reserved "no identity" value. Never minted by the factory.
    pub const NONE: ObjectId = ObjectId(0);

    /// The raw 64-bit value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Narrow the id to the 32-bit wire handle width.
    ///
    /// The wire handle is contractually `u32` (see the header layout); ids
    /// are minted sequentially so overflow takes billions of objects, but
    /// the conversion is checked at both ends rather than truncated.
    pub fn wire_handle(self) -> Result<u32> {
        u32::try_from(self.0).map_err(|_| WireError::HandleOverflow(self.0))
    }

    /// Reconstruct an id from a wire handle received from the peer.
    pub fn from_wire_handle(handle: u32) -> ObjectId {
        ObjectId(u64::from(handle))
    }

    /// True for the reserved sentinel.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mints strictly increasing [`ObjectId`]s, starting at 1.
///
/// Thread-safe; one factory lives in the bridge session.
#[derive(Debug)]
pub struct IdFactory {
    next: AtomicU64,
}

impl IdFactory {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// The next unique id. Never returns [`ObjectId::NONE`].
    pub fn next_id(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdFactory {
    fn default() -> Self {
        Self::new()
    }
}
