//! Bulk data arena for gfxbridge.
//!
//! Large payloads (pixel buffers, vertex data) would dominate the command
//! channel if copied through it, so they travel by reference instead: the
//! interceptor allocates a region in a second shared memory area, writes
//! the bytes once, and transmits only the allocation id. The worker reads
//! the data in place through its own mapping of the same area.
//!
//! The allocator lives on the interceptor side ([`SharedHeap`]); the
//! worker keeps a passive id → placement map ([`HeapView`]) fed by
//! `HeapAlloc`/`HeapFree` commands. Exhaustion is not an error — callers
//! fall back to sending bytes inline through the channel blob region.

mod error;
mod heap;
mod view;

pub use error::{HeapError, Result};
pub use heap::{AllocId, Placement, SharedHeap};
pub use view::HeapView;
