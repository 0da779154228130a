//! gfxbridge splits a single-process graphics client into two processes:
//! a thin interceptor that presents the original, fixed legacy interface
//! inside the host application, and a worker process that performs the
//! real rendering work. Every call is forwarded over shared-memory
//! command channels and returns as if it executed locally.
//!
//! # Crate Structure
//!
//! - [`shm`] — shared memory regions, named semaphores, worker process
//!   lifecycle
//! - [`wire`] — object identity, opcodes, the command wire format
//! - [`channel`] — SPSC command channels and the synchronous-call adapter
//! - [`heap`] — the bulk data arena for large payloads
//! - [`client`] — the interceptor: session, options, object proxies
//! - [`server`] — the worker: command loop, registry, engine seam

/// Re-export shared memory types.
pub mod shm {
    pub use gfxbridge_shm::*;
}

/// Re-export wire format types.
pub mod wire {
    pub use gfxbridge_wire::*;
}

/// Re-export channel types.
pub mod channel {
    pub use gfxbridge_channel::*;
}

/// Re-export bulk arena types.
pub mod heap {
    pub use gfxbridge_heap::*;
}

/// Re-export interceptor types.
pub mod client {
    pub use gfxbridge_client::*;
}

/// Re-export worker types.
pub mod server {
    pub use gfxbridge_server::*;
}
