//! The gfxbridge worker.
//!
//! The other half of the bridge: a dedicated process (or, in tests, a
//! dedicated thread) that pops forwarded commands in order, dispatches
//! them to the execution [`Engine`], and answers the queries the
//! interceptor blocks on.
//!
//! - [`Worker`] / [`WorkerChannels`] — the command processing loop
//! - [`ObjectRegistry`] — wire handle → worker-side object mapping
//! - [`Engine`] / [`NullEngine`] — the seam to the real renderer
//! - [`handshake_server`] — worker side of the Syn/Ack/Continue dance

mod engine;
mod error;
mod handshake;
mod registry;
mod worker;

pub use engine::{Engine, NullEngine};
pub use error::{Result, ServerError};
pub use handshake::handshake_server;
pub use registry::{ObjectRegistry, WorkerObject};
pub use worker::{Worker, WorkerChannels};
