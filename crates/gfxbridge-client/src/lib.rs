//! The gfxbridge interceptor.
//!
//! This crate is the in-process half of the bridge: it presents the fixed
//! legacy graphics interface to the host application and transparently
//! forwards every call to the worker process.
//!
//! - [`BridgeSession`] — one context object owning the channels, call
//!   adapters, bulk arena, frame pacer and worker handle
//! - [`BridgeOptions`] — configuration read once at initialization
//! - [`proxy`] — the object proxy layer (module, device, swap chain,
//!   texture, surface, buffer)
//! - [`LegacyStatus`] — the legacy contract's status vocabulary; the only
//!   error type that ever crosses the proxy boundary

mod error;
mod handshake;
mod options;
mod pacer;
pub mod proxy;
mod session;

pub use error::{ClientError, Result};
pub use gfxbridge_wire::{LegacyResult, LegacyStatus};
pub use handshake::handshake_client;
pub use options::{BridgeOptions, OPTIONS_FILE_ENV};
pub use pacer::FramePacer;
pub use session::BridgeSession;
