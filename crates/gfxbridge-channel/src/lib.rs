//! Shared command channels for gfxbridge.
//!
//! A channel is a single-producer/single-consumer pair of rings living in
//! one shared memory region: a command ring of fixed header slots and a
//! byte ring for payloads. Messages arrive exactly in push order, with no
//! loss and no duplication; the consumer cross-checks its payload position
//! against the position the producer recorded in every header, so a
//! framing disagreement is caught immediately instead of corrupting the
//! stream silently.
//!
//! - [`ChannelWriter`] / [`ChannelReader`] — the two endpoint roles
//! - [`ChannelConfig`] — ring geometry and timeout policy
//! - [`SyncCaller`] — request/response semantics over a channel pair,
//!   with correlation-id matching, bounded waits and orphan discard
//! - [`HistoryEntry`] — bounded recent-command history for postmortems

mod adapter;
mod channel;
mod error;
mod ring;

pub use adapter::SyncCaller;
pub use channel::{ChannelConfig, ChannelReader, ChannelWriter, HistoryEntry};
pub use error::{ChannelError, Result};
pub use ring::{Message, RingLayout};
