use gfxbridge_channel::ChannelError;
use gfxbridge_heap::HeapError;
use gfxbridge_shm::ShmError;
use gfxbridge_wire::WireError;

/// Errors internal to the interceptor side of the bridge.
///
/// These never cross the proxy boundary; there they are translated into
/// the nearest [`LegacyStatus`](crate::LegacyStatus) value.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The Syn/Ack/Continue handshake did not complete in time.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The bridge session has been poisoned (fatal error or worker exit).
    #[error("bridge session is not running")]
    NotRunning,

    /// The options file could not be read or parsed.
    #[error("failed to load options from {path}: {reason}")]
    Options { path: String, reason: String },

    /// A channel error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A wire-format error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A shared memory or process error.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// A bulk arena error.
    #[error(transparent)]
    Heap(#[from] HeapError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
