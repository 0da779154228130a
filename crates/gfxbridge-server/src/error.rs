use gfxbridge_channel::ChannelError;
use gfxbridge_heap::HeapError;
use gfxbridge_shm::ShmError;
use gfxbridge_wire::WireError;

/// Errors internal to the worker side of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The Syn/Continue handshake did not complete in time.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A command referenced a handle the registry does not know.
    /// Protocol error: the two sides disagree about object identity.
    #[error("unknown object handle #{0}")]
    UnknownHandle(u32),

    /// A command payload did not match the expected shape.
    #[error("malformed {opcode} payload: {source}")]
    MalformedPayload {
        opcode: &'static str,
        source: WireError,
    },

    /// A channel error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// A wire-format error.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A shared memory or semaphore error.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// A bulk arena error.
    #[error(transparent)]
    Heap(#[from] HeapError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
