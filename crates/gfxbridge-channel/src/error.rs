use gfxbridge_shm::ShmError;
use gfxbridge_wire::WireError;

/// Errors that can occur on a shared command channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The ring is full and the command was marked lossy.
    #[error("channel full (command dropped)")]
    Full,

    /// No message arrived (or no space freed) before the deadline.
    #[error("channel operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A durable push exhausted the long safety timeout. Fatal: the
    /// consumer has stopped draining and the session cannot make progress.
    #[error("durable push stalled for {0:?}; consumer is not draining")]
    Stalled(std::time::Duration),

    /// The payload cannot ever fit the channel's data ring.
    #[error("payload too large ({size} bytes, data ring holds {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Producer and consumer disagree about the data ring position.
    /// Fatal: payload framing is positional and now corrupt.
    #[error("data ring desync (expected position {expected}, actual {actual})")]
    DataDesync { expected: u32, actual: u32 },

    /// The region is too small for the configured channel layout.
    #[error("region too small for channel layout ({len} bytes, need {need})")]
    RegionTooSmall { len: usize, need: usize },

    /// The channel (or the whole session) was shut down.
    #[error("channel closed")]
    Closed,

    /// A wire-format error. Fatal to the session.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// A shared memory error.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

impl ChannelError {
    /// True for errors that poison the whole bridge session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::Stalled(_)
                | ChannelError::DataDesync { .. }
                | ChannelError::Wire(_)
                | ChannelError::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
