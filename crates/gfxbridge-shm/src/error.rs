/// Errors that can occur in shared memory and process operations.
#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    /// Failed to create a shared memory region.
    #[error("failed to create shared memory region {name}: {source}")]
    Create {
        name: String,
        source: std::io::Error,
    },

    /// Failed to open an existing shared memory region.
    #[error("failed to open shared memory region {name}: {source}")]
    Open {
        name: String,
        source: std::io::Error,
    },

    /// Failed to map a region into the address space.
    #[error("failed to map region {name} ({len} bytes): {source}")]
    Map {
        name: String,
        len: usize,
        source: std::io::Error,
    },

    /// The region name is empty, too long, or contains interior slashes.
    #[error("invalid region name {name:?}")]
    InvalidName { name: String },

    /// The region is smaller than the layout the caller requires.
    #[error("region {name} too small ({len} bytes, need {need})")]
    RegionTooSmall {
        name: String,
        len: usize,
        need: usize,
    },

    /// A semaphore operation failed.
    #[error("semaphore {name} operation failed: {source}")]
    Semaphore {
        name: String,
        source: std::io::Error,
    },

    /// A semaphore wait exceeded its deadline.
    #[error("semaphore wait timed out after {0:?}")]
    SemaphoreTimeout(std::time::Duration),

    /// Failed to spawn the worker process.
    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ShmError>;
