use gfxbridge_shm::ShmError;

/// Errors that can occur in the bulk data arena.
#[derive(Debug, thiserror::Error)]
pub enum HeapError {
    /// The chunk size must be a non-zero power of two no larger than the
    /// region.
    #[error("invalid heap geometry (region {region_len} bytes, chunk {chunk_len})")]
    InvalidGeometry { region_len: usize, chunk_len: usize },

    /// An allocation id is unknown (already freed, or never registered).
    #[error("unknown bulk allocation id {0}")]
    UnknownAlloc(u32),

    /// An access would run past the end of an allocation.
    #[error("bulk access out of bounds (offset {offset} + len {len} > {alloc_len})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        alloc_len: usize,
    },

    /// A shared memory error.
    #[error(transparent)]
    Shm(#[from] ShmError),
}

pub type Result<T> = std::result::Result<T, HeapError>;
