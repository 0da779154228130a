//! Shared memory, semaphores and process lifecycle for gfxbridge.
//!
//! This crate owns the operating-system collaborators of the bridge:
//!
//! - [`SharedRegion`] — named or anonymous shared memory mappings that back
//!   the command channels and the bulk data arena
//! - [`NamedSemaphore`] — cross-process counting semaphore used for frame
//!   pacing
//! - [`WorkerProcess`] — spawn the worker executable and watch for its exit
//!
//! Everything here is unix-only today, mirroring the platform coverage of
//! the rest of the workspace.

mod error;
mod process;
mod region;
mod semaphore;

pub use error::{Result, ShmError};
pub use process::WorkerProcess;
pub use region::SharedRegion;
pub use semaphore::NamedSemaphore;
