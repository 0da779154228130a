use std::collections::HashMap;

use gfxbridge_wire::{BufferDesc, DeviceDesc, TextureDesc};
use tracing::warn;

use crate::error::{Result, ServerError};

/// Worker-side state for one bridged object, keyed by the wire handle the
/// interceptor minted for it.
#[derive(Debug)]
pub enum WorkerObject {
    Device {
        desc: DeviceDesc,
        render_states: HashMap<u32, u32>,
    },
    SwapChain {
        back_buffers: u32,
        width: u32,
        height: u32,
    },
    Texture {
        desc: TextureDesc,
    },
    Surface {
        width: u32,
        height: u32,
        data: Vec<u8>,
    },
    Buffer {
        desc: BufferDesc,
        data: Vec<u8>,
    },
}

/// Maps the interceptor's wire handles onto worker-side objects.
///
/// Handles are minted by the interceptor and arrive through create and
/// link commands; a command targeting an unregistered handle means the
/// two processes disagree about identity, which is a protocol error.
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: HashMap<u32, WorkerObject>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: u32, object: WorkerObject) {
        if self.objects.insert(handle, object).is_some() {
            warn!(handle, "handle re-registered; replacing object");
        }
    }

    pub fn get(&self, handle: u32) -> Result<&WorkerObject> {
        self.objects
            .get(&handle)
            .ok_or(ServerError::UnknownHandle(handle))
    }

    pub fn get_mut(&mut self, handle: u32) -> Result<&mut WorkerObject> {
        self.objects
            .get_mut(&handle)
            .ok_or(ServerError::UnknownHandle(handle))
    }

    /// Remove an object (destroy or unlink). Removing an unknown handle
    /// is tolerated with a warning: destroy notices can arrive for
    /// objects the worker already dropped with their parent.
    pub fn remove(&mut self, handle: u32) -> Option<WorkerObject> {
        let removed = self.objects.remove(&handle);
        if removed.is_none() {
            warn!(handle, "remove of unknown handle ignored");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
