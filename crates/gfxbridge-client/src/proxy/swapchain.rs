use std::sync::{Arc, Mutex, Weak};

use gfxbridge_wire::{DeviceDesc, ObjectId, Opcode, PayloadWriter};

use crate::proxy::surface::ParentLink;
use crate::proxy::{
    CapabilityKind, CapabilityRef, Container, ProxyCore, ProxyKind, ProxyObject, SurfaceProxy,
};
use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

/// The swap chain proxy: a container of back-buffer surfaces, and the
/// second entry point for frame presentation.
pub struct SwapChainProxy {
    core: ProxyCore,
    width: u32,
    height: u32,
    back_buffers: u32,
    children: Mutex<Vec<Option<Arc<SurfaceProxy>>>>,
    weak_self: Weak<SwapChainProxy>,
}

impl SwapChainProxy {
    pub(crate) fn create(session: Arc<BridgeSession>, desc: DeviceDesc) -> LegacyResult<Arc<Self>> {
        let core = ProxyCore::new(session)?;
        let back_buffers = desc.back_buffers.max(1);
        Ok(Arc::new_cyclic(|weak_self| Self {
            core,
            width: desc.width,
            height: desc.height,
            back_buffers,
            children: Mutex::new(vec![None; back_buffers as usize]),
            weak_self: weak_self.clone(),
        }))
    }

    pub(crate) fn wire_handle(&self) -> u32 {
        self.core.handle()
    }

    pub fn back_buffer_count(&self) -> u32 {
        self.back_buffers
    }

    /// Fetch one back buffer, creating and linking it on first access.
    /// Cached by index for identity stability.
    pub fn get_back_buffer(&self, index: u32) -> LegacyResult<Arc<SurfaceProxy>> {
        if index >= self.back_buffers {
            return Err(LegacyStatus::INVALID_CALL);
        }
        let session = self.core.session();
        session.ensure_running()?;

        let mut children = self.children.lock().expect("swap chain children poisoned");
        if let Some(surface) = children[index as usize].as_ref() {
            surface.add_ref();
            return Ok(Arc::clone(surface));
        }

        let surface = SurfaceProxy::create_child(
            Arc::clone(session),
            self.width,
            self.height,
            0,
            ParentLink::SwapChain(self.weak_self.clone()),
            index,
        )?;
        let mut payload = PayloadWriter::new();
        payload.put_u32(index).put_u32(surface.wire_handle());
        session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::LinkBackBuffer),
            &payload.finish(),
        )?;

        children[index as usize] = Some(Arc::clone(&surface));
        Ok(surface)
    }

    /// Present through this swap chain. Gated by the frame pacer exactly
    /// like the device-level present.
    pub fn present(&self) -> LegacyStatus {
        let session = self.core.session();
        if session.ensure_running().is_err() {
            return LegacyStatus::DEVICE_LOST;
        }
        if !session.acquire_frame() {
            return LegacyStatus::DEVICE_LOST;
        }
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::SwapChainPresent),
            &[],
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    /// Called by the owning device on destruction: unlink the back
    /// buffers first, then this swap chain itself.
    pub(crate) fn parent_destroyed(&self) {
        let mut children = self.children.lock().expect("swap chain children poisoned");
        for slot in children.iter_mut() {
            if let Some(surface) = slot.take() {
                surface.parent_destroyed();
            }
        }
        drop(children);
        let session = self.core.session();
        let _ = session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::UnlinkChild),
            &[],
        );
    }
}

impl ProxyObject for SwapChainProxy {
    fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::SwapChain
    }

    fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    fn release(&self) -> u32 {
        match self.core.release_count() {
            Some(0) => {
                let mut children = self.children.lock().expect("swap chain children poisoned");
                for slot in children.iter_mut() {
                    if let Some(surface) = slot.take() {
                        surface.parent_destroyed();
                    }
                }
                drop(children);
                let session = self.core.session();
                let _ = session.forget(
                    session.device_caller(),
                    self.core.cmd(Opcode::SwapChainDestroy),
                    &[],
                );
                0
            }
            Some(count) => count,
            None => 0,
        }
    }

    fn query_capability(&self, kind: CapabilityKind) -> Option<CapabilityRef<'_>> {
        match kind {
            CapabilityKind::Container => Some(CapabilityRef::Container(self)),
            CapabilityKind::Lockable => None,
        }
    }
}

impl Container for SwapChainProxy {
    fn child_count(&self) -> u32 {
        self.back_buffers
    }

    fn child_at(&self, index: u32) -> LegacyResult<Arc<SurfaceProxy>> {
        self.get_back_buffer(index)
    }
}

impl std::fmt::Debug for SwapChainProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapChainProxy")
            .field("id", &self.core.id())
            .field("back_buffers", &self.back_buffers)
            .finish()
    }
}
