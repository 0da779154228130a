use std::sync::{Arc, Mutex, Weak};

use gfxbridge_wire::{ObjectId, Opcode, PayloadWriter, TextureDesc};

use crate::proxy::surface::ParentLink;
use crate::proxy::{
    CapabilityKind, CapabilityRef, Container, ProxyCore, ProxyKind, ProxyObject, SurfaceProxy,
};
use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

/// A texture proxy: a container of one lockable surface per mip level.
///
/// Children are created lazily on first access and cached by level, so
/// repeated queries for the same level return the same identity instead of
/// minting duplicates. Destroying the texture invalidates and unlinks the
/// children first; they never send their own destroy.
pub struct TextureProxy {
    core: ProxyCore,
    desc: TextureDesc,
    children: Mutex<Vec<Option<Arc<SurfaceProxy>>>>,
    weak_self: Weak<TextureProxy>,
}

impl TextureProxy {
    pub(crate) fn create(session: Arc<BridgeSession>, desc: TextureDesc) -> LegacyResult<Arc<Self>> {
        let core = ProxyCore::new(session)?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            core,
            desc,
            children: Mutex::new(vec![None; desc.levels as usize]),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }

    pub(crate) fn wire_handle(&self) -> u32 {
        self.core.handle()
    }

    /// Fetch the surface for one mip level, creating and linking it on
    /// first access.
    pub fn get_surface_level(&self, level: u32) -> LegacyResult<Arc<SurfaceProxy>> {
        if level >= self.desc.levels {
            return Err(LegacyStatus::INVALID_CALL);
        }
        let session = self.core.session();
        session.ensure_running()?;

        let mut children = self.children.lock().expect("texture children poisoned");
        if let Some(surface) = children[level as usize].as_ref() {
            surface.add_ref();
            return Ok(Arc::clone(surface));
        }

        let (width, height) = self.desc.level_extent(level);
        let surface = SurfaceProxy::create_child(
            Arc::clone(session),
            width,
            height,
            self.desc.format,
            ParentLink::Texture(self.weak_self.clone()),
            level,
        )?;

        // Tell the worker which identity the new child carries, so both
        // sides agree before any call targets it.
        let mut payload = PayloadWriter::new();
        payload.put_u32(level).put_u32(surface.wire_handle());
        session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::TextureGetSurfaceLevel),
            &payload.finish(),
        )?;

        children[level as usize] = Some(Arc::clone(&surface));
        Ok(surface)
    }

    /// Regenerate the mip tail from level zero.
    pub fn generate_mips(&self) -> LegacyStatus {
        let session = self.core.session();
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::TextureGenerateMips),
            &[],
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    /// Residency priority hint. Purely informational, so the command is
    /// allowed to be dropped under channel pressure.
    pub fn set_priority(&self, priority: u32) -> LegacyStatus {
        let session = self.core.session();
        if session.ensure_running().is_err() {
            return LegacyStatus::DEVICE_LOST;
        }
        let mut payload = PayloadWriter::new();
        payload.put_u32(priority);
        match session
            .device_caller()
            .send_lossy(self.core.cmd(Opcode::TextureSetPriority), &payload.finish())
        {
            Ok(_pushed) => LegacyStatus::OK,
            Err(err) => session.map_channel_error(err),
        }
    }
}

impl ProxyObject for TextureProxy {
    fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Texture
    }

    fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    fn release(&self) -> u32 {
        match self.core.release_count() {
            Some(0) => {
                // Children are invalidated first: each sends only an
                // unlink notice, never its own destroy.
                let mut children = self.children.lock().expect("texture children poisoned");
                for slot in children.iter_mut() {
                    if let Some(surface) = slot.take() {
                        surface.parent_destroyed();
                    }
                }
                drop(children);
                let session = self.core.session();
                let _ = session.forget(
                    session.device_caller(),
                    self.core.cmd(Opcode::TextureDestroy),
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

impl Container for TextureProxy {
    fn child_count(&self) -> u32 {
        self.desc.levels
    }

    fn child_at(&self, index: u32) -> LegacyResult<Arc<SurfaceProxy>> {
        self.get_surface_level(index)
    }
}

impl std::fmt::Debug for TextureProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureProxy")
            .field("id", &self.core.id())
            .field("desc", &self.desc)
            .finish()
    }
}
