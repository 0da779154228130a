use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use gfxbridge_wire::{CommandFlags, LockFlags, ObjectId, Opcode, PayloadWriter, Rect};
use tracing::debug;

use crate::proxy::{
    CapabilityKind, CapabilityRef, Lockable, ProxyCore, ProxyKind, ProxyObject, SwapChainProxy,
    TextureProxy,
};
use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

/// Bytes per pixel of every surface format this interface carries.
/// Formats narrower than 32 bits are padded by the legacy contract.
const BYTES_PER_PIXEL: u32 = 4;

/// Payloads up to this size go inline through the channel blob region;
/// larger ones go through the bulk arena when it has room.
const INLINE_LIMIT: usize = 64 * 1024;

/// Non-owning back-reference from a child surface to its container.
pub(crate) enum ParentLink {
    Texture(Weak<TextureProxy>),
    SwapChain(Weak<SwapChainProxy>),
}

struct LockInfo {
    rect: Rect,
    flags: LockFlags,
}

struct SurfaceInner {
    /// Full-surface staging copy the application writes through while a
    /// lock is held.
    shadow: Vec<u8>,
    /// Outstanding locks, oldest first. Unlock always applies to the
    /// front; misbehaving callers that unlock out of order still resolve
    /// deterministically.
    locks: VecDeque<LockInfo>,
}

/// A 2D child resource (one mip level of a texture, or one back buffer of
/// a swap chain). Lockable; never owns its container.
pub struct SurfaceProxy {
    core: ProxyCore,
    width: u32,
    height: u32,
    format: u32,
    parent_index: u32,
    parent: Mutex<Option<ParentLink>>,
    orphaned: AtomicBool,
    inner: Mutex<SurfaceInner>,
}

/// Write access to a locked surface's staging memory. Row addressing uses
/// [`pitch`](SurfaceLockGuard::pitch). Drop the guard before calling
/// `unlock`.
pub struct SurfaceLockGuard<'a> {
    inner: MutexGuard<'a, SurfaceInner>,
    pitch: u32,
}

impl SurfaceLockGuard<'_> {
    /// Bytes per row of the staging memory.
    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner.shadow
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.inner.shadow
    }
}

impl SurfaceProxy {
    pub(crate) fn create_child(
        session: Arc<BridgeSession>,
        width: u32,
        height: u32,
        format: u32,
        parent: ParentLink,
        parent_index: u32,
    ) -> LegacyResult<Arc<Self>> {
        let core = ProxyCore::new(session)?;
        let shadow_len = (width * height * BYTES_PER_PIXEL) as usize;
        Ok(Arc::new(Self {
            core,
            width,
            height,
            format,
            parent_index,
            parent: Mutex::new(Some(parent)),
            orphaned: AtomicBool::new(false),
            inner: Mutex::new(SurfaceInner {
                shadow: vec![0; shadow_len],
                locks: VecDeque::new(),
            }),
        }))
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    /// Index of this child in its container (mip level or back buffer
    /// index).
    pub fn parent_index(&self) -> u32 {
        self.parent_index
    }

    pub(crate) fn wire_handle(&self) -> u32 {
        self.core.handle()
    }

    /// The owning container, while it is still alive.
    pub fn container(&self) -> Option<Arc<dyn ProxyObject>> {
        let parent = self.parent.lock().expect("surface parent poisoned");
        match parent.as_ref()? {
            ParentLink::Texture(weak) => weak.upgrade().map(|t| t as Arc<dyn ProxyObject>),
            ParentLink::SwapChain(weak) => weak.upgrade().map(|s| s as Arc<dyn ProxyObject>),
        }
    }

    /// Lock a rectangle (or the whole surface) for CPU access. Purely
    /// local: the staging copy is handed out and the lock is queued; the
    /// wire traffic happens at unlock.
    pub fn lock(
        &self,
        rect: Option<Rect>,
        flags: LockFlags,
    ) -> LegacyResult<SurfaceLockGuard<'_>> {
        self.core.session().ensure_running()?;
        let rect = rect.unwrap_or(Rect {
            x: 0,
            y: 0,
            width: self.width,
            height: self.height,
        });
        if rect.width == 0
            || rect.height == 0
            || u64::from(rect.x) + u64::from(rect.width) > u64::from(self.width)
            || u64::from(rect.y) + u64::from(rect.height) > u64::from(self.height)
        {
            return Err(LegacyStatus::INVALID_CALL);
        }

        let mut inner = self.inner.lock().expect("surface inner poisoned");
        inner.locks.push_back(LockInfo { rect, flags });
        Ok(SurfaceLockGuard {
            inner,
            pitch: self.width * BYTES_PER_PIXEL,
        })
    }

    /// Transmit the oldest outstanding lock's bytes and retire it. With
    /// none outstanding this is a silent no-op and emits nothing.
    pub fn unlock(&self) -> LegacyStatus {
        let session = self.core.session();
        let mut inner = self.inner.lock().expect("surface inner poisoned");
        let Some(lock) = inner.locks.pop_front() else {
            debug!(id = %self.core.id(), "unlock with no outstanding lock ignored");
            return LegacyStatus::OK;
        };
        if lock.flags.contains(LockFlags::READ_ONLY) {
            return LegacyStatus::OK;
        }
        if session.ensure_running().is_err() {
            return LegacyStatus::DEVICE_LOST;
        }

        let pitch = self.width * BYTES_PER_PIXEL;
        let rect_bytes = rect_rows(&inner.shadow, &lock.rect, pitch);
        drop(inner);

        let mut payload = PayloadWriter::new();
        lock.rect.encode(&mut payload);
        payload.put_u32(pitch).put_u32(lock.flags.bits());

        let mut header = self.core.cmd(Opcode::SurfaceUnlock);
        // Large rectangles travel through the bulk arena by reference; a
        // full arena degrades to the inline path transparently.
        let heap_id = if rect_bytes.len() > INLINE_LIMIT {
            session.heap_allocate(rect_bytes.len())
        } else {
            None
        };
        let outcome = match heap_id {
            Some(id) => {
                if let Some(heap) = session.heap() {
                    if let Err(err) = heap.write(id, 0, &rect_bytes) {
                        session.poison(&format!("bulk write failed: {err}"));
                        return LegacyStatus::DEVICE_LOST;
                    }
                }
                header.flags = header.flags | CommandFlags::DATA_IN_HEAP;
                payload.put_u32(id.0);
                let result =
                    session.forget(session.device_caller(), header, &payload.finish());
                // FIFO ordering makes the free safe: the worker sees the
                // unlock before the free on the same channel.
                session.heap_free(id);
                result
            }
            None => {
                payload.put_blob(&rect_bytes);
                session.forget(session.device_caller(), header, &payload.finish())
            }
        };
        match outcome {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    /// Called by the container when it is destroyed: the worker gets an
    /// unlink notice so the child's handle cannot dangle, and the proxy
    /// goes inert.
    pub(crate) fn parent_destroyed(&self) {
        if self.orphaned.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.parent.lock().expect("surface parent poisoned") = None;
        let session = self.core.session();
        let _ = session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::UnlinkChild),
            &[],
        );
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }
}

impl ProxyObject for SurfaceProxy {
    fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Surface
    }

    fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    fn release(&self) -> u32 {
        // A child never emits its own destroy: the worker-side identity
        // is dropped by the container's unlink, and the cached proxy must
        // survive for identity-stable re-queries.
        self.core.release_count().unwrap_or(0)
    }

    fn query_capability(&self, kind: CapabilityKind) -> Option<CapabilityRef<'_>> {
        match kind {
            CapabilityKind::Lockable => Some(CapabilityRef::Lockable(self)),
            CapabilityKind::Container => None,
        }
    }
}

impl Lockable for SurfaceProxy {
    fn unlock(&self) -> LegacyStatus {
        SurfaceProxy::unlock(self)
    }

    fn outstanding_locks(&self) -> usize {
        self.inner.lock().expect("surface inner poisoned").locks.len()
    }
}

impl std::fmt::Debug for SurfaceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceProxy")
            .field("id", &self.core.id())
            .field("extent", &(self.width, self.height))
            .field("orphaned", &self.is_orphaned())
            .finish()
    }
}

fn rect_rows(shadow: &[u8], rect: &Rect, pitch: u32) -> Vec<u8> {
    let row_len = (rect.width * BYTES_PER_PIXEL) as usize;
    let mut out = Vec::with_capacity(row_len * rect.height as usize);
    for row in rect.y..rect.y + rect.height {
        let start = (row * pitch + rect.x * BYTES_PER_PIXEL) as usize;
        out.extend_from_slice(&shadow[start..start + row_len]);
    }
    out
}
