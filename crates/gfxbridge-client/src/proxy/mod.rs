//! The object proxy layer: interceptor-side stand-ins for worker-side
//! objects.
//!
//! Every proxy owns a process-wide-unique [`ObjectId`], a legacy-style
//! refcount, and a handle to the session. Mutating and querying calls are
//! validated against the legacy contract locally, mirrored into local
//! state where the contract allows answering without the worker, and
//! forwarded over the command channel otherwise.
//!
//! Instead of an inheritance hierarchy, proxies expose a small capability
//! set through an explicit query ([`ProxyObject::query_capability`]):
//! [`Container`] for indexed child tables (mip levels, back buffers) and
//! [`Lockable`] for resources with CPU-accessible backing memory.

mod buffer;
mod device;
mod module;
mod surface;
mod swapchain;
mod texture;

pub use buffer::{BufferLockGuard, BufferProxy};
pub use device::DeviceProxy;
pub use module::ModuleProxy;
pub use surface::{SurfaceLockGuard, SurfaceProxy};
pub use swapchain::SwapChainProxy;
pub use texture::TextureProxy;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use gfxbridge_wire::{CommandFlags, CommandHeader, ObjectId, Opcode, PayloadReader};

use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

/// What a proxy stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Module,
    Device,
    SwapChain,
    Texture,
    Surface,
    Buffer,
}

/// Capabilities a proxy may expose beyond the base contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Container,
    Lockable,
}

/// A capability handle returned by [`ProxyObject::query_capability`].
pub enum CapabilityRef<'a> {
    Container(&'a dyn Container),
    Lockable(&'a dyn Lockable),
}

/// The base contract every proxy variant implements.
pub trait ProxyObject: Send + Sync {
    fn object_id(&self) -> ObjectId;
    fn kind(&self) -> ProxyKind;

    /// Bump the external refcount; returns the new count.
    fn add_ref(&self) -> u32;

    /// Drop one external reference; returns the new count. Hitting zero
    /// destroys the object and emits its destroy (or, for children,
    /// nothing — they are unlinked by their parent). Releasing below zero
    /// is a silent no-op returning zero.
    fn release(&self) -> u32;

    /// Explicit capability query; the supported alternative to
    /// downcasting.
    fn query_capability(&self, kind: CapabilityKind) -> Option<CapabilityRef<'_>> {
        let _ = kind;
        None
    }
}

/// An indexed table of lazily created child proxies. Children are cached
/// by index: repeated queries return the same identity instead of minting
/// duplicates.
pub trait Container: Send + Sync {
    fn child_count(&self) -> u32;
    fn child_at(&self, index: u32) -> LegacyResult<Arc<SurfaceProxy>>;
}

/// A resource with lockable backing memory. Locks queue per object;
/// unlock always applies to the oldest outstanding lock, and an unlock
/// with none outstanding is a silent no-op (legacy callers unlock
/// defensively).
pub trait Lockable: Send + Sync {
    fn unlock(&self) -> LegacyStatus;
    fn outstanding_locks(&self) -> usize;
}

/// State shared by every proxy variant: session handle, identity and the
/// external refcount.
pub(crate) struct ProxyCore {
    session: Arc<BridgeSession>,
    id: ObjectId,
    handle: u32,
    refcount: AtomicU32,
}

impl ProxyCore {
    /// Mint a fresh identity. The refcount starts at one, owned by the
    /// caller that requested the object.
    pub(crate) fn new(session: Arc<BridgeSession>) -> LegacyResult<Self> {
        let id = session.ids().next_id();
        let handle = id
            .wire_handle()
            .map_err(|_| LegacyStatus::OUT_OF_MEMORY)?;
        Ok(Self {
            session,
            id,
            handle,
            refcount: AtomicU32::new(1),
        })
    }

    pub(crate) fn session(&self) -> &Arc<BridgeSession> {
        &self.session
    }

    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn handle(&self) -> u32 {
        self.handle
    }

    pub(crate) fn add_ref(&self) -> u32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement toward zero. `Some(0)` fires exactly once; a release
    /// after that returns `None` (defensive double release).
    pub(crate) fn release_count(&self) -> Option<u32> {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// A command header addressed to this object.
    pub(crate) fn cmd(&self, opcode: Opcode) -> CommandHeader {
        CommandHeader {
            opcode,
            flags: CommandFlags::NONE,
            target: self.handle,
            correlation: 0,
            payload_size: 0,
            payload_offset: 0,
        }
    }
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("id", &self.id)
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Split a response payload into its leading status code and the reader
/// positioned at the value fields. A malformed response is a protocol
/// error and poisons the session.
pub(crate) fn response_reader(
    session: &BridgeSession,
    payload: Bytes,
) -> LegacyResult<(LegacyStatus, PayloadReader)> {
    let mut reader = PayloadReader::new(payload);
    match reader.get_i32() {
        Ok(code) => Ok((LegacyStatus::from_code(code), reader)),
        Err(err) => {
            session.poison(&format!("malformed response payload: {err}"));
            Err(LegacyStatus::DEVICE_LOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use gfxbridge_channel::{ChannelConfig, ChannelReader, ChannelWriter, SyncCaller};
    use gfxbridge_shm::SharedRegion;
    use gfxbridge_wire::{BufferDesc, DeviceDesc, LockFlags, TextureDesc};

    use super::*;
    use crate::options::BridgeOptions;

    /// A session whose channels nobody drains. Good enough for every
    /// behavior that stays local to the interceptor.
    fn silent_session() -> Arc<BridgeSession> {
        let config = ChannelConfig {
            cmd_capacity: 256,
            data_len: 256 * 1024,
            ..ChannelConfig::default()
        };
        let caller = |name: &str| {
            let out = Arc::new(SharedRegion::anonymous(config.region_len()).unwrap());
            let back = Arc::new(SharedRegion::anonymous(config.region_len()).unwrap());
            SyncCaller::new(
                ChannelWriter::new(out, &config, name).unwrap(),
                ChannelReader::new(back, &config, name).unwrap(),
            )
        };
        BridgeSession::from_parts(
            BridgeOptions::default(),
            caller("device"),
            caller("module"),
            None,
            None,
        )
    }

    fn test_device(session: &Arc<BridgeSession>) -> Arc<DeviceProxy> {
        let module = session.create_module().unwrap();
        module
            .create_device(DeviceDesc {
                width: 320,
                height: 240,
                back_buffers: 1,
                windowed: true,
            })
            .unwrap()
    }

    #[test]
    fn refcount_counts_up_and_down() {
        let session = silent_session();
        let module = session.create_module().unwrap();
        assert_eq!(module.add_ref(), 2);
        assert_eq!(module.add_ref(), 3);
        assert_eq!(module.release(), 2);
        assert_eq!(module.release(), 1);
    }

    #[test]
    fn release_below_zero_is_clamped() {
        let session = silent_session();
        let module = session.create_module().unwrap();
        assert_eq!(module.release(), 0);
        // Defensive double release: no underflow, no second destroy.
        assert_eq!(module.release(), 0);
        assert_eq!(module.release(), 0);
    }

    #[test]
    fn capability_queries_match_variants() {
        let session = silent_session();
        let device = test_device(&session);

        let texture = device
            .create_texture(TextureDesc {
                width: 16,
                height: 16,
                levels: 1,
                format: 0,
                usage: 0,
            })
            .unwrap();
        assert!(matches!(
            texture.query_capability(CapabilityKind::Container),
            Some(CapabilityRef::Container(_))
        ));
        assert!(texture.query_capability(CapabilityKind::Lockable).is_none());

        let buffer = device
            .create_buffer(BufferDesc {
                len: 64,
                usage: 0,
                dynamic: false,
            })
            .unwrap();
        assert!(matches!(
            buffer.query_capability(CapabilityKind::Lockable),
            Some(CapabilityRef::Lockable(_))
        ));
        assert!(buffer.query_capability(CapabilityKind::Container).is_none());

        // The base contract alone exposes no capabilities.
        let module = session.create_module().unwrap();
        assert!(module.query_capability(CapabilityKind::Container).is_none());
        assert!(module.query_capability(CapabilityKind::Lockable).is_none());
    }

    #[test]
    fn invalid_descriptors_are_rejected_locally() {
        let session = silent_session();
        let device = test_device(&session);

        assert!(device
            .create_texture(TextureDesc {
                width: 0,
                height: 16,
                levels: 1,
                format: 0,
                usage: 0,
            })
            .is_err());
        assert!(device
            .create_texture(TextureDesc {
                width: 1 << 20,
                height: 16,
                levels: 1,
                format: 0,
                usage: 0,
            })
            .is_err());
        assert!(device.create_buffer(BufferDesc { len: 0, usage: 0, dynamic: false }).is_err());
    }

    #[test]
    fn scene_bracketing_is_validated() {
        let session = silent_session();
        let device = test_device(&session);

        assert_eq!(device.end_scene(), LegacyStatus::INVALID_CALL);
        assert!(device.begin_scene().is_ok());
        assert_eq!(device.begin_scene(), LegacyStatus::INVALID_CALL);
        assert!(device.end_scene().is_ok());
    }

    #[test]
    fn lock_queue_survives_out_of_order_guards() {
        let session = silent_session();
        let device = test_device(&session);
        let buffer = device
            .create_buffer(BufferDesc {
                len: 1024,
                usage: 0,
                dynamic: true,
            })
            .unwrap();

        {
            let _first = buffer.lock(0, 16, LockFlags::READ_ONLY).unwrap();
        }
        {
            let _second = buffer.lock(64, 16, LockFlags::READ_ONLY).unwrap();
        }
        let lockable: &dyn Lockable = &*buffer;
        assert_eq!(lockable.outstanding_locks(), 2);
        assert!(lockable.unlock().is_ok());
        assert_eq!(lockable.outstanding_locks(), 1);
        assert!(lockable.unlock().is_ok());
        // Nothing outstanding: defensive no-op.
        assert!(lockable.unlock().is_ok());
        assert_eq!(lockable.outstanding_locks(), 0);
    }

    #[test]
    fn child_keeps_nonowning_container_link() {
        let session = silent_session();
        let device = test_device(&session);
        let texture = device
            .create_texture(TextureDesc {
                width: 8,
                height: 8,
                levels: 2,
                format: 0,
                usage: 0,
            })
            .unwrap();

        let surface = texture.get_surface_level(1).unwrap();
        assert_eq!(surface.parent_index(), 1);
        let container = surface.container().expect("container link should be live");
        assert_eq!(container.object_id(), texture.object_id());

        texture.release();
        assert!(surface.is_orphaned());
        assert!(surface.container().is_none());
    }
}
