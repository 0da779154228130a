use std::sync::Arc;

use gfxbridge_wire::{DeviceDesc, ObjectId, Opcode, PayloadWriter};

use crate::proxy::{DeviceProxy, ProxyCore, ProxyKind, ProxyObject};
use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

use super::response_reader;

/// The top-level interface proxy: the first object the application sees,
/// and the factory for device proxies.
///
/// Module traffic runs on the low-frequency bootstrap channel so that
/// adapter queries and device creation never queue behind per-draw
/// traffic.
pub struct ModuleProxy {
    core: ProxyCore,
}

impl ModuleProxy {
    pub(crate) fn new(session: Arc<BridgeSession>) -> LegacyResult<Arc<Self>> {
        Ok(Arc::new(Self {
            core: ProxyCore::new(session)?,
        }))
    }

    /// Number of display adapters on the worker side. Requires a worker
    /// answer; there is nothing to mirror locally.
    pub fn adapter_count(&self) -> LegacyResult<u32> {
        let session = self.core.session();
        let response = session.query(
            session.module_caller(),
            self.core.cmd(Opcode::ModuleGetAdapterCount),
            &[],
        )?;
        let (status, mut values) = response_reader(session, response)?;
        if !status.is_ok() {
            return Err(status);
        }
        values.get_u32().map_err(|_| {
            session.poison("short ModuleGetAdapterCount response");
            LegacyStatus::DEVICE_LOST
        })
    }

    /// Whether the worker supports `format`. The legacy contract lets
    /// call sites treat a missing answer as support, so a timeout falls
    /// back to `true` rather than failing the call.
    pub fn check_format(&self, format: u32) -> LegacyResult<bool> {
        let session = self.core.session();
        let mut payload = PayloadWriter::new();
        payload.put_u32(format);
        let response = session.query_optional(
            session.module_caller(),
            self.core.cmd(Opcode::ModuleCheckFormat),
            &payload.finish(),
        )?;
        match response {
            Some(bytes) => {
                let (status, mut values) = response_reader(session, bytes)?;
                if !status.is_ok() {
                    return Ok(false);
                }
                values.get_bool().map_err(|_| {
                    session.poison("short ModuleCheckFormat response");
                    LegacyStatus::DEVICE_LOST
                })
            }
            None => Ok(true),
        }
    }

    /// Create a device. The device identity is minted here and announced
    /// to the worker; whether the call waits for the worker's verdict is
    /// an option (`send_create_responses`), since most applications only
    /// check for gross failure.
    pub fn create_device(&self, desc: DeviceDesc) -> LegacyResult<Arc<DeviceProxy>> {
        if desc.width == 0
            || desc.height == 0
            || desc.width > DeviceProxy::MAX_EXTENT
            || desc.height > DeviceProxy::MAX_EXTENT
        {
            return Err(LegacyStatus::INVALID_CALL);
        }
        let session = self.core.session();
        session.ensure_running()?;

        let device = DeviceProxy::create(Arc::clone(session), desc)?;
        let mut payload = PayloadWriter::new();
        payload.put_u32(device.wire_handle());
        desc.encode(&mut payload);
        let header = self.core.cmd(Opcode::ModuleCreateDevice);

        if session.options().send_create_responses || session.options().send_all_responses {
            match session.query_optional(session.module_caller(), header, &payload.finish())? {
                Some(bytes) => {
                    let (status, _values) = response_reader(session, bytes)?;
                    if !status.is_ok() {
                        return Err(status);
                    }
                }
                None => {
                    // Unknown outcome tolerated: the worker may still
                    // create the device late, and the legacy contract
                    // lets the application discover real failure on first
                    // use.
                }
            }
        } else {
            session.forget(session.module_caller(), header, &payload.finish())?;
        }
        Ok(device)
    }
}

impl ProxyObject for ModuleProxy {
    fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Module
    }

    fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    fn release(&self) -> u32 {
        match self.core.release_count() {
            Some(0) => {
                let session = self.core.session();
                let _ = session.forget(
                    session.module_caller(),
                    self.core.cmd(Opcode::ModuleDestroy),
                    &[],
                );
                0
            }
            Some(count) => count,
            None => 0,
        }
    }
}

impl std::fmt::Debug for ModuleProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleProxy").field("id", &self.core.id()).finish()
    }
}
