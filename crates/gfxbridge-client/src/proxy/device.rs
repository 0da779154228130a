use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use gfxbridge_wire::{
    BufferDesc, DeviceDesc, ObjectId, Opcode, PayloadWriter, TextureDesc, Viewport,
};

use crate::proxy::{
    BufferProxy, ProxyCore, ProxyKind, ProxyObject, SwapChainProxy, TextureProxy,
};
use crate::session::BridgeSession;
use gfxbridge_wire::{LegacyResult, LegacyStatus};

use super::response_reader;

/// Client-side mirror of the subset of device state the legacy contract
/// lets us answer locally. Protected by the device's coarse lock; every
/// proxy operation that touches it takes that lock, and releases it
/// before blocking on a worker response.
#[derive(Debug, Default)]
struct DeviceState {
    render_states: HashMap<u32, u32>,
    viewport: Option<Viewport>,
    bound_textures: HashMap<u32, ObjectId>,
    in_scene: bool,
}

/// The device proxy: owner of the high-frequency command stream, the
/// mirrored device state, and the implicit swap chain.
pub struct DeviceProxy {
    core: ProxyCore,
    desc: DeviceDesc,
    state: Mutex<DeviceState>,
    swap_chain: Mutex<Option<Arc<SwapChainProxy>>>,
}

impl DeviceProxy {
    pub(crate) fn create(session: Arc<BridgeSession>, desc: DeviceDesc) -> LegacyResult<Arc<Self>> {
        Ok(Arc::new(Self {
            core: ProxyCore::new(session)?,
            desc,
            state: Mutex::new(DeviceState::default()),
            swap_chain: Mutex::new(None),
        }))
    }

    pub fn desc(&self) -> DeviceDesc {
        self.desc
    }

    pub(crate) fn wire_handle(&self) -> u32 {
        self.core.handle()
    }

    /// Largest extent the legacy contract admits for any 2D resource.
    pub const MAX_EXTENT: u32 = 16384;

    /// Create a texture resource. The identity is minted locally and
    /// travels with the command; the worker maps it to its own object.
    pub fn create_texture(&self, desc: TextureDesc) -> LegacyResult<Arc<TextureProxy>> {
        if desc.width == 0
            || desc.height == 0
            || desc.levels == 0
            || desc.width > Self::MAX_EXTENT
            || desc.height > Self::MAX_EXTENT
            || desc.levels > 15
        {
            return Err(LegacyStatus::INVALID_CALL);
        }
        let session = self.core.session();
        session.ensure_running()?;

        let texture = TextureProxy::create(Arc::clone(session), desc)?;
        let mut payload = PayloadWriter::new();
        payload.put_u32(texture.wire_handle());
        desc.encode(&mut payload);
        self.send_create(Opcode::DeviceCreateTexture, payload)?;
        Ok(texture)
    }

    /// Create a linear buffer resource.
    pub fn create_buffer(&self, desc: BufferDesc) -> LegacyResult<Arc<BufferProxy>> {
        if desc.len == 0 {
            return Err(LegacyStatus::INVALID_CALL);
        }
        let session = self.core.session();
        session.ensure_running()?;

        let buffer = BufferProxy::create(Arc::clone(session), desc)?;
        let mut payload = PayloadWriter::new();
        payload.put_u32(buffer.wire_handle());
        desc.encode(&mut payload);
        self.send_create(Opcode::DeviceCreateBuffer, payload)?;
        Ok(buffer)
    }

    fn send_create(&self, opcode: Opcode, payload: PayloadWriter) -> LegacyResult<()> {
        let session = self.core.session();
        let header = self.core.cmd(opcode);
        if session.options().send_create_responses || session.options().send_all_responses {
            match session.query_optional(session.device_caller(), header, &payload.finish())? {
                Some(bytes) => {
                    let (status, _values) = response_reader(session, bytes)?;
                    if !status.is_ok() {
                        return Err(status);
                    }
                    Ok(())
                }
                // Missing verdict tolerated; failure surfaces on first use.
                None => Ok(()),
            }
        } else {
            session.forget(session.device_caller(), header, &payload.finish())
        }
    }

    /// Set one render state. Mirrored locally, then forwarded. The state
    /// lock is held across the push so the mirror and the wire agree on
    /// ordering between racing threads.
    pub fn set_render_state(&self, state: u32, value: u32) -> LegacyStatus {
        let session = self.core.session();
        let mut mirror = self.state.lock().expect("device state poisoned");
        mirror.render_states.insert(state, value);
        let mut payload = PayloadWriter::new();
        payload.put_u32(state).put_u32(value);
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceSetRenderState),
            &payload.finish(),
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    /// Get one render state. Answered from the mirror when the value was
    /// set through this device; otherwise the worker is asked.
    pub fn get_render_state(&self, state: u32) -> LegacyResult<u32> {
        {
            let mirror = self.state.lock().expect("device state poisoned");
            if let Some(&value) = mirror.render_states.get(&state) {
                return Ok(value);
            }
        }
        let session = self.core.session();
        let mut payload = PayloadWriter::new();
        payload.put_u32(state);
        let response = session.query(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceGetRenderState),
            &payload.finish(),
        )?;
        let (status, mut values) = response_reader(session, response)?;
        if !status.is_ok() {
            return Err(status);
        }
        values.get_u32().map_err(|_| {
            session.poison("short DeviceGetRenderState response");
            LegacyStatus::DEVICE_LOST
        })
    }

    pub fn set_viewport(&self, viewport: Viewport) -> LegacyStatus {
        if viewport.width == 0 || viewport.height == 0 {
            return LegacyStatus::INVALID_CALL;
        }
        let session = self.core.session();
        let mut mirror = self.state.lock().expect("device state poisoned");
        mirror.viewport = Some(viewport);
        let mut payload = PayloadWriter::new();
        viewport.encode(&mut payload);
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceSetViewport),
            &payload.finish(),
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.state.lock().expect("device state poisoned").viewport
    }

    /// Bind a texture to a sampler stage (`None` unbinds).
    pub fn set_texture(&self, stage: u32, texture: Option<&TextureProxy>) -> LegacyStatus {
        let session = self.core.session();
        let mut mirror = self.state.lock().expect("device state poisoned");
        let handle = match texture {
            Some(texture) => {
                mirror.bound_textures.insert(stage, texture.object_id());
                texture.wire_handle()
            }
            None => {
                mirror.bound_textures.remove(&stage);
                0
            }
        };
        let mut payload = PayloadWriter::new();
        payload.put_u32(stage).put_u32(handle);
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceSetTexture),
            &payload.finish(),
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn begin_scene(&self) -> LegacyStatus {
        let session = self.core.session();
        let mut mirror = self.state.lock().expect("device state poisoned");
        if mirror.in_scene {
            return LegacyStatus::INVALID_CALL;
        }
        mirror.in_scene = true;
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceBeginScene),
            &[],
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn end_scene(&self) -> LegacyStatus {
        let session = self.core.session();
        let mut mirror = self.state.lock().expect("device state poisoned");
        if !mirror.in_scene {
            return LegacyStatus::INVALID_CALL;
        }
        mirror.in_scene = false;
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceEndScene),
            &[],
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn clear(&self, flags: u32, color: u32, depth: f32, stencil: u32) -> LegacyStatus {
        let session = self.core.session();
        let mut payload = PayloadWriter::new();
        payload
            .put_u32(flags)
            .put_u32(color)
            .put_f32(depth)
            .put_u32(stencil);
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceClear),
            &payload.finish(),
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn draw_primitive(&self, primitive: u32, start_vertex: u32, count: u32) -> LegacyStatus {
        if count == 0 {
            return LegacyStatus::INVALID_CALL;
        }
        let session = self.core.session();
        let mut payload = PayloadWriter::new();
        payload.put_u32(primitive).put_u32(start_vertex).put_u32(count);
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceDrawPrimitive),
            &payload.finish(),
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn draw_indexed_primitive(
        &self,
        primitive: u32,
        base_vertex: u32,
        start_index: u32,
        count: u32,
    ) -> LegacyStatus {
        if count == 0 {
            return LegacyStatus::INVALID_CALL;
        }
        let session = self.core.session();
        let mut payload = PayloadWriter::new();
        payload
            .put_u32(primitive)
            .put_u32(base_vertex)
            .put_u32(start_index)
            .put_u32(count);
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceDrawIndexedPrimitive),
            &payload.finish(),
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    /// Present the frame. Gated by the frame pacer so the interceptor
    /// never runs more than the configured number of frames ahead.
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
            self.core.cmd(Opcode::DevicePresent),
            &[],
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    /// The device's implicit swap chain, created lazily and cached so
    /// repeated queries return the same identity.
    pub fn get_swap_chain(&self) -> LegacyResult<Arc<SwapChainProxy>> {
        let session = self.core.session();
        session.ensure_running()?;

        let mut slot = self.swap_chain.lock().expect("swap chain slot poisoned");
        if let Some(swap_chain) = slot.as_ref() {
            swap_chain.add_ref();
            return Ok(Arc::clone(swap_chain));
        }

        let swap_chain = SwapChainProxy::create(Arc::clone(session), self.desc)?;
        let mut payload = PayloadWriter::new();
        payload.put_u32(swap_chain.wire_handle());
        session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::LinkSwapChain),
            &payload.finish(),
        )?;
        *slot = Some(Arc::clone(&swap_chain));
        Ok(swap_chain)
    }

    /// Available texture memory on the worker side. Always a synchronous
    /// worker query; there is nothing local to answer from.
    pub fn available_memory(&self) -> LegacyResult<u64> {
        let session = self.core.session();
        let response = session.query(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceGetAvailableMemory),
            &[],
        )?;
        let (status, mut values) = response_reader(session, response)?;
        if !status.is_ok() {
            return Err(status);
        }
        values.get_u64().map_err(|_| {
            session.poison("short DeviceGetAvailableMemory response");
            LegacyStatus::DEVICE_LOST
        })
    }

    /// Device health probe. Many call sites poll this every frame and
    /// tolerate "probably fine", so a missing answer falls back to `OK`
    /// instead of an error.
    pub fn test_cooperative_level(&self) -> LegacyStatus {
        let session = self.core.session();
        if session.ensure_running().is_err() {
            return LegacyStatus::DEVICE_LOST;
        }
        match session.query_optional(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceTestCooperativeLevel),
            &[],
        ) {
            Ok(Some(bytes)) => match response_reader(session, bytes) {
                Ok((status, _values)) => status,
                Err(status) => status,
            },
            Ok(None) => LegacyStatus::OK,
            Err(status) => status,
        }
    }

    pub fn reset(&self) -> LegacyStatus {
        let session = self.core.session();
        {
            let mut mirror = self.state.lock().expect("device state poisoned");
            mirror.render_states.clear();
            mirror.viewport = None;
            mirror.bound_textures.clear();
            mirror.in_scene = false;
        }
        match session.forget(
            session.device_caller(),
            self.core.cmd(Opcode::DeviceReset),
            &[],
        ) {
            Ok(()) => LegacyStatus::OK,
            Err(status) => status,
        }
    }
}

impl ProxyObject for DeviceProxy {
    fn object_id(&self) -> ObjectId {
        self.core.id()
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Device
    }

    fn add_ref(&self) -> u32 {
        self.core.add_ref()
    }

    fn release(&self) -> u32 {
        match self.core.release_count() {
            Some(0) => {
                // Children go first so the worker never holds a dangling
                // swap chain handle for a destroyed device.
                if let Some(swap_chain) =
                    self.swap_chain.lock().expect("swap chain slot poisoned").take()
                {
                    swap_chain.parent_destroyed();
                }
                let session = self.core.session();
                let _ = session.forget(
                    session.device_caller(),
                    self.core.cmd(Opcode::DeviceDestroy),
                    &[],
                );
                0
            }
            Some(count) => count,
            None => 0,
        }
    }
}

impl std::fmt::Debug for DeviceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceProxy")
            .field("id", &self.core.id())
            .field("desc", &self.desc)
            .finish()
    }
}
