use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gfxbridge_channel::{ChannelError, ChannelReader, ChannelWriter, Message};
use gfxbridge_heap::{AllocId, HeapView, Placement};
use gfxbridge_shm::NamedSemaphore;
use gfxbridge_wire::{
    BufferDesc, CommandFlags, CommandHeader, DeviceDesc, LegacyStatus, Opcode, PayloadReader,
    PayloadWriter, Rect, TextureDesc, Viewport, WireError,
};
use tracing::{debug, info, trace, warn};

use crate::engine::Engine;
use crate::error::{Result, ServerError};
use crate::registry::{ObjectRegistry, WorkerObject};

/// Non-blocking poll interval for each channel while the other is quiet.
const POLL_SLICE: Duration = Duration::from_millis(1);

/// The worker's endpoints of both channel pairs.
pub struct WorkerChannels {
    pub device_rx: ChannelReader,
    pub device_tx: ChannelWriter,
    pub module_rx: ChannelReader,
    pub module_tx: ChannelWriter,
}

enum LoopControl {
    Continue,
    Stop,
}

/// The worker's command processing loop.
///
/// Pops commands in order, dispatches on opcode to the [`Engine`], and
/// pushes a `Response` whenever the interceptor flagged that it is
/// blocked waiting. Both channels drain on one thread: module traffic is
/// rare, and a single consumer seat per channel keeps the SPSC
/// discipline trivially true.
pub struct Worker<E: Engine> {
    engine: E,
    registry: ObjectRegistry,
    heap: Option<HeapView>,
    pacer: Option<NamedSemaphore>,
    stop: Arc<AtomicBool>,
    /// Set once the first device exists. Device-channel traffic is not
    /// consumed before that: the create command travels on the module
    /// channel, and cross-channel delivery order is otherwise undefined.
    device_started: bool,
}

impl<E: Engine> Worker<E> {
    pub fn new(engine: E, heap: Option<HeapView>, pacer: Option<NamedSemaphore>) -> Self {
        Self {
            engine,
            registry: ObjectRegistry::new(),
            heap,
            pacer,
            stop: Arc::new(AtomicBool::new(false)),
            device_started: false,
        }
    }

    /// Flag that makes `run` return after the current command. Shared
    /// with signal handlers.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.registry
    }

    /// Process commands until a `Terminate` arrives or the stop flag is
    /// raised. Protocol errors abort the loop — the channel byte stream
    /// cannot be trusted after one.
    pub fn run(&mut self, channels: &mut WorkerChannels) -> Result<()> {
        info!("worker command loop started");
        loop {
            if self.stop.load(Ordering::Acquire) {
                info!("worker stop requested");
                return Ok(());
            }

            let module_msg = match channels.module_rx.try_pop(POLL_SLICE) {
                Ok(msg) => Some(msg),
                Err(ChannelError::Timeout(_)) => None,
                Err(err) => return Err(err.into()),
            };
            if let Some(msg) = module_msg {
                if let LoopControl::Stop = self.dispatch(msg, &mut channels.module_tx)? {
                    return self.drain_on_terminate(channels);
                }
                continue;
            }

            if !self.device_started {
                continue;
            }
            let device_msg = match channels.device_rx.try_pop(POLL_SLICE) {
                Ok(msg) => Some(msg),
                Err(ChannelError::Timeout(_)) => None,
                Err(err) => return Err(err.into()),
            };
            if let Some(msg) = device_msg {
                if let LoopControl::Stop = self.dispatch(msg, &mut channels.device_tx)? {
                    return self.drain_on_terminate(channels);
                }
            }
        }
    }

    /// Terminate is pushed to both channels; whichever copy is seen
    /// first must not cut off commands still queued on the other. Drain
    /// both rings before stopping so no trailing work is lost.
    fn drain_on_terminate(&mut self, channels: &mut WorkerChannels) -> Result<()> {
        loop {
            match channels.module_rx.try_pop(POLL_SLICE) {
                Ok(msg) => {
                    let _ = self.dispatch(msg, &mut channels.module_tx)?;
                }
                Err(ChannelError::Timeout(_)) => break,
                Err(err) => return Err(err.into()),
            }
        }
        if self.device_started {
            loop {
                match channels.device_rx.try_pop(POLL_SLICE) {
                    Ok(msg) => {
                        let _ = self.dispatch(msg, &mut channels.device_tx)?;
                    }
                    Err(ChannelError::Timeout(_)) => break,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        info!("worker channels drained; stopping");
        Ok(())
    }

    fn dispatch(&mut self, msg: Message, tx: &mut ChannelWriter) -> Result<LoopControl> {
        let header = msg.header;
        trace!(opcode = header.opcode.name(), target = header.target, "dispatch");
        let mut reader = PayloadReader::new(msg.payload.clone());
        // Control traffic carries free-form payloads; everything else
        // must decode to exactly the bytes the interceptor produced.
        let freeform = matches!(
            header.opcode,
            Opcode::DebugMessage
                | Opcode::Syn
                | Opcode::Ack
                | Opcode::Continue
                | Opcode::Response
                | Opcode::Terminate
        );

        match header.opcode {
            Opcode::Terminate => {
                info!("terminate received; shutting down worker loop");
                return Ok(LoopControl::Stop);
            }
            Opcode::DebugMessage => {
                info!(message = %String::from_utf8_lossy(&msg.payload), "interceptor debug message");
            }
            Opcode::Syn | Opcode::Ack | Opcode::Continue | Opcode::Response => {
                warn!(opcode = header.opcode.name(), "unexpected control message after handshake");
            }

            Opcode::HeapAlloc => {
                let id = AllocId(field(&mut reader, "HeapAlloc", PayloadReader::get_u32)?);
                let byte_offset = field(&mut reader, "HeapAlloc", PayloadReader::get_u64)? as usize;
                let byte_len = field(&mut reader, "HeapAlloc", PayloadReader::get_u64)? as usize;
                match &self.heap {
                    Some(heap) => heap.register(
                        id,
                        Placement {
                            byte_offset,
                            byte_len,
                        },
                    ),
                    None => warn!(%id, "bulk allocation announced but arena is disabled"),
                }
            }
            Opcode::HeapFree => {
                let id = AllocId(field(&mut reader, "HeapFree", PayloadReader::get_u32)?);
                if let Some(heap) = &self.heap {
                    heap.remove(id);
                }
            }

            Opcode::ModuleGetAdapterCount => {
                let count = self.engine.adapter_count();
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code()).put_u32(count);
                })?;
            }
            Opcode::ModuleCheckFormat => {
                let format = field(&mut reader, "ModuleCheckFormat", PayloadReader::get_u32)?;
                let supported = self.engine.supports_format(format);
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code()).put_bool(supported);
                })?;
            }
            Opcode::ModuleCreateDevice => {
                let handle = field(&mut reader, "ModuleCreateDevice", PayloadReader::get_u32)?;
                let desc = DeviceDesc::decode(&mut reader)
                    .map_err(|source| malformed("ModuleCreateDevice", source))?;
                self.registry.insert(
                    handle,
                    WorkerObject::Device {
                        desc,
                        render_states: Default::default(),
                    },
                );
                self.engine.create_device(handle, &desc);
                self.device_started = true;
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code());
                })?;
            }
            Opcode::ModuleDestroy => {
                debug!("module destroyed");
            }

            Opcode::DeviceCreateTexture => {
                let handle = field(&mut reader, "DeviceCreateTexture", PayloadReader::get_u32)?;
                let desc = TextureDesc::decode(&mut reader)
                    .map_err(|source| malformed("DeviceCreateTexture", source))?;
                self.registry.insert(handle, WorkerObject::Texture { desc });
                self.engine.create_texture(handle, &desc);
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code());
                })?;
            }
            Opcode::DeviceCreateBuffer => {
                let handle = field(&mut reader, "DeviceCreateBuffer", PayloadReader::get_u32)?;
                let desc = BufferDesc::decode(&mut reader)
                    .map_err(|source| malformed("DeviceCreateBuffer", source))?;
                self.registry.insert(
                    handle,
                    WorkerObject::Buffer {
                        desc,
                        data: vec![0; desc.len as usize],
                    },
                );
                self.engine.create_buffer(handle, &desc);
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code());
                })?;
            }

            Opcode::DeviceSetRenderState => {
                let state = field(&mut reader, "DeviceSetRenderState", PayloadReader::get_u32)?;
                let value = field(&mut reader, "DeviceSetRenderState", PayloadReader::get_u32)?;
                if let WorkerObject::Device { render_states, .. } =
                    self.registry.get_mut(header.target)?
                {
                    render_states.insert(state, value);
                }
                self.engine.set_render_state(state, value);
            }
            Opcode::DeviceGetRenderState => {
                let state = field(&mut reader, "DeviceGetRenderState", PayloadReader::get_u32)?;
                let value = match self.registry.get(header.target)? {
                    WorkerObject::Device { render_states, .. } => {
                        render_states.get(&state).copied().unwrap_or(0)
                    }
                    _ => 0,
                };
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code()).put_u32(value);
                })?;
            }
            Opcode::DeviceSetViewport => {
                let viewport = Viewport::decode(&mut reader)
                    .map_err(|source| malformed("DeviceSetViewport", source))?;
                self.engine.set_viewport(&viewport);
            }
            Opcode::DeviceSetTexture => {
                let stage = field(&mut reader, "DeviceSetTexture", PayloadReader::get_u32)?;
                let texture = field(&mut reader, "DeviceSetTexture", PayloadReader::get_u32)?;
                self.engine.set_texture(stage, texture);
            }
            Opcode::DeviceBeginScene => self.engine.begin_scene(),
            Opcode::DeviceEndScene => self.engine.end_scene(),
            Opcode::DeviceClear => {
                let flags = field(&mut reader, "DeviceClear", PayloadReader::get_u32)?;
                let color = field(&mut reader, "DeviceClear", PayloadReader::get_u32)?;
                let depth = field(&mut reader, "DeviceClear", PayloadReader::get_f32)?;
                let stencil = field(&mut reader, "DeviceClear", PayloadReader::get_u32)?;
                self.engine.clear(flags, color, depth, stencil);
            }
            Opcode::DeviceDrawPrimitive => {
                let primitive = field(&mut reader, "DeviceDrawPrimitive", PayloadReader::get_u32)?;
                let start = field(&mut reader, "DeviceDrawPrimitive", PayloadReader::get_u32)?;
                let count = field(&mut reader, "DeviceDrawPrimitive", PayloadReader::get_u32)?;
                self.engine.draw_primitive(primitive, start, count);
            }
            Opcode::DeviceDrawIndexedPrimitive => {
                let primitive =
                    field(&mut reader, "DeviceDrawIndexedPrimitive", PayloadReader::get_u32)?;
                let base = field(&mut reader, "DeviceDrawIndexedPrimitive", PayloadReader::get_u32)?;
                let start =
                    field(&mut reader, "DeviceDrawIndexedPrimitive", PayloadReader::get_u32)?;
                let count =
                    field(&mut reader, "DeviceDrawIndexedPrimitive", PayloadReader::get_u32)?;
                self.engine.draw_indexed_primitive(primitive, base, start, count);
            }
            Opcode::DevicePresent | Opcode::SwapChainPresent => {
                self.engine.present();
                if let Some(pacer) = &self.pacer {
                    if let Err(err) = pacer.post() {
                        warn!(%err, "failed to post frame pacing semaphore");
                    }
                }
            }
            Opcode::DeviceGetAvailableMemory => {
                let available = self.engine.available_memory();
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code()).put_u64(available);
                })?;
            }
            Opcode::DeviceTestCooperativeLevel => {
                self.respond(tx, &header, |payload| {
                    payload.put_i32(LegacyStatus::OK.code());
                })?;
            }
            Opcode::DeviceReset => {
                if let WorkerObject::Device { render_states, .. } =
                    self.registry.get_mut(header.target)?
                {
                    render_states.clear();
                }
                self.engine.reset_device(header.target);
            }

            Opcode::TextureGetSurfaceLevel => {
                let level = field(&mut reader, "TextureGetSurfaceLevel", PayloadReader::get_u32)?;
                let child = field(&mut reader, "TextureGetSurfaceLevel", PayloadReader::get_u32)?;
                let desc = match self.registry.get(header.target)? {
                    WorkerObject::Texture { desc } => *desc,
                    _ => return Err(ServerError::UnknownHandle(header.target)),
                };
                let (width, height) = desc.level_extent(level);
                self.registry.insert(
                    child,
                    WorkerObject::Surface {
                        width,
                        height,
                        data: vec![0; (width * height * 4) as usize],
                    },
                );
            }
            Opcode::TextureGenerateMips => self.engine.generate_mips(header.target),
            Opcode::TextureSetPriority => {
                let priority = field(&mut reader, "TextureSetPriority", PayloadReader::get_u32)?;
                trace!(handle = header.target, priority, "texture priority hint");
            }

            Opcode::LinkSwapChain => {
                let swap_chain = field(&mut reader, "LinkSwapChain", PayloadReader::get_u32)?;
                let desc = match self.registry.get(header.target)? {
                    WorkerObject::Device { desc, .. } => *desc,
                    _ => return Err(ServerError::UnknownHandle(header.target)),
                };
                self.registry.insert(
                    swap_chain,
                    WorkerObject::SwapChain {
                        back_buffers: desc.back_buffers.max(1),
                        width: desc.width,
                        height: desc.height,
                    },
                );
            }
            Opcode::LinkBackBuffer => {
                let index = field(&mut reader, "LinkBackBuffer", PayloadReader::get_u32)?;
                let child = field(&mut reader, "LinkBackBuffer", PayloadReader::get_u32)?;
                let (width, height) = match self.registry.get(header.target)? {
                    WorkerObject::SwapChain { width, height, .. } => (*width, *height),
                    _ => return Err(ServerError::UnknownHandle(header.target)),
                };
                debug!(index, child, "back buffer linked");
                self.registry.insert(
                    child,
                    WorkerObject::Surface {
                        width,
                        height,
                        data: vec![0; (width * height * 4) as usize],
                    },
                );
            }

            Opcode::SurfaceUnlock => {
                let rect = Rect::decode(&mut reader)
                    .map_err(|source| malformed("SurfaceUnlock", source))?;
                let pitch = field(&mut reader, "SurfaceUnlock", PayloadReader::get_u32)?;
                let _flags = field(&mut reader, "SurfaceUnlock", PayloadReader::get_u32)?;
                let data = self.payload_bytes(&header, &mut reader, "SurfaceUnlock")?;
                if let WorkerObject::Surface {
                    width,
                    height,
                    data: surface_data,
                } = self.registry.get_mut(header.target)?
                {
                    write_rect(surface_data, *width, *height, &rect, &data);
                }
                self.engine.upload_surface(header.target, &rect, pitch, &data);
            }
            Opcode::BufferUnlock => {
                let offset = field(&mut reader, "BufferUnlock", PayloadReader::get_u32)?;
                let len = field(&mut reader, "BufferUnlock", PayloadReader::get_u32)?;
                let _flags = field(&mut reader, "BufferUnlock", PayloadReader::get_u32)?;
                let data = if header.flags.contains(CommandFlags::DATA_IN_HEAP) {
                    let id = AllocId(field(&mut reader, "BufferUnlock", PayloadReader::get_u32)?);
                    let heap = self
                        .heap
                        .as_ref()
                        .ok_or(ServerError::Heap(gfxbridge_heap::HeapError::UnknownAlloc(id.0)))?;
                    let mut bytes = vec![0u8; len as usize];
                    heap.read(id, offset as usize, &mut bytes)?;
                    Bytes::from(bytes)
                } else {
                    reader
                        .get_blob()
                        .map_err(|source| malformed("BufferUnlock", source))?
                };
                if let WorkerObject::Buffer {
                    data: buffer_data, ..
                } = self.registry.get_mut(header.target)?
                {
                    let start = offset as usize;
                    let end = (start + data.len()).min(buffer_data.len());
                    buffer_data[start..end].copy_from_slice(&data[..end - start]);
                }
                self.engine.upload_buffer(header.target, offset, &data);
            }

            Opcode::UnlinkChild => {
                // The parent owned the worker-side identity; drop the
                // mapping without an engine destroy.
                self.registry.remove(header.target);
            }
            Opcode::DeviceDestroy
            | Opcode::TextureDestroy
            | Opcode::BufferDestroy
            | Opcode::SwapChainDestroy => {
                self.registry.remove(header.target);
                self.engine.destroy(header.target);
            }
        }

        if !freeform && reader.remaining() > 0 {
            return Err(malformed(
                header.opcode.name(),
                WireError::TrailingBytes {
                    remaining: reader.remaining(),
                },
            ));
        }
        Ok(LoopControl::Continue)
    }

    /// The bulk bytes of an unlock-style command: either resolved from
    /// the arena (by id) or taken inline from the payload blob.
    fn payload_bytes(
        &self,
        header: &CommandHeader,
        reader: &mut PayloadReader,
        opcode: &'static str,
    ) -> Result<Bytes> {
        if header.flags.contains(CommandFlags::DATA_IN_HEAP) {
            let id = AllocId(field(reader, opcode, PayloadReader::get_u32)?);
            let heap = self
                .heap
                .as_ref()
                .ok_or(ServerError::Heap(gfxbridge_heap::HeapError::UnknownAlloc(id.0)))?;
            let placement = heap.resolve(id)?;
            let mut bytes = vec![0u8; placement.byte_len];
            heap.read(id, 0, &mut bytes)?;
            Ok(Bytes::from(bytes))
        } else {
            reader.get_blob().map_err(|source| malformed(opcode, source))
        }
    }

    fn respond(
        &self,
        tx: &mut ChannelWriter,
        request: &CommandHeader,
        build: impl FnOnce(&mut PayloadWriter),
    ) -> Result<()> {
        if !request.flags.contains(CommandFlags::WANTS_RESPONSE) {
            return Ok(());
        }
        let mut payload = PayloadWriter::new();
        build(&mut payload);
        let mut header = CommandHeader::control(Opcode::Response);
        header.correlation = request.correlation;
        tx.push_durable(header, &payload.finish())?;
        Ok(())
    }
}

fn field<T>(
    reader: &mut PayloadReader,
    opcode: &'static str,
    get: impl FnOnce(&mut PayloadReader) -> gfxbridge_wire::Result<T>,
) -> Result<T> {
    get(reader).map_err(|source| malformed(opcode, source))
}

fn malformed(opcode: &'static str, source: WireError) -> ServerError {
    ServerError::MalformedPayload { opcode, source }
}

fn write_rect(surface: &mut [u8], width: u32, height: u32, rect: &Rect, data: &[u8]) {
    let row_len = rect.width as usize * 4;
    if u64::from(rect.x) + u64::from(rect.width) > u64::from(width)
        || u64::from(rect.y) + u64::from(rect.height) > u64::from(height)
    {
        warn!("unlock rectangle exceeds surface extent; upload ignored");
        return;
    }
    for (i, row) in (rect.y..rect.y + rect.height).enumerate() {
        let dst_start = (row as usize * width as usize + rect.x as usize) * 4;
        let src_start = i * row_len;
        if src_start + row_len > data.len() {
            break;
        }
        surface[dst_start..dst_start + row_len]
            .copy_from_slice(&data[src_start..src_start + row_len]);
    }
}
