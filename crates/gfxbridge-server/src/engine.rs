use gfxbridge_wire::{BufferDesc, DeviceDesc, Rect, TextureDesc, Viewport};

/// The execution engine consuming forwarded commands.
///
/// The real renderer lives outside this crate; the worker loop only
/// translates wire traffic into these calls. [`NullEngine`] satisfies the
/// trait for tests and for running the bridge without a renderer.
pub trait Engine: Send {
    fn create_device(&mut self, handle: u32, desc: &DeviceDesc);
    fn create_texture(&mut self, handle: u32, desc: &TextureDesc);
    fn create_buffer(&mut self, handle: u32, desc: &BufferDesc);
    fn destroy(&mut self, handle: u32);
    fn reset_device(&mut self, handle: u32);

    fn set_render_state(&mut self, state: u32, value: u32);
    fn set_viewport(&mut self, viewport: &Viewport);
    fn set_texture(&mut self, stage: u32, texture_handle: u32);
    fn begin_scene(&mut self);
    fn end_scene(&mut self);
    fn clear(&mut self, flags: u32, color: u32, depth: f32, stencil: u32);
    fn draw_primitive(&mut self, primitive: u32, start_vertex: u32, count: u32);
    fn draw_indexed_primitive(
        &mut self,
        primitive: u32,
        base_vertex: u32,
        start_index: u32,
        count: u32,
    );
    fn present(&mut self);

    fn upload_surface(&mut self, handle: u32, rect: &Rect, pitch: u32, data: &[u8]);
    fn upload_buffer(&mut self, handle: u32, offset: u32, data: &[u8]);
    fn generate_mips(&mut self, handle: u32);

    fn adapter_count(&self) -> u32 {
        1
    }

    fn supports_format(&self, _format: u32) -> bool {
        true
    }

    fn available_memory(&self) -> u64 {
        512 * 1024 * 1024
    }
}

/// Engine that does nothing but count what it was asked to do. Stands in
/// for the real renderer in tests and smoke runs.
#[derive(Debug)]
pub struct NullEngine {
    pub devices_created: u32,
    pub textures_created: u32,
    pub buffers_created: u32,
    pub objects_destroyed: u32,
    pub draws: u32,
    pub clears: u32,
    pub presents: u32,
    pub surface_bytes_uploaded: u64,
    pub buffer_bytes_uploaded: u64,
    /// Value reported for available-memory queries.
    pub available_memory: u64,
}

impl Default for NullEngine {
    fn default() -> Self {
        Self {
            devices_created: 0,
            textures_created: 0,
            buffers_created: 0,
            objects_destroyed: 0,
            draws: 0,
            clears: 0,
            presents: 0,
            surface_bytes_uploaded: 0,
            buffer_bytes_uploaded: 0,
            available_memory: 512 * 1024 * 1024,
        }
    }
}

impl Engine for NullEngine {
    fn create_device(&mut self, _handle: u32, _desc: &DeviceDesc) {
        self.devices_created += 1;
    }

    fn create_texture(&mut self, _handle: u32, _desc: &TextureDesc) {
        self.textures_created += 1;
    }

    fn create_buffer(&mut self, _handle: u32, _desc: &BufferDesc) {
        self.buffers_created += 1;
    }

    fn destroy(&mut self, _handle: u32) {
        self.objects_destroyed += 1;
    }

    fn reset_device(&mut self, _handle: u32) {}

    fn set_render_state(&mut self, _state: u32, _value: u32) {}
    fn set_viewport(&mut self, _viewport: &Viewport) {}
    fn set_texture(&mut self, _stage: u32, _texture_handle: u32) {}
    fn begin_scene(&mut self) {}
    fn end_scene(&mut self) {}

    fn clear(&mut self, _flags: u32, _color: u32, _depth: f32, _stencil: u32) {
        self.clears += 1;
    }

    fn draw_primitive(&mut self, _primitive: u32, _start_vertex: u32, _count: u32) {
        self.draws += 1;
    }

    fn draw_indexed_primitive(
        &mut self,
        _primitive: u32,
        _base_vertex: u32,
        _start_index: u32,
        _count: u32,
    ) {
        self.draws += 1;
    }

    fn present(&mut self) {
        self.presents += 1;
    }

    fn upload_surface(&mut self, _handle: u32, _rect: &Rect, _pitch: u32, data: &[u8]) {
        self.surface_bytes_uploaded += data.len() as u64;
    }

    fn upload_buffer(&mut self, _handle: u32, _offset: u32, data: &[u8]) {
        self.buffer_bytes_uploaded += data.len() as u64;
    }

    fn generate_mips(&mut self, _handle: u32) {}

    fn available_memory(&self) -> u64 {
        self.available_memory
    }
}
