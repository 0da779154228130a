use crate::error::Result;
use crate::payload::{PayloadReader, PayloadWriter};

/// Device creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDesc {
    pub width: u32,
    pub height: u32,
    pub back_buffers: u32,
    pub windowed: bool,
}

impl DeviceDesc {
    pub fn encode(&self, out: &mut PayloadWriter) {
        out.put_u32(self.width)
            .put_u32(self.height)
            .put_u32(self.back_buffers)
            .put_bool(self.windowed);
    }

    pub fn decode(src: &mut PayloadReader) -> Result<Self> {
        Ok(Self {
            width: src.get_u32()?,
            height: src.get_u32()?,
            back_buffers: src.get_u32()?,
            windowed: src.get_bool()?,
        })
    }
}

/// Texture creation parameters. `levels` counts mip levels; each level is
/// a lockable child surface of the texture container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub levels: u32,
    pub format: u32,
    pub usage: u32,
}

impl TextureDesc {
    pub fn encode(&self, out: &mut PayloadWriter) {
        out.put_u32(self.width)
            .put_u32(self.height)
            .put_u32(self.levels)
            .put_u32(self.format)
            .put_u32(self.usage);
    }

    pub fn decode(src: &mut PayloadReader) -> Result<Self> {
        Ok(Self {
            width: src.get_u32()?,
            height: src.get_u32()?,
            levels: src.get_u32()?,
            format: src.get_u32()?,
            usage: src.get_u32()?,
        })
    }

    /// Dimensions of one mip level (each level halves, floor 1).
    pub fn level_extent(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }
}

/// Linear buffer creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub len: u32,
    pub usage: u32,
    pub dynamic: bool,
}

impl BufferDesc {
    pub fn encode(&self, out: &mut PayloadWriter) {
        out.put_u32(self.len).put_u32(self.usage).put_bool(self.dynamic);
    }

    pub fn decode(src: &mut PayloadReader) -> Result<Self> {
        Ok(Self {
            len: src.get_u32()?,
            usage: src.get_u32()?,
            dynamic: src.get_bool()?,
        })
    }
}

/// A viewport rectangle with depth range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub min_z: f32,
    pub max_z: f32,
}

impl Viewport {
    pub fn encode(&self, out: &mut PayloadWriter) {
        out.put_u32(self.x)
            .put_u32(self.y)
            .put_u32(self.width)
            .put_u32(self.height)
            .put_f32(self.min_z)
            .put_f32(self.max_z);
    }

    pub fn decode(src: &mut PayloadReader) -> Result<Self> {
        Ok(Self {
            x: src.get_u32()?,
            y: src.get_u32()?,
            width: src.get_u32()?,
            height: src.get_u32()?,
            min_z: src.get_f32()?,
            max_z: src.get_f32()?,
        })
    }
}

/// A pixel rectangle (x, y, then extent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn encode(&self, out: &mut PayloadWriter) {
        out.put_u32(self.x)
            .put_u32(self.y)
            .put_u32(self.width)
            .put_u32(self.height);
    }

    pub fn decode(src: &mut PayloadReader) -> Result<Self> {
        Ok(Self {
            x: src.get_u32()?,
            y: src.get_u32()?,
            width: src.get_u32()?,
            height: src.get_u32()?,
        })
    }
}

/// Resource lock flags, a `u32` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockFlags(u32);

impl LockFlags {
    pub const NONE: LockFlags = LockFlags(0);
    /// The caller only reads; unlock transmits nothing.
    pub const READ_ONLY: LockFlags = LockFlags(0b0001);
    /// The caller rewrites the whole resource; the previous bulk
    /// allocation can be freed.
    pub const DISCARD: LockFlags = LockFlags(0b0010);
    /// The caller promises not to touch in-flight ranges.
    pub const NO_OVERWRITE: LockFlags = LockFlags(0b0100);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> LockFlags {
        LockFlags(bits)
    }

    pub fn contains(self, other: LockFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LockFlags {
    type Output = LockFlags;
    fn bitor(self, rhs: LockFlags) -> LockFlags {
        LockFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_round_trip() {
        let device = DeviceDesc {
            width: 1920,
            height: 1080,
            back_buffers: 2,
            windowed: true,
        };
        let texture = TextureDesc {
            width: 256,
            height: 128,
            levels: 9,
            format: 21,
            usage: 0,
        };
        let buffer = BufferDesc {
            len: 65536,
            usage: 8,
            dynamic: true,
        };
        let viewport = Viewport {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            min_z: 0.0,
            max_z: 1.0,
        };
        let rect = Rect {
            x: 16,
            y: 32,
            width: 64,
            height: 64,
        };

        let mut writer = PayloadWriter::new();
        device.encode(&mut writer);
        texture.encode(&mut writer);
        buffer.encode(&mut writer);
        viewport.encode(&mut writer);
        rect.encode(&mut writer);

        let mut reader = PayloadReader::new(writer.finish());
        assert_eq!(DeviceDesc::decode(&mut reader).unwrap(), device);
        assert_eq!(TextureDesc::decode(&mut reader).unwrap(), texture);
        assert_eq!(BufferDesc::decode(&mut reader).unwrap(), buffer);
        assert_eq!(Viewport::decode(&mut reader).unwrap(), viewport);
        assert_eq!(Rect::decode(&mut reader).unwrap(), rect);
        reader.finish().unwrap();
    }

    #[test]
    fn mip_extents_halve_with_floor_one() {
        let texture = TextureDesc {
            width: 256,
            height: 100,
            levels: 9,
            format: 0,
            usage: 0,
        };
        assert_eq!(texture.level_extent(0), (256, 100));
        assert_eq!(texture.level_extent(1), (128, 50));
        assert_eq!(texture.level_extent(7), (2, 1));
        assert_eq!(texture.level_extent(8), (1, 1));
    }

    #[test]
    fn lock_flags_combine() {
        let flags = LockFlags::DISCARD | LockFlags::NO_OVERWRITE;
        assert!(flags.contains(LockFlags::DISCARD));
        assert!(!flags.contains(LockFlags::READ_ONLY));
        assert_eq!(LockFlags::from_bits(flags.bits()), flags);
    }
}
