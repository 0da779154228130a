use crate::error::{Result, WireError};

/// Command opcodes carried in the message header.
///
/// Values are part of the wire contract: the interceptor and worker are
/// built separately and must agree on every discriminant, so each variant
/// carries an explicit value and unknown values are a fatal protocol error
/// on decode. Grouped by target: bridge control, bulk heap management,
/// parent/child link maintenance, then one block per proxy variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    // Bridge control
    Syn = 0x0001,
    Ack = 0x0002,
    Continue = 0x0003,
    Response = 0x0004,
    DebugMessage = 0x0005,

    // Bulk data arena management
    HeapAlloc = 0x0010,
    HeapFree = 0x0011,

    // Identity link maintenance. A child proxy destroyed alongside its
    // parent sends UnlinkChild rather than a destroy, so the worker can
    // drop its handle mapping without double-destroying the resource.
    UnlinkChild = 0x0020,
    LinkSwapChain = 0x0021,
    LinkBackBuffer = 0x0022,

    // Module (top-level interface object)
    ModuleGetAdapterCount = 0x0040,
    ModuleCheckFormat = 0x0041,
    ModuleCreateDevice = 0x0042,
    ModuleDestroy = 0x0043,

    // Device
    DeviceDestroy = 0x0080,
    DeviceReset = 0x0081,
    DevicePresent = 0x0082,
    DeviceBeginScene = 0x0083,
    DeviceEndScene = 0x0084,
    DeviceClear = 0x0085,
    DeviceSetRenderState = 0x0086,
    DeviceGetRenderState = 0x0087,
    DeviceSetViewport = 0x0088,
    DeviceSetTexture = 0x0089,
    DeviceDrawPrimitive = 0x008A,
    DeviceDrawIndexedPrimitive = 0x008B,
    DeviceCreateTexture = 0x008C,
    DeviceCreateBuffer = 0x008D,
    DeviceGetAvailableMemory = 0x008E,
    DeviceTestCooperativeLevel = 0x008F,

    // Texture (mip-chain container)
    TextureGetSurfaceLevel = 0x00C0,
    TextureDestroy = 0x00C1,
    TextureGenerateMips = 0x00C2,
    TextureSetPriority = 0x00C3,

    // Surface (lockable 2D child resource). Locks are interceptor-local;
    // only the unlock's data transfer crosses the wire.
    SurfaceUnlock = 0x00E1,

    // Buffer (lockable linear resource)
    BufferUnlock = 0x0101,
    BufferDestroy = 0x0102,

    // Swap chain (back-buffer container)
    SwapChainPresent = 0x0120,
    SwapChainDestroy = 0x0122,

    // Session teardown notice
    Terminate = 0xFFFF,
}

impl Opcode {
    /// Decode a wire value. Unknown values are a protocol error.
    pub fn from_u16(value: u16) -> Result<Opcode> {
        use Opcode::*;
        Ok(match value {
            0x0001 => Syn,
            0x0002 => Ack,
            0x0003 => Continue,
            0x0004 => Response,
            0x0005 => DebugMessage,
            0x0010 => HeapAlloc,
            0x0011 => HeapFree,
            0x0020 => UnlinkChild,
            0x0021 => LinkSwapChain,
            0x0022 => LinkBackBuffer,
            0x0040 => ModuleGetAdapterCount,
            0x0041 => ModuleCheckFormat,
            0x0042 => ModuleCreateDevice,
            0x0043 => ModuleDestroy,
            0x0080 => DeviceDestroy,
            0x0081 => DeviceReset,
            0x0082 => DevicePresent,
            0x0083 => DeviceBeginScene,
            0x0084 => DeviceEndScene,
            0x0085 => DeviceClear,
            0x0086 => DeviceSetRenderState,
            0x0087 => DeviceGetRenderState,
            0x0088 => DeviceSetViewport,
            0x0089 => DeviceSetTexture,
            0x008A => DeviceDrawPrimitive,
            0x008B => DeviceDrawIndexedPrimitive,
            0x008C => DeviceCreateTexture,
            0x008D => DeviceCreateBuffer,
            0x008E => DeviceGetAvailableMemory,
            0x008F => DeviceTestCooperativeLevel,
            0x00C0 => TextureGetSurfaceLevel,
            0x00C1 => TextureDestroy,
            0x00C2 => TextureGenerateMips,
            0x00C3 => TextureSetPriority,
            0x00E1 => SurfaceUnlock,
            0x0101 => BufferUnlock,
            0x0102 => BufferDestroy,
            0x0120 => SwapChainPresent,
            0x0122 => SwapChainDestroy,
            0xFFFF => Terminate,
            other => return Err(WireError::UnknownOpcode(other)),
        })
    }

    /// The wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Human-readable name for logs and the command history dump.
    pub fn name(self) -> &'static str {
        use Opcode::*;
        match self {
            Syn => "Syn",
            Ack => "Ack",
            Continue => "Continue",
            Response => "Response",
            DebugMessage => "DebugMessage",
            HeapAlloc => "HeapAlloc",
            HeapFree => "HeapFree",
            UnlinkChild => "UnlinkChild",
            LinkSwapChain => "LinkSwapChain",
            LinkBackBuffer => "LinkBackBuffer",
            ModuleGetAdapterCount => "ModuleGetAdapterCount",
            ModuleCheckFormat => "ModuleCheckFormat",
            ModuleCreateDevice => "ModuleCreateDevice",
            ModuleDestroy => "ModuleDestroy",
            DeviceDestroy => "DeviceDestroy",
            DeviceReset => "DeviceReset",
            DevicePresent => "DevicePresent",
            DeviceBeginScene => "DeviceBeginScene",
            DeviceEndScene => "DeviceEndScene",
            DeviceClear => "DeviceClear",
            DeviceSetRenderState => "DeviceSetRenderState",
            DeviceGetRenderState => "DeviceGetRenderState",
            DeviceSetViewport => "DeviceSetViewport",
            DeviceSetTexture => "DeviceSetTexture",
            DeviceDrawPrimitive => "DeviceDrawPrimitive",
            DeviceDrawIndexedPrimitive => "DeviceDrawIndexedPrimitive",
            DeviceCreateTexture => "DeviceCreateTexture",
            DeviceCreateBuffer => "DeviceCreateBuffer",
            DeviceGetAvailableMemory => "DeviceGetAvailableMemory",
            DeviceTestCooperativeLevel => "DeviceTestCooperativeLevel",
            TextureGetSurfaceLevel => "TextureGetSurfaceLevel",
            TextureDestroy => "TextureDestroy",
            TextureGenerateMips => "TextureGenerateMips",
            TextureSetPriority => "TextureSetPriority",
            SurfaceUnlock => "SurfaceUnlock",
            BufferUnlock => "BufferUnlock",
            BufferDestroy => "BufferDestroy",
            SwapChainPresent => "SwapChainPresent",
            SwapChainDestroy => "SwapChainDestroy",
            Terminate => "Terminate",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-command flag bits carried in the header.
///
/// A plain `u16` newtype; the bit assignments are part of the wire
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// No flags set.
    pub const NONE: CommandFlags = CommandFlags(0);
    /// The command's bulk data lives in the shared heap; the payload
    /// carries only an allocation id.
    pub const DATA_IN_HEAP: CommandFlags = CommandFlags(0b0000_0001);
    /// The command may be dropped when the channel is full (purely
    /// informational traffic).
    pub const LOSSY: CommandFlags = CommandFlags(0b0000_0010);
    /// The caller registered a pending call and is blocked waiting; the
    /// worker must push a `Response` with the same correlation id.
    pub const WANTS_RESPONSE: CommandFlags = CommandFlags(0b0000_0100);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> CommandFlags {
        CommandFlags(bits)
    }

    pub fn contains(self, other: CommandFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CommandFlags {
    type Output = CommandFlags;
    fn bitor(self, rhs: CommandFlags) -> CommandFlags {
        CommandFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_round_trips_through_u16() {
        let all = [
            Opcode::Syn,
            Opcode::Ack,
            Opcode::Continue,
            Opcode::Response,
            Opcode::DebugMessage,
            Opcode::HeapAlloc,
            Opcode::HeapFree,
            Opcode::UnlinkChild,
            Opcode::LinkSwapChain,
            Opcode::LinkBackBuffer,
            Opcode::ModuleGetAdapterCount,
            Opcode::ModuleCheckFormat,
            Opcode::ModuleCreateDevice,
            Opcode::ModuleDestroy,
            Opcode::DeviceDestroy,
            Opcode::DeviceReset,
            Opcode::DevicePresent,
            Opcode::DeviceBeginScene,
            Opcode::DeviceEndScene,
            Opcode::DeviceClear,
            Opcode::DeviceSetRenderState,
            Opcode::DeviceGetRenderState,
            Opcode::DeviceSetViewport,
            Opcode::DeviceSetTexture,
            Opcode::DeviceDrawPrimitive,
            Opcode::DeviceDrawIndexedPrimitive,
            Opcode::DeviceCreateTexture,
            Opcode::DeviceCreateBuffer,
            Opcode::DeviceGetAvailableMemory,
            Opcode::DeviceTestCooperativeLevel,
            Opcode::TextureGetSurfaceLevel,
            Opcode::TextureDestroy,
            Opcode::TextureGenerateMips,
            Opcode::TextureSetPriority,
            Opcode::SurfaceUnlock,
            Opcode::BufferUnlock,
            Opcode::BufferDestroy,
            Opcode::SwapChainPresent,
            Opcode::SwapChainDestroy,
            Opcode::Terminate,
        ];
        for op in all {
            assert_eq!(Opcode::from_u16(op.as_u16()).unwrap(), op);
            assert!(!op.name().is_empty());
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        assert!(matches!(
            Opcode::from_u16(0x7777),
            Err(WireError::UnknownOpcode(0x7777))
        ));
        assert!(matches!(Opcode::from_u16(0), Err(WireError::UnknownOpcode(0))));
    }

    #[test]
    fn flags_combine_and_query() {
        let flags = CommandFlags::DATA_IN_HEAP | CommandFlags::LOSSY;
        assert!(flags.contains(CommandFlags::DATA_IN_HEAP));
        assert!(flags.contains(CommandFlags::LOSSY));
        assert!(!CommandFlags::NONE.contains(CommandFlags::DATA_IN_HEAP));
        assert_eq!(CommandFlags::from_bits(flags.bits()), flags);
    }
}
