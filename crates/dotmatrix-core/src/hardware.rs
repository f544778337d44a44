use thiserror::Error;

/// ORed combination of load flags accepted by [`crate::gameboy::GameBoy::load`].
pub mod loadflag {
    /// Treat the ROM as having CGB support regardless of what its header
    /// advertises.
    pub const CGB_MODE: u32 = 1;
    /// Use GBA initial CPU register values when in CGB mode.
    pub const GBA_FLAG: u32 = 2;
    /// Use heuristics to detect and support some multicart MBCs disguised
    /// as MBC1.
    pub const MULTICART_COMPAT: u32 = 4;
    /// Treat the ROM as having SGB support regardless of what its header
    /// advertises.
    pub const SGB_MODE: u32 = 8;
    /// Prevent implicit save-data flushes for the ROM.
    pub const READONLY_SAV: u32 = 16;
    /// Skip the boot ROM and synthesize the post-boot hardware state.
    pub const NO_BIOS: u32 = 32;
}

/// Load-time validation failures. Every variant maps to a small negative
/// status code via [`LoadError::code`]; hardware-level conditions never
/// surface here (they resolve to open-bus values on the bus instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("ROM image is empty")]
    EmptyImage,
    #[error("ROM image too small to contain a cartridge header")]
    BadHeader,
    #[error("ROM size does not match the header bank count")]
    BadRomSize,
    #[error("unsupported cartridge type {0:#04x}")]
    UnsupportedMbc(u8),
    #[error("BIOS image size mismatch")]
    BadBiosSize,
    #[error("BIOS image CRC mismatch")]
    BadBiosCrc,
    #[error("no ROM image loaded")]
    NotLoaded,
}

impl LoadError {
    /// Status code for callers that want the C-style negative integer.
    pub fn code(self) -> i32 {
        match self {
            LoadError::EmptyImage => -1,
            LoadError::BadHeader => -2,
            LoadError::BadRomSize => -3,
            LoadError::UnsupportedMbc(_) => -4,
            LoadError::BadBiosSize => -5,
            LoadError::BadBiosCrc => -6,
            LoadError::NotLoaded => -7,
        }
    }
}

/// Layer mask bits for [`crate::ppu::Ppu::set_layers`].
pub const LAYER_MASK_BG: u8 = 1;
pub const LAYER_MASK_WINDOW: u8 = 2;
pub const LAYER_MASK_OBJ: u8 = 4;

/// DMG palette identifiers for `set_dmg_palette_color`.
pub const BG_PALETTE: usize = 0;
pub const SP1_PALETTE: usize = 1;
pub const SP2_PALETTE: usize = 2;

/// Bits of the mode fingerprint byte stored in save states. A state saved in
/// one hardware mode is rejected by a strict load in another.
pub fn mode_fingerprint(flags: u32) -> u8 {
    (flags & (loadflag::CGB_MODE | loadflag::SGB_MODE)) as u8
}
