use std::{
    fs, io,
    path::PathBuf,
};

use log::{info, warn};

use crate::hardware::LoadError;
use crate::rtc::{HuC3Chip, Rtc, Time, TimeMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MbcType {
    NoMbc,
    Mbc1,
    Mbc1Multicart,
    Mbc2,
    Mbc3,
    Mbc5,
    HuC1,
    HuC3,
}

impl MbcType {
    pub fn label(self) -> &'static str {
        match self {
            MbcType::NoMbc => "ROM",
            MbcType::Mbc1 => "MBC1",
            MbcType::Mbc1Multicart => "MBC1M",
            MbcType::Mbc2 => "MBC2",
            MbcType::Mbc3 => "MBC3",
            MbcType::Mbc5 => "MBC5",
            MbcType::HuC1 => "HuC1",
            MbcType::HuC3 => "HuC3",
        }
    }
}

/// Derived, read-only metadata about the loaded cartridge. Computed once at
/// load time.
#[derive(Debug, Clone)]
pub struct PakInfo {
    pub mbc: MbcType,
    pub rom_banks: usize,
    pub ram_banks: usize,
    pub header_checksum_ok: bool,
    pub crc32: u32,
}

#[derive(Debug)]
enum MbcState {
    NoMbc,
    Mbc1 {
        rom_bank: u8,
        ram_bank: u8,
        mode: u8,
        ram_enable: bool,
        multicart: bool,
    },
    Mbc2 {
        rom_bank: u8,
        ram_enable: bool,
    },
    Mbc3 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        latch_pending: bool,
    },
    Mbc5 {
        rom_bank: u16,
        ram_bank: u8,
        ram_enable: bool,
    },
    HuC1 {
        rom_bank: u8,
        ram_bank: u8,
        ram_enable: bool,
        ir_mode: bool,
    },
    HuC3 {
        rom_bank: u8,
        ram_bank: u8,
        ramflag: u8,
    },
}

const RTC_FILE_MAGIC: &[u8; 4] = b"DMRT";
const RTC_FILE_VERSION: u8 = 1;

pub struct Cartridge {
    pub rom: Vec<u8>,
    pub ram: Vec<u8>,
    pub mbc: MbcType,
    pub cgb: bool,
    pub sgb: bool,
    pub title: String,
    cart_type: u8,
    mbc_state: MbcState,
    pub(crate) rtc: Option<Rtc>,
    pub(crate) huc3: Option<HuC3Chip>,
    pub(crate) time: Time,
    pak: PakInfo,
    save_base: Option<PathBuf>,
    gg_undo: Vec<(usize, u8)>,
}

impl Cartridge {
    pub fn load(data: Vec<u8>, multicart_compat: bool) -> Result<Self, LoadError> {
        if data.is_empty() {
            return Err(LoadError::EmptyImage);
        }
        if data.len() < 0x150 {
            return Err(LoadError::BadHeader);
        }

        let header = Header { data: &data };
        let cart_type = header.cart_type();
        let mut mbc = match cart_type {
            0x00 | 0x08 | 0x09 => MbcType::NoMbc,
            0x01..=0x03 => MbcType::Mbc1,
            0x05 | 0x06 => MbcType::Mbc2,
            0x0F..=0x13 => MbcType::Mbc3,
            0x19..=0x1E => MbcType::Mbc5,
            0xFE => MbcType::HuC3,
            0xFF => MbcType::HuC1,
            other => return Err(LoadError::UnsupportedMbc(other)),
        };

        let rom_banks = header.rom_banks().ok_or(LoadError::BadRomSize)?;
        if data.len() != rom_banks * 0x4000 {
            return Err(LoadError::BadRomSize);
        }

        if mbc == MbcType::Mbc1 && multicart_compat && detect_mbc1_multicart(&data) {
            info!("MBC1 multicart heuristics matched");
            mbc = MbcType::Mbc1Multicart;
        }

        let ram_size = header.ram_size();
        let has_rtc = header.has_rtc();
        let cgb = header.cgb_supported();
        let sgb = header.sgb_supported();
        let title = header.title();

        let mbc_state = match mbc {
            MbcType::NoMbc => MbcState::NoMbc,
            MbcType::Mbc1 | MbcType::Mbc1Multicart => MbcState::Mbc1 {
                rom_bank: 1,
                ram_bank: 0,
                mode: 0,
                ram_enable: false,
                multicart: mbc == MbcType::Mbc1Multicart,
            },
            MbcType::Mbc2 => MbcState::Mbc2 {
                rom_bank: 1,
                ram_enable: false,
            },
            MbcType::Mbc3 => MbcState::Mbc3 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                latch_pending: false,
            },
            MbcType::Mbc5 => MbcState::Mbc5 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
            },
            MbcType::HuC1 => MbcState::HuC1 {
                rom_bank: 1,
                ram_bank: 0,
                ram_enable: false,
                ir_mode: false,
            },
            MbcType::HuC3 => MbcState::HuC3 {
                rom_bank: 1,
                ram_bank: 0,
                ramflag: 0,
            },
        };

        let pak = PakInfo {
            mbc,
            rom_banks,
            ram_banks: ram_size.div_ceil(0x2000),
            header_checksum_ok: header.checksum_ok(),
            crc32: crc32fast::hash(&data),
        };
        if !pak.header_checksum_ok {
            warn!("cartridge header checksum mismatch");
        }

        Ok(Self {
            rom: data,
            ram: vec![0; ram_size],
            mbc,
            cgb,
            sgb,
            title,
            cart_type,
            mbc_state,
            rtc: has_rtc.then(Rtc::new),
            huc3: (mbc == MbcType::HuC3).then(HuC3Chip::new),
            time: Time::new(TimeMode::Wall),
            pak,
            save_base: None,
            gg_undo: Vec::new(),
        })
    }

    pub fn pak_info(&self) -> &PakInfo {
        &self.pak
    }

    /// Base path (directory + stem) for the `.sav`/`.rtc` companions.
    pub fn set_save_base(&mut self, base: Option<PathBuf>) {
        self.save_base = base;
    }

    pub fn save_base(&self) -> Option<&PathBuf> {
        self.save_base.as_ref()
    }

    pub fn set_time_mode(&mut self, mode: TimeMode, cc: u64) {
        self.time.set_mode(mode, cc);
    }

    pub fn time_now(&mut self, cc: u64) -> u32 {
        self.time.time(cc)
    }

    pub fn reset_cc(&mut self, old_cc: u64, new_cc: u64) {
        self.time.reset_cc(old_cc, new_cc);
    }

    /// Return the banking hardware to its power-on configuration (reset
    /// without reloading the image).
    pub fn reset_banking(&mut self) {
        match &mut self.mbc_state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ram_enable,
                ..
            } => {
                *rom_bank = 1;
                *ram_bank = 0;
                *mode = 0;
                *ram_enable = false;
            }
            MbcState::Mbc2 {
                rom_bank,
                ram_enable,
            } => {
                *rom_bank = 1;
                *ram_enable = false;
            }
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                latch_pending,
            } => {
                *rom_bank = 1;
                *ram_bank = 0;
                *ram_enable = false;
                *latch_pending = false;
            }
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => {
                *rom_bank = 1;
                *ram_bank = 0;
                *ram_enable = false;
            }
            MbcState::HuC1 {
                rom_bank,
                ram_bank,
                ram_enable,
                ir_mode,
            } => {
                *rom_bank = 1;
                *ram_bank = 0;
                *ram_enable = false;
                *ir_mode = false;
            }
            MbcState::HuC3 {
                rom_bank,
                ram_bank,
                ramflag,
            } => {
                *rom_bank = 1;
                *ram_bank = 0;
                *ramflag = 0;
            }
        }
        if let Some(rtc) = self.rtc.as_mut() {
            rtc.select(false, 0);
        }
    }

    /// The bank currently mapped into the switchable ROM window, after the
    /// variant's masking and aliasing rules.
    pub fn cur_rom_bank(&self) -> u16 {
        let rom_banks = self.pak.rom_banks as u16;
        let bank = match &self.mbc_state {
            MbcState::NoMbc => 1,
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                multicart,
                ..
            } => {
                if *multicart {
                    let high = ((*ram_bank as u16) & 0x03) << 4;
                    let raw = *rom_bank as u16 & 0x1F;
                    let low4 = raw & 0x0F;
                    let low = if low4 == 0 && raw & 0x10 == 0 { 1 } else { low4 };
                    high | low
                } else {
                    let high = ((*ram_bank as u16) & 0x03) << 5;
                    let mut bank = high | (*rom_bank as u16 & 0x1F);
                    if bank & 0x1F == 0 {
                        bank += 1;
                    }
                    bank
                }
            }
            MbcState::Mbc2 { rom_bank, .. } => {
                let bank = (*rom_bank & 0x0F) as u16;
                if bank == 0 { 1 } else { bank }
            }
            MbcState::Mbc3 { rom_bank, .. } => {
                let bank = *rom_bank as u16 & 0x7F;
                if bank == 0 { 1 } else { bank }
            }
            MbcState::Mbc5 { rom_bank, .. } => *rom_bank & 0x1FF,
            MbcState::HuC1 { rom_bank, .. } => {
                let bank = *rom_bank as u16 & 0x3F;
                if bank == 0 { 1 } else { bank }
            }
            MbcState::HuC3 { rom_bank, .. } => {
                let bank = *rom_bank as u16 & 0x7F;
                if bank == 0 { 1 } else { bank }
            }
        };
        bank % rom_banks.max(1)
    }

    /// Bank mapped into the fixed 0x0000-0x3FFF window (non-zero only for
    /// MBC1 mode 1).
    fn low_rom_bank(&self) -> usize {
        match &self.mbc_state {
            MbcState::Mbc1 {
                ram_bank,
                mode,
                multicart,
                ..
            } if *mode != 0 => {
                let bank = if *multicart {
                    ((*ram_bank as usize) & 0x03) << 4
                } else {
                    ((*ram_bank as usize) & 0x03) << 5
                };
                bank % self.pak.rom_banks.max(1)
            }
            _ => 0,
        }
    }

    /// True when a read from the external RAM window does not drive the bus
    /// (RAM missing, disabled, or an unmapped chip register selected).
    pub fn ram_disabled(&self) -> bool {
        match &self.mbc_state {
            MbcState::NoMbc => self.ram.is_empty(),
            MbcState::Mbc1 { ram_enable, .. } | MbcState::Mbc2 { ram_enable, .. } => !*ram_enable,
            MbcState::Mbc3 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if !*ram_enable {
                    return true;
                }
                match *ram_bank {
                    0x00..=0x03 => self.ram.is_empty(),
                    0x08..=0x0C => self.rtc.is_none(),
                    _ => true,
                }
            }
            MbcState::Mbc5 { ram_enable, .. } => !*ram_enable || self.ram.is_empty(),
            MbcState::HuC1 { .. } => false,
            MbcState::HuC3 { ramflag, .. } => match *ramflag {
                0x00 | 0x0A => self.ram.is_empty(),
                0x0B..=0x0D => false,
                _ => true,
            },
        }
    }

    pub fn is_mbc2(&self) -> bool {
        matches!(self.mbc_state, MbcState::Mbc2 { .. })
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0x0000..=0x3FFF => {
                let offset = self.low_rom_bank() * 0x4000 + addr as usize;
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            0x4000..=0x7FFF => {
                let bank = self.cur_rom_bank() as usize;
                let offset = bank * 0x4000 + (addr as usize - 0x4000);
                self.rom.get(offset).copied().unwrap_or(0xFF)
            }
            0xA000..=0xBFFF => self.ram_read(addr),
            _ => 0xFF,
        }
    }

    fn ram_read(&self, addr: u16) -> u8 {
        match &self.mbc_state {
            MbcState::NoMbc => {
                let idx = addr as usize - 0xA000;
                self.ram.get(idx).copied().unwrap_or(0xFF)
            }
            MbcState::Mbc1 {
                ram_enable,
                ram_bank,
                mode,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                let bank = if *mode != 0 { (*ram_bank & 0x03) as usize } else { 0 };
                let idx = self.banked_ram_index(addr, bank);
                self.ram.get(idx).copied().unwrap_or(0xFF)
            }
            MbcState::Mbc2 { ram_enable, .. } => {
                if !*ram_enable {
                    return 0xFF;
                }
                // MBC2 has 512x4-bit internal RAM, mirrored across the window.
                let idx = (addr as usize - 0xA000) & 0x01FF;
                let nibble = self.ram.get(idx).copied().unwrap_or(0x0F) & 0x0F;
                0xF0 | nibble
            }
            MbcState::Mbc3 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                match *ram_bank {
                    0x00..=0x03 => {
                        let idx = self.banked_ram_index(addr, (*ram_bank & 0x03) as usize);
                        self.ram.get(idx).copied().unwrap_or(0xFF)
                    }
                    0x08..=0x0C => self.rtc.as_ref().map(|r| r.read()).unwrap_or(0xFF),
                    _ => 0xFF,
                }
            }
            MbcState::Mbc5 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if !*ram_enable {
                    return 0xFF;
                }
                let idx = self.banked_ram_index(addr, *ram_bank as usize);
                self.ram.get(idx).copied().unwrap_or(0xFF)
            }
            MbcState::HuC1 {
                ram_bank, ir_mode, ..
            } => {
                if *ir_mode {
                    // IR receiver status: no light seen.
                    0xC0
                } else {
                    let idx = self.banked_ram_index(addr, (*ram_bank & 0x03) as usize);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
            }
            MbcState::HuC3 {
                ram_bank, ramflag, ..
            } => match *ramflag {
                0x00 | 0x0A => {
                    let idx = self.banked_ram_index(addr, (*ram_bank & 0x03) as usize);
                    self.ram.get(idx).copied().unwrap_or(0xFF)
                }
                0x0B..=0x0D => {
                    let flag = *ramflag;
                    self.huc3.as_ref().map(|c| c.read(flag)).unwrap_or(0xFF)
                }
                _ => 0xFF,
            },
        }
    }

    fn banked_ram_index(&self, addr: u16, bank: usize) -> usize {
        let ram_banks = self.ram.len().div_ceil(0x2000);
        let bank = if ram_banks == 0 { 0 } else { bank % ram_banks };
        bank * 0x2000 + (addr as usize - 0xA000)
    }

    pub fn write(&mut self, addr: u16, val: u8, cc: u64) {
        match addr {
            0x0000..=0x7FFF => self.rom_write(addr, val, cc),
            0xA000..=0xBFFF => self.ram_write(addr, val, cc),
            _ => {}
        }
    }

    /// Bank-select register writes. Register addresses outside the active
    /// variant's decode are ignored.
    pub fn rom_write(&mut self, addr: u16, val: u8, cc: u64) {
        match (&mut self.mbc_state, addr) {
            (MbcState::Mbc1 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x1F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::Mbc1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::Mbc1 { mode, .. }, 0x6000..=0x7FFF) => {
                *mode = val & 0x01;
            }
            (
                MbcState::Mbc2 {
                    rom_bank,
                    ram_enable,
                },
                0x0000..=0x3FFF,
            ) => {
                // MBC2 uses address bit 8 to select between RAMG and ROMB:
                // bit8=0 toggles RAM enable, bit8=1 selects the ROM bank.
                if addr & 0x0100 == 0 {
                    *ram_enable = val & 0x0F == 0x0A;
                } else {
                    *rom_bank = val & 0x0F;
                    if *rom_bank == 0 {
                        *rom_bank = 1;
                    }
                }
            }
            (
                MbcState::Mbc3 {
                    ram_enable,
                    ram_bank,
                    ..
                },
                0x0000..=0x1FFF,
            ) => {
                *ram_enable = val & 0x0F == 0x0A;
                if let Some(rtc) = self.rtc.as_mut() {
                    rtc.select(*ram_enable, *ram_bank);
                }
            }
            (MbcState::Mbc3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (
                MbcState::Mbc3 {
                    ram_bank,
                    ram_enable,
                    ..
                },
                0x4000..=0x5FFF,
            ) => {
                *ram_bank = val;
                if let Some(rtc) = self.rtc.as_mut() {
                    rtc.select(*ram_enable, *ram_bank);
                }
            }
            (MbcState::Mbc3 { latch_pending, .. }, 0x6000..=0x7FFF) => {
                // A 0x00 write followed by 0x01 latches the clock.
                if val == 0 {
                    *latch_pending = true;
                } else if val == 1 && *latch_pending {
                    *latch_pending = false;
                    if let Some(rtc) = self.rtc.as_mut() {
                        rtc.latch(&mut self.time, cc);
                    }
                } else {
                    *latch_pending = false;
                }
            }
            (MbcState::Mbc5 { ram_enable, .. }, 0x0000..=0x1FFF) => {
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x2000..=0x2FFF) => {
                *rom_bank = (*rom_bank & 0x100) | val as u16;
            }
            (MbcState::Mbc5 { rom_bank, .. }, 0x3000..=0x3FFF) => {
                *rom_bank = (*rom_bank & 0xFF) | (((val & 0x01) as u16) << 8);
            }
            (MbcState::Mbc5 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x0F;
            }
            (
                MbcState::HuC1 {
                    ram_enable,
                    ir_mode,
                    ..
                },
                0x0000..=0x1FFF,
            ) => {
                *ir_mode = val & 0x0F == 0x0E;
                *ram_enable = val & 0x0F == 0x0A;
            }
            (MbcState::HuC1 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x3F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::HuC1 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            (MbcState::HuC3 { ramflag, .. }, 0x0000..=0x1FFF) => {
                *ramflag = val & 0x0F;
            }
            (MbcState::HuC3 { rom_bank, .. }, 0x2000..=0x3FFF) => {
                *rom_bank = val & 0x7F;
                if *rom_bank == 0 {
                    *rom_bank = 1;
                }
            }
            (MbcState::HuC3 { ram_bank, .. }, 0x4000..=0x5FFF) => {
                *ram_bank = val & 0x03;
            }
            _ => {}
        }
    }

    fn ram_write(&mut self, addr: u16, val: u8, cc: u64) {
        match &self.mbc_state {
            MbcState::NoMbc => {
                let idx = addr as usize - 0xA000;
                if let Some(b) = self.ram.get_mut(idx) {
                    *b = val;
                }
            }
            MbcState::Mbc1 {
                ram_enable,
                ram_bank,
                mode,
                ..
            } => {
                if *ram_enable {
                    let bank = if *mode != 0 { (*ram_bank & 0x03) as usize } else { 0 };
                    let idx = self.banked_ram_index(addr, bank);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }
            MbcState::Mbc2 { ram_enable, .. } => {
                if *ram_enable {
                    let idx = (addr as usize - 0xA000) & 0x01FF;
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val & 0x0F;
                    }
                }
            }
            MbcState::Mbc3 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if *ram_enable {
                    match *ram_bank {
                        0x00..=0x03 => {
                            let idx = self.banked_ram_index(addr, (*ram_bank & 0x03) as usize);
                            if let Some(b) = self.ram.get_mut(idx) {
                                *b = val;
                            }
                        }
                        0x08..=0x0C => {
                            if let Some(rtc) = self.rtc.as_mut() {
                                rtc.write(val, &mut self.time, cc);
                            }
                        }
                        _ => {}
                    }
                }
            }
            MbcState::Mbc5 {
                ram_enable,
                ram_bank,
                ..
            } => {
                if *ram_enable {
                    let idx = self.banked_ram_index(addr, *ram_bank as usize);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }
            MbcState::HuC1 {
                ram_bank, ir_mode, ..
            } => {
                if !*ir_mode {
                    let idx = self.banked_ram_index(addr, (*ram_bank & 0x03) as usize);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
            }
            MbcState::HuC3 {
                ram_bank, ramflag, ..
            } => match *ramflag {
                0x0A => {
                    let idx = self.banked_ram_index(addr, (*ram_bank & 0x03) as usize);
                    if let Some(b) = self.ram.get_mut(idx) {
                        *b = val;
                    }
                }
                0x0B..=0x0D => {
                    let flag = *ramflag;
                    if let Some(chip) = self.huc3.as_mut() {
                        chip.write(flag, val, &mut self.time, cc);
                    }
                }
                _ => {}
            },
        }
    }

    fn has_battery(&self) -> bool {
        matches!(
            self.cart_type,
            0x03 | 0x06 | 0x09 | 0x0D | 0x0F | 0x10 | 0x13 | 0x1B | 0x1E | 0xFE | 0xFF
        )
    }

    fn has_persistent_clock(&self) -> bool {
        self.rtc.is_some() || self.huc3.is_some()
    }

    /// Apply Game Genie codes (`HHH-HHH-HHH`, semicolon separated, with an
    /// optional compare byte in the 11-digit form). Previously applied codes
    /// are undone first; codes are cleared on ROM reload.
    pub fn set_game_genie(&mut self, codes: &str) {
        self.undo_game_genie();
        for code in codes.split(';').filter(|c| !c.is_empty()) {
            if !self.apply_game_genie(code) {
                warn!("ignoring malformed Game Genie code {code:?}");
            }
        }
    }

    pub fn undo_game_genie(&mut self) {
        for (offset, old) in self.gg_undo.drain(..).rev() {
            if let Some(b) = self.rom.get_mut(offset) {
                *b = old;
            }
        }
    }

    fn apply_game_genie(&mut self, code: &str) -> bool {
        let chars: Vec<char> = code.chars().collect();
        if chars.len() < 7 || chars[3] != '-' {
            return false;
        }
        let hex = |c: char| c.to_digit(16).map(|d| d as u32);
        let Some(digits) = chars
            .iter()
            .filter(|&&c| c != '-')
            .map(|&c| hex(c))
            .collect::<Option<Vec<u32>>>()
        else {
            return false;
        };
        if digits.len() < 6 {
            return false;
        }

        let val = ((digits[0] << 4) | digits[1]) as u8;
        let addr = (digits[2] << 8) | (digits[3] << 4) | digits[4] | ((digits[5] ^ 0xF) << 12);
        let addr = addr as usize & 0xFFFF;
        let cmp = if digits.len() >= 9 {
            let mut cmp = ((digits[6] << 4) | digits[8]) as u8;
            cmp ^= 0xFF;
            cmp = cmp.rotate_right(2);
            cmp ^= 0x45;
            Some(cmp)
        } else {
            None
        };

        for bank in 0..self.pak.rom_banks {
            if !rombank_can_map(addr, bank) {
                continue;
            }
            let offset = bank * 0x4000 + (addr & 0x3FFF);
            let Some(byte) = self.rom.get_mut(offset) else {
                continue;
            };
            if cmp.is_none() || cmp == Some(*byte) {
                self.gg_undo.push((offset, *byte));
                *byte = val;
            }
        }
        true
    }

    /// Poke a Game Shark style RAM cheat (`01VVAAAA`, little-endian address).
    pub fn parse_game_shark(codes: &str) -> Vec<(u16, u8)> {
        let mut out = Vec::new();
        for code in codes.split(';').filter(|c| !c.is_empty()) {
            if code.len() != 8 || !code.starts_with("01") {
                continue;
            }
            let Ok(raw) = u32::from_str_radix(code, 16) else {
                continue;
            };
            let val = (raw >> 16 & 0xFF) as u8;
            let addr = ((raw & 0xFF) << 8 | (raw >> 8 & 0xFF)) as u16;
            out.push((addr, val));
        }
        out
    }

    /// Write battery-backed RAM (and the clock base) to disk.
    pub fn save_savedata(&mut self, cc: u64) -> io::Result<()> {
        let Some(base) = self.save_base.clone() else {
            return Ok(());
        };
        if self.has_battery() && !self.ram.is_empty() {
            fs::write(base.with_extension("sav"), &self.ram)?;
        }
        if self.has_battery() && self.has_persistent_clock() {
            fs::write(base.with_extension("rtc"), self.serialize_clock(cc))?;
        }
        Ok(())
    }

    /// Read battery-backed RAM (and the clock base) back from disk, if
    /// present.
    pub fn load_savedata(&mut self, cc: u64) {
        let Some(base) = self.save_base.clone() else {
            return;
        };
        if self.has_battery()
            && let Ok(bytes) = fs::read(base.with_extension("sav"))
        {
            for (d, s) in self.ram.iter_mut().zip(bytes.iter()) {
                *d = *s;
            }
        }
        if self.has_battery()
            && self.has_persistent_clock()
            && let Ok(bytes) = fs::read(base.with_extension("rtc"))
            && !self.load_clock(&bytes, cc)
        {
            warn!("failed to parse clock data companion file");
        }
    }

    fn serialize_clock(&mut self, cc: u64) -> Vec<u8> {
        let seconds = self.time.time(cc);
        let mut data = Vec::with_capacity(4 + 1 + 4 + 8 + 1 + 4);
        data.extend_from_slice(RTC_FILE_MAGIC);
        data.push(RTC_FILE_VERSION);
        data.extend_from_slice(&seconds.to_le_bytes());
        data.extend_from_slice(&self.time.wall_anchor_unix().to_le_bytes());
        let (dh, halt_time) = match &self.rtc {
            Some(rtc) => (rtc.data_dh, rtc.halt_time),
            None => (
                self.huc3.as_ref().map(|h| h.halted as u8).unwrap_or(0),
                self.huc3.as_ref().map(|h| h.halt_time).unwrap_or(0),
            ),
        };
        data.push(dh);
        data.extend_from_slice(&halt_time.to_le_bytes());
        data
    }

    fn load_clock(&mut self, data: &[u8], cc: u64) -> bool {
        if data.len() < 22 || &data[..4] != RTC_FILE_MAGIC || data[4] != RTC_FILE_VERSION {
            return false;
        }
        let mut seconds = u32::from_le_bytes(data[5..9].try_into().unwrap_or_default());
        let saved_unix = u64::from_le_bytes(data[9..17].try_into().unwrap_or_default());
        if self.time.mode() == TimeMode::Wall {
            // Time kept passing while the emulator was closed.
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            seconds = seconds.wrapping_add(now.saturating_sub(saved_unix) as u32);
        }
        self.time.set(seconds, cc);
        let dh = data[17];
        let halt_time = u32::from_le_bytes(data[18..22].try_into().unwrap_or_default());
        if let Some(rtc) = self.rtc.as_mut() {
            rtc.data_dh = dh;
            rtc.halt_time = halt_time;
            rtc.latch(&mut self.time, cc);
        }
        if let Some(huc3) = self.huc3.as_mut() {
            huc3.halted = dh != 0;
            huc3.halt_time = halt_time;
        }
        true
    }
}

fn rombank_can_map(addr: usize, bank: usize) -> bool {
    if addr < 0x4000 { bank == 0 } else { true }
}

fn detect_mbc1_multicart(rom: &[u8]) -> bool {
    // The common 8 Mbit multicart wiring can't be identified from the header,
    // so use a conservative heuristic: multicart dumps repeat the header logo
    // at the start of each game's bank group.
    let bank_count = rom.len() / 0x4000;
    if bank_count != 64 {
        return false;
    }

    let logo0 = match rom.get(0x0104..0x0134) {
        Some(s) if !s.iter().all(|&b| b == 0) => s,
        _ => return false,
    };

    for bank in 1..=2 {
        let start = bank * 0x4000 + 0x0104;
        let end = start + 0x30;
        match rom.get(start..end) {
            Some(s) if s == logo0 => {}
            _ => return false,
        }
    }

    true
}

struct Header<'a> {
    data: &'a [u8],
}

impl<'a> Header<'a> {
    fn title(&self) -> String {
        let mut slice = &self.data[0x0134..0x0143];
        if let Some(pos) = slice.iter().position(|&b| b == 0) {
            slice = &slice[..pos];
        }
        String::from_utf8_lossy(slice).trim().to_string()
    }

    fn cart_type(&self) -> u8 {
        self.data[0x0147]
    }

    fn cgb_supported(&self) -> bool {
        self.data[0x0143] & 0x80 != 0
    }

    fn sgb_supported(&self) -> bool {
        self.data[0x0146] == 0x03 && self.data[0x014B] == 0x33
    }

    fn rom_banks(&self) -> Option<usize> {
        let code = self.data[0x0148];
        if code > 8 {
            return None;
        }
        Some(2usize << code)
    }

    fn has_rtc(&self) -> bool {
        matches!(self.cart_type(), 0x0F | 0x10)
    }

    fn ram_size(&self) -> usize {
        // MBC2 carries 512x4-bit internal RAM regardless of the header code.
        if matches!(self.cart_type(), 0x05 | 0x06) {
            return 0x200;
        }

        match self.data[0x0149] {
            0x00 => 0,
            0x01 => 0x800,   // 2KB
            0x02 => 0x2000,  // 8KB
            0x03 => 0x8000,  // 32KB (4 banks)
            0x04 => 0x20000, // 128KB (16 banks)
            0x05 => 0x10000, // 64KB (8 banks)
            _ => 0x2000,
        }
    }

    fn checksum_ok(&self) -> bool {
        let mut x = 0u8;
        for &b in &self.data[0x0134..0x014D] {
            x = x.wrapping_sub(b).wrapping_sub(1);
        }
        x == self.data[0x014D]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn rom_with(cart_type: u8, rom_code: u8, ram_code: u8) -> Vec<u8> {
        let banks = 2usize << rom_code;
        let mut rom = vec![0u8; banks * 0x4000];
        rom[0x0147] = cart_type;
        rom[0x0148] = rom_code;
        rom[0x0149] = ram_code;
        let mut x = 0u8;
        for &b in &rom[0x0134..0x014D] {
            x = x.wrapping_sub(b).wrapping_sub(1);
        }
        rom[0x014D] = x;
        rom
    }

    #[test]
    fn size_mismatch_is_a_load_failure() {
        let mut rom = rom_with(0x00, 1, 0);
        rom.truncate(0x4000);
        assert_eq!(
            Cartridge::load(rom, false).err(),
            Some(LoadError::BadRomSize)
        );
    }

    #[test]
    fn unknown_mapper_is_a_load_failure() {
        let rom = rom_with(0x42, 0, 0);
        assert_eq!(
            Cartridge::load(rom, false).err(),
            Some(LoadError::UnsupportedMbc(0x42))
        );
    }

    #[test]
    fn mbc5_nine_bit_bank_select() {
        let mut rom = rom_with(0x19, 8, 0);
        for bank in 0..512usize {
            rom[bank * 0x4000 + 0x2000] = (bank & 0xFF) as u8;
        }
        let mut cart = Cartridge::load(rom, false).unwrap();
        cart.write(0x2000, 0x34, 0);
        cart.write(0x3000, 0x01, 0);
        assert_eq!(cart.cur_rom_bank(), 0x134);
        assert_eq!(cart.read(0x6000), 0x34);
        // MBC5 maps bank 0 into the switchable window when selected.
        cart.write(0x2000, 0x00, 0);
        cart.write(0x3000, 0x00, 0);
        assert_eq!(cart.cur_rom_bank(), 0);
    }

    #[test]
    fn bank_always_within_rom_after_arbitrary_writes() {
        let rom = rom_with(0x01, 2, 0); // 8 banks
        let mut cart = Cartridge::load(rom, false).unwrap();
        for val in 0..=0xFF {
            cart.write(0x2000, val, 0);
            cart.write(0x4000, val >> 5, 0);
            let bank = cart.cur_rom_bank() as usize;
            assert!(bank < cart.pak_info().rom_banks);
        }
    }

    #[test]
    fn game_genie_patches_and_undoes() {
        let mut rom = rom_with(0x00, 1, 0);
        rom[0x4123] = 0x55;
        let original = rom[0x4123];
        let mut cart = Cartridge::load(rom, false).unwrap();

        // Patch address 0x4123 (digit F=0xB -> (0xB^0xF)<<12 = 0x4000) to 0xAA.
        cart.set_game_genie("AA1-23B");
        assert_eq!(cart.read(0x4123), 0xAA);

        cart.set_game_genie("");
        assert_eq!(cart.read(0x4123), original);
    }

    #[test]
    fn game_shark_codes_parse() {
        let pokes = Cartridge::parse_game_shark("01FF56C0;019922D0;bogus");
        assert_eq!(pokes, vec![(0xC056, 0xFF), (0xD022, 0x99)]);
    }

    #[test]
    fn huc1_ir_mode_overrides_ram_window() {
        let rom = rom_with(0xFF, 0, 0x02);
        let mut cart = Cartridge::load(rom, false).unwrap();
        cart.write(0x0000, 0x0A, 0);
        cart.write(0xA000, 0x12, 0);
        assert_eq!(cart.read(0xA000), 0x12);
        cart.write(0x0000, 0x0E, 0); // IR mode
        assert_eq!(cart.read(0xA000), 0xC0);
        cart.write(0x0000, 0x0A, 0);
        assert_eq!(cart.read(0xA000), 0x12);
    }
}

impl Cartridge {
    pub fn save_state(&self, s: &mut crate::state::SaveState) {
        s.mem.sram = self.ram.clone();
        s.mem.time_seconds = self.time.seconds;
        s.mem.time_last_cc = self.time.last_cc;
        let m = &mut s.mem;
        match &self.mbc_state {
            MbcState::NoMbc => {
                m.rom_bank = 1;
                m.ram_bank = 0;
                m.ram_enable = true;
                m.mbc_mode = 0;
                m.mbc_latch = false;
            }
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ram_enable,
                ..
            } => {
                m.rom_bank = *rom_bank as u16;
                m.ram_bank = *ram_bank;
                m.ram_enable = *ram_enable;
                m.mbc_mode = *mode;
                m.mbc_latch = false;
            }
            MbcState::Mbc2 {
                rom_bank,
                ram_enable,
            } => {
                m.rom_bank = *rom_bank as u16;
                m.ram_bank = 0;
                m.ram_enable = *ram_enable;
                m.mbc_mode = 0;
                m.mbc_latch = false;
            }
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                latch_pending,
            } => {
                m.rom_bank = *rom_bank as u16;
                m.ram_bank = *ram_bank;
                m.ram_enable = *ram_enable;
                m.mbc_mode = 0;
                m.mbc_latch = *latch_pending;
            }
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => {
                m.rom_bank = *rom_bank;
                m.ram_bank = *ram_bank;
                m.ram_enable = *ram_enable;
                m.mbc_mode = 0;
                m.mbc_latch = false;
            }
            MbcState::HuC1 {
                rom_bank,
                ram_bank,
                ram_enable,
                ir_mode,
            } => {
                m.rom_bank = *rom_bank as u16;
                m.ram_bank = *ram_bank;
                m.ram_enable = *ram_enable;
                m.mbc_mode = *ir_mode as u8;
                m.mbc_latch = false;
            }
            MbcState::HuC3 {
                rom_bank,
                ram_bank,
                ramflag,
            } => {
                m.rom_bank = *rom_bank as u16;
                m.ram_bank = *ram_bank;
                m.ram_enable = false;
                m.mbc_mode = *ramflag;
                m.mbc_latch = false;
            }
        }
        if let Some(rtc) = &self.rtc {
            rtc.save_state(s);
        }
        if let Some(huc3) = &self.huc3 {
            huc3.save_state(s);
        }
    }

    pub fn load_state(&mut self, s: &crate::state::SaveState) {
        for (d, v) in self.ram.iter_mut().zip(s.mem.sram.iter()) {
            *d = *v;
        }
        self.time.seconds = s.mem.time_seconds;
        self.time.last_cc = s.mem.time_last_cc;
        let m = &s.mem;
        match &mut self.mbc_state {
            MbcState::NoMbc => {}
            MbcState::Mbc1 {
                rom_bank,
                ram_bank,
                mode,
                ram_enable,
                ..
            } => {
                *rom_bank = m.rom_bank as u8 & 0x1F;
                *ram_bank = m.ram_bank & 0x03;
                *mode = m.mbc_mode & 0x01;
                *ram_enable = m.ram_enable;
            }
            MbcState::Mbc2 {
                rom_bank,
                ram_enable,
            } => {
                *rom_bank = m.rom_bank as u8 & 0x0F;
                *ram_enable = m.ram_enable;
            }
            MbcState::Mbc3 {
                rom_bank,
                ram_bank,
                ram_enable,
                latch_pending,
            } => {
                *rom_bank = m.rom_bank as u8 & 0x7F;
                *ram_bank = m.ram_bank;
                *ram_enable = m.ram_enable;
                *latch_pending = m.mbc_latch;
            }
            MbcState::Mbc5 {
                rom_bank,
                ram_bank,
                ram_enable,
            } => {
                *rom_bank = m.rom_bank & 0x1FF;
                *ram_bank = m.ram_bank & 0x0F;
                *ram_enable = m.ram_enable;
            }
            MbcState::HuC1 {
                rom_bank,
                ram_bank,
                ram_enable,
                ir_mode,
            } => {
                *rom_bank = m.rom_bank as u8 & 0x3F;
                *ram_bank = m.ram_bank & 0x03;
                *ram_enable = m.ram_enable;
                *ir_mode = m.mbc_mode != 0;
            }
            MbcState::HuC3 {
                rom_bank,
                ram_bank,
                ramflag,
            } => {
                *rom_bank = m.rom_bank as u8 & 0x7F;
                *ram_bank = m.ram_bank & 0x03;
                *ramflag = m.mbc_mode & 0x0F;
            }
        }
        if let (MbcState::Mbc3 { ram_enable, ram_bank, .. }, Some(rtc)) =
            (&self.mbc_state, self.rtc.as_mut())
        {
            rtc.load_state(s);
            rtc.select(*ram_enable, *ram_bank);
        }
        if let Some(huc3) = self.huc3.as_mut() {
            huc3.load_state(s);
        }
    }
}
