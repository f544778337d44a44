use crate::{
    apu::Apu,
    cartridge::Cartridge,
    events::{EventId, EventTimes},
    joypad::Joypad,
    ppu::Ppu,
    serial::Serial,
    sgb::Sgb,
    timer::Timer,
};

const WRAM_BANK_SIZE: usize = 0x1000;

/// Default cartridge-bus pull-up time in dot cycles: how long the last
/// driven value stays readable on a floating bus before it decays to 0xFF.
/// A digital approximation of an analog artifact; the configured value is
/// authoritative.
pub const DEFAULT_CART_BUS_PULL_UP: u64 = 4096;

/// Instrumentation hook for data reads and writes: `(address, cycle)`.
pub type MemoryCallback = Box<dyn FnMut(u16, u64) + Send>;
/// Instrumentation hook for instruction fetches:
/// `(address, cycle, is_opcode)` — opcode fetches are distinguished from
/// operand fetches.
pub type ExecCallback = Box<dyn FnMut(u16, u64, bool) + Send>;

/// Transfer mode for CGB DMA operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DmaMode {
    /// General DMA (immediate)
    Gdma,
    /// HBlank DMA
    Hdma,
}

#[derive(Debug)]
struct HdmaState {
    /// 16-bit source pointer (upper 12 bits writable)
    src: u16,
    /// Destination in VRAM (0x8000 | (dst & 0x1FF0))
    dst: u16,
    /// Remaining 0x10-byte blocks (0-7F means 1-128 blocks)
    blocks: u8,
    /// Current DMA mode
    mode: DmaMode,
    /// HDMA active flag
    active: bool,
    /// Whether the previous transfer was explicitly cancelled (FF55 <- 0)
    cancelled: bool,
}

pub struct Mmu {
    /// Global dot-cycle counter; the time axis every subsystem shares.
    pub cycles: u64,
    pub events: EventTimes,

    pub wram: [[u8; WRAM_BANK_SIZE]; 8],
    pub wram_bank: usize,
    pub hram: [u8; 0x7F],
    pub cart: Option<Cartridge>,
    pub bios: Option<Vec<u8>>,
    pub bios_mapped: bool,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub serial: Serial,
    pub ppu: Ppu,
    pub apu: Apu,
    pub timer: Timer,
    pub joypad: Joypad,
    pub sgb: Option<Sgb>,
    hdma: HdmaState,
    pub key1: u8,
    pub rp: u8,
    pub(crate) dma_cycles: u16,
    pub(crate) dma_source: u16,
    pub(crate) pending_dma: Option<u16>,
    pub(crate) pending_delay: u16,
    /// Remaining stall cycles after a General DMA
    gdma_cycles: u32,
    cgb_mode: bool,

    /// Last value driven onto the shared cartridge bus and when; reads from
    /// disabled external RAM see it until the pull-up time expires.
    pub(crate) cart_bus: u8,
    pub(crate) cart_bus_update: u64,
    cart_bus_pull_up: u64,

    /// RAM pokes applied once per frame.
    game_shark: Vec<(u16, u8)>,

    read_callback: Option<MemoryCallback>,
    write_callback: Option<MemoryCallback>,
    exec_callback: Option<ExecCallback>,

    /// Program counter observed at the CPU's last memory operation, for
    /// attributing accesses in diagnostics.
    pub last_cpu_pc: Option<u16>,
}

impl Mmu {
    pub fn new_with_mode(cgb: bool) -> Self {
        Self {
            cycles: 0,
            events: EventTimes::new(),
            wram: [[0; WRAM_BANK_SIZE]; 8],
            wram_bank: 1,
            hram: [0; 0x7F],
            cart: None,
            bios: None,
            bios_mapped: false,
            if_reg: 0xE1,
            ie_reg: 0,
            serial: Serial::new(cgb),
            ppu: Ppu::new_with_mode(cgb),
            apu: Apu::new_with_mode(cgb),
            timer: Timer::new(),
            joypad: Joypad::new(),
            sgb: None,
            hdma: HdmaState {
                src: 0,
                dst: Self::sanitize_vram_dma_dest(0),
                blocks: 0,
                mode: DmaMode::Gdma,
                active: false,
                cancelled: false,
            },
            key1: if cgb { 0x7E } else { 0 },
            rp: 0,
            dma_cycles: 0,
            dma_source: 0,
            pending_dma: None,
            pending_delay: 0,
            gdma_cycles: 0,
            cgb_mode: cgb,
            cart_bus: 0xFF,
            cart_bus_update: 0,
            cart_bus_pull_up: DEFAULT_CART_BUS_PULL_UP,
            game_shark: Vec::new(),
            read_callback: None,
            write_callback: None,
            exec_callback: None,
            last_cpu_pc: None,
        }
    }

    pub fn new() -> Self {
        Self::new_with_mode(false)
    }

    pub fn is_cgb(&self) -> bool {
        self.cgb_mode
    }

    pub fn double_speed(&self) -> bool {
        self.key1 & 0x80 != 0
    }

    pub fn load_cart(&mut self, cart: Cartridge) {
        let is_dmg_cart = !cart.cgb;
        self.cart = Some(cart);
        if self.cgb_mode && is_dmg_cart {
            self.ppu.apply_dmg_compatibility_palettes();
        }
    }

    pub fn load_bios(&mut self, data: Vec<u8>) {
        self.bios = Some(data);
        self.bios_mapped = true;
    }

    pub fn enable_sgb(&mut self) {
        self.sgb = Some(Sgb::new());
        self.ppu.set_record_shades(true);
    }

    pub fn set_cart_bus_pull_up_time(&mut self, cycles: u64) {
        self.cart_bus_pull_up = cycles;
    }

    pub fn set_game_shark(&mut self, pokes: Vec<(u16, u8)>) {
        self.game_shark = pokes;
    }

    pub fn set_read_callback(&mut self, callback: Option<MemoryCallback>) {
        self.read_callback = callback;
    }

    pub fn set_write_callback(&mut self, callback: Option<MemoryCallback>) {
        self.write_callback = callback;
    }

    pub fn set_exec_callback(&mut self, callback: Option<ExecCallback>) {
        self.exec_callback = callback;
    }

    #[inline]
    fn drive_cart_bus(&mut self, val: u8) {
        self.cart_bus = val;
        self.cart_bus_update = self.cycles;
    }

    /// Whether the bus capacitance still holds the last driven value.
    fn cart_bus_held(&self) -> bool {
        let window = self.cart_bus_pull_up << (self.double_speed() as u32);
        self.cycles < self.cart_bus_update + window
    }

    fn bios_read(&self, addr: u16) -> Option<u8> {
        if !self.bios_mapped {
            return None;
        }
        let bios = self.bios.as_ref()?;
        // The cartridge header window stays visible under the overlay.
        if (0x100..0x200).contains(&addr) {
            return None;
        }
        bios.get(addr as usize).copied()
    }

    fn read_byte_inner(&mut self, addr: u16, allow_dma: bool) -> u8 {
        if !allow_dma && self.dma_cycles > 0 {
            match addr {
                // ROM, WRAM/Echo and I/O/HRAM stay accessible while OAM DMA
                // monopolizes the VRAM/OAM bus.
                0x0000..=0x7FFF | 0xC000..=0xFDFF | 0xFF00..=0xFFFF => {}
                _ => return 0xFF,
            }
        }
        match addr {
            0x0000..=0x7FFF => {
                let val = match self.bios_read(addr) {
                    Some(b) => b,
                    None => self.cart.as_ref().map(|c| c.read(addr)).unwrap_or(0xFF),
                };
                self.drive_cart_bus(val);
                val
            }
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize]
                } else {
                    0xFF
                }
            }
            0xA000..=0xBFFF => {
                let Some(cart) = self.cart.as_ref() else {
                    return 0xFF;
                };
                if cart.ram_disabled() {
                    // Nothing drives the bus: the previous value lingers
                    // until the pull-up wins.
                    if self.cart_bus_held() { self.cart_bus } else { 0xFF }
                } else if cart.is_mbc2() {
                    // Only the low nibble is driven; the high nibble floats.
                    let nibble = cart.read(addr) & 0x0F;
                    let high = if self.cart_bus_held() {
                        self.cart_bus & 0xF0
                    } else {
                        0xF0
                    };
                    nibble | high
                } else {
                    let val = cart.read(addr);
                    self.drive_cart_bus(val);
                    val
                }
            }
            0xC000..=0xCFFF => self.dmg_bus_read(self.wram[0][(addr - 0xC000) as usize]),
            0xD000..=0xDFFF => self.dmg_bus_read(self.wram[self.wram_bank][(addr - 0xD000) as usize]),
            0xE000..=0xEFFF => self.dmg_bus_read(self.wram[0][(addr - 0xE000) as usize]),
            0xF000..=0xFDFF => self.dmg_bus_read(self.wram[self.wram_bank][(addr - 0xF000) as usize]),
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize]
                } else {
                    0xFF
                }
            }
            0xFEA0..=0xFEFF => 0xFF,
            0xFF00 => {
                let sgb_index = self
                    .sgb
                    .as_ref()
                    .filter(|s| s.multiplayer_active())
                    .map(|s| s.joypad_index());
                self.joypad.read(sgb_index)
            }
            0xFF01 | 0xFF02 => self.serial.read(addr),
            0xFF04..=0xFF07 => self.timer.read(addr),
            0xFF0F => self.if_reg,
            0xFF10..=0xFF3F => self.apu.read_reg(addr),
            0xFF40..=0xFF45 | 0xFF47..=0xFF4B | 0xFF68..=0xFF6B => self.ppu.read_reg(addr),
            0xFF46 => self.ppu.dma,
            0xFF51 => {
                if self.cgb_mode {
                    (self.hdma.src >> 8) as u8
                } else {
                    0xFF
                }
            }
            0xFF52 => {
                if self.cgb_mode {
                    (self.hdma.src & 0x00F0) as u8
                } else {
                    0xFF
                }
            }
            0xFF53 => {
                if self.cgb_mode {
                    ((self.hdma.dst & 0x1F00) >> 8) as u8
                } else {
                    0xFF
                }
            }
            0xFF54 => {
                if self.cgb_mode {
                    (self.hdma.dst & 0x00F0) as u8
                } else {
                    0xFF
                }
            }
            0xFF55 => {
                if !self.cgb_mode {
                    0xFF
                } else if self.hdma.active {
                    // Busy flag (bit 7) is cleared while the DMA is running.
                    self.hdma.blocks.saturating_sub(1) & 0x7F
                } else if self.hdma.cancelled {
                    // After cancellation the hardware reports bit 7 set with
                    // the lower bits cleared.
                    0x80
                } else {
                    // 0xFF once HDMA/GDMA completed or nothing is pending.
                    0xFF
                }
            }
            0xFF4D => {
                if self.cgb_mode {
                    (self.key1 & 0x81) | 0x7E
                } else {
                    0xFF
                }
            }
            0xFF56 => {
                if self.cgb_mode {
                    self.rp | 0xC0
                } else {
                    0xFF
                }
            }
            0xFF4F => {
                if self.cgb_mode {
                    self.ppu.vram_bank as u8 | 0xFE
                } else {
                    0xFF
                }
            }
            0xFF70 => {
                if self.cgb_mode {
                    self.wram_bank as u8 | 0xF8
                } else {
                    0xFF
                }
            }
            0xFF76 | 0xFF77 => {
                if self.cgb_mode {
                    self.apu.read_pcm(addr)
                } else {
                    0xFF
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize],
            0xFFFF => self.ie_reg,
            _ => 0xFF,
        }
    }

    /// On DMG the work RAM shares the external bus, so reads keep the bus
    /// driven; on CGB it is internal.
    #[inline]
    fn dmg_bus_read(&mut self, val: u8) -> u8 {
        if !self.cgb_mode {
            self.drive_cart_bus(val);
        }
        val
    }

    /// Read with instrumentation and DMA blocking; the normal CPU data path.
    pub fn read_byte(&mut self, addr: u16) -> u8 {
        if self.read_callback.is_some() {
            let cc = self.cycles;
            if let Some(cb) = self.read_callback.as_mut() {
                cb(addr, cc);
            }
        }
        self.read_byte_inner(addr, false)
    }

    /// Instruction fetch path: fires the exec hook instead of the read hook,
    /// flagging whether this is the opcode byte or an operand.
    pub fn fetch_byte(&mut self, addr: u16, opcode: bool) -> u8 {
        if self.exec_callback.is_some() {
            let cc = self.cycles;
            if let Some(cb) = self.exec_callback.as_mut() {
                cb(addr, cc, opcode);
            }
        }
        self.read_byte_inner(addr, false)
    }

    /// Raw access for tooling: no cycles are charged, but register side
    /// effects still apply.
    pub fn external_read(&mut self, addr: u16) -> u8 {
        self.read_byte_inner(addr, true)
    }

    fn dma_read_byte(&mut self, addr: u16) -> u8 {
        let addr = if !self.cgb_mode && (0xFE00..=0xFF9F).contains(&addr) {
            addr.wrapping_sub(0x2000)
        } else {
            addr
        };

        self.read_byte_inner(addr, true)
    }

    pub fn write_byte(&mut self, addr: u16, val: u8) {
        if self.write_callback.is_some() {
            let cc = self.cycles;
            if let Some(cb) = self.write_callback.as_mut() {
                cb(addr, cc);
            }
        }
        if self.dma_cycles > 0 {
            match addr {
                0x0000..=0x7FFF | 0xC000..=0xFDFF | 0xFF00..=0xFFFF => {}
                _ => return,
            }
        }
        self.write_byte_inner(addr, val);
    }

    /// Raw write for tooling; bypasses DMA blocking and instrumentation.
    pub fn external_write(&mut self, addr: u16, val: u8) {
        self.write_byte_inner(addr, val);
    }

    fn write_byte_inner(&mut self, addr: u16, val: u8) {
        match addr {
            0x8000..=0x9FFF => {
                if self.ppu.vram_accessible() {
                    self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize] = val;
                }
            }
            0x0000..=0x7FFF | 0xA000..=0xBFFF => {
                // The write drives the shared cartridge bus whether or not
                // anything latches it.
                self.drive_cart_bus(val);
                let cc = self.cycles;
                if let Some(cart) = self.cart.as_mut() {
                    cart.write(addr, val, cc);
                }
            }
            0xC000..=0xCFFF => self.wram[0][(addr - 0xC000) as usize] = val,
            0xD000..=0xDFFF => self.wram[self.wram_bank][(addr - 0xD000) as usize] = val,
            0xE000..=0xEFFF => self.wram[0][(addr - 0xE000) as usize] = val,
            0xF000..=0xFDFF => self.wram[self.wram_bank][(addr - 0xF000) as usize] = val,
            0xFE00..=0xFE9F => {
                if self.ppu.oam_accessible() {
                    self.ppu.oam[(addr - 0xFE00) as usize] = val;
                }
            }
            0xFEA0..=0xFEFF => {}
            0xFF00 => {
                self.joypad.write(val);
                if let Some(sgb) = self.sgb.as_mut() {
                    sgb.on_joypad(val & 0x30);
                }
            }
            0xFF01 | 0xFF02 => {
                self.serial.write(addr, val);
                if addr == 0xFF02 {
                    self.refresh_serial_event();
                }
            }
            0xFF04 => {
                self.reset_div();
                self.refresh_timer_event();
            }
            0xFF05..=0xFF07 => {
                self.timer.write(addr, val, &mut self.if_reg);
                self.refresh_timer_event();
            }
            0xFF0F => self.if_reg = (val & 0x1F) | (self.if_reg & 0xE0),
            0xFF10..=0xFF3F => self.apu.write_reg(addr, val),
            0xFF40 => {
                let lcd_was_on = self.ppu.lcd_enabled();
                self.ppu.write_reg(addr, val, &mut self.if_reg);
                if lcd_was_on && !self.ppu.lcd_enabled() {
                    self.complete_active_hdma();
                }
            }
            0xFF41..=0xFF45 | 0xFF47..=0xFF4B | 0xFF68..=0xFF6B => {
                self.ppu.write_reg(addr, val, &mut self.if_reg)
            }
            0xFF51 => {
                if self.cgb_mode && !self.hdma.active {
                    self.hdma.src = (val as u16) << 8 | (self.hdma.src & 0x00FF);
                }
            }
            0xFF52 => {
                if self.cgb_mode && !self.hdma.active {
                    self.hdma.src = (self.hdma.src & 0xFF00) | (val & 0xF0) as u16;
                }
            }
            0xFF53 => {
                if self.cgb_mode && !self.hdma.active {
                    let vram_hi = (val & 0x1F) as u16;
                    let raw = (vram_hi << 8) | (self.hdma.dst & 0x00F0);
                    self.hdma.dst = Self::sanitize_vram_dma_dest(raw);
                }
            }
            0xFF54 => {
                if self.cgb_mode && !self.hdma.active {
                    let raw = (self.hdma.dst & 0x1F00) | (val as u16 & 0x00F0);
                    self.hdma.dst = Self::sanitize_vram_dma_dest(raw);
                }
            }
            0xFF55 => {
                if !self.cgb_mode {
                    return;
                }
                self.hdma.dst = Self::sanitize_vram_dma_dest(self.hdma.dst);
                let requested_blocks = (val & 0x7F) + 1;
                if self.hdma.active && (val & 0x80) == 0 {
                    // Abort ongoing HDMA, keeping the reported block count.
                    self.hdma.active = false;
                    self.hdma.blocks = 0;
                    self.hdma.cancelled = true;
                } else if val & 0x80 == 0 {
                    self.start_gdma(requested_blocks);
                } else {
                    self.hdma.mode = DmaMode::Hdma;
                    self.hdma.blocks = requested_blocks;
                    self.hdma.active = true;
                    self.hdma.cancelled = false;
                    if !self.ppu.lcd_enabled() || self.ppu.in_hblank() {
                        self.hdma_hblank_transfer();
                    }
                }
            }
            0xFF4D => {
                if self.cgb_mode {
                    self.key1 = (self.key1 & 0x80) | (val & 0x01);
                }
            }
            0xFF56 => {
                if self.cgb_mode {
                    self.rp = val & 0xC1;
                }
            }
            0xFF4F => {
                if self.cgb_mode {
                    self.ppu.vram_bank = (val & 0x01) as usize;
                }
            }
            0xFF46 => {
                self.ppu.dma = val;
                let src = (val as u16) << 8;
                self.pending_dma = Some(src);
                // DMA starts after two M-cycles. `pending_delay` is tracked
                // in dots; in double-speed mode an M-cycle is 2 dots.
                self.pending_delay = if self.double_speed() { 4 } else { 8 };
                let duration = if self.double_speed() { 320 } else { 640 };
                self.events.set(
                    EventId::OamDma,
                    self.cycles + self.pending_delay as u64 + duration,
                );
            }
            0xFF50 => self.bios_mapped = false,
            0xFF70 => {
                if self.cgb_mode {
                    let bank = (val & 0x07) as usize;
                    self.wram_bank = if bank == 0 { 1 } else { bank };
                }
            }
            0xFF80..=0xFFFE => self.hram[(addr - 0xFF80) as usize] = val,
            0xFFFF => self.ie_reg = val,
            _ => {}
        }
    }

    /// Write to VRAM bypassing mode checks (used by DMA transfers)
    fn vram_dma_write(&mut self, addr: u16, val: u8) {
        self.ppu.vram[self.ppu.vram_bank][(addr - 0x8000) as usize] = val;
    }

    pub fn take_serial(&mut self) -> Vec<u8> {
        self.serial.take_output()
    }

    /// Advance the ongoing OAM DMA transfer if active.
    pub fn dma_step(&mut self, cycles: u16) {
        for _ in 0..cycles {
            if self.pending_delay > 0 {
                self.pending_delay -= 1;
                if self.pending_delay == 0
                    && let Some(src) = self.pending_dma.take()
                {
                    self.dma_source = src;
                    // 160 M-cycles: 640 dots at normal speed, 320 doubled.
                    self.dma_cycles = if self.double_speed() { 320 } else { 640 };
                }
            }

            if self.dma_cycles == 0 {
                continue;
            }

            // One byte per M-cycle: every 4 dots normally, every 2 doubled.
            let per_byte = if self.double_speed() { 2 } else { 4 };
            let initial = if self.double_speed() { 320 } else { 640 };
            let elapsed = initial - self.dma_cycles;
            if elapsed % per_byte == 0 {
                let idx: u16 = elapsed / per_byte;
                if idx < 0xA0 {
                    // DMA engine accesses are not CPU accesses; drop the
                    // attribution.
                    self.last_cpu_pc = None;
                    let byte = self.dma_read_byte(self.dma_source.wrapping_add(idx));
                    self.ppu.oam[idx as usize] = byte;
                }
            }

            self.dma_cycles -= 1;
        }
    }

    /// Return true if a DMA transfer is in progress.
    pub fn dma_active(&self) -> bool {
        self.dma_cycles > 0 || self.pending_delay > 0
    }

    /// Return true if a General or HBlank DMA stall is in progress.
    pub fn gdma_active(&self) -> bool {
        self.gdma_cycles > 0
    }

    /// Decrement the GDMA stall counter by the given number of m-cycles.
    pub fn gdma_step(&mut self, cycles: u16) {
        if self.gdma_cycles > 0 {
            self.gdma_cycles = self.gdma_cycles.saturating_sub(cycles as u32);
        }
    }

    #[inline]
    fn sanitize_vram_dma_dest(addr: u16) -> u16 {
        0x8000 | (addr & 0x1FF0)
    }

    /// Perform a General DMA transfer immediately, consuming CPU cycles.
    fn start_gdma(&mut self, blocks: u8) {
        let total_bytes = blocks as usize * 0x10;
        let mut src = self.hdma.src;
        let mut dst = Self::sanitize_vram_dma_dest(self.hdma.dst);

        self.last_cpu_pc = None;
        for _ in 0..total_bytes {
            let byte = self.dma_read_byte(src);
            self.vram_dma_write(dst, byte);
            src = src.wrapping_add(1);
            dst = 0x8000 | ((dst.wrapping_add(1)) & 0x1FFF);
        }

        self.hdma.src = src;
        self.hdma.dst = Self::sanitize_vram_dma_dest(dst);
        self.hdma.active = false;
        self.hdma.blocks = 0;
        self.hdma.cancelled = false;
        self.gdma_cycles = blocks as u32 * self.hdma_block_cycle_cost();
    }

    /// Execute a single 0x10-byte HDMA burst during H-Blank.
    pub fn hdma_hblank_transfer(&mut self) {
        if !(self.hdma.active && self.hdma.mode == DmaMode::Hdma) {
            return;
        }
        self.perform_hdma_block();
    }

    fn perform_hdma_block(&mut self) {
        self.hdma.dst = Self::sanitize_vram_dma_dest(self.hdma.dst);
        self.last_cpu_pc = None;
        for _ in 0..0x10 {
            let byte = self.dma_read_byte(self.hdma.src);
            self.vram_dma_write(self.hdma.dst, byte);
            self.hdma.src = self.hdma.src.wrapping_add(1);
            self.hdma.dst = 0x8000 | ((self.hdma.dst.wrapping_add(1)) & 0x1FFF);
        }

        self.hdma.blocks = self.hdma.blocks.saturating_sub(1);
        if self.hdma.blocks == 0 {
            self.hdma.active = false;
            self.hdma.cancelled = false;
        }

        self.hdma.dst = Self::sanitize_vram_dma_dest(self.hdma.dst);
        self.gdma_cycles += self.hdma_block_cycle_cost();
    }

    fn complete_active_hdma(&mut self) {
        while self.hdma.active && self.hdma.mode == DmaMode::Hdma {
            self.perform_hdma_block();
        }
    }

    fn hdma_block_cycle_cost(&self) -> u32 {
        if self.double_speed() { 16 } else { 8 }
    }

    pub fn reset_div(&mut self) {
        self.timer.reset_div(&mut self.if_reg);
    }

    /// Convert CPU-clock ticks to dots (halved in double-speed mode, where
    /// the dot clock runs at half the CPU rate).
    fn cpu_ticks_to_dots(&self, ticks: u64) -> u64 {
        if self.double_speed() { ticks / 2 } else { ticks }
    }

    /// Re-arm the predicted timer interrupt deadline.
    pub fn refresh_timer_event(&mut self) {
        match self.timer.cycles_until_irq() {
            Some(ticks) => {
                let dots = self.cpu_ticks_to_dots(ticks).max(1);
                self.events.set(EventId::TimerIrq, self.cycles + dots);
            }
            None => self.events.disable(EventId::TimerIrq),
        }
    }

    /// Re-arm the predicted serial completion deadline.
    pub fn refresh_serial_event(&mut self) {
        match self.serial.ticks_until_done(self.double_speed()) {
            Some(ticks) => {
                let dots = self.cpu_ticks_to_dots(ticks).max(1);
                self.events.set(EventId::Serial, self.cycles + dots);
            }
            None => self.events.disable(EventId::Serial),
        }
    }

    /// Service whatever deadline just fired. Side effects themselves happen
    /// in the lockstep tick; this re-arms or clears the bookkeeping.
    pub fn service_event(&mut self, id: EventId) {
        match id {
            EventId::TimerIrq => self.refresh_timer_event(),
            EventId::Serial => self.refresh_serial_event(),
            EventId::OamDma => {
                if self.dma_active() {
                    // Still running (the deadline was an estimate); push the
                    // deadline out to the remaining transfer length.
                    self.events.set(
                        EventId::OamDma,
                        self.cycles + self.pending_delay as u64 + self.dma_cycles as u64 + 1,
                    );
                } else {
                    self.events.disable(EventId::OamDma);
                }
            }
            EventId::Blit | EventId::End => {}
        }
    }

    /// Advance every subsystem in lockstep by `m_cycles` machine cycles.
    /// All cycle-charged side effects happen here, in strict cycle order.
    pub fn tick(&mut self, m_cycles: u32) {
        let double = self.double_speed();
        let dots = if double {
            2 * m_cycles as u16
        } else {
            4 * m_cycles as u16
        };
        // The CPU clock always counts 4 ticks per M-cycle.
        let cpu_cycles = 4 * m_cycles as u16;

        self.cycles += dots as u64;

        let prev_div = self.timer.div;
        self.timer.step(cpu_cycles, &mut self.if_reg);
        let curr_div = self.timer.div;

        self.apu.step(dots);
        self.serial
            .step(prev_div, curr_div, double, &mut self.if_reg);

        let ev = self.ppu.step(dots, &mut self.if_reg);
        if ev.hblank {
            self.hdma_hblank_transfer();
        }
        if ev.frame_done {
            self.on_frame_boundary();
        }
        self.dma_step(dots);
    }

    /// Frame boundary work: latch input, apply frame-based cheats, notify
    /// the SGB, and flag the blit event for the run loop.
    fn on_frame_boundary(&mut self) {
        self.joypad.latch(&mut self.if_reg);
        for i in 0..self.game_shark.len() {
            let (addr, val) = self.game_shark[i];
            self.write_byte_inner(addr, val);
        }
        if let Some(sgb) = self.sgb.as_mut() {
            sgb.on_frame(&self.ppu.shade_fb);
        }
        self.events.set(EventId::Blit, self.cycles);
    }

    /// Rebase the cycle counter and every stored absolute time by `offset`
    /// as one transactional update.
    pub fn rebase_cycles(&mut self, offset: u64) {
        let old = self.cycles;
        self.cycles -= offset;
        self.events.rebase(offset);
        self.cart_bus_update = self.cart_bus_update.saturating_sub(offset);
        if let Some(cart) = self.cart.as_mut() {
            cart.reset_cc(old, old - offset);
        }
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn save_state(&self, s: &mut crate::state::SaveState) {
        s.cpu.cc = self.cycles;

        let mut wram = Vec::with_capacity(WRAM_BANK_SIZE * 8);
        for bank in &self.wram {
            wram.extend_from_slice(bank);
        }
        s.mem.wram = wram;
        s.mem.hram = self.hram.to_vec();
        s.mem.wram_bank = self.wram_bank as u8;
        s.mem.if_reg = self.if_reg;
        s.mem.ie_reg = self.ie_reg;
        s.mem.key1 = self.key1;
        s.mem.rp = self.rp;
        s.mem.bios_mapped = self.bios_mapped;
        s.mem.joyp = self.joypad.select_bits();

        s.mem.dma_cycles = self.dma_cycles;
        s.mem.dma_source = self.dma_source;
        s.mem.pending_dma = self.pending_dma.map(u32::from).unwrap_or(u32::MAX);
        s.mem.pending_delay = self.pending_delay;
        s.mem.gdma_cycles = self.gdma_cycles;
        s.mem.hdma_src = self.hdma.src;
        s.mem.hdma_dst = self.hdma.dst;
        s.mem.hdma_blocks = self.hdma.blocks;
        s.mem.hdma_mode = match self.hdma.mode {
            DmaMode::Gdma => 0,
            DmaMode::Hdma => 1,
        };
        s.mem.hdma_active = self.hdma.active;
        s.mem.hdma_cancelled = self.hdma.cancelled;

        s.mem.cart_bus = self.cart_bus;
        s.mem.cart_bus_update = self.cart_bus_update;

        self.timer.save_state(s);
        self.serial.save_state(s);
        self.ppu.save_state(s);
        self.apu.save_state(s);
        if let Some(cart) = &self.cart {
            cart.save_state(s);
        }
        if let Some(sgb) = &self.sgb {
            sgb.save_state(s);
        }
    }

    pub fn load_state(&mut self, s: &crate::state::SaveState) {
        self.cycles = s.cpu.cc;

        for (i, bank) in self.wram.iter_mut().enumerate() {
            let start = i * WRAM_BANK_SIZE;
            for (j, b) in bank.iter_mut().enumerate() {
                *b = s.mem.wram.get(start + j).copied().unwrap_or(0);
            }
        }
        for (d, v) in self.hram.iter_mut().zip(s.mem.hram.iter()) {
            *d = *v;
        }
        self.wram_bank = (s.mem.wram_bank as usize & 0x07).max(1);
        self.if_reg = s.mem.if_reg;
        self.ie_reg = s.mem.ie_reg;
        self.key1 = s.mem.key1;
        self.rp = s.mem.rp;
        self.bios_mapped = s.mem.bios_mapped;
        self.joypad.write(s.mem.joyp);

        self.dma_cycles = s.mem.dma_cycles;
        self.dma_source = s.mem.dma_source;
        self.pending_dma = (s.mem.pending_dma != u32::MAX).then_some(s.mem.pending_dma as u16);
        self.pending_delay = s.mem.pending_delay;
        self.gdma_cycles = s.mem.gdma_cycles;
        self.hdma.src = s.mem.hdma_src;
        self.hdma.dst = Self::sanitize_vram_dma_dest(s.mem.hdma_dst);
        self.hdma.blocks = s.mem.hdma_blocks;
        self.hdma.mode = if s.mem.hdma_mode == 1 {
            DmaMode::Hdma
        } else {
            DmaMode::Gdma
        };
        self.hdma.active = s.mem.hdma_active;
        self.hdma.cancelled = s.mem.hdma_cancelled;

        self.cart_bus = s.mem.cart_bus;
        self.cart_bus_update = s.mem.cart_bus_update;

        self.timer.load_state(s);
        self.serial.load_state(s);
        self.ppu.load_state(s);
        self.apu.load_state(s);
        if let Some(cart) = self.cart.as_mut() {
            cart.load_state(s);
        }
        if let Some(sgb) = self.sgb.as_mut() {
            sgb.load_state(s);
        }

        // Re-arm the scheduler bookkeeping against the restored counters.
        self.events = EventTimes::new();
        self.refresh_timer_event();
        self.refresh_serial_event();
        if self.dma_active() {
            self.events.set(
                EventId::OamDma,
                self.cycles + self.pending_delay as u64 + self.dma_cycles as u64,
            );
        }
    }
}
