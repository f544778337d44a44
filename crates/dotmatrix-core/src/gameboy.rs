//! High-level facade wiring the CPU, bus and peripherals into one machine,
//! with the run-for-N-samples stepping call, state save/load, persistent
//! save data and the introspection surface for tooling.

use std::path::{Path, PathBuf};

use log::info;

use crate::{
    breakpoints::Breakpoint,
    cartridge::{Cartridge, PakInfo},
    cpu::Cpu,
    events::EventId,
    hardware::{LoadError, loadflag, mode_fingerprint},
    joypad::InputSource,
    mmu::{ExecCallback, MemoryCallback, Mmu},
    ppu::{SCREEN_HEIGHT, SCREEN_WIDTH, ScanlineCallback},
    rtc::TimeMode,
    serial::LinkPort,
    state::{self, SaveState},
};

/// Stereo samples produced per emulated video frame.
pub const SAMPLES_PER_FRAME: usize = 35112;
/// `run_for` may overshoot its sample target by up to roughly this many
/// samples (one instruction burst); size audio buffers accordingly.
pub const MAX_SAMPLE_OVERSHOOT: usize = 2064;

/// Suppress audio sample generation (timing is unaffected).
pub const SPEEDUP_NO_SOUND: u32 = 1;

/// Counters are periodically rebased to bound integer growth over long
/// sessions; all pending event times move together.
const REBASE_THRESHOLD: u64 = 0x8000_0000;

pub struct GameBoy {
    cpu: Cpu,
    mmu: Mmu,
    bios: Option<Vec<u8>>,
    loaded: bool,
    loadflags: u32,
    state_no: usize,
    save_dir: Option<PathBuf>,
    time_mode: TimeMode,
    speedup_flags: u32,
}

impl GameBoy {
    pub fn new() -> Self {
        Self {
            cpu: Cpu::new_post_boot(false, false),
            mmu: Mmu::new_with_mode(false),
            bios: None,
            loaded: false,
            loadflags: 0,
            state_no: 1,
            save_dir: None,
            time_mode: TimeMode::Wall,
            speedup_flags: 0,
        }
    }

    fn implicit_save(&self) -> bool {
        self.loadflags & loadflag::READONLY_SAV == 0
    }

    fn mode_byte(&self) -> u8 {
        mode_fingerprint(self.loadflags)
    }

    /// Load a ROM image. Replacing a loaded ROM flushes its battery save
    /// first (unless loaded read-only). Game Genie codes do not survive the
    /// reload.
    pub fn load(&mut self, rom: Vec<u8>, flags: u32) -> Result<(), LoadError> {
        if self.loaded && self.implicit_save() {
            self.save_savedata();
        }

        let mut cart = Cartridge::load(rom, flags & loadflag::MULTICART_COMPAT != 0)?;
        let cgb = flags & loadflag::CGB_MODE != 0 || cart.cgb;
        let sgb = !cgb && (flags & loadflag::SGB_MODE != 0 || cart.sgb);

        // Record the mode actually selected so save states carry the right
        // fingerprint even when the header, not a flag, decided it.
        let mut effective = flags;
        if cgb {
            effective |= loadflag::CGB_MODE;
        }
        if sgb {
            effective |= loadflag::SGB_MODE;
        }
        self.loadflags = effective;

        info!(
            "loading {:?} ({}, {} banks, cgb={}, sgb={})",
            cart.title,
            cart.pak_info().mbc.label(),
            cart.pak_info().rom_banks,
            cgb,
            sgb
        );

        cart.set_time_mode(self.time_mode, 0);
        cart.set_save_base(self.save_base_for(&cart));

        self.mmu = Mmu::new_with_mode(cgb);
        if sgb {
            self.mmu.enable_sgb();
        }

        let skip_bios = flags & loadflag::NO_BIOS != 0 || self.bios.is_none();
        if skip_bios {
            // Synthesize the post-boot hardware state.
            self.cpu = Cpu::new_post_boot(cgb, flags & loadflag::GBA_FLAG != 0);
            self.mmu.ppu.apply_boot_state();
        } else {
            self.cpu = Cpu::new_power_on();
            self.mmu.timer.div = 0;
            self.mmu.if_reg = 0;
            if let Some(bios) = self.bios.clone() {
                self.mmu.load_bios(bios);
            }
        }

        self.mmu.load_cart(cart);
        if let Some(cart) = self.mmu.cart.as_mut() {
            cart.load_savedata(0);
        }
        self.mmu
            .apu
            .set_skip_generation(self.speedup_flags & SPEEDUP_NO_SOUND != 0);

        self.loaded = true;
        Ok(())
    }

    /// Load a boot ROM image. `expected_size`/`expected_crc` of 0 skip that
    /// check; the CRC is computed with byte 0xFE masked to zero to tolerate
    /// the hardware-variant field there. In GBA mode the known CGB image is
    /// patched to the GBA-revision bytes.
    pub fn load_bios(
        &mut self,
        mut bios: Vec<u8>,
        expected_size: usize,
        expected_crc: u32,
    ) -> Result<(), LoadError> {
        if expected_size != 0 && bios.len() != expected_size {
            return Err(LoadError::BadBiosSize);
        }
        if expected_crc != 0 {
            let mut masked = bios.clone();
            if let Some(b) = masked.get_mut(0xFE) {
                *b = 0;
            }
            if crc32fast::hash(&masked) != expected_crc {
                return Err(LoadError::BadBiosCrc);
            }
        }

        if self.loadflags & loadflag::GBA_FLAG != 0
            && crc32fast::hash(&bios) == 0x41884E46
            && bios.len() >= 0x100
        {
            // Patch the stock CGB image into its GBA-mode revision.
            bios[0xF3] ^= 0x03;
            for i in 0xF5..0xFB {
                bios[i] = bios[i + 1];
            }
            bios[0xFB] ^= 0x74;
        }

        self.bios = Some(bios);
        Ok(())
    }

    /// Reset to the initial state, as if the ROM had just been loaded.
    /// The cartridge (with its RAM) and loaded BIOS are preserved.
    pub fn reset(&mut self) {
        if !self.loaded {
            return;
        }
        if self.implicit_save() {
            self.save_savedata();
        }

        let mut cart = self.mmu.cart.take();
        let cgb = self.mmu.is_cgb();
        let sgb = self.mmu.sgb.is_some();

        self.mmu = Mmu::new_with_mode(cgb);
        if sgb {
            self.mmu.enable_sgb();
        }

        let skip_bios = self.loadflags & loadflag::NO_BIOS != 0 || self.bios.is_none();
        if skip_bios {
            self.cpu = Cpu::new_post_boot(cgb, self.loadflags & loadflag::GBA_FLAG != 0);
            self.mmu.ppu.apply_boot_state();
        } else {
            self.cpu = Cpu::new_power_on();
            self.mmu.timer.div = 0;
            self.mmu.if_reg = 0;
            if let Some(bios) = self.bios.clone() {
                self.mmu.load_bios(bios);
            }
        }

        if let Some(cart) = cart.as_mut() {
            cart.reset_banking();
            cart.set_time_mode(self.time_mode, 0);
        }
        if let Some(cart) = cart {
            self.mmu.load_cart(cart);
        }
        self.mmu
            .apu
            .set_skip_generation(self.speedup_flags & SPEEDUP_NO_SOUND != 0);
    }

    /// Emulate until at least `samples` stereo samples have been produced
    /// in `audio`, or until a video frame completes.
    ///
    /// An audio sample is two native-endian signed 16-bit PCM values packed
    /// into one u32, left in the high half. On return `samples` holds the
    /// number actually produced. The return value is the sample offset at
    /// which a completed frame was written into `video` (honoring `pitch`
    /// pixels per row), or -1 if no frame completed. A `None` video buffer
    /// skips pixel output entirely.
    pub fn run_for(
        &mut self,
        video: Option<&mut [u32]>,
        pitch: usize,
        audio: &mut [u32],
        samples: &mut usize,
    ) -> isize {
        if !self.loaded {
            *samples = 0;
            return -1;
        }

        let _ = self.cpu.breakpoints.take_hit();

        if self.mmu.cycles >= REBASE_THRESHOLD {
            let offset = (self.mmu.cycles / REBASE_THRESHOLD) * REBASE_THRESHOLD;
            self.mmu.rebase_cycles(offset);
        }

        let requested = (*samples).min(audio.len());
        self.mmu.apu.begin_run(requested);
        self.mmu
            .events
            .set(EventId::End, self.mmu.cycles + requested as u64 * 2);
        self.mmu.events.disable(EventId::Blit);

        let mut frame_offset: isize = -1;
        'run: loop {
            while self.mmu.cycles < self.mmu.events.min_time() {
                if !self.cpu.step(&mut self.mmu) {
                    // Breakpoint hit: stop before the flagged instruction.
                    break 'run;
                }
            }

            while let Some(id) = self.mmu.events.next_event() {
                if self.mmu.events.time(id) > self.mmu.cycles {
                    break;
                }
                match id {
                    EventId::Blit => {
                        self.mmu.events.disable(EventId::Blit);
                        if self.mmu.ppu.frame_ready() {
                            frame_offset = self.mmu.apu.samples_produced() as isize;
                            break 'run;
                        }
                    }
                    EventId::End => break 'run,
                    other => self.mmu.service_event(other),
                }
            }
        }

        if frame_offset >= 0 {
            if let Some(buf) = video {
                self.copy_frame(buf, pitch);
            }
            self.mmu.ppu.clear_frame_flag();
        }

        *samples = self.mmu.apu.drain_into(audio);
        frame_offset
    }

    /// Copy the finished internal frame into a caller buffer with the given
    /// row pitch, applying the SGB colorizer when active.
    fn copy_frame(&mut self, dst: &mut [u32], pitch: usize) {
        let pitch = pitch.max(SCREEN_WIDTH);
        if dst.len() < pitch * (SCREEN_HEIGHT - 1) + SCREEN_WIDTH {
            return;
        }
        if let Some(sgb) = self.mmu.sgb.as_ref() {
            sgb.colorize(&self.mmu.ppu.shade_fb, dst, pitch);
            return;
        }
        let fb = self.mmu.ppu.framebuffer();
        for row in 0..SCREEN_HEIGHT {
            dst[row * pitch..row * pitch + SCREEN_WIDTH]
                .copy_from_slice(&fb[row * SCREEN_WIDTH..(row + 1) * SCREEN_WIDTH]);
        }
    }

    // ---- save states ----

    fn collect_state(&self) -> SaveState {
        let mut st = SaveState::default();
        self.cpu.save_state(&mut st);
        self.mmu.save_state(&mut st);
        st
    }

    /// Serialize the current state into a buffer, embedding a thumbnail of
    /// `video` when given. Returns `None` when no ROM is loaded.
    pub fn save_state_buf(&self, video: Option<(&[u32], usize)>) -> Option<Vec<u8>> {
        if !self.loaded {
            return None;
        }
        let st = self.collect_state();
        Some(state::save_state(&st, self.mode_byte(), video))
    }

    /// Restore a state from a buffer. On a format/version/fingerprint
    /// mismatch the live state is left untouched and false is returned.
    pub fn load_state_buf(&mut self, data: &[u8]) -> bool {
        if !self.loaded {
            return false;
        }
        // Parse onto a snapshot of the current state so fields a (older)
        // file does not carry keep their live values.
        let mut st = self.collect_state();
        if !state::load_state(data, &mut st, true, self.mode_byte()) {
            return false;
        }
        self.cpu.load_state(&st);
        self.mmu.load_state(&st);
        true
    }

    pub fn save_state_file(&self, path: &Path, video: Option<(&[u32], usize)>) -> bool {
        match self.save_state_buf(video) {
            Some(buf) => std::fs::write(path, buf).is_ok(),
            None => false,
        }
    }

    pub fn load_state_file(&mut self, path: &Path) -> bool {
        match std::fs::read(path) {
            Ok(data) => self.load_state_buf(&data),
            Err(_) => false,
        }
    }

    fn slot_path(&self) -> Option<PathBuf> {
        let base = self.mmu.cart.as_ref()?.save_base()?.clone();
        let name = format!(
            "{}_{}.gqs",
            base.file_name()?.to_string_lossy(),
            self.state_no
        );
        Some(base.with_file_name(name))
    }

    /// Save to the slot selected with [`GameBoy::select_state`], under the
    /// configured save directory.
    pub fn save_state_slot(&self, video: Option<(&[u32], usize)>) -> bool {
        match self.slot_path() {
            Some(path) => self.save_state_file(&path, video),
            None => false,
        }
    }

    pub fn load_state_slot(&mut self) -> bool {
        match self.slot_path() {
            Some(path) => self.load_state_file(&path),
            None => false,
        }
    }

    /// Select the save-state slot (0-9, wrapping for any n).
    pub fn select_state(&mut self, n: i32) {
        self.state_no = n.rem_euclid(10) as usize;
    }

    pub fn current_state(&self) -> usize {
        self.state_no
    }

    // ---- persistent cartridge data ----

    /// Directory used for `.sav`/`.rtc`/`.gqs` companions. Without one, no
    /// persistent data is written.
    pub fn set_save_dir(&mut self, dir: &Path) {
        self.save_dir = Some(dir.to_path_buf());
        let base = self
            .mmu
            .cart
            .as_ref()
            .map(|cart| self.save_base_for(cart));
        if let (Some(base), Some(cart)) = (base, self.mmu.cart.as_mut()) {
            cart.set_save_base(base);
        }
    }

    fn save_base_for(&self, cart: &Cartridge) -> Option<PathBuf> {
        let dir = self.save_dir.as_ref()?;
        let stem: String = cart
            .title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let stem = if stem.is_empty() {
            format!("rom_{:08x}", cart.pak_info().crc32)
        } else {
            stem
        };
        Some(dir.join(stem))
    }

    /// Write battery-backed cartridge data to disk. Done implicitly when
    /// the ROM is replaced or the instance dropped, unless loaded read-only.
    pub fn save_savedata(&mut self) {
        let cc = self.mmu.cycles;
        if let Some(cart) = self.mmu.cart.as_mut()
            && let Err(e) = cart.save_savedata(cc)
        {
            log::warn!("failed to write save data: {e}");
        }
    }

    pub fn load_savedata(&mut self) {
        let cc = self.mmu.cycles;
        if let Some(cart) = self.mmu.cart.as_mut() {
            cart.load_savedata(cc);
        }
    }

    // ---- configuration ----

    pub fn set_input_source(&mut self, source: Box<dyn InputSource>) {
        self.mmu.joypad.set_source(source);
    }

    pub fn set_link_port(&mut self, port: Box<dyn LinkPort + Send>) {
        self.mmu.serial.connect(port);
    }

    pub fn set_read_callback(&mut self, callback: Option<MemoryCallback>) {
        self.mmu.set_read_callback(callback);
    }

    pub fn set_write_callback(&mut self, callback: Option<MemoryCallback>) {
        self.mmu.set_write_callback(callback);
    }

    pub fn set_exec_callback(&mut self, callback: Option<ExecCallback>) {
        self.mmu.set_exec_callback(callback);
    }

    /// Fire `callback` when the PPU starts producing the given scanline
    /// (0-153), before its pixels exist.
    pub fn set_scanline_callback(&mut self, callback: Option<ScanlineCallback>, line: u8) {
        self.mmu.ppu.set_scanline_callback(callback, line);
    }

    /// Suppress individual video layers (debugging aid, no timing impact).
    pub fn set_layers(&mut self, mask: u8) {
        self.mmu.ppu.set_layers(mask);
    }

    pub fn set_dmg_palette_color(&mut self, pal_num: usize, color_num: usize, rgb32: u32) {
        self.mmu.ppu.set_dmg_palette_color(pal_num, color_num, rgb32);
    }

    /// Flat BGR15 expansion instead of the GBC-screen approximation curve.
    pub fn set_true_colors(&mut self, true_colors: bool) {
        self.mmu.ppu.set_true_colors(true_colors);
        if let Some(sgb) = self.mmu.sgb.as_mut() {
            sgb.set_true_colors(true_colors);
        }
    }

    /// Cycle-based RTC for deterministic replays instead of wall-clock time.
    pub fn set_time_mode(&mut self, use_cycles: bool) {
        self.time_mode = if use_cycles {
            TimeMode::Cycle
        } else {
            TimeMode::Wall
        };
        let (mode, cc) = (self.time_mode, self.mmu.cycles);
        if let Some(cart) = self.mmu.cart.as_mut() {
            cart.set_time_mode(mode, cc);
        }
    }

    pub fn set_cart_bus_pull_up_time(&mut self, cycles: u64) {
        self.mmu.set_cart_bus_pull_up_time(cycles);
    }

    pub fn set_game_genie(&mut self, codes: &str) {
        if let Some(cart) = self.mmu.cart.as_mut() {
            cart.set_game_genie(codes);
        }
    }

    pub fn set_game_shark(&mut self, codes: &str) {
        self.mmu.set_game_shark(Cartridge::parse_game_shark(codes));
    }

    pub fn set_breakpoints(&mut self, breakpoints: Vec<Breakpoint>) {
        self.cpu.breakpoints.set_breakpoints(breakpoints);
    }

    /// The address execution stopped at, or `None` if the last run stopped
    /// normally. The hit clears when the next run begins.
    pub fn hit_address(&self) -> Option<u16> {
        self.cpu.breakpoints.hit()
    }

    pub fn set_speedup_flags(&mut self, flags: u32) {
        self.speedup_flags = flags;
        self.mmu
            .apu
            .set_skip_generation(flags & SPEEDUP_NO_SOUND != 0);
    }

    // ---- introspection ----

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_cgb(&self) -> bool {
        self.mmu.is_cgb()
    }

    pub fn rom_title(&self) -> &str {
        self.mmu.cart.as_ref().map(|c| c.title.as_str()).unwrap_or("")
    }

    pub fn pak_info(&self) -> Option<&PakInfo> {
        self.mmu.cart.as_ref().map(|c| c.pak_info())
    }

    /// Bytes written out the link port so far.
    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.mmu.take_serial()
    }

    pub fn link_active(&self) -> bool {
        self.mmu.serial.transfer_active()
    }

    /// Raw bus read without cycle cost. Register side effects still apply.
    pub fn external_read(&mut self, addr: u16) -> u8 {
        self.mmu.external_read(addr)
    }

    /// Raw bus write without cycle cost. Side effects apply.
    pub fn external_write(&mut self, addr: u16, val: u8) {
        self.mmu.external_write(addr, val);
    }

    /// Register values as `[pc, sp, a, b, c, d, e, f, h, l]`.
    pub fn get_regs(&self) -> [i32; 10] {
        [
            self.cpu.pc as i32,
            self.cpu.sp as i32,
            self.cpu.a as i32,
            self.cpu.b as i32,
            self.cpu.c as i32,
            self.cpu.d as i32,
            self.cpu.e as i32,
            self.cpu.f as i32,
            self.cpu.h as i32,
            self.cpu.l as i32,
        ]
    }

    pub fn set_regs(&mut self, regs: &[i32; 10]) {
        self.cpu.pc = regs[0] as u16;
        self.cpu.sp = regs[1] as u16;
        self.cpu.a = regs[2] as u8;
        self.cpu.b = regs[3] as u8;
        self.cpu.c = regs[4] as u8;
        self.cpu.d = regs[5] as u8;
        self.cpu.e = regs[6] as u8;
        self.cpu.f = regs[7] as u8 & 0xF0;
        self.cpu.h = regs[8] as u8;
        self.cpu.l = regs[9] as u8;
    }

    /// RTC sub-fields as `[base seconds, halt seconds, dh, latched dh,
    /// latched dl, latched h, latched m, latched s, selected index,
    /// enabled, cycle mode]`.
    pub fn get_rtc_regs(&mut self) -> [u32; 11] {
        let cc = self.mmu.cycles;
        let mut out = [0u32; 11];
        if let Some(cart) = self.mmu.cart.as_mut() {
            out[0] = cart.time_now(cc);
            out[10] = (self.time_mode == TimeMode::Cycle) as u32;
            if let Some(rtc) = cart.rtc.as_ref() {
                out[1] = rtc.halt_time;
                out[2] = rtc.data_dh as u32;
                out[3] = rtc.latch_dh as u32;
                out[4] = rtc.latch_dl as u32;
                out[5] = rtc.latch_h as u32;
                out[6] = rtc.latch_m as u32;
                out[7] = rtc.latch_s as u32;
                out[8] = rtc.index as u32;
                out[9] = rtc.selected() as u32;
            }
        }
        out
    }

    pub fn set_rtc_regs(&mut self, regs: &[u32; 11]) {
        let cc = self.mmu.cycles;
        if let Some(cart) = self.mmu.cart.as_mut() {
            cart.time.set(regs[0], cc);
            if let Some(rtc) = cart.rtc.as_mut() {
                rtc.halt_time = regs[1];
                rtc.data_dh = regs[2] as u8;
                rtc.latch_dh = regs[3] as u8;
                rtc.latch_dl = regs[4] as u8;
                rtc.latch_h = regs[5] as u8;
                rtc.latch_m = regs[6] as u8;
                rtc.latch_s = regs[7] as u8;
                rtc.index = regs[8] as u8;
                rtc.select(regs[9] != 0, regs[8] as u8);
            }
        }
    }

    /// Current cycle-based time counter in RTC seconds.
    pub fn time_now(&mut self) -> u32 {
        let cc = self.mmu.cycles;
        self.mmu
            .cart
            .as_mut()
            .map(|c| c.time_now(cc))
            .unwrap_or(0)
    }

    /// Position of the internal divider, in the 0-0x3FFF range.
    pub fn div_state(&self) -> i32 {
        ((self.mmu.timer.div as i32) >> 2) & 0x3FFF
    }

    /// Total dot cycles elapsed since power on (modulo rebasing).
    pub fn cycle_counter(&self) -> u64 {
        self.mmu.cycles
    }

    /// Direct access to the bus for integration layers.
    pub fn mmu(&mut self) -> &mut Mmu {
        &mut self.mmu
    }
}

impl Default for GameBoy {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GameBoy {
    fn drop(&mut self) {
        if self.loaded && self.implicit_save() {
            self.save_savedata();
        }
    }
}
