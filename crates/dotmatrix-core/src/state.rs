//! Label-tagged save-state serialization.
//!
//! The format is a flat sequence of `{NUL-terminated ASCII label}{3-byte
//! big-endian length}{payload}` records behind a small header and an
//! embedded thumbnail. Labels are sorted so loading can binary-search, skip
//! records it does not know, and leave fields absent from the file at their
//! pre-load values. This is the schema-evolution mechanism: old states keep
//! loading as fields are added or reordered.

use std::sync::OnceLock;

use log::warn;

/// Format version byte.
pub const SAVE_STATE_VERSION: u8 = 0x02;

/// Leading sentinel so unrelated formats are never misparsed.
const SENTINEL: u8 = 0xFF;

const THUMB_SHIFT: usize = 2;
const THUMB_DIV: usize = 1 << THUMB_SHIFT;
pub const THUMB_WIDTH: usize = 160 >> THUMB_SHIFT;
pub const THUMB_HEIGHT: usize = 144 >> THUMB_SHIFT;

/// The complete serializable snapshot of the emulated hardware. Components
/// copy their mutable state in and out of this transfer structure; it is
/// never the live store.
#[derive(Debug, Default, Clone)]
pub struct SaveState {
    pub cpu: CpuState,
    pub mem: MemState,
    pub ppu: PpuState,
    pub apu: ApuState,
    pub rtc: RtcState,
    pub huc3: HuC3State,
    pub sgb: SgbState,
}

#[derive(Debug, Default, Clone)]
pub struct CpuState {
    /// Global cycle counter (the shared time axis).
    pub cc: u64,
    pub pc: u16,
    pub sp: u16,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub f: u8,
    pub h: u8,
    pub l: u8,
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    pub halt_bug: bool,
    pub ei_delay: u8,
    /// 0xFFFF_FFFF when no halt PC is latched.
    pub halt_pc: u32,
    pub halt_pending: u8,
}

#[derive(Debug, Default, Clone)]
pub struct MemState {
    pub wram: Vec<u8>,
    pub hram: Vec<u8>,
    pub vram: Vec<u8>,
    pub oam: Vec<u8>,
    pub sram: Vec<u8>,
    pub wram_bank: u8,
    pub vram_bank: u8,
    pub if_reg: u8,
    pub ie_reg: u8,
    pub key1: u8,
    pub rp: u8,
    pub bios_mapped: bool,
    pub joyp: u8,

    pub dma_cycles: u16,
    pub dma_source: u16,
    /// 0xFFFF_FFFF when no OAM DMA is pending.
    pub pending_dma: u32,
    pub pending_delay: u16,
    pub gdma_cycles: u32,
    pub hdma_src: u16,
    pub hdma_dst: u16,
    pub hdma_blocks: u8,
    pub hdma_mode: u8,
    pub hdma_active: bool,
    pub hdma_cancelled: bool,

    pub cart_bus: u8,
    pub cart_bus_update: u64,

    pub rom_bank: u16,
    pub ram_bank: u8,
    pub ram_enable: bool,
    /// MBC1 banking mode / HuC3 ramflag / HuC1 IR-select, depending on the
    /// mapper.
    pub mbc_mode: u8,
    pub mbc_latch: bool,
    pub time_seconds: u32,
    pub time_last_cc: u64,

    pub div: u16,
    pub tima: u8,
    pub tma: u8,
    pub tac: u8,
    pub timer_last_signal: bool,
    /// 0xFFFF when no reload is pending; low byte is the reload value.
    pub timer_pending_reload: u16,
    pub timer_reload_delay: u8,
    /// 0xFFFF when no TMA write was latched this cycle.
    pub tma_latch: u16,
    pub timer_reloading: bool,

    pub sb: u8,
    pub sc: u8,
    /// 0xFF when no transfer is active; otherwise remaining bits.
    pub serial_bits: u8,
    pub serial_out: u8,
    /// 0xFFFF when the incoming byte has not been latched yet.
    pub serial_in: u16,
    pub serial_pending_in: u8,
    pub serial_internal: bool,
    pub serial_fast: bool,
}

#[derive(Debug, Default, Clone)]
pub struct PpuState {
    pub lcdc: u8,
    pub stat: u8,
    pub scy: u8,
    pub scx: u8,
    pub ly: u8,
    pub lyc: u8,
    pub lyc_eq_ly: bool,
    pub dma: u8,
    pub bgp: u8,
    pub obp0: u8,
    pub obp1: u8,
    pub wy: u8,
    pub wx: u8,
    pub win_line_counter: u8,
    pub bgpi: u8,
    pub obpi: u8,
    pub bgpd: Vec<u8>,
    pub obpd: Vec<u8>,
    pub opri: u8,
    pub mode: u8,
    pub mode_clock: u16,
    pub stat_irq_line: bool,
    /// Latched line sprites, 6 bytes per entry (x, y as i16 LE, tile,
    /// flags, OAM index packed at the end).
    pub sprites: Vec<u8>,
    pub sprite_count: u8,
    /// Settable DMG palette colors, 12 RGB32 values as LE bytes.
    pub dmg_colors: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
pub struct SquareState {
    pub enabled: bool,
    pub dac: bool,
    pub length: u16,
    pub length_enable: bool,
    pub frequency: u16,
    pub timer: u32,
    pub volume: u8,
    pub env_timer: u8,
    pub duty_pos: u8,
    pub sweep_shadow: u16,
    pub sweep_timer: u8,
    pub sweep_enabled: bool,
    pub sweep_neg_used: bool,
}

#[derive(Debug, Default, Clone)]
pub struct WaveState {
    pub enabled: bool,
    pub dac: bool,
    pub length: u16,
    pub length_enable: bool,
    pub frequency: u16,
    pub timer: u32,
    pub position: u8,
    pub sample: u8,
}

#[derive(Debug, Default, Clone)]
pub struct NoiseState {
    pub enabled: bool,
    pub dac: bool,
    pub length: u16,
    pub length_enable: bool,
    pub timer: u32,
    pub lfsr: u16,
    pub volume: u8,
    pub env_timer: u8,
}

#[derive(Debug, Default, Clone)]
pub struct ApuState {
    pub ch1: SquareState,
    pub ch2: SquareState,
    pub ch3: WaveState,
    pub ch4: NoiseState,
    pub regs: Vec<u8>,
    pub wave_ram: Vec<u8>,
    pub nr50: u8,
    pub nr51: u8,
    pub power: bool,
    pub seq_step: u8,
    pub seq_counter: u32,
    pub sample_counter: u32,
}

#[derive(Debug, Default, Clone)]
pub struct RtcState {
    pub data_dh: u8,
    pub halt_time: u32,
    pub latch_s: u8,
    pub latch_m: u8,
    pub latch_h: u8,
    pub latch_dl: u8,
    pub latch_dh: u8,
    pub index: u8,
    pub enabled: bool,
}

#[derive(Debug, Default, Clone)]
pub struct HuC3State {
    pub data_time: u32,
    pub writing_time: u32,
    pub ram_value: u8,
    pub shift: u8,
    pub mode: u8,
    pub halted: bool,
    pub halt_time: u32,
}

#[derive(Debug, Default, Clone)]
pub struct SgbState {
    pub transfer: u8,
    pub packet: Vec<u8>,
    pub command: Vec<u8>,
    pub command_index: u8,
    pub joypad_index: u8,
    pub joypad_mask: u8,
    /// System palette RAM as LE u16 bytes.
    pub system_colors: Vec<u8>,
    /// Active palettes as LE u16 bytes.
    pub colors: Vec<u8>,
    pub attributes: Vec<u8>,
    pub pending: u8,
    pub pending_count: u8,
    pub mask: u8,
}

// ---- byte stream helpers ----

fn put24(out: &mut Vec<u8>, len: usize) {
    out.push((len >> 16) as u8);
    out.push((len >> 8) as u8);
    out.push(len as u8);
}

fn put_scalar(out: &mut Vec<u8>, val: u64, size: usize) {
    put24(out, size);
    for i in (0..size).rev() {
        out.push((val >> (i * 8)) as u8);
    }
}

fn put_bytes(out: &mut Vec<u8>, data: &[u8]) {
    put24(out, data.len());
    out.extend_from_slice(data);
}

pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn byte(&mut self) -> u8 {
        let b = self.data.get(self.pos).copied().unwrap_or(0);
        self.pos = (self.pos + 1).min(self.data.len());
        b
    }

    fn get24(&mut self) -> usize {
        let mut len = 0usize;
        for _ in 0..3 {
            len = (len << 8) | self.byte() as usize;
        }
        len.min(self.remaining())
    }

    fn skip(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    fn read_scalar(&mut self) -> u64 {
        let mut size = self.get24();
        if size > 8 {
            self.skip(size - 8);
            size = 8;
        }
        let mut out = 0u64;
        for _ in 0..size {
            out = (out << 8) | self.byte() as u64;
        }
        out
    }

    fn read_bytes(&mut self, buf: &mut [u8]) {
        let size = self.get24();
        let n = size.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.skip(size);
    }

    fn read_vec(&mut self, buf: &mut Vec<u8>) {
        let len = buf.len();
        let mut tmp = std::mem::take(buf);
        tmp.resize(len, 0);
        self.read_bytes(&mut tmp);
        *buf = tmp;
    }

    /// Read a NUL-terminated label; `None` on truncated input.
    fn read_label(&mut self) -> Option<&'a [u8]> {
        let start = self.pos;
        let rel = self.data[start..].iter().position(|&b| b == 0)?;
        self.pos = start + rel + 1;
        Some(&self.data[start..start + rel])
    }
}

// ---- saver list ----

type SaveFn = fn(&mut Vec<u8>, &SaveState);
type LoadFn = fn(&mut Reader<'_>, &mut SaveState);

struct Saver {
    label: &'static str,
    save: SaveFn,
    load: LoadFn,
}

macro_rules! sav_scalar {
    ($list:expr, $label:expr, $ty:ty, $($path:ident).+) => {
        $list.push(Saver {
            label: $label,
            save: |out, s| put_scalar(out, s.$($path).+ as u64, std::mem::size_of::<$ty>()),
            load: |r, s| s.$($path).+ = r.read_scalar() as $ty,
        })
    };
}

macro_rules! sav_bool {
    ($list:expr, $label:expr, $($path:ident).+) => {
        $list.push(Saver {
            label: $label,
            save: |out, s| put_scalar(out, s.$($path).+ as u64, 1),
            load: |r, s| s.$($path).+ = r.read_scalar() != 0,
        })
    };
}

macro_rules! sav_bytes {
    ($list:expr, $label:expr, $($path:ident).+) => {
        $list.push(Saver {
            label: $label,
            save: |out, s| put_bytes(out, &s.$($path).+),
            load: |r, s| r.read_vec(&mut s.$($path).+),
        })
    };
}

fn build_savers() -> Vec<Saver> {
    let mut list: Vec<Saver> = Vec::with_capacity(128);

    sav_scalar!(list, "cc", u64, cpu.cc);
    sav_scalar!(list, "pc", u16, cpu.pc);
    sav_scalar!(list, "sp", u16, cpu.sp);
    sav_scalar!(list, "a", u8, cpu.a);
    sav_scalar!(list, "b", u8, cpu.b);
    sav_scalar!(list, "c", u8, cpu.c);
    sav_scalar!(list, "d", u8, cpu.d);
    sav_scalar!(list, "e", u8, cpu.e);
    sav_scalar!(list, "f", u8, cpu.f);
    sav_scalar!(list, "h", u8, cpu.h);
    sav_scalar!(list, "l", u8, cpu.l);
    sav_bool!(list, "ime", cpu.ime);
    sav_bool!(list, "halt", cpu.halted);
    sav_bool!(list, "stop", cpu.stopped);
    sav_bool!(list, "hltbug", cpu.halt_bug);
    sav_scalar!(list, "eidly", u8, cpu.ei_delay);
    sav_scalar!(list, "hltpc", u32, cpu.halt_pc);
    sav_scalar!(list, "hltpnd", u8, cpu.halt_pending);

    sav_bytes!(list, "wram", mem.wram);
    sav_bytes!(list, "hram", mem.hram);
    sav_bytes!(list, "vram", mem.vram);
    sav_bytes!(list, "oam", mem.oam);
    sav_bytes!(list, "sram", mem.sram);
    sav_scalar!(list, "wrambk", u8, mem.wram_bank);
    sav_scalar!(list, "vrambk", u8, mem.vram_bank);
    sav_scalar!(list, "if", u8, mem.if_reg);
    sav_scalar!(list, "ie", u8, mem.ie_reg);
    sav_scalar!(list, "key1", u8, mem.key1);
    sav_scalar!(list, "rp", u8, mem.rp);
    sav_bool!(list, "bios", mem.bios_mapped);
    sav_scalar!(list, "joyp", u8, mem.joyp);

    sav_scalar!(list, "odmacyc", u16, mem.dma_cycles);
    sav_scalar!(list, "odmasrc", u16, mem.dma_source);
    sav_scalar!(list, "odmapnd", u32, mem.pending_dma);
    sav_scalar!(list, "odmadly", u16, mem.pending_delay);
    sav_scalar!(list, "gdmacyc", u32, mem.gdma_cycles);
    sav_scalar!(list, "hdmasrc", u16, mem.hdma_src);
    sav_scalar!(list, "hdmadst", u16, mem.hdma_dst);
    sav_scalar!(list, "hdmablk", u8, mem.hdma_blocks);
    sav_scalar!(list, "hdmamod", u8, mem.hdma_mode);
    sav_bool!(list, "hdmaact", mem.hdma_active);
    sav_bool!(list, "hdmacan", mem.hdma_cancelled);

    sav_scalar!(list, "cartbus", u8, mem.cart_bus);
    sav_scalar!(list, "cbusup", u64, mem.cart_bus_update);

    sav_scalar!(list, "rombank", u16, mem.rom_bank);
    sav_scalar!(list, "rambank", u8, mem.ram_bank);
    sav_bool!(list, "sramon", mem.ram_enable);
    sav_scalar!(list, "mbcmode", u8, mem.mbc_mode);
    sav_bool!(list, "mbclat", mem.mbc_latch);
    sav_scalar!(list, "timesec", u32, mem.time_seconds);
    sav_scalar!(list, "timecc", u64, mem.time_last_cc);

    sav_scalar!(list, "div", u16, mem.div);
    sav_scalar!(list, "tima", u8, mem.tima);
    sav_scalar!(list, "tma", u8, mem.tma);
    sav_scalar!(list, "tac", u8, mem.tac);
    sav_bool!(list, "timsig", mem.timer_last_signal);
    sav_scalar!(list, "timrld", u16, mem.timer_pending_reload);
    sav_scalar!(list, "timdly", u8, mem.timer_reload_delay);
    sav_scalar!(list, "tmalat", u16, mem.tma_latch);
    sav_bool!(list, "timrlg", mem.timer_reloading);

    sav_scalar!(list, "sb", u8, mem.sb);
    sav_scalar!(list, "sc", u8, mem.sc);
    sav_scalar!(list, "serbit", u8, mem.serial_bits);
    sav_scalar!(list, "serout", u8, mem.serial_out);
    sav_scalar!(list, "serin", u16, mem.serial_in);
    sav_scalar!(list, "serpin", u8, mem.serial_pending_in);
    sav_bool!(list, "serint", mem.serial_internal);
    sav_bool!(list, "serfst", mem.serial_fast);

    sav_scalar!(list, "lcdc", u8, ppu.lcdc);
    sav_scalar!(list, "stat", u8, ppu.stat);
    sav_scalar!(list, "scy", u8, ppu.scy);
    sav_scalar!(list, "scx", u8, ppu.scx);
    sav_scalar!(list, "ly", u8, ppu.ly);
    sav_scalar!(list, "lyc", u8, ppu.lyc);
    sav_bool!(list, "lyceq", ppu.lyc_eq_ly);
    sav_scalar!(list, "dmareg", u8, ppu.dma);
    sav_scalar!(list, "bgp", u8, ppu.bgp);
    sav_scalar!(list, "obp0", u8, ppu.obp0);
    sav_scalar!(list, "obp1", u8, ppu.obp1);
    sav_scalar!(list, "wy", u8, ppu.wy);
    sav_scalar!(list, "wx", u8, ppu.wx);
    sav_scalar!(list, "winlin", u8, ppu.win_line_counter);
    sav_scalar!(list, "bgpi", u8, ppu.bgpi);
    sav_scalar!(list, "obpi", u8, ppu.obpi);
    sav_bytes!(list, "bgpd", ppu.bgpd);
    sav_bytes!(list, "obpd", ppu.obpd);
    sav_scalar!(list, "opri", u8, ppu.opri);
    sav_scalar!(list, "pmode", u8, ppu.mode);
    sav_scalar!(list, "pclock", u16, ppu.mode_clock);
    sav_bool!(list, "statln", ppu.stat_irq_line);
    sav_bytes!(list, "sprites", ppu.sprites);
    sav_scalar!(list, "sprcnt", u8, ppu.sprite_count);
    sav_bytes!(list, "dmgcols", ppu.dmg_colors);

    sav_bool!(list, "c1on", apu.ch1.enabled);
    sav_bool!(list, "c1dac", apu.ch1.dac);
    sav_scalar!(list, "c1len", u16, apu.ch1.length);
    sav_bool!(list, "c1lenon", apu.ch1.length_enable);
    sav_scalar!(list, "c1freq", u16, apu.ch1.frequency);
    sav_scalar!(list, "c1tmr", u32, apu.ch1.timer);
    sav_scalar!(list, "c1vol", u8, apu.ch1.volume);
    sav_scalar!(list, "c1envt", u8, apu.ch1.env_timer);
    sav_scalar!(list, "c1pos", u8, apu.ch1.duty_pos);
    sav_scalar!(list, "swpshd", u16, apu.ch1.sweep_shadow);
    sav_scalar!(list, "swpt", u8, apu.ch1.sweep_timer);
    sav_bool!(list, "swpon", apu.ch1.sweep_enabled);
    sav_bool!(list, "swpneg", apu.ch1.sweep_neg_used);

    sav_bool!(list, "c2on", apu.ch2.enabled);
    sav_bool!(list, "c2dac", apu.ch2.dac);
    sav_scalar!(list, "c2len", u16, apu.ch2.length);
    sav_bool!(list, "c2lenon", apu.ch2.length_enable);
    sav_scalar!(list, "c2freq", u16, apu.ch2.frequency);
    sav_scalar!(list, "c2tmr", u32, apu.ch2.timer);
    sav_scalar!(list, "c2vol", u8, apu.ch2.volume);
    sav_scalar!(list, "c2envt", u8, apu.ch2.env_timer);
    sav_scalar!(list, "c2pos", u8, apu.ch2.duty_pos);

    sav_bool!(list, "c3on", apu.ch3.enabled);
    sav_bool!(list, "c3dac", apu.ch3.dac);
    sav_scalar!(list, "c3len", u16, apu.ch3.length);
    sav_bool!(list, "c3lenon", apu.ch3.length_enable);
    sav_scalar!(list, "c3freq", u16, apu.ch3.frequency);
    sav_scalar!(list, "c3tmr", u32, apu.ch3.timer);
    sav_scalar!(list, "c3pos", u8, apu.ch3.position);
    sav_scalar!(list, "c3smp", u8, apu.ch3.sample);

    sav_bool!(list, "c4on", apu.ch4.enabled);
    sav_bool!(list, "c4dac", apu.ch4.dac);
    sav_scalar!(list, "c4len", u16, apu.ch4.length);
    sav_bool!(list, "c4lenon", apu.ch4.length_enable);
    sav_scalar!(list, "c4tmr", u32, apu.ch4.timer);
    sav_scalar!(list, "lfsr", u16, apu.ch4.lfsr);
    sav_scalar!(list, "c4vol", u8, apu.ch4.volume);
    sav_scalar!(list, "c4envt", u8, apu.ch4.env_timer);

    sav_bytes!(list, "apuregs", apu.regs);
    sav_bytes!(list, "waveram", apu.wave_ram);
    sav_scalar!(list, "nr50", u8, apu.nr50);
    sav_scalar!(list, "nr51", u8, apu.nr51);
    sav_bool!(list, "apuon", apu.power);
    sav_scalar!(list, "seqstp", u8, apu.seq_step);
    sav_scalar!(list, "seqctr", u32, apu.seq_counter);
    sav_scalar!(list, "smpctr", u32, apu.sample_counter);

    sav_scalar!(list, "rtcdh", u8, rtc.data_dh);
    sav_scalar!(list, "rtchlt", u32, rtc.halt_time);
    sav_scalar!(list, "rtcls", u8, rtc.latch_s);
    sav_scalar!(list, "rtclm", u8, rtc.latch_m);
    sav_scalar!(list, "rtclh", u8, rtc.latch_h);
    sav_scalar!(list, "rtcldl", u8, rtc.latch_dl);
    sav_scalar!(list, "rtcldh", u8, rtc.latch_dh);
    sav_scalar!(list, "rtcidx", u8, rtc.index);
    sav_bool!(list, "rtcon", rtc.enabled);

    sav_scalar!(list, "h3time", u32, huc3.data_time);
    sav_scalar!(list, "h3wrt", u32, huc3.writing_time);
    sav_scalar!(list, "h3rv", u8, huc3.ram_value);
    sav_scalar!(list, "h3shft", u8, huc3.shift);
    sav_scalar!(list, "h3mode", u8, huc3.mode);
    sav_bool!(list, "h3halt", huc3.halted);
    sav_scalar!(list, "h3hltt", u32, huc3.halt_time);

    sav_scalar!(list, "sgbxfr", u8, sgb.transfer);
    sav_bytes!(list, "sgbpkt", sgb.packet);
    sav_bytes!(list, "sgbcmd", sgb.command);
    sav_scalar!(list, "sgbcmdi", u8, sgb.command_index);
    sav_scalar!(list, "sgbjoyi", u8, sgb.joypad_index);
    sav_scalar!(list, "sgbjoym", u8, sgb.joypad_mask);
    sav_bytes!(list, "sgbsys", sgb.system_colors);
    sav_bytes!(list, "sgbcols", sgb.colors);
    sav_bytes!(list, "sgbattr", sgb.attributes);
    sav_scalar!(list, "sgbpend", u8, sgb.pending);
    sav_scalar!(list, "sgbpc", u8, sgb.pending_count);
    sav_scalar!(list, "sgbmask", u8, sgb.mask);

    // Sorted for binary-search lookup on load.
    list.sort_by(|a, b| a.label.cmp(b.label));
    debug_assert!(list.windows(2).all(|w| w[0].label < w[1].label));
    list
}

fn savers() -> &'static [Saver] {
    static SAVERS: OnceLock<Vec<Saver>> = OnceLock::new();
    SAVERS.get_or_init(build_savers)
}

/// Downsample the 160x144 frame into the embedded 40x36 box-filtered
/// thumbnail.
fn write_thumbnail(out: &mut Vec<u8>, video: Option<(&[u32], usize)>) {
    let needed = |pitch: usize| pitch * (THUMB_HEIGHT * THUMB_DIV - 1) + THUMB_WIDTH * THUMB_DIV;
    match video {
        None => put24(out, 0),
        Some((buf, pitch)) if pitch < 160 || buf.len() < needed(pitch) => put24(out, 0),
        Some((buf, pitch)) => {
            put24(out, THUMB_WIDTH * THUMB_HEIGHT * 4);
            for ty in 0..THUMB_HEIGHT {
                for tx in 0..THUMB_WIDTH {
                    let mut r = 0u32;
                    let mut g = 0u32;
                    let mut b = 0u32;
                    for dy in 0..THUMB_DIV {
                        for dx in 0..THUMB_DIV {
                            let px = buf[(ty * THUMB_DIV + dy) * pitch + tx * THUMB_DIV + dx];
                            r += px >> 16 & 0xFF;
                            g += px >> 8 & 0xFF;
                            b += px & 0xFF;
                        }
                    }
                    let n = (THUMB_DIV * THUMB_DIV) as u32;
                    let px = ((r / n) << 16) | ((g / n) << 8) | (b / n);
                    out.extend_from_slice(&px.to_le_bytes());
                }
            }
        }
    }
}

/// Serialize `state` into the tagged binary format. `mode` is the hardware
/// fingerprint byte checked by strict loads.
pub fn save_state(state: &SaveState, mode: u8, video: Option<(&[u32], usize)>) -> Vec<u8> {
    let mut out = Vec::with_capacity(0x12000);
    out.push(SENTINEL);
    out.push(SAVE_STATE_VERSION);
    out.push(mode);
    write_thumbnail(&mut out, video);

    for saver in savers() {
        out.extend_from_slice(saver.label.as_bytes());
        out.push(0);
        (saver.save)(&mut out, state);
    }

    out
}

/// Parse `data` into `state`. Returns false (leaving `state` as passed in)
/// when the sentinel or version byte does not match, or when `strict` is set
/// and the mode fingerprint differs. Unknown labels are skipped; fields the
/// file does not carry keep their prior values.
pub fn load_state(data: &[u8], state: &mut SaveState, strict: bool, mode: u8) -> bool {
    let mut r = Reader::new(data);
    if data.len() < 3 || r.byte() != SENTINEL {
        return false;
    }
    if r.byte() != SAVE_STATE_VERSION {
        warn!("save state version mismatch");
        return false;
    }
    let saved_mode = r.byte();
    if strict && saved_mode != mode {
        warn!("save state hardware mode mismatch");
        return false;
    }

    // Skip the thumbnail block.
    let thumb = r.get24();
    r.skip(thumb);

    let list = savers();
    while r.remaining() > 0 {
        let Some(label) = r.read_label() else {
            break;
        };
        match list.binary_search_by(|s| s.label.as_bytes().cmp(label)) {
            Ok(idx) => (list[idx].load)(&mut r, state),
            Err(_) => {
                let len = r.get24();
                r.skip(len);
            }
        }
    }

    true
}

/// Extract the embedded thumbnail from a state buffer, if one was stored.
pub fn read_thumbnail(data: &[u8]) -> Option<Vec<u32>> {
    if data.len() < 6 || data[0] != SENTINEL {
        return None;
    }
    let mut r = Reader::new(&data[3..]);
    let len = r.get24();
    if len != THUMB_WIDTH * THUMB_HEIGHT * 4 {
        return None;
    }
    let mut out = Vec::with_capacity(THUMB_WIDTH * THUMB_HEIGHT);
    for _ in 0..THUMB_WIDTH * THUMB_HEIGHT {
        let mut px = [0u8; 4];
        r.read_bytes_raw(&mut px);
        out.push(u32::from_le_bytes(px));
    }
    Some(out)
}

impl<'a> Reader<'a> {
    fn read_bytes_raw(&mut self, buf: &mut [u8]) {
        for b in buf.iter_mut() {
            *b = self.byte();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> SaveState {
        let mut s = SaveState::default();
        s.cpu.pc = 0x1234;
        s.cpu.a = 0x42;
        s.mem.wram = vec![0xAB; 0x20];
        s.mem.time_last_cc = 0x1_0000_0001;
        s.apu.ch1.frequency = 0x7FF;
        s
    }

    #[test]
    fn round_trip_restores_fields() {
        let saved = snapshot();
        let buf = save_state(&saved, 0, None);

        let mut loaded = SaveState::default();
        loaded.mem.wram = vec![0; 0x20];
        assert!(load_state(&buf, &mut loaded, true, 0));
        assert_eq!(loaded.cpu.pc, 0x1234);
        assert_eq!(loaded.cpu.a, 0x42);
        assert_eq!(loaded.mem.wram, vec![0xAB; 0x20]);
        assert_eq!(loaded.mem.time_last_cc, 0x1_0000_0001);
        assert_eq!(loaded.apu.ch1.frequency, 0x7FF);
    }

    #[test]
    fn bad_sentinel_or_version_is_rejected() {
        let saved = snapshot();
        let mut buf = save_state(&saved, 0, None);

        let mut state = SaveState::default();
        let untouched = state.clone();

        let mut bad = buf.clone();
        bad[0] = 0x00;
        assert!(!load_state(&bad, &mut state, true, 0));
        assert_eq!(state.cpu.pc, untouched.cpu.pc);

        buf[1] = SAVE_STATE_VERSION.wrapping_add(1);
        assert!(!load_state(&buf, &mut state, true, 0));
        assert_eq!(state.cpu.pc, untouched.cpu.pc);
    }

    #[test]
    fn strict_mode_checks_fingerprint() {
        let saved = snapshot();
        let buf = save_state(&saved, 0x09, None);

        let mut state = SaveState::default();
        assert!(!load_state(&buf, &mut state, true, 0x00));
        assert!(load_state(&buf, &mut state, false, 0x00));
        assert!(load_state(&buf, &mut state, true, 0x09));
    }

    #[test]
    fn unknown_labels_are_skipped_and_missing_fields_kept() {
        // Hand-build a state carrying one known record, one unknown record.
        let mut buf = vec![SENTINEL, SAVE_STATE_VERSION, 0x00];
        put24(&mut buf, 0); // no thumbnail
        buf.extend_from_slice(b"pc\0");
        put24(&mut buf, 2);
        buf.extend_from_slice(&[0x12, 0x34]);
        buf.extend_from_slice(b"zzfuture\0");
        put24(&mut buf, 4);
        buf.extend_from_slice(&[1, 2, 3, 4]);

        let mut loaded = SaveState::default();
        loaded.mem.rom_bank = 7;
        assert!(load_state(&buf, &mut loaded, true, 0));
        assert_eq!(loaded.cpu.pc, 0x1234);
        // A field absent from the file keeps its pre-load value.
        assert_eq!(loaded.mem.rom_bank, 7);
    }

    #[test]
    fn thumbnail_round_trips() {
        let video = vec![0x00FF8040u32; 160 * 144];
        let saved = snapshot();
        let buf = save_state(&saved, 0, Some((&video, 160)));
        let thumb = read_thumbnail(&buf).expect("thumbnail present");
        assert_eq!(thumb.len(), THUMB_WIDTH * THUMB_HEIGHT);
        // A uniform frame box-filters to the same color.
        assert!(thumb.iter().all(|&px| px == 0x00FF8040));

        let buf = save_state(&saved, 0, None);
        assert!(read_thumbnail(&buf).is_none());
        let mut state = SaveState::default();
        assert!(load_state(&buf, &mut state, true, 0));
    }
}
