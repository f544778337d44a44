#![allow(dead_code)]

use dotmatrix_core::gameboy::GameBoy;
use dotmatrix_core::hardware::loadflag;

/// Build a ROM image with a valid header and `code` placed at the 0x0100
/// entry point.
pub fn build_rom(cart_type: u8, rom_code: u8, ram_code: u8, code: &[u8]) -> Vec<u8> {
    let banks = 2usize << rom_code;
    let mut rom = vec![0u8; banks * 0x4000];
    rom[0x0147] = cart_type;
    rom[0x0148] = rom_code;
    rom[0x0149] = ram_code;
    rom[0x0100..0x0100 + code.len()].copy_from_slice(code);
    fix_header_checksum(&mut rom);
    rom
}

pub fn fix_header_checksum(rom: &mut [u8]) {
    let mut x = 0u8;
    for &b in &rom[0x0134..0x014D] {
        x = x.wrapping_sub(b).wrapping_sub(1);
    }
    rom[0x014D] = x;
}

/// A ROM that parks the CPU in a two-byte spin loop.
pub fn spin_rom(cart_type: u8, ram_code: u8) -> Vec<u8> {
    build_rom(cart_type, 0, ram_code, &[0x18, 0xFE]) // jr -2
}

/// Cold-boot a GameBoy with the post-boot state synthesized (no BIOS) and
/// the deterministic cycle-based clock.
pub fn boot(rom: Vec<u8>) -> GameBoy {
    boot_with_flags(rom, loadflag::NO_BIOS)
}

pub fn boot_with_flags(rom: Vec<u8>, flags: u32) -> GameBoy {
    let mut gb = GameBoy::new();
    gb.set_time_mode(true);
    gb.load(rom, flags | loadflag::NO_BIOS).expect("load rom");
    gb
}

/// Run for roughly `samples` stereo samples, discarding output.
pub fn run_samples(gb: &mut GameBoy, samples: usize) {
    let mut remaining = samples;
    let mut audio = vec![0u32; samples.min(0x10000)];
    while remaining > 0 {
        let mut n = remaining.min(audio.len());
        gb.run_for(None, 0, &mut audio, &mut n);
        if n == 0 {
            break;
        }
        remaining = remaining.saturating_sub(n);
    }
}
