mod common;

use common::{boot, run_samples, spin_rom};
use dotmatrix_core::gameboy::GameBoy;
use dotmatrix_core::hardware::loadflag;

/// MBC3 + Timer + RAM + Battery cartridge running the spin loop.
fn rtc_rom() -> Vec<u8> {
    let mut rom = spin_rom(0x10, 0x03);
    common::fix_header_checksum(&mut rom);
    rom
}

fn latch(gb: &mut GameBoy) {
    gb.external_write(0x6000, 0x00);
    gb.external_write(0x6000, 0x01);
}

fn read_reg(gb: &mut GameBoy, reg: u8) -> u8 {
    gb.external_write(0x4000, reg);
    gb.external_read(0xA000)
}

fn latched_total_seconds(gb: &mut GameBoy) -> u64 {
    latch(gb);
    let s = read_reg(gb, 0x08) as u64;
    let m = read_reg(gb, 0x09) as u64;
    let h = read_reg(gb, 0x0A) as u64;
    let dl = read_reg(gb, 0x0B) as u64;
    let dh = read_reg(gb, 0x0C) as u64;
    s + m * 60 + h * 3600 + ((dh & 1) << 8 | dl) * 86_400
}

#[test]
fn registers_set_through_the_bus_protocol_read_back() {
    let mut gb = boot(rtc_rom());
    gb.external_write(0x0000, 0x0A); // enable RAM/RTC

    gb.external_write(0x4000, 0x08);
    gb.external_write(0xA000, 12);
    gb.external_write(0x4000, 0x09);
    gb.external_write(0xA000, 34);
    gb.external_write(0x4000, 0x0A);
    gb.external_write(0xA000, 5);

    latch(&mut gb);
    assert_eq!(read_reg(&mut gb, 0x08), 12);
    assert_eq!(read_reg(&mut gb, 0x09), 34);
    assert_eq!(read_reg(&mut gb, 0x0A), 5);
}

#[test]
fn cycle_mode_advances_with_emulated_time_only() {
    let mut gb = boot(rtc_rom()); // cycle-based clock
    gb.external_write(0x0000, 0x0A);

    let before = latched_total_seconds(&mut gb);
    // ~2 emulated seconds: 2^22 dots per second, 2 dots per sample.
    run_samples(&mut gb, 2 * 2_097_152 + 50_000);
    let after = latched_total_seconds(&mut gb);
    assert_eq!(after - before, 2);
}

#[test]
fn wall_mode_latches_are_monotonic() {
    let mut gb = GameBoy::new();
    gb.load(rtc_rom(), loadflag::NO_BIOS).unwrap();
    gb.external_write(0x0000, 0x0A);

    let mut last = latched_total_seconds(&mut gb);
    for _ in 0..5 {
        run_samples(&mut gb, 50_000);
        let now = latched_total_seconds(&mut gb);
        assert!(now >= last, "latched time went backwards");
        last = now;
    }
}

#[test]
fn halt_bit_freezes_the_counter() {
    let mut gb = boot(rtc_rom());
    gb.external_write(0x0000, 0x0A);

    gb.external_write(0x4000, 0x0C);
    gb.external_write(0xA000, 0x40); // halt

    let before = latched_total_seconds(&mut gb);
    run_samples(&mut gb, 3 * 2_097_152);
    let after = latched_total_seconds(&mut gb);
    assert_eq!(before, after);

    gb.external_write(0x4000, 0x0C);
    gb.external_write(0xA000, 0x00); // resume
    run_samples(&mut gb, 2 * 2_097_152 + 50_000);
    assert!(latched_total_seconds(&mut gb) > after);
}

#[test]
fn rtc_regs_introspection_round_trips() {
    let mut gb = boot(rtc_rom());
    gb.external_write(0x0000, 0x0A);
    run_samples(&mut gb, 100_000);

    let mut regs = gb.get_rtc_regs();
    assert_eq!(regs[10], 1, "cycle mode reported");
    regs[0] = 4242;
    gb.set_rtc_regs(&regs);
    let total = latched_total_seconds(&mut gb);
    assert_eq!(total, 4242);
}

#[test]
fn time_mode_switch_preserves_current_time() {
    let mut gb = boot(rtc_rom());
    gb.external_write(0x0000, 0x0A);
    run_samples(&mut gb, 2 * 2_097_152 + 50_000);

    let before = latched_total_seconds(&mut gb);
    gb.set_time_mode(false); // to wall clock
    assert_eq!(latched_total_seconds(&mut gb), before);
    gb.set_time_mode(true); // back to cycles
    run_samples(&mut gb, 2_097_152 + 50_000);
    assert_eq!(latched_total_seconds(&mut gb), before + 1);
}
