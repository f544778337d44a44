mod common;

use common::{boot, run_samples, spin_rom};
use dotmatrix_core::cartridge::MbcType;
use dotmatrix_core::gameboy::GameBoy;
use dotmatrix_core::hardware::{LoadError, loadflag};
use tempfile::tempdir;

#[test]
fn pak_info_reflects_the_header() {
    let gb = boot(spin_rom(0x03, 0x02)); // MBC1 + RAM + Battery
    let info = gb.pak_info().expect("loaded").clone();
    assert_eq!(info.mbc, MbcType::Mbc1);
    assert_eq!(info.rom_banks, 2);
    assert_eq!(info.ram_banks, 1);
    assert!(info.header_checksum_ok);
    assert_ne!(info.crc32, 0);
}

#[test]
fn load_failures_report_negative_codes() {
    let mut gb = GameBoy::new();
    let err = gb.load(vec![], 0).unwrap_err();
    assert_eq!(err, LoadError::EmptyImage);
    assert!(err.code() < 0);

    let err = gb.load(vec![0u8; 0x100], 0).unwrap_err();
    assert_eq!(err, LoadError::BadHeader);

    let mut truncated = spin_rom(0x00, 0x00);
    truncated.truncate(0x5000);
    assert_eq!(gb.load(truncated, 0).unwrap_err(), LoadError::BadRomSize);
    assert!(!gb.is_loaded(), "failed loads leave nothing loaded");
}

#[test]
fn battery_ram_persists_across_instances() {
    let dir = tempdir().unwrap();
    let rom = spin_rom(0x03, 0x02);

    {
        let mut gb = GameBoy::new();
        gb.set_save_dir(dir.path());
        gb.load(rom.clone(), loadflag::NO_BIOS).unwrap();
        gb.external_write(0x0000, 0x0A); // enable RAM
        gb.external_write(0xA000, 0xAA);
        gb.external_write(0xA001, 0x55);
        // Dropping the instance flushes the battery RAM.
    }

    let mut gb = GameBoy::new();
    gb.set_save_dir(dir.path());
    gb.load(rom, loadflag::NO_BIOS).unwrap();
    gb.external_write(0x0000, 0x0A);
    assert_eq!(gb.external_read(0xA000), 0xAA);
    assert_eq!(gb.external_read(0xA001), 0x55);
}

#[test]
fn read_only_flag_suppresses_the_implicit_flush() {
    let dir = tempdir().unwrap();
    let rom = spin_rom(0x03, 0x02);

    {
        let mut gb = GameBoy::new();
        gb.set_save_dir(dir.path());
        gb.load(rom.clone(), loadflag::NO_BIOS | loadflag::READONLY_SAV)
            .unwrap();
        gb.external_write(0x0000, 0x0A);
        gb.external_write(0xA000, 0xAA);
    }

    let mut gb = GameBoy::new();
    gb.set_save_dir(dir.path());
    gb.load(rom, loadflag::NO_BIOS).unwrap();
    gb.external_write(0x0000, 0x0A);
    assert_eq!(gb.external_read(0xA000), 0x00, "nothing was flushed");
}

#[test]
fn save_state_slots_round_trip_through_files() {
    let dir = tempdir().unwrap();
    let rom = spin_rom(0x03, 0x02);

    let mut gb = GameBoy::new();
    gb.set_time_mode(true);
    gb.set_save_dir(dir.path());
    gb.load(rom, loadflag::NO_BIOS).unwrap();

    run_samples(&mut gb, 30_000);
    gb.select_state(3);
    assert_eq!(gb.current_state(), 3);
    assert!(gb.save_state_slot(None));

    let regs = gb.get_regs();
    run_samples(&mut gb, 30_000);
    assert!(gb.load_state_slot());
    assert_eq!(gb.get_regs(), regs);

    // Slot names carry the selected number.
    let entries: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(entries.iter().any(|name| name.ends_with("_3.gqs")), "{entries:?}");
}

#[test]
fn select_state_wraps_modulo_ten() {
    let mut gb = GameBoy::new();
    gb.select_state(13);
    assert_eq!(gb.current_state(), 3);
    gb.select_state(-1);
    assert_eq!(gb.current_state(), 9);
}

#[test]
fn bios_crc_is_checked_with_byte_fe_masked() {
    let mut gb = GameBoy::new();
    let mut bios = vec![0u8; 0x100];
    bios[0x00] = 0x31;
    bios[0xFE] = 0x5A; // hardware-variant byte, excluded from the checksum

    let mut masked = bios.clone();
    masked[0xFE] = 0;
    let crc = crc32fast::hash(&masked);

    assert!(gb.load_bios(bios.clone(), 0x100, crc).is_ok());
    assert_eq!(
        gb.load_bios(bios.clone(), 0x200, crc).unwrap_err(),
        LoadError::BadBiosSize
    );
    assert_eq!(
        gb.load_bios(bios, 0x100, crc ^ 1).unwrap_err(),
        LoadError::BadBiosCrc
    );
}

#[test]
fn boot_rom_executes_when_loaded() {
    // A BIOS that writes a marker to WRAM, unmaps itself and parks; the
    // cartridge entry point is never reached.
    let mut bios = vec![0u8; 0x100];
    let program = [
        0x3E, 0x77, // ld a, 0x77
        0xEA, 0x00, 0xC0, // ld (0xC000), a
        0x3E, 0x01, // ld a, 1
        0xE0, 0x50, // ldh (0x50), a  ; unmap boot ROM
        0x18, 0xFE, // jr -2
    ];
    bios[..program.len()].copy_from_slice(&program);

    let mut gb = GameBoy::new();
    gb.set_time_mode(true);
    gb.load_bios(bios, 0, 0).unwrap();
    gb.load(spin_rom(0x00, 0x00), 0).unwrap();

    run_samples(&mut gb, 1_000);
    assert_eq!(gb.external_read(0xC000), 0x77);
    // The overlay is gone; address 0 reads the cartridge again.
    assert_eq!(gb.external_read(0x0000), 0x00);
}
