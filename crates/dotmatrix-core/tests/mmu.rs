mod common;

use common::{build_rom, spin_rom};
use dotmatrix_core::cartridge::Cartridge;
use dotmatrix_core::mmu::Mmu;

fn load(mmu: &mut Mmu, rom: Vec<u8>) {
    mmu.load_cart(Cartridge::load(rom, false).expect("valid rom"));
}

#[test]
fn wram_echo_and_bank_switch() {
    let mut mmu = Mmu::new_with_mode(true);
    mmu.write_byte(0xC000, 0xAA);
    assert_eq!(mmu.read_byte(0xC000), 0xAA);
    mmu.write_byte(0xE000, 0xBB);
    assert_eq!(mmu.read_byte(0xC000), 0xBB);

    mmu.write_byte(0xFF70, 0x02);
    mmu.write_byte(0xD000, 0xCC);
    assert_eq!(mmu.read_byte(0xD000), 0xCC);

    mmu.write_byte(0xFF70, 0x03);
    assert_eq!(mmu.read_byte(0xD000), 0x00);
    mmu.write_byte(0xD000, 0xDD);
    assert_eq!(mmu.read_byte(0xD000), 0xDD);

    mmu.write_byte(0xFF70, 0x02);
    assert_eq!(mmu.read_byte(0xD000), 0xCC);
}

#[test]
fn vram_bank_switch() {
    let mut mmu = Mmu::new_with_mode(true);
    mmu.write_byte(0x8000, 0x11);
    assert_eq!(mmu.read_byte(0x8000), 0x11);

    mmu.write_byte(0xFF4F, 0x01);
    assert_eq!(mmu.read_byte(0x8000), 0x00);
    mmu.write_byte(0x8000, 0x22);
    assert_eq!(mmu.read_byte(0x8000), 0x22);

    mmu.write_byte(0xFF4F, 0x00);
    assert_eq!(mmu.read_byte(0x8000), 0x11);
}

#[test]
fn bios_overlay_and_header_carve_out() {
    let mut rom = spin_rom(0x00, 0x00);
    rom[0x0000] = 0xC0;
    rom[0x00FF] = 0xC1;
    rom[0x0150] = 0xC2;
    common::fix_header_checksum(&mut rom);
    let header_byte = rom[0x0140];

    let mut mmu = Mmu::new();
    load(&mut mmu, rom);
    let mut bios = vec![0xA0u8; 0x100];
    bios[0xFF] = 0xA1;
    mmu.load_bios(bios);

    // Overlay active below the BIOS size...
    assert_eq!(mmu.read_byte(0x0000), 0xA0);
    assert_eq!(mmu.read_byte(0x00FF), 0xA1);
    // ...with the cartridge header window carved out...
    assert_eq!(mmu.read_byte(0x0140), header_byte);
    // ...and the cartridge visible beyond the image.
    assert_eq!(mmu.read_byte(0x0150), 0xC2);

    // Writing the unmap register reveals the cartridge everywhere.
    mmu.write_byte(0xFF50, 0x01);
    assert_eq!(mmu.read_byte(0x0000), 0xC0);
    assert_eq!(mmu.read_byte(0x00FF), 0xC1);
}

#[test]
fn oam_dma_transfer_with_initial_delay() {
    let mut mmu = Mmu::new();
    for i in 0..0xA0u16 {
        mmu.write_byte(0x8000 + i, i as u8);
    }
    mmu.write_byte(0xFF46, 0x80); // copy from 0x8000
    // First two M-cycles are setup.
    mmu.dma_step(8);
    assert_eq!(mmu.ppu.oam[0x9F], 0x00);
    mmu.dma_step(640);
    assert_eq!(mmu.ppu.oam[0], 0x00);
    assert_eq!(mmu.ppu.oam[0x9F], 0x9F);
}

#[test]
fn vram_oam_blocked_by_ppu_mode() {
    let mut mmu = Mmu::new();
    mmu.write_byte(0xFF40, 0x80);
    mmu.ppu.mode = 3;
    mmu.write_byte(0x8000, 0x12);
    assert_eq!(mmu.read_byte(0x8000), 0xFF);
    mmu.ppu.mode = 0;
    mmu.write_byte(0x8000, 0x34);
    assert_eq!(mmu.read_byte(0x8000), 0x34);

    mmu.ppu.mode = 2;
    mmu.write_byte(0xFE00, 0x56);
    assert_eq!(mmu.read_byte(0xFE00), 0xFF);
    mmu.ppu.mode = 0;
    mmu.write_byte(0xFE00, 0x56);
    assert_eq!(mmu.read_byte(0xFE00), 0x56);
}

#[test]
fn disabled_cart_ram_reads_the_floating_bus() {
    // MBC1 + RAM, RAM left disabled.
    let rom = build_rom(0x03, 0, 0x02, &[0x18, 0xFE]);
    let mut mmu = Mmu::new();
    load(&mut mmu, rom);

    // The write drives the bus even though nothing latches it.
    mmu.write_byte(0xA000, 0x42);
    // Within the pull-up window the bus still holds the value.
    mmu.tick(1);
    assert_eq!(mmu.read_byte(0xA000), 0x42);

    // Far past the pull-up window the bus has floated to 0xFF.
    for _ in 0..4 {
        mmu.tick(625);
    }
    assert_eq!(mmu.read_byte(0xA000), 0xFF);
}

#[test]
fn pull_up_time_is_configurable() {
    let rom = build_rom(0x03, 0, 0x02, &[0x18, 0xFE]);
    let mut mmu = Mmu::new();
    load(&mut mmu, rom);
    mmu.set_cart_bus_pull_up_time(16);

    mmu.write_byte(0xA000, 0x55);
    mmu.tick(2); // 8 dots, inside the window
    assert_eq!(mmu.read_byte(0xA000), 0x55);
    mmu.tick(4); // 24 dots total, beyond it
    assert_eq!(mmu.read_byte(0xA000), 0xFF);
}

#[test]
fn mbc2_high_nibble_floats() {
    let rom = build_rom(0x06, 0, 0x00, &[0x18, 0xFE]);
    let mut mmu = Mmu::new();
    load(&mut mmu, rom);

    mmu.write_byte(0x0000, 0x0A); // enable internal RAM
    mmu.write_byte(0xA000, 0x05);
    // Past the pull-up window only the driven low nibble remains.
    for _ in 0..4 {
        mmu.tick(625);
    }
    assert_eq!(mmu.read_byte(0xA000), 0xF5);
}

#[test]
fn rom_reads_keep_the_bus_driven() {
    let rom = build_rom(0x03, 0, 0x02, &[0x18, 0xFE]);
    let mut mmu = Mmu::new();
    load(&mut mmu, rom);

    for _ in 0..4 {
        mmu.tick(625);
    }
    // A ROM read drives the bus; the disabled-RAM window then reads it back.
    let byte = mmu.read_byte(0x0100);
    assert_eq!(mmu.read_byte(0xA000), byte);
}

#[test]
fn hdma_wait_loop_observes_idle_ff55() {
    let mut mmu = Mmu::new_with_mode(true);
    mmu.write_byte(0xFF40, 0x80);

    for (i, byte) in (0xC000..0xC010u16).enumerate() {
        mmu.write_byte(byte, i as u8);
    }

    mmu.write_byte(0xFF51, 0xC0);
    mmu.write_byte(0xFF52, 0x00);
    mmu.write_byte(0xFF53, 0x80);
    mmu.write_byte(0xFF54, 0x00);

    // One 16-byte H-Blank block.
    mmu.write_byte(0xFF55, 0x80);
    assert_ne!(
        mmu.read_byte(0xFF55),
        0xFF,
        "HDMA should report busy immediately after start"
    );

    mmu.hdma_hblank_transfer();
    assert_eq!(mmu.read_byte(0xFF55), 0xFF);
    assert_eq!(mmu.read_byte(0x8000), 0x00);
    assert_eq!(mmu.read_byte(0x800F), 0x0F);
}

#[test]
fn gdma_copies_immediately() {
    let mut mmu = Mmu::new_with_mode(true);
    for (i, byte) in (0xC000..0xC020u16).enumerate() {
        mmu.write_byte(byte, (i + 1) as u8);
    }
    mmu.write_byte(0xFF51, 0xC0);
    mmu.write_byte(0xFF52, 0x00);
    mmu.write_byte(0xFF53, 0x80);
    mmu.write_byte(0xFF54, 0x00);
    mmu.write_byte(0xFF55, 0x01); // two blocks, general DMA
    assert_eq!(mmu.read_byte(0x8000), 0x01);
    assert_eq!(mmu.read_byte(0x801F), 0x20);
    assert!(mmu.gdma_active());
}

#[test]
fn unmapped_io_reads_open_bus() {
    let mut mmu = Mmu::new();
    assert_eq!(mmu.read_byte(0xFEA0), 0xFF);
    assert_eq!(mmu.read_byte(0xFF7F), 0xFF);
    // CGB-only registers read 0xFF in DMG mode.
    assert_eq!(mmu.read_byte(0xFF4D), 0xFF);
    assert_eq!(mmu.read_byte(0xFF70), 0xFF);
}

#[test]
fn read_write_callbacks_fire_before_access() {
    use std::sync::{Arc, Mutex};

    let mut mmu = Mmu::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let reads = Arc::clone(&log);
    mmu.set_read_callback(Some(Box::new(move |addr, cc| {
        reads.lock().unwrap().push(("r", addr, cc));
    })));
    let writes = Arc::clone(&log);
    mmu.set_write_callback(Some(Box::new(move |addr, cc| {
        writes.lock().unwrap().push(("w", addr, cc));
    })));

    mmu.write_byte(0xC123, 0x99);
    let _ = mmu.read_byte(0xC123);

    let log = log.lock().unwrap();
    assert_eq!(log.as_slice(), &[("w", 0xC123, 0), ("r", 0xC123, 0)]);
}
