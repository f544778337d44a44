mod common;

use common::{boot, build_rom, run_samples, spin_rom};
use dotmatrix_core::breakpoints::Breakpoint;
use dotmatrix_core::gameboy::{GameBoy, SAMPLES_PER_FRAME};
use dotmatrix_core::hardware::loadflag;
use dotmatrix_core::joypad::InputSource;

const FRAME_PIXELS: usize = 160 * 144;

/// A ROM that makes some noise and scrolls the background, so output streams
/// are not trivially constant.
fn noisy_rom() -> Vec<u8> {
    build_rom(
        0x00,
        0,
        0,
        &[
            0x3E, 0xF0, // ld a, 0xF0
            0xE0, 0x12, // ldh (NR12), a      ; full volume
            0x3E, 0x83, // ld a, 0x83
            0xE0, 0x13, // ldh (NR13), a
            0x3E, 0x87, // ld a, 0x87
            0xE0, 0x14, // ldh (NR14), a      ; trigger channel 1
            0xF0, 0x42, // ldh a, (SCY)
            0x3C, // inc a
            0xE0, 0x42, // ldh (SCY), a
            0x18, 0xF9, // jr back to the SCY read
        ],
    )
}

#[test]
fn cold_boot_without_bios_matches_post_boot_defaults() {
    let mut gb = boot(spin_rom(0x00, 0x00));
    let regs = gb.get_regs();
    // [pc, sp, a, b, c, d, e, f, h, l]
    assert_eq!(regs[0], 0x0100);
    assert_eq!(regs[1], 0xFFFE);
    assert_eq!(regs[2], 0x01);
    assert_eq!(regs[7], 0xB0);
    assert_eq!(regs[8], 0x01);
    assert_eq!(regs[9], 0x4D);
    assert!(!gb.is_cgb());

    // Post-boot PPU and APU register state.
    assert_eq!(gb.external_read(0xFF40), 0x91);
    assert_eq!(gb.external_read(0xFF47), 0xFC);
    assert_eq!(gb.external_read(0xFF26) & 0x80, 0x80);

    // A CGB-flagged header boots in CGB mode with the CGB accumulator.
    let mut rom = spin_rom(0x00, 0x00);
    rom[0x0143] = 0x80;
    common::fix_header_checksum(&mut rom);
    let gb = boot(rom);
    assert!(gb.is_cgb());
    assert_eq!(gb.get_regs()[2], 0x11);
}

#[test]
fn gba_variant_boots_with_b_set() {
    let mut rom = spin_rom(0x00, 0x00);
    rom[0x0143] = 0x80;
    common::fix_header_checksum(&mut rom);
    let gb = common::boot_with_flags(rom, loadflag::GBA_FLAG);
    assert_eq!(gb.get_regs()[3], 0x01);
}

#[test]
fn frames_complete_every_35112_samples() {
    let mut gb = boot(spin_rom(0x00, 0x00));
    let mut video = vec![0u32; FRAME_PIXELS];
    let mut audio = vec![0u32; 40000];

    let mut totals = Vec::new();
    let mut total = 0usize;
    while totals.len() < 3 {
        let mut n = 40000;
        let offset = gb.run_for(Some(&mut video), 160, &mut audio, &mut n);
        if offset >= 0 {
            totals.push(total + offset as usize);
        }
        total += n;
    }

    assert_eq!(totals[1] - totals[0], SAMPLES_PER_FRAME);
    assert_eq!(totals[2] - totals[1], SAMPLES_PER_FRAME);
}

#[test]
fn null_video_buffer_skips_pixel_output() {
    let mut gb = boot(spin_rom(0x00, 0x00));
    let mut audio = vec![0u32; 40000];
    let mut n = 40000;
    let offset = gb.run_for(None, 0, &mut audio, &mut n);
    assert!(offset >= 0, "a frame still completes without video output");
}

#[test]
fn determinism_two_cold_boots_produce_identical_streams() {
    let run = || {
        let mut gb = boot(noisy_rom());
        let mut video = vec![0u32; FRAME_PIXELS];
        let mut audio_all = Vec::new();
        let mut audio = vec![0u32; 40000];
        for _ in 0..6 {
            let mut n = 40000;
            gb.run_for(Some(&mut video), 160, &mut audio, &mut n);
            audio_all.extend_from_slice(&audio[..n]);
        }
        (video, audio_all)
    };

    let (video_a, audio_a) = run();
    let (video_b, audio_b) = run();
    assert_eq!(video_a, video_b);
    assert_eq!(audio_a, audio_b);
    assert!(audio_a.iter().any(|&s| s != 0), "audio is not silent");
}

#[test]
fn save_then_load_is_behaviorally_invisible() {
    let mut gb = boot(noisy_rom());
    run_samples(&mut gb, 50_000);

    let snapshot = gb.save_state_buf(None).expect("state saved");

    let run_on = |gb: &mut GameBoy| {
        let mut video = vec![0u32; FRAME_PIXELS];
        let mut audio_all = Vec::new();
        let mut audio = vec![0u32; 40000];
        for _ in 0..4 {
            let mut n = 40000;
            gb.run_for(Some(&mut video), 160, &mut audio, &mut n);
            audio_all.extend_from_slice(&audio[..n]);
        }
        (video, audio_all)
    };

    let (video_a, audio_a) = run_on(&mut gb);

    assert!(gb.load_state_buf(&snapshot));
    let (video_b, audio_b) = run_on(&mut gb);

    assert_eq!(audio_a, audio_b);
    assert_eq!(video_a, video_b);
}

#[test]
fn save_state_rejection_leaves_state_untouched() {
    let mut gb = boot(noisy_rom());
    run_samples(&mut gb, 10_000);

    let good = gb.save_state_buf(None).expect("state saved");
    let regs_before = gb.get_regs();
    let probe_before = gb.external_read(0xC000);

    let mut bad_sentinel = good.clone();
    bad_sentinel[0] = 0x00;
    assert!(!gb.load_state_buf(&bad_sentinel));

    let mut bad_version = good.clone();
    bad_version[1] = bad_version[1].wrapping_add(1);
    assert!(!gb.load_state_buf(&bad_version));

    assert_eq!(gb.get_regs(), regs_before);
    assert_eq!(gb.external_read(0xC000), probe_before);
}

#[test]
fn strict_load_rejects_mode_mismatch() {
    let mut dmg = boot(spin_rom(0x00, 0x00));
    let state = dmg.save_state_buf(None).expect("saved");

    let mut rom = spin_rom(0x00, 0x00);
    rom[0x0143] = 0x80;
    common::fix_header_checksum(&mut rom);
    let mut cgb = boot(rom);
    assert!(!cgb.load_state_buf(&state));
}

#[test]
fn halt_bug_runs_following_instruction_twice() {
    let code = [
        0xF3, // di
        0x3E, 0x04, // ld a, 4 (timer interrupt bit)
        0xE0, 0xFF, // ldh (IE), a
        0xE0, 0x0F, // ldh (IF), a  ; pending but masked
        0x76, // halt             ; IME=0, pending -> halt bug
        0x04, // inc b            ; fetched twice
        0x18, 0xFE, // jr -2
    ];
    let mut gb = boot(build_rom(0x00, 0, 0, &code));
    run_samples(&mut gb, 2_000);
    assert_eq!(gb.get_regs()[3], 2, "inc b executed exactly twice");
}

#[test]
fn halt_wakes_on_enabled_interrupt() {
    // IME=1 via ei; vblank interrupt vector at 0x40 increments c and
    // returns; the main loop halts and counts wakeups in b.
    let mut rom = build_rom(
        0x00,
        0,
        0,
        &[
            0x06, 0x00, // ld b, 0
            0x0E, 0x00, // ld c, 0
            0xAF, // xor a
            0xE0, 0x0F, // ldh (IF), a   ; clear the boot-time pending bits
            0x3E, 0x01, // ld a, 1
            0xE0, 0xFF, // ldh (IE), a   ; enable vblank
            0xFB, // ei
            0x00, // nop
            0x76, // halt
            0x04, // inc b
            0x18, 0xFC, // jr -4 (back to halt)
        ],
    );
    // RST 0x40 handler: inc c; reti
    rom[0x40] = 0x0C;
    rom[0x41] = 0xD9;
    common::fix_header_checksum(&mut rom);

    let mut gb = boot(rom);
    run_samples(&mut gb, SAMPLES_PER_FRAME * 3);
    let regs = gb.get_regs();
    assert!(regs[4] >= 2, "vblank handler ran (c = {})", regs[4]);
    assert_eq!(regs[3], regs[4], "one wakeup per vblank");
}

#[test]
fn breakpoint_stops_before_instruction_and_resumes() {
    let mut gb = boot(spin_rom(0x00, 0x00));
    gb.set_breakpoints(vec![Breakpoint {
        addr: 0x0100,
        bank: None,
    }]);

    let mut audio = vec![0u32; 4000];
    let mut n = 4000;
    gb.run_for(None, 0, &mut audio, &mut n);
    assert_eq!(gb.hit_address(), Some(0x0100));
    assert_eq!(gb.get_regs()[0], 0x0100, "stopped before the instruction");

    // Resuming executes past the breakpoint; the spin loop jumps back to
    // 0x0100 and hits again.
    let mut n = 4000;
    gb.run_for(None, 0, &mut audio, &mut n);
    assert_eq!(gb.hit_address(), Some(0x0100));
}

#[test]
fn input_source_is_polled_and_visible_to_reads() {
    struct HoldStart;
    impl InputSource for HoldStart {
        fn poll(&mut self) -> u8 {
            dotmatrix_core::joypad::button::START
        }
    }

    let mut gb = boot(spin_rom(0x00, 0x00));
    gb.set_input_source(Box::new(HoldStart));
    gb.external_write(0xFF00, 0x10); // select button lines
    run_samples(&mut gb, SAMPLES_PER_FRAME + 1000);
    assert_eq!(gb.external_read(0xFF00) & 0x0F, 0x07, "START line low");
}

#[test]
fn layer_masking_blanks_background() {
    use dotmatrix_core::hardware::LAYER_MASK_BG;

    let mut fill_vram = vec![
        0x3E, 0xFF, // ld a, 0xFF
        0x21, 0x00, 0x80, // ld hl, 0x8000
    ];
    // A small unrolled fill is enough for tile 0.
    for _ in 0..16 {
        fill_vram.extend_from_slice(&[0x22]); // ldi (hl), a
    }
    fill_vram.extend_from_slice(&[0x18, 0xFE]); // jr -2

    let run = |mask: u8| {
        let mut gb = boot(build_rom(0x00, 0, 0, &fill_vram));
        gb.set_layers(mask);
        let mut video = vec![0u32; FRAME_PIXELS];
        let mut audio = vec![0u32; 40000];
        for _ in 0..3 {
            let mut n = 40000;
            gb.run_for(Some(&mut video), 160, &mut audio, &mut n);
        }
        video
    };

    let with_bg = run(0x07);
    let without_bg = run(0x07 & !LAYER_MASK_BG);
    assert_ne!(with_bg, without_bg);
    // With the BG suppressed every pixel shows shade 0.
    let blank = without_bg[0];
    assert!(without_bg.iter().all(|&px| px == blank));
}
