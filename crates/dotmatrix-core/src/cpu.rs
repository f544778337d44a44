use log::warn;

use crate::breakpoints::BreakpointEngine;
use crate::events::Interrupts;
use crate::mmu::Mmu;

// CPU flag bits
const FLAG_Z: u8 = 0x80; // Zero
const FLAG_N: u8 = 0x40; // Subtract
const FLAG_H: u8 = 0x20; // Half Carry
const FLAG_C: u8 = 0x10; // Carry

// Interrupt vectors
const INTERRUPT_VBLANK: u16 = 0x40;
const INTERRUPT_STAT: u16 = 0x48;
const INTERRUPT_TIMER: u16 = 0x50;
const INTERRUPT_SERIAL: u16 = 0x58;
const INTERRUPT_JOYPAD: u16 = 0x60;

// Post-boot CPU state
const BOOT_PC: u16 = 0x0100;
const BOOT_SP: u16 = 0xFFFE;

// M-cycles the CPU stays occupied during a STOP speed switch.
const SPEED_SWITCH_STALL_M_CYCLES: u32 = 2050;

pub struct Cpu {
    pub a: u8,
    pub f: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub pc: u16,
    pub sp: u16,
    pub irq: Interrupts,
    pub double_speed: bool,
    pub breakpoints: BreakpointEngine,
}

impl Cpu {
    /// Power-on state for running a boot ROM: registers neutral, PC at 0.
    pub fn new_power_on() -> Self {
        Self {
            a: 0,
            f: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            pc: 0x0000,
            sp: 0x0000,
            irq: Interrupts::new(),
            double_speed: false,
            breakpoints: BreakpointEngine::default(),
        }
    }

    /// Post-boot register state for the selected hardware mode, used when the
    /// boot ROM is skipped. `gba` selects the GBA-on-CGB register variant.
    pub fn new_post_boot(cgb: bool, gba: bool) -> Self {
        let (a, f, b, c, d, e, h, l) = if cgb {
            if gba {
                (0x11, 0x00, 0x01, 0x00, 0x00, 0x08, 0x00, 0x7C)
            } else {
                (0x11, 0x80, 0x00, 0x00, 0x00, 0x08, 0x00, 0x7C)
            }
        } else {
            (0x01, 0xB0, 0x00, 0x13, 0x00, 0xD8, 0x01, 0x4D)
        };
        Self {
            a,
            f,
            b,
            c,
            d,
            e,
            h,
            l,
            pc: BOOT_PC,
            sp: BOOT_SP,
            irq: Interrupts::new(),
            double_speed: false,
            breakpoints: BreakpointEngine::default(),
        }
    }

    fn get_bc(&self) -> u16 {
        ((self.b as u16) << 8) | self.c as u16
    }

    fn set_bc(&mut self, val: u16) {
        self.b = (val >> 8) as u8;
        self.c = val as u8;
    }

    fn get_de(&self) -> u16 {
        ((self.d as u16) << 8) | self.e as u16
    }

    fn set_de(&mut self, val: u16) {
        self.d = (val >> 8) as u8;
        self.e = val as u8;
    }

    pub fn get_hl(&self) -> u16 {
        ((self.h as u16) << 8) | self.l as u16
    }

    fn set_hl(&mut self, val: u16) {
        self.h = (val >> 8) as u8;
        self.l = val as u8;
    }

    fn next_interrupt(pending: u8) -> (u8, u16) {
        if pending & 0x01 != 0 {
            (0x01, INTERRUPT_VBLANK)
        } else if pending & 0x02 != 0 {
            (0x02, INTERRUPT_STAT)
        } else if pending & 0x04 != 0 {
            (0x04, INTERRUPT_TIMER)
        } else if pending & 0x08 != 0 {
            (0x08, INTERRUPT_SERIAL)
        } else {
            (0x10, INTERRUPT_JOYPAD)
        }
    }

    #[inline]
    fn tick(&mut self, mmu: &mut Mmu, m_cycles: u32) {
        mmu.tick(m_cycles);
    }

    #[inline(always)]
    fn fetch8(&mut self, mmu: &mut Mmu) -> u8 {
        mmu.last_cpu_pc = Some(self.pc);
        let val = mmu.fetch_byte(self.pc, false);
        self.pc = self.pc.wrapping_add(1);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn fetch_opcode(&mut self, mmu: &mut Mmu, advance_pc: bool) -> u8 {
        mmu.last_cpu_pc = Some(self.pc);
        let val = mmu.fetch_byte(self.pc, true);
        if advance_pc {
            self.pc = self.pc.wrapping_add(1);
        }
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn fetch16(&mut self, mmu: &mut Mmu) -> u16 {
        let lo = self.fetch8(mmu) as u16;
        let hi = self.fetch8(mmu) as u16;
        (hi << 8) | lo
    }

    #[inline(always)]
    fn read8(&mut self, mmu: &mut Mmu, addr: u16) -> u8 {
        mmu.last_cpu_pc = Some(self.pc);
        let val = mmu.read_byte(addr);
        self.tick(mmu, 1);
        val
    }

    #[inline(always)]
    fn write8(&mut self, mmu: &mut Mmu, addr: u16, val: u8) {
        mmu.last_cpu_pc = Some(self.pc);
        mmu.write_byte(addr, val);
        self.tick(mmu, 1);
    }

    fn push_stack(&mut self, mmu: &mut Mmu, val: u16) {
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, (val >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        self.write8(mmu, self.sp, val as u8);
    }

    fn pop_stack(&mut self, mmu: &mut Mmu) -> u16 {
        let lo = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let hi = self.read8(mmu, self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (hi << 8) | lo
    }

    /// Read the register selected by the 3-bit operand encoding; index 6 is
    /// the (HL) memory operand and charges its cycle.
    fn read_reg(&mut self, mmu: &mut Mmu, index: u8) -> u8 {
        match index {
            0 => self.b,
            1 => self.c,
            2 => self.d,
            3 => self.e,
            4 => self.h,
            5 => self.l,
            6 => self.read8(mmu, self.get_hl()),
            7 => self.a,
            _ => unreachable!(),
        }
    }

    fn write_reg(&mut self, mmu: &mut Mmu, index: u8, val: u8) {
        match index {
            0 => self.b = val,
            1 => self.c = val,
            2 => self.d = val,
            3 => self.e = val,
            4 => self.h = val,
            5 => self.l = val,
            6 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, val);
            }
            7 => self.a = val,
            _ => unreachable!(),
        }
    }

    // ---- ALU helpers ----

    fn alu_add(&mut self, val: u8, with_carry: bool) {
        let carry_in = if with_carry && self.f & FLAG_C != 0 { 1 } else { 0 };
        let (r1, c1) = self.a.overflowing_add(val);
        let (res, c2) = r1.overflowing_add(carry_in);
        self.f = if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) + (val & 0x0F) + carry_in > 0x0F {
                FLAG_H
            } else {
                0
            }
            | if c1 || c2 { FLAG_C } else { 0 };
        self.a = res;
    }

    fn alu_sub(&mut self, val: u8, with_carry: bool, store: bool) {
        let carry_in = if with_carry && self.f & FLAG_C != 0 { 1 } else { 0 };
        let (r1, b1) = self.a.overflowing_sub(val);
        let (res, b2) = r1.overflowing_sub(carry_in);
        self.f = FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if (self.a & 0x0F) < (val & 0x0F) + carry_in {
                FLAG_H
            } else {
                0
            }
            | if b1 || b2 { FLAG_C } else { 0 };
        if store {
            self.a = res;
        }
    }

    fn alu_and(&mut self, val: u8) {
        self.a &= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 } | FLAG_H;
    }

    fn alu_xor(&mut self, val: u8) {
        self.a ^= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 };
    }

    fn alu_or(&mut self, val: u8) {
        self.a |= val;
        self.f = if self.a == 0 { FLAG_Z } else { 0 };
    }

    fn alu_inc8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_add(1);
        self.f = (self.f & FLAG_C)
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0x0F { FLAG_H } else { 0 };
        res
    }

    fn alu_dec8(&mut self, val: u8) -> u8 {
        let res = val.wrapping_sub(1);
        self.f = (self.f & FLAG_C)
            | FLAG_N
            | if res == 0 { FLAG_Z } else { 0 }
            | if val & 0x0F == 0 { FLAG_H } else { 0 };
        res
    }

    fn alu_add_hl(&mut self, mmu: &mut Mmu, val: u16) {
        let hl = self.get_hl();
        let res = hl.wrapping_add(val);
        self.f = (self.f & FLAG_Z)
            | if ((hl & 0x0FFF) + (val & 0x0FFF)) & 0x1000 != 0 {
                FLAG_H
            } else {
                0
            }
            | if (hl as u32 + val as u32) > 0xFFFF {
                FLAG_C
            } else {
                0
            };
        self.set_hl(res);
        self.tick(mmu, 1);
    }

    /// SP + signed immediate, shared by ADD SP,r8 and LD HL,SP+r8.
    fn sp_plus_signed(&mut self, val: u8) -> u16 {
        let val = val as i8 as i16 as u16;
        let sp = self.sp;
        self.f = if ((sp & 0xF) + (val & 0xF)) > 0xF {
            FLAG_H
        } else {
            0
        } | if ((sp & 0xFF) + (val & 0xFF)) > 0xFF {
            FLAG_C
        } else {
            0
        };
        sp.wrapping_add(val)
    }

    fn condition(&self, index: u8) -> bool {
        match index {
            0 => self.f & FLAG_Z == 0,
            1 => self.f & FLAG_Z != 0,
            2 => self.f & FLAG_C == 0,
            _ => self.f & FLAG_C != 0,
        }
    }

    fn handle_cb(&mut self, opcode: u8, mmu: &mut Mmu) {
        let r = opcode & 0x07;
        match opcode {
            0x00..=0x07 => {
                let val = self.read_reg(mmu, r);
                let res = val.rotate_left(1);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x08..=0x0F => {
                let val = self.read_reg(mmu, r);
                let res = val.rotate_right(1);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x10..=0x17 => {
                let val = self.read_reg(mmu, r);
                let carry_in = if self.f & FLAG_C != 0 { 1 } else { 0 };
                let res = (val << 1) | carry_in;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x18..=0x1F => {
                let val = self.read_reg(mmu, r);
                let carry_in = if self.f & FLAG_C != 0 { 0x80 } else { 0 };
                let res = (val >> 1) | carry_in;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x20..=0x27 => {
                let val = self.read_reg(mmu, r);
                let res = val << 1;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x80 != 0 { FLAG_C } else { 0 };
            }
            0x28..=0x2F => {
                let val = self.read_reg(mmu, r);
                let res = (val >> 1) | (val & 0x80);
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x30..=0x37 => {
                let val = self.read_reg(mmu, r);
                let res = val.rotate_left(4);
                self.write_reg(mmu, r, res);
                self.f = if res == 0 { FLAG_Z } else { 0 };
            }
            0x38..=0x3F => {
                let val = self.read_reg(mmu, r);
                let res = val >> 1;
                self.write_reg(mmu, r, res);
                self.f =
                    if res == 0 { FLAG_Z } else { 0 } | if val & 0x01 != 0 { FLAG_C } else { 0 };
            }
            0x40..=0x7F => {
                let bit = (opcode - 0x40) >> 3;
                let val = self.read_reg(mmu, r);
                self.f =
                    (self.f & FLAG_C) | FLAG_H | if val & (1 << bit) == 0 { FLAG_Z } else { 0 };
            }
            0x80..=0xBF => {
                let bit = (opcode - 0x80) >> 3;
                let val = self.read_reg(mmu, r) & !(1 << bit);
                self.write_reg(mmu, r, val);
            }
            0xC0..=0xFF => {
                let bit = (opcode - 0xC0) >> 3;
                let val = self.read_reg(mmu, r) | (1 << bit);
                self.write_reg(mmu, r, val);
            }
        }
    }

    fn handle_interrupts(&mut self, mmu: &mut Mmu) {
        let pending = (mmu.if_reg & mmu.ie_reg) & 0x1F;
        if pending == 0 {
            return;
        }

        if self.irq.ime {
            let (initial_bit, _) = Self::next_interrupt(pending);
            let mut return_pc = self.pc;

            if let Some(halt_pc) = self.irq.halt_pc {
                if (self.irq.halt_pending & initial_bit) != 0 {
                    return_pc = halt_pc.wrapping_sub(1);
                } else if self.irq.halted {
                    return_pc = halt_pc;
                }
            }

            self.irq.ime = false;

            // Interrupt entry pushes the return address. If the upper-byte
            // push lands on IE ($FFFF), the write can change which interrupt
            // is dispatched or cancel dispatch entirely; re-check between
            // the two pushes to match hardware.
            self.sp = self.sp.wrapping_sub(1);
            self.write8(mmu, self.sp, (return_pc >> 8) as u8);

            let queue = (mmu.ie_reg & mmu.if_reg) & 0x1F;
            if queue == 0 {
                // Lower byte push still occurs, but dispatch is cancelled.
                self.sp = self.sp.wrapping_sub(1);
                self.write8(mmu, self.sp, return_pc as u8);

                self.irq.unhalt();
                self.pc = 0;
                self.tick(mmu, 3);
                return;
            }

            let (bit, vector) = Self::next_interrupt(queue);
            mmu.if_reg &= !bit;

            self.sp = self.sp.wrapping_sub(1);
            self.write8(mmu, self.sp, return_pc as u8);

            if (self.irq.halt_pending & bit) != 0 {
                self.irq.halt_pending &= !bit;
            } else {
                self.irq.unhalt();
            }

            self.pc = vector;
            self.tick(mmu, 3);
        } else if self.irq.halted {
            self.irq.unhalt();
        }
    }

    /// Execute one instruction (or service one halted/stalled machine
    /// cycle). Returns false when a breakpoint stopped execution before the
    /// instruction ran.
    pub fn step(&mut self, mmu: &mut Mmu) -> bool {
        if self.irq.stopped {
            // A joypad line going low releases STOP.
            if mmu.if_reg & 0x10 != 0 {
                self.irq.stopped = false;
            } else {
                self.tick(mmu, 1);
                return true;
            }
        }
        if mmu.gdma_active() {
            mmu.gdma_step(1);
            self.tick(mmu, 1);
            return true;
        }

        if self.irq.halted {
            self.tick(mmu, 1);
            self.handle_interrupts(mmu);
            return true;
        }

        if !self.breakpoints.is_empty() {
            let bank = mmu.cart.as_ref().map(|c| c.cur_rom_bank()).unwrap_or(0);
            if self.breakpoints.note_exec(self.pc, bank) {
                return false;
            }
        }

        let enable_after = self.irq.ei_delay_armed();
        let opcode = if self.irq.halt_bug {
            // Halt bug: the byte after HALT is fetched twice.
            self.irq.halt_bug = false;
            self.fetch_opcode(mmu, false)
        } else {
            self.fetch_opcode(mmu, true)
        };

        self.execute(opcode, mmu);

        self.irq.step_ei_delay(enable_after);
        if !self.breakpoints.is_empty() {
            self.breakpoints.note_retired();
        }
        self.handle_interrupts(mmu);
        true
    }

    fn execute(&mut self, opcode: u8, mmu: &mut Mmu) {
        match opcode {
            0x00 => {}
            0x01 => {
                let val = self.fetch16(mmu);
                self.set_bc(val);
            }
            0x11 => {
                let val = self.fetch16(mmu);
                self.set_de(val);
            }
            0x21 => {
                let val = self.fetch16(mmu);
                self.set_hl(val);
            }
            0x31 => {
                self.sp = self.fetch16(mmu);
            }
            0x02 => {
                let addr = self.get_bc();
                self.write8(mmu, addr, self.a);
            }
            0x12 => {
                let addr = self.get_de();
                self.write8(mmu, addr, self.a);
            }
            0x22 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(addr.wrapping_add(1));
            }
            0x32 => {
                let addr = self.get_hl();
                self.write8(mmu, addr, self.a);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x0A => {
                let addr = self.get_bc();
                self.a = self.read8(mmu, addr);
            }
            0x1A => {
                let addr = self.get_de();
                self.a = self.read8(mmu, addr);
            }
            0x2A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(addr.wrapping_add(1));
            }
            0x3A => {
                let addr = self.get_hl();
                self.a = self.read8(mmu, addr);
                self.set_hl(addr.wrapping_sub(1));
            }
            0x03 => {
                let val = self.get_bc().wrapping_add(1);
                self.set_bc(val);
                self.tick(mmu, 1);
            }
            0x13 => {
                let val = self.get_de().wrapping_add(1);
                self.set_de(val);
                self.tick(mmu, 1);
            }
            0x23 => {
                let val = self.get_hl().wrapping_add(1);
                self.set_hl(val);
                self.tick(mmu, 1);
            }
            0x33 => {
                self.sp = self.sp.wrapping_add(1);
                self.tick(mmu, 1);
            }
            0x0B => {
                let val = self.get_bc().wrapping_sub(1);
                self.set_bc(val);
                self.tick(mmu, 1);
            }
            0x1B => {
                let val = self.get_de().wrapping_sub(1);
                self.set_de(val);
                self.tick(mmu, 1);
            }
            0x2B => {
                let val = self.get_hl().wrapping_sub(1);
                self.set_hl(val);
                self.tick(mmu, 1);
            }
            0x3B => {
                self.sp = self.sp.wrapping_sub(1);
                self.tick(mmu, 1);
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = (opcode >> 3) & 0x07;
                let val = self.read_reg(mmu, r);
                let res = self.alu_inc8(val);
                self.write_reg(mmu, r, res);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = (opcode >> 3) & 0x07;
                let val = self.read_reg(mmu, r);
                let res = self.alu_dec8(val);
                self.write_reg(mmu, r, res);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let r = (opcode >> 3) & 0x07;
                let val = self.fetch8(mmu);
                self.write_reg(mmu, r, val);
            }
            0x07 => {
                let carry = self.a & 0x80 != 0;
                self.a = self.a.rotate_left(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x0F => {
                let carry = self.a & 0x01 != 0;
                self.a = self.a.rotate_right(1);
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x17 => {
                let carry = self.a & 0x80 != 0;
                self.a = (self.a << 1) | if self.f & FLAG_C != 0 { 1 } else { 0 };
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x1F => {
                let carry = self.a & 0x01 != 0;
                self.a = (self.a >> 1) | if self.f & FLAG_C != 0 { 0x80 } else { 0 };
                self.f = if carry { FLAG_C } else { 0 };
            }
            0x08 => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, (self.sp & 0xFF) as u8);
                self.write8(mmu, addr.wrapping_add(1), (self.sp >> 8) as u8);
            }
            0x09 => {
                let val = self.get_bc();
                self.alu_add_hl(mmu, val);
            }
            0x19 => {
                let val = self.get_de();
                self.alu_add_hl(mmu, val);
            }
            0x29 => {
                let val = self.get_hl();
                self.alu_add_hl(mmu, val);
            }
            0x39 => {
                let val = self.sp;
                self.alu_add_hl(mmu, val);
            }
            0x10 => {
                // STOP
                let _ = self.fetch8(mmu);
                mmu.reset_div();
                if mmu.key1 & 0x01 != 0 {
                    // Speed switch handshake: toggle, then stall.
                    mmu.key1 &= !0x01;
                    mmu.key1 ^= 0x80;
                    self.double_speed = mmu.key1 & 0x80 != 0;
                    self.tick(mmu, SPEED_SWITCH_STALL_M_CYCLES);
                } else {
                    self.irq.stopped = true;
                }
            }
            0x18 => {
                let offset = self.fetch8(mmu) as i8;
                self.pc = self.pc.wrapping_add(offset as u16);
                self.tick(mmu, 1);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch8(mmu) as i8;
                if self.condition((opcode >> 3) & 0x03) {
                    self.pc = self.pc.wrapping_add(offset as u16);
                    self.tick(mmu, 1);
                }
            }
            0x27 => {
                let mut correction = 0u8;
                let mut carry = false;
                if self.f & FLAG_H != 0 || (self.f & FLAG_N == 0 && (self.a & 0x0F) > 9) {
                    correction |= 0x06;
                }
                if self.f & FLAG_C != 0 || (self.f & FLAG_N == 0 && self.a > 0x99) {
                    correction |= 0x60;
                    carry = true;
                }
                if self.f & FLAG_N == 0 {
                    self.a = self.a.wrapping_add(correction);
                } else {
                    self.a = self.a.wrapping_sub(correction);
                }
                self.f = if self.a == 0 { FLAG_Z } else { 0 }
                    | (self.f & FLAG_N)
                    | if carry { FLAG_C } else { 0 };
            }
            0x2F => {
                self.a ^= 0xFF;
                self.f = (self.f & (FLAG_Z | FLAG_C)) | FLAG_N | FLAG_H;
            }
            0x37 => {
                self.f = (self.f & FLAG_Z) | FLAG_C;
            }
            0x3F => {
                self.f = (self.f & FLAG_Z) | if self.f & FLAG_C != 0 { 0 } else { FLAG_C };
            }
            0x76 => {
                // HALT
                let pending = (mmu.if_reg & mmu.ie_reg) & 0x1F;
                if self.irq.ime || pending == 0 {
                    self.irq.halt(self.pc, 0);
                } else if self.irq.ei_pending() {
                    self.irq.halt(self.pc, pending);
                } else {
                    self.irq.halt_bug = true;
                    self.irq.unhalt();
                }
            }
            0x40..=0x7F => {
                let dest = (opcode >> 3) & 0x07;
                let src = opcode & 0x07;
                let val = self.read_reg(mmu, src);
                self.write_reg(mmu, dest, val);
            }
            0x80..=0x87 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_add(val, false);
            }
            0x88..=0x8F => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_add(val, true);
            }
            0x90..=0x97 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_sub(val, false, true);
            }
            0x98..=0x9F => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_sub(val, true, true);
            }
            0xA0..=0xA7 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_and(val);
            }
            0xA8..=0xAF => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_xor(val);
            }
            0xB0..=0xB7 => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_or(val);
            }
            0xB8..=0xBF => {
                let val = self.read_reg(mmu, opcode & 0x07);
                self.alu_sub(val, false, false);
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 => {
                self.tick(mmu, 1);
                if self.condition((opcode >> 3) & 0x03) {
                    self.pc = self.pop_stack(mmu);
                    self.tick(mmu, 1);
                }
            }
            0xC9 => {
                self.pc = self.pop_stack(mmu);
                self.tick(mmu, 1);
            }
            0xD9 => {
                // RETI enables interrupts without the EI delay.
                self.pc = self.pop_stack(mmu);
                self.irq.ime = true;
                self.tick(mmu, 1);
            }
            0xC1 => {
                let val = self.pop_stack(mmu);
                self.set_bc(val);
            }
            0xD1 => {
                let val = self.pop_stack(mmu);
                self.set_de(val);
            }
            0xE1 => {
                let val = self.pop_stack(mmu);
                self.set_hl(val);
            }
            0xF1 => {
                let val = self.pop_stack(mmu);
                self.a = (val >> 8) as u8;
                self.f = (val as u8) & 0xF0;
            }
            0xC2 | 0xCA | 0xD2 | 0xDA => {
                let addr = self.fetch16(mmu);
                if self.condition((opcode >> 3) & 0x03) {
                    self.pc = addr;
                    self.tick(mmu, 1);
                }
            }
            0xC3 => {
                self.pc = self.fetch16(mmu);
                self.tick(mmu, 1);
            }
            0xC4 | 0xCC | 0xD4 | 0xDC => {
                let addr = self.fetch16(mmu);
                if self.condition((opcode >> 3) & 0x03) {
                    self.tick(mmu, 1);
                    let pc = self.pc;
                    self.push_stack(mmu, pc);
                    self.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch16(mmu);
                self.tick(mmu, 1);
                let pc = self.pc;
                self.push_stack(mmu, pc);
                self.pc = addr;
            }
            0xC5 => {
                let val = self.get_bc();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xD5 => {
                let val = self.get_de();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xE5 => {
                let val = self.get_hl();
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xF5 => {
                let val = ((self.a as u16) << 8) | (self.f as u16 & 0xF0);
                self.tick(mmu, 1);
                self.push_stack(mmu, val);
            }
            0xC6 => {
                let val = self.fetch8(mmu);
                self.alu_add(val, false);
            }
            0xCE => {
                let val = self.fetch8(mmu);
                self.alu_add(val, true);
            }
            0xD6 => {
                let val = self.fetch8(mmu);
                self.alu_sub(val, false, true);
            }
            0xDE => {
                let val = self.fetch8(mmu);
                self.alu_sub(val, true, true);
            }
            0xE6 => {
                let val = self.fetch8(mmu);
                self.alu_and(val);
            }
            0xEE => {
                let val = self.fetch8(mmu);
                self.alu_xor(val);
            }
            0xF6 => {
                let val = self.fetch8(mmu);
                self.alu_or(val);
            }
            0xFE => {
                let val = self.fetch8(mmu);
                self.alu_sub(val, false, false);
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let target = (opcode & 0x38) as u16;
                self.tick(mmu, 1);
                let pc = self.pc;
                self.push_stack(mmu, pc);
                self.pc = target;
            }
            0xCB => {
                let op = self.fetch8(mmu);
                self.handle_cb(op, mmu);
            }
            0xE0 => {
                let offset = self.fetch8(mmu);
                let addr = 0xFF00u16 | offset as u16;
                self.write8(mmu, addr, self.a);
            }
            0xF0 => {
                let offset = self.fetch8(mmu);
                let addr = 0xFF00u16 | offset as u16;
                self.a = self.read8(mmu, addr);
            }
            0xE2 => {
                let addr = 0xFF00u16 | self.c as u16;
                self.write8(mmu, addr, self.a);
            }
            0xF2 => {
                let addr = 0xFF00u16 | self.c as u16;
                self.a = self.read8(mmu, addr);
            }
            0xEA => {
                let addr = self.fetch16(mmu);
                self.write8(mmu, addr, self.a);
            }
            0xFA => {
                let addr = self.fetch16(mmu);
                self.a = self.read8(mmu, addr);
            }
            0xE8 => {
                let val = self.fetch8(mmu);
                self.sp = self.sp_plus_signed(val);
                self.tick(mmu, 2);
            }
            0xF8 => {
                let val = self.fetch8(mmu);
                let res = self.sp_plus_signed(val);
                self.set_hl(res);
                self.tick(mmu, 1);
            }
            0xF9 => {
                self.sp = self.get_hl();
                self.tick(mmu, 1);
            }
            0xE9 => {
                self.pc = self.get_hl();
            }
            0xF3 => {
                self.irq.di();
            }
            0xFB => {
                self.irq.ei();
            }
            _ => {
                // Undefined opcodes hang the CPU until reset.
                warn!(
                    "undefined opcode {opcode:02X} at {:04X}; CPU frozen",
                    self.pc.wrapping_sub(1)
                );
                self.irq.stopped = true;
            }
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new_post_boot(false, false)
    }
}

impl Cpu {
    pub fn save_state(&self, s: &mut crate::state::SaveState) {
        s.cpu.pc = self.pc;
        s.cpu.sp = self.sp;
        s.cpu.a = self.a;
        s.cpu.b = self.b;
        s.cpu.c = self.c;
        s.cpu.d = self.d;
        s.cpu.e = self.e;
        s.cpu.f = self.f;
        s.cpu.h = self.h;
        s.cpu.l = self.l;
        s.cpu.ime = self.irq.ime;
        s.cpu.halted = self.irq.halted;
        s.cpu.stopped = self.irq.stopped;
        s.cpu.halt_bug = self.irq.halt_bug;
        s.cpu.ei_delay = self.irq.ei_delay;
        s.cpu.halt_pc = self.irq.halt_pc.map(u32::from).unwrap_or(u32::MAX);
        s.cpu.halt_pending = self.irq.halt_pending;
    }

    pub fn load_state(&mut self, s: &crate::state::SaveState) {
        self.pc = s.cpu.pc;
        self.sp = s.cpu.sp;
        self.a = s.cpu.a;
        self.b = s.cpu.b;
        self.c = s.cpu.c;
        self.d = s.cpu.d;
        self.e = s.cpu.e;
        self.f = s.cpu.f & 0xF0;
        self.h = s.cpu.h;
        self.l = s.cpu.l;
        self.irq.ime = s.cpu.ime;
        self.irq.halted = s.cpu.halted;
        self.irq.stopped = s.cpu.stopped;
        self.irq.halt_bug = s.cpu.halt_bug;
        self.irq.ei_delay = s.cpu.ei_delay;
        self.irq.halt_pc = (s.cpu.halt_pc != u32::MAX).then_some(s.cpu.halt_pc as u16);
        self.irq.halt_pending = s.cpu.halt_pending;
        self.double_speed = s.mem.key1 & 0x80 != 0;
    }
}
