pub trait LinkPort: Send {
    /// Transfer a byte over the link. Returns the byte received from the
    /// partner. Implementations may perform the transfer immediately.
    fn transfer(&mut self, byte: u8) -> u8;
}

/// A stub link port used when no cable is attached.
/// By default it emulates a "line dead" scenario where incoming bits are all 1,
/// so any transfer receives 0xFF. When `loopback` is true the sent byte is
/// echoed back instead.
#[derive(Default)]
pub struct NullLinkPort {
    loopback: bool,
}

impl NullLinkPort {
    pub fn new(loopback: bool) -> Self {
        Self { loopback }
    }
}

impl LinkPort for NullLinkPort {
    fn transfer(&mut self, byte: u8) -> u8 {
        if self.loopback { byte } else { 0xFF }
    }
}

/// Serial registers (SB/SC) and bit-by-bit transfer emulation. Raises the
/// serial interrupt when a transfer completes.
pub struct Serial {
    sb: u8,
    sc: u8,
    pub(crate) out_buf: Vec<u8>,
    port: Box<dyn LinkPort + Send>,
    transfer: Option<TransferState>,
    cgb_mode: bool,
}

struct TransferState {
    remaining_bits: u8,
    outgoing: u8,
    incoming: Option<u8>,
    pending_in: u8,
    internal_clock: bool,
    fast_clock: bool,
}

impl TransferState {
    fn new(outgoing: u8, internal_clock: bool, fast_clock: bool) -> Self {
        Self {
            remaining_bits: 8,
            outgoing,
            incoming: None,
            pending_in: 0,
            internal_clock,
            fast_clock,
        }
    }

    fn latch_incoming(&mut self, incoming: u8) {
        if self.incoming.is_some() {
            return;
        }
        self.incoming = Some(incoming);
        self.pending_in = incoming;
    }

    fn shift(&mut self, sb: &mut u8) -> bool {
        if self.remaining_bits == 0 {
            return true;
        }

        let incoming_bit = (self.pending_in & 0x80) != 0;
        self.pending_in <<= 1;
        *sb = (*sb << 1) | incoming_bit as u8;
        self.remaining_bits -= 1;
        self.remaining_bits == 0
    }
}

impl Serial {
    pub fn new(cgb: bool) -> Self {
        Self {
            sb: 0,
            sc: if cgb { 0x7F } else { 0x7E },
            out_buf: Vec::new(),
            port: Box::new(NullLinkPort::default()),
            transfer: None,
            cgb_mode: cgb,
        }
    }

    pub fn connect(&mut self, port: Box<dyn LinkPort + Send>) {
        self.port = port;
    }

    pub fn read(&self, addr: u16) -> u8 {
        match addr {
            0xFF01 => self.sb,
            0xFF02 => {
                if self.cgb_mode {
                    self.sc
                } else {
                    self.sc | 0x7E
                }
            }
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, addr: u16, val: u8) {
        match addr {
            0xFF01 => self.sb = val,
            0xFF02 => {
                if let Some(state) = self.transfer.as_mut() {
                    // Mid-transfer SC writes:
                    // - If bit7 is cleared, cancel the transfer.
                    // - If bit7 remains set, treat the write as a (re)start
                    //   request: restart the transfer using the current SB
                    //   value, and apply clock mode bits.
                    if val & 0x80 == 0 {
                        self.sc = val;
                        self.transfer = None;
                        return;
                    }

                    self.sc = val;
                    state.remaining_bits = 8;
                    state.outgoing = self.sb;
                    state.incoming = None;
                    state.pending_in = 0;
                    state.internal_clock = (val & 0x01) != 0;
                    state.fast_clock = (val & 0x02) != 0;
                    return;
                }

                self.sc = val;
                if val & 0x80 != 0 {
                    let internal_clock = val & 0x01 != 0;
                    let fast_clock = val & 0x02 != 0;
                    self.transfer = Some(TransferState::new(self.sb, internal_clock, fast_clock));
                    // When using an external clock the transfer only completes
                    // if the link partner supplies the necessary pulses; SC
                    // bit 7 stays asserted until the clock edges arrive.
                }
            }
            _ => {}
        }
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer.is_some()
    }

    /// Predicted divider ticks until the active internally-clocked transfer
    /// completes. Advisory input for the event scheduler; the edge-driven
    /// `step` below remains authoritative.
    pub fn ticks_until_done(&self, double_speed: bool) -> Option<u64> {
        let state = self.transfer.as_ref()?;
        if !state.internal_clock {
            return None;
        }
        let bit = clock_bit_index(self.cgb_mode, double_speed, state.fast_clock);
        let period = 1u64 << (bit + 1);
        Some(state.remaining_bits as u64 * period)
    }

    /// Deliver external clock pulses to the serial unit.
    ///
    /// Each pulse clocks one bit. This is only meaningful when the transfer
    /// is in external clock mode (SC bit0 = 0).
    pub fn external_clock_pulse(&mut self, count: u8, if_reg: &mut u8) {
        let Some(state) = self.transfer.as_mut() else {
            return;
        };
        if state.internal_clock {
            return;
        }

        if state.incoming.is_none() {
            let incoming = self.port.transfer(state.outgoing);
            state.latch_incoming(incoming);
        }

        let mut complete = false;
        for _ in 0..count {
            if state.shift(&mut self.sb) {
                complete = true;
                break;
            }
        }

        if complete {
            self.finish_transfer(if_reg);
        }
    }

    pub fn step(&mut self, prev_div: u16, curr_div: u16, double_speed: bool, if_reg: &mut u8) {
        let Some(state) = self.transfer.as_mut() else {
            return;
        };
        let clock_bit = clock_bit_index(self.cgb_mode, double_speed, state.fast_clock);

        if state.internal_clock && state.incoming.is_none() {
            // For internal clock mode, latch the partner byte before the
            // first shifted bit. External-clock transfers defer the exchange
            // until clock pulses actually arrive.
            let incoming = self.port.transfer(state.outgoing);
            state.latch_incoming(incoming);
        }

        let mut complete = false;
        let mut div = prev_div;
        let steps = curr_div.wrapping_sub(prev_div);
        let mut prev_clock = ((div >> clock_bit) & 1) != 0;
        for _ in 0..steps {
            div = div.wrapping_add(1);
            let clock = ((div >> clock_bit) & 1) != 0;
            if state.internal_clock && prev_clock && !clock && state.shift(&mut self.sb) {
                complete = true;
                break;
            }
            prev_clock = clock;
        }

        if complete {
            self.finish_transfer(if_reg);
        }
    }

    fn finish_transfer(&mut self, if_reg: &mut u8) {
        if let Some(state) = self.transfer.take() {
            let incoming = state.incoming.unwrap_or(0xFF);
            self.sb = incoming;
            self.out_buf.push(state.outgoing);
            self.sc &= 0x7F;
            *if_reg |= 0x08;
        }
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out_buf)
    }

    pub fn peek_output(&self) -> &[u8] {
        &self.out_buf
    }
}

fn clock_bit_index(cgb_mode: bool, double_speed: bool, fast_clock: bool) -> u32 {
    if !cgb_mode {
        if double_speed { 7 } else { 8 }
    } else {
        match (fast_clock, double_speed) {
            (false, false) => 8,
            (false, true) => 7,
            (true, false) => 3,
            (true, true) => 2,
        }
    }
}


impl Serial {
    pub fn save_state(&self, s: &mut crate::state::SaveState) {
        s.mem.sb = self.sb;
        s.mem.sc = self.sc;
        match &self.transfer {
            Some(t) => {
                s.mem.serial_bits = t.remaining_bits;
                s.mem.serial_out = t.outgoing;
                s.mem.serial_in = t.incoming.map(u16::from).unwrap_or(0xFFFF);
                s.mem.serial_pending_in = t.pending_in;
                s.mem.serial_internal = t.internal_clock;
                s.mem.serial_fast = t.fast_clock;
            }
            None => {
                s.mem.serial_bits = 0xFF;
                s.mem.serial_out = 0;
                s.mem.serial_in = 0xFFFF;
                s.mem.serial_pending_in = 0;
                s.mem.serial_internal = false;
                s.mem.serial_fast = false;
            }
        }
    }

    pub fn load_state(&mut self, s: &crate::state::SaveState) {
        self.sb = s.mem.sb;
        self.sc = s.mem.sc;
        self.transfer = (s.mem.serial_bits != 0xFF).then(|| TransferState {
            remaining_bits: s.mem.serial_bits,
            outgoing: s.mem.serial_out,
            incoming: (s.mem.serial_in != 0xFFFF).then_some(s.mem.serial_in as u8),
            pending_in: s.mem.serial_pending_in,
            internal_clock: s.mem.serial_internal,
            fast_clock: s.mem.serial_fast,
        });
    }
}
