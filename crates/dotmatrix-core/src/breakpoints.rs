//! Execution breakpoints for tooling integrations.
//!
//! A breakpoint names an address and, for banked ROM addresses, optionally
//! the ROM bank that must be mapped for the breakpoint to apply. Hitting one
//! is a signal, not a failure: the run loop stops before the instruction and
//! reports the address, and the next run resumes past it.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u16,
    /// ROM bank constraint; `None` matches any bank. Ignored for addresses
    /// outside the banked ROM window.
    pub bank: Option<u16>,
}

impl Breakpoint {
    pub fn matches(&self, addr: u16, rom_bank: u16) -> bool {
        if self.addr != addr {
            return false;
        }
        match self.bank {
            None => true,
            // Bank constraints only make sense in the switchable window.
            Some(bank) => !(0x4000..0x8000).contains(&addr) || bank == rom_bank,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BreakpointEngine {
    breakpoints: Vec<Breakpoint>,
    pending_hit: Option<u16>,
    /// Address we already reported; execution is allowed to pass through it
    /// once so a resumed run makes progress.
    resume_addr: Option<u16>,
}

impl BreakpointEngine {
    pub fn set_breakpoints(&mut self, breakpoints: Vec<Breakpoint>) {
        self.breakpoints = breakpoints;
        self.pending_hit = None;
        self.resume_addr = None;
    }

    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Check the instruction about to execute. Returns true when execution
    /// must stop before it.
    pub fn note_exec(&mut self, addr: u16, rom_bank: u16) -> bool {
        if self.breakpoints.is_empty() {
            return false;
        }
        if self.resume_addr == Some(addr) {
            return false;
        }
        self.resume_addr = None;
        if self
            .breakpoints
            .iter()
            .any(|bp| bp.matches(addr, rom_bank))
        {
            self.pending_hit = Some(addr);
            self.resume_addr = Some(addr);
            return true;
        }
        false
    }

    /// Called after an instruction retires. The resume marker only excuses
    /// the one flagged instruction; any later visit hits again.
    pub fn note_retired(&mut self) {
        self.resume_addr = None;
    }

    /// The address execution stopped at, or `None` if it stopped normally.
    pub fn take_hit(&mut self) -> Option<u16> {
        self.pending_hit.take()
    }

    /// Peek the pending hit without consuming it.
    pub fn hit(&self) -> Option<u16> {
        self.pending_hit
    }

    pub fn has_hit(&self) -> bool {
        self.pending_hit.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_reports_address_and_resumes_past_it() {
        let mut engine = BreakpointEngine::default();
        engine.set_breakpoints(vec![Breakpoint {
            addr: 0x0150,
            bank: None,
        }]);

        assert!(engine.note_exec(0x0150, 1));
        assert_eq!(engine.take_hit(), Some(0x0150));

        // Resuming executes the flagged instruction without re-triggering.
        assert!(!engine.note_exec(0x0150, 1));
        engine.note_retired();

        // A later visit hits again.
        assert!(engine.note_exec(0x0150, 1));
    }

    #[test]
    fn bank_constraint_applies_to_switchable_window_only() {
        let mut engine = BreakpointEngine::default();
        engine.set_breakpoints(vec![
            Breakpoint {
                addr: 0x4123,
                bank: Some(3),
            },
            Breakpoint {
                addr: 0xC000,
                bank: Some(7),
            },
        ]);

        assert!(!engine.note_exec(0x4123, 2));
        assert!(engine.note_exec(0x4123, 3));
        engine.take_hit();
        engine.note_retired();

        // RAM addresses ignore the bank constraint.
        assert!(engine.note_exec(0xC000, 0));
    }
}
