//! Unified "next event time" bookkeeping for the emulation loop.
//!
//! Every subsystem that needs servicing at a known future point publishes an
//! absolute deadline on the shared cycle axis. The run loop executes CPU
//! instructions only up to the minimum pending deadline and re-checks after
//! servicing whatever fired.

/// Deadline value for an event that is not pending.
pub const DISABLED_TIME: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventId {
    /// A finished video frame is ready to hand to the caller.
    Blit = 0,
    /// The current `run_for` call has produced its requested samples.
    End = 1,
    /// Predicted TIMA overflow interrupt.
    TimerIrq = 2,
    /// Predicted serial transfer completion.
    Serial = 3,
    /// OAM DMA transfer completion.
    OamDma = 4,
}

pub const NUM_EVENTS: usize = 5;

const ALL_EVENTS: [EventId; NUM_EVENTS] = [
    EventId::Blit,
    EventId::End,
    EventId::TimerIrq,
    EventId::Serial,
    EventId::OamDma,
];

/// Absolute cycle deadlines per event source, with a cached minimum.
#[derive(Debug, Clone)]
pub struct EventTimes {
    times: [u64; NUM_EVENTS],
    min: u64,
}

impl EventTimes {
    pub fn new() -> Self {
        Self {
            times: [DISABLED_TIME; NUM_EVENTS],
            min: DISABLED_TIME,
        }
    }

    pub fn set(&mut self, id: EventId, time: u64) {
        self.times[id as usize] = time;
        if time < self.min {
            self.min = time;
        } else {
            self.recompute_min();
        }
    }

    pub fn disable(&mut self, id: EventId) {
        self.set(id, DISABLED_TIME);
    }

    pub fn time(&self, id: EventId) -> u64 {
        self.times[id as usize]
    }

    /// Earliest pending deadline. The CPU never runs past this without
    /// re-checking for fired events.
    pub fn min_time(&self) -> u64 {
        self.min
    }

    /// The event holding the current minimum, if any deadline is pending.
    pub fn next_event(&self) -> Option<EventId> {
        if self.min == DISABLED_TIME {
            return None;
        }
        ALL_EVENTS
            .into_iter()
            .find(|&id| self.times[id as usize] == self.min)
    }

    /// Translate every pending deadline down by `offset` in one step.
    /// Used when the global cycle counter is rebased; events and counter
    /// must move together or relative timing breaks.
    pub fn rebase(&mut self, offset: u64) {
        for t in &mut self.times {
            if *t != DISABLED_TIME {
                *t = t.saturating_sub(offset);
            }
        }
        self.recompute_min();
    }

    fn recompute_min(&mut self) {
        self.min = self.times.iter().copied().min().unwrap_or(DISABLED_TIME);
    }
}

impl Default for EventTimes {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt-master-enable and halt bookkeeping, with the one-instruction
/// enable delay of `EI`.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    pub ime: bool,
    pub halted: bool,
    pub stopped: bool,
    /// Pending `EI`: counts down one instruction before IME goes high.
    pub(crate) ei_delay: u8,
    /// Next instruction is executed without advancing PC (halt bug).
    pub halt_bug: bool,
    /// PC saved when entering halt, for dispatch address fixups.
    pub halt_pc: Option<u16>,
    /// Interrupts that were already pending when halt was entered with a
    /// pending `EI`; dispatching one of these returns to `halt_pc - 1`.
    pub halt_pending: u8,
}

impl Interrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// `EI`: interrupts enable only after the *next* instruction completes.
    pub fn ei(&mut self) {
        self.ei_delay = 2;
    }

    /// `DI` takes effect immediately and cancels a pending `EI`.
    pub fn di(&mut self) {
        self.ime = false;
        self.ei_delay = 0;
    }

    pub fn ei_pending(&self) -> bool {
        self.ei_delay > 0
    }

    /// Called once per executed instruction; `armed` is whether the delay
    /// stood at its final step when the instruction began.
    pub fn step_ei_delay(&mut self, armed: bool) {
        if armed && self.ei_delay > 0 {
            self.ime = true;
        }
        if self.ei_delay > 0 {
            self.ei_delay -= 1;
        }
    }

    /// Whether the delay is at its final step (IME goes high after the
    /// instruction now being executed).
    pub fn ei_delay_armed(&self) -> bool {
        self.ei_delay == 1
    }

    pub fn halt(&mut self, next_pc: u16, buffered: u8) {
        self.halted = true;
        self.halt_pc = Some(next_pc);
        self.halt_pending = buffered;
    }

    pub fn unhalt(&mut self) {
        self.halted = false;
        self.halt_pc = None;
        self.halt_pending = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_tracks_set_and_disable() {
        let mut ev = EventTimes::new();
        assert_eq!(ev.min_time(), DISABLED_TIME);
        assert_eq!(ev.next_event(), None);

        ev.set(EventId::End, 100);
        ev.set(EventId::Blit, 50);
        assert_eq!(ev.min_time(), 50);
        assert_eq!(ev.next_event(), Some(EventId::Blit));

        ev.disable(EventId::Blit);
        assert_eq!(ev.min_time(), 100);
        assert_eq!(ev.next_event(), Some(EventId::End));
    }

    #[test]
    fn rebase_shifts_all_pending_deadlines() {
        let mut ev = EventTimes::new();
        ev.set(EventId::End, 0x8000_0100);
        ev.set(EventId::TimerIrq, 0x8000_0040);
        ev.rebase(0x8000_0000);
        assert_eq!(ev.time(EventId::End), 0x100);
        assert_eq!(ev.time(EventId::TimerIrq), 0x40);
        assert_eq!(ev.time(EventId::Blit), DISABLED_TIME);
        assert_eq!(ev.min_time(), 0x40);
    }

    #[test]
    fn ei_enables_after_one_instruction() {
        let mut irq = Interrupts::new();
        irq.ei();
        // Instruction executing when EI itself retires.
        let armed = irq.ei_delay_armed();
        irq.step_ei_delay(armed);
        assert!(!irq.ime);
        // The following instruction completes; IME goes high.
        let armed = irq.ei_delay_armed();
        irq.step_ei_delay(armed);
        assert!(irq.ime);
    }

    #[test]
    fn di_cancels_pending_ei() {
        let mut irq = Interrupts::new();
        irq.ei();
        irq.di();
        let armed = irq.ei_delay_armed();
        irq.step_ei_delay(armed);
        let armed = irq.ei_delay_armed();
        irq.step_ei_delay(armed);
        assert!(!irq.ime);
    }
}
