// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use common::numutil::NumExt;

use crate::{scheduling::GbaEvent, Gba};

/// Clock of the ARM7TDMI, used for scheduling.
pub const CPU_CLOCK: u32 = 1 << 24;

/// Delay between an interrupt condition arising and the CPU observing
/// the line, in cycles.
const IRQ_SYNC_DELAY: u64 = 3;

/// State of the ARM7TDMI core.
///
/// Instruction decoding and execution live outside this crate; the
/// fields here are what the bus, the prefetcher and the snapshot codec
/// need to observe: the register file, the current execution state and
/// the fetch pipeline contents that leak out on open-bus reads.
pub struct Cpu {
    pub registers: [u32; 16],
    pub cpsr: u32,
    pub spsr: u32,
    /// The two opcodes currently held by the fetch/decode pipeline
    /// stages. `pipeline[1]` is the most recently fetched one.
    pub pipeline: [u32; 2],
    pub is_halted: bool,

    pub ime: bool,
    pub ie: u16,
    pub if_: u16,
    /// State of the IRQ line after synchronisation.
    pub irq_pending: bool,
}

impl Cpu {
    #[inline]
    pub fn pc(&self) -> u32 {
        self.registers[15]
    }

    #[inline]
    pub fn is_thumb(&self) -> bool {
        self.cpsr.is_bit(5)
    }

    pub fn set_thumb(&mut self, thumb: bool) {
        self.cpsr = self.cpsr.set_bit(5, thumb);
    }

    /// Is the PC currently inside the BIOS region? Controls whether
    /// BIOS reads are serviced or fall back to the bus latch.
    #[inline]
    pub fn pc_in_bios(&self) -> bool {
        self.pc() < 0x4000
    }

    /// Re-evaluate the IRQ line after the synchronisation delay.
    pub fn update_irq(gg: &mut Gba) {
        gg.cpu.irq_pending = gg.cpu.ime && (gg.cpu.ie & gg.cpu.if_) != 0;
        // HALT ends on any enabled interrupt, even with IME off.
        if (gg.cpu.ie & gg.cpu.if_) != 0 {
            gg.cpu.is_halted = false;
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            registers: [0; 16],
            // Supervisor mode, IRQ/FIQ masked, ARM state.
            cpsr: 0xD3,
            spsr: 0xD3,
            pipeline: [0; 2],
            is_halted: false,
            ime: false,
            ie: 0,
            if_: 0,
            irq_pending: false,
        }
    }
}

/// All interrupt sources of the system, by IF/IE bit index.
#[derive(Debug, Copy, Clone)]
#[repr(u16)]
pub enum Interrupt {
    VBlank = 0,
    HBlank,
    VCounter,
    Timer0,
    Timer1,
    Timer2,
    Timer3,
    Serial,
    Dma0,
    Dma1,
    Dma2,
    Dma3,
    Joypad,
    GamePak,
}

impl Gba {
    /// Raise the given interrupt in IF and schedule the line update.
    pub fn request_interrupt(&mut self, int: Interrupt) {
        self.request_interrupt_with_index(int as u16);
    }

    /// Raise an interrupt by IF bit index.
    pub fn request_interrupt_with_index(&mut self, idx: u16) {
        self.cpu.if_ = self.cpu.if_.set_bit(idx, true);
        self.schedule_irq_update();
    }

    /// The IRQ line lags register writes by a few cycles; model that
    /// with a scheduler event instead of updating it in place.
    pub(crate) fn schedule_irq_update(&mut self) {
        self.scheduler
            .add(GbaEvent::UpdateIrq, self.scheduler.now() + IRQ_SYNC_DELAY);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn thumb_flag() {
        let mut cpu = Cpu::default();
        assert!(!cpu.is_thumb());
        cpu.set_thumb(true);
        assert!(cpu.is_thumb());
        assert_eq!(cpu.cpsr, 0xD3 | (1 << 5));
    }

    #[test]
    fn irq_line_follows_registers() {
        let mut gg = Gba::without_rom();
        gg.cpu.ie = 1 << Interrupt::Timer0 as u16;
        gg.cpu.ime = true;
        gg.request_interrupt(Interrupt::Timer0);
        assert!(!gg.cpu.irq_pending);
        gg.run_until(8);
        assert!(gg.cpu.irq_pending);
    }

    #[test]
    fn halt_clears_on_enabled_interrupt() {
        let mut gg = Gba::without_rom();
        gg.cpu.is_halted = true;
        gg.cpu.ie = 1 << Interrupt::VBlank as u16;
        gg.request_interrupt(Interrupt::VBlank);
        gg.run_until(8);
        assert!(!gg.cpu.is_halted);
    }
}
