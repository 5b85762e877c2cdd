// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use common::components::scheduler::Kind;
use GbaEvent::*;

use crate::{apu::Apu, cpu::Cpu, hw::dma::Dmas, hw::timer::Timers, ppu::Ppu, Gba};

/// All scheduler events of the system.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum GbaEvent {
    /// Stop the run loop; scheduled by the host to quit cleanly.
    Quit,
    /// An event handled by the PPU.
    Ppu(PpuEvent),
    /// An event handled by the APU.
    Apu(ApuEvent),
    /// A timer overflow.
    TimerOverflow(u8),
    /// Start of a triggered DMA transfer on the given channel.
    DmaFire(u8),
    /// The IRQ line catches up with the interrupt registers.
    UpdateIrq,
}

impl Kind for GbaEvent {}

/// Events the PPU generates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PpuEvent {
    /// End of the visible part of a scanline, which is the start of
    /// HBlank.
    HdrawEnd,
    /// End of HBlank, which is the start of the next scanline.
    HblankEnd,
}

/// Events the APU generates.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ApuEvent {
    /// Push a sample to the output buffer.
    PushSample,
    /// A sound FIFO ran low and wants its DMA to refill it.
    FifoRefill(u8),
}

impl Gba {
    /// Handle the event by delegating to the appropriate handler.
    pub(crate) fn dispatch(&mut self, event: GbaEvent) {
        match event {
            Quit => self.running = false,
            Ppu(evt) => Ppu::handle_event(self, evt),
            Apu(evt) => Apu::handle_event(self, evt),
            TimerOverflow(idx) => Timers::handle_overflow(self, idx),
            DmaFire(idx) => Dmas::handle_fire(self, idx),
            UpdateIrq => Cpu::update_irq(self),
        }
    }
}
