// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! Headless GBA emulator core.
//!
//! The crate models the coupled timing heart of the system: a
//! discrete-event scheduler owning the cycle counter, the bus
//! arbitrator with per-region access costs and the cartridge prefetch
//! unit, and a versioned snapshot codec over all of it. CPU
//! instruction decoding and pixel/audio synthesis are left to external
//! collaborators; their state is held and timed here.

use std::{mem, sync::Arc};

use apu::Apu;
use common::{components::scheduler::Scheduler, Time};
use cpu::Cpu;
use host::{Shared, VideoSink};
use hw::{cartridge::Cartridge, dma::Dmas, gpio::Gpio, timer::Timers};
use memory::Memory;
use ppu::Ppu;
use scheduling::{ApuEvent, GbaEvent, PpuEvent};

pub mod addr;
pub mod apu;
pub mod cpu;
pub mod host;
pub mod hw;
mod io;
pub mod memory;
pub mod ppu;
pub mod savestate;
pub mod scheduling;

/// Console struct representing the GBA. Contains all state and is used
/// for system emulation.
pub struct Gba {
    pub cpu: Cpu,
    pub memory: Memory,
    pub ppu: Ppu,
    pub apu: Apu,
    pub dma: Dmas,
    pub timers: Timers,
    pub cart: Cartridge,
    pub gpio: Gpio,

    pub scheduler: Scheduler<GbaEvent>,
    pub(crate) shared: Arc<Shared>,
    pub(crate) video_sink: Option<VideoSink>,
    running: bool,
}

impl Gba {
    /// Create a console with the given cartridge inserted.
    pub fn new(rom: Vec<u8>) -> Box<Self> {
        let mut gg = Box::new(Self::empty(Arc::new(Shared::default())));
        gg.cart.load_rom(rom);
        gg.init();
        gg
    }

    /// Create a console with nothing inserted; reads of the cartridge
    /// bus see the floating-bus pattern.
    pub fn without_rom() -> Box<Self> {
        Self::new(Vec::new())
    }

    /// Replace the BIOS image. The default is all-zero, which is
    /// enough for cores that skip the boot ROM.
    pub fn set_bios(&mut self, bios: Vec<u8>) {
        self.memory.bios = bios.into_boxed_slice();
    }

    /// Install a per-scanline callback; see [host::VideoSink].
    pub fn set_video_sink(&mut self, sink: VideoSink) {
        self.video_sink = Some(sink);
    }

    /// Data block shared with the host; see [host::Shared].
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// False once a quit event fired.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Schedule the quit sentinel: once the given cycle is reached,
    /// [Gba::is_running] turns false and hosts stop issuing work.
    /// Useful for deterministic pauses at an exact cycle.
    pub fn stop_at(&mut self, at: Time) {
        self.scheduler.add(GbaEvent::Quit, at);
    }

    /// Advance emulation by up to `budget` cycles, executing every
    /// event that falls within it. Event handlers charging bus time
    /// can overshoot the budget by the tail end of their last access.
    pub fn run_until(&mut self, budget: Time) {
        let target = self.scheduler.now() + budget;
        while let Some((_, kind)) = self.scheduler.pop_within(target) {
            self.dispatch(kind);
        }
        self.scheduler.advance_to(target);
    }

    /// Charge idle CPU cycles. The cartridge bus is free during them,
    /// so the prefetcher advances.
    pub fn idle_for(&mut self, cycles: u16) {
        self.step_prefetch(cycles);
        self.run_until(cycles.into());
    }

    /// Charge cycles for a bus access. Events coming due within the
    /// charge fire immediately, keeping every event on its exact cycle.
    pub(crate) fn tick(&mut self, cycles: u64) {
        self.run_until(cycles);
    }

    /// Reset the console, keeping cartridge, BIOS and host wiring.
    pub fn reset(&mut self) {
        let rom = mem::take(&mut self.cart.rom);
        let ram = mem::take(&mut self.cart.ram);
        let bios = mem::take(&mut self.memory.bios);
        let shared = Arc::clone(&self.shared);
        let sink = self.video_sink.take();

        *self = Self::empty(shared);
        self.memory.bios = bios;
        self.cart.load_rom(rom);
        if ram.len() == self.cart.ram.len() {
            self.cart.ram = ram;
        }
        self.video_sink = sink;
        self.init();
    }

    /// Put the CPU into the state the BIOS intro leaves it in, so
    /// cores can boot a game with the all-zero BIOS.
    pub fn skip_bios(&mut self) {
        self.cpu.cpsr = 0x1F;
        self.cpu.registers[13] = 0x0300_7F00;
        self.cpu.registers[15] = 0x0800_0004;
        self.memory.postflg = 1;
    }

    fn empty(shared: Arc<Shared>) -> Self {
        Self {
            cpu: Cpu::default(),
            memory: Memory::default(),
            ppu: Ppu::default(),
            apu: Apu::default(),
            dma: Dmas::default(),
            timers: Timers::default(),
            cart: Cartridge::default(),
            gpio: Gpio::default(),
            scheduler: Scheduler::default(),
            shared,
            video_sink: None,
            running: true,
        }
    }

    fn init(&mut self) {
        self.update_wait_times();
        self.scheduler.add_repeating(
            GbaEvent::Ppu(PpuEvent::HdrawEnd),
            ppu::HDRAW_LEN,
            ppu::SCANLINE_LEN,
        );
        self.scheduler.add_repeating(
            GbaEvent::Ppu(PpuEvent::HblankEnd),
            ppu::SCANLINE_LEN,
            ppu::SCANLINE_LEN,
        );
        self.scheduler.add_repeating(
            GbaEvent::Apu(ApuEvent::PushSample),
            apu::SAMPLE_EVERY,
            apu::SAMPLE_EVERY,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn run_until_is_bounded() {
        let mut gg = Gba::without_rom();
        gg.run_until(100);
        assert_eq!(gg.scheduler.now(), 100);
        gg.run_until(0);
        assert_eq!(gg.scheduler.now(), 100);
    }

    #[test]
    fn quit_event_stops_the_loop() {
        let mut gg = Gba::without_rom();
        assert!(gg.is_running());
        gg.stop_at(50);
        gg.run_until(100);
        assert!(!gg.is_running());
        assert_eq!(gg.scheduler.now(), 100);
    }

    #[test]
    fn reset_keeps_cartridge_and_backup() {
        let mut rom = vec![0; 0xC0];
        rom.extend_from_slice(b"SRAM_V113");
        rom[0xAC..0xB0].copy_from_slice(b"XYZW");
        let mut gg = Gba::new(rom);
        gg.set(0x0E00_0000u32, 0x5Au8);
        gg.run_until(5000);
        gg.cpu.registers[3] = 123;

        gg.reset();
        assert_eq!(gg.scheduler.now(), 0);
        assert_eq!(gg.cpu.registers[3], 0);
        assert_eq!(gg.cart.rom_code(), u32::from_le_bytes(*b"XYZW"));
        assert_eq!(gg.get::<u8>(0x0E00_0000), 0x5A);
    }

    #[test]
    fn skip_bios_sets_entry_state() {
        let mut gg = Gba::without_rom();
        gg.skip_bios();
        assert_eq!(gg.cpu.pc(), 0x0800_0004);
        assert!(!gg.cpu.is_thumb());
        assert_eq!(gg.memory.postflg, 1);
    }
}
