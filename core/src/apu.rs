// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

#![allow(unused_braces)] // modular_bitfield issue

use arrayvec::ArrayVec;
use modular_bitfield::{bitfield, specifiers::*};

use crate::{
    hw::dma::Dmas,
    scheduling::{ApuEvent, GbaEvent},
    Gba,
};

/// Cycles between output samples, 2^24 / 2^15 Hz.
pub const SAMPLE_EVERY: u64 = 512;
/// A FIFO at or below this level requests a DMA refill.
const FIFO_LOW: usize = 16;
/// Headless hosts might never drain the output; cap it.
const OUT_BUFFER_CAP: usize = 4096;

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct SoundControl {
    pub psg_volume: B2,
    pub a_volume: B1,
    pub b_volume: B1,
    #[skip]
    __: B4,
    pub a_right_en: bool,
    pub a_left_en: bool,
    pub a_timer: B1,
    pub a_reset: bool,
    pub b_right_en: bool,
    pub b_left_en: bool,
    pub b_timer: B1,
    pub b_reset: bool,
}

/// APU state the engine needs: the two direct-sound FIFOs, their
/// control register and the sample pacing. PSG channel synthesis is an
/// external collaborator and not modelled here.
pub struct Apu {
    pub cnt: SoundControl,
    pub bias: u16,

    pub fifos: [ArrayVec<u8, 32>; 2],
    /// Sample each FIFO last latched on its timer.
    pub current: [i8; 2],

    /// Mixed output samples, drained by the host, oldest dropped on
    /// overflow.
    pub buffer: Vec<i16>,
    pub sample_count: u64,
}

impl Default for Apu {
    fn default() -> Self {
        Self {
            cnt: SoundControl::default(),
            bias: 0x200,
            fifos: [ArrayVec::new(), ArrayVec::new()],
            current: [0; 2],
            buffer: Vec::new(),
            sample_count: 0,
        }
    }
}

impl Apu {
    pub fn handle_event(gg: &mut Gba, event: ApuEvent) {
        match event {
            ApuEvent::PushSample => Self::push_output(gg),
            ApuEvent::FifoRefill(fifo) => Dmas::update_fifo(gg, fifo),
        }
    }

    /// Write a byte into one of the FIFOs. Full FIFOs drop the sample.
    pub fn push_fifo_sample(&mut self, fifo: usize, value: u8) {
        let _ = self.fifos[fifo].try_push(value);
    }

    /// A timer the direct-sound channels listen to overflowed: advance
    /// the FIFOs fed by it and request a refill when they run low.
    pub fn timer_overflow(gg: &mut Gba, timer: u8) {
        let timers = [gg.apu.cnt.a_timer(), gg.apu.cnt.b_timer()];
        for (fifo, fifo_timer) in timers.into_iter().enumerate() {
            if fifo_timer as u8 != timer {
                continue;
            }
            if !gg.apu.fifos[fifo].is_empty() {
                gg.apu.current[fifo] = gg.apu.fifos[fifo].remove(0) as i8;
            }
            if gg.apu.fifos[fifo].len() <= FIFO_LOW {
                gg.scheduler.add(
                    GbaEvent::Apu(ApuEvent::FifoRefill(fifo as u8)),
                    gg.scheduler.now() + 1,
                );
            }
        }
    }

    /// Reset a FIFO after its reset bit was written.
    pub fn reset_fifo(&mut self, fifo: usize) {
        self.fifos[fifo].clear();
        self.current[fifo] = 0;
    }

    fn push_output(gg: &mut Gba) {
        gg.apu.sample_count = gg.apu.sample_count.wrapping_add(1);
        let sample = (gg.apu.current[0] as i16 + gg.apu.current[1] as i16) << 5;
        if gg.apu.buffer.len() >= OUT_BUFFER_CAP {
            gg.apu.buffer.remove(0);
        }
        gg.apu.buffer.push(sample);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fifo_drops_when_full() {
        let mut apu = Apu::default();
        for i in 0..40 {
            apu.push_fifo_sample(0, i);
        }
        assert_eq!(apu.fifos[0].len(), 32);
        assert_eq!(apu.fifos[0][31], 31);
    }

    #[test]
    fn timer_overflow_latches_sample() {
        let mut gg = Gba::without_rom();
        gg.apu.push_fifo_sample(0, 0x42);
        gg.apu.push_fifo_sample(0, 0x43);
        Apu::timer_overflow(&mut gg, 0);
        assert_eq!(gg.apu.current[0], 0x42);
        assert_eq!(gg.apu.fifos[0].len(), 1);
    }

    #[test]
    fn sample_event_fills_buffer() {
        let mut gg = Gba::without_rom();
        gg.run_until(SAMPLE_EVERY * 4);
        assert_eq!(gg.apu.buffer.len(), 4);
        assert_eq!(gg.apu.sample_count, 4);
    }
}
