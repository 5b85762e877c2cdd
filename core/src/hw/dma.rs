// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

#![allow(unused_braces)] // modular_bitfield issue

use arrayvec::ArrayVec;
use common::numutil::{word, NumExt};
use modular_bitfield::{bitfield, specifiers::*, BitfieldSpecifier};

use crate::{
    cpu::Interrupt,
    memory::access::{Access, DMA, NONSEQ, SEQ},
    scheduling::GbaEvent,
    Gba,
};

const SRC_MASK: [u32; 4] = [0x7FF_FFFF, 0xFFF_FFFF, 0xFFF_FFFF, 0xFFF_FFFF];
const DST_MASK: [u32; 4] = [0x7FF_FFFF, 0x7FF_FFFF, 0x7FF_FFFF, 0xFFF_FFFF];

/// MMIO addresses of the two sound FIFOs, destinations of FIFO DMA.
const FIFO_A_ADDR: u32 = 0x0400_00A0;
const FIFO_B_ADDR: u32 = 0x0400_00A4;

/// Cycles between a DMA trigger and the bus handover.
const START_DELAY: u64 = 2;

#[derive(BitfieldSpecifier, Debug, Copy, Clone, Eq, PartialEq)]
#[bits = 2]
pub enum AddrControl {
    Increment,
    Decrement,
    Fixed,
    IncReload,
}

#[derive(BitfieldSpecifier, Debug, Copy, Clone, Eq, PartialEq)]
#[bits = 2]
pub enum Timing {
    Now,
    VBlank,
    HBlank,
    Special,
}

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DmaControl {
    #[skip]
    __: B5,
    pub dst_ctrl: AddrControl,
    pub src_ctrl: AddrControl,
    pub repeat_en: bool,
    pub is_word: bool,
    pub gamepak_drq: bool,
    pub timing: Timing,
    pub irq_en: bool,
    pub enable: bool,
}

/// Why a DMA channel is being reconsidered.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DmaReason {
    CtrlWrite,
    VBlank,
    HBlank,
    Fifo(u8),
}

#[derive(Default, Copy, Clone)]
pub struct Dma {
    pub sad: u32,
    pub dad: u32,
    pub count: u16,
    pub ctrl: DmaControl,

    /// Internal source register
    pub(crate) src: u32,
    /// Internal destination register
    pub(crate) dst: u32,
}

/// The 4 DMA channels.
/// A trigger does not seize the bus at once; it schedules a `DmaFire`
/// event a couple cycles out, and transfers triggered while another
/// channel holds the bus wait their turn in priority order.
#[derive(Default)]
pub struct Dmas {
    pub channels: [Dma; 4],
    /// Channel currently holding the bus.
    pub(crate) running: Option<u8>,
    /// Channels that triggered while the bus was taken.
    queued: ArrayVec<u8, 3>,
}

impl Dmas {
    /// Check all channels against an external trigger.
    pub fn update_all(gg: &mut Gba, reason: DmaReason) {
        for idx in 0..4 {
            Self::trigger(gg, idx, reason);
        }
    }

    /// A sound FIFO requested a refill.
    pub fn update_fifo(gg: &mut Gba, fifo: u8) {
        for idx in 1..=2 {
            Self::trigger(gg, idx, DmaReason::Fifo(fifo));
        }
    }

    /// Handle a write to a channel's control register.
    pub fn ctrl_write(gg: &mut Gba, idx: usize, value: u16) {
        let channel = &mut gg.dma.channels[idx];
        let old_ctrl = channel.ctrl;
        let mut new_ctrl = DmaControl::from(value);
        new_ctrl.set_gamepak_drq(new_ctrl.gamepak_drq() && idx == 3);

        if !old_ctrl.enable() && new_ctrl.enable() {
            // Reload the internal registers
            channel.src = channel.sad & SRC_MASK[idx];
            channel.dst = channel.dad & DST_MASK[idx];
        }
        channel.ctrl = new_ctrl;

        Self::trigger(gg, idx, DmaReason::CtrlWrite);
    }

    fn trigger(gg: &mut Gba, idx: usize, reason: DmaReason) {
        let channel = &gg.dma.channels[idx];
        let ctrl = channel.ctrl;
        let dst = channel.dst;

        let fires = ctrl.enable()
            && match ctrl.timing() {
                Timing::Now => reason == DmaReason::CtrlWrite,
                Timing::VBlank => reason == DmaReason::VBlank,
                Timing::HBlank => reason == DmaReason::HBlank,
                Timing::Special => match reason {
                    // Only the FIFO this channel feeds triggers it.
                    DmaReason::Fifo(0) => dst == FIFO_A_ADDR,
                    DmaReason::Fifo(_) => dst == FIFO_B_ADDR,
                    _ => false,
                },
            };
        if fires {
            gg.scheduler.add(
                GbaEvent::DmaFire(idx.u8()),
                gg.scheduler.now() + START_DELAY,
            );
        }
    }

    /// A scheduled transfer start fired.
    pub fn handle_fire(gg: &mut Gba, idx: u8) {
        if !gg.dma.channels[idx.us()].ctrl.enable() {
            // Disabled between trigger and handover.
            return;
        }
        if gg.dma.running.is_some() {
            // Wait for the bus; keep priority order, drop duplicates.
            if !gg.dma.queued.contains(&idx) {
                let _ = gg.dma.queued.try_push(idx);
            }
            return;
        }

        Self::run_transfer(gg, idx);
        // Hand the bus to whoever queued up, highest priority first.
        while !gg.dma.queued.is_empty() {
            let next = (0..gg.dma.queued.len())
                .min_by_key(|i| gg.dma.queued[*i])
                .unwrap();
            let next = gg.dma.queued.remove(next);
            if gg.dma.channels[next.us()].ctrl.enable() {
                Self::run_transfer(gg, next);
            }
        }
    }

    fn run_transfer(gg: &mut Gba, idx: u8) {
        let channel = gg.dma.channels[idx.us()];
        let ctrl = channel.ctrl;
        let is_fifo = idx != 0
            && idx != 3
            && ctrl.timing() == Timing::Special
            && matches!(channel.dst, FIFO_A_ADDR | FIFO_B_ADDR);

        let count = match channel.count {
            _ if is_fifo => 4,
            0 if idx == 3 => 0x1_0000,
            0 => 0x4000,
            c => c.u32(),
        };

        if idx == 3 && gg.cart.is_eeprom_at(channel.dst) {
            if let crate::hw::cartridge::SaveType::Eeprom(eeprom) = &mut gg.cart.save_type {
                eeprom.dma3_started(count);
            }
        }

        gg.dma.running = Some(idx);
        let mut src = channel.src;
        let mut dst = channel.dst;
        let word_size = ctrl.is_word() || is_fifo;
        let (src_step, dst_step) = Self::step_sizes(ctrl, is_fifo, word_size);

        let mut access: Access = NONSEQ | DMA;
        for _ in 0..count {
            if word_size {
                let value = gg.read::<u32>(src, access);
                gg.write::<u32>(dst, value, access);
                gg.memory.dma_latch = value;
            } else {
                let value = gg.read::<u16>(src, access);
                gg.write::<u16>(dst, value, access);
                gg.memory.dma_latch = word(value, value);
            }
            src = src.wrapping_add_signed(src_step);
            dst = dst.wrapping_add_signed(dst_step);
            access = SEQ | DMA;
        }

        let channel = &mut gg.dma.channels[idx.us()];
        channel.src = src;
        channel.dst = dst;
        if !ctrl.repeat_en() {
            channel.ctrl.set_enable(false);
        } else if ctrl.dst_ctrl() == AddrControl::IncReload && !is_fifo {
            channel.dst = channel.dad & DST_MASK[idx.us()];
        }

        gg.dma.running = None;
        if ctrl.irq_en() {
            gg.request_interrupt_with_index(Interrupt::Dma0 as u16 + idx.u16());
        }
    }

    fn step_sizes(ctrl: DmaControl, is_fifo: bool, word_size: bool) -> (i32, i32) {
        let width = if word_size { 4 } else { 2 };
        let src = match ctrl.src_ctrl() {
            AddrControl::Increment | AddrControl::IncReload => width,
            AddrControl::Decrement => -width,
            AddrControl::Fixed => 0,
        };
        let dst = match ctrl.dst_ctrl() {
            _ if is_fifo => 0,
            AddrControl::Increment | AddrControl::IncReload => width,
            AddrControl::Decrement => -width,
            AddrControl::Fixed => 0,
        };
        (src, dst)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn immediate(word: bool) -> u16 {
        DmaControl::new()
            .with_is_word(word)
            .with_enable(true)
            .into()
    }

    #[test]
    fn immediate_transfer_copies_words() {
        let mut gg = Gba::without_rom();
        for i in 0..4u32 {
            gg.set(0x0200_0000 + i * 4, 0x1111_0000 + i);
        }
        gg.dma.channels[0].sad = 0x0200_0000;
        gg.dma.channels[0].dad = 0x0300_0000;
        gg.dma.channels[0].count = 4;
        Dmas::ctrl_write(&mut gg, 0, immediate(true));

        // Transfer starts a couple cycles after the trigger.
        assert_eq!(gg.get::<u32>(0x0300_0000), 0);
        gg.run_until(8);
        for i in 0..4u32 {
            assert_eq!(gg.get::<u32>(0x0300_0000 + i * 4), 0x1111_0000 + i);
        }
        assert!(!gg.dma.channels[0].ctrl.enable());
    }

    #[test]
    fn transfer_updates_bus_latch() {
        let mut gg = Gba::without_rom();
        gg.set(0x0200_0000u32, 0xCAFE_BABEu32);
        gg.dma.channels[1].sad = 0x0200_0000;
        gg.dma.channels[1].dad = 0x0300_0100;
        gg.dma.channels[1].count = 1;
        Dmas::ctrl_write(&mut gg, 1, immediate(true));
        gg.run_until(8);
        assert_eq!(gg.memory.dma_latch, 0xCAFE_BABE);
        assert!(gg.memory.dma_on_bus);
    }

    #[test]
    fn repeat_keeps_channel_enabled() {
        let mut gg = Gba::without_rom();
        gg.dma.channels[0].sad = 0x0200_0000;
        gg.dma.channels[0].dad = 0x0300_0000;
        gg.dma.channels[0].count = 1;
        let ctrl: u16 = DmaControl::new()
            .with_enable(true)
            .with_repeat_en(true)
            .with_timing(Timing::HBlank)
            .into();
        Dmas::ctrl_write(&mut gg, 0, ctrl);

        gg.run_until(8);
        // HBlank timing, so the control write alone must not fire it.
        assert!(gg.dma.channels[0].ctrl.enable());
        gg.run_until(crate::ppu::HDRAW_LEN);
        assert!(gg.dma.channels[0].ctrl.enable());
    }

    #[test]
    fn finished_transfer_requests_irq() {
        let mut gg = Gba::without_rom();
        gg.dma.channels[3].count = 1;
        let ctrl: u16 = DmaControl::from(immediate(false)).with_irq_en(true).into();
        Dmas::ctrl_write(&mut gg, 3, ctrl);
        gg.run_until(8);
        assert!(gg.cpu.if_.is_bit(Interrupt::Dma3 as u16));
    }
}
