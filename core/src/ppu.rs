// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

#![allow(unused_braces)] // modular_bitfield issue

use std::sync::atomic::Ordering;

use common::Colour;
use modular_bitfield::{bitfield, specifiers::*};

use crate::{
    cpu::Interrupt,
    hw::dma::{Dmas, DmaReason},
    scheduling::PpuEvent,
    Gba,
};

pub const WIDTH: usize = 240;
pub const HEIGHT: usize = 160;

/// Cycles of the visible part of a scanline.
pub const HDRAW_LEN: u64 = 960;
/// Cycles of a full scanline including HBlank.
pub const SCANLINE_LEN: u64 = 1232;
/// Scanlines per frame including VBlank.
pub const LINES: u16 = 228;

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DisplayControl {
    pub bg_mode: B3,
    pub cgb_mode: bool,
    pub frame_select: bool,
    pub hblank_oam_free: bool,
    pub obj_mapping_1d: bool,
    pub forced_blank: bool,
    pub bg_en: B4,
    pub obj_en: bool,
    pub win0_en: bool,
    pub win1_en: bool,
    pub winobj_en: bool,
}

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct DisplayStatus {
    pub in_vblank: bool,
    pub in_hblank: bool,
    pub vcount_match: bool,
    pub vblank_irq_en: bool,
    pub hblank_irq_en: bool,
    pub vcount_irq_en: bool,
    #[skip]
    __: B2,
    pub vcount_compare: B8,
}

/// PPU state visible to the bus and the scheduler.
///
/// Layer rendering lives outside this crate; external renderers fill
/// `framebuffer` and the core publishes it to the host when a frame
/// completes. What the core itself tracks is display timing: VCOUNT,
/// the DISPSTAT flags, and the DISPCNT mode bits that change VRAM
/// write behaviour.
pub struct Ppu {
    pub dispcnt: DisplayControl,
    pub dispstat: DisplayStatus,
    pub vcount: u16,
    pub framebuffer: Vec<Colour>,
}

impl Default for Ppu {
    fn default() -> Self {
        Self {
            dispcnt: DisplayControl::default(),
            dispstat: DisplayStatus::default(),
            vcount: 0,
            framebuffer: vec![[0, 0, 0, 255]; WIDTH * HEIGHT],
        }
    }
}

impl Ppu {
    /// Is the PPU in one of the bitmap modes 3-5? Affects the OBJ VRAM
    /// boundary for byte writes.
    #[inline]
    pub fn is_bitmap_mode(&self) -> bool {
        self.dispcnt.bg_mode() >= 3
    }

    pub fn handle_event(gg: &mut Gba, event: PpuEvent) {
        match event {
            PpuEvent::HdrawEnd => Self::hblank_start(gg),
            PpuEvent::HblankEnd => Self::hblank_end(gg),
        }
    }

    fn hblank_start(gg: &mut Gba) {
        gg.ppu.dispstat.set_in_hblank(true);
        if gg.ppu.dispstat.hblank_irq_en() {
            gg.request_interrupt(Interrupt::HBlank);
        }

        if gg.ppu.vcount < HEIGHT as u16 {
            let line = gg.ppu.vcount;
            Dmas::update_all(gg, DmaReason::HBlank);
            // Rendered line is done; let the host observe it. The sink
            // runs with no locks held and must not block.
            if let Some(mut sink) = gg.video_sink.take() {
                sink(line);
                gg.video_sink = Some(sink);
            }
        }
    }

    fn hblank_end(gg: &mut Gba) {
        gg.ppu.dispstat.set_in_hblank(false);
        gg.ppu.vcount += 1;

        match gg.ppu.vcount {
            v if v == HEIGHT as u16 => {
                gg.ppu.dispstat.set_in_vblank(true);
                if gg.ppu.dispstat.vblank_irq_en() {
                    gg.request_interrupt(Interrupt::VBlank);
                }
                Dmas::update_all(gg, DmaReason::VBlank);
            }
            // The hardware clears the flag one line early.
            v if v == LINES - 1 => gg.ppu.dispstat.set_in_vblank(false),
            v if v == LINES => {
                gg.ppu.vcount = 0;
                Self::finish_frame(gg);
            }
            _ => (),
        }

        let matches = gg.ppu.vcount == gg.ppu.dispstat.vcount_compare() as u16;
        gg.ppu.dispstat.set_vcount_match(matches);
        if matches && gg.ppu.dispstat.vcount_irq_en() {
            gg.request_interrupt(Interrupt::VCounter);
        }
    }

    /// Publish the finished frame and, if backup storage was written,
    /// a fresh copy of it for the host to persist.
    fn finish_frame(gg: &mut Gba) {
        {
            let mut frame = gg.shared.frame.lock().unwrap();
            frame.pixels.copy_from_slice(&gg.ppu.framebuffer);
        }
        gg.shared.frame_count.fetch_add(1, Ordering::Release);
        gg.shared.frame_version.fetch_add(1, Ordering::Release);

        if gg.cart.dirty {
            gg.cart.dirty = false;
            *gg.shared.save.lock().unwrap() = gg.cart.ram.clone();
            gg.shared.save_dirty.store(true, Ordering::Release);
        }
    }
}
