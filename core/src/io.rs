// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

use common::numutil::{NumExt, U16Ext};

use crate::{addr::*, hw::dma::Dmas, host::Key, Gba};

/// DMA control bits that read back, per channel.
const DMA_CNT_READ_MASK: [u16; 4] = [0xF7E0, 0xF7E0, 0xF7E0, 0xFFE0];

/// The MMIO register file.
///
/// All bus accesses to the I/O region funnel through these two
/// halfword-granular entry points; the arbitrator synthesises byte and
/// word accesses from them in little-endian order. `None` means the
/// register does not exist and the access falls through to open bus.
impl Gba {
    pub(crate) fn get_mmio_hword(&self, offs: u32) -> Option<u16> {
        Some(match offs {
            DISPCNT => self.ppu.dispcnt.into(),
            GREENSWAP => 0,
            DISPSTAT => self.ppu.dispstat.into(),
            VCOUNT => self.ppu.vcount,

            SOUNDCNT_H => u16::from(self.apu.cnt) & 0x770F,
            SOUNDCNT_X => 0,
            SOUNDBIAS => self.apu.bias,

            _ if (DMA_BASE..DMA_BASE + 4 * DMA_STRIDE).contains(&offs) => {
                let ch = ((offs - DMA_BASE) / DMA_STRIDE).us();
                match (offs - DMA_BASE) % DMA_STRIDE {
                    // Word count reads zero
                    0x8 => 0,
                    0xA => u16::from(self.dma.channels[ch].ctrl) & DMA_CNT_READ_MASK[ch],
                    // SAD/DAD are write-only
                    _ => return None,
                }
            }

            _ if (TM_BASE..TM_BASE + 4 * TM_STRIDE).contains(&offs) => {
                let timer = ((offs - TM_BASE) / TM_STRIDE).us();
                if offs.is_bit(1) {
                    self.timers.control[timer].into()
                } else {
                    self.timers.time_read(timer, self.scheduler.now())
                }
            }

            KEYINPUT => self.memory.keyinput,
            KEYCNT => self.memory.keycnt.into(),

            IE => self.cpu.ie,
            IF => self.cpu.if_,
            WAITCNT => self.memory.waitcnt.into(),
            IME => self.cpu.ime as u16,
            POSTFLG => self.memory.postflg as u16,

            // Unused but decoded registers read zero
            0x086 | 0x08A | 0x136 | 0x142 | 0x15A | 0x206 | 0x20A | 0x302 => 0,

            _ => {
                log::warn!("read from unknown IO register 0x{offs:03X}, returning open bus");
                return None;
            }
        })
    }

    /// Write a halfword-sized slice of the register file. `mask` marks
    /// the byte lanes actually driven by the access.
    pub(crate) fn set_mmio_hword(&mut self, offs: u32, value: u16, mask: u16) {
        let value = value & mask;
        match offs {
            DISPCNT => {
                let raw = apply(self.ppu.dispcnt.into(), value, mask);
                self.ppu.dispcnt = raw.into();
            }
            DISPSTAT => {
                // The PPU state flags in the low bits are read-only
                let raw = apply(self.ppu.dispstat.into(), value, mask & 0xFFF8);
                self.ppu.dispstat = raw.into();
            }
            GREENSWAP | VCOUNT => (),

            SOUNDCNT_H => {
                let raw = apply(self.apu.cnt.into(), value, mask);
                self.apu.cnt = raw.into();
                if self.apu.cnt.a_reset() {
                    self.apu.reset_fifo(0);
                    self.apu.cnt.set_a_reset(false);
                }
                if self.apu.cnt.b_reset() {
                    self.apu.reset_fifo(1);
                    self.apu.cnt.set_b_reset(false);
                }
            }
            SOUNDCNT_X => (),
            SOUNDBIAS => self.apu.bias = apply(self.apu.bias, value, mask),
            FIFO_A_L | FIFO_A_H => self.push_fifo_lanes(0, value, mask),
            FIFO_B_L | FIFO_B_H => self.push_fifo_lanes(1, value, mask),

            _ if (DMA_BASE..DMA_BASE + 4 * DMA_STRIDE).contains(&offs) => {
                let ch = ((offs - DMA_BASE) / DMA_STRIDE).us();
                let channel = &mut self.dma.channels[ch];
                match (offs - DMA_BASE) % DMA_STRIDE {
                    0x0 => channel.sad = channel.sad.set_hword(0, value, mask),
                    0x2 => channel.sad = channel.sad.set_hword(1, value, mask),
                    0x4 => channel.dad = channel.dad.set_hword(0, value, mask),
                    0x6 => channel.dad = channel.dad.set_hword(1, value, mask),
                    0x8 => channel.count = apply(channel.count, value, mask),
                    _ => {
                        let new = apply(channel.ctrl.into(), value, mask);
                        Dmas::ctrl_write(self, ch, new);
                    }
                }
            }

            _ if (TM_BASE..TM_BASE + 4 * TM_STRIDE).contains(&offs) => {
                let timer = ((offs - TM_BASE) / TM_STRIDE).us();
                if offs.is_bit(1) {
                    let new = apply(self.timers.control[timer].into(), value, mask);
                    self.timers.ctrl_write(&mut self.scheduler, timer, new);
                } else {
                    self.timers.reload[timer] = apply(self.timers.reload[timer], value, mask);
                }
            }

            KEYINPUT => (),
            KEYCNT => {
                let raw = apply(self.memory.keycnt.into(), value, mask);
                self.memory.keycnt = raw.into();
                self.check_keypad_irq();
            }

            IE => {
                self.cpu.ie = apply(self.cpu.ie, value, mask);
                self.schedule_irq_update();
            }
            IF => {
                // Writing 1 acknowledges the interrupt
                self.cpu.if_ &= !value;
                self.schedule_irq_update();
            }
            WAITCNT => {
                let prev = self.memory.waitcnt;
                let raw = apply(prev.into(), value, mask & 0x7FFF);
                self.memory.waitcnt = raw.into();
                self.update_wait_times();
                if prev.prefetch_en() && !self.memory.waitcnt.prefetch_en() {
                    self.memory.prefetch.active = false;
                }
            }
            IME => {
                if mask.is_bit(0) {
                    self.cpu.ime = value.is_bit(0);
                    self.schedule_irq_update();
                }
            }
            POSTFLG => {
                if mask & 0x00FF != 0 {
                    self.memory.postflg = value.u8() & 1;
                }
                if mask & 0xFF00 != 0 {
                    // HALTCNT. Bit 7 selects stop; both suspend the CPU
                    // until an enabled interrupt arrives.
                    self.cpu.is_halted = true;
                }
            }

            _ => {
                log::warn!(
                    "write to unknown IO register 0x{offs:03X} (value {value:04X}), ignoring"
                );
            }
        }
    }

    fn push_fifo_lanes(&mut self, fifo: usize, value: u16, mask: u16) {
        if mask & 0x00FF != 0 {
            self.apu.push_fifo_sample(fifo, value.low());
        }
        if mask & 0xFF00 != 0 {
            self.apu.push_fifo_sample(fifo, value.high());
        }
    }

    /// Update the host-controlled key state.
    pub fn set_key(&mut self, key: Key, pressed: bool) {
        // KEYINPUT is active-low
        self.memory.keyinput = self.memory.keyinput.set_bit(key as u16, !pressed) & 0x03FF;
        self.check_keypad_irq();
    }

    fn check_keypad_irq(&mut self) {
        let cnt = self.memory.keycnt;
        if !cnt.irq_en() {
            return;
        }
        let pressed = !self.memory.keyinput & 0x3FF;
        let selected = cnt.keys();
        let hit = if cnt.irq_cond_and() {
            selected != 0 && pressed & selected == selected
        } else {
            pressed & selected != 0
        };
        if hit {
            self.request_interrupt(crate::cpu::Interrupt::Joypad);
        }
    }
}

#[inline]
fn apply(old: u16, value: u16, mask: u16) -> u16 {
    (old & !mask) | (value & mask)
}

/// Halfword-lane update helper for the 32-bit DMA address registers.
trait SetHword {
    fn set_hword(self, idx: u32, value: u16, mask: u16) -> u32;
}

impl SetHword for u32 {
    fn set_hword(self, idx: u32, value: u16, mask: u16) -> u32 {
        let shift = idx * 16;
        let mask = (mask as u32) << shift;
        (self & !mask) | (((value as u32) << shift) & mask)
    }
}
