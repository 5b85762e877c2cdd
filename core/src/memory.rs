// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

#![allow(unused_braces)] // modular_bitfield issue

use common::{
    components::ram::PagedRam,
    numutil::{hword, word, NumExt, U16Ext, U32Ext},
};
use modular_bitfield::{bitfield, specifiers::*};

use crate::{hw::gpio::Gpio, Gba};

pub const KB: usize = 1024;

pub mod access {
    //! Bus access attributes, combined into a bitmask.

    pub type Access = u8;
    /// A non-sequential access; the default.
    pub const NONSEQ: Access = 0;
    /// The address follows the previous access on the same bus.
    pub const SEQ: Access = 1;
    /// An opcode fetch.
    pub const CODE: Access = 2;
    /// The DMA unit owns the bus for this access.
    pub const DMA: Access = 4;
}
use access::*;

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct WaitCnt {
    pub sram: B2,
    pub ws0_n: B2,
    pub ws0_s: B1,
    pub ws1_n: B2,
    pub ws1_s: B1,
    pub ws2_n: B2,
    pub ws2_s: B1,
    #[skip]
    phi: B2,
    #[skip]
    __: B1,
    pub prefetch_en: bool,
    #[skip]
    __: B1,
}

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct KeyControl {
    pub keys: B10,
    #[skip]
    __: B4,
    pub irq_en: bool,
    pub irq_cond_and: bool,
}

/// The instruction prefetch unit on the cartridge bus.
/// It reads ahead of the CPU whenever the cartridge bus is otherwise
/// idle, making sequential opcode fetches from ROM nearly free.
#[derive(Debug, Default, Copy, Clone)]
pub struct Prefetch {
    pub active: bool,
    pub thumb: bool,
    /// Address the fetch currently on the bus will deliver.
    pub head: u32,
    /// Address the CPU will consume next.
    pub tail: u32,
    /// Entries ready in the buffer.
    pub size: u16,
    /// Cycles left on the in-flight fetch.
    pub countdown: u16,
    /// Cycles a sequential fetch costs on the current page.
    pub reload: u16,
}

impl Prefetch {
    #[inline]
    pub(crate) fn insn_len(&self) -> u32 {
        if self.thumb {
            2
        } else {
            4
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u16 {
        if self.thumb {
            8
        } else {
            4
        }
    }
}

/// The memory regions of the system along with the access-cost tables
/// and the bus state that leaks into reads: the BIOS latch, the DMA
/// latch and the prefetch unit.
pub struct Memory {
    pub bios: Box<[u8]>,
    pub ewram: PagedRam,
    pub iwram: PagedRam,
    pub vram: PagedRam,
    pub palram: PagedRam,
    pub oam: PagedRam,

    // Various registers
    pub waitcnt: WaitCnt,
    pub keyinput: u16,
    pub keycnt: KeyControl,
    pub postflg: u8,

    /// Value of the last successful BIOS read, returned when reading
    /// BIOS with PC outside of it.
    pub(crate) bios_value: u32,
    /// Last word the DMA unit moved across the bus.
    pub(crate) dma_latch: u32,
    /// Was the last bus access performed by DMA?
    pub(crate) dma_on_bus: bool,
    pub(crate) gamepak_bus_in_use: bool,

    pub(crate) prefetch: Prefetch,
    wait_word: [u16; 32],
    wait_other: [u16; 32],
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            bios: vec![0; 16 * KB].into_boxed_slice(),
            ewram: PagedRam::new(256 * KB),
            iwram: PagedRam::new(32 * KB),
            vram: PagedRam::new(96 * KB),
            palram: PagedRam::new(KB),
            oam: PagedRam::new(KB),
            waitcnt: WaitCnt::default(),
            keyinput: 0x03FF,
            keycnt: KeyControl::default(),
            postflg: 0,
            bios_value: 0xE129_F000,
            dma_latch: 0,
            dma_on_bus: false,
            gamepak_bus_in_use: false,
            prefetch: Prefetch::default(),
            wait_word: [1; 32],
            wait_other: [1; 32],
        }
    }
}

impl Gba {
    /// Read a value, charging the access cost to the scheduler and
    /// updating the bus latches.
    pub fn read<T: NumExt>(&mut self, addr: u32, access: Access) -> T {
        self.charge_access::<T>(addr, access);
        let value = if T::WIDTH == 2 && self.cart.is_eeprom_at(addr) {
            T::from_u16(self.cart.read_eeprom())
        } else {
            self.get::<T>(addr)
        };

        self.memory.dma_on_bus = access & DMA != 0;
        if access & CODE != 0 {
            self.cpu.pipeline[0] = self.cpu.pipeline[1];
            self.cpu.pipeline[1] = value.u32();
        }
        if addr < 0x4000 && self.cpu.pc_in_bios() {
            self.memory.bios_value = value.u32();
        }
        value
    }

    /// Read a possibly unaligned value the way the ARM7TDMI sees it:
    /// the aligned value rotated right by the misalignment.
    pub fn read_rotated<T: NumExt>(&mut self, addr: u32, access: Access) -> u32 {
        let value = self.read::<T>(addr, access);
        let by = (addr & (T::WIDTH - 1)) * 8;
        value.u32().rotate_right(by)
    }

    /// Write a value, charging the access cost to the scheduler.
    pub fn write<T: NumExt>(&mut self, addr: u32, value: T, access: Access) {
        self.charge_access::<T>(addr, access);
        self.memory.dma_on_bus = access & DMA != 0;
        self.set(addr, value);
    }

    /// Read a value without charging cycles or touching bus state.
    /// Used by the debugger and the snapshot codec.
    pub fn get<T: NumExt>(&self, addr_unaligned: u32) -> T {
        let addr = addr_unaligned & !(T::WIDTH - 1);
        let a = (addr & 0xFF_FFFF).us();
        match addr >> 24 {
            0x00 if addr < 0x4000 => {
                if self.cpu.pc_in_bios() {
                    read_slice::<T>(&self.memory.bios, a)
                        .unwrap_or_else(|| T::from_u32(self.invalid_read(addr_unaligned)))
                } else {
                    T::from_u32(self.memory.bios_value)
                }
            }
            0x02 => self.memory.ewram.read(a & 0x3_FFFF),
            0x03 => self.memory.iwram.read(a & 0x7FFF),
            0x04 => match self.mmio_read::<T>(addr) {
                Some(value) => value,
                None => T::from_u32(self.invalid_read(addr_unaligned)),
            },
            0x05 => self.memory.palram.read(a & 0x3FF),
            0x06 => self.memory.vram.read(Self::vram_offs(addr)),
            0x07 => self.memory.oam.read(a & 0x3FF),
            0x08..=0x0D => self.cart_read::<T>(addr),
            0x0E | 0x0F => {
                // The 8-bit SRAM bus repeats the byte across all lanes
                let byte = self.cart.read_ram_byte((addr_unaligned & 0xFFFF).us());
                match T::WIDTH {
                    1 => T::from_u8(byte),
                    2 => T::from_u16(hword(byte, byte)),
                    _ => T::from_u32(word(hword(byte, byte), hword(byte, byte))),
                }
            }
            _ => T::from_u32(self.invalid_read(addr_unaligned)),
        }
    }

    /// Write a value without charging cycles. Region write quirks
    /// still apply.
    pub fn set<T: NumExt>(&mut self, addr_unaligned: u32, value: T) {
        let addr = addr_unaligned & !(T::WIDTH - 1);
        let a = (addr & 0xFF_FFFF).us();
        match addr >> 24 {
            0x02 => self.memory.ewram.write(a & 0x3_FFFF, value),
            0x03 => self.memory.iwram.write(a & 0x7FFF, value),
            0x04 => self.mmio_write(addr, value),

            // Byte stores to palette land in both lanes of the halfword
            0x05 if T::WIDTH == 1 => {
                let v = value.u8();
                self.memory.palram.write(a & 0x3FE, hword(v, v));
            }
            0x05 => self.memory.palram.write(a & 0x3FF, value),

            0x06 if T::WIDTH == 1 => {
                // Byte stores only land in BG VRAM; OBJ VRAM drops them
                let offs = Self::vram_offs(addr);
                let obj_start = if self.ppu.is_bitmap_mode() {
                    0x14000
                } else {
                    0x10000
                };
                if offs < obj_start {
                    let v = value.u8();
                    self.memory.vram.write(offs & !1, hword(v, v));
                }
            }
            0x06 => self.memory.vram.write(Self::vram_offs(addr), value),

            // Byte stores to OAM are dropped
            0x07 if T::WIDTH == 1 => (),
            0x07 => self.memory.oam.write(a & 0x3FF, value),

            0x08..=0x0D => {
                if T::WIDTH == 2 && self.cart.is_eeprom_at(addr) {
                    self.cart.write_eeprom(value.u16());
                } else if Gpio::is_gpio_addr(addr) && T::WIDTH >= 2 {
                    self.gpio.write(addr, value.u16());
                    if T::WIDTH == 4 {
                        self.gpio.write(addr + 2, value.u32().high());
                    }
                }
                // ROM is not writable
            }

            0x0E | 0x0F => {
                // Only the byte lane matching the bus rotation lands
                let byte = match T::WIDTH {
                    1 => value.u8(),
                    2 if addr_unaligned.is_bit(0) => value.u16().high(),
                    2 => value.u8(),
                    _ => (value.u32() >> ((addr_unaligned & 3) * 8)).u8(),
                };
                self.cart.write_ram_byte((addr_unaligned & 0xFFFF).us(), byte);
            }

            _ => log::trace!("write to unmapped address 0x{addr:08X}, ignoring"),
        }
    }

    fn cart_read<T: NumExt>(&self, addr: u32) -> T {
        if Gpio::is_gpio_addr(addr) && self.gpio.is_readable() && T::WIDTH >= 2 {
            let value = self.gpio.read(addr);
            return match T::WIDTH {
                2 => T::from_u16(value),
                _ => T::from_u32(word(value, self.gpio.read(addr + 2))),
            };
        }
        if T::WIDTH == 2 && self.cart.is_eeprom_at(addr) {
            return T::from_u16(self.cart.peek_eeprom());
        }

        let offs = (addr & 0x1FF_FFFF).us();
        match read_slice::<T>(&self.cart.rom, offs) {
            Some(value) => value,
            // Past the ROM the data lines float to "address as data"
            None => {
                let mask = if T::WIDTH == 4 { !3u32 } else { !1 };
                let low = ((addr & mask) >> 1).u16();
                T::from_u32(word(low, low.wrapping_add(1)))
            }
        }
    }

    /// Synthesise an open-bus value: whatever the bus carried last,
    /// which is the prefetched opcode, or the DMA latch if the DMA unit
    /// drove the bus more recently.
    /// See GBATek, "GBA Unpredictable Things".
    pub(crate) fn invalid_read(&self, addr: u32) -> u32 {
        log::trace!("open bus read at 0x{addr:08X}");
        let value = if self.memory.dma_on_bus {
            self.memory.dma_latch
        } else if !self.cpu.is_thumb() {
            self.cpu.pipeline[1]
        } else {
            let last = self.cpu.pipeline[1].u16();
            let prev = self.cpu.pipeline[0].u16();
            let pc = self.cpu.pc();
            match pc >> 24 {
                // Single fetch repeated across both halves
                0x02 | 0x05 | 0x06 | 0x08..=0x0D => word(last, last),
                // BIOS/OAM leak the older pipeline stage into the low half
                0x00 | 0x07 => word(prev, last),
                // IWRAM interleaves by opcode alignment
                0x03 if pc & 3 == 0 => word(last, prev),
                0x03 => word(prev, last),
                _ => word(last, last),
            }
        };
        value >> ((addr & 3) << 3)
    }

    fn mmio_read<T: NumExt>(&self, addr: u32) -> Option<T> {
        let offs = addr - 0x0400_0000;
        if offs >= 0x400 {
            return None;
        }
        Some(match T::WIDTH {
            1 => T::from_u16(self.get_mmio_hword(offs & !1)? >> ((offs & 1) * 8)),
            2 => T::from_u16(self.get_mmio_hword(offs)?),
            _ => {
                let lo = self.get_mmio_hword(offs)?;
                let hi = self.get_mmio_hword(offs + 2)?;
                T::from_u32(word(lo, hi))
            }
        })
    }

    fn mmio_write<T: NumExt>(&mut self, addr: u32, value: T) {
        let offs = addr - 0x0400_0000;
        if offs >= 0x400 {
            return;
        }
        match T::WIDTH {
            1 => {
                let shift = (offs & 1).u16() * 8;
                self.set_mmio_hword(offs & !1, value.u16() << shift, 0xFF << shift);
            }
            2 => self.set_mmio_hword(offs, value.u16(), 0xFFFF),
            _ => {
                let value = value.u32();
                self.set_mmio_hword(offs, value.low(), 0xFFFF);
                self.set_mmio_hword(offs + 2, value.high(), 0xFFFF);
            }
        }
    }

    #[inline]
    fn vram_offs(addr: u32) -> usize {
        // 96 KiB mirrored in 128 KiB steps, upper 32 KiB folded down
        let a = (addr & 0x1_FFFF).us();
        if a >= 0x1_8000 {
            a - 0x8000
        } else {
            a
        }
    }

    /// Charge the cycle cost of an access, advancing the prefetcher
    /// when the access leaves the cartridge bus idle.
    fn charge_access<T: NumExt>(&mut self, addr: u32, access: Access) {
        match addr >> 24 {
            0x08..=0x0D => {
                self.memory.gamepak_bus_in_use = true;
                self.cart_charge::<T>(addr, access);
            }
            0x0E | 0x0F => {
                self.memory.gamepak_bus_in_use = true;
                let cycles = self.wait_time(addr, access, T::WIDTH);
                self.tick(cycles.into());
            }
            _ => {
                self.memory.gamepak_bus_in_use = false;
                let cycles = self.wait_time(addr, access, T::WIDTH);
                self.step_prefetch(cycles);
                self.tick(cycles.into());
            }
        }
    }

    fn cart_charge<T: NumExt>(&mut self, addr: u32, access: Access) {
        // A 128 KiB page boundary always breaks the sequence
        let access = if addr & 0x1_FFFF == 0 {
            access & !SEQ
        } else {
            access
        };

        if !self.memory.waitcnt.prefetch_en() || access & DMA != 0 {
            // Prefetch is bypassed but keeps its state; it resumes once
            // the DMA unit releases the bus.
            let cycles = self.wait_time(addr, access, T::WIDTH);
            self.tick(cycles.into());
            return;
        }

        let len = self.memory.prefetch.insn_len();
        let pf = &mut self.memory.prefetch;
        if pf.active && addr == pf.tail {
            if pf.size > 0 {
                // Buffer hit: one cycle, and the in-flight fetch keeps
                // the cartridge bus for itself.
                pf.tail = pf.tail.wrapping_add(len);
                pf.size -= 1;
                self.step_prefetch(1);
                self.tick(1);
                return;
            }
            // The fetch for exactly this address is on the bus now;
            // wait for it to land.
            let wait = pf.countdown;
            pf.tail = pf.tail.wrapping_add(len);
            pf.head = pf.tail;
            pf.countdown = pf.reload;
            self.tick(wait.into());
            return;
        }

        // Miss: restart the stream behind this access.
        let cycles = self.wait_time(addr, access, T::WIDTH);
        let thumb = self.cpu.is_thumb();
        let reload = self.wait_time(addr, SEQ, if thumb { 2 } else { 4 });
        let len = if thumb { 2 } else { 4 };
        let pf = &mut self.memory.prefetch;
        pf.active = true;
        pf.thumb = thumb;
        pf.tail = addr.wrapping_add(len);
        pf.head = pf.tail;
        pf.size = 0;
        pf.reload = reload;
        pf.countdown = reload;
        self.tick(cycles.into());
    }

    /// Advance the prefetch unit by the given number of cycles during
    /// which the cartridge bus is free for it.
    pub(crate) fn step_prefetch(&mut self, mut cycles: u16) {
        if !self.memory.waitcnt.prefetch_en() {
            return;
        }
        let pf = &mut self.memory.prefetch;
        if !pf.active {
            return;
        }
        let len = pf.insn_len();
        let capacity = pf.capacity();
        while pf.size < capacity && cycles >= pf.countdown {
            cycles -= pf.countdown;
            pf.head = pf.head.wrapping_add(len);
            pf.size += 1;
            pf.countdown = pf.reload;
        }
        if pf.size < capacity {
            pf.countdown -= cycles;
        }
    }

    /// Tabulated cost of an access, in cycles.
    fn wait_time(&self, addr: u32, access: Access, width: u32) -> u16 {
        if addr > 0x0FFF_FFFF {
            return 1;
        }
        let idx = (addr >> 24).us() + if access & SEQ != 0 { 16 } else { 0 };
        if width == 4 {
            self.memory.wait_word[idx]
        } else {
            self.memory.wait_other[idx]
        }
    }

    /// Rebuild the cost tables; called whenever WAITCNT changes.
    pub(crate) fn update_wait_times(&mut self) {
        for i in 0..16usize {
            let addr = i.u32() * 0x100_0000;
            self.memory.wait_other[i] = self.calc_wait_time::<2>(addr, NONSEQ);
            self.memory.wait_word[i] = self.calc_wait_time::<4>(addr, NONSEQ);
            self.memory.wait_other[i + 16] = self.calc_wait_time::<2>(addr, SEQ);
            self.memory.wait_word[i + 16] = self.calc_wait_time::<4>(addr, SEQ);
        }
    }

    const WS_NONSEQ: [u16; 4] = [5, 4, 3, 9];

    fn calc_wait_time<const W: u32>(&self, addr: u32, ty: Access) -> u16 {
        let wait = &self.memory.waitcnt;
        match (addr, W, ty) {
            (0x0200_0000..=0x02FF_FFFF, 4, _) => 6,
            (0x0200_0000..=0x02FF_FFFF, _, _) => 3,
            (0x0500_0000..=0x06FF_FFFF, 4, _) => 2,

            (0x0800_0000..=0x0DFF_FFFF, 4, _) => {
                // The cart bus is 16 bits; a word access is 1N + 1S
                self.calc_wait_time::<2>(addr, ty) + self.calc_wait_time::<2>(addr, SEQ)
            }

            (0x0800_0000..=0x09FF_FFFF, _, SEQ) => 3 - wait.ws0_s().u16(),
            (0x0800_0000..=0x09FF_FFFF, _, _) => Self::WS_NONSEQ[wait.ws0_n().us()],

            (0x0A00_0000..=0x0BFF_FFFF, _, SEQ) => 5 - (wait.ws1_s().u16() * 3),
            (0x0A00_0000..=0x0BFF_FFFF, _, _) => Self::WS_NONSEQ[wait.ws1_n().us()],

            (0x0C00_0000..=0x0DFF_FFFF, _, SEQ) => 9 - (wait.ws2_s().u16() * 7),
            (0x0C00_0000..=0x0DFF_FFFF, _, _) => Self::WS_NONSEQ[wait.ws2_n().us()],

            (0x0E00_0000..=0x0FFF_FFFF, _, _) => Self::WS_NONSEQ[wait.sram().us()],

            _ => 1,
        }
    }
}

/// Little-endian read out of a byte slice, `None` past the end.
fn read_slice<T: NumExt>(slice: &[u8], offs: usize) -> Option<T> {
    if offs + T::WIDTH.us() > slice.len() {
        return None;
    }
    let mut value = 0u32;
    for i in (0..T::WIDTH.us()).rev() {
        value = (value << 8) | slice[offs + i] as u32;
    }
    Some(T::from_u32(value))
}

#[cfg(test)]
mod test {
    use super::*;

    fn gba_with_rom() -> Box<Gba> {
        let mut rom = vec![0; 0x100];
        for (i, byte) in rom.iter_mut().enumerate() {
            *byte = i as u8;
        }
        Gba::new(rom)
    }

    #[test]
    fn ram_round_trip() {
        let mut gg = Gba::without_rom();
        gg.set(0x0200_1234u32, 0xDEAD_BEEFu32);
        assert_eq!(gg.get::<u32>(0x0200_1234), 0xDEAD_BEEF);
        // EWRAM mirrors every 256 KiB
        assert_eq!(gg.get::<u32>(0x0204_1234), 0xDEAD_BEEF);
        gg.set(0x0300_0FF0u32, 0x55u8);
        assert_eq!(gg.get::<u8>(0x0300_0FF0), 0x55);
    }

    #[test]
    fn palram_byte_store_mirrors_lanes() {
        let mut gg = Gba::without_rom();
        gg.set(0x0500_0043u32, 0xABu8);
        assert_eq!(gg.get::<u16>(0x0500_0042), 0xABAB);
        gg.set(0x0500_0042u32, 0xCDu8);
        assert_eq!(gg.get::<u16>(0x0500_0042), 0xCDCD);
    }

    #[test]
    fn vram_obj_byte_store_dropped() {
        let mut gg = Gba::without_rom();
        // BG VRAM takes the duplicated byte
        gg.set(0x0600_0001u32, 0x12u8);
        assert_eq!(gg.get::<u16>(0x0600_0000), 0x1212);
        // OBJ VRAM drops it (mode 0: OBJ base is 0x10000)
        gg.set(0x0601_0000u32, 0x34u8);
        assert_eq!(gg.get::<u16>(0x0601_0000), 0);
        // In bitmap modes the boundary moves up
        gg.ppu.dispcnt.set_bg_mode(3);
        gg.set(0x0601_0000u32, 0x34u8);
        assert_eq!(gg.get::<u16>(0x0601_0000), 0x3434);
        gg.set(0x0601_4000u32, 0x56u8);
        assert_eq!(gg.get::<u16>(0x0601_4000), 0);
    }

    #[test]
    fn oam_byte_store_dropped() {
        let mut gg = Gba::without_rom();
        gg.set(0x0700_0010u32, 0x99u8);
        assert_eq!(gg.get::<u16>(0x0700_0010), 0);
        gg.set(0x0700_0010u32, 0x1234u16);
        assert_eq!(gg.get::<u16>(0x0700_0010), 0x1234);
    }

    #[test]
    fn rom_reads_and_oob_pattern() {
        let gg = gba_with_rom();
        assert_eq!(gg.get::<u8>(0x0800_0004), 4);
        assert_eq!(gg.get::<u16>(0x0800_0004), 0x0504);
        // Mirrors in the other waitstate windows
        assert_eq!(gg.get::<u16>(0x0A00_0004), 0x0504);
        assert_eq!(gg.get::<u16>(0x0C00_0004), 0x0504);
        // Out of bounds: address-as-data
        assert_eq!(gg.get::<u16>(0x0800_2000), 0x1000);
        assert_eq!(gg.get::<u32>(0x0800_2000), 0x1001_1000);
    }

    #[test]
    fn rotated_read_matches_manual_rotation() {
        let mut gg = Gba::without_rom();
        gg.set(0x0200_0000u32, 0x1234_5678u32);
        for misalign in 0..4 {
            let addr = 0x0200_0000 + misalign;
            let plain = gg.read::<u32>(addr & !3, NONSEQ);
            let rotated = gg.read_rotated::<u32>(addr, NONSEQ);
            assert_eq!(rotated, plain.rotate_right(8 * misalign));
        }
    }

    #[test]
    fn sram_wide_reads_broadcast_byte() {
        let mut gg = Gba::new({
            let mut rom = vec![0; 0xC0];
            rom.extend_from_slice(b"SRAM_V113");
            rom
        });
        gg.set(0x0E00_0010u32, 0x7Eu8);
        assert_eq!(gg.get::<u16>(0x0E00_0010), 0x7E7E);
        assert_eq!(gg.get::<u32>(0x0E00_0010), 0x7E7E_7E7E);
    }

    #[test]
    fn sram_wide_write_uses_rotated_lane() {
        let mut gg = Gba::new({
            let mut rom = vec![0; 0xC0];
            rom.extend_from_slice(b"SRAM_V113");
            rom
        });
        // A halfword store at an odd address lands its high byte
        gg.set(0x0E00_0021u32, 0xAABBu16);
        assert_eq!(gg.get::<u8>(0x0E00_0021), 0xAA);
        // A word store lands the lane matching the bus rotation
        gg.set(0x0E00_0032u32, 0x4433_2211u32);
        assert_eq!(gg.get::<u8>(0x0E00_0032), 0x33);
    }

    #[test]
    fn bios_reads_latch_outside_pc() {
        let mut gg = Gba::without_rom();
        gg.memory.bios[0x10..0x14].copy_from_slice(&[0x11, 0x22, 0x33, 0x44]);
        // PC inside BIOS: real read, updates the latch
        gg.cpu.registers[15] = 0x0000_0008;
        assert_eq!(gg.read::<u32>(0x0000_0010, NONSEQ), 0x4433_2211);
        // PC outside: the latch is returned instead
        gg.cpu.registers[15] = 0x0800_0000;
        assert_eq!(gg.read::<u32>(0x0000_0020, NONSEQ), 0x4433_2211);
        // BIOS is not writable
        gg.set(0x0000_0010u32, 0u32);
        gg.cpu.registers[15] = 0x0000_0008;
        assert_eq!(gg.get::<u32>(0x0000_0010), 0x4433_2211);
    }

    #[test]
    fn open_bus_uses_pipeline() {
        let mut gg = Gba::without_rom();
        gg.cpu.pipeline = [0x1111_2222, 0x3333_4444];
        // ARM mode: last prefetched opcode
        assert_eq!(gg.get::<u32>(0x0100_0000), 0x3333_4444);
        // Thumb in EWRAM: halfword repeated
        gg.cpu.set_thumb(true);
        gg.cpu.registers[15] = 0x0200_0000;
        assert_eq!(gg.get::<u32>(0x0100_0000), 0x4444_4444);
    }

    #[test]
    fn open_bus_uses_dma_latch_after_dma() {
        let mut gg = Gba::without_rom();
        gg.memory.dma_latch = 0x0BAD_F00D;
        gg.memory.dma_on_bus = true;
        assert_eq!(gg.get::<u32>(0x0100_0000), 0x0BAD_F00D);
        assert_eq!(gg.get::<u8>(0x0100_0001), 0xF0);
    }

    #[test]
    fn default_wait_table_values() {
        let mut gg = Gba::without_rom();
        // WAITCNT = 0: WS0 is 5N/3S for halfwords, 8N/6S for words
        assert_eq!(gg.wait_time(0x0800_0000, NONSEQ, 2), 5);
        assert_eq!(gg.wait_time(0x0800_0000, SEQ, 2), 3);
        assert_eq!(gg.wait_time(0x0800_0000, NONSEQ, 4), 8);
        assert_eq!(gg.wait_time(0x0800_0000, SEQ, 4), 6);
        assert_eq!(gg.wait_time(0x0200_0000, SEQ, 4), 6);
        assert_eq!(gg.wait_time(0x0300_0000, NONSEQ, 4), 1);

        // Fastest ROM setting: 3N/2S halfwords
        gg.set_mmio_hword(crate::addr::WAITCNT, 0x0018, 0xFFFF);
        assert_eq!(gg.wait_time(0x0800_0000, NONSEQ, 2), 3);
        assert_eq!(gg.wait_time(0x0800_0000, SEQ, 2), 2);
    }

    #[test]
    fn cart_boundary_forces_nonseq() {
        let mut gg = gba_with_rom();
        let seq = gg.wait_time(0x0802_0000, SEQ, 2);
        let nonseq = gg.wait_time(0x0802_0000, NONSEQ, 2);
        assert_ne!(seq, nonseq);

        let start = gg.scheduler.now();
        gg.read::<u16>(0x0802_0000, SEQ);
        assert_eq!(gg.scheduler.now() - start, nonseq as u64);
        let start = gg.scheduler.now();
        gg.read::<u16>(0x0802_0002, SEQ);
        assert_eq!(gg.scheduler.now() - start, seq as u64);
    }

    #[test]
    fn prefetch_sequential_hit_costs_one_cycle() {
        let mut gg = gba_with_rom();
        gg.cpu.set_thumb(true);
        gg.memory.waitcnt.set_prefetch_en(true);
        gg.update_wait_times();

        // Miss fills the stream state
        let start = gg.scheduler.now();
        gg.read::<u16>(0x0800_0100, CODE);
        assert_eq!(gg.scheduler.now() - start, 5);

        // Let the buffer fetch ahead during idle time
        gg.idle_for(8);
        assert!(gg.memory.prefetch.size > 0);

        // Sequential hit is a single cycle, not the tabulated cost
        let start = gg.scheduler.now();
        gg.read::<u16>(0x0800_0102, CODE | SEQ);
        assert_eq!(gg.scheduler.now() - start, 1);
    }

    #[test]
    fn prefetch_size_stays_bounded() {
        let mut gg = gba_with_rom();
        gg.cpu.set_thumb(true);
        gg.memory.waitcnt.set_prefetch_en(true);
        gg.update_wait_times();
        gg.read::<u16>(0x0800_0000, CODE);
        gg.idle_for(1000);
        assert_eq!(gg.memory.prefetch.size, 8);
        gg.cpu.set_thumb(false);
        gg.read::<u32>(0x0800_0200, CODE);
        gg.idle_for(1000);
        assert_eq!(gg.memory.prefetch.size, 4);
    }

    #[test]
    fn prefetch_in_flight_wait() {
        let mut gg = gba_with_rom();
        gg.cpu.set_thumb(true);
        gg.memory.waitcnt.set_prefetch_en(true);
        gg.update_wait_times();
        gg.read::<u16>(0x0800_0100, CODE);

        // Give the in-flight fetch one cycle of its three
        gg.idle_for(1);
        assert_eq!(gg.memory.prefetch.size, 0);
        // Consuming it now waits out the remaining two
        let start = gg.scheduler.now();
        gg.read::<u16>(0x0800_0102, CODE | SEQ);
        assert_eq!(gg.scheduler.now() - start, 2);
    }
}