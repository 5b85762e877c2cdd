// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! Quicksave codec.
//!
//! A save state is a 16-byte header followed by tagged chunks:
//! `{u32 kind, u32 size, u8[size] payload}`, all little-endian. Memory
//! regions are run-length encoded when that is strictly smaller than
//! the raw bytes. Unknown chunk kinds are skipped on load so newer
//! streams keep loading on older cores. Streams without the magic are
//! fed to the legacy flat-layout loader, which older versions produced.
//!
//! Everything is written field by field; no struct is ever copied as
//! raw memory, keeping the format independent of layout and platform.

use common::{
    components::scheduler::{EventIdx, EventSlot},
    Time,
};
use thiserror::Error;

use crate::{
    hw::cartridge::{EepromCmd, EepromSize, EepromState, FlashCmdStage, FlashMode, FlashState, SaveType},
    scheduling::{ApuEvent, GbaEvent, PpuEvent},
    Gba,
};

pub const MAGIC: [u8; 4] = *b"HSQS";
pub const VERSION: u32 = 2;

// Chunk kinds.
const CHUNK_CPU: u32 = 1;
const CHUNK_IO: u32 = 2;
const CHUNK_PPU: u32 = 3;
const CHUNK_GPIO: u32 = 4;
const CHUNK_APU: u32 = 5;
const CHUNK_SCHED: u32 = 6;
const CHUNK_SCHED_EVENTS: u32 = 7;
const CHUNK_MEM_META: u32 = 8;
const CHUNK_EWRAM: u32 = 9;
const CHUNK_IWRAM: u32 = 10;
const CHUNK_VRAM: u32 = 11;
const CHUNK_PALRAM: u32 = 12;
const CHUNK_OAM: u32 = 13;
const CHUNK_BACKUP: u32 = 14;

/// Chunks that must be present for a load to commit: all scalar state
/// plus the five memory regions.
const MANDATORY: [u32; 12] = [
    CHUNK_CPU,
    CHUNK_IO,
    CHUNK_PPU,
    CHUNK_GPIO,
    CHUNK_APU,
    CHUNK_SCHED,
    CHUNK_MEM_META,
    CHUNK_EWRAM,
    CHUNK_IWRAM,
    CHUNK_VRAM,
    CHUNK_PALRAM,
    CHUNK_OAM,
];

// Serialised sizes of the scalar chunks.
const CPU_SIZE: usize = 88;
const IO_SIZE: usize = 160;
const PPU_SIZE: usize = 8;
const GPIO_SIZE: usize = 4;
const APU_SIZE: usize = 80;
const SCHED_SIZE: usize = 20;
const EVENT_SIZE: usize = 36;
const MEM_META_SIZE: usize = 76;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SaveStateError {
    /// The state was taken under a different ROM.
    #[error("save state does not match the loaded ROM")]
    Mismatch,
    /// Truncated or inconsistent stream. The emulator may be left
    /// partially restored and should be reset.
    #[error("save state is corrupt")]
    Corrupt,
}

use SaveStateError::*;

impl Gba {
    /// Serialise the full emulator state. Only meaningful between
    /// instructions, which is the only time the core calls it.
    pub fn save_state(&self) -> Vec<u8> {
        let mut w = Writer::default();
        w.bytes(&MAGIC);
        w.u32(VERSION);
        w.u32(self.cart.rom.len() as u32);
        w.u32(self.cart.rom_code());

        self.write_cpu(&mut w);
        self.write_io(&mut w);
        self.write_ppu(&mut w);
        self.write_gpio(&mut w);
        self.write_apu(&mut w);
        self.write_scheduler(&mut w);
        self.write_mem_meta(&mut w);

        write_region(&mut w, CHUNK_EWRAM, &self.memory.ewram.to_vec());
        write_region(&mut w, CHUNK_IWRAM, &self.memory.iwram.to_vec());
        write_region(&mut w, CHUNK_VRAM, &self.memory.vram.to_vec());
        write_region(&mut w, CHUNK_PALRAM, &self.memory.palram.to_vec());
        write_region(&mut w, CHUNK_OAM, &self.memory.oam.to_vec());

        if !self.cart.ram.is_empty() {
            self.write_backup(&mut w);
        }
        w.buf
    }

    /// Restore a state produced by [Gba::save_state].
    /// On [SaveStateError::Mismatch] the emulator is untouched; on
    /// [SaveStateError::Corrupt] it may be partially restored and
    /// needs a reset.
    pub fn load_state(&mut self, data: &[u8]) -> Result<(), SaveStateError> {
        let mut r = Reader::new(data);
        if data.len() >= 4 && data[..4] == MAGIC {
            r.skip(4)?;
            let version = r.u32()?;
            if version != VERSION {
                log::warn!("save state has unknown version {version}, refusing to load");
                return Err(Corrupt);
            }
            self.load_state_v2(r)
        } else {
            self.load_state_v1(r)
        }
    }

    fn load_state_v2(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        let rom_size = r.u32()?;
        let rom_code = r.u32()?;
        if rom_size != self.cart.rom.len() as u32 || rom_code != self.cart.rom_code() {
            log::warn!("save state was taken under a different ROM, refusing to load");
            return Err(Mismatch);
        }

        self.scheduler.clear_events();
        let mut seen = 0u32;
        let mut sched_hdr = None;
        let mut events = Vec::new();

        while r.remaining() > 0 {
            let kind = r.u32()?;
            let size = r.u32()? as usize;
            let mut c = r.sub(size)?;
            match kind {
                CHUNK_CPU => self.read_cpu(c.exactly(CPU_SIZE)?)?,
                CHUNK_IO => self.read_io(c.exactly(IO_SIZE)?)?,
                CHUNK_PPU => self.read_ppu(c.exactly(PPU_SIZE)?)?,
                CHUNK_GPIO => self.read_gpio(c.exactly(GPIO_SIZE)?)?,
                CHUNK_APU => self.read_apu(c.exactly(APU_SIZE)?)?,
                CHUNK_SCHED => sched_hdr = Some(read_sched_header(c.exactly(SCHED_SIZE)?)?),
                CHUNK_SCHED_EVENTS => {
                    if size % EVENT_SIZE != 0 {
                        return Err(Corrupt);
                    }
                    events.reserve(size / EVENT_SIZE);
                    for _ in 0..size / EVENT_SIZE {
                        events.push(read_event(&mut c)?);
                    }
                }
                CHUNK_MEM_META => self.read_mem_meta(c.exactly(MEM_META_SIZE)?)?,
                CHUNK_EWRAM => {
                    let data = read_region(&mut c, self.memory.ewram.len())?;
                    self.memory.ewram.load(&data);
                }
                CHUNK_IWRAM => {
                    let data = read_region(&mut c, self.memory.iwram.len())?;
                    self.memory.iwram.load(&data);
                }
                CHUNK_VRAM => {
                    let data = read_region(&mut c, self.memory.vram.len())?;
                    self.memory.vram.load(&data);
                }
                CHUNK_PALRAM => {
                    let data = read_region(&mut c, self.memory.palram.len())?;
                    self.memory.palram.load(&data);
                }
                CHUNK_OAM => {
                    let data = read_region(&mut c, self.memory.oam.len())?;
                    self.memory.oam.load(&data);
                }
                CHUNK_BACKUP => self.read_backup(&mut c)?,
                _ => log::debug!("skipping unknown save state chunk kind {kind}"),
            }
            if kind <= 31 {
                seen |= 1 << kind;
            }
        }

        for kind in MANDATORY {
            if seen & (1 << kind) == 0 {
                log::warn!("save state is missing mandatory chunk {kind}");
                return Err(Corrupt);
            }
        }
        let (time, stamp, len) = sched_hdr.ok_or(Corrupt)?;
        if events.len() != len as usize {
            return Err(Corrupt);
        }
        // An active event in the past would break the scheduler.
        if events.iter().any(|e| e.active && e.at < time) {
            return Err(Corrupt);
        }
        self.scheduler.restore(time, stamp, events);
        if seen & (1 << CHUNK_BACKUP) == 0 {
            self.cart.dirty = false;
        }

        self.update_wait_times();
        Ok(())
    }

    /// The legacy flat layout: the scalar records back to back with no
    /// framing, then the scheduler's event records. Memory contents
    /// were not part of it. Load-only.
    fn load_state_v1(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        self.scheduler.clear_events();
        self.read_cpu(r.sub(CPU_SIZE)?)?;
        self.read_mem_meta(r.sub(MEM_META_SIZE)?)?;
        self.read_io(r.sub(IO_SIZE)?)?;
        self.read_ppu(r.sub(PPU_SIZE)?)?;
        self.read_gpio(r.sub(GPIO_SIZE)?)?;
        self.read_apu(r.sub(APU_SIZE)?)?;
        let (time, stamp, len) = read_sched_header(r.sub(SCHED_SIZE)?)?;
        // The count is untrusted; let the reads bound it.
        let mut events = Vec::new();
        for _ in 0..len {
            events.push(read_event(&mut r)?);
        }
        if events.iter().any(|e| e.active && e.at < time) {
            return Err(Corrupt);
        }
        self.scheduler.restore(time, stamp, events);
        self.cart.dirty = false;
        self.update_wait_times();
        Ok(())
    }

    fn write_cpu(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_CPU);
        for reg in self.cpu.registers {
            w.u32(reg);
        }
        w.u32(self.cpu.cpsr);
        w.u32(self.cpu.spsr);
        w.u32(self.cpu.pipeline[0]);
        w.u32(self.cpu.pipeline[1]);
        w.u16(self.cpu.ie);
        w.u16(self.cpu.if_);
        w.u8(self.cpu.ime as u8);
        w.u8(self.cpu.is_halted as u8);
        w.u8(self.cpu.irq_pending as u8);
        w.pad(1);
        w.end_chunk(start, CPU_SIZE);
    }

    fn read_cpu(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        for reg in &mut self.cpu.registers {
            *reg = r.u32()?;
        }
        self.cpu.cpsr = r.u32()?;
        self.cpu.spsr = r.u32()?;
        self.cpu.pipeline[0] = r.u32()?;
        self.cpu.pipeline[1] = r.u32()?;
        self.cpu.ie = r.u16()?;
        self.cpu.if_ = r.u16()?;
        self.cpu.ime = r.u8()? != 0;
        self.cpu.is_halted = r.u8()? != 0;
        self.cpu.irq_pending = r.u8()? != 0;
        Ok(())
    }

    fn write_io(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_IO);
        w.u16(self.memory.waitcnt.into());
        w.u16(self.memory.keyinput);
        w.u16(self.memory.keycnt.into());
        w.u8(self.memory.postflg);
        w.pad(1);

        for i in 0..4 {
            w.u16(self.timers.reload[i]);
        }
        for i in 0..4 {
            w.u16(self.timers.control[i].into());
        }
        for i in 0..4 {
            w.u16(self.timers.counters[i]);
        }
        for i in 0..4 {
            w.u64(self.timers.scheduled_at[i]);
        }
        for i in 0..4 {
            w.u32(self.timers.sched_evt[i].0);
        }

        for dma in self.dma.channels {
            w.u32(dma.sad);
            w.u32(dma.dad);
            w.u16(dma.count);
            w.u16(dma.ctrl.into());
            w.u32(dma.src);
            w.u32(dma.dst);
        }
        w.end_chunk(start, IO_SIZE);
    }

    fn read_io(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        self.memory.waitcnt = r.u16()?.into();
        self.memory.keyinput = r.u16()?;
        self.memory.keycnt = r.u16()?.into();
        self.memory.postflg = r.u8()?;
        r.skip(1)?;

        for i in 0..4 {
            self.timers.reload[i] = r.u16()?;
        }
        for i in 0..4 {
            self.timers.control[i] = r.u16()?.into();
        }
        for i in 0..4 {
            self.timers.counters[i] = r.u16()?;
        }
        for i in 0..4 {
            self.timers.scheduled_at[i] = r.u64()?;
        }
        for i in 0..4 {
            self.timers.sched_evt[i] = EventIdx(r.u32()?);
        }

        for dma in &mut self.dma.channels {
            dma.sad = r.u32()?;
            dma.dad = r.u32()?;
            dma.count = r.u16()?;
            dma.ctrl = r.u16()?.into();
            dma.src = r.u32()?;
            dma.dst = r.u32()?;
        }
        Ok(())
    }

    fn write_ppu(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_PPU);
        w.u16(self.ppu.dispcnt.into());
        w.u16(self.ppu.dispstat.into());
        w.u16(self.ppu.vcount);
        w.pad(2);
        w.end_chunk(start, PPU_SIZE);
    }

    fn read_ppu(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        self.ppu.dispcnt = r.u16()?.into();
        self.ppu.dispstat = r.u16()?.into();
        self.ppu.vcount = r.u16()?;
        Ok(())
    }

    fn write_gpio(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_GPIO);
        w.u8(self.gpio.data);
        w.u8(self.gpio.direction);
        w.u8(self.gpio.control);
        w.pad(1);
        w.end_chunk(start, GPIO_SIZE);
    }

    fn read_gpio(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        self.gpio.data = r.u8()?;
        self.gpio.direction = r.u8()?;
        self.gpio.control = r.u8()?;
        Ok(())
    }

    fn write_apu(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_APU);
        w.u16(self.apu.cnt.into());
        w.u16(self.apu.bias);
        w.u8(self.apu.current[0] as u8);
        w.u8(self.apu.current[1] as u8);
        for fifo in &self.apu.fifos {
            w.u8(fifo.len() as u8);
        }
        for fifo in &self.apu.fifos {
            let mut data = [0u8; 32];
            data[..fifo.len()].copy_from_slice(fifo);
            w.bytes(&data);
        }
        w.u64(self.apu.sample_count);
        w.end_chunk(start, APU_SIZE);
    }

    fn read_apu(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        self.apu.cnt = r.u16()?.into();
        self.apu.bias = r.u16()?;
        self.apu.current[0] = r.u8()? as i8;
        self.apu.current[1] = r.u8()? as i8;
        let lens = [r.u8()? as usize, r.u8()? as usize];
        for (fifo, len) in lens.into_iter().enumerate() {
            if len > 32 {
                return Err(Corrupt);
            }
            let data = r.bytes(32)?;
            self.apu.fifos[fifo].clear();
            self.apu.fifos[fifo]
                .try_extend_from_slice(&data[..len])
                .unwrap();
        }
        self.apu.sample_count = r.u64()?;
        Ok(())
    }

    fn write_scheduler(&self, w: &mut Writer) {
        let slots = self.scheduler.slots();
        let start = w.begin_chunk(CHUNK_SCHED);
        w.u64(self.scheduler.now());
        w.u64(self.scheduler.stamp_counter());
        w.u32(slots.len() as u32);
        w.end_chunk(start, SCHED_SIZE);

        if !slots.is_empty() {
            let start = w.begin_chunk(CHUNK_SCHED_EVENTS);
            for slot in slots {
                let (kind, arg) = encode_event(slot.kind);
                w.u32(kind);
                w.u32(arg);
                w.u64(slot.at);
                w.u64(slot.period);
                w.u64(slot.stamp);
                w.u8(slot.active as u8);
                w.u8(slot.repeat as u8);
                w.pad(2);
            }
            w.end_chunk(start, slots.len() * EVENT_SIZE);
        }
    }

    fn write_mem_meta(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_MEM_META);

        let (ty, flash, bank) = match &self.cart.save_type {
            SaveType::Nothing => (0u8, None, 0),
            SaveType::Sram => (1, None, 0),
            SaveType::Eeprom(_) => (2, None, 0),
            SaveType::Flash64(state) => (3, Some(state), 0),
            SaveType::Flash128 { state, bank } => (4, Some(state), *bank),
        };
        w.u8(ty);
        w.u8(flash.map_or(0, |f| f.mode as u8));
        w.u8(flash.map_or(0, |f| match f.command_stage {
            None => 0,
            Some(FlashCmdStage::FirstWritten) => 1,
            Some(FlashCmdStage::SecondWritten) => 2,
        }));
        w.u8(bank);

        let eeprom = match &self.cart.save_type {
            SaveType::Eeprom(e) => Some(e),
            _ => None,
        };
        w.u8(eeprom.map_or(0, |e| match e.size {
            EepromSize::Unknown => 0,
            EepromSize::E512 => 1,
            EepromSize::E8k => 2,
        }));
        w.u8(eeprom.map_or(0, |e| match e.command {
            EepromCmd::Nothing => 0,
            EepromCmd::Read => 1,
            EepromCmd::Write => 2,
        }));
        w.pad(2);
        w.u32(eeprom.map_or(0, |e| e.recv_count));
        w.u32(eeprom.map_or(0, |e| e.send_count));
        w.bytes(&eeprom.map_or(0, |e| e.recv_buffer).to_le_bytes());
        w.bytes(&eeprom.map_or(0, |e| e.send_buffer).to_le_bytes());

        let pf = &self.memory.prefetch;
        w.u32(pf.head);
        w.u32(pf.tail);
        w.u16(pf.size);
        w.u16(pf.countdown);
        w.u16(pf.reload);
        w.u8(pf.active as u8 | (pf.thumb as u8) << 1);
        w.pad(1);

        w.u32(self.memory.bios_value);
        w.u32(self.memory.dma_latch);
        w.u8(self.memory.dma_on_bus as u8 | (self.memory.gamepak_bus_in_use as u8) << 1);
        w.pad(3);
        w.end_chunk(start, MEM_META_SIZE);
    }

    fn read_mem_meta(&mut self, mut r: Reader) -> Result<(), SaveStateError> {
        let ty = r.u8()?;
        let flash_mode = match r.u8()? {
            0 => FlashMode::Regular,
            1 => FlashMode::Write,
            2 => FlashMode::Id,
            3 => FlashMode::Erase,
            4 => FlashMode::BankSelect,
            _ => return Err(Corrupt),
        };
        let flash_stage = match r.u8()? {
            0 => None,
            1 => Some(FlashCmdStage::FirstWritten),
            2 => Some(FlashCmdStage::SecondWritten),
            _ => return Err(Corrupt),
        };
        let bank = r.u8()?;
        let flash = FlashState {
            command_stage: flash_stage,
            mode: flash_mode,
        };

        let eeprom_size = match r.u8()? {
            0 => EepromSize::Unknown,
            1 => EepromSize::E512,
            2 => EepromSize::E8k,
            _ => return Err(Corrupt),
        };
        let eeprom_cmd = match r.u8()? {
            0 => EepromCmd::Nothing,
            1 => EepromCmd::Read,
            2 => EepromCmd::Write,
            _ => return Err(Corrupt),
        };
        r.skip(2)?;
        let recv_count = r.u32()?;
        let send_count = r.u32()?;
        let recv_buffer = u128::from_le_bytes(r.bytes(16)?.try_into().unwrap());
        let send_buffer = u128::from_le_bytes(r.bytes(16)?.try_into().unwrap());

        self.cart.save_type = match ty {
            0 => SaveType::Nothing,
            1 => SaveType::Sram,
            2 => {
                let mut eeprom = EepromState::new();
                eeprom.size = eeprom_size;
                eeprom.command = eeprom_cmd;
                eeprom.recv_count = recv_count;
                eeprom.send_count = send_count;
                eeprom.recv_buffer = recv_buffer;
                eeprom.send_buffer = send_buffer;
                SaveType::Eeprom(eeprom)
            }
            3 => SaveType::Flash64(flash),
            4 => SaveType::Flash128 { state: flash, bank },
            _ => return Err(Corrupt),
        };

        let pf = &mut self.memory.prefetch;
        pf.head = r.u32()?;
        pf.tail = r.u32()?;
        pf.size = r.u16()?;
        pf.countdown = r.u16()?;
        pf.reload = r.u16()?;
        let flags = r.u8()?;
        pf.active = flags & 1 != 0;
        pf.thumb = flags & 2 != 0;
        r.skip(1)?;

        self.memory.bios_value = r.u32()?;
        self.memory.dma_latch = r.u32()?;
        let flags = r.u8()?;
        self.memory.dma_on_bus = flags & 1 != 0;
        self.memory.gamepak_bus_in_use = flags & 2 != 0;
        Ok(())
    }

    fn write_backup(&self, w: &mut Writer) {
        let start = w.begin_chunk(CHUNK_BACKUP);
        w.u32(self.cart.ram.len() as u32);
        w.u8(self.cart.dirty as u8);
        w.pad(3);
        write_region_block(w, &self.cart.ram);
        w.end_chunk_unsized(start);
    }

    fn read_backup(&mut self, c: &mut Reader) -> Result<(), SaveStateError> {
        let size = c.u32()? as usize;
        let dirty = c.u8()? != 0;
        c.skip(3)?;
        // No backup chip is larger than 128 KiB flash.
        if size > 128 * crate::memory::KB {
            return Err(Corrupt);
        }
        if size > 0 {
            self.cart.ram = read_region(c, size)?;
        } else {
            self.cart.ram = Vec::new();
        }
        self.cart.dirty = dirty;
        Ok(())
    }
}

fn read_sched_header(mut r: Reader) -> Result<(Time, u64, u32), SaveStateError> {
    Ok((r.u64()?, r.u64()?, r.u32()?))
}

fn read_event(r: &mut Reader) -> Result<EventSlot<GbaEvent>, SaveStateError> {
    let kind = r.u32()?;
    let arg = r.u32()?;
    let at = r.u64()?;
    let period = r.u64()?;
    let stamp = r.u64()?;
    let active = r.u8()? != 0;
    let repeat = r.u8()? != 0;
    r.skip(2)?;
    Ok(EventSlot {
        kind: decode_event(kind, arg)?,
        at,
        period,
        stamp,
        active,
        repeat,
    })
}

fn encode_event(kind: GbaEvent) -> (u32, u32) {
    match kind {
        GbaEvent::Ppu(PpuEvent::HdrawEnd) => (1, 0),
        GbaEvent::Ppu(PpuEvent::HblankEnd) => (2, 0),
        GbaEvent::TimerOverflow(idx) => (3, idx as u32),
        GbaEvent::DmaFire(idx) => (4, idx as u32),
        GbaEvent::Apu(ApuEvent::PushSample) => (5, 0),
        GbaEvent::Apu(ApuEvent::FifoRefill(fifo)) => (6, fifo as u32),
        GbaEvent::UpdateIrq => (7, 0),
        GbaEvent::Quit => (8, 0),
    }
}

fn decode_event(kind: u32, arg: u32) -> Result<GbaEvent, SaveStateError> {
    Ok(match kind {
        1 => GbaEvent::Ppu(PpuEvent::HdrawEnd),
        2 => GbaEvent::Ppu(PpuEvent::HblankEnd),
        3 if arg < 4 => GbaEvent::TimerOverflow(arg as u8),
        4 if arg < 4 => GbaEvent::DmaFire(arg as u8),
        5 => GbaEvent::Apu(ApuEvent::PushSample),
        6 if arg < 2 => GbaEvent::Apu(ApuEvent::FifoRefill(arg as u8)),
        7 => GbaEvent::UpdateIrq,
        8 => GbaEvent::Quit,
        _ => return Err(Corrupt),
    })
}

/// Write a region chunk, run-length encoded if that is strictly
/// smaller than the raw copy.
fn write_region(w: &mut Writer, kind: u32, data: &[u8]) {
    let start = w.begin_chunk(kind);
    write_region_block(w, data);
    w.end_chunk_unsized(start);
}

fn write_region_block(w: &mut Writer, data: &[u8]) {
    w.u32(data.len() as u32);
    let rle = rle_encode(data);
    if rle.len() < data.len() {
        w.u8(1);
        w.pad(3);
        w.bytes(&rle);
    } else {
        w.u8(0);
        w.pad(3);
        w.bytes(data);
    }
}

/// Read a region block, rejecting size mismatches against the live
/// region.
fn read_region(r: &mut Reader, expected: usize) -> Result<Vec<u8>, SaveStateError> {
    let decoded = r.u32()? as usize;
    let encoding = r.u8()?;
    r.skip(3)?;
    if decoded != expected {
        return Err(Corrupt);
    }
    match encoding {
        0 => Ok(r.bytes(decoded)?.to_vec()),
        1 => rle_decode(r, decoded),
        _ => Err(Corrupt),
    }
}

fn rle_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let value = data[i];
        let mut run = 1;
        while i + run < data.len() && data[i + run] == value && run < 0xFFFF {
            run += 1;
        }
        out.extend_from_slice(&(run as u16).to_le_bytes());
        out.push(value);
        i += run;
    }
    out
}

fn rle_decode(r: &mut Reader, size: usize) -> Result<Vec<u8>, SaveStateError> {
    let mut out = Vec::with_capacity(size);
    while out.len() < size {
        let run = r.u16()? as usize;
        let value = r.u8()?;
        // A run may never overflow the region
        if run == 0 || out.len() + run > size {
            return Err(Corrupt);
        }
        out.resize(out.len() + run, value);
    }
    Ok(out)
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn pad(&mut self, count: usize) {
        self.buf.resize(self.buf.len() + count, 0);
    }

    /// Start a chunk; returns the payload start for [Writer::end_chunk].
    fn begin_chunk(&mut self, kind: u32) -> usize {
        self.u32(kind);
        self.u32(0);
        self.buf.len()
    }

    /// Close a chunk whose payload size is known statically; the
    /// assert keeps the declared sizes honest.
    fn end_chunk(&mut self, start: usize, expected: usize) {
        assert_eq!(self.buf.len() - start, expected, "chunk size drifted");
        self.end_chunk_unsized(start);
    }

    fn end_chunk_unsized(&mut self, start: usize) {
        let size = (self.buf.len() - start) as u32;
        self.buf[start - 4..start].copy_from_slice(&size.to_le_bytes());
    }
}

/// Cursor over a byte stream. Reads are bounds-checked against the
/// enclosing chunk's end, not just the buffer.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            end: data.len(),
        }
    }

    fn remaining(&self) -> usize {
        self.end - self.pos
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], SaveStateError> {
        if len > self.remaining() {
            return Err(Corrupt);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), SaveStateError> {
        self.bytes(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, SaveStateError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, SaveStateError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, SaveStateError> {
        Ok(u32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, SaveStateError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    /// Split off a sub-reader over the next `len` bytes, advancing
    /// this one past them.
    fn sub(&mut self, len: usize) -> Result<Reader<'a>, SaveStateError> {
        if len > self.remaining() {
            return Err(Corrupt);
        }
        let child = Reader {
            data: self.data,
            pos: self.pos,
            end: self.pos + len,
        };
        self.pos += len;
        Ok(child)
    }

    /// Consume this reader, requiring it to span exactly `len` bytes.
    fn exactly(self, len: usize) -> Result<Reader<'a>, SaveStateError> {
        if self.remaining() != len {
            return Err(Corrupt);
        }
        Ok(self)
    }
}
