// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

//! Bus timing and scheduler behaviour, exercised through the public
//! surface the way an instruction core drives it.

use agbemu::{
    memory::access::{CODE, NONSEQ, SEQ},
    scheduling::GbaEvent,
    Gba,
};

fn gba_with_rom(len: usize) -> Box<Gba> {
    let mut rom = vec![0; len];
    for (i, byte) in rom.iter_mut().enumerate() {
        *byte = i as u8;
    }
    Gba::new(rom)
}

#[test]
fn scheduler_fires_equal_times_in_insertion_order() {
    let mut gg = Gba::without_rom();
    gg.scheduler.clear_events();
    let x = gg.scheduler.add(GbaEvent::TimerOverflow(0), 100);
    let y = gg.scheduler.add(GbaEvent::TimerOverflow(1), 100);
    assert_ne!(x, y);

    let first = gg.scheduler.pop_within(200).unwrap();
    assert_eq!(first, (x, GbaEvent::TimerOverflow(0)));
    assert_eq!(gg.scheduler.now(), 100);
    let second = gg.scheduler.pop_within(200).unwrap();
    assert_eq!(second, (y, GbaEvent::TimerOverflow(1)));
    assert_eq!(gg.scheduler.now(), 100);

    // Nothing left within the window; time only moves by the budget.
    assert!(gg.scheduler.pop_within(200).is_none());
    gg.run_until(0);
    assert_eq!(gg.scheduler.now(), 100);
}

#[test]
fn cycle_counter_is_monotonic_across_operations() {
    let mut gg = Gba::without_rom();
    let mut last = gg.scheduler.now();
    let idx = gg.scheduler.add(GbaEvent::TimerOverflow(2), 5000);
    for step in [1u64, 7, 960, 1232, 3] {
        gg.run_until(step);
        assert!(gg.scheduler.now() >= last);
        last = gg.scheduler.now();
    }
    gg.scheduler.reschedule(idx, 9000);
    gg.scheduler.cancel(idx);
    gg.run_until(10_000);
    assert!(gg.scheduler.now() >= last);
}

#[test]
fn cart_128k_boundary_is_billed_nonsequential() {
    let mut gg = gba_with_rom(0x100);

    // Requested sequential, but the address sits on a 128 KiB boundary.
    let start = gg.scheduler.now();
    gg.read::<u16>(0x0802_0000, SEQ);
    let boundary_cost = gg.scheduler.now() - start;

    let start = gg.scheduler.now();
    gg.read::<u16>(0x0802_0002, SEQ);
    let seq_cost = gg.scheduler.now() - start;

    let start = gg.scheduler.now();
    gg.read::<u16>(0x0802_1000, NONSEQ);
    let nonseq_cost = gg.scheduler.now() - start;

    // Default WAITCNT: 5 cycles non-sequential, 3 sequential.
    assert_eq!(boundary_cost, nonseq_cost);
    assert_eq!(boundary_cost, 5);
    assert_eq!(seq_cost, 3);
}

#[test]
fn rotated_reads_match_manual_rotation() {
    let mut gg = Gba::without_rom();
    gg.set(0x0300_0040u32, 0xA1B2_C3D4u32);

    for misalign in 0..4u32 {
        let addr = 0x0300_0040 + misalign;
        let aligned = gg.read::<u32>(addr & !3, NONSEQ);
        let rotated = gg.read_rotated::<u32>(addr, NONSEQ);
        assert_eq!(rotated, aligned.rotate_right(8 * (addr & 3)));
    }
    for misalign in 0..2u32 {
        let addr = 0x0300_0040 + misalign;
        let aligned = gg.read::<u16>(addr & !1, NONSEQ) as u32;
        let rotated = gg.read_rotated::<u16>(addr, NONSEQ);
        assert_eq!(rotated, aligned.rotate_right(8 * (addr & 1)));
    }
}

#[test]
fn palette_byte_store_fills_both_lanes() {
    let mut gg = Gba::without_rom();
    for addr in [0x0500_0000u32, 0x0500_0081, 0x0500_03FF] {
        gg.write::<u8>(addr, 0x6C, NONSEQ);
        assert_eq!(gg.get::<u16>(addr & !1), 0x6C6C, "addr {addr:08X}");
    }
}

#[test]
fn vram_obj_byte_store_is_dropped_per_mode() {
    let mut gg = Gba::without_rom();

    // Tile modes: OBJ VRAM starts at 0x10000.
    gg.write::<u8>(0x0601_2345, 0x5A, NONSEQ);
    assert_eq!(gg.get::<u16>(0x0601_2344), 0);

    // Bitmap modes move the boundary to 0x14000.
    gg.write::<u16>(0x0400_0000, 3, NONSEQ);
    gg.write::<u8>(0x0601_2345, 0x5A, NONSEQ);
    assert_eq!(gg.get::<u16>(0x0601_2344), 0x5A5A);
    gg.write::<u8>(0x0601_4001, 0x5A, NONSEQ);
    assert_eq!(gg.get::<u16>(0x0601_4000), 0);
}

#[test]
fn prefetch_sequential_hit_is_one_cycle() {
    let mut gg = gba_with_rom(0x400);
    gg.cpu.set_thumb(true);
    // Enable the prefetch buffer, default waitstates.
    gg.write::<u16>(0x0400_0204, 1 << 14, NONSEQ);

    // Miss at A pays the tabulated non-sequential cost.
    let start = gg.scheduler.now();
    gg.read::<u16>(0x0800_0100, CODE);
    assert_eq!(gg.scheduler.now() - start, 5);

    // Idle long enough for the buffer to fetch ahead.
    gg.idle_for(8);

    // A + 2 is a buffer hit: one cycle, not the 3-cycle sequential cost.
    let start = gg.scheduler.now();
    gg.read::<u16>(0x0800_0102, CODE | SEQ);
    assert_eq!(gg.scheduler.now() - start, 1);
}

#[test]
fn prefetch_disabled_changes_only_timing() {
    let run = |prefetch: bool| -> (Vec<u16>, u64) {
        let mut gg = gba_with_rom(0x400);
        gg.cpu.set_thumb(true);
        if prefetch {
            gg.write::<u16>(0x0400_0204, 1 << 14, NONSEQ);
        }
        let start = gg.scheduler.now();
        let mut values = Vec::new();
        values.push(gg.read::<u16>(0x0800_0200, CODE));
        gg.idle_for(4);
        for i in 1..6u32 {
            values.push(gg.read::<u16>(0x0800_0200 + i * 2, CODE | SEQ));
        }
        (values, gg.scheduler.now() - start)
    };

    let (with_pf, with_cycles) = run(true);
    let (without_pf, without_cycles) = run(false);
    // Same data either way, fewer cycles with the buffer on.
    assert_eq!(with_pf, without_pf);
    assert!(with_cycles < without_cycles);
}

#[test]
fn sram_reads_broadcast_and_writes_pick_lane() {
    let mut rom = vec![0; 0xC0];
    rom.extend_from_slice(b"SRAM_V113");
    let mut gg = Gba::new(rom);

    gg.write::<u8>(0x0E00_0040, 0x3C, NONSEQ);
    assert_eq!(gg.read::<u16>(0x0E00_0040, NONSEQ), 0x3C3C);
    assert_eq!(gg.read::<u32>(0x0E00_0040, NONSEQ), 0x3C3C_3C3C);

    // Halfword store at odd address lands its high byte.
    gg.write::<u16>(0x0E00_0051, 0xBEEF, NONSEQ);
    assert_eq!(gg.read::<u8>(0x0E00_0051, NONSEQ), 0xBE);
}

#[test]
fn open_bus_follows_last_bus_owner() {
    let mut gg = Gba::without_rom();
    // CPU owned the bus last: pipeline contents leak.
    gg.cpu.pipeline = [0x0000_1111, 0x2222_3333];
    assert_eq!(gg.read::<u32>(0x0100_0000, NONSEQ), 0x2222_3333);

    // After a DMA transfer, its latch leaks instead.
    gg.set(0x0200_0000u32, 0x5151_5151u32);
    gg.dma.channels[0].sad = 0x0200_0000;
    gg.dma.channels[0].dad = 0x0300_0000;
    gg.dma.channels[0].count = 1;
    gg.write::<u16>(0x0400_00BA, 0x8400, NONSEQ); // enable, word
    gg.run_until(16);
    assert_eq!(gg.read::<u32>(0x0100_0000, NONSEQ), 0x5151_5151);
}
