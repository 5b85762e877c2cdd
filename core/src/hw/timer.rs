// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

#![allow(unused_braces)] // modular_bitfield issue

use common::{
    components::scheduler::{EventIdx, Scheduler},
    numutil::NumExt,
    Time,
};
use modular_bitfield::{bitfield, specifiers::*};

use crate::{apu::Apu, cpu::Interrupt, scheduling::GbaEvent, Gba};

pub const DIVS: [u16; 4] = [1, 64, 256, 1024];

#[bitfield]
#[repr(u16)]
#[derive(Debug, Default, Copy, Clone)]
pub struct TimerCtrl {
    pub prescaler: B2,
    pub count_up: bool,
    #[skip]
    __: B3,
    pub irq_en: bool,
    pub enable: bool,
    #[skip]
    __: B8,
}

/// The system's 4 timers.
/// Timers in regular counting mode live on the scheduler: the counter
/// value is derived from elapsed time on read, and the overflow event
/// handle is kept so a control write can cancel it.
pub struct Timers {
    // Registers
    pub reload: [u16; 4],
    pub control: [TimerCtrl; 4],

    /// Counter value. Authoritative for cascading timers; for scheduled
    /// timers this is the value at schedule time and the live value is
    /// calculated on read.
    pub counters: [u16; 4],
    /// The time the timer was last scheduled at.
    pub scheduled_at: [Time; 4],
    /// Scheduler handle of the pending overflow, if any.
    pub sched_evt: [EventIdx; 4],
}

impl Default for Timers {
    fn default() -> Self {
        Self {
            reload: [0; 4],
            control: [TimerCtrl::default(); 4],
            counters: [0; 4],
            scheduled_at: [0; 4],
            sched_evt: [EventIdx::NONE; 4],
        }
    }
}

impl Timers {
    /// Is this timer driven by the scheduler (as opposed to counting up
    /// on the previous timer's overflow)?
    fn is_scheduled(timer: usize, ctrl: TimerCtrl) -> bool {
        ctrl.enable() && (timer == 0 || !ctrl.count_up())
    }

    /// Read the current value of the given timer.
    pub fn time_read(&self, timer: usize, now: Time) -> u16 {
        let ctrl = self.control[timer];
        if Self::is_scheduled(timer, ctrl) {
            let scaler = DIVS[ctrl.prescaler().us()] as Time;
            let elapsed = now - self.scheduled_at[timer];
            self.counters[timer].wrapping_add((elapsed / scaler).u16())
        } else {
            self.counters[timer]
        }
    }

    /// Handle a write to a timer's control register.
    pub fn ctrl_write(&mut self, sched: &mut Scheduler<GbaEvent>, timer: usize, new: u16) {
        let now = sched.now();
        // Freeze the current counter value first
        self.counters[timer] = self.time_read(timer, now);

        let old_ctrl = self.control[timer];
        let new_ctrl = TimerCtrl::from(new);
        let was_scheduled = Self::is_scheduled(timer, old_ctrl);
        let is_scheduled = Self::is_scheduled(timer, new_ctrl);

        if was_scheduled {
            sched.cancel(self.sched_evt[timer]);
            self.sched_evt[timer] = EventIdx::NONE;
        }
        if !old_ctrl.enable() && new_ctrl.enable() {
            self.counters[timer] = self.reload[timer];
        }
        if is_scheduled {
            self.schedule_overflow(sched, timer, new_ctrl);
        }

        self.control[timer] = new_ctrl;
    }

    fn schedule_overflow(&mut self, sched: &mut Scheduler<GbaEvent>, timer: usize, ctrl: TimerCtrl) {
        let scaler = DIVS[ctrl.prescaler().us()] as Time;
        let until_ov = scaler * (0x1_0000 - self.counters[timer] as Time);
        self.scheduled_at[timer] = sched.now();
        self.sched_evt[timer] = sched.add(
            GbaEvent::TimerOverflow(timer.u8()),
            sched.now() + until_ov,
        );
    }

    /// Handle the overflow of a scheduled timer.
    pub fn handle_overflow(gg: &mut Gba, idx: u8) {
        let timer = idx.us();
        gg.timers.sched_evt[timer] = EventIdx::NONE;
        Self::overflow(gg, idx);

        let ctrl = gg.timers.control[timer];
        if Self::is_scheduled(timer, ctrl) {
            gg.timers.counters[timer] = gg.timers.reload[timer];
            gg.timers
                .schedule_overflow(&mut gg.scheduler, timer, ctrl);
        }
    }

    /// Overflow bookkeeping shared by scheduled and cascading timers.
    fn overflow(gg: &mut Gba, idx: u8) {
        let timer = idx.us();
        let ctrl = gg.timers.control[timer];
        gg.timers.counters[timer] = gg.timers.reload[timer];

        if ctrl.irq_en() {
            gg.request_interrupt_with_index(Interrupt::Timer0 as u16 + idx.u16());
        }
        if idx < 2 {
            Apu::timer_overflow(gg, idx);
        }

        // The next timer might be set to count up on our overflow.
        if timer != 3 && gg.timers.control[timer + 1].count_up() {
            Self::inc_cascade(gg, timer + 1);
        }
    }

    fn inc_cascade(gg: &mut Gba, timer: usize) {
        if !gg.timers.control[timer].enable() {
            return;
        }
        match gg.timers.counters[timer].checked_add(1) {
            Some(val) => gg.timers.counters[timer] = val,
            None => Self::overflow(gg, timer.u8()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctrl(prescaler: u8, enable: bool) -> u16 {
        TimerCtrl::new()
            .with_prescaler(prescaler)
            .with_enable(enable)
            .into()
    }

    #[test]
    fn scheduled_overflow_fires_irq() {
        let mut gg = Gba::without_rom();
        gg.cpu.ime = true;
        gg.cpu.ie = 1 << Interrupt::Timer0 as u16;
        gg.timers.reload[0] = 0xFFF0;
        let value = TimerCtrl::from(ctrl(0, true)).with_irq_en(true).into();
        gg.timers.ctrl_write(&mut gg.scheduler, 0, value);

        gg.run_until(0x0F);
        assert!(!gg.cpu.if_.is_bit(Interrupt::Timer0 as u16));
        gg.run_until(1);
        assert!(gg.cpu.if_.is_bit(Interrupt::Timer0 as u16));
    }

    #[test]
    fn counter_derived_from_elapsed_time() {
        let mut gg = Gba::without_rom();
        gg.timers.reload[0] = 0;
        gg.timers.ctrl_write(&mut gg.scheduler, 0, ctrl(1, true));
        gg.run_until(640);
        assert_eq!(gg.timers.time_read(0, gg.scheduler.now()), 10);
    }

    #[test]
    fn disable_cancels_event() {
        let mut gg = Gba::without_rom();
        gg.timers.reload[0] = 0xFFF0;
        let on = TimerCtrl::from(ctrl(0, true)).with_irq_en(true).into();
        gg.timers.ctrl_write(&mut gg.scheduler, 0, on);
        gg.timers.ctrl_write(&mut gg.scheduler, 0, ctrl(0, false));
        gg.run_until(0x100);
        assert_eq!(gg.cpu.if_, 0);
    }

    #[test]
    fn cascade_counts_overflows() {
        let mut gg = Gba::without_rom();
        gg.timers.reload[0] = 0xFFFF; // Overflows every tick
        gg.timers.ctrl_write(&mut gg.scheduler, 0, ctrl(0, true));
        let cascade: u16 = TimerCtrl::new().with_count_up(true).with_enable(true).into();
        gg.timers.ctrl_write(&mut gg.scheduler, 1, cascade);

        gg.run_until(4);
        assert_eq!(gg.timers.counters[1], 4);
    }
}
