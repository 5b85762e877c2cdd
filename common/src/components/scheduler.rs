// Copyright (c) 2024 Leela Aurelia, git@elia.garden
//
// Unless otherwise noted, this file is released and thus subject to the
// terms of the Mozilla Public License Version 2.0 (MPL-2.0) or the
// GNU General Public License Version 3 (GPL-3).
// If a copy of these licenses was not distributed with this file, you can
// obtain them at https://mozilla.org/MPL/2.0/ and http://www.gnu.org/licenses/.

/// Type for unsigned time, in system ticks
pub type Time = u64;
/// Type for signed time, in system ticks
pub type TimeS = i64;

/// Trait for event kinds.
pub trait Kind: PartialEq + Copy + Clone {}

/// Stable handle to a scheduled event, returned by [Scheduler::add].
/// Peripherals hold on to it to cancel or move their event later.
/// A handle stays valid until its event fires or is cancelled.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EventIdx(pub u32);

impl EventIdx {
    pub const NONE: EventIdx = EventIdx(u32::MAX);
}

/// A single event slot. Slots are kept in a flat array and addressed by
/// [EventIdx]; an inactive slot is free space that [Scheduler::add] may
/// reuse, so indices are only stable while the event is active.
#[derive(Copy, Clone)]
pub struct EventSlot<E: Kind> {
    /// Kind of event to execute
    pub kind: E,
    /// Absolute time to execute it at
    pub at: Time,
    /// Re-arm interval, meaningful only when `repeat` is set
    pub period: Time,
    /// Insertion stamp used to order events scheduled for the same time
    pub stamp: u64,
    pub active: bool,
    pub repeat: bool,
}

/// A scheduler used by the emulation core to drive all timing.
/// It is generic over the possible events and owns the master cycle
/// counter; every other component charges its cycles here.
pub struct Scheduler<E: Kind> {
    /// Current time of the scheduler.
    time: Time,
    /// Cached time of the earliest active event. May point at a time
    /// whose event was since cancelled; the pop path fixes it up.
    next: Time,
    /// Monotonic insertion counter, used for the same-time tie-break.
    stamp: u64,
    /// Event slots.
    slots: Vec<EventSlot<E>>,
}

impl<E: Kind> Default for Scheduler<E> {
    fn default() -> Self {
        Self {
            time: 0,
            next: Time::MAX,
            stamp: 0,
            slots: Vec::with_capacity(16),
        }
    }
}

impl<E: Kind> Scheduler<E> {
    /// Schedule a one-shot event at the given absolute time.
    /// Scheduling into the past or present is a caller bug.
    pub fn add(&mut self, kind: E, at: Time) -> EventIdx {
        self.add_inner(kind, at, 0, false)
    }

    /// Schedule an event that re-arms itself every `period` ticks after
    /// its first execution at `at`.
    pub fn add_repeating(&mut self, kind: E, at: Time, period: Time) -> EventIdx {
        assert!(period > 0, "repeating event with zero period");
        self.add_inner(kind, at, period, true)
    }

    fn add_inner(&mut self, kind: E, at: Time, period: Time, repeat: bool) -> EventIdx {
        assert!(at > self.time, "event scheduled at or before current time");
        let slot = EventSlot {
            kind,
            at,
            period,
            stamp: self.next_stamp(),
            active: true,
            repeat,
        };

        self.next = self.next.min(at);
        match self.slots.iter().position(|s| !s.active) {
            Some(idx) => {
                self.slots[idx] = slot;
                EventIdx(idx as u32)
            }
            None => {
                self.slots.push(slot);
                EventIdx((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Cancel an event. The cached next-event time is left as-is and
    /// fixed up lazily by the next pop.
    pub fn cancel(&mut self, idx: EventIdx) {
        if let Some(slot) = self.slots.get_mut(idx.0 as usize) {
            slot.active = false;
        }
    }

    /// Move an active event to a new absolute time.
    pub fn reschedule(&mut self, idx: EventIdx, at: Time) {
        assert!(at > self.time, "event rescheduled at or before current time");
        let stamp = self.next_stamp();
        let slot = &mut self.slots[idx.0 as usize];
        slot.at = at;
        slot.stamp = stamp;
        self.next = self.next.min(at);
    }

    /// Pop the earliest active event due at or before `horizon`,
    /// advancing the current time to its execution time. Repeating
    /// events are re-armed before this returns, so their handler can
    /// schedule same-time followups that will fire after it.
    pub fn pop_within(&mut self, horizon: Time) -> Option<(EventIdx, E)> {
        if self.next > horizon {
            return None;
        }

        let mut best: Option<usize> = None;
        let mut best_key = (Time::MAX, u64::MAX);
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.active && (slot.at, slot.stamp) < best_key {
                best_key = (slot.at, slot.stamp);
                best = Some(i);
            }
        }

        let idx = match best {
            Some(idx) if best_key.0 <= horizon => idx,
            _ => {
                // Cached `next` pointed at a cancelled event.
                self.next = best_key.0;
                return None;
            }
        };

        let (at, kind) = {
            let slot = &mut self.slots[idx];
            assert!(slot.at >= self.time, "event missed its execution time");
            (slot.at, slot.kind)
        };
        self.time = at;
        {
            let stamp = self.next_stamp();
            let slot = &mut self.slots[idx];
            if slot.repeat {
                slot.at += slot.period;
                slot.stamp = stamp;
            } else {
                slot.active = false;
            }
        }
        self.recompute_next();
        Some((EventIdx(idx as u32), kind))
    }

    /// Advance the clock to the given time without executing anything.
    /// A no-op when time has already moved past it.
    #[inline]
    pub fn advance_to(&mut self, time: Time) {
        if time > self.time {
            self.time = time;
        }
    }

    #[inline]
    pub fn now(&self) -> Time {
        self.time
    }

    /// Is any active event due at or before the current time horizon?
    #[inline]
    pub fn has_events_before(&self, horizon: Time) -> bool {
        self.next <= horizon
    }

    /// Drop every event, active or not. Used when restoring a snapshot.
    pub fn clear_events(&mut self) {
        self.slots.clear();
        self.next = Time::MAX;
    }

    /// Raw slot access for state serialisation.
    pub fn slots(&self) -> &[EventSlot<E>] {
        &self.slots
    }

    pub fn stamp_counter(&self) -> u64 {
        self.stamp
    }

    /// Replace the entire scheduler state from a snapshot. The cached
    /// next-event time is recomputed rather than trusted.
    pub fn restore(&mut self, time: Time, stamp: u64, slots: Vec<EventSlot<E>>) {
        self.time = time;
        self.stamp = stamp;
        self.slots = slots;
        self.recompute_next();
    }

    fn recompute_next(&mut self) {
        self.next = self
            .slots
            .iter()
            .filter(|s| s.active)
            .map(|s| s.at)
            .min()
            .unwrap_or(Time::MAX);
    }

    fn next_stamp(&mut self) -> u64 {
        let stamp = self.stamp;
        self.stamp += 1;
        stamp
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    enum TestEvent {
        A,
        B,
        C,
    }

    impl Kind for TestEvent {}

    fn drain(sched: &mut Scheduler<TestEvent>, horizon: Time) -> Vec<(TestEvent, Time)> {
        let mut out = Vec::new();
        while let Some((_, kind)) = sched.pop_within(horizon) {
            out.push((kind, sched.now()));
        }
        sched.advance_to(horizon);
        out
    }

    #[test]
    fn fires_in_time_order() {
        let mut sched = Scheduler::default();
        sched.add(TestEvent::A, 10);
        sched.add(TestEvent::B, 5);
        sched.add(TestEvent::C, 15);

        let fired = drain(&mut sched, 20);
        assert_eq!(
            fired,
            vec![(TestEvent::B, 5), (TestEvent::A, 10), (TestEvent::C, 15)]
        );
        assert_eq!(sched.now(), 20);
    }

    #[test]
    fn same_time_fires_in_insertion_order() {
        let mut sched = Scheduler::default();
        sched.add(TestEvent::A, 100);
        sched.add(TestEvent::B, 100);
        sched.add(TestEvent::C, 100);

        let fired = drain(&mut sched, 200);
        assert_eq!(
            fired,
            vec![
                (TestEvent::A, 100),
                (TestEvent::B, 100),
                (TestEvent::C, 100)
            ]
        );
    }

    #[test]
    fn horizon_bounds_progress() {
        let mut sched = Scheduler::default();
        sched.add(TestEvent::A, 10);
        assert_eq!(sched.pop_within(9), None);
        assert_eq!(sched.now(), 0);
        assert_eq!(sched.pop_within(10), Some((EventIdx(0), TestEvent::A)));
        assert_eq!(sched.now(), 10);
        assert_eq!(sched.pop_within(10), None);
    }

    #[test]
    fn cancel_skips_event() {
        let mut sched = Scheduler::default();
        let a = sched.add(TestEvent::A, 10);
        sched.add(TestEvent::B, 12);
        sched.cancel(a);

        let fired = drain(&mut sched, 20);
        assert_eq!(fired, vec![(TestEvent::B, 12)]);
    }

    #[test]
    fn cancelled_slot_is_reused() {
        let mut sched = Scheduler::default();
        let a = sched.add(TestEvent::A, 10);
        sched.add(TestEvent::B, 12);
        sched.cancel(a);
        let c = sched.add(TestEvent::C, 11);
        assert_eq!(a, c);

        let fired = drain(&mut sched, 20);
        assert_eq!(fired, vec![(TestEvent::C, 11), (TestEvent::B, 12)]);
    }

    #[test]
    fn reschedule_moves_event() {
        let mut sched = Scheduler::default();
        let a = sched.add(TestEvent::A, 10);
        sched.add(TestEvent::B, 12);
        sched.reschedule(a, 15);

        let fired = drain(&mut sched, 20);
        assert_eq!(fired, vec![(TestEvent::B, 12), (TestEvent::A, 15)]);
    }

    #[test]
    fn repeating_event_rearms() {
        let mut sched = Scheduler::default();
        sched.add_repeating(TestEvent::A, 10, 10);

        let fired = drain(&mut sched, 35);
        assert_eq!(
            fired,
            vec![(TestEvent::A, 10), (TestEvent::A, 20), (TestEvent::A, 30)]
        );
        assert_eq!(sched.now(), 35);
    }

    #[test]
    fn rearm_fires_before_later_insertions() {
        let mut sched = Scheduler::default();
        sched.add_repeating(TestEvent::A, 10, 10);
        assert!(sched.pop_within(10).is_some());
        // Scheduled after the re-arm, so it loses the tie at t=20.
        sched.add(TestEvent::B, 20);

        let fired = drain(&mut sched, 20);
        assert_eq!(fired, vec![(TestEvent::A, 20), (TestEvent::B, 20)]);
    }

    #[test]
    fn time_is_monotonic() {
        let mut sched: Scheduler<TestEvent> = Scheduler::default();
        sched.advance_to(50);
        assert_eq!(sched.now(), 50);
        sched.advance_to(20);
        assert_eq!(sched.now(), 50);
    }

    #[test]
    fn restore_round_trips() {
        let mut sched = Scheduler::default();
        sched.add(TestEvent::A, 10);
        sched.add_repeating(TestEvent::B, 8, 4);
        sched.advance_to(5);

        let (time, stamp) = (sched.now(), sched.stamp_counter());
        let slots = sched.slots().to_vec();

        let mut other = Scheduler::default();
        other.restore(time, stamp, slots);
        assert_eq!(drain(&mut other, 12), drain(&mut sched, 12));
    }
}
