// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

pub(crate) mod entry;
mod level;

use core::ptr::NonNull;
use core::time::Duration;

use cordyceps::List;
use spin::{Mutex, MutexGuard};

use crate::error::TimerError;
use crate::timeval::TimeVal;
use entry::TimerEntry;
use level::Level;

/// A count of whole wheel ticks. One tick is `tick_resolution` of wall time.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ticks(pub u64);

/// The earliest moment at which the wheel can next surface a timer.
///
/// Produced by [`TimerWheel::next_deadline`]. The deadline is exact when the
/// nearest armed timer already sits on level 0 and a lower bound (the next
/// cascade boundary) when it still sits on a higher level; either way it is
/// never later than the earliest armed due time, so it is safe to sleep on.
#[derive(Copy, Clone, Debug)]
pub struct Deadline {
    pub ticks: Ticks,
    time: TimeVal,
    slot: usize,
    level: usize,
}

/// A hierarchical hashed timing wheel.
///
/// The wheel schedules caller-owned [`TimerEntry`] nodes keyed by a
/// monotonic due time and dispatches them from [`tick`][TimerWheel::tick]
/// through a caller-supplied callback. Insertion, cancellation, and each
/// tick step are O(1) (up to the 256 entries a single slot may hold); the
/// wheel allocates nothing and owns no heap.
///
/// # Geometry
///
/// Four cascading levels of 256 slots each represent one radix-256 digit of
/// the 32-bit tick delta between the wheel position and a timer's due time.
/// With the typical 1 ms resolution that works out to:
///
/// | level | multiplier |                                 |
/// |-------|------------|---------------------------------|
/// | 0     | 256^0      | 1 ms slots / 256 ms range       |
/// | 1     | 256^1      | 256 ms slots / ~65 sec range    |
/// | 2     | 256^2      | ~65 sec slots / ~4.6 hr range   |
/// | 3     | 256^3      | ~4.6 hr slots / ~49.7 day range |
///
/// Dues farther out than the level-3 range (2^32 ticks) are not
/// expressible; inserting one is a contract violation and panics.
///
/// # Concurrency
///
/// A single spinlock serializes all wheel state. Any thread may call any
/// operation at any time; [`tick`][TimerWheel::tick] drops the lock across
/// each dispatch callback, so callbacks are free to insert or remove timers
/// (including reinserting the one just dispatched).
#[derive(Debug)]
pub struct TimerWheel {
    /// The monotonic time at which tick 0 begins.
    epoch: TimeVal,
    tick_resolution: Duration,
    tick_micros: u64,
    core: Mutex<Core>,
}

/// The wheel state guarded by the lock.
#[derive(Debug)]
struct Core {
    /// Ticks fully dispatched since the epoch; the absolute index of the
    /// next step.
    pos: Ticks,
    /// The timestamp corresponding to `pos`: the earliest moment for which
    /// timers have not yet been dispatched. Advances by exactly one
    /// resolution per step, never in larger jumps.
    next_run: TimeVal,
    /// Bumped each time an armed timer is removed; see
    /// [`TimerEntry::was_modified`].
    generation: u64,
    levels: [Level; Level::LEVELS],
}

/// A locked view of a [`TimerWheel`].
///
/// Holding one *is* holding the wheel lock, so the mutating methods here
/// are the "caller already holds the mutex" variants of
/// [`TimerWheel::insert`] and [`TimerWheel::remove`]: several operations
/// can be batched under a single acquisition, or issued from a context
/// that must not take the lock twice. Dispatch callbacks run with the lock
/// released and therefore use the locking methods instead.
pub struct LockedWheel<'wheel> {
    wheel: &'wheel TimerWheel,
    core: MutexGuard<'wheel, Core>,
}

// === impl Deadline ===

impl Deadline {
    #[must_use]
    pub fn as_ticks(&self) -> Ticks {
        self.ticks
    }

    #[must_use]
    pub fn as_timeval(&self) -> TimeVal {
        self.time
    }

    /// The slot holding the nearest timer.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The level holding the nearest timer; deadlines from level 0 are
    /// exact, higher levels report their next cascade boundary.
    #[must_use]
    pub fn level(&self) -> usize {
        self.level
    }
}

// === impl TimerWheel ===

impl TimerWheel {
    /// Creates a wheel whose tick 0 begins at `now`.
    ///
    /// `tick_resolution` is the wall duration of one tick and must be
    /// non-zero; all due times are quantized up to this granularity.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::InvalidResolution`] if `tick_resolution` is
    /// zero.
    pub fn new(now: TimeVal, tick_resolution: Duration) -> Result<Self, TimerError> {
        let tick_micros =
            u64::try_from(tick_resolution.as_micros()).map_err(|_| TimerError::InvalidResolution)?;
        if tick_micros == 0 {
            return Err(TimerError::InvalidResolution);
        }

        Ok(Self {
            epoch: now,
            tick_resolution,
            tick_micros,
            core: Mutex::new(Core::new(now)),
        })
    }

    #[inline]
    #[must_use]
    pub fn epoch(&self) -> TimeVal {
        self.epoch
    }

    #[inline]
    #[must_use]
    pub fn tick_resolution(&self) -> Duration {
        self.tick_resolution
    }

    /// The farthest a due time may lie beyond the wheel position: 2^32
    /// ticks.
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        self.tick_resolution.saturating_mul(u32::MAX)
    }

    /// Acquires the wheel lock, returning a view that can batch mutations
    /// under the single acquisition.
    #[must_use]
    pub fn lock(&self) -> LockedWheel<'_> {
        LockedWheel {
            wheel: self,
            core: self.core.lock(),
        }
    }

    /// Arms a detached timer to fire at its due time.
    ///
    /// Dues at or before the wheel position fire on the next tick step.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Exists`] if the entry is already armed; no
    /// state changes in that case.
    ///
    /// # Panics
    ///
    /// Panics if the due time lies 2^32 ticks or more past the wheel
    /// position (see [`max_duration`][TimerWheel::max_duration]); such a
    /// timer cannot be represented and the attempt indicates corruption in
    /// the caller.
    ///
    /// # Safety
    ///
    /// `entry` must point to a valid [`TimerEntry`] that is pinned: until
    /// it fires or is removed, the caller must neither move, drop, nor
    /// access it other than through wheel operations and the entry's atomic
    /// queries. It must not be armed in any other wheel.
    pub unsafe fn insert(&self, entry: NonNull<TimerEntry>) -> Result<(), TimerError> {
        // Safety: forwarded to the caller.
        unsafe { self.lock().insert(entry) }
    }

    /// Cancels an armed timer.
    ///
    /// On success the dispatcher is guaranteed not to be invoked for this
    /// arming, the wheel generation is bumped, and the entry reads as
    /// [modified][TimerEntry::was_modified] until it is inserted again.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotFound`] if the entry is not armed — never
    /// inserted, already fired, already removed, or currently claimed by an
    /// in-flight tick step (an in-flight dispatch cannot be recalled); no
    /// state changes in that case.
    ///
    /// # Safety
    ///
    /// `entry` must point to a valid [`TimerEntry`] that is not armed in a
    /// different wheel.
    pub unsafe fn remove(&self, entry: NonNull<TimerEntry>) -> Result<(), TimerError> {
        // Safety: forwarded to the caller.
        unsafe { self.lock().remove(entry) }
    }

    /// Advances the wheel up to `now`, dispatching every timer that came
    /// due, and returns how many were dispatched.
    ///
    /// The wheel steps one tick at a time from where the previous call left
    /// off; if the caller fell behind, every intervening slot is still
    /// visited exactly once and no timer is skipped, each overdue timer
    /// being dispatched with the real `now` rather than its original due
    /// time. If `now` is before the wheel position (the caller's clock went
    /// backwards), nothing is dispatched and the wheel does not rewind.
    ///
    /// The lock is held across each step's mutations but released around
    /// every `dispatch` call: the callback runs with the entry already
    /// detached and may freely insert or remove timers on this wheel. A
    /// reinsert with a due time at or before the wheel position lands on
    /// the *next* step, never the one being drained. Timers claimed by a
    /// step are dispatched exactly once per arming; a long-running callback
    /// delays the remaining steps of this call but not concurrent
    /// insert/remove.
    ///
    /// Dispatch order within one slot is unspecified.
    pub fn tick<F>(&self, now: TimeVal, mut dispatch: F) -> usize
    where
        F: FnMut(NonNull<TimerEntry>, TimeVal),
    {
        let mut expired = 0_usize;
        loop {
            let mut core = self.core.lock();
            if core.next_run > now {
                if expired == 0 && core.next_run.micros_since(now) > self.tick_micros_signed() {
                    tracing::warn!("time went backwards!");
                }
                return expired;
            }

            let claimed = core.claim_step(self.tick_resolution);
            drop(core);

            for ptr in claimed {
                expired += 1;
                dispatch(ptr, now);
            }
        }
    }

    /// The earliest moment the next armed timer can surface, if any.
    ///
    /// This is the moment by which the caller should invoke
    /// [`tick`][TimerWheel::tick] again; see [`Deadline`].
    #[must_use]
    pub fn next_deadline(&self) -> Option<Deadline> {
        self.lock().next_deadline()
    }

    /// The timestamp of the next undispatched tick.
    #[must_use]
    pub fn next_run(&self) -> TimeVal {
        self.core.lock().next_run
    }

    /// Ticks fully dispatched since the epoch.
    #[must_use]
    pub fn pos(&self) -> Ticks {
        self.core.lock().pos
    }

    /// The current removal generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.core.lock().generation
    }

    /// Quantizes a due time to the absolute tick it falls on, rounding up
    /// so a timer never fires before its due moment.
    fn due_ticks(&self, due: TimeVal) -> u64 {
        let delta = due.micros_since(self.epoch);
        if delta <= 0 {
            return 0;
        }
        delta.unsigned_abs().div_ceil(self.tick_micros)
    }

    fn time_at(&self, ticks: Ticks) -> TimeVal {
        self.epoch + Duration::from_micros(ticks.0.saturating_mul(self.tick_micros))
    }

    #[expect(
        clippy::cast_possible_wrap,
        reason = "Duration::as_micros of any real resolution fits i64 with room to spare"
    )]
    const fn tick_micros_signed(&self) -> i64 {
        self.tick_micros as i64
    }
}

// === impl LockedWheel ===

impl LockedWheel<'_> {
    /// Arms a detached timer; see [`TimerWheel::insert`].
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Exists`] if the entry is already armed.
    ///
    /// # Safety
    ///
    /// Same contract as [`TimerWheel::insert`].
    pub unsafe fn insert(&mut self, entry: NonNull<TimerEntry>) -> Result<(), TimerError> {
        // Safety: the caller upholds the entry contract.
        let due = unsafe { entry.as_ref() }.due();
        let requested = self.wheel.due_ticks(due);
        // Safety: the caller upholds the entry contract.
        unsafe { self.core.insert(requested, entry) }
    }

    /// Cancels an armed timer; see [`TimerWheel::remove`].
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::NotFound`] if the entry is not armed.
    ///
    /// # Safety
    ///
    /// Same contract as [`TimerWheel::remove`].
    pub unsafe fn remove(&mut self, entry: NonNull<TimerEntry>) -> Result<(), TimerError> {
        // Safety: the caller upholds the entry contract.
        unsafe { self.core.remove(entry) }
    }

    /// See [`TimerWheel::next_deadline`].
    #[must_use]
    pub fn next_deadline(&self) -> Option<Deadline> {
        let (ticks, slot, level) = self.core.next_deadline()?;
        Some(Deadline {
            ticks,
            time: self.wheel.time_at(ticks),
            slot,
            level,
        })
    }

    #[must_use]
    pub fn next_run(&self) -> TimeVal {
        self.core.next_run
    }

    #[must_use]
    pub fn pos(&self) -> Ticks {
        self.core.pos
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.core.generation
    }
}

// === impl Core ===

impl Core {
    const fn new(now: TimeVal) -> Self {
        Self {
            pos: Ticks(0),
            next_run: now,
            generation: 0,
            levels: [
                Level::new(0),
                Level::new(1),
                Level::new(2),
                Level::new(3),
            ],
        }
    }

    unsafe fn insert(&mut self, requested: u64, ptr: NonNull<TimerEntry>) -> Result<(), TimerError> {
        // Safety: the caller upholds the entry contract.
        let entry = unsafe { ptr.as_ref() };
        if entry.is_armed() {
            return Err(TimerError::Exists);
        }

        // dues in the past land on the next step
        let due_ticks = requested.max(self.pos.0);
        entry.transition_to_armed(due_ticks, self.generation);
        self.route(due_ticks, ptr);

        tracing::trace!("inserting timer={ptr:?};due_ticks={due_ticks};pos={:?}", self.pos);
        Ok(())
    }

    unsafe fn remove(&mut self, ptr: NonNull<TimerEntry>) -> Result<(), TimerError> {
        // Safety: the caller upholds the entry contract.
        let entry = unsafe { ptr.as_ref() };
        if !entry.is_armed() {
            return Err(TimerError::NotFound);
        }

        let (due_ticks, level) = entry.placement();
        tracing::trace!("removing timer={ptr:?};due_ticks={due_ticks};level={level}");
        // Safety: an armed entry is linked into the slot recorded at
        // placement time.
        unsafe { self.levels[level].remove(due_ticks, ptr) };

        self.generation += 1;
        entry.transition_to_removed(self.generation);
        Ok(())
    }

    /// Selects the level covering `due_ticks` at the current position and
    /// links the entry there.
    fn route(&mut self, due_ticks: u64, ptr: NonNull<TimerEntry>) {
        let level = level_for(due_ticks - self.pos.0);
        // Safety: the caller upholds the entry contract.
        unsafe { ptr.as_ref() }.set_level(level);
        self.levels[level].insert(due_ticks, ptr);
    }

    /// Executes one tick step: cascade at rotation boundaries, claim the
    /// due slot, advance the position. Returns the claimed entries, already
    /// marked detached so that concurrent removers answer `NotFound` the
    /// same way they would for an in-flight callback.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot index can be at most 256"
    )]
    fn claim_step(&mut self, resolution: Duration) -> List<TimerEntry> {
        let pos = self.pos.0;
        let slot = (pos % Level::SLOTS as u64) as usize;
        if slot == 0 && pos > 0 {
            self.cascade(pos);
        }

        let mut claimed = List::new();
        if self.levels[0].is_occupied(slot) {
            // Note that we take _all_ of the entries off the slot before
            // handing any of them out. A dispatch callback may reinsert its
            // timer with a due time that routes right back into this slot
            // (one full rotation out); the reinsert must land in the
            // emptied slot for the next rotation, not in the batch being
            // drained.
            for ptr in self.levels[0].take_slot(slot) {
                // Safety: armed entries are valid and pinned per the insert
                // contract.
                unsafe { ptr.as_ref() }.transition_to_claimed();
                claimed.push_front(ptr);
            }
        }

        self.pos = Ticks(pos + 1);
        self.next_run += resolution;
        claimed
    }

    /// Drains every level whose rotation boundary `pos` crosses,
    /// re-routing the drained entries against the current position.
    ///
    /// Levels are drained top-down so that slot zero of a lower level is
    /// refilled from above before (notionally) being serviced; because
    /// re-routing recomputes the delta, refilled entries always land below
    /// the slot being drained and the walk terminates.
    fn cascade(&mut self, pos: u64) {
        debug_assert!(pos % Level::SLOTS as u64 == 0 && pos > 0);

        // the deepest level whose rotation boundary this position crosses
        let mut top = 1;
        while top + 1 < Level::LEVELS && pos % (1u64 << (Level::BITS * (top + 1))) == 0 {
            top += 1;
        }

        for level in (1..=top).rev() {
            let slot = self.levels[level].slot_index(pos);
            if !self.levels[level].is_occupied(slot) {
                continue;
            }

            tracing::trace!(level, slot, pos, "cascading");
            for ptr in self.levels[level].take_slot(slot) {
                // Safety: armed entries are valid and pinned per the insert
                // contract.
                let (due_ticks, _) = unsafe { ptr.as_ref() }.placement();
                debug_assert!(
                    due_ticks >= pos,
                    "cascaded a timer that should already have fired"
                );
                self.route(due_ticks, ptr);
            }
        }
    }

    fn next_deadline(&self) -> Option<(Ticks, usize, usize)> {
        self.levels
            .iter()
            .enumerate()
            .filter_map(|(level, l)| {
                let (ticks, slot) = l.next_occupied(self.pos.0)?;
                Some((ticks, slot, level))
            })
            .min_by_key(|(ticks, _, _)| *ticks)
    }
}

/// Maps a tick delta to the level whose slot width covers it.
///
/// # Panics
///
/// Panics on deltas of 2^32 ticks or more; those cannot be represented by
/// the four radix-256 levels and reaching here with one means either the
/// caller inserted an inexpressible due time or the wheel state is
/// corrupted.
fn level_for(delta: u64) -> usize {
    const BITS: usize = Level::BITS;
    match delta {
        d if d < 1u64 << BITS => 0,
        d if d < 1u64 << (2 * BITS) => 1,
        d if d < 1u64 << (3 * BITS) => 2,
        d if d < 1u64 << (4 * BITS) => 3,
        _ => panic!("timer delta of {delta} ticks is not expressible in 32 bits"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{TestEntry, ms};
    use core::pin::Pin;
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    const RES: Duration = Duration::from_millis(1);

    fn wheel() -> TimerWheel {
        TimerWheel::new(TimeVal::ZERO, RES).unwrap()
    }

    fn none_due(_: NonNull<TimerEntry>, _: TimeVal) {
        unreachable!("no timer is due yet");
    }

    #[test]
    fn rejects_zero_resolution() {
        assert_eq!(
            TimerWheel::new(TimeVal::ZERO, Duration::ZERO).unwrap_err(),
            TimerError::InvalidResolution
        );
    }

    #[test]
    fn single_timer_dispatches_once() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(5));
        e.insert(&wheel).unwrap();
        assert!(e.entry().is_armed());

        let mut fired = 0;
        let count = wheel.tick(ms(10), |_, now| {
            fired += 1;
            assert_eq!(now, ms(10));
        });

        assert_eq!(count, 1);
        assert_eq!(fired, 1);
        assert_eq!(wheel.next_run(), ms(11));
        assert!(!e.entry().is_armed());
        assert!(!e.entry().was_modified());

        // nothing left to dispatch
        assert_eq!(wheel.tick(ms(20), none_due), 0);
    }

    #[test]
    fn one_dispatch_per_step() {
        let wheel = wheel();
        let mut entries: Vec<TestEntry> = (1..=1000).map(|k| TestEntry::new(ms(k))).collect();
        for e in &mut entries {
            e.insert(&wheel).unwrap();
        }

        assert_eq!(wheel.tick(ms(1000), |_, _| {}), 1000);
        assert_eq!(wheel.next_run(), ms(1001));
        assert_eq!(wheel.pos(), Ticks(1001));
        for e in &entries {
            assert!(!e.entry().is_armed());
        }
    }

    #[test]
    fn cascades_at_the_level_one_boundary() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let wheel = wheel();
        let mut e = TestEntry::new(ms(300));
        e.insert(&wheel).unwrap();

        // parked on level 1 slot 1; the deadline is the cascade boundary
        let deadline = wheel.next_deadline().unwrap();
        assert_eq!(deadline.as_ticks(), Ticks(256));
        assert_eq!((deadline.level(), deadline.slot()), (1, 1));

        assert_eq!(wheel.tick(ms(255), none_due), 0);
        assert_eq!(wheel.tick(ms(256), none_due), 0);

        // the cascade dropped it onto level 0 slot 44 (300 - 256), where
        // the deadline is exact
        let deadline = wheel.next_deadline().unwrap();
        assert_eq!(deadline.as_ticks(), Ticks(300));
        assert_eq!(deadline.as_timeval(), ms(300));
        assert_eq!((deadline.level(), deadline.slot()), (0, 44));

        assert_eq!(wheel.tick(ms(299), none_due), 0);
        assert_eq!(wheel.tick(ms(300), |_, _| {}), 1);
        assert!(!e.entry().is_armed());
    }

    #[test]
    fn survives_multi_level_cascades() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(70_000));
        e.insert(&wheel).unwrap();

        // delta 70_000 >= 2^16: parked on level 2, surfacing at 65_536
        let deadline = wheel.next_deadline().unwrap();
        assert_eq!(deadline.as_ticks(), Ticks(65_536));
        assert_eq!((deadline.level(), deadline.slot()), (2, 1));

        assert_eq!(wheel.tick(ms(69_999), none_due), 0);
        assert_eq!(wheel.tick(ms(70_000), |_, _| {}), 1);
        assert!(!e.entry().is_armed());
    }

    #[test]
    fn one_jump_across_every_boundary() {
        let wheel = wheel();
        let mut entries: Vec<TestEntry> = [1, 255, 256, 257, 65_536, 70_000]
            .into_iter()
            .map(|k| TestEntry::new(ms(k)))
            .collect();
        for e in &mut entries {
            e.insert(&wheel).unwrap();
        }

        assert_eq!(wheel.tick(ms(70_000), |_, _| {}), entries.len());
        for e in &entries {
            assert!(!e.entry().is_armed());
            assert!(!e.entry().was_modified());
        }
    }

    #[test]
    fn removed_timer_never_fires() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(5));
        e.insert(&wheel).unwrap();
        e.remove(&wheel).unwrap();
        assert!(!e.entry().is_armed());

        assert_eq!(wheel.tick(ms(100), none_due), 0);
        assert!(e.entry().was_modified());
    }

    #[test]
    fn remove_of_a_detached_timer_reports_not_found() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(5));
        assert_eq!(e.remove(&wheel).unwrap_err(), TimerError::NotFound);
        assert!(!e.entry().was_modified());

        // firing detaches, too
        e.insert(&wheel).unwrap();
        assert_eq!(wheel.tick(ms(5), |_, _| {}), 1);
        assert_eq!(e.remove(&wheel).unwrap_err(), TimerError::NotFound);
        assert_eq!(wheel.generation(), 0);
    }

    #[test]
    fn double_insert_reports_exists() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(5));
        e.insert(&wheel).unwrap();
        assert_eq!(e.insert(&wheel).unwrap_err(), TimerError::Exists);
        assert!(e.entry().is_armed());
    }

    #[test]
    fn past_due_fires_on_the_next_step() {
        let wheel = wheel();
        assert_eq!(wheel.tick(ms(10), none_due), 0);

        // due long past; it cannot fire before the wheel position
        let mut e = TestEntry::new(ms(3));
        e.insert(&wheel).unwrap();
        assert_eq!(wheel.next_deadline().unwrap().as_ticks(), Ticks(11));
        assert_eq!(wheel.tick(ms(11), |_, _| {}), 1);
    }

    #[test]
    fn callback_reinserts_its_own_timer() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(1));
        e.insert(&wheel).unwrap();

        let wheel_ref = &wheel;
        for k in 1..=5 {
            let fired = wheel.tick(ms(k), |mut ptr, now| {
                // Safety: the entry is detached during dispatch and stays
                // heap-pinned for the duration of the test.
                let entry = unsafe { Pin::new_unchecked(ptr.as_mut()) };
                entry.set_due(now + RES);
                // Safety: see above.
                unsafe { wheel_ref.insert(ptr) }.unwrap();
            });
            assert_eq!(fired, 1, "tick {k} must redispatch the timer");
        }

        assert!(e.entry().is_armed());
        e.remove(&wheel).unwrap();
    }

    #[test]
    fn callback_inserts_another_timer() {
        let wheel = wheel();
        let mut a = TestEntry::new(ms(5));
        let mut b = TestEntry::new(ms(3));
        a.insert(&wheel).unwrap();

        let a_ptr = a.ptr();
        let b_ptr = b.ptr();
        let wheel_ref = &wheel;
        let fired = wheel.tick(ms(10), |ptr, _| {
            if ptr == a_ptr {
                // b's due already passed; it lands on the next step, not
                // the one being drained
                // Safety: b is heap-pinned and detached.
                unsafe { wheel_ref.insert(b_ptr) }.unwrap();
            }
        });

        assert_eq!(fired, 2);
        assert!(!b.entry().is_armed());
    }

    #[test]
    fn backwards_clock_is_a_noop() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(200));
        e.insert(&wheel).unwrap();

        assert_eq!(wheel.tick(ms(100), none_due), 0);
        assert_eq!(wheel.next_run(), ms(101));

        // the clock regressed; nothing fires and the wheel does not rewind
        assert_eq!(wheel.tick(ms(50), none_due), 0);
        assert_eq!(wheel.next_run(), ms(101));

        assert_eq!(wheel.tick(ms(200), |_, _| {}), 1);
    }

    #[test]
    fn next_deadline_of_an_idle_wheel() {
        let wheel = wheel();
        assert!(wheel.next_deadline().is_none());

        let mut e = TestEntry::new(ms(42));
        e.insert(&wheel).unwrap();
        assert_eq!(wheel.next_deadline().unwrap().as_ticks(), Ticks(42));

        e.remove(&wheel).unwrap();
        assert!(wheel.next_deadline().is_none());
    }

    #[test]
    fn generation_tracks_removals() {
        let wheel = wheel();
        let mut e = TestEntry::new(ms(5));
        assert!(!e.entry().was_modified());

        e.insert(&wheel).unwrap();
        assert!(!e.entry().was_modified());

        e.remove(&wheel).unwrap();
        assert!(e.entry().was_modified());
        assert_eq!(wheel.generation(), 1);

        // re-arming clears the staleness flag
        e.insert(&wheel).unwrap();
        assert!(!e.entry().was_modified());

        // firing is not a modification
        assert_eq!(wheel.tick(ms(5), |_, _| {}), 1);
        assert!(!e.entry().was_modified());
    }

    #[test]
    fn many_timers_share_a_slot() {
        let wheel = wheel();
        let mut entries: Vec<TestEntry> = (0..10).map(|_| TestEntry::new(ms(5))).collect();
        for e in &mut entries {
            e.insert(&wheel).unwrap();
        }

        assert_eq!(wheel.tick(ms(4), none_due), 0);
        assert_eq!(wheel.tick(ms(5), |_, _| {}), 10);
    }

    #[test]
    fn concurrent_insert_remove_and_tick() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_ids(true)
            .set_default();

        const WORKERS: usize = 4;
        const TIMERS: usize = 64;

        let wheel = Arc::new(wheel());
        let fired = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let ticker = {
            let wheel = Arc::clone(&wheel);
            let fired = Arc::clone(&fired);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut now = 0;
                while !stop.load(Ordering::Acquire) {
                    now += 7;
                    wheel.tick(ms(now), |_, _| {
                        fired.fetch_add(1, Ordering::AcqRel);
                    });
                    thread::yield_now();
                }
                now
            })
        };

        let workers: Vec<_> = (0..WORKERS)
            .map(|w| {
                let wheel = Arc::clone(&wheel);
                thread::spawn(move || {
                    let mut entries: Vec<TestEntry> = (0..TIMERS)
                        .map(|i| TestEntry::new(ms(((w * 31 + i * 13) % 977 + 1) as i64)))
                        .collect();
                    for e in &mut entries {
                        e.insert(&wheel).unwrap();
                    }

                    let mut cancelled = 0;
                    for (i, e) in entries.iter_mut().enumerate() {
                        // cancellations race the ticker; a claim beats us
                        // and answers NotFound, in which case the timer
                        // fires instead
                        if i % 2 == 0 && e.remove(&wheel).is_ok() {
                            cancelled += 1;
                        }
                    }
                    (entries, cancelled)
                })
            })
            .collect();

        // entries stay alive in `all` until every armed timer has drained
        let mut all = Vec::new();
        let mut cancelled = 0;
        for handle in workers {
            let (entries, c) = handle.join().unwrap();
            all.extend(entries);
            cancelled += c;
        }

        stop.store(true, Ordering::Release);
        let reached = ticker.join().unwrap();

        wheel.tick(ms(reached + 2_000), |_, _| {
            fired.fetch_add(1, Ordering::AcqRel);
        });

        assert_eq!(fired.load(Ordering::Acquire) + cancelled, WORKERS * TIMERS);
        for e in &all {
            assert!(!e.entry().is_armed());
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Over any insert/cancel population and any tick schedule, the
        /// dispatched set is exactly the never-cancelled set, each timer
        /// fires exactly once, never early, and always in the first tick
        /// whose `now` reaches its due time.
        #[test]
        fn dispatches_exactly_the_armed_set(
            dues in prop::collection::vec(0_i64..5_000, 1..32),
            cancels in prop::collection::vec(any::<bool>(), 32),
            steps in prop::collection::vec(1_i64..900, 0..12),
        ) {
            let wheel = wheel();
            let mut entries: Vec<TestEntry> =
                dues.iter().map(|&due| TestEntry::new(ms(due))).collect();

            let mut index_of = HashMap::new();
            for (i, e) in entries.iter_mut().enumerate() {
                index_of.insert(e.ptr(), i);
                e.insert(&wheel).unwrap();
            }

            let mut cancelled = vec![false; entries.len()];
            for (i, e) in entries.iter_mut().enumerate() {
                if cancels[i % cancels.len()] {
                    e.remove(&wheel).unwrap();
                    cancelled[i] = true;
                }
            }

            let mut fired_at: Vec<Option<(TimeVal, TimeVal)>> = vec![None; entries.len()];
            let mut duplicated = None;
            let mut prev = TimeVal::ZERO;
            let mut now = TimeVal::ZERO;
            let mut schedule = steps.clone();
            // make sure the final tick is past every due time
            schedule.push(6_000);
            for step in schedule {
                now = now + Duration::from_millis(step.unsigned_abs());
                wheel.tick(now, |ptr, at| {
                    let i = index_of[&ptr];
                    if fired_at[i].is_some() {
                        duplicated = Some(i);
                    } else {
                        fired_at[i] = Some((prev, at));
                    }
                });
                prev = now;
            }

            prop_assert_eq!(duplicated, None, "a timer was dispatched twice");
            for (i, e) in entries.iter().enumerate() {
                prop_assert!(!e.entry().is_armed());
                if cancelled[i] {
                    prop_assert!(fired_at[i].is_none(), "cancelled timer {} dispatched", i);
                    prop_assert!(e.entry().was_modified());
                } else {
                    let (before, at) = fired_at[i].expect("timer was lost");
                    // never early, and in the first tick that reached it
                    prop_assert!(ms(dues[i]) <= at);
                    prop_assert!(ms(dues[i]) > before || dues[i] == 0);
                }
            }
        }
    }
}
