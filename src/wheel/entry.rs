// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::Pin;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use cordyceps::{Linked, list};

use crate::timeval::TimeVal;

/// A caller-owned timer node.
///
/// The wheel never allocates, frees, copies, or moves one of these; it
/// threads armed entries into its slot lists through the intrusive `links`
/// field and otherwise only flips the atomic bookkeeping below. An entry is
/// *detached* until [`TimerWheel::insert`][crate::TimerWheel::insert] arms
/// it, and returns to detached when it fires or is removed, after which the
/// caller may re-arm or drop it freely.
///
/// Entries must stay pinned while armed; see the safety contract on
/// [`TimerWheel::insert`][crate::TimerWheel::insert].
#[derive(Debug)]
pub struct TimerEntry {
    /// The monotonic time at which this timer should fire.
    due: TimeVal,
    /// The absolute wheel tick this entry is filed under.
    ///
    /// Written under the wheel lock at arming time; dues in the past are
    /// clamped to the wheel position so the entry fires on the next step.
    due_ticks: AtomicU64,
    /// The level this entry is currently linked into.
    ///
    /// Together with `due_ticks` this pins down the owning slot list, which
    /// is what makes removal O(1) without a position hint.
    level: AtomicU8,
    /// True iff this entry is linked into some slot.
    active: AtomicBool,
    /// The wheel's generation when this entry was last removed.
    generation: AtomicU64,
    /// The wheel's generation when this entry was last inserted.
    wheel_gen: AtomicU64,
    links: list::Links<Self>,
    // This type is !Unpin due to the heuristic from:
    // <https://github.com/rust-lang/rust/pull/82834>
    _pin: PhantomPinned,
}

impl TimerEntry {
    #[must_use]
    pub const fn new(due: TimeVal) -> Self {
        Self {
            due,
            due_ticks: AtomicU64::new(0),
            level: AtomicU8::new(0),
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            wheel_gen: AtomicU64::new(0),
            links: list::Links::new(),
            _pin: PhantomPinned,
        }
    }

    #[must_use]
    pub const fn due(&self) -> TimeVal {
        self.due
    }

    /// Updates the fire time of a detached entry.
    ///
    /// Has no effect on a wheel the entry was previously armed in; the new
    /// due time is picked up by the next insertion. Calling this on an
    /// armed entry is a contract violation (the wheel would keep using the
    /// placement computed from the old due time).
    pub fn set_due(self: Pin<&mut Self>, due: TimeVal) {
        debug_assert!(
            !self.is_armed(),
            "the due time of an armed timer cannot be changed"
        );
        // Safety: `due` is a plain value field; we neither move out of the
        // entry nor touch its pinned intrusive links.
        unsafe { self.get_unchecked_mut() }.due = due;
    }

    /// Returns whether this entry is currently linked into a wheel slot.
    #[inline]
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns whether this entry has been removed since it was last armed.
    ///
    /// This is the cheap staleness check for callers that hand a timer
    /// reference to a worker and later want to know whether the wheel has
    /// let go of it: true iff at least one successful remove happened after
    /// (or during) the most recent insertion. Firing does not count as a
    /// modification.
    #[inline]
    #[must_use]
    pub fn was_modified(&self) -> bool {
        self.generation.load(Ordering::Acquire) != self.wheel_gen.load(Ordering::Acquire)
    }

    /// Marks the entry armed. Called under the wheel lock.
    pub(in crate::wheel) fn transition_to_armed(&self, due_ticks: u64, generation: u64) {
        self.due_ticks.store(due_ticks, Ordering::Relaxed);
        // wheel_gen first: a racing `was_modified` may observe the pair
        // mid-update as "modified" but never as "fresh".
        self.wheel_gen.store(generation, Ordering::Release);
        self.generation.store(generation, Ordering::Release);

        let _did_arm =
            self.active
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(
            _did_arm.is_ok(),
            "tried to arm a timer that was already armed"
        );
    }

    /// Marks the entry claimed by a tick step. Called under the wheel lock.
    pub(in crate::wheel) fn transition_to_claimed(&self) {
        let _was_armed =
            self.active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(
            _was_armed.is_ok(),
            "claimed a timer whose active bit was already unset, this is potentially real bad"
        );
    }

    /// Marks the entry cancelled at `generation`. Called under the wheel lock.
    pub(in crate::wheel) fn transition_to_removed(&self, generation: u64) {
        let _was_armed =
            self.active
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire);
        debug_assert!(
            _was_armed.is_ok(),
            "removed a timer whose active bit was already unset, this is potentially real bad"
        );
        self.generation.store(generation, Ordering::Release);
    }

    #[expect(clippy::cast_possible_truncation, reason = "levels are 0..4")]
    pub(in crate::wheel) fn set_level(&self, level: usize) {
        debug_assert!(level < 4);
        self.level.store(level as u8, Ordering::Relaxed);
    }

    /// The `(absolute tick, level)` this entry is filed under.
    pub(in crate::wheel) fn placement(&self) -> (u64, usize) {
        (
            self.due_ticks.load(Ordering::Relaxed),
            usize::from(self.level.load(Ordering::Relaxed)),
        )
    }
}

// Safety: TimerEntry is pinned while armed (contract on TimerWheel::insert)
// and the links field is only touched through this impl, so the returned
// pointer stays valid for as long as the entry is linked.
unsafe impl Linked<list::Links<TimerEntry>> for TimerEntry {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}
