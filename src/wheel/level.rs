// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::NonNull;

use cordyceps::List;
use static_assertions::{const_assert, const_assert_eq};

use crate::wheel::Ticks;
use crate::wheel::entry::TimerEntry;

// The four radix-256 levels together cover every delta expressible in 32
// bits of ticks; anything larger is a contract violation at insert.
const_assert!(Level::SLOTS.is_power_of_two());
const_assert_eq!(Level::LEVELS * Level::BITS, 32);
const_assert_eq!(Level::SLOTS % u64::BITS as usize, 0);

/// One level of the timing wheel.
///
/// A level is 256 slots, each the head of an intrusive doubly-linked list
/// of [`TimerEntry`]s, plus a 256-bit occupancy bitmap so that empty slots
/// cost a single bit test during catch-up and next-deadline queries.
///
/// See <https://lwn.net/Articles/646056/> for details on the bitmap
/// strategy.
#[derive(Debug)]
pub(in crate::wheel) struct Level {
    /// A bitmap of the slots that are occupied.
    ///
    /// The least-significant bit of the first word represents slot zero.
    occupied: [u64; Level::WORDS],
    slots: [List<TimerEntry>; Level::SLOTS],
    /// This level's index; level 0 is the finest.
    level: usize,
    /// The number of ticks represented by a single slot in this level.
    ticks_per_slot: u64,
    /// The number of ticks represented by this entire level.
    ticks_per_level: u64,
    /// A bitmask for masking out all lower levels' indices from a tick
    /// position.
    level_mask: u64,
}

impl Level {
    /// The number of slots per level is fixed at 256: one radix-256 digit
    /// of the 32-bit tick delta per level.
    pub(in crate::wheel) const SLOTS: usize = 256;
    pub(in crate::wheel) const LEVELS: usize = 4;
    pub(in crate::wheel) const BITS: usize = Self::SLOTS.trailing_zeros() as usize;
    const WORDS: usize = Self::SLOTS / u64::BITS as usize;

    pub(in crate::wheel) const fn new(level: usize) -> Self {
        // how many ticks does a single slot represent in a level of this depth?
        let ticks_per_slot = 1u64 << (Self::BITS * level);
        let ticks_per_level = ticks_per_slot << Self::BITS;

        debug_assert!(ticks_per_slot.is_power_of_two());
        debug_assert!(ticks_per_level.is_power_of_two());

        // because `ticks_per_level` is a power of two, we can calculate a
        // bitmask for masking out the indices in all lower levels from a
        // tick position.
        let level_mask = !(ticks_per_level - 1);
        let slots = [const { List::new() }; Self::SLOTS];

        Self {
            occupied: [0; Self::WORDS],
            slots,
            level,
            ticks_per_slot,
            ticks_per_level,
            level_mask,
        }
    }

    /// Links `ptr` into the slot covering the absolute tick `due_ticks`.
    pub(in crate::wheel) fn insert(&mut self, due_ticks: u64, ptr: NonNull<TimerEntry>) {
        let slot = self.slot_index(due_ticks);
        // insert the timer entry into the appropriate linked list.
        self.slots[slot].push_front(ptr);
        // toggle the occupied bit for that slot.
        self.fill_slot(slot);
    }

    /// Unlinks an armed entry filed under `due_ticks`.
    ///
    /// # Safety
    ///
    /// The entry must currently be linked into this level's list for
    /// `due_ticks` (provided the rest of the timer wheel is
    /// like...working...).
    pub(in crate::wheel) unsafe fn remove(&mut self, due_ticks: u64, entry: NonNull<TimerEntry>) {
        let slot = self.slot_index(due_ticks);
        // Safety: the caller guarantees the entry is linked into this slot.
        let _removed = unsafe { self.slots[slot].remove(entry) };
        debug_assert!(
            _removed.is_some(),
            "removed a timer that was not linked into its recorded slot"
        );

        if self.slots[slot].is_empty() {
            // if that was the only timer in that slot's linked list, clear
            // the corresponding occupied bit.
            self.clear_slot(slot);
        }
    }

    pub(in crate::wheel) fn is_occupied(&self, slot: usize) -> bool {
        self.occupied[slot / u64::BITS as usize] & (1 << (slot % u64::BITS as usize)) != 0
    }

    /// Detaches and returns the entire list for `slot`.
    pub(in crate::wheel) fn take_slot(&mut self, slot: usize) -> List<TimerEntry> {
        debug_assert!(self.is_occupied(slot), "taking an unoccupied slot!");
        let list = self.slots[slot].split_off(0);
        debug_assert!(
            !list.is_empty(),
            "if a slot is occupied, its list must not be empty"
        );
        self.clear_slot(slot);
        list
    }

    /// Returns the earliest tick at which this level can next surface an
    /// entry, together with the slot holding it.
    ///
    /// For level 0 this is the exact due tick; for higher levels it is the
    /// start of the occupied slot, i.e. the cascade boundary at which its
    /// entries drop down — a lower bound on their dues, never later than
    /// any of them.
    pub(in crate::wheel) fn next_occupied(&self, pos: u64) -> Option<(Ticks, usize)> {
        let current = self.slot_index(pos);
        let distance = next_set_bit(&self.occupied, current)?;
        let slot = distance % Self::SLOTS;
        tracing::trace!(level = self.level, current, distance, slot);

        // when did the current rotation of this level begin? since all
        // levels represent a power-of-two number of ticks, we can determine
        // the beginning of this rotation by masking out the bits for all
        // lower levels.
        let rotation_start = pos & self.level_mask;
        // does the next occupied slot wrap this level around from the
        // current slot?
        let mut ticks = rotation_start + slot as u64 * self.ticks_per_slot;
        if distance >= Self::SLOTS {
            ticks += self.ticks_per_level;
        }

        // the current slot of a higher level started before `pos`; its
        // entries are still due at or after `pos`.
        Some((Ticks(ticks.max(pos)), slot))
    }

    /// Given an absolute tick, returns the slot covering it at this level.
    #[expect(
        clippy::cast_possible_truncation,
        reason = "slot index can be at most 256"
    )]
    pub(in crate::wheel) const fn slot_index(&self, ticks: u64) -> usize {
        let shift = self.level * Self::BITS;
        ((ticks >> shift) % Self::SLOTS as u64) as usize
    }

    fn clear_slot(&mut self, slot: usize) {
        debug_assert!(slot < Self::SLOTS);
        self.occupied[slot / u64::BITS as usize] &= !(1 << (slot % u64::BITS as usize));
    }

    fn fill_slot(&mut self, slot: usize) {
        debug_assert!(slot < Self::SLOTS);
        self.occupied[slot / u64::BITS as usize] |= 1 << (slot % u64::BITS as usize);
    }
}

/// Finds the index of the next set bit in `bitmap` at or after the
/// `offset`th bit, searching cyclically.
///
/// Indices past the wrap point are reported offset by the bitmap width, so
/// the result is always in `[offset, offset + SLOTS)` and `result - offset`
/// is the cyclic distance. Based on
/// <https://github.com/torvalds/linux/blob/d0e60d46bc03252b8d4ffaaaa0b371970ac16cda/include/linux/find.h#L21-L45>
fn next_set_bit(bitmap: &[u64; Level::WORDS], offset: usize) -> Option<usize> {
    debug_assert!(offset < Level::SLOTS, "offset: {offset}");
    let word0 = offset / u64::BITS as usize;
    let bit0 = offset % u64::BITS as usize;

    // the word containing `offset`, masked down to the bits at or after it
    let first = bitmap[word0] & (!0u64 << bit0);
    if first != 0 {
        return Some(word0 * u64::BITS as usize + first.trailing_zeros() as usize);
    }

    // the remaining words, in cyclic order
    for i in 1..Level::WORDS {
        let idx = (word0 + i) % Level::WORDS;
        let word = bitmap[idx];
        if word != 0 {
            let bit = idx * u64::BITS as usize + word.trailing_zeros() as usize;
            // words before `word0` are only reached after wrapping around
            return Some(if idx > word0 { bit } else { bit + Level::SLOTS });
        }
    }

    // finally the bits of the first word below `offset`, a full lap away
    let last = bitmap[word0] & !(!0u64 << bit0);
    if last != 0 {
        return Some(word0 * u64::BITS as usize + last.trailing_zeros() as usize + Level::SLOTS);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_set_bit_finds_bits_at_and_after_the_offset() {
        let mut bitmap = [0u64; Level::WORDS];
        bitmap[0] = 1 << 9;
        assert_eq!(next_set_bit(&bitmap, 0), Some(9));
        assert_eq!(next_set_bit(&bitmap, 9), Some(9));
        assert_eq!(next_set_bit(&bitmap, 10), Some(9 + Level::SLOTS));

        bitmap[3] = 1 << 63;
        assert_eq!(next_set_bit(&bitmap, 10), Some(255));
        assert_eq!(next_set_bit(&bitmap, 255), Some(255));
    }

    #[test]
    fn next_set_bit_reports_wrapped_distance() {
        let mut bitmap = [0u64; Level::WORDS];
        bitmap[1] = 0b100; // slot 66
        assert_eq!(next_set_bit(&bitmap, 70), Some(66 + Level::SLOTS));
        assert_eq!(next_set_bit(&bitmap, 64), Some(66));
    }

    #[test]
    fn next_set_bit_on_an_empty_bitmap() {
        let bitmap = [0u64; Level::WORDS];
        for offset in [0, 1, 63, 64, 255] {
            assert_eq!(next_set_bit(&bitmap, offset), None);
        }
    }

    #[test]
    fn slot_geometry_per_level() {
        let l0 = Level::new(0);
        let l1 = Level::new(1);
        let l3 = Level::new(3);
        assert_eq!(l0.slot_index(300), 44);
        assert_eq!(l1.slot_index(300), 1);
        assert_eq!(l1.slot_index(70_000), 17);
        assert_eq!(l3.slot_index(1 << 24), 1);
    }
}
