// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::pin::Pin;
use core::ptr::NonNull;

use crate::{TimeVal, TimerEntry, TimerError, TimerWheel};

pub(crate) fn ms(millis: i64) -> TimeVal {
    TimeVal::from_millis(millis)
}

/// A heap-pinned timer entry.
///
/// Arming hands the wheel a raw pointer into caller-owned storage; boxing
/// the entry gives tests a stable address for the entry's whole lifetime,
/// so the pointer stays valid no matter how the `TestEntry` itself moves.
pub(crate) struct TestEntry {
    inner: Pin<Box<TimerEntry>>,
}

impl TestEntry {
    pub(crate) fn new(due: TimeVal) -> Self {
        Self {
            inner: Box::pin(TimerEntry::new(due)),
        }
    }

    pub(crate) fn ptr(&mut self) -> NonNull<TimerEntry> {
        // Safety: the pointer is only handed to wheel operations, which
        // treat the entry as pinned.
        unsafe { NonNull::from(Pin::into_inner_unchecked(self.inner.as_mut())) }
    }

    pub(crate) fn entry(&self) -> &TimerEntry {
        &self.inner
    }

    pub(crate) fn insert(&mut self, wheel: &TimerWheel) -> Result<(), TimerError> {
        let ptr = self.ptr();
        // Safety: the entry is heap-pinned and outlives its arming (the
        // TestEntry keeps the box alive).
        unsafe { wheel.insert(ptr) }
    }

    pub(crate) fn remove(&mut self, wheel: &TimerWheel) -> Result<(), TimerError> {
        let ptr = self.ptr();
        // Safety: see `insert`.
        unsafe { wheel.remove(ptr) }
    }
}
