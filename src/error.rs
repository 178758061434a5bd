// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Enumerated failures of the timer wheel.
///
/// Every fallible wheel operation reports one of these; the wheel never
/// logs-and-swallows and never aborts on a contract error.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimerError {
    /// An internal allocation was refused.
    ///
    /// Part of the operation contract but never produced by this
    /// implementation: [`TimerWheel::new`][crate::TimerWheel::new] builds
    /// all bucket state inline and allocates nothing.
    NoMemory,
    /// The wheel could not be claimed without blocking.
    ///
    /// Reserved for callers layering try-semantics on top of the wheel;
    /// the wheel itself never returns it.
    Busy,
    /// The timer was not armed in this wheel.
    NotFound,
    /// The timer is already armed and must be removed (or allowed to fire)
    /// before it can be inserted again.
    Exists,
    /// The tick resolution passed to [`TimerWheel::new`][crate::TimerWheel::new]
    /// was zero.
    InvalidResolution,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::NoMemory => f.write_str("memory allocation failed"),
            TimerError::Busy => f.write_str("wheel is busy"),
            TimerError::NotFound => f.write_str("timer is not armed"),
            TimerError::Exists => f.write_str("timer is already armed"),
            TimerError::InvalidResolution => f.write_str("tick resolution must be non-zero"),
        }
    }
}

impl core::error::Error for TimerError {}
