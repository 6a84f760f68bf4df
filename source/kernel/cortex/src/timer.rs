// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Time in ticks, milliseconds and microseconds, plus the scheduling tick.

use crate::config::{CLOCK_FREQ, TICKS_PER_SEC};
use crate::hal::{self, Timer};

const MSEC_PER_SEC: usize = 1000;
const USEC_PER_SEC: usize = 1_000_000;

/// Raw value of the `time` counter.
pub fn get_time() -> usize {
    hal::machine().timer().now() as usize
}

pub fn get_time_ms() -> usize {
    get_time() / (CLOCK_FREQ / MSEC_PER_SEC)
}

pub fn get_time_us() -> usize {
    get_time() / (CLOCK_FREQ / USEC_PER_SEC)
}

/// Arms the timer interrupt one scheduling quantum from now.
pub fn set_next_trigger() {
    let deadline = get_time() + CLOCK_FREQ / TICKS_PER_SEC;
    hal::machine().timer().set_trigger(deadline as u64);
}
