// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic HAL used by host builds and tests
//! OWNERS: @kernel-team
//! PUBLIC API: HostMachine, HostTimer, HostConsole, HostMmu
//! INVARIANTS: Time advances by exactly one millisecond per read; no real devices touched

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::{Console, Mmu, Timer};
use crate::config::CLOCK_FREQ;

/// Ticks added to the host clock on every read.
pub const HOST_TICK_STEP: u64 = (CLOCK_FREQ / 1000) as u64;

pub struct HostMachine {
    timer: HostTimer,
    console: HostConsole,
    mmu: HostMmu,
}

impl HostMachine {
    pub const fn new() -> Self {
        Self {
            timer: HostTimer { ticks: AtomicU64::new(0), trigger: AtomicU64::new(0) },
            console: HostConsole { output: Mutex::new(Vec::new()), input: Mutex::new(VecDeque::new()) },
            mmu: HostMmu { token: AtomicUsize::new(0) },
        }
    }

    pub const fn timer(&self) -> &HostTimer {
        &self.timer
    }

    pub const fn console(&self) -> &HostConsole {
        &self.console
    }

    pub const fn mmu(&self) -> &HostMmu {
        &self.mmu
    }
}

/// Counter that moves forward one millisecond each time it is read.
pub struct HostTimer {
    ticks: AtomicU64,
    trigger: AtomicU64,
}

impl HostTimer {
    /// Deadline passed to the most recent [`Timer::set_trigger`].
    pub fn trigger(&self) -> u64 {
        self.trigger.load(Ordering::Relaxed)
    }
}

impl Timer for HostTimer {
    fn now(&self) -> u64 {
        self.ticks.fetch_add(HOST_TICK_STEP, Ordering::Relaxed) + HOST_TICK_STEP
    }

    fn set_trigger(&self, deadline: u64) {
        self.trigger.store(deadline, Ordering::Relaxed);
    }
}

/// Captures console output and serves queued input.
pub struct HostConsole {
    output: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
}

impl HostConsole {
    /// Queues bytes for subsequent [`Console::getchar`] calls.
    pub fn push_input(&self, bytes: &[u8]) {
        self.input.lock().extend(bytes.iter().copied());
    }

    /// Copy of everything written so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.lock().clone()
    }
}

impl Console for HostConsole {
    fn putchar(&self, byte: u8) {
        self.output.lock().push(byte);
    }

    fn getchar(&self) -> Option<u8> {
        self.input.lock().pop_front()
    }
}

/// Records the active token; there is no hardware walker on the host.
pub struct HostMmu {
    token: AtomicUsize,
}

impl Mmu for HostMmu {
    fn activate(&self, token: usize) {
        self.token.store(token, Ordering::Relaxed);
    }

    fn active_token(&self) -> usize {
        self.token.load(Ordering::Relaxed)
    }
}
