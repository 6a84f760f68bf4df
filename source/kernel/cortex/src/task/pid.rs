// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Pid allocation with recycling.

extern crate alloc;

use alloc::vec::Vec;

use crate::types::Pid;

/// Hands out the lowest never-used pid unless a reaped one is available.
#[derive(Debug)]
pub struct PidAllocator {
    next: u32,
    recycled: Vec<u32>,
}

impl PidAllocator {
    pub fn new() -> Self {
        Self { next: Pid::INIT.as_raw(), recycled: Vec::new() }
    }

    pub fn alloc(&mut self) -> Pid {
        if let Some(raw) = self.recycled.pop() {
            return Pid::from_raw(raw);
        }
        let pid = Pid::from_raw(self.next);
        self.next += 1;
        pid
    }

    /// Returns `pid` to the pool.
    ///
    /// # Panics
    /// On a pid that was never handed out or is already free.
    pub fn dealloc(&mut self, pid: Pid) {
        let raw = pid.as_raw();
        assert!(raw != Pid::KERNEL.as_raw() && raw < self.next, "pid {pid} was never allocated");
        assert!(!self.recycled.contains(&raw), "pid {pid} has already been deallocated");
        self.recycled.push(raw);
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
