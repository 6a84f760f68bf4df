// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process identifier newtype shared by the task table, scheduler and syscalls
//! OWNERS: @kernel-team
//! PUBLIC API: Pid
//! INVARIANTS: PID 0 is reserved for the kernel; user-visible PIDs start at 1

use core::fmt;

/// Process identifier (PID).
///
/// **Ownership**: Only `TaskTable` hands out PIDs; they are recycled after reaping.
/// **Invariant**: PID 0 is reserved for the kernel (never exposed to userspace).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Kernel PID (reserved, never exposed to userspace).
    pub const KERNEL: Self = Self(0);
    /// The first user task; adopts orphans and ends the system when it exits.
    pub const INIT: Self = Self(1);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into task-owned vectors.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Decodes a syscall argument, rejecting values that do not fit.
    #[inline]
    pub fn from_user(raw: usize) -> Option<Self> {
        u32::try_from(raw).ok().map(Self)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

impl From<Pid> for usize {
    #[inline]
    fn from(pid: Pid) -> Self {
        pid.as_index()
    }
}
