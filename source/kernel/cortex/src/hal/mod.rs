// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware abstraction layer traits.
//!
//! The kernel talks to exactly three devices: the `time` counter, the
//! console and the MMU. [`machine()`] returns the QEMU `virt` backends on
//! the bare-metal target and deterministic stand-ins everywhere else.

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod host;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use host::HostMachine as Machine;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use virt::VirtMachine as Machine;

/// Abstraction for a monotonic timer counting `CLOCK_FREQ` ticks per second.
pub trait Timer {
    /// Returns the current tick count.
    fn now(&self) -> u64;
    /// Programs the next timer interrupt at an absolute tick count.
    fn set_trigger(&self, deadline: u64);
}

/// Byte-oriented console used by stdio and the logger.
pub trait Console {
    fn putchar(&self, byte: u8);
    /// Returns the next input byte, if one is available.
    fn getchar(&self) -> Option<u8>;
}

/// Address translation control.
pub trait Mmu {
    /// Switches translation to the page table identified by `token` (a satp value)
    /// and flushes stale translations.
    fn activate(&self, token: usize);
    /// Token most recently passed to [`Mmu::activate`].
    fn active_token(&self) -> usize;
}

static MACHINE: Machine = Machine::new();

/// Returns the HAL facade for the machine the kernel runs on.
#[inline]
pub fn machine() -> &'static Machine {
    &MACHINE
}
