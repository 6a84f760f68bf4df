// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Compile-time layout and timing constants.
//!
//! The high end of every user address space is fixed:
//!
//! ```text
//! TRAMPOLINE          shared trap entry/exit code, R|X, not user
//! TRAP_CONTEXT_BASE   per-task TrapContext, R|W, not user
//! (guard page)
//! USER_STACK_TOP      user stack grows down from here
//! ```

/// User stack size in bytes.
pub const USER_STACK_SIZE: usize = 4096 * 2;
/// Kernel heap backing the global allocator on the target.
pub const KERNEL_HEAP_SIZE: usize = 0x30_0000;
/// End of physical RAM on QEMU `virt` with 128 MiB.
pub const MEMORY_END: usize = 0x8800_0000;

pub const PAGE_SIZE: usize = 0x1000;
pub const PAGE_SIZE_BITS: usize = 0xc;

pub const TRAMPOLINE: usize = usize::MAX - PAGE_SIZE + 1;
pub const TRAP_CONTEXT_BASE: usize = TRAMPOLINE - PAGE_SIZE;
pub const USER_STACK_TOP: usize = TRAP_CONTEXT_BASE - PAGE_SIZE;

/// `time` CSR frequency (10 MHz on QEMU virt).
pub const CLOCK_FREQ: usize = 10_000_000;
/// Timer interrupts per second; one tick is one scheduling quantum.
pub const TICKS_PER_SEC: usize = 100;

/// Upper bound (exclusive) of syscall ids tracked by the dispatcher.
pub const MAX_SYSCALL_NUM: usize = 500;

/// Frames in the simulated physical pool used by host builds (64 MiB).
pub const HOST_FRAME_COUNT: usize = 16384;

/// Device windows identity-mapped into the kernel space: (base, len).
pub const MMIO: &[(usize, usize)] = &[
    (0x0010_0000, 0x00_2000), // VIRT_TEST/RTC
    (0x1000_0000, 0x00_1000), // UART0
];
