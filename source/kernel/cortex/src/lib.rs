// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: CORTEX kernel core for RISC-V Sv39
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, BootConfig, BootError, Trap, TrapOutcome, TrapContext, Pid
//! DEPENDS_ON: bitflags, spin, log, xmas-elf, static_assertions; riscv/sbi-rt on the target
//! INVARIANTS: One `Kernel` value owns all task state; host builds run the same code
//!             against the simulated machine in `hal::host`

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

extern crate alloc;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod arch;
pub mod config;
pub mod diag;
pub mod fs;
pub mod hal;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod syscall;
pub mod task;
pub mod timer;
pub mod trap;
pub mod types;

#[cfg(any(test, feature = "harness"))]
pub mod harness;

#[cfg(all(feature = "panic_handler", target_arch = "riscv64", target_os = "none", not(test)))]
mod panic;

pub use kernel::{BootConfig, BootError, Kernel};
pub use trap::{Trap, TrapContext, TrapOutcome};
pub use types::Pid;
