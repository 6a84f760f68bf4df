// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: RISC-V boot and trap glue for QEMU `virt` (bare metal only)
//! OWNERS: @kernel-team
//! PUBLIC API: run()
//! DEPENDS_ON: kernel::Kernel, trap.S (trampoline), entry.S, riscv CSRs, sbi-rt
//! INVARIANTS: `_start` calls the image's `kernel_main`, which calls [`run`] exactly once;
//!             the kernel lock is held for one trap and released before leaving the kernel;
//!             S-mode never enables SIE, so no trap nests inside the kernel

extern crate alloc;

use alloc::sync::Arc;
use core::arch::{asm, global_asm};
use core::mem::offset_of;

use riscv::register::{mtvec::TrapMode, scause, sie, stval, stvec};
use spin::Mutex;

use crate::config::{TRAMPOLINE, TRAP_CONTEXT_BASE};
use crate::fs::FileSystem;
use crate::kernel::{BootConfig, Kernel};
use crate::mm;
use crate::timer;
use crate::trap::{Trap, TrapContext, TrapOutcome};

global_asm!(include_str!("entry.S"));
global_asm!(
    include_str!("trap.S"),
    OFF_SSTATUS = const offset_of!(TrapContext, sstatus),
    OFF_SEPC = const offset_of!(TrapContext, sepc),
    OFF_KERNEL_SATP = const offset_of!(TrapContext, kernel_satp),
    OFF_KERNEL_SP = const offset_of!(TrapContext, kernel_sp),
    OFF_TRAP_HANDLER = const offset_of!(TrapContext, trap_handler),
);

extern "C" {
    fn sbss_with_stack();
    fn ebss();
    fn boot_stack_top();
    fn __alltraps();
    fn __restore();
}

static KERNEL: Mutex<Option<Kernel>> = Mutex::new(None);

/// Boots the kernel with the file system built by `build_fs` and enters `init`.
///
/// `build_fs` runs after the heap is up, so it may allocate.
pub fn run(build_fs: impl FnOnce() -> Arc<dyn FileSystem>, init: &str) -> ! {
    clear_bss();
    set_kernel_trap_entry();
    mm::init();

    let config = BootConfig { kernel_sp: boot_stack_top as usize, trap_handler: trap_handler as usize };
    let mut kernel = match Kernel::boot(build_fs(), init, config) {
        Ok(kernel) => kernel,
        Err(err) => panic!("boot failed: {err}"),
    };
    // SAFETY: only arms the timer source; SIE stays clear in S-mode.
    unsafe { sie::set_stimer() };
    timer::set_next_trigger();

    let outcome = kernel.resume();
    *KERNEL.lock() = Some(kernel);
    finish(outcome)
}

fn clear_bss() {
    let start = sbss_with_stack as usize;
    let end = ebss as usize;
    // The boot stack sits at the front of .bss and is in use; skip it.
    let start = start.max(boot_stack_top as usize);
    // SAFETY: [start, end) is .bss past the boot stack, owned by nobody yet.
    unsafe { core::ptr::write_bytes(start as *mut u8, 0, end.saturating_sub(start)) };
}

fn set_kernel_trap_entry() {
    // SAFETY: `trap_from_kernel` never returns.
    unsafe { stvec::write(trap_from_kernel as usize, TrapMode::Direct) };
}

fn set_user_trap_entry() {
    // SAFETY: TRAMPOLINE maps `__alltraps` in every address space.
    unsafe { stvec::write(TRAMPOLINE, TrapMode::Direct) };
}

/// Rust trap entry; `__alltraps` jumps here on the kernel stack with the kernel satp.
#[no_mangle]
extern "C" fn trap_handler() -> ! {
    set_kernel_trap_entry();
    let trap = Trap::from_scause(scause::read().bits());
    let stval = stval::read();
    let outcome = match KERNEL.lock().as_mut() {
        Some(kernel) => kernel.handle_trap(trap, stval),
        None => panic!("{} before boot finished", trap.describe()),
    };
    finish(outcome)
}

#[no_mangle]
extern "C" fn trap_from_kernel() -> ! {
    let trap = Trap::from_scause(scause::read().bits());
    panic!("{} in S-mode, stval={:#x}", trap.describe(), stval::read());
}

fn finish(mut outcome: TrapOutcome) -> ! {
    loop {
        match outcome {
            TrapOutcome::Resume { satp, .. } => trap_return(satp),
            TrapOutcome::Shutdown { exit_code } => shutdown(exit_code),
            TrapOutcome::Idle => {
                // wfi still wakes on a pending STIP with SIE clear.
                // SAFETY: no side effects beyond stalling the hart.
                unsafe { asm!("wfi", options(nomem, nostack, preserves_flags)) };
                timer::set_next_trigger();
                outcome = match KERNEL.lock().as_mut() {
                    Some(kernel) => kernel.resume(),
                    None => TrapOutcome::Idle,
                };
            }
        }
    }
}

fn trap_return(user_satp: usize) -> ! {
    set_user_trap_entry();
    let restore_va = __restore as usize - __alltraps as usize + TRAMPOLINE;
    // SAFETY: `__restore` is reachable at `restore_va` in both the kernel and the user
    // space, and TRAP_CONTEXT_BASE holds the context of the task owning `user_satp`.
    unsafe {
        asm!(
            "fence.i",
            "jr {restore_va}",
            restore_va = in(reg) restore_va,
            in("a0") TRAP_CONTEXT_BASE,
            in("a1") user_satp,
            options(noreturn)
        );
    }
}

fn shutdown(exit_code: i32) -> ! {
    ::log::info!(target: "kernel", "init exited with {}, powering off", exit_code);
    if exit_code == 0 {
        let _ = sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::NoReason);
    } else {
        let _ = sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure);
    }
    loop {
        // SAFETY: as in `finish`.
        unsafe { asm!("wfi", options(nomem, nostack, preserves_flags)) };
    }
}
