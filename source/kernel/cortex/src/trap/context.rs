// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved user register state.
//! Must match the `arch/riscv/trap.S` save/restore layout.

use core::mem::offset_of;

use static_assertions::const_assert_eq;

const SSTATUS_SPP: usize = 1 << 8;

/// One instance lives at `TRAP_CONTEXT_BASE` in every user address space.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapContext {
    /// x0..x31 (x0 is always 0; we never write it).
    pub x: [usize; 32],
    pub sstatus: usize,
    pub sepc: usize,
    /// Kernel page table token loaded by `__alltraps`.
    pub kernel_satp: usize,
    /// Top of the kernel stack `__alltraps` switches to.
    pub kernel_sp: usize,
    /// Address of the Rust trap entry.
    pub trap_handler: usize,
}

const_assert_eq!(offset_of!(TrapContext, sstatus), 32 * 8);
const_assert_eq!(offset_of!(TrapContext, sepc), 33 * 8);
const_assert_eq!(offset_of!(TrapContext, kernel_satp), 34 * 8);
const_assert_eq!(offset_of!(TrapContext, kernel_sp), 35 * 8);
const_assert_eq!(offset_of!(TrapContext, trap_handler), 36 * 8);
const_assert_eq!(core::mem::size_of::<TrapContext>(), 37 * 8);

impl TrapContext {
    pub fn set_sp(&mut self, sp: usize) {
        self.x[2] = sp;
    }

    /// Context that enters U-mode at `entry` with stack pointer `sp`.
    pub fn app_init_context(
        entry: usize,
        sp: usize,
        kernel_satp: usize,
        kernel_sp: usize,
        trap_handler: usize,
    ) -> Self {
        let mut cx = Self {
            x: [0; 32],
            sstatus: current_sstatus() & !SSTATUS_SPP,
            sepc: entry,
            kernel_satp,
            kernel_sp,
            trap_handler,
        };
        cx.set_sp(sp);
        cx
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn current_sstatus() -> usize {
    let value: usize;
    // SAFETY: reading sstatus has no side effects.
    unsafe { core::arch::asm!("csrr {0}, sstatus", out(reg) value, options(nomem, nostack)) };
    value
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn current_sstatus() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_context_returns_to_user_mode() {
        let cx = TrapContext::app_init_context(0x1000, 0x8000, 7, 0x9000, 0xabc);
        assert_eq!(cx.sepc, 0x1000);
        assert_eq!(cx.x[2], 0x8000);
        assert_eq!(cx.sstatus & SSTATUS_SPP, 0);
        assert_eq!((cx.kernel_satp, cx.kernel_sp, cx.trap_handler), (7, 0x9000, 0xabc));
        assert!(cx.x.iter().enumerate().all(|(i, &r)| i == 2 || r == 0));
    }
}
