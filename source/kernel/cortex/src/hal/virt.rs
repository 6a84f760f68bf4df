// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{AtomicUsize, Ordering};

use super::{Console, Mmu, Timer};

const UART0_BASE: usize = 0x1000_0000;
const UART_RBR: usize = 0x0;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_DATA_READY: u8 = 1;
const LSR_TX_IDLE: u8 = 1 << 5;

/// Collection of HAL devices for the virt machine.
pub struct VirtMachine {
    timer: VirtTimer,
    console: VirtUart,
    mmu: VirtMmu,
}

impl VirtMachine {
    /// Constructs the HAL facade.
    pub const fn new() -> Self {
        Self { timer: VirtTimer, console: VirtUart, mmu: VirtMmu { satp: AtomicUsize::new(0) } }
    }

    pub const fn timer(&self) -> &VirtTimer {
        &self.timer
    }

    pub const fn console(&self) -> &VirtUart {
        &self.console
    }

    pub const fn mmu(&self) -> &VirtMmu {
        &self.mmu
    }
}

/// Virt specific timer mapped to the `time` CSR and programmed through SBI.
pub struct VirtTimer;

impl Timer for VirtTimer {
    fn now(&self) -> u64 {
        riscv::register::time::read() as u64
    }

    fn set_trigger(&self, deadline: u64) {
        let _ = sbi_rt::set_timer(deadline as _);
    }
}

/// Memory mapped NS16550A UART.
pub struct VirtUart;

impl Console for VirtUart {
    fn putchar(&self, byte: u8) {
        // SAFETY: UART0 is identity-mapped into the kernel space and only touched here.
        unsafe {
            while read_volatile((UART0_BASE + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
            write_volatile((UART0_BASE + UART_TX) as *mut u8, byte);
        }
    }

    fn getchar(&self) -> Option<u8> {
        // SAFETY: as above.
        unsafe {
            if read_volatile((UART0_BASE + UART_LSR) as *const u8) & LSR_DATA_READY == 0 {
                return None;
            }
            Some(read_volatile((UART0_BASE + UART_RBR) as *const u8))
        }
    }
}

/// Sv39 MMU control via `satp` and `sfence.vma`.
pub struct VirtMmu {
    satp: AtomicUsize,
}

impl Mmu for VirtMmu {
    fn activate(&self, token: usize) {
        self.satp.store(token, Ordering::Relaxed);
        // SAFETY: `token` names a page table that maps the kernel's own text and data
        // identically, so execution continues at the next instruction.
        unsafe {
            core::arch::asm!("csrw satp, {0}", "sfence.vma", in(reg) token, options(nostack));
        }
    }

    fn active_token(&self) -> usize {
        self.satp.load(Ordering::Relaxed)
    }
}
