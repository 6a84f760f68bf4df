// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap decoding and routing for traps taken from U-mode
//! OWNERS: @kernel-team
//! PUBLIC API: Trap, Exception, Interrupt, TrapOutcome, TrapContext
//! DEPENDS_ON: kernel::Kernel, syscall, task::signal, timer
//! INVARIANTS: A user fault ends only the faulting task; syscall results are written to the
//!             caller's context looked up after the handler ran (exec replaces it)

pub mod context;

pub use context::TrapContext;

use crate::kernel::Kernel;
use crate::mm::{PageTable, VirtAddr};
use crate::syscall::{self, api, Args, Error};
use crate::task::signal::{SIGBUS, SIGILL, SIGSEGV, SIGTRAP};
use crate::timer;
use crate::types::Pid;

const INTERRUPT_BIT: usize = 1 << (usize::BITS - 1);

/// Synchronous exception causes (scause with the interrupt bit clear).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    InstructionMisaligned,
    InstructionFault,
    IllegalInstruction,
    Breakpoint,
    LoadMisaligned,
    LoadFault,
    StoreMisaligned,
    StoreFault,
    UserEnvCall,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Unknown(usize),
}

impl Exception {
    fn from_code(code: usize) -> Self {
        match code {
            0 => Self::InstructionMisaligned,
            1 => Self::InstructionFault,
            2 => Self::IllegalInstruction,
            3 => Self::Breakpoint,
            4 => Self::LoadMisaligned,
            5 => Self::LoadFault,
            6 => Self::StoreMisaligned,
            7 => Self::StoreFault,
            8 => Self::UserEnvCall,
            12 => Self::InstructionPageFault,
            13 => Self::LoadPageFault,
            15 => Self::StorePageFault,
            other => Self::Unknown(other),
        }
    }

    /// Page and access faults: the task touched memory it may not use.
    pub fn is_memory_fault(self) -> bool {
        matches!(
            self,
            Self::InstructionFault
                | Self::LoadFault
                | Self::StoreFault
                | Self::InstructionPageFault
                | Self::LoadPageFault
                | Self::StorePageFault
        )
    }

    /// Signal raised on the task for exceptions that are not memory faults or syscalls.
    pub fn signal(self) -> usize {
        match self {
            Self::Breakpoint => SIGTRAP,
            Self::InstructionMisaligned | Self::LoadMisaligned | Self::StoreMisaligned => SIGBUS,
            _ => SIGILL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoft,
    SupervisorTimer,
    SupervisorExternal,
    Unknown(usize),
}

impl Interrupt {
    fn from_code(code: usize) -> Self {
        match code {
            1 => Self::SupervisorSoft,
            5 => Self::SupervisorTimer,
            9 => Self::SupervisorExternal,
            other => Self::Unknown(other),
        }
    }
}

/// Decoded `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trap {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl Trap {
    pub fn from_scause(bits: usize) -> Self {
        let code = bits & !INTERRUPT_BIT;
        if bits & INTERRUPT_BIT != 0 {
            Self::Interrupt(Interrupt::from_code(code))
        } else {
            Self::Exception(Exception::from_code(code))
        }
    }

    /// Human-readable cause for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Interrupt(Interrupt::SupervisorSoft) => "SupervisorSoftInt",
            Self::Interrupt(Interrupt::SupervisorTimer) => "SupervisorTimerInt",
            Self::Interrupt(Interrupt::SupervisorExternal) => "SupervisorExternalInt",
            Self::Interrupt(Interrupt::Unknown(_)) => "Interrupt",
            Self::Exception(exception) => match exception {
                Exception::InstructionMisaligned => "InstructionAddressMisaligned",
                Exception::InstructionFault => "InstructionAccessFault",
                Exception::IllegalInstruction => "IllegalInstruction",
                Exception::Breakpoint => "Breakpoint",
                Exception::LoadMisaligned => "LoadAddressMisaligned",
                Exception::LoadFault => "LoadAccessFault",
                Exception::StoreMisaligned => "StoreAMOAddressMisaligned",
                Exception::StoreFault => "StoreAMOAccessFault",
                Exception::UserEnvCall => "EnvironmentCallFromUMode",
                Exception::InstructionPageFault => "InstructionPageFault",
                Exception::LoadPageFault => "LoadPageFault",
                Exception::StorePageFault => "StoreAMOPageFault",
                Exception::Unknown(_) => "Exception",
            },
        }
    }
}

/// What the trap exit path does next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Return to U-mode in `pid` using page table `satp`.
    Resume { pid: Pid, satp: usize },
    /// Nothing runnable; wait for the next interrupt.
    Idle,
    /// Init exited; power off.
    Shutdown { exit_code: i32 },
}

/// Routes one trap taken while the current task was running in U-mode.
pub(crate) fn handle(kernel: &mut Kernel, trap: Trap, stval: usize) {
    let Some(pid) = kernel.scheduler.current() else {
        ::log::debug!(target: "trap", "{} with no current task ignored", trap.describe());
        return;
    };
    match trap {
        Trap::Exception(Exception::UserEnvCall) => user_syscall(kernel, pid),
        Trap::Exception(exception) if exception.is_memory_fault() => {
            memory_fault(kernel, pid, trap, stval)
        }
        Trap::Exception(exception) => fatal_exception(kernel, pid, trap, exception.signal(), stval),
        Trap::Interrupt(Interrupt::SupervisorTimer) => {
            timer::set_next_trigger();
            kernel.scheduler.request_resched();
        }
        Trap::Interrupt(other) => {
            ::log::debug!(target: "trap", "unexpected interrupt {:?} in pid {}", other, pid);
        }
    }
}

fn user_syscall(kernel: &mut Kernel, pid: Pid) {
    let Some(cx) = kernel.tasks.trap_cx_mut(pid) else {
        return;
    };
    cx.sepc += 4;
    let id = cx.x[17];
    let args = Args::new([cx.x[10], cx.x[11], cx.x[12], cx.x[13], cx.x[14], cx.x[15]]);
    kernel.tasks.record_syscall(pid, id);

    let result = {
        let mut ctx = api::Context::new(pid, &mut kernel.tasks, &mut kernel.scheduler, kernel.fs.as_ref());
        kernel.syscalls.dispatch(id, &mut ctx, &args)
    };
    ::log::trace!(target: "syscall", "pid {} id {} -> {:?}", pid, id, result);

    match result {
        Err(Error::TaskExit) => {}
        Err(Error::Reschedule) => {
            if let Some(cx) = kernel.tasks.trap_cx_mut(pid) {
                cx.sepc -= 4;
            }
            kernel.tasks.unrecord_syscall(pid, id);
            kernel.scheduler.request_resched();
        }
        other => {
            let value = match other {
                Ok(value) => value,
                Err(err) => syscall::encode_error(err),
            };
            if let Some(cx) = kernel.tasks.trap_cx_mut(pid) {
                cx.x[10] = value;
            }
        }
    }
}

fn memory_fault(kernel: &mut Kernel, pid: Pid, trap: Trap, stval: usize) {
    let kind = match kernel.tasks.token(pid) {
        Some(token) => match PageTable::from_token(token).translate(VirtAddr::from(stval).floor()) {
            Some(pte) if pte.is_valid() => "permission",
            _ => "unmapped",
        },
        None => "unmapped",
    };
    let sepc = kernel.tasks.trap_cx(pid).map_or(0, |cx| cx.sepc);
    ::log::warn!(
        target: "trap",
        "pid {} {} ({}) stval={:#x} sepc={:#x}, killed",
        pid,
        trap.describe(),
        kind,
        stval,
        sepc
    );
    kernel.exit_task(pid, -(SIGSEGV as i32));
}

fn fatal_exception(kernel: &mut Kernel, pid: Pid, trap: Trap, signum: usize, stval: usize) {
    let caught = kernel.tasks.task(pid).is_some_and(|task| task.signals.would_catch(signum));
    let sepc = kernel.tasks.trap_cx(pid).map_or(0, |cx| cx.sepc);
    if caught {
        ::log::debug!(target: "trap", "pid {} {} delivered as signal {}", pid, trap.describe(), signum);
        let _ = kernel.tasks.raise(pid, signum);
        return;
    }
    ::log::warn!(
        target: "trap",
        "pid {} {} stval={:#x} sepc={:#x}, killed by signal {}",
        pid,
        trap.describe(),
        stval,
        sepc,
        signum
    );
    kernel.exit_task(pid, -(signum as i32));
}
