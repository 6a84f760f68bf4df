// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, encode_error, SYSCALL_* IDs
//! DEPENDS_ON: mm, task, fs, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL_NUM window; stable IDs; decode/check/execute discipline;
//!             every failure reaches user space as a negative errno

pub mod api;
mod fs;
mod process;
mod signal;

pub use process::{TaskInfo, TimeVal};

use core::fmt;

use crate::config::MAX_SYSCALL_NUM;
use crate::mm::MemoryError;
use crate::task::{self, signal::SignalError};

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

pub const SYSCALL_DUP: usize = 24;
pub const SYSCALL_OPEN: usize = 56;
pub const SYSCALL_CLOSE: usize = 57;
pub const SYSCALL_PIPE: usize = 59;
pub const SYSCALL_READ: usize = 63;
pub const SYSCALL_WRITE: usize = 64;
pub const SYSCALL_EXIT: usize = 93;
pub const SYSCALL_YIELD: usize = 124;
pub const SYSCALL_KILL: usize = 129;
pub const SYSCALL_SIGACTION: usize = 134;
pub const SYSCALL_SIGPROCMASK: usize = 135;
pub const SYSCALL_SIGRETURN: usize = 139;
pub const SYSCALL_GET_TIME: usize = 169;
pub const SYSCALL_GETPID: usize = 172;
pub const SYSCALL_SBRK: usize = 214;
pub const SYSCALL_MUNMAP: usize = 215;
pub const SYSCALL_FORK: usize = 220;
pub const SYSCALL_EXEC: usize = 221;
pub const SYSCALL_MMAP: usize = 222;
pub const SYSCALL_WAITPID: usize = 260;
/// Creates a child directly from an image path (no fork).
pub const SYSCALL_SPAWN: usize = 400;
/// Copies per-task status, syscall counters and run time to user space.
pub const SYSCALL_TASK_INFO: usize = 410;

pub const EPERM: usize = 1;
pub const ENOENT: usize = 2;
pub const ESRCH: usize = 3;
pub const EBADF: usize = 9;
pub const ECHILD: usize = 10;
pub const EAGAIN: usize = 11;
pub const ENOMEM: usize = 12;
pub const EFAULT: usize = 14;
pub const EINVAL: usize = 22;
pub const EPIPE: usize = 32;
pub const ENOSYS: usize = 38;

/// Negative errno in the register encoding user space sees.
pub const fn errno(code: usize) -> usize {
    (-(code as isize)) as usize
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// A user pointer does not translate to accessible memory.
    BadAddress,
    /// Descriptor not open, or open in the wrong direction.
    BadFd,
    InvalidArgument,
    /// Target task missing or already exited.
    NoSuchProcess,
    /// The kernel task cannot be signalled.
    PermissionDenied,
    /// Write to a pipe with no readers.
    BrokenPipe,
    /// Path does not exist.
    NotFound,
    Spawn(task::SpawnError),
    Exec(task::ExecError),
    Wait(task::WaitError),
    Signal(SignalError),
    Memory(MemoryError),
    /// Current task terminated and should not resume.
    TaskExit,
    /// Request an immediate reschedule **without** advancing the caller PC (`sepc`).
    ///
    /// Handlers never switch tasks themselves; the trap exit path picks the next task and the
    /// same syscall is retried when the caller runs again.
    Reschedule,
}

impl From<task::SpawnError> for Error {
    fn from(value: task::SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl From<task::ExecError> for Error {
    fn from(value: task::ExecError) -> Self {
        Self::Exec(value)
    }
}

impl From<task::WaitError> for Error {
    fn from(value: task::WaitError) -> Self {
        Self::Wait(value)
    }
}

impl From<SignalError> for Error {
    fn from(value: SignalError) -> Self {
        Self::Signal(value)
    }
}

impl From<MemoryError> for Error {
    fn from(value: MemoryError) -> Self {
        Self::Memory(value)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(err) => write!(f, "spawn: {err}"),
            Self::Exec(err) => write!(f, "exec: {err}"),
            Self::Wait(err) => write!(f, "wait: {err}"),
            Self::Signal(err) => write!(f, "signal: {err}"),
            Self::Memory(err) => write!(f, "memory: {err}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Maps an error to the value placed in `a0`.
///
/// `TaskExit` and `Reschedule` never reach user space; they encode as 0.
pub fn encode_error(err: Error) -> usize {
    let code = match err {
        Error::InvalidSyscall => ENOSYS,
        Error::BadAddress => EFAULT,
        Error::BadFd => EBADF,
        Error::InvalidArgument | Error::Signal(_) => EINVAL,
        Error::NoSuchProcess => ESRCH,
        Error::PermissionDenied => EPERM,
        Error::BrokenPipe => EPIPE,
        Error::NotFound | Error::Spawn(task::SpawnError::NotFound) | Error::Exec(task::ExecError::NotFound) => ENOENT,
        Error::Spawn(task::SpawnError::NoSuchParent) | Error::Exec(task::ExecError::NoSuchTask) => ESRCH,
        Error::Exec(task::ExecError::ArgsTooLong) => EINVAL,
        Error::Wait(task::WaitError::NoChildren) => ECHILD,
        Error::Wait(task::WaitError::StillRunning) => EAGAIN,
        Error::Spawn(task::SpawnError::Memory(err)) | Error::Exec(task::ExecError::Memory(err)) | Error::Memory(err) => {
            return errno(memory_errno(err));
        }
        Error::TaskExit | Error::Reschedule => return 0,
    };
    errno(code)
}

fn memory_errno(err: MemoryError) -> usize {
    match err {
        MemoryError::Map(crate::mm::MapError::AllocationExhausted) => ENOMEM,
        MemoryError::InvalidElf(_) => ENOENT,
        _ => EINVAL,
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL_NUM],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL_NUM] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL_NUM {
            self.handlers[number] = Some(handler);
        }
    }

    pub fn is_registered(&self, number: usize) -> bool {
        self.handlers.get(number).is_some_and(Option::is_some)
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}
