// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handler context and registration
//! OWNERS: @kernel-team
//! PUBLIC API: Context, install_handlers()
//! DEPENDS_ON: task::TaskTable, sched::Scheduler, fs::FileSystem, mm user-copy helpers
//! INVARIANTS: Handlers touch user memory only through the caller's page table;
//!             a pointer that does not translate yields Error::BadAddress, never a kernel fault

extern crate alloc;

use alloc::string::String;

use super::{fs, process, signal};
use super::{
    Error, SysResult, SyscallTable, SYSCALL_CLOSE, SYSCALL_DUP, SYSCALL_EXEC, SYSCALL_EXIT, SYSCALL_FORK,
    SYSCALL_GETPID, SYSCALL_GET_TIME, SYSCALL_KILL, SYSCALL_MMAP, SYSCALL_MUNMAP, SYSCALL_OPEN, SYSCALL_PIPE,
    SYSCALL_READ, SYSCALL_SBRK, SYSCALL_SIGACTION, SYSCALL_SIGPROCMASK, SYSCALL_SIGRETURN, SYSCALL_SPAWN,
    SYSCALL_TASK_INFO, SYSCALL_WAITPID, SYSCALL_WRITE, SYSCALL_YIELD,
};
use crate::fs::FileSystem;
use crate::mm::{copy_from_user, copy_to_user, translated_str};
use crate::sched::Scheduler;
use crate::task::{Task, TaskTable};
use crate::types::Pid;

/// Execution context shared across syscalls: the caller plus the kernel state it may touch.
pub struct Context<'a> {
    pub pid: Pid,
    pub tasks: &'a mut TaskTable,
    pub scheduler: &'a mut Scheduler,
    pub fs: &'a dyn FileSystem,
}

impl<'a> Context<'a> {
    pub fn new(pid: Pid, tasks: &'a mut TaskTable, scheduler: &'a mut Scheduler, fs: &'a dyn FileSystem) -> Self {
        Self { pid, tasks, scheduler, fs }
    }

    pub fn task(&self) -> SysResult<&Task> {
        self.tasks.task(self.pid).ok_or(Error::NoSuchProcess)
    }

    pub fn task_mut(&mut self) -> SysResult<&mut Task> {
        self.tasks.task_mut(self.pid).ok_or(Error::NoSuchProcess)
    }

    /// Page-table token of the caller.
    pub fn token(&self) -> SysResult<usize> {
        self.tasks.token(self.pid).ok_or(Error::NoSuchProcess)
    }

    pub fn copy_out(&self, dst: usize, bytes: &[u8]) -> SysResult<()> {
        copy_to_user(self.token()?, dst, bytes).ok_or(Error::BadAddress)
    }

    pub fn copy_in(&self, src: usize, bytes: &mut [u8]) -> SysResult<()> {
        copy_from_user(self.token()?, src, bytes).ok_or(Error::BadAddress)
    }

    pub fn read_usize(&self, src: usize) -> SysResult<usize> {
        let mut raw = [0u8; core::mem::size_of::<usize>()];
        self.copy_in(src, &mut raw)?;
        Ok(usize::from_le_bytes(raw))
    }

    pub fn read_str(&self, ptr: usize) -> SysResult<String> {
        translated_str(self.token()?, ptr as *const u8).ok_or(Error::BadAddress)
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_DUP, fs::sys_dup);
    table.register(SYSCALL_OPEN, fs::sys_open);
    table.register(SYSCALL_CLOSE, fs::sys_close);
    table.register(SYSCALL_PIPE, fs::sys_pipe);
    table.register(SYSCALL_READ, fs::sys_read);
    table.register(SYSCALL_WRITE, fs::sys_write);
    table.register(SYSCALL_EXIT, process::sys_exit);
    table.register(SYSCALL_YIELD, process::sys_yield);
    table.register(SYSCALL_KILL, signal::sys_kill);
    table.register(SYSCALL_SIGACTION, signal::sys_sigaction);
    table.register(SYSCALL_SIGPROCMASK, signal::sys_sigprocmask);
    table.register(SYSCALL_SIGRETURN, signal::sys_sigreturn);
    table.register(SYSCALL_GET_TIME, process::sys_get_time);
    table.register(SYSCALL_GETPID, process::sys_getpid);
    table.register(SYSCALL_SBRK, process::sys_sbrk);
    table.register(SYSCALL_MUNMAP, process::sys_munmap);
    table.register(SYSCALL_FORK, process::sys_fork);
    table.register(SYSCALL_EXEC, process::sys_exec);
    table.register(SYSCALL_MMAP, process::sys_mmap);
    table.register(SYSCALL_WAITPID, process::sys_waitpid);
    table.register(SYSCALL_SPAWN, process::sys_spawn);
    table.register(SYSCALL_TASK_INFO, process::sys_task_info);
    ::log::debug!(target: "syscall", "handlers installed");
}
