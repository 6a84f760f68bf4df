// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process, time and memory syscalls.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::mem::{offset_of, size_of};

use super::api::Context;
use super::{Args, Error, SysResult};
use crate::config::MAX_SYSCALL_NUM;
use crate::task::{ExecError, SpawnError, TaskStatus, WaitError};
use crate::timer;
use crate::types::Pid;

/// Upper bound on argv entries accepted by exec.
const MAX_ARGS: usize = 64;

/// Layout of the record `task_info` copies out.
#[repr(C)]
pub struct TaskInfo {
    pub status: TaskStatus,
    pub syscall_times: [u32; MAX_SYSCALL_NUM],
    /// Milliseconds since the task first ran.
    pub time: usize,
}

/// `struct timeval` as user space sees it.
#[repr(C)]
pub struct TimeVal {
    pub sec: usize,
    pub usec: usize,
}

pub(super) fn sys_exit(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let code = args.get(0) as i32;
    ctx.tasks.exit(ctx.pid, code, ctx.scheduler);
    Err(Error::TaskExit)
}

pub(super) fn sys_yield(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.scheduler.request_resched();
    Ok(0)
}

pub(super) fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.pid.as_index())
}

pub(super) fn sys_fork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let child = ctx.tasks.fork(ctx.pid, ctx.scheduler)?;
    Ok(child.as_index())
}

/// Typed view of `exec(path, argv)`.
struct ExecArgsTyped {
    path_ptr: usize,
    argv_ptr: usize,
}

impl ExecArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { path_ptr: args.get(0), argv_ptr: args.get(1) }
    }
}

pub(super) fn sys_exec(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = ExecArgsTyped::decode(args);
    let path = ctx.read_str(typed.path_ptr)?;
    let mut argv = Vec::new();
    if typed.argv_ptr != 0 {
        loop {
            if argv.len() == MAX_ARGS {
                return Err(ExecError::ArgsTooLong.into());
            }
            let ptr = ctx.read_usize(typed.argv_ptr + argv.len() * size_of::<usize>())?;
            if ptr == 0 {
                break;
            }
            argv.push(ctx.read_str(ptr)?);
        }
    }
    let image = ctx.fs.load(&path).ok_or(ExecError::NotFound)?;
    Ok(ctx.tasks.exec(ctx.pid, &image, &argv)?)
}

pub(super) fn sys_spawn(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let path = ctx.read_str(args.get(0))?;
    let image = ctx.fs.load(&path).ok_or(SpawnError::NotFound)?;
    let child = ctx.tasks.spawn(ctx.pid, &image, ctx.scheduler)?;
    Ok(child.as_index())
}

/// Typed view of `waitpid(pid, *exit_code)`; `pid == -1` waits for any child.
struct WaitArgsTyped {
    target: Option<Pid>,
    status_ptr: usize,
}

impl WaitArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        let raw = args.get(0) as isize;
        let target = if raw == -1 {
            None
        } else {
            Some(Pid::from_user(args.get(0)).ok_or(WaitError::NoChildren)?)
        };
        Ok(Self { target, status_ptr: args.get(1) })
    }
}

pub(super) fn sys_waitpid(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = WaitArgsTyped::decode(args)?;
    let (child, exit_code) = ctx.tasks.find_zombie_child(ctx.pid, typed.target)?;
    if typed.status_ptr != 0 {
        ctx.copy_out(typed.status_ptr, &exit_code.to_le_bytes())?;
    }
    ctx.tasks.reap(ctx.pid, child);
    Ok(child.as_index())
}

pub(super) fn sys_get_time(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let us = timer::get_time_us();
    let mut raw = [0u8; size_of::<TimeVal>()];
    raw[offset_of!(TimeVal, sec)..][..size_of::<usize>()].copy_from_slice(&(us / 1_000_000).to_le_bytes());
    raw[offset_of!(TimeVal, usec)..][..size_of::<usize>()].copy_from_slice(&(us % 1_000_000).to_le_bytes());
    ctx.copy_out(args.get(0), &raw)?;
    Ok(0)
}

pub(super) fn sys_task_info(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let task = ctx.task()?;
    let mut raw = vec![0u8; size_of::<TaskInfo>()];
    let status = offset_of!(TaskInfo, status);
    raw[status..status + 4].copy_from_slice(&(task.status() as u32).to_le_bytes());
    let times = offset_of!(TaskInfo, syscall_times);
    for (i, count) in task.syscall_times().iter().enumerate() {
        let at = times + i * size_of::<u32>();
        raw[at..at + 4].copy_from_slice(&count.to_le_bytes());
    }
    let elapsed = task.first_run_ms().map_or(0, |start| timer::get_time_ms().saturating_sub(start));
    let time = offset_of!(TaskInfo, time);
    raw[time..time + size_of::<usize>()].copy_from_slice(&elapsed.to_le_bytes());
    ctx.copy_out(args.get(0), &raw)?;
    Ok(0)
}

/// Returns the old break, or -1 if the break cannot move.
pub(super) fn sys_sbrk(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let delta = args.get(0) as isize;
    Ok(ctx.tasks.change_program_brk(ctx.pid, delta).unwrap_or(usize::MAX))
}

pub(super) fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (start, len, prot) = (args.get(0), args.get(1), args.get(2));
    ctx.task_mut()?.memory_set.mmap(start, len, prot)?;
    Ok(0)
}

pub(super) fn sys_munmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.task_mut()?.memory_set.munmap(args.get(0), args.get(1))?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::sample_program;
    use crate::syscall::api::tests::Fixture;
    use crate::syscall::{
        SYSCALL_EXEC, SYSCALL_EXIT, SYSCALL_FORK, SYSCALL_GETPID, SYSCALL_GET_TIME, SYSCALL_MMAP, SYSCALL_MUNMAP,
        SYSCALL_SBRK, SYSCALL_SPAWN, SYSCALL_TASK_INFO, SYSCALL_WAITPID, SYSCALL_YIELD,
    };
    use crate::task::{ExecError, SpawnError};

    const SCRATCH: usize = 0x11080;

    #[test]
    fn getpid_and_yield() {
        let mut fx = Fixture::new(&[]);
        assert_eq!(fx.call(SYSCALL_GETPID, [0; 6]), Ok(1));
        assert_eq!(fx.call(SYSCALL_YIELD, [0; 6]), Ok(0));
        assert!(fx.scheduler.take_resched());
    }

    #[test]
    fn waitpid_writes_status_then_reaps() {
        let mut fx = Fixture::new(&[]);
        let child = Pid::from_raw(fx.call(SYSCALL_FORK, [0; 6]).unwrap() as u32);
        assert_eq!(fx.call(SYSCALL_WAITPID, [usize::MAX, SCRATCH, 0, 0, 0, 0]), Err(Error::Wait(WaitError::StillRunning)));
        assert_eq!(fx.call_as(child, SYSCALL_EXIT, [7, 0, 0, 0, 0, 0]), Err(Error::TaskExit));
        assert_eq!(fx.call(SYSCALL_WAITPID, [child.as_index(), SCRATCH, 0, 0, 0, 0]), Ok(child.as_index()));
        let mut raw = [0u8; 4];
        fx.ctx().copy_in(SCRATCH, &mut raw).unwrap();
        assert_eq!(i32::from_le_bytes(raw), 7);
        assert_eq!(fx.call(SYSCALL_WAITPID, [usize::MAX, 0, 0, 0, 0, 0]), Err(Error::Wait(WaitError::NoChildren)));
    }

    #[test]
    fn waitpid_with_bad_pointer_keeps_the_zombie() {
        let mut fx = Fixture::new(&[]);
        let child = Pid::from_raw(fx.call(SYSCALL_FORK, [0; 6]).unwrap() as u32);
        let _ = fx.call_as(child, SYSCALL_EXIT, [3, 0, 0, 0, 0, 0]);
        assert_eq!(fx.call(SYSCALL_WAITPID, [usize::MAX, 0x10000, 0, 0, 0, 0]), Err(Error::BadAddress));
        assert_eq!(fx.call(SYSCALL_WAITPID, [usize::MAX, 0, 0, 0, 0, 0]), Ok(child.as_index()));
    }

    #[test]
    fn exec_missing_path_is_not_found() {
        let mut fx = Fixture::new(&[]);
        fx.ctx().copy_out(SCRATCH, b"/nope\0").unwrap();
        assert_eq!(fx.call(SYSCALL_EXEC, [SCRATCH, 0, 0, 0, 0, 0]), Err(Error::Exec(ExecError::NotFound)));
        assert_eq!(fx.call(SYSCALL_SPAWN, [SCRATCH, 0, 0, 0, 0, 0]), Err(Error::Spawn(SpawnError::NotFound)));
    }

    #[test]
    fn exec_reads_argv_from_user_memory() {
        let image = sample_program(b"prog");
        let mut fx = Fixture::new(&[("prog", image.as_slice())]);
        {
            let ctx = fx.ctx();
            ctx.copy_out(SCRATCH, b"prog\0arg\0").unwrap();
            let argv = [SCRATCH, SCRATCH + 5, 0];
            for (i, ptr) in argv.iter().enumerate() {
                ctx.copy_out(0x11100 + i * 8, &ptr.to_le_bytes()).unwrap();
            }
        }
        assert_eq!(fx.call(SYSCALL_EXEC, [SCRATCH, 0x11100, 0, 0, 0, 0]), Ok(2));
        assert_eq!(fx.tasks.trap_cx(fx.pid).unwrap().x[10], 2);
    }

    #[test]
    fn spawn_creates_a_child() {
        let image = sample_program(b"kid");
        let mut fx = Fixture::new(&[("kid", image.as_slice())]);
        fx.ctx().copy_out(SCRATCH, b"kid\0").unwrap();
        let child = fx.call(SYSCALL_SPAWN, [SCRATCH, 0, 0, 0, 0, 0]).unwrap();
        let child = Pid::from_raw(child as u32);
        assert_eq!(fx.tasks.task(child).unwrap().parent(), Some(fx.pid));
        assert_eq!(fx.tasks.trap_cx(child).unwrap().sepc, 0x10000);
    }

    #[test]
    fn sbrk_reports_old_break_or_minus_one() {
        let mut fx = Fixture::new(&[]);
        let bottom = fx.tasks.task(fx.pid).unwrap().heap_bottom();
        assert_eq!(fx.call(SYSCALL_SBRK, [0x1000, 0, 0, 0, 0, 0]), Ok(bottom));
        assert_eq!(fx.call(SYSCALL_SBRK, [0, 0, 0, 0, 0, 0]), Ok(bottom + 0x1000));
        assert_eq!(fx.call(SYSCALL_SBRK, [(-0x2000isize) as usize, 0, 0, 0, 0, 0]), Ok(usize::MAX));
    }

    #[test]
    fn mmap_and_munmap() {
        let mut fx = Fixture::new(&[]);
        assert_eq!(fx.call(SYSCALL_MMAP, [0x1000_0000, 0x2000, 0b011, 0, 0, 0]), Ok(0));
        fx.ctx().copy_out(0x1000_1ff0, b"mapped").unwrap();
        assert!(fx.call(SYSCALL_MMAP, [0x1000_1000, 0x1000, 0b011, 0, 0, 0]).is_err());
        assert!(fx.call(SYSCALL_MMAP, [0x2000_0000, 0x1000, 0, 0, 0, 0]).is_err());
        assert!(fx.call(SYSCALL_MUNMAP, [0x1000_0000, 0x1000, 0, 0, 0, 0]).is_err());
        assert_eq!(fx.call(SYSCALL_MUNMAP, [0x1000_0000, 0x2000, 0, 0, 0, 0]), Ok(0));
        assert_eq!(fx.ctx().copy_out(0x1000_0000, b"x"), Err(Error::BadAddress));
    }

    #[test]
    fn get_time_fills_a_timeval() {
        let mut fx = Fixture::new(&[]);
        assert_eq!(fx.call(SYSCALL_GET_TIME, [SCRATCH, 0, 0, 0, 0, 0]), Ok(0));
        let mut raw = [0u8; 16];
        fx.ctx().copy_in(SCRATCH, &mut raw).unwrap();
        let usec = usize::from_le_bytes(raw[8..].try_into().unwrap());
        assert!(usec < 1_000_000);
        assert_eq!(fx.call(SYSCALL_GET_TIME, [0x10000, 0, 0, 0, 0, 0]), Err(Error::BadAddress));
    }

    #[test]
    fn task_info_reports_counters() {
        let mut fx = Fixture::new(&[]);
        fx.tasks.mark_running(fx.pid, timer::get_time_ms());
        fx.tasks.record_syscall(fx.pid, SYSCALL_GETPID);
        fx.tasks.record_syscall(fx.pid, SYSCALL_TASK_INFO);
        let heap = fx.tasks.task(fx.pid).unwrap().heap_bottom();
        assert_eq!(fx.call(SYSCALL_TASK_INFO, [heap, 0, 0, 0, 0, 0]), Err(Error::BadAddress));
        fx.call(SYSCALL_SBRK, [size_of::<TaskInfo>(), 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(fx.call(SYSCALL_TASK_INFO, [heap, 0, 0, 0, 0, 0]), Ok(0));

        let mut raw = vec![0u8; size_of::<TaskInfo>()];
        fx.ctx().copy_in(heap, &mut raw).unwrap();
        assert_eq!(u32::from_le_bytes(raw[0..4].try_into().unwrap()), TaskStatus::Running as u32);
        let at = offset_of!(TaskInfo, syscall_times) + SYSCALL_GETPID * 4;
        assert_eq!(u32::from_le_bytes(raw[at..at + 4].try_into().unwrap()), 1);
    }
}
