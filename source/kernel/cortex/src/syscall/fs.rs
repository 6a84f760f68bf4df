// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! File descriptor syscalls.

extern crate alloc;

use alloc::sync::Arc;

use super::api::Context;
use super::{Args, Error, SysResult};
use crate::fs::{make_pipe, File, FileError, OpenFlags, UserBuffer};
use crate::mm::{translated_byte_buffer, translated_byte_buffer_mut};
use crate::task::signal::SIGPIPE;

fn file_for(ctx: &Context<'_>, fd: usize) -> SysResult<Arc<dyn File>> {
    ctx.task()?.file(fd).ok_or(Error::BadFd)
}

fn install(ctx: &mut Context<'_>, file: Arc<dyn File>) -> SysResult<usize> {
    let task = ctx.task_mut()?;
    let fd = task.alloc_fd();
    task.fd_table[fd] = Some(file);
    Ok(fd)
}

pub(super) fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (fd, ptr, len) = (args.get(0), args.get(1), args.get(2));
    let file = file_for(ctx, fd)?;
    if !file.writable() {
        return Err(Error::BadFd);
    }
    let buffers = translated_byte_buffer(ctx.token()?, ptr as *const u8, len).ok_or(Error::BadAddress)?;
    match file.write(UserBuffer::new(buffers)) {
        Ok(written) => Ok(written),
        Err(FileError::WouldBlock) => Err(Error::Reschedule),
        Err(FileError::BrokenPipe) => {
            ctx.tasks.raise(ctx.pid, SIGPIPE)?;
            Err(Error::BrokenPipe)
        }
    }
}

pub(super) fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (fd, ptr, len) = (args.get(0), args.get(1), args.get(2));
    let file = file_for(ctx, fd)?;
    if !file.readable() {
        return Err(Error::BadFd);
    }
    let buffers = translated_byte_buffer_mut(ctx.token()?, ptr as *mut u8, len).ok_or(Error::BadAddress)?;
    match file.read(UserBuffer::new(buffers)) {
        Ok(read) => Ok(read),
        Err(FileError::WouldBlock) => Err(Error::Reschedule),
        Err(FileError::BrokenPipe) => Err(Error::BrokenPipe),
    }
}

pub(super) fn sys_open(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let path = ctx.read_str(args.get(0))?;
    let flags = OpenFlags::from_bits_truncate(args.get(1) as u32);
    let file = ctx.fs.open(&path, flags).ok_or(Error::NotFound)?;
    install(ctx, file)
}

pub(super) fn sys_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let task = ctx.task_mut()?;
    let slot = task.fd_table.get_mut(args.get(0)).ok_or(Error::BadFd)?;
    slot.take().ok_or(Error::BadFd)?;
    Ok(0)
}

/// Writes `[read fd, write fd]` as two `usize`s at the user pointer.
pub(super) fn sys_pipe(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (read_end, write_end) = make_pipe();
    let read_fd = install(ctx, read_end)?;
    let write_fd = install(ctx, write_end)?;
    let mut raw = [0u8; 2 * core::mem::size_of::<usize>()];
    raw[..8].copy_from_slice(&read_fd.to_le_bytes());
    raw[8..].copy_from_slice(&write_fd.to_le_bytes());
    if let Err(err) = ctx.copy_out(args.get(0), &raw) {
        let task = ctx.task_mut()?;
        task.fd_table[read_fd] = None;
        task.fd_table[write_fd] = None;
        return Err(err);
    }
    Ok(0)
}

pub(super) fn sys_dup(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let file = file_for(ctx, args.get(0))?;
    install(ctx, file)
}
