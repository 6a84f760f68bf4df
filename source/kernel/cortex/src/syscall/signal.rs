// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Signal syscalls: kill, sigaction, sigprocmask, sigreturn.

use super::api::Context;
use super::{Args, Error, SysResult};
use crate::task::signal::{SignalAction, SignalError, SignalFlags};
use crate::types::Pid;

pub(super) fn sys_kill(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let target = Pid::from_user(args.get(0)).ok_or(Error::NoSuchProcess)?;
    if target == Pid::KERNEL {
        return Err(Error::PermissionDenied);
    }
    if !ctx.tasks.is_alive(target) {
        return Err(Error::NoSuchProcess);
    }
    ctx.tasks.raise(target, args.get(1))?;
    Ok(0)
}

/// `sigaction(signum, *new, *old)`; either pointer may be null.
pub(super) fn sys_sigaction(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let (signum, new_ptr, old_ptr) = (args.get(0), args.get(1), args.get(2));
    let sig = SignalFlags::from_signum(signum).ok_or(SignalError::InvalidSignal)?;
    let new = if new_ptr != 0 {
        if sig.intersects(SignalFlags::UNCATCHABLE) {
            return Err(SignalError::Uncatchable.into());
        }
        let mut raw = [0u8; SignalAction::USER_SIZE];
        ctx.copy_in(new_ptr, &mut raw)?;
        Some(SignalAction::from_user_bytes(&raw))
    } else {
        None
    };
    let old = ctx.task()?.signals.action(signum)?;
    if old_ptr != 0 {
        ctx.copy_out(old_ptr, &old.to_user_bytes())?;
    }
    if let Some(new) = new {
        ctx.task_mut()?.signals.set_action(signum, new)?;
    }
    Ok(0)
}

/// Replaces the blocked set; returns the previous one.
pub(super) fn sys_sigprocmask(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let mask = SignalFlags::from_bits_truncate(args.get(0) as u32);
    let old = ctx.task_mut()?.signals.set_mask(mask);
    Ok(old.bits() as usize)
}

pub(super) fn sys_sigreturn(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.tasks.sigreturn(ctx.pid)?)
}
