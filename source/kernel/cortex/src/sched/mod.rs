// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: FIFO ready queue for the single-hart kernel
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (enqueue/schedule_next/yield_current/finish_current/purge/request_resched)
//! DEPENDS_ON: types::Pid
//! INVARIANTS: A pid is either current or queued, never both; each pid is queued at most once

extern crate alloc;

use alloc::collections::VecDeque;

use crate::types::Pid;

/// Round-robin scheduler: one FIFO queue plus the task that currently owns the hart.
///
/// Tasks leave the queue only through [`Scheduler::schedule_next`] or
/// [`Scheduler::purge`]; the kernel decides when a task is runnable.
#[derive(Debug, Default)]
pub struct Scheduler {
    ready: VecDeque<Pid>,
    current: Option<Pid>,
    need_resched: bool,
}

static_assertions::assert_impl_all!(Scheduler: Send);

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `pid` to the back of the ready queue. Queuing a task twice is a no-op.
    pub fn enqueue(&mut self, pid: Pid) {
        if self.current == Some(pid) || self.ready.contains(&pid) {
            log::trace!(target: "sched", "enqueue: pid={} already runnable", pid);
            return;
        }
        self.ready.push_back(pid);
    }

    /// Pops the front of the queue and makes it current.
    pub fn schedule_next(&mut self) -> Option<Pid> {
        self.need_resched = false;
        self.current = self.ready.pop_front();
        if let Some(pid) = self.current {
            log::trace!(target: "sched", "picked pid={} ready={}", pid, self.ready.len());
        }
        self.current
    }

    /// Re-enqueue the currently running task (call on timeslice/yield).
    pub fn yield_current(&mut self) {
        if let Some(pid) = self.current.take() {
            self.ready.push_back(pid);
        }
    }

    /// Marks the current task as finished without re-enqueuing it.
    pub fn finish_current(&mut self) {
        self.current = None;
    }

    /// Removes all queued references to `pid` and clears it if currently running.
    pub fn purge(&mut self, pid: Pid) {
        self.ready.retain(|queued| *queued != pid);
        if self.current == Some(pid) {
            self.current = None;
        }
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Asks the kernel to rotate the current task before resuming anything.
    pub fn request_resched(&mut self) {
        self.need_resched = true;
    }

    /// Returns and clears the pending reschedule request.
    pub fn take_resched(&mut self) -> bool {
        core::mem::take(&mut self.need_resched)
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.ready.is_empty()
    }
}
