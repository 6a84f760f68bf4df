// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The single kernel value and the trap exit path
//! OWNERS: @kernel-team
//! STATUS: Functional
//! PUBLIC API: Kernel (boot/handle_trap/resume), BootConfig, BootError
//! DEPENDS_ON: task::TaskTable, sched::Scheduler, syscall::SyscallTable, fs::FileSystem, mm::MemorySet
//! INVARIANTS: Every trap runs to completion before the next task is chosen; the signal
//!             checkpoint runs on every task right before it returns to U-mode;
//!             the system shuts down once init is a zombie

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use crate::diag;
use crate::fs::FileSystem;
use crate::mm::{self, MemoryError, MemorySet};
use crate::sched::Scheduler;
use crate::syscall::{api, SyscallTable};
use crate::task::{Checkpoint, SpawnError, TaskStatus, TaskTable, TrapEnv};
use crate::timer;
use crate::trap::{self, Trap, TrapOutcome};
use crate::types::Pid;

/// Addresses the trampoline needs to re-enter the kernel from U-mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootConfig {
    /// Top of the stack `__alltraps` switches to.
    pub kernel_sp: usize,
    /// Address of the Rust trap entry.
    pub trap_handler: usize,
}

#[must_use = "boot errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// Building or activating the kernel space failed.
    Memory(MemoryError),
    /// The file system holds no image under the init path.
    InitNotFound,
    Spawn(SpawnError),
}

impl From<MemoryError> for BootError {
    fn from(value: MemoryError) -> Self {
        Self::Memory(value)
    }
}

impl From<SpawnError> for BootError {
    fn from(value: SpawnError) -> Self {
        Self::Spawn(value)
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(err) => write!(f, "kernel space: {err}"),
            Self::InitNotFound => f.write_str("init image not found"),
            Self::Spawn(err) => write!(f, "spawning init: {err}"),
        }
    }
}

/// All kernel state. Created once at boot and driven one trap at a time.
pub struct Kernel {
    pub(crate) tasks: TaskTable,
    pub(crate) scheduler: Scheduler,
    pub(crate) syscalls: SyscallTable,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) kernel_space: MemorySet,
}

static_assertions::assert_impl_all!(Kernel: Send);

impl Kernel {
    /// Brings up memory management, builds the kernel space and loads `init` from `fs`.
    ///
    /// The returned kernel has init queued but not yet running; call [`Kernel::resume`]
    /// to pick it.
    pub fn boot(fs: Arc<dyn FileSystem>, init: &str, config: BootConfig) -> Result<Self, BootError> {
        diag::log::init();
        mm::init();
        let kernel_space = MemorySet::new_kernel()?;
        kernel_space.activate();
        let env = TrapEnv {
            kernel_satp: kernel_space.token(),
            kernel_sp: config.kernel_sp,
            trap_handler: config.trap_handler,
        };

        let mut syscalls = SyscallTable::new();
        api::install_handlers(&mut syscalls);

        let image = fs.load(init).ok_or(BootError::InitNotFound)?;
        let mut tasks = TaskTable::new(env);
        let mut scheduler = Scheduler::new();
        let pid = tasks.spawn_init(&image, &mut scheduler)?;
        ::log::info!(target: "kernel", "boot: init '{}' is pid {}, {} frames free", init, pid, mm::frames_available());

        Ok(Self { tasks, scheduler, syscalls, fs, kernel_space })
    }

    /// Handles one trap from the current task and decides what runs next.
    pub fn handle_trap(&mut self, trap: Trap, stval: usize) -> TrapOutcome {
        trap::handle(self, trap, stval);
        self.resume()
    }

    /// Picks the task to return to, running its signal checkpoint first.
    /// The caller switches to the returned `satp` on the way out.
    ///
    /// A pending reschedule rotates the current task to the back of the queue.
    /// Stopped tasks are skipped; when every runnable task is stopped the
    /// kernel reports [`TrapOutcome::Idle`].
    pub fn resume(&mut self) -> TrapOutcome {
        if let Some(outcome) = self.shutdown() {
            return outcome;
        }
        if self.scheduler.take_resched() {
            if let Some(pid) = self.scheduler.current() {
                self.tasks.set_status(pid, TaskStatus::Ready);
                self.scheduler.yield_current();
            }
        }

        let mut frozen_streak = 0;
        loop {
            let pid = match self.scheduler.current() {
                Some(pid) => pid,
                None => match self.scheduler.schedule_next() {
                    Some(pid) => {
                        self.tasks.mark_running(pid, timer::get_time_ms());
                        pid
                    }
                    None => return TrapOutcome::Idle,
                },
            };

            match self.tasks.signal_checkpoint(pid) {
                Checkpoint::Resume => {
                    let Some(satp) = self.tasks.token(pid) else {
                        self.scheduler.purge(pid);
                        continue;
                    };
                    return TrapOutcome::Resume { pid, satp };
                }
                Checkpoint::Terminate(code) => {
                    ::log::debug!(target: "kernel", "pid {} terminated by signal, code {}", pid, code);
                    self.exit_task(pid, code);
                    if let Some(outcome) = self.shutdown() {
                        return outcome;
                    }
                }
                Checkpoint::Frozen => {
                    self.tasks.set_status(pid, TaskStatus::Ready);
                    self.scheduler.yield_current();
                    frozen_streak += 1;
                    if frozen_streak > self.scheduler.ready_len() {
                        return TrapOutcome::Idle;
                    }
                }
            }
        }
    }

    /// Task that owns the hart, if any.
    pub fn current_pid(&self) -> Option<Pid> {
        self.scheduler.current()
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn tasks_mut(&mut self) -> &mut TaskTable {
        &mut self.tasks
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// satp value of the kernel address space.
    pub fn kernel_token(&self) -> usize {
        self.kernel_space.token()
    }

    pub(crate) fn exit_task(&mut self, pid: Pid, exit_code: i32) {
        self.tasks.exit(pid, exit_code, &mut self.scheduler);
    }

    fn shutdown(&self) -> Option<TrapOutcome> {
        self.tasks
            .task(Pid::INIT)
            .filter(|init| init.is_zombie())
            .map(|init| TrapOutcome::Shutdown { exit_code: init.exit_code() })
    }
}
