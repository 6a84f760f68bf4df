// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task table and process lifecycle (spawn/fork/exec/exit/waitpid)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: TaskTable, Task, TaskStatus, TrapEnv, Checkpoint, SpawnError, ExecError, WaitError
//! DEPENDS_ON: mm::MemorySet, sched::Scheduler, task::signal, fs::File, trap::TrapContext
//! INVARIANTS: Parents are referenced by pid only; a child's pid appears in exactly one
//!             `children` list; a zombie keeps its slot until its parent reaps it;
//!             a failed exec leaves the caller's address space untouched

extern crate alloc;

pub mod pid;
pub mod signal;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::config::{MAX_SYSCALL_NUM, TRAP_CONTEXT_BASE, USER_STACK_SIZE};
use crate::fs::{File, Stdin, Stdout};
use crate::mm::{copy_to_user, MapError, MemoryError, MemorySet, PhysPageNum, VirtAddr};
use crate::sched::Scheduler;
use crate::trap::TrapContext;

pub use crate::types::Pid;
pub use pid::PidAllocator;
pub use signal::{Delivery, SignalAction, SignalError, SignalFlags, SignalState};

/// Lifecycle state of a task. The discriminants are part of the `task_info` ABI.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready = 1,
    Running = 2,
    Zombie = 3,
}

/// Values every new trap context needs to get back into the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapEnv {
    pub kernel_satp: usize,
    pub kernel_sp: usize,
    pub trap_handler: usize,
}

#[must_use = "spawn errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// The parent does not exist or has already exited.
    NoSuchParent,
    /// No image at the requested path.
    NotFound,
    /// Building the address space failed.
    Memory(MemoryError),
}

#[must_use = "exec errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    /// No image at the requested path.
    NotFound,
    /// The new address space could not be built.
    Memory(MemoryError),
    /// Arguments do not fit in half of the user stack.
    ArgsTooLong,
    NoSuchTask,
}

/// Errors returned when waiting for child processes.
#[must_use = "wait errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// No child matches the request.
    NoChildren,
    /// A matching child exists but has not exited yet.
    StillRunning,
}

impl From<MemoryError> for SpawnError {
    fn from(value: MemoryError) -> Self {
        Self::Memory(value)
    }
}

impl From<MemoryError> for ExecError {
    fn from(value: MemoryError) -> Self {
        Self::Memory(value)
    }
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchParent => f.write_str("parent task does not exist"),
            Self::NotFound => f.write_str("image not found"),
            Self::Memory(err) => write!(f, "address space: {err}"),
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => f.write_str("image not found"),
            Self::Memory(err) => write!(f, "address space: {err}"),
            Self::ArgsTooLong => f.write_str("argument list too long"),
            Self::NoSuchTask => f.write_str("task does not exist"),
        }
    }
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChildren => f.write_str("no matching child"),
            Self::StillRunning => f.write_str("child has not exited"),
        }
    }
}

/// What the kernel must do with a task after running its signal checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// Resume user execution (possibly inside a freshly entered handler).
    Resume,
    /// A default action ends the task with this code.
    Terminate(i32),
    /// Stopped until SIGCONT or SIGKILL.
    Frozen,
}

/// Task control block.
pub struct Task {
    pid: Pid,
    status: TaskStatus,
    pub memory_set: MemorySet,
    trap_cx_ppn: PhysPageNum,
    exit_code: i32,
    parent: Option<Pid>,
    children: Vec<Pid>,
    pub signals: SignalState,
    pub fd_table: Vec<Option<Arc<dyn File>>>,
    syscall_times: Vec<u32>,
    first_run_ms: Option<usize>,
    heap_bottom: usize,
    program_brk: usize,
}

fn trap_cx_ppn_of(memory_set: &MemorySet) -> Result<PhysPageNum, MemoryError> {
    memory_set
        .translate(VirtAddr::from(TRAP_CONTEXT_BASE).floor())
        .map(|pte| pte.ppn())
        .ok_or(MemoryError::Map(MapError::NotMapped))
}

fn default_fd_table() -> Vec<Option<Arc<dyn File>>> {
    vec![Some(Arc::new(Stdin)), Some(Arc::new(Stdout)), Some(Arc::new(Stdout))]
}

impl Task {
    fn from_image(pid: Pid, parent: Option<Pid>, image: &[u8], env: TrapEnv) -> Result<Self, MemoryError> {
        let (memory_set, entry, user_sp) = MemorySet::from_elf(image)?;
        let trap_cx_ppn = trap_cx_ppn_of(&memory_set)?;
        let heap_bottom = memory_set.heap_bottom().unwrap_or_default();
        *trap_cx_ppn.get_mut::<TrapContext>() =
            TrapContext::app_init_context(entry, user_sp, env.kernel_satp, env.kernel_sp, env.trap_handler);
        Ok(Self {
            pid,
            status: TaskStatus::Ready,
            memory_set,
            trap_cx_ppn,
            exit_code: 0,
            parent,
            children: Vec::new(),
            signals: SignalState::new(),
            fd_table: default_fd_table(),
            syscall_times: vec![0; MAX_SYSCALL_NUM],
            first_run_ms: None,
            heap_bottom,
            program_brk: heap_bottom,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn is_zombie(&self) -> bool {
        self.status == TaskStatus::Zombie
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    pub fn syscall_times(&self) -> &[u32] {
        &self.syscall_times
    }

    pub fn first_run_ms(&self) -> Option<usize> {
        self.first_run_ms
    }

    pub fn heap_bottom(&self) -> usize {
        self.heap_bottom
    }

    pub fn program_brk(&self) -> usize {
        self.program_brk
    }

    pub fn token(&self) -> usize {
        self.memory_set.token()
    }

    fn trap_cx(&self) -> &'static mut TrapContext {
        self.trap_cx_ppn.get_mut()
    }

    /// Lowest free descriptor, growing the table if needed.
    pub fn alloc_fd(&mut self) -> usize {
        if let Some(fd) = self.fd_table.iter().position(Option::is_none) {
            fd
        } else {
            self.fd_table.push(None);
            self.fd_table.len() - 1
        }
    }

    pub fn file(&self, fd: usize) -> Option<Arc<dyn File>> {
        self.fd_table.get(fd).and_then(Clone::clone)
    }
}

/// Pid-indexed table of every task that exists, including zombies awaiting reaping.
pub struct TaskTable {
    slots: Vec<Option<Task>>,
    pids: PidAllocator,
    env: TrapEnv,
}

static_assertions::assert_impl_all!(TaskTable: Send);

impl TaskTable {
    pub fn new(env: TrapEnv) -> Self {
        Self { slots: Vec::new(), pids: PidAllocator::new(), env }
    }

    pub fn env(&self) -> TrapEnv {
        self.env
    }

    /// Number of tasks in the table, zombies included.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.slots.iter().flatten().map(|task| task.pid)
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.slots.get(pid.as_index()).and_then(Option::as_ref)
    }

    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.slots.get_mut(pid.as_index()).and_then(Option::as_mut)
    }

    /// True if `pid` exists and has not exited.
    pub fn is_alive(&self, pid: Pid) -> bool {
        self.task(pid).is_some_and(|task| !task.is_zombie())
    }

    /// Saved user context of a live task. Zombies have released theirs.
    pub fn trap_cx(&self, pid: Pid) -> Option<&TrapContext> {
        self.task(pid).filter(|task| !task.is_zombie()).map(|task| &*task.trap_cx())
    }

    pub fn trap_cx_mut(&mut self, pid: Pid) -> Option<&mut TrapContext> {
        self.task(pid).filter(|task| !task.is_zombie()).map(|task| task.trap_cx())
    }

    pub fn token(&self, pid: Pid) -> Option<usize> {
        self.task(pid).map(Task::token)
    }

    pub fn record_syscall(&mut self, pid: Pid, id: usize) {
        if let Some(count) = self.task_mut(pid).and_then(|task| task.syscall_times.get_mut(id)) {
            *count = count.saturating_add(1);
        }
    }

    /// Takes back a count for a call that will be retried.
    pub fn unrecord_syscall(&mut self, pid: Pid, id: usize) {
        if let Some(count) = self.task_mut(pid).and_then(|task| task.syscall_times.get_mut(id)) {
            *count = count.saturating_sub(1);
        }
    }

    /// Marks `pid` Running and stamps its first-run time.
    pub fn mark_running(&mut self, pid: Pid, now_ms: usize) {
        if let Some(task) = self.task_mut(pid) {
            task.status = TaskStatus::Running;
            task.first_run_ms.get_or_insert(now_ms);
        }
    }

    pub fn set_status(&mut self, pid: Pid, status: TaskStatus) {
        if let Some(task) = self.task_mut(pid) {
            if !task.is_zombie() {
                task.status = status;
            }
        }
    }

    fn insert(&mut self, task: Task) {
        let index = task.pid.as_index();
        if self.slots.len() <= index {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(task);
    }

    /// Creates the first user task. It always receives [`Pid::INIT`].
    pub fn spawn_init(&mut self, image: &[u8], scheduler: &mut Scheduler) -> Result<Pid, SpawnError> {
        let pid = self.pids.alloc();
        match Task::from_image(pid, None, image, self.env) {
            Ok(task) => {
                self.insert(task);
                scheduler.enqueue(pid);
                Ok(pid)
            }
            Err(err) => {
                self.pids.dealloc(pid);
                Err(err.into())
            }
        }
    }

    /// Creates a fresh child of `parent` running `image`.
    pub fn spawn(&mut self, parent: Pid, image: &[u8], scheduler: &mut Scheduler) -> Result<Pid, SpawnError> {
        if !self.is_alive(parent) {
            return Err(SpawnError::NoSuchParent);
        }
        let pid = self.pids.alloc();
        let task = match Task::from_image(pid, Some(parent), image, self.env) {
            Ok(task) => task,
            Err(err) => {
                self.pids.dealloc(pid);
                return Err(err.into());
            }
        };
        self.insert(task);
        if let Some(parent_task) = self.task_mut(parent) {
            parent_task.children.push(pid);
        }
        scheduler.enqueue(pid);
        ::log::debug!(target: "task", "spawn pid={} parent={}", pid, parent);
        Ok(pid)
    }

    /// Duplicates `parent`; the child sees 0 in `a0`.
    pub fn fork(&mut self, parent: Pid, scheduler: &mut Scheduler) -> Result<Pid, SpawnError> {
        let parent_task = self.task(parent).filter(|task| !task.is_zombie()).ok_or(SpawnError::NoSuchParent)?;
        let memory_set = MemorySet::from_existing_user(&parent_task.memory_set)?;
        let trap_cx_ppn = trap_cx_ppn_of(&memory_set)?;
        let signals = parent_task.signals.fork_copy();
        let fd_table = parent_task.fd_table.clone();
        let (heap_bottom, program_brk) = (parent_task.heap_bottom, parent_task.program_brk);
        let pid = self.pids.alloc();
        let child = Task {
            pid,
            status: TaskStatus::Ready,
            memory_set,
            trap_cx_ppn,
            exit_code: 0,
            parent: Some(parent),
            children: Vec::new(),
            signals,
            fd_table,
            syscall_times: vec![0; MAX_SYSCALL_NUM],
            first_run_ms: None,
            heap_bottom,
            program_brk,
        };
        child.trap_cx().x[10] = 0;
        self.insert(child);
        if let Some(parent_task) = self.task_mut(parent) {
            parent_task.children.push(pid);
        }
        scheduler.enqueue(pid);
        ::log::debug!(target: "task", "fork pid={} -> child={}", parent, pid);
        Ok(pid)
    }

    /// Replaces the image of `pid` and returns `argc`.
    ///
    /// The new stack holds the argument strings followed by a null-terminated
    /// argv array; `a0 = argc`, `a1 = argv`.
    pub fn exec(&mut self, pid: Pid, image: &[u8], args: &[String]) -> Result<usize, ExecError> {
        if !self.is_alive(pid) {
            return Err(ExecError::NoSuchTask);
        }
        let needed: usize = args.iter().map(|arg| arg.len() + 1).sum::<usize>() + (args.len() + 1) * 8 + 16;
        if needed > USER_STACK_SIZE / 2 {
            return Err(ExecError::ArgsTooLong);
        }
        let (memory_set, entry, user_sp) = MemorySet::from_elf(image)?;
        let trap_cx_ppn = trap_cx_ppn_of(&memory_set)?;
        let (argv_base, sp) = push_args(memory_set.token(), user_sp, args)?;

        let env = self.env;
        let Some(task) = self.task_mut(pid) else {
            return Err(ExecError::NoSuchTask);
        };
        task.heap_bottom = memory_set.heap_bottom().unwrap_or_default();
        task.program_brk = task.heap_bottom;
        task.memory_set = memory_set;
        task.trap_cx_ppn = trap_cx_ppn;
        task.signals.reset_for_exec();
        let cx = task.trap_cx();
        *cx = TrapContext::app_init_context(entry, sp, env.kernel_satp, env.kernel_sp, env.trap_handler);
        cx.x[10] = args.len();
        cx.x[11] = argv_base;
        ::log::debug!(target: "task", "exec pid={} argc={}", pid, args.len());
        Ok(args.len())
    }

    /// Turns `pid` into a zombie with `exit_code`.
    ///
    /// Children move to init, the parent gets SIGCHLD, and the address space
    /// keeps only its page-table root until the zombie is reaped.
    pub fn exit(&mut self, pid: Pid, exit_code: i32, scheduler: &mut Scheduler) {
        scheduler.purge(pid);
        let Some(task) = self.task_mut(pid) else {
            return;
        };
        if task.is_zombie() {
            return;
        }
        task.status = TaskStatus::Zombie;
        task.exit_code = exit_code;
        task.memory_set.recycle_data_pages();
        task.fd_table.clear();
        task.signals = SignalState::new();
        let parent = task.parent;
        let orphans = if pid == Pid::INIT { Vec::new() } else { core::mem::take(&mut task.children) };

        for &child in &orphans {
            if let Some(child_task) = self.task_mut(child) {
                child_task.parent = Some(Pid::INIT);
            }
        }
        if let Some(init) = self.task_mut(Pid::INIT) {
            init.children.extend_from_slice(&orphans);
        }
        if let Some(parent) = parent.filter(|&parent| self.is_alive(parent)) {
            let _ = self.raise(parent, signal::SIGCHLD);
        }
        ::log::debug!(
            target: "task",
            "exit pid={} code={} orphans={}",
            pid,
            exit_code,
            orphans.len()
        );
    }

    /// Finds an exited child of `parent` matching `target` (any child if `None`).
    pub fn find_zombie_child(&self, parent: Pid, target: Option<Pid>) -> Result<(Pid, i32), WaitError> {
        let parent_task = self.task(parent).ok_or(WaitError::NoChildren)?;
        let mut matching = parent_task
            .children
            .iter()
            .copied()
            .filter(|&child| target.map_or(true, |target| target == child))
            .peekable();
        if matching.peek().is_none() {
            return Err(WaitError::NoChildren);
        }
        matching
            .filter_map(|child| self.task(child))
            .find(|task| task.is_zombie())
            .map(|task| (task.pid, task.exit_code))
            .ok_or(WaitError::StillRunning)
    }

    /// Frees the slot and pid of zombie `child`. Returns its exit code.
    pub fn reap(&mut self, parent: Pid, child: Pid) -> Option<i32> {
        let task = self.task(child)?;
        if !task.is_zombie() || task.parent != Some(parent) {
            return None;
        }
        let exit_code = task.exit_code;
        self.slots[child.as_index()] = None;
        if let Some(parent_task) = self.task_mut(parent) {
            parent_task.children.retain(|&pid| pid != child);
        }
        self.pids.dealloc(child);
        ::log::debug!(target: "task", "reap pid={} by {} code={}", child, parent, exit_code);
        Some(exit_code)
    }

    /// Marks `signum` pending on `pid`. A missing or exited task is left alone.
    pub fn raise(&mut self, pid: Pid, signum: usize) -> Result<(), SignalError> {
        match self.task_mut(pid) {
            Some(task) if !task.is_zombie() => task.signals.raise(signum),
            _ => signal::SignalFlags::from_signum(signum).map(|_| ()).ok_or(SignalError::InvalidSignal),
        }
    }

    /// Leaves the running signal handler of `pid`; returns the restored `a0`.
    pub fn sigreturn(&mut self, pid: Pid) -> Result<usize, SignalError> {
        let task = self.task_mut(pid).filter(|task| !task.is_zombie()).ok_or(SignalError::NothingInFlight)?;
        let cx = task.trap_cx();
        task.signals.sigreturn(cx)
    }

    /// Applies pending signals to `pid` before it returns to user mode.
    pub fn signal_checkpoint(&mut self, pid: Pid) -> Checkpoint {
        let Some(task) = self.task_mut(pid).filter(|task| !task.is_zombie()) else {
            return Checkpoint::Resume;
        };
        match task.signals.next_delivery() {
            Delivery::None => Checkpoint::Resume,
            Delivery::Frozen => Checkpoint::Frozen,
            Delivery::Terminate(code) => Checkpoint::Terminate(code),
            Delivery::Handler { signum, action } => {
                let cx = task.trap_cx();
                task.signals.enter_handler(cx, signum, action);
                Checkpoint::Resume
            }
        }
    }

    /// Moves the program break of `pid` by `delta` bytes. Returns the old break.
    pub fn change_program_brk(&mut self, pid: Pid, delta: isize) -> Option<usize> {
        let task = self.task_mut(pid).filter(|task| !task.is_zombie())?;
        let old_brk = task.program_brk;
        let new_brk = old_brk.checked_add_signed(delta)?;
        let heap_len = new_brk.checked_sub(task.heap_bottom)?;
        let (bottom, new_end) = VirtAddr::user_range(task.heap_bottom, heap_len)?;
        let result = if delta < 0 {
            task.memory_set.shrink_to(bottom, new_end)
        } else {
            task.memory_set.append_to(bottom, new_end)
        };
        result.ok()?;
        task.program_brk = new_brk;
        Some(old_brk)
    }
}

/// Writes `args` below `user_sp`; returns `(argv base, final stack pointer)`.
fn push_args(token: usize, user_sp: usize, args: &[String]) -> Result<(usize, usize), ExecError> {
    let fault = ExecError::Memory(MemoryError::Map(MapError::NotMapped));
    let mut sp = user_sp;
    let mut argv = Vec::with_capacity(args.len() + 1);
    for arg in args {
        sp -= arg.len() + 1;
        copy_to_user(token, sp, arg.as_bytes()).ok_or(fault)?;
        copy_to_user(token, sp + arg.len(), &[0]).ok_or(fault)?;
        argv.push(sp);
    }
    argv.push(0);
    sp &= !(core::mem::size_of::<usize>() - 1);
    sp -= argv.len() * core::mem::size_of::<usize>();
    let argv_base = sp;
    for (i, ptr) in argv.iter().enumerate() {
        copy_to_user(token, argv_base + i * core::mem::size_of::<usize>(), &ptr.to_le_bytes()).ok_or(fault)?;
    }
    sp &= !0xf;
    Ok((argv_base, sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::sample_program;
    use crate::mm::{self, copy_from_user, frames_available};

    fn table() -> (TaskTable, Scheduler, Pid) {
        mm::init();
        let mut tasks = TaskTable::new(TrapEnv { kernel_satp: 5, kernel_sp: 0x9000, trap_handler: 0x42 });
        let mut scheduler = Scheduler::new();
        let init = tasks.spawn_init(&sample_program(b"init"), &mut scheduler).unwrap();
        (tasks, scheduler, init)
    }

    fn read_user(tasks: &TaskTable, pid: Pid, va: usize, len: usize) -> Vec<u8> {
        let mut out = vec![0; len];
        copy_from_user(tasks.token(pid).unwrap(), va, &mut out).unwrap();
        out
    }

    #[test]
    fn init_gets_pid_one_and_a_fresh_context() {
        let (tasks, scheduler, init) = table();
        assert_eq!(init, Pid::INIT);
        assert_eq!(scheduler.ready_len(), 1);
        let cx = tasks.trap_cx(init).unwrap();
        assert_eq!(cx.sepc, 0x10000);
        assert_eq!((cx.kernel_satp, cx.kernel_sp, cx.trap_handler), (5, 0x9000, 0x42));
        assert_eq!(tasks.task(init).unwrap().fd_table.len(), 3);
        assert_eq!(tasks.task(init).unwrap().status(), TaskStatus::Ready);
    }

    #[test]
    fn fork_links_child_and_zeroes_a0() {
        let (mut tasks, mut scheduler, init) = table();
        tasks.trap_cx_mut(init).unwrap().x[10] = 99;
        let child = tasks.fork(init, &mut scheduler).unwrap();
        assert_eq!(tasks.task(child).unwrap().parent(), Some(init));
        assert_eq!(tasks.task(init).unwrap().children(), &[child]);
        assert_eq!(tasks.trap_cx(child).unwrap().x[10], 0);
        assert_eq!(tasks.trap_cx(init).unwrap().x[10], 99);
        assert_ne!(tasks.token(child), tasks.token(init));
    }

    #[test]
    fn fork_copies_memory_not_aliases_it() {
        let (mut tasks, mut scheduler, init) = table();
        let child = tasks.fork(init, &mut scheduler).unwrap();
        copy_to_user(tasks.token(child).unwrap(), 0x11000, b"CHILD").unwrap();
        assert_eq!(read_user(&tasks, init, 0x11000, 4), b"init");
        assert_eq!(read_user(&tasks, child, 0x11000, 5), b"CHILD");
    }

    #[test]
    fn exit_reparents_children_to_init_and_signals_parent() {
        let (mut tasks, mut scheduler, init) = table();
        let middle = tasks.fork(init, &mut scheduler).unwrap();
        let leaf = tasks.fork(middle, &mut scheduler).unwrap();
        tasks.exit(middle, 3, &mut scheduler);

        assert_eq!(tasks.task(leaf).unwrap().parent(), Some(Pid::INIT));
        assert!(tasks.task(init).unwrap().children().contains(&leaf));
        assert!(tasks.task(middle).unwrap().children().is_empty());
        assert!(tasks.task(init).unwrap().signals.pending().contains(SignalFlags::SIGCHLD));
        assert!(tasks.trap_cx(middle).is_none());
        assert!(tasks.task(middle).unwrap().fd_table.is_empty());
    }

    #[test]
    fn zombie_is_reaped_exactly_once() {
        let (mut tasks, mut scheduler, init) = table();
        let child = tasks.fork(init, &mut scheduler).unwrap();
        assert_eq!(tasks.find_zombie_child(init, None), Err(WaitError::StillRunning));
        tasks.exit(child, 7, &mut scheduler);
        assert_eq!(tasks.find_zombie_child(init, Some(child)), Ok((child, 7)));
        assert_eq!(tasks.reap(init, child), Some(7));
        assert_eq!(tasks.reap(init, child), None);
        assert_eq!(tasks.find_zombie_child(init, None), Err(WaitError::NoChildren));
        assert!(tasks.task(child).is_none());
    }

    #[test]
    fn waiting_for_a_stranger_is_no_children() {
        let (mut tasks, mut scheduler, init) = table();
        let _child = tasks.fork(init, &mut scheduler).unwrap();
        assert_eq!(tasks.find_zombie_child(init, Some(Pid::from_raw(40))), Err(WaitError::NoChildren));
    }

    #[test]
    fn reaping_returns_every_frame() {
        let (mut tasks, mut scheduler, init) = table();
        let before = frames_available();
        let child = tasks.fork(init, &mut scheduler).unwrap();
        tasks.exit(child, 0, &mut scheduler);
        tasks.reap(init, child).unwrap();
        assert!(frames_available() >= before);
    }

    #[test]
    fn exec_pushes_arguments() {
        let (mut tasks, mut scheduler, init) = table();
        let child = tasks.fork(init, &mut scheduler).unwrap();
        let args = [String::from("prog"), String::from("-v")];
        let argc = tasks.exec(child, &sample_program(b"next"), &args).unwrap();
        assert_eq!(argc, 2);

        let cx = *tasks.trap_cx(child).unwrap();
        assert_eq!((cx.x[10], cx.sepc), (2, 0x10000));
        assert_eq!(cx.x[2] % 16, 0);
        assert!(cx.x[2] <= cx.x[11]);
        let argv = read_user(&tasks, child, cx.x[11], 24);
        let ptr = |i: usize| usize::from_le_bytes(argv[i * 8..i * 8 + 8].try_into().unwrap());
        assert_eq!(read_user(&tasks, child, ptr(0), 5), b"prog\0");
        assert_eq!(read_user(&tasks, child, ptr(1), 3), b"-v\0");
        assert_eq!(ptr(2), 0);
        assert_eq!(read_user(&tasks, child, 0x11000, 4), b"next");
    }

    #[test]
    fn failed_exec_keeps_the_old_image() {
        let (mut tasks, _scheduler, init) = table();
        let token = tasks.token(init).unwrap();
        let err = tasks.exec(init, b"not an elf", &[]).unwrap_err();
        assert!(matches!(err, ExecError::Memory(MemoryError::InvalidElf(_))));
        assert_eq!(tasks.token(init), Some(token));
        assert_eq!(read_user(&tasks, init, 0x11000, 4), b"init");
    }

    #[test]
    fn oversized_arguments_are_rejected() {
        let (mut tasks, _scheduler, init) = table();
        let args = vec![String::from("x").repeat(USER_STACK_SIZE)];
        assert_eq!(tasks.exec(init, &sample_program(b"next"), &args), Err(ExecError::ArgsTooLong));
    }

    #[test]
    fn exec_discards_in_flight_handler() {
        let (mut tasks, _scheduler, init) = table();
        {
            let task = tasks.task_mut(init).unwrap();
            task.signals
                .set_action(signal::SIGUSR1, SignalAction { handler: 0x10000, mask: SignalFlags::empty() })
                .unwrap();
            task.signals.raise(signal::SIGUSR1).unwrap();
        }
        assert_eq!(tasks.signal_checkpoint(init), Checkpoint::Resume);
        assert!(tasks.task(init).unwrap().signals.in_flight().is_some());
        tasks.exec(init, &sample_program(b"next"), &[]).unwrap();
        let signals = &tasks.task(init).unwrap().signals;
        assert!(signals.in_flight().is_none());
        assert!(signals.mask().is_empty());
        assert_ne!(signals.action(signal::SIGUSR1).unwrap().handler, 0);
    }

    #[test]
    fn checkpoint_enters_handler_in_user_context() {
        let (mut tasks, _scheduler, init) = table();
        tasks
            .task_mut(init)
            .unwrap()
            .signals
            .set_action(signal::SIGUSR2, SignalAction { handler: 0x10040, mask: SignalFlags::empty() })
            .unwrap();
        tasks.raise(init, signal::SIGUSR2).unwrap();
        assert_eq!(tasks.signal_checkpoint(init), Checkpoint::Resume);
        let cx = tasks.trap_cx(init).unwrap();
        assert_eq!((cx.sepc, cx.x[10]), (0x10040, signal::SIGUSR2));
    }

    #[test]
    fn program_break_grows_and_shrinks() {
        let (mut tasks, _scheduler, init) = table();
        let bottom = tasks.task(init).unwrap().heap_bottom();
        assert_eq!(tasks.change_program_brk(init, 0x2000), Some(bottom));
        copy_to_user(tasks.token(init).unwrap(), bottom + 0x1ff0, b"heap").unwrap();
        assert_eq!(tasks.change_program_brk(init, -0x1000), Some(bottom + 0x2000));
        assert_eq!(tasks.task(init).unwrap().program_brk(), bottom + 0x1000);
        assert_eq!(tasks.change_program_brk(init, -0x2000), None);
    }

    #[test]
    fn syscall_counters_ignore_out_of_range_ids() {
        let (mut tasks, _scheduler, init) = table();
        tasks.record_syscall(init, 64);
        tasks.record_syscall(init, 64);
        tasks.record_syscall(init, MAX_SYSCALL_NUM + 3);
        assert_eq!(tasks.task(init).unwrap().syscall_times()[64], 2);
    }
}
