//! CONTEXT: Signal delivery and pipes observed through the trap path
//! INTENT: Default actions, user handlers with sigreturn, masking and pipe end-of-stream rules
//! TESTS: Default terminate, single-flight handler, mask/unmask, SIGKILL, kill errors, pipe EOF and EPIPE
// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use cortex::harness::{reg, syscall, user_read, user_write};
use cortex::syscall::{
    SYSCALL_CLOSE, SYSCALL_KILL, SYSCALL_PIPE, SYSCALL_READ, SYSCALL_SIGACTION, SYSCALL_SIGPROCMASK,
    SYSCALL_SIGRETURN, SYSCALL_WRITE,
};
use cortex::task::signal::{SIGILL, SIGKILL, SIGTERM, SIGUSR1};
use cortex::task::{SignalAction, SignalFlags};
use cortex::trap::Exception;
use cortex::{Pid, Trap, TrapOutcome};
use cortex_e2e::{boot, fork, switch_to, wait, SCRATCH};

const ACTION: usize = 0x11300;
const HANDLER: usize = 0x10040;
const BUF: usize = 0x11400;

fn install_handler(kernel: &mut cortex::Kernel, signum: usize) {
    let action = SignalAction { handler: HANDLER, mask: SignalFlags::empty() };
    let pid = kernel.current_pid().unwrap();
    user_write(kernel, pid, ACTION, &action.to_user_bytes()).unwrap();
    let (ret, _) = syscall(kernel, SYSCALL_SIGACTION, [signum, ACTION, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
}

fn sepc(kernel: &cortex::Kernel, pid: Pid) -> usize {
    kernel.tasks().trap_cx(pid).unwrap().sepc
}

#[test]
fn default_action_terminates_the_target() {
    let mut kernel = boot();
    let child = fork(&mut kernel);
    let (ret, _) = syscall(&mut kernel, SYSCALL_KILL, [child.as_index(), SIGTERM, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));

    // The child is picked on the next yield and dies at its checkpoint.
    syscall(&mut kernel, cortex::syscall::SYSCALL_YIELD, [0; 6]);
    assert_eq!(wait(&mut kernel, child.as_index() as isize), (2, Some(-(SIGTERM as i32))));
}

#[test]
fn handler_runs_once_at_a_time() {
    let mut kernel = boot();
    install_handler(&mut kernel, SIGUSR1);

    // Delivery happens on the way out of the kill itself.
    let interrupted = sepc(&kernel, Pid::INIT) + 4;
    let (ret, _) = syscall(&mut kernel, SYSCALL_KILL, [1, SIGUSR1, 0, 0, 0, 0]);
    assert_eq!(ret, Some(SIGUSR1 as isize));
    assert_eq!(sepc(&kernel, Pid::INIT), HANDLER);

    // A second raise inside the handler waits.
    let (ret, _) = syscall(&mut kernel, SYSCALL_KILL, [1, SIGUSR1, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    assert_eq!(sepc(&kernel, Pid::INIT), HANDLER + 4);
    let signals = &kernel.tasks().task(Pid::INIT).unwrap().signals;
    assert!(signals.pending().contains(SignalFlags::SIGUSR1));

    // sigreturn restores the interrupted context, then the queued one is delivered.
    let (ret, _) = syscall(&mut kernel, SYSCALL_SIGRETURN, [0; 6]);
    assert_eq!(ret, Some(SIGUSR1 as isize));
    assert_eq!(sepc(&kernel, Pid::INIT), HANDLER);

    let (ret, _) = syscall(&mut kernel, SYSCALL_SIGRETURN, [0; 6]);
    assert_eq!(ret, Some(0));
    assert_eq!(sepc(&kernel, Pid::INIT), interrupted);
    assert!(kernel.tasks().task(Pid::INIT).unwrap().signals.in_flight().is_none());

    let (ret, _) = syscall(&mut kernel, SYSCALL_SIGRETURN, [0; 6]);
    assert_eq!(ret, Some(-22));
}

#[test]
fn caught_illegal_instruction_enters_the_handler() {
    let mut kernel = boot();
    install_handler(&mut kernel, SIGILL);
    let outcome = kernel.handle_trap(Trap::Exception(Exception::IllegalInstruction), 0);
    assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));
    assert_eq!(sepc(&kernel, Pid::INIT), HANDLER);
    assert_eq!(reg(&kernel, Pid::INIT, 10), Some(SIGILL));
}

#[test]
fn masked_signal_waits_for_unmask() {
    let mut kernel = boot();
    let mask = SignalFlags::SIGUSR1.bits() as usize;
    let (old, _) = syscall(&mut kernel, SYSCALL_SIGPROCMASK, [mask, 0, 0, 0, 0, 0]);
    assert_eq!(old, Some(0));

    let (ret, outcome) = syscall(&mut kernel, SYSCALL_KILL, [1, SIGUSR1, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));

    let (_, outcome) = syscall(&mut kernel, SYSCALL_SIGPROCMASK, [0; 6]);
    assert_eq!(outcome, TrapOutcome::Shutdown { exit_code: -(SIGUSR1 as i32) });
}

#[test]
fn sigkill_ignores_the_mask() {
    let mut kernel = boot();
    let (_, _) = syscall(&mut kernel, SYSCALL_SIGPROCMASK, [SignalFlags::SIGKILL.bits() as usize, 0, 0, 0, 0, 0]);
    let (ret, _) = syscall(&mut kernel, SYSCALL_SIGACTION, [SIGKILL, ACTION, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-22));
    let (_, outcome) = syscall(&mut kernel, SYSCALL_KILL, [1, SIGKILL, 0, 0, 0, 0]);
    assert_eq!(outcome, TrapOutcome::Shutdown { exit_code: -(SIGKILL as i32) });
}

#[test]
fn kill_rejects_bad_targets() {
    let mut kernel = boot();
    let (ret, _) = syscall(&mut kernel, SYSCALL_KILL, [0, SIGTERM, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-1));
    let (ret, _) = syscall(&mut kernel, SYSCALL_KILL, [42, SIGTERM, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-3));
    let (ret, _) = syscall(&mut kernel, SYSCALL_KILL, [1, 64, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-22));
}

fn open_pipe(kernel: &mut cortex::Kernel) -> (usize, usize) {
    let (ret, _) = syscall(kernel, SYSCALL_PIPE, [SCRATCH, 0, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    let raw = user_read(kernel, Pid::INIT, SCRATCH, 16).unwrap();
    let read_fd = usize::from_le_bytes(raw[..8].try_into().unwrap());
    let write_fd = usize::from_le_bytes(raw[8..].try_into().unwrap());
    (read_fd, write_fd)
}

#[test]
fn pipe_blocks_then_reports_end_of_stream() {
    let mut kernel = boot();
    let (read_fd, write_fd) = open_pipe(&mut kernel);
    assert_eq!((read_fd, write_fd), (3, 4));

    // Empty pipe with a live writer: the read is retried, not answered.
    let before = sepc(&kernel, Pid::INIT);
    let (ret, outcome) = syscall(&mut kernel, SYSCALL_READ, [read_fd, BUF, 8, 0, 0, 0]);
    assert_eq!(ret, Some(read_fd as isize));
    assert_eq!(sepc(&kernel, Pid::INIT), before);
    assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));
    let reads = |kernel: &cortex::Kernel| kernel.tasks().task(Pid::INIT).unwrap().syscall_times()[SYSCALL_READ];
    assert_eq!(reads(&kernel), 0);

    user_write(&kernel, Pid::INIT, BUF, b"hey").unwrap();
    let (ret, _) = syscall(&mut kernel, SYSCALL_WRITE, [write_fd, BUF, 3, 0, 0, 0]);
    assert_eq!(ret, Some(3));
    let (ret, _) = syscall(&mut kernel, SYSCALL_READ, [read_fd, BUF + 0x40, 8, 0, 0, 0]);
    assert_eq!(ret, Some(3));
    assert_eq!(user_read(&kernel, Pid::INIT, BUF + 0x40, 3).unwrap(), b"hey");
    assert_eq!(reads(&kernel), 1);

    let (ret, _) = syscall(&mut kernel, SYSCALL_CLOSE, [write_fd, 0, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    let (ret, _) = syscall(&mut kernel, SYSCALL_READ, [read_fd, BUF, 8, 0, 0, 0]);
    assert_eq!(ret, Some(0));
}

#[test]
fn writing_to_a_closed_pipe_raises_sigpipe() {
    let mut kernel = boot();
    let (read_fd, write_fd) = open_pipe(&mut kernel);
    syscall(&mut kernel, SYSCALL_CLOSE, [read_fd, 0, 0, 0, 0, 0]);
    let (_, outcome) = syscall(&mut kernel, SYSCALL_WRITE, [write_fd, BUF, 1, 0, 0, 0]);
    assert_eq!(outcome, TrapOutcome::Shutdown { exit_code: -13 });
}

#[test]
fn forked_child_shares_the_pipe() {
    let mut kernel = boot();
    let (read_fd, write_fd) = open_pipe(&mut kernel);
    let child = fork(&mut kernel);
    user_write(&kernel, Pid::INIT, BUF, b"ping").unwrap();
    let (ret, _) = syscall(&mut kernel, SYSCALL_WRITE, [write_fd, BUF, 4, 0, 0, 0]);
    assert_eq!(ret, Some(4));

    switch_to(&mut kernel, child);
    let (ret, _) = syscall(&mut kernel, SYSCALL_READ, [read_fd, BUF + 0x40, 4, 0, 0, 0]);
    assert_eq!(ret, Some(4));
    assert_eq!(user_read(&kernel, child, BUF + 0x40, 4).unwrap(), b"ping");
}
