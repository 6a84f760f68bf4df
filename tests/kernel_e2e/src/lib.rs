// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Scenario helpers shared by the kernel end-to-end tests.
//!
//! Every helper acts on behalf of the task that currently owns the hart, the
//! same way a user program would by trapping into the kernel.

use cortex::harness::{boot_with, sample_program, syscall, user_write};
use cortex::syscall::{SYSCALL_FORK, SYSCALL_WAITPID, SYSCALL_YIELD};
use cortex::{Kernel, Pid};

/// Free bytes in the data page of every sample program.
pub const SCRATCH: usize = 0x11100;

/// Images available to exec/spawn: `init` plus two payloads.
pub fn programs() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("init", sample_program(b"init")),
        ("child", sample_program(b"child")),
        ("worker", sample_program(b"worker")),
    ]
}

/// Boots with [`programs`] and init running.
pub fn boot() -> Kernel {
    boot_with(&programs(), "init").expect("boot")
}

pub fn current(kernel: &Kernel) -> Pid {
    kernel.current_pid().expect("a task owns the hart")
}

/// Yields until `pid` runs. Panics if it never gets the hart.
pub fn switch_to(kernel: &mut Kernel, pid: Pid) {
    for _ in 0..32 {
        if kernel.current_pid() == Some(pid) {
            return;
        }
        syscall(kernel, SYSCALL_YIELD, [0; 6]);
    }
    panic!("pid {pid} never scheduled");
}

/// Writes `s` NUL-terminated into the current task at `va`.
pub fn put_str(kernel: &Kernel, va: usize, s: &str) {
    let pid = current(kernel);
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    user_write(kernel, pid, va, &bytes).expect("user write");
}

/// Writes `words` as little-endian `usize`s into the current task at `va`.
pub fn put_words(kernel: &Kernel, va: usize, words: &[usize]) {
    let pid = current(kernel);
    let bytes: Vec<u8> = words.iter().flat_map(|word| word.to_le_bytes()).collect();
    user_write(kernel, pid, va, &bytes).expect("user write");
}

/// Forks the current task and returns the child pid.
pub fn fork(kernel: &mut Kernel) -> Pid {
    let (ret, _) = syscall(kernel, SYSCALL_FORK, [0; 6]);
    let raw = ret.expect("parent still alive");
    assert!(raw > 0, "fork failed with {raw}");
    Pid::from_raw(raw as u32)
}

/// `waitpid(target, SCRATCH)` from the current task: the raw return and,
/// on success, the exit code read back from user memory.
pub fn wait(kernel: &mut Kernel, target: isize) -> (isize, Option<i32>) {
    let pid = current(kernel);
    let (ret, _) = syscall(kernel, SYSCALL_WAITPID, [target as usize, SCRATCH, 0, 0, 0, 0]);
    let ret = ret.expect("waiter still alive");
    let code = (ret > 0).then(|| {
        let raw = cortex::harness::user_read(kernel, pid, SCRATCH, 4).expect("status");
        i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    });
    (ret, code)
}
