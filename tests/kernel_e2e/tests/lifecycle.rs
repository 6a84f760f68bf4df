//! CONTEXT: Process lifecycle driven through the trap path
//! INTENT: fork/exec/exit/waitpid, re-parenting, faults and preemption as user space sees them
//! TESTS: end-to-end reap, orphan adoption, page-fault kill, timer rotation, argv, heap and mmap
// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

use cortex::harness::{reg, syscall, user_read, user_write};
use cortex::syscall::{
    SYSCALL_EXEC, SYSCALL_EXIT, SYSCALL_GETPID, SYSCALL_GET_TIME, SYSCALL_MMAP, SYSCALL_MUNMAP, SYSCALL_READ,
    SYSCALL_SBRK, SYSCALL_SPAWN, SYSCALL_WRITE,
};
use cortex::trap::{Exception, Interrupt};
use cortex::{Pid, Trap, TrapOutcome};
use cortex_e2e::{boot, current, fork, put_str, put_words, switch_to, wait, SCRATCH};

const PATH: usize = 0x11200;

#[test]
fn fork_exec_exit_then_reap_once() {
    let mut kernel = boot();
    let child = fork(&mut kernel);
    assert_eq!(child, Pid::from_raw(2));
    assert_eq!(reg(&kernel, child, 10), Some(0));
    assert_eq!(wait(&mut kernel, 2), (-11, None));

    switch_to(&mut kernel, child);
    put_str(&kernel, PATH, "child");
    let (ret, _) = syscall(&mut kernel, SYSCALL_EXEC, [PATH, 0, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    assert_eq!(user_read(&kernel, child, 0x10000, 5).unwrap(), b"child");

    let (ret, outcome) = syscall(&mut kernel, SYSCALL_EXIT, [7, 0, 0, 0, 0, 0]);
    assert_eq!(ret, None);
    assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));

    assert_eq!(wait(&mut kernel, 2), (2, Some(7)));
    assert_eq!(wait(&mut kernel, 2), (-10, None));
    assert!(kernel.tasks().task(child).is_none());
}

#[test]
fn orphans_move_to_init() {
    let mut kernel = boot();
    let parent = fork(&mut kernel);
    switch_to(&mut kernel, parent);
    let grandchild = fork(&mut kernel);
    syscall(&mut kernel, SYSCALL_EXIT, [0; 6]);

    let adopted = kernel.tasks().task(grandchild).unwrap();
    assert_eq!(adopted.parent(), Some(Pid::INIT));
    assert!(kernel.tasks().task(Pid::INIT).unwrap().children().contains(&grandchild));

    assert_eq!(current(&kernel), Pid::INIT);
    assert_eq!(wait(&mut kernel, parent.as_index() as isize), (parent.as_index() as isize, Some(0)));
    switch_to(&mut kernel, grandchild);
    syscall(&mut kernel, SYSCALL_EXIT, [5, 0, 0, 0, 0, 0]);
    assert_eq!(wait(&mut kernel, -1), (grandchild.as_index() as isize, Some(5)));
    assert_eq!(wait(&mut kernel, -1), (-10, None));
}

#[test]
fn page_fault_kills_only_the_faulting_task() {
    let mut kernel = boot();
    let child = fork(&mut kernel);
    switch_to(&mut kernel, child);
    let outcome = kernel.handle_trap(Trap::Exception(Exception::StorePageFault), 0x4000_0000);
    assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));
    assert_eq!(wait(&mut kernel, -1), (2, Some(-11)));
}

#[test]
fn illegal_instruction_without_handler_terminates() {
    let mut kernel = boot();
    let child = fork(&mut kernel);
    switch_to(&mut kernel, child);
    kernel.handle_trap(Trap::Exception(Exception::IllegalInstruction), 0);
    assert_eq!(current(&kernel), Pid::INIT);
    assert_eq!(wait(&mut kernel, -1), (2, Some(-4)));
}

#[test]
fn timer_preempts_in_fifo_order() {
    let mut kernel = boot();
    let first = fork(&mut kernel);
    let second = fork(&mut kernel);

    let mut order = Vec::new();
    for _ in 0..6 {
        match kernel.handle_trap(Trap::Interrupt(Interrupt::SupervisorTimer), 0) {
            TrapOutcome::Resume { pid, .. } => order.push(pid),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(order, [first, second, Pid::INIT, first, second, Pid::INIT]);
}

#[test]
fn exec_passes_arguments() {
    let mut kernel = boot();
    put_str(&kernel, PATH, "worker");
    put_str(&kernel, PATH + 0x20, "-v");
    put_str(&kernel, PATH + 0x30, "input.txt");
    put_words(&kernel, SCRATCH, &[PATH, PATH + 0x20, PATH + 0x30, 0]);

    let (argc, _) = syscall(&mut kernel, SYSCALL_EXEC, [PATH, SCRATCH, 0, 0, 0, 0]);
    assert_eq!(argc, Some(3));
    let argv = reg(&kernel, Pid::INIT, 11).unwrap();
    let sp = reg(&kernel, Pid::INIT, 2).unwrap();
    assert_eq!(sp % 16, 0);
    assert!(sp <= argv);

    let raw = user_read(&kernel, Pid::INIT, argv, 4 * 8).unwrap();
    let ptrs: Vec<usize> = raw.chunks(8).map(|c| usize::from_le_bytes(c.try_into().unwrap())).collect();
    assert_eq!(ptrs[3], 0);
    let expected: [&[u8]; 3] = [b"worker\0", b"-v\0", b"input.txt\0"];
    for (ptr, want) in ptrs.iter().zip(expected) {
        assert_eq!(user_read(&kernel, Pid::INIT, *ptr, want.len()).unwrap(), want);
    }
    assert_eq!(user_read(&kernel, Pid::INIT, 0x10000, 6).unwrap(), b"worker");
}

#[test]
fn failed_exec_keeps_the_old_image() {
    let mut kernel = boot();
    put_str(&kernel, PATH, "missing");
    let (ret, _) = syscall(&mut kernel, SYSCALL_EXEC, [PATH, 0, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-2));
    assert_eq!(user_read(&kernel, Pid::INIT, 0x10000, 4).unwrap(), b"init");
    assert_eq!(user_read(&kernel, Pid::INIT, PATH, 7).unwrap(), b"missing");
}

#[test]
fn spawn_creates_a_running_child() {
    let mut kernel = boot();
    put_str(&kernel, PATH, "worker");
    let (ret, _) = syscall(&mut kernel, SYSCALL_SPAWN, [PATH, 0, 0, 0, 0, 0]);
    let child = Pid::from_raw(ret.unwrap() as u32);
    assert_eq!(kernel.tasks().task(child).unwrap().parent(), Some(Pid::INIT));

    switch_to(&mut kernel, child);
    assert_eq!(user_read(&kernel, child, 0x10000, 6).unwrap(), b"worker");
    let (pid, _) = syscall(&mut kernel, SYSCALL_GETPID, [0; 6]);
    assert_eq!(pid, Some(child.as_index() as isize));
}

#[test]
fn unknown_syscall_is_enosys() {
    let mut kernel = boot();
    let (ret, outcome) = syscall(&mut kernel, 9999, [0; 6]);
    assert_eq!(ret, Some(-38));
    assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));
}

#[test]
fn heap_grows_and_shrinks() {
    let mut kernel = boot();
    let (brk, _) = syscall(&mut kernel, SYSCALL_SBRK, [0; 6]);
    let bottom = brk.unwrap() as usize;
    assert!(user_write(&kernel, Pid::INIT, bottom, b"x").is_none());

    let (old, _) = syscall(&mut kernel, SYSCALL_SBRK, [0x2000, 0, 0, 0, 0, 0]);
    assert_eq!(old, Some(bottom as isize));
    assert!(user_write(&kernel, Pid::INIT, bottom + 0x1fff, b"x").is_some());

    let (ret, _) = syscall(&mut kernel, SYSCALL_SBRK, [(-0x10000isize) as usize, 0, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-1));
    let (old, _) = syscall(&mut kernel, SYSCALL_SBRK, [(-0x2000isize) as usize, 0, 0, 0, 0, 0]);
    assert_eq!(old, Some((bottom + 0x2000) as isize));
    assert!(user_write(&kernel, Pid::INIT, bottom, b"x").is_none());
}

#[test]
fn mmap_and_munmap_whole_areas() {
    let mut kernel = boot();
    let base = 0x2000_0000;
    let (ret, _) = syscall(&mut kernel, SYSCALL_MMAP, [base, 0x2000, 0b011, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    assert!(user_write(&kernel, Pid::INIT, base + 0x1800, b"mapped").is_some());

    let (overlap, _) = syscall(&mut kernel, SYSCALL_MMAP, [base + 0x1000, 0x1000, 0b001, 0, 0, 0]);
    assert!(overlap.unwrap() < 0);
    let (no_prot, _) = syscall(&mut kernel, SYSCALL_MMAP, [0x3000_0000, 0x1000, 0, 0, 0, 0]);
    assert_eq!(no_prot, Some(-22));
    let (unaligned, _) = syscall(&mut kernel, SYSCALL_MMAP, [0x3000_0010, 0x1000, 0b001, 0, 0, 0]);
    assert_eq!(unaligned, Some(-22));

    let (ret, _) = syscall(&mut kernel, SYSCALL_MUNMAP, [base, 0x2000, 0, 0, 0, 0]);
    assert_eq!(ret, Some(0));
    assert!(user_write(&kernel, Pid::INIT, base, b"x").is_none());
    let (again, _) = syscall(&mut kernel, SYSCALL_MUNMAP, [base, 0x2000, 0, 0, 0, 0]);
    assert!(again.unwrap() < 0);
}

#[test]
fn pointers_outside_user_space_fail_only_the_call() {
    let mut kernel = boot();
    user_write(&kernel, Pid::INIT, SCRATCH, b"low").unwrap();

    // Both alias SCRATCH if the upper bits were dropped.
    for far in [(1usize << 40) + SCRATCH, (1usize << 39) + SCRATCH] {
        let (ret, outcome) = syscall(&mut kernel, SYSCALL_WRITE, [1, far, 0x2000, 0, 0, 0]);
        assert_eq!(ret, Some(-14));
        assert!(matches!(outcome, TrapOutcome::Resume { pid: Pid::INIT, .. }));
        let (ret, _) = syscall(&mut kernel, SYSCALL_READ, [0, far, 3, 0, 0, 0]);
        assert_eq!(ret, Some(-14));
        let (ret, _) = syscall(&mut kernel, SYSCALL_GET_TIME, [far, 0, 0, 0, 0, 0]);
        assert_eq!(ret, Some(-14));
    }

    let wrapping = usize::MAX - SCRATCH + 0x10;
    let (ret, _) = syscall(&mut kernel, SYSCALL_WRITE, [1, SCRATCH, wrapping, 0, 0, 0]);
    assert_eq!(ret, Some(-14));
    assert_eq!(user_read(&kernel, Pid::INIT, SCRATCH, 3).unwrap(), b"low");
}

#[test]
fn mmap_outside_user_space_maps_nothing() {
    let mut kernel = boot();
    let (ret, _) = syscall(&mut kernel, SYSCALL_MMAP, [0x1000_0000, 1 << 39, 0b011, 0, 0, 0]);
    assert_eq!(ret, Some(-22));
    assert!(user_write(&kernel, Pid::INIT, 0x1000_0000, b"x").is_none());

    let (ret, _) = syscall(&mut kernel, SYSCALL_MMAP, [(1 << 39) + 0x2000_0000, 0x1000, 0b011, 0, 0, 0]);
    assert_eq!(ret, Some(-22));
    assert!(user_write(&kernel, Pid::INIT, 0x2000_0000, b"x").is_none());

    let (ret, _) = syscall(&mut kernel, SYSCALL_SBRK, [1 << 40, 0, 0, 0, 0, 0]);
    assert_eq!(ret, Some(-1));
}
