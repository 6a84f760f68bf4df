// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-side helpers for driving the kernel without hardware
//! OWNERS: @kernel-team
//! PUBLIC API: ElfBuilder, sample_program(), boot_with(), syscall(), user_write(), user_read(), reg()
//! DEPENDS_ON: kernel::Kernel, trap::{Trap, Exception}, fs::MemFs, mm user-copy helpers
//! INVARIANTS: Never used by the kernel itself; a "syscall" here is exactly what the
//!             trampoline would hand the dispatcher after an `ecall` from U-mode

extern crate alloc;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::fs::MemFs;
use crate::kernel::{BootConfig, BootError, Kernel};
use crate::mm::{copy_from_user, copy_to_user};
use crate::trap::{Exception, Trap, TrapOutcome};
use crate::types::Pid;

/// Segment is executable.
pub const PF_X: u32 = 1;
/// Segment is writable.
pub const PF_W: u32 = 2;
/// Segment is readable.
pub const PF_R: u32 = 4;

const EHDR_SIZE: usize = 64;
const PHDR_SIZE: usize = 56;
const EM_RISCV: u16 = 243;

struct Segment {
    vaddr: u64,
    flags: u32,
    data: Vec<u8>,
    mem_size: u64,
}

/// Builds minimal little-endian ELF64 executables with PT_LOAD segments only.
pub struct ElfBuilder {
    entry: u64,
    segments: Vec<Segment>,
}

impl ElfBuilder {
    pub fn new(entry: usize) -> Self {
        Self { entry: entry as u64, segments: Vec::new() }
    }

    pub fn segment(self, vaddr: usize, flags: u32, data: &[u8]) -> Self {
        let len = data.len();
        self.segment_with_size(vaddr, flags, data, len)
    }

    /// Segment whose memory image is `mem_size` bytes; the tail past `data` is zero.
    pub fn segment_with_size(mut self, vaddr: usize, flags: u32, data: &[u8], mem_size: usize) -> Self {
        self.segments.push(Segment {
            vaddr: vaddr as u64,
            flags,
            data: data.to_vec(),
            mem_size: mem_size as u64,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&EM_RISCV.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u64).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(EHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        let mut offset = EHDR_SIZE + PHDR_SIZE * self.segments.len();
        for seg in &self.segments {
            out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            out.extend_from_slice(&seg.flags.to_le_bytes());
            out.extend_from_slice(&(offset as u64).to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.mem_size.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
            offset += seg.data.len();
        }
        for seg in &self.segments {
            out.extend_from_slice(&seg.data);
        }
        out
    }
}

/// Text page at 0x10000 (R|X) starting with `tag`, data page at 0x11000 (R|W)
/// holding `tag` again followed by 0x100 bytes of zero-filled bss.
pub fn sample_program(tag: &[u8]) -> Vec<u8> {
    ElfBuilder::new(0x10000)
        .segment(0x10000, PF_R | PF_X, tag)
        .segment_with_size(0x11000, PF_R | PF_W, tag, tag.len() + 0x100)
        .build()
}

/// Boots a kernel whose file system holds `programs`, with `init` as the first task.
pub fn boot_with(programs: &[(&str, Vec<u8>)], init: &str) -> Result<Kernel, BootError> {
    let fs = MemFs::new();
    for (path, image) in programs {
        fs.insert(path, image.clone());
    }
    let mut kernel = Kernel::boot(Arc::new(fs), init, BootConfig::default())?;
    kernel.resume();
    Ok(kernel)
}

/// Issues syscall `id` from the current task and returns what it sees in `a0`
/// once it runs again, or `None` if the caller no longer exists.
pub fn syscall(kernel: &mut Kernel, id: usize, args: [usize; 6]) -> (Option<isize>, TrapOutcome) {
    let Some(pid) = kernel.current_pid() else {
        return (None, TrapOutcome::Idle);
    };
    if let Some(cx) = kernel.tasks_mut().trap_cx_mut(pid) {
        cx.x[17] = id;
        cx.x[10..16].copy_from_slice(&args);
    }
    let outcome = kernel.handle_trap(Trap::Exception(Exception::UserEnvCall), 0);
    (reg(kernel, pid, 10).map(|v| v as isize), outcome)
}

/// Register `x[index]` in the saved context of `pid`.
pub fn reg(kernel: &Kernel, pid: Pid, index: usize) -> Option<usize> {
    kernel.tasks().trap_cx(pid).map(|cx| cx.x[index])
}

/// Writes `bytes` into the user space of `pid` at `va`.
pub fn user_write(kernel: &Kernel, pid: Pid, va: usize, bytes: &[u8]) -> Option<()> {
    copy_to_user(kernel.tasks().token(pid)?, va, bytes)
}

/// Reads `len` bytes from the user space of `pid` at `va`.
pub fn user_read(kernel: &Kernel, pid: Pid, va: usize, len: usize) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; len];
    copy_from_user(kernel.tasks().token(pid)?, va, &mut buf)?;
    Some(buf)
}
