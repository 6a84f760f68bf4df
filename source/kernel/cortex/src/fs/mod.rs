// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: File abstraction behind task fd tables
//! OWNERS: @kernel-team
//! PUBLIC API: File, FileSystem, UserBuffer, FileError, OpenFlags, MemFs, make_pipe, Stdin, Stdout
//! DEPENDS_ON: hal::Console, spin
//! INVARIANTS: Files never block; a read or write that cannot progress reports WouldBlock

extern crate alloc;

pub mod mem;
pub mod pipe;
pub mod stdio;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

pub use mem::MemFs;
pub use pipe::{make_pipe, Pipe};
pub use stdio::{Stdin, Stdout};

/// A user buffer split at page boundaries, already translated to kernel-accessible slices.
pub struct UserBuffer {
    pub buffers: Vec<&'static mut [u8]>,
}

impl UserBuffer {
    pub fn new(buffers: Vec<&'static mut [u8]>) -> Self {
        Self { buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates byte slots in order across every fragment.
    pub fn bytes_mut(&mut self) -> impl Iterator<Item = &mut u8> + '_ {
        self.buffers.iter_mut().flat_map(|b| b.iter_mut())
    }

    pub fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        self.buffers.iter().flat_map(|b| b.iter().copied())
    }
}

#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileError {
    /// Nothing could be transferred right now; retry after other tasks run.
    WouldBlock,
    /// Write to a pipe whose read end is closed.
    BrokenPipe,
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => f.write_str("operation would block"),
            Self::BrokenPipe => f.write_str("broken pipe"),
        }
    }
}

/// An open file description shared between fd slots (and across fork).
pub trait File: Send + Sync {
    fn readable(&self) -> bool;
    fn writable(&self) -> bool;
    /// Reads into `buf`; `Ok(0)` means end of file.
    fn read(&self, buf: UserBuffer) -> Result<usize, FileError>;
    fn write(&self, buf: UserBuffer) -> Result<usize, FileError>;
}

bitflags! {
    /// `open` flags, Linux-compatible bit positions.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREATE = 1 << 9;
        const TRUNC = 1 << 10;
    }
}

impl OpenFlags {
    /// (readable, writable)
    pub fn read_write(&self) -> (bool, bool) {
        if self.contains(Self::WRONLY) {
            (false, true)
        } else if self.contains(Self::RDWR) {
            (true, true)
        } else {
            (true, false)
        }
    }
}

/// Source of executable images and regular files.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> Option<Arc<dyn File>>;
    /// Whole contents of `path`, used by exec and spawn.
    fn load(&self, path: &str) -> Option<Vec<u8>>;
}

#[cfg(test)]
pub(crate) fn leaked_buffer(bytes: &[u8]) -> UserBuffer {
    let leaked: &'static mut [u8] = alloc::boxed::Box::leak(bytes.to_vec().into_boxed_slice());
    UserBuffer::new(alloc::vec![leaked])
}
