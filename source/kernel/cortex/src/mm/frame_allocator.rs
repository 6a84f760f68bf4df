// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation contract
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameTracker, frame_alloc(), frames_available(), init_frame_allocator(), StackFrameAllocator
//! DEPENDS_ON: mm::address, config, spin::{Mutex, Once}
//! INVARIANTS: A frame is either free in the allocator or owned by exactly one FrameTracker;
//!             dropping the tracker is the only way to return it; double free panics

extern crate alloc;

use alloc::vec::Vec;
use core::fmt::{self, Debug, Formatter};

use spin::{Mutex, Once};

use super::address::{PhysAddr, PhysPageNum};

/// RAII owner of one physical frame. The frame is zeroed on allocation.
pub struct FrameTracker {
    pub ppn: PhysPageNum,
}

impl FrameTracker {
    fn new(ppn: PhysPageNum) -> Self {
        ppn.get_bytes_array().fill(0);
        Self { ppn }
    }
}

impl Debug for FrameTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "FrameTracker:PPN={:#x}", self.ppn.0)
    }
}

impl Drop for FrameTracker {
    fn drop(&mut self) {
        frame_dealloc(self.ppn);
    }
}

trait FrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum>;
    fn dealloc(&mut self, ppn: PhysPageNum);
}

/// Bump allocator over `[current, end)` with a LIFO list of returned frames.
pub struct StackFrameAllocator {
    current: usize,
    end: usize,
    recycled: Vec<usize>,
}

impl StackFrameAllocator {
    pub const fn new() -> Self {
        Self { current: 0, end: 0, recycled: Vec::new() }
    }

    pub fn init(&mut self, l: PhysPageNum, r: PhysPageNum) {
        self.current = l.0;
        self.end = r.0;
        self.recycled.clear();
    }

    pub fn available(&self) -> usize {
        self.end - self.current + self.recycled.len()
    }

    pub fn alloc(&mut self) -> Option<PhysPageNum> {
        FrameAllocator::alloc(self)
    }

    pub fn dealloc(&mut self, ppn: PhysPageNum) {
        FrameAllocator::dealloc(self, ppn)
    }
}

impl Default for StackFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for StackFrameAllocator {
    fn alloc(&mut self) -> Option<PhysPageNum> {
        if let Some(ppn) = self.recycled.pop() {
            Some(ppn.into())
        } else if self.current == self.end {
            None
        } else {
            self.current += 1;
            Some((self.current - 1).into())
        }
    }

    fn dealloc(&mut self, ppn: PhysPageNum) {
        let ppn = ppn.0;
        if ppn >= self.current || self.recycled.iter().any(|&v| v == ppn) {
            panic!("Frame ppn={:#x} has not been allocated!", ppn);
        }
        self.recycled.push(ppn);
    }
}

static FRAME_ALLOCATOR: Mutex<StackFrameAllocator> = Mutex::new(StackFrameAllocator::new());
static FRAME_POOL: Once<(PhysPageNum, PhysPageNum)> = Once::new();

/// Hands `[start, end)` to the global allocator. Only the first call has an effect.
pub fn init_frame_allocator(start: PhysAddr, end: PhysAddr) {
    FRAME_POOL.call_once(|| install(start, end));
}

fn install(start: PhysAddr, end: PhysAddr) -> (PhysPageNum, PhysPageNum) {
    let range = (start.ceil(), end.floor());
    FRAME_ALLOCATOR.lock().init(range.0, range.1);
    range
}

/// Host builds back "physical memory" with a leaked page-aligned allocation so
/// that `PhysPageNum << 12` is a dereferenceable pointer.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn init_host_pool() {
    use crate::config::{HOST_FRAME_COUNT, PAGE_SIZE};
    FRAME_POOL.call_once(|| {
        let bytes = HOST_FRAME_COUNT * PAGE_SIZE;
        // Constant size and alignment, so the fallback is unreachable.
        let layout = core::alloc::Layout::from_size_align(bytes, PAGE_SIZE)
            .unwrap_or(core::alloc::Layout::new::<[u8; PAGE_SIZE]>());
        // SAFETY: non-zero size; the pool is never freed.
        let base = unsafe { alloc::alloc::alloc_zeroed(layout) } as usize;
        if base == 0 {
            alloc::alloc::handle_alloc_error(layout);
        }
        install(PhysAddr(base), PhysAddr(base + layout.size()))
    });
}

pub fn frame_alloc() -> Option<FrameTracker> {
    #[cfg(test)]
    if failpoint::should_fail() {
        return None;
    }
    FRAME_ALLOCATOR.lock().alloc().map(FrameTracker::new)
}

fn frame_dealloc(ppn: PhysPageNum) {
    FRAME_ALLOCATOR.lock().dealloc(ppn);
}

/// Frames currently free in the global pool.
pub fn frames_available() -> usize {
    FRAME_ALLOCATOR.lock().available()
}
