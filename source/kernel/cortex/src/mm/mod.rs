// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory for Sv39: typed addresses, frames, page tables, address spaces.

pub mod address;
pub mod frame_allocator;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod heap;
pub mod memory_set;
pub mod page_table;

#[cfg(test)]
mod tests_prop;

pub use address::{PhysAddr, PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
pub use frame_allocator::{frame_alloc, frames_available, FrameTracker};
pub use memory_set::{MapArea, MapPermission, MapType, MemoryError, MemorySet};
pub use page_table::{
    copy_from_user, copy_to_user, translated_byte_buffer, translated_byte_buffer_mut, translated_ref,
    translated_refmut, translated_str, MapError, PTEFlags, PageTable, PageTableEntry,
};

/// Brings up the kernel heap (target) and the frame pool. Safe to call repeatedly.
pub fn init() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        extern "C" {
            fn ekernel();
        }
        heap::init_heap();
        frame_allocator::init_frame_allocator(
            PhysAddr::from(ekernel as usize),
            PhysAddr::from(crate::config::MEMORY_END),
        );
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    frame_allocator::init_host_pool();
}
