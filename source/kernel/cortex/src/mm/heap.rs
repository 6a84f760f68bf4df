// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel heap backing `alloc` on the bare-metal target.

use linked_list_allocator::LockedHeap;
use spin::Once;

use crate::config::KERNEL_HEAP_SIZE;

#[global_allocator]
static HEAP_ALLOCATOR: LockedHeap = LockedHeap::empty();

static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];
static HEAP_READY: Once<()> = Once::new();

pub(super) fn init_heap() {
    HEAP_READY.call_once(|| {
        // SAFETY: HEAP_SPACE is handed to the allocator exactly once and never touched otherwise.
        unsafe {
            HEAP_ALLOCATOR
                .lock()
                .init(core::ptr::addr_of_mut!(HEAP_SPACE) as *mut u8, KERNEL_HEAP_SIZE);
        }
    });
}
