// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page table owning its node frames, plus checked user-memory access.
//!
//! Intermediate levels are created on demand with only `V` set. A leaf is a
//! valid entry with any of `R`, `W` or `X`. Removing the last leaf below an
//! intermediate node returns that node's frame to the allocator.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use super::address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
use super::frame_allocator::{frame_alloc, FrameTracker};
use crate::config::PAGE_SIZE;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PTEFlags: u8 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

const LEAF_PERMS: PTEFlags = PTEFlags::R.union(PTEFlags::W).union(PTEFlags::X);
const PPN_MASK: usize = (1usize << 44) - 1;
/// Longest NUL-terminated string accepted from user memory.
const MAX_USER_STR: usize = 4096;

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// The frame allocator could not provide a node frame.
    AllocationExhausted,
    /// No leaf mapping exists for the page.
    NotMapped,
    /// Flags do not describe a leaf (none of R, W, X).
    InvalidFlags,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationExhausted => f.write_str("frame allocator exhausted"),
            Self::NotMapped => f.write_str("page not mapped"),
            Self::InvalidFlags => f.write_str("leaf flags lack R/W/X"),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct PageTableEntry {
    pub bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        Self { bits: ppn.0 << 10 | flags.bits() as usize }
    }
    pub fn empty() -> Self {
        Self { bits: 0 }
    }
    pub fn ppn(&self) -> PhysPageNum {
        (self.bits >> 10 & PPN_MASK).into()
    }
    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u8)
    }
    pub fn is_valid(&self) -> bool {
        self.flags().contains(PTEFlags::V)
    }
    pub fn is_leaf(&self) -> bool {
        self.is_valid() && self.flags().intersects(LEAF_PERMS)
    }
    pub fn readable(&self) -> bool {
        self.flags().contains(PTEFlags::R)
    }
    pub fn writable(&self) -> bool {
        self.flags().contains(PTEFlags::W)
    }
    pub fn executable(&self) -> bool {
        self.flags().contains(PTEFlags::X)
    }
    pub fn is_user(&self) -> bool {
        self.flags().contains(PTEFlags::U)
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PTE({:?} {:?})", self.ppn(), self.flags())
    }
}

/// Three-level Sv39 page table.
///
/// `frames` holds the node frames this table allocated; a table rebuilt with
/// [`PageTable::from_token`] owns nothing and is only used for lookups.
pub struct PageTable {
    root_ppn: PhysPageNum,
    frames: Vec<FrameTracker>,
}

impl PageTable {
    /// Creates an empty table with a fresh root node.
    pub fn new() -> Result<Self, MapError> {
        let frame = frame_alloc().ok_or(MapError::AllocationExhausted)?;
        Ok(Self { root_ppn: frame.ppn, frames: alloc::vec![frame] })
    }

    /// Lookup-only view over the table encoded in a satp value.
    pub fn from_token(satp: usize) -> Self {
        Self { root_ppn: PhysPageNum::from(satp & PPN_MASK), frames: Vec::new() }
    }

    /// satp value selecting Sv39 with this table as root.
    pub fn token(&self) -> usize {
        8usize << 60 | self.root_ppn.0
    }

    /// Node frames owned by this table, root included.
    pub fn node_count(&self) -> usize {
        self.frames.len()
    }

    fn find_pte_create(&mut self, vpn: VirtPageNum) -> Result<&mut PageTableEntry, MapError> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (level, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if level == 2 {
                return Ok(pte);
            }
            if !pte.is_valid() {
                let frame = frame_alloc().ok_or(MapError::AllocationExhausted)?;
                *pte = PageTableEntry::new(frame.ppn, PTEFlags::V);
                self.frames.push(frame);
            }
            ppn = pte.ppn();
        }
        Err(MapError::NotMapped)
    }

    fn find_pte(&self, vpn: VirtPageNum) -> Option<&mut PageTableEntry> {
        let idxs = vpn.indexes();
        let mut ppn = self.root_ppn;
        for (level, idx) in idxs.iter().enumerate() {
            let pte = &mut ppn.get_pte_array()[*idx];
            if level == 2 {
                return Some(pte);
            }
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            ppn = pte.ppn();
        }
        None
    }

    /// Installs or replaces the leaf for `vpn`. `V` is added to `flags`.
    pub fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, flags: PTEFlags) -> Result<(), MapError> {
        if !flags.intersects(LEAF_PERMS) {
            return Err(MapError::InvalidFlags);
        }
        let pte = self.find_pte_create(vpn)?;
        *pte = PageTableEntry::new(ppn, flags | PTEFlags::V);
        Ok(())
    }

    /// Clears the leaf for `vpn` and frees intermediate nodes left empty.
    pub fn unmap(&mut self, vpn: VirtPageNum) -> Result<(), MapError> {
        let idxs = vpn.indexes();
        let mut path = [self.root_ppn; 3];
        for level in 0..2 {
            let pte = path[level].get_pte_array()[idxs[level]];
            if !pte.is_valid() || pte.is_leaf() {
                return Err(MapError::NotMapped);
            }
            path[level + 1] = pte.ppn();
        }
        let leaf = &mut path[2].get_pte_array()[idxs[2]];
        if !leaf.is_valid() {
            return Err(MapError::NotMapped);
        }
        *leaf = PageTableEntry::empty();

        for level in (1..3).rev() {
            let node = path[level];
            if node.get_pte_array().iter().any(PageTableEntry::is_valid) {
                break;
            }
            let Some(pos) = self.frames.iter().position(|f| f.ppn == node) else {
                break;
            };
            path[level - 1].get_pte_array()[idxs[level - 1]] = PageTableEntry::empty();
            self.frames.swap_remove(pos);
        }
        Ok(())
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.find_pte(vpn).map(|pte| *pte).filter(PageTableEntry::is_valid)
    }

    pub fn translate_va(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.translate(va.floor()).map(|pte| {
            let aligned: PhysAddr = pte.ppn().into();
            (aligned.0 + va.page_offset()).into()
        })
    }
}

// User memory access

fn user_page(pt: &PageTable, vpn: VirtPageNum, write: bool) -> Option<PhysPageNum> {
    let pte = pt.translate(vpn)?;
    if !pte.is_user() || !pte.readable() || (write && !pte.writable()) {
        return None;
    }
    Some(pte.ppn())
}

fn user_slices(token: usize, ptr: usize, len: usize, write: bool) -> Option<Vec<&'static mut [u8]>> {
    let (start_va, end_va) = VirtAddr::user_range(ptr, len)?;
    let pt = PageTable::from_token(token);
    let end = end_va.0;
    let mut start = start_va.0;
    let mut v = Vec::new();
    while start < end {
        let va = VirtAddr(start);
        let ppn = user_page(&pt, va.floor(), write)?;
        let from = va.page_offset();
        let page_end = (start - from + PAGE_SIZE).min(end);
        v.push(&mut ppn.get_bytes_array()[from..from + (page_end - start)]);
        start = page_end;
    }
    Some(v)
}

/// Kernel views of user bytes `[ptr, ptr + len)` that the task may read.
pub fn translated_byte_buffer(token: usize, ptr: *const u8, len: usize) -> Option<Vec<&'static mut [u8]>> {
    user_slices(token, ptr as usize, len, false)
}

/// Like [`translated_byte_buffer`], but every page must also be user-writable.
pub fn translated_byte_buffer_mut(token: usize, ptr: *mut u8, len: usize) -> Option<Vec<&'static mut [u8]>> {
    user_slices(token, ptr as usize, len, true)
}

/// Reads a NUL-terminated UTF-8 string from user memory.
pub fn translated_str(token: usize, ptr: *const u8) -> Option<String> {
    let pt = PageTable::from_token(token);
    let mut bytes = Vec::new();
    let mut va = ptr as usize;
    loop {
        let (addr, _) = VirtAddr::user_range(va, 1)?;
        let ppn = user_page(&pt, addr.floor(), false)?;
        let ch = ppn.get_bytes_array()[addr.page_offset()];
        if ch == 0 {
            break;
        }
        if bytes.len() == MAX_USER_STR {
            return None;
        }
        bytes.push(ch);
        va = va.checked_add(1)?;
    }
    String::from_utf8(bytes).ok()
}

fn user_object(token: usize, va: usize, size: usize, align: usize, write: bool) -> Option<PhysAddr> {
    let (addr, _) = VirtAddr::user_range(va, size)?;
    if va % align != 0 || addr.page_offset() + size > PAGE_SIZE {
        return None;
    }
    let pt = PageTable::from_token(token);
    let ppn = user_page(&pt, addr.floor(), write)?;
    let base: PhysAddr = ppn.into();
    Some(PhysAddr(base.0 + addr.page_offset()))
}

/// Borrows a user `T` that lies within one page.
pub fn translated_ref<T>(token: usize, ptr: *const T) -> Option<&'static T> {
    let pa = user_object(token, ptr as usize, core::mem::size_of::<T>(), core::mem::align_of::<T>(), false)?;
    Some(pa.get_mut())
}

/// Mutably borrows a user `T` that lies within one writable page.
pub fn translated_refmut<T>(token: usize, ptr: *mut T) -> Option<&'static mut T> {
    user_object(token, ptr as usize, core::mem::size_of::<T>(), core::mem::align_of::<T>(), true)
        .map(|pa| pa.get_mut())
}

/// Copies `src` to user address `dst`, crossing page boundaries as needed.
pub fn copy_to_user(token: usize, dst: usize, src: &[u8]) -> Option<()> {
    let mut off = 0;
    for chunk in user_slices(token, dst, src.len(), true)? {
        let n = chunk.len();
        chunk.copy_from_slice(&src[off..off + n]);
        off += n;
    }
    Some(())
}

/// Copies user bytes at `src` into `dst`.
pub fn copy_from_user(token: usize, src: usize, dst: &mut [u8]) -> Option<()> {
    let mut off = 0;
    for chunk in user_slices(token, src, dst.len(), false)? {
        let n = chunk.len();
        dst[off..off + n].copy_from_slice(chunk);
        off += n;
    }
    Some(())
}
