// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address spaces built from non-overlapping map areas
//! OWNERS: @kernel-mm-team
//! PUBLIC API: MemorySet (new_bare/new_kernel/from_elf/from_existing_user/push/activate/mmap/munmap),
//!             MapArea, MapType, MapPermission, MemoryError
//! DEPENDS_ON: mm::page_table, mm::frame_allocator, hal::Mmu, xmas-elf
//! INVARIANTS: Areas never overlap and never cover the trampoline page;
//!             a Framed area owns every frame it maps;
//!             user spaces always map TRAMPOLINE and TRAP_CONTEXT_BASE

extern crate alloc;

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use super::address::{PhysPageNum, StepByOne, VPNRange, VirtAddr, VirtPageNum};
use super::frame_allocator::{frame_alloc, FrameTracker};
use super::page_table::{MapError, PTEFlags, PageTable, PageTableEntry};
use crate::config::{PAGE_SIZE, TRAMPOLINE, TRAP_CONTEXT_BASE, USER_STACK_SIZE, USER_STACK_TOP};
use crate::hal::{self, Mmu};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Area permissions; bit positions match [`PTEFlags`].
    pub struct MapPermission: u8 {
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MapType {
    /// VPN maps to the PPN with the same number.
    Identical,
    /// Each page is backed by a frame owned by the area.
    Framed,
}

/// Error returned by address-space operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use]
pub enum MemoryError {
    /// Page-table manipulation failed.
    Map(MapError),
    /// The range intersects an existing area or a fixed kernel page.
    Overlap,
    /// No area starts at the requested page.
    NoSuchArea,
    /// The executable image is malformed.
    InvalidElf(&'static str),
    /// Unaligned, empty or otherwise unusable range or permission.
    InvalidRange,
}

impl From<MapError> for MemoryError {
    fn from(value: MapError) -> Self {
        Self::Map(value)
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(err) => write!(f, "mapping failed: {err}"),
            Self::Overlap => f.write_str("range overlaps an existing mapping"),
            Self::NoSuchArea => f.write_str("no area starts at this page"),
            Self::InvalidElf(why) => write!(f, "invalid ELF: {why}"),
            Self::InvalidRange => f.write_str("invalid range"),
        }
    }
}

pub struct MapArea {
    vpn_range: VPNRange,
    data_frames: BTreeMap<VirtPageNum, FrameTracker>,
    map_type: MapType,
    map_perm: MapPermission,
}

impl MapArea {
    pub fn new(start_va: VirtAddr, end_va: VirtAddr, map_type: MapType, map_perm: MapPermission) -> Self {
        let start_vpn = start_va.floor();
        let end_vpn = end_va.ceil();
        Self { vpn_range: VPNRange::new(start_vpn, end_vpn), data_frames: BTreeMap::new(), map_type, map_perm }
    }

    /// Same range, type and permissions; no frames.
    pub fn from_another(another: &Self) -> Self {
        Self {
            vpn_range: another.vpn_range,
            data_frames: BTreeMap::new(),
            map_type: another.map_type,
            map_perm: another.map_perm,
        }
    }

    pub fn vpn_range(&self) -> VPNRange {
        self.vpn_range
    }

    pub fn map_type(&self) -> MapType {
        self.map_type
    }

    pub fn permission(&self) -> MapPermission {
        self.map_perm
    }

    /// Frames currently owned by this area.
    pub fn frames(&self) -> impl Iterator<Item = PhysPageNum> + '_ {
        self.data_frames.values().map(|frame| frame.ppn)
    }

    fn pte_flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.map_perm.bits())
    }

    fn map_one(&mut self, page_table: &mut PageTable, vpn: VirtPageNum) -> Result<(), MapError> {
        match self.map_type {
            MapType::Identical => page_table.map(vpn, PhysPageNum(vpn.0), self.pte_flags()),
            MapType::Framed => {
                let frame = frame_alloc().ok_or(MapError::AllocationExhausted)?;
                page_table.map(vpn, frame.ppn, self.pte_flags())?;
                self.data_frames.insert(vpn, frame);
                Ok(())
            }
        }
    }

    fn unmap_one(&mut self, page_table: &mut PageTable, vpn: VirtPageNum) -> Result<(), MapError> {
        self.data_frames.remove(&vpn);
        page_table.unmap(vpn)
    }

    fn map_range(&mut self, page_table: &mut PageTable, range: VPNRange) -> Result<(), MapError> {
        for vpn in range {
            if let Err(err) = self.map_one(page_table, vpn) {
                for done in VPNRange::new(range.get_start(), vpn) {
                    let _ = self.unmap_one(page_table, done);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn map(&mut self, page_table: &mut PageTable) -> Result<(), MapError> {
        self.map_range(page_table, self.vpn_range)
    }

    fn unmap(&mut self, page_table: &mut PageTable) -> Result<(), MapError> {
        for vpn in self.vpn_range {
            self.unmap_one(page_table, vpn)?;
        }
        Ok(())
    }

    /// Copies `data` into the area starting `offset` bytes into its first page,
    /// going through `page_table` rather than any kernel alias.
    fn copy_data(&self, page_table: &PageTable, data: &[u8], offset: usize) -> Result<(), MapError> {
        let mut vpn = self.vpn_range.get_start();
        let mut page_off = offset;
        let mut copied = 0;
        while copied < data.len() {
            let n = (PAGE_SIZE - page_off).min(data.len() - copied);
            let ppn = page_table.translate(vpn).ok_or(MapError::NotMapped)?.ppn();
            ppn.get_bytes_array()[page_off..page_off + n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
            page_off = 0;
            vpn.step();
        }
        Ok(())
    }

    fn shrink_to(&mut self, page_table: &mut PageTable, new_end: VirtPageNum) -> Result<(), MapError> {
        for vpn in VPNRange::new(new_end, self.vpn_range.get_end()) {
            self.unmap_one(page_table, vpn)?;
        }
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end);
        Ok(())
    }

    fn append_to(&mut self, page_table: &mut PageTable, new_end: VirtPageNum) -> Result<(), MapError> {
        self.map_range(page_table, VPNRange::new(self.vpn_range.get_end(), new_end))?;
        self.vpn_range = VPNRange::new(self.vpn_range.get_start(), new_end);
        Ok(())
    }
}

/// One address space: a page table plus the areas it maps, keyed by start VPN.
pub struct MemorySet {
    page_table: PageTable,
    areas: BTreeMap<VirtPageNum, MapArea>,
    heap_start: Option<VirtPageNum>,
}

impl MemorySet {
    pub fn new_bare() -> Result<Self, MemoryError> {
        Ok(Self { page_table: PageTable::new()?, areas: BTreeMap::new(), heap_start: None })
    }

    pub fn token(&self) -> usize {
        self.page_table.token()
    }

    pub fn translate(&self, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.page_table.translate(vpn)
    }

    pub fn areas(&self) -> impl Iterator<Item = &MapArea> + '_ {
        self.areas.values()
    }

    /// Base address of the program break area, if this space was loaded from an image.
    pub fn heap_bottom(&self) -> Option<usize> {
        self.heap_start.map(|vpn| usize::from(VirtAddr::from(vpn)))
    }

    fn trampoline_vpn() -> VirtPageNum {
        VirtAddr::from(TRAMPOLINE).floor()
    }

    fn check_free(&self, start: VirtPageNum, range: VPNRange) -> Result<(), MemoryError> {
        if self.areas.contains_key(&start)
            || range.contains(Self::trampoline_vpn())
            || self.areas.values().any(|area| area.vpn_range.overlaps(&range))
        {
            return Err(MemoryError::Overlap);
        }
        Ok(())
    }

    /// Inserts `area` and copies `data` to the start of it.
    pub fn push(&mut self, area: MapArea, data: Option<&[u8]>) -> Result<(), MemoryError> {
        self.push_at(area, data, 0)
    }

    fn push_at(&mut self, mut area: MapArea, data: Option<&[u8]>, offset: usize) -> Result<(), MemoryError> {
        let start = area.vpn_range.get_start();
        self.check_free(start, area.vpn_range)?;
        area.map(&mut self.page_table)?;
        if let Some(data) = data {
            if let Err(err) = area.copy_data(&self.page_table, data, offset) {
                let _ = area.unmap(&mut self.page_table);
                return Err(err.into());
            }
        }
        self.areas.insert(start, area);
        Ok(())
    }

    pub fn insert_framed_area(
        &mut self,
        start_va: VirtAddr,
        end_va: VirtAddr,
        permission: MapPermission,
    ) -> Result<(), MemoryError> {
        self.push(MapArea::new(start_va, end_va, MapType::Framed, permission), None)
    }

    /// Unmaps the area starting at `start_vpn` and frees its frames.
    pub fn remove_area_with_start_vpn(&mut self, start_vpn: VirtPageNum) -> Result<(), MemoryError> {
        let mut area = self.areas.remove(&start_vpn).ok_or(MemoryError::NoSuchArea)?;
        area.unmap(&mut self.page_table)?;
        Ok(())
    }

    fn map_trampoline(&mut self) -> Result<(), MemoryError> {
        self.page_table.map(Self::trampoline_vpn(), trampoline_ppn()?, PTEFlags::R | PTEFlags::X)?;
        Ok(())
    }

    /// Kernel address space. On the target this identity-maps the kernel image,
    /// the rest of RAM and the MMIO windows; on the host only the trampoline.
    pub fn new_kernel() -> Result<Self, MemoryError> {
        let mut memory_set = Self::new_bare()?;
        memory_set.map_trampoline()?;
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        kernel_layout::map_sections(&mut memory_set)?;
        Ok(memory_set)
    }

    /// Builds a user space from an ELF64 image.
    ///
    /// Returns the space, the entry point and the initial user stack pointer.
    pub fn from_elf(elf_data: &[u8]) -> Result<(Self, usize, usize), MemoryError> {
        // xmas-elf reads headers in place and requires 8-byte alignment.
        let realigned: Vec<u64>;
        let image: &[u8] = if elf_data.as_ptr() as usize % core::mem::align_of::<u64>() == 0 {
            elf_data
        } else {
            let mut words = vec![0u64; elf_data.len().div_ceil(8)];
            // SAFETY: `words` spans at least `elf_data.len()` bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(elf_data.as_ptr(), words.as_mut_ptr() as *mut u8, elf_data.len());
            }
            realigned = words;
            // SAFETY: same bytes as above, borrowed for the lifetime of `realigned`.
            unsafe { core::slice::from_raw_parts(realigned.as_ptr() as *const u8, elf_data.len()) }
        };

        let elf = xmas_elf::ElfFile::new(image).map_err(MemoryError::InvalidElf)?;
        if elf.header.pt1.magic != ELF_MAGIC {
            return Err(MemoryError::InvalidElf("bad magic"));
        }
        let pt2 = &elf.header.pt2;
        let ph_end = (pt2.ph_offset() as usize)
            .checked_add(pt2.ph_count() as usize * pt2.ph_entry_size() as usize)
            .ok_or(MemoryError::InvalidElf("program header table overflows"))?;
        if ph_end > image.len() {
            return Err(MemoryError::InvalidElf("program header table out of bounds"));
        }

        let mut memory_set = Self::new_bare()?;
        memory_set.map_trampoline()?;
        let mut max_end_vpn = VirtPageNum(0);
        for i in 0..pt2.ph_count() {
            let ph = elf.program_header(i).map_err(MemoryError::InvalidElf)?;
            match ph.get_type() {
                Ok(xmas_elf::program::Type::Load) => {}
                _ => continue,
            }
            let offset = ph.offset() as usize;
            let file_size = ph.file_size() as usize;
            let mem_size = ph.mem_size() as usize;
            let vaddr = ph.virtual_addr() as usize;
            let file_end = offset.checked_add(file_size).filter(|&end| end <= image.len());
            let Some(file_end) = file_end else {
                return Err(MemoryError::InvalidElf("segment out of bounds"));
            };
            let Some((start_va, end_va)) = VirtAddr::user_range(vaddr, mem_size) else {
                return Err(MemoryError::InvalidElf("segment address not canonical"));
            };
            if file_size > mem_size {
                return Err(MemoryError::InvalidElf("segment file size exceeds memory size"));
            }

            let mut map_perm = MapPermission::U;
            let flags = ph.flags();
            if flags.is_read() {
                map_perm |= MapPermission::R;
            }
            if flags.is_write() {
                map_perm |= MapPermission::W;
            }
            if flags.is_execute() {
                map_perm |= MapPermission::X;
            }
            let area = MapArea::new(start_va, end_va, MapType::Framed, map_perm);
            if area.vpn_range.get_end() > max_end_vpn {
                max_end_vpn = area.vpn_range.get_end();
            }
            memory_set.push_at(area, Some(&image[offset..file_end]), start_va.page_offset())?;
        }

        // Empty program-break area one guard page above the image.
        let heap_start = VirtPageNum(max_end_vpn.0 + 1);
        let heap_va = VirtAddr::from(heap_start);
        memory_set.push(
            MapArea::new(heap_va, heap_va, MapType::Framed, MapPermission::R | MapPermission::W | MapPermission::U),
            None,
        )?;
        memory_set.heap_start = Some(heap_start);

        memory_set.insert_framed_area(
            VirtAddr::from(USER_STACK_TOP - USER_STACK_SIZE),
            VirtAddr::from(USER_STACK_TOP),
            MapPermission::R | MapPermission::W | MapPermission::U,
        )?;
        memory_set.insert_framed_area(
            VirtAddr::from(TRAP_CONTEXT_BASE),
            VirtAddr::from(TRAMPOLINE),
            MapPermission::R | MapPermission::W,
        )?;
        Ok((memory_set, elf.header.pt2.entry_point() as usize, USER_STACK_TOP))
    }

    /// Deep copy of a user space: same layout, fresh frames, identical bytes.
    pub fn from_existing_user(user_space: &Self) -> Result<Self, MemoryError> {
        let mut memory_set = Self::new_bare()?;
        memory_set.map_trampoline()?;
        memory_set.heap_start = user_space.heap_start;
        for area in user_space.areas.values() {
            memory_set.push(MapArea::from_another(area), None)?;
            if area.map_type != MapType::Framed {
                continue;
            }
            for vpn in area.vpn_range {
                let src = user_space.translate(vpn).ok_or(MapError::NotMapped)?.ppn();
                let dst = memory_set.translate(vpn).ok_or(MapError::NotMapped)?.ppn();
                dst.get_bytes_array().copy_from_slice(src.get_bytes_array());
            }
        }
        Ok(memory_set)
    }

    /// Makes this space current for address translation.
    pub fn activate(&self) {
        hal::machine().mmu().activate(self.token());
    }

    /// Releases every area, leaving only the page-table root and trampoline.
    pub fn recycle_data_pages(&mut self) {
        while let Some((_, mut area)) = self.areas.pop_first() {
            let _ = area.unmap(&mut self.page_table);
        }
    }

    /// Maps `[start, start + len)` as a new framed user area.
    ///
    /// `prot` uses bit 0 for read, bit 1 for write and bit 2 for execute.
    pub fn mmap(&mut self, start: usize, len: usize, prot: usize) -> Result<(), MemoryError> {
        if start % PAGE_SIZE != 0 || len == 0 || prot & !0x7 != 0 || prot & 0x7 == 0 {
            return Err(MemoryError::InvalidRange);
        }
        let (start, end) = VirtAddr::user_range(start, len).ok_or(MemoryError::InvalidRange)?;
        let perm = MapPermission::from_bits_truncate((prot as u8) << 1) | MapPermission::U;
        self.push(MapArea::new(start, end, MapType::Framed, perm), None)
    }

    /// Removes the area covering exactly `[start, start + len)` rounded up to pages.
    pub fn munmap(&mut self, start: usize, len: usize) -> Result<(), MemoryError> {
        if start % PAGE_SIZE != 0 || len == 0 {
            return Err(MemoryError::InvalidRange);
        }
        let (start, end) = VirtAddr::user_range(start, len).ok_or(MemoryError::InvalidRange)?;
        let start_vpn = start.floor();
        let end_vpn = end.ceil();
        match self.areas.get(&start_vpn) {
            Some(area) if area.vpn_range.get_end() == end_vpn => self.remove_area_with_start_vpn(start_vpn),
            Some(_) => Err(MemoryError::InvalidRange),
            None => Err(MemoryError::NoSuchArea),
        }
    }

    /// Shrinks the area starting at `start` so it ends at `new_end`.
    pub fn shrink_to(&mut self, start: VirtAddr, new_end: VirtAddr) -> Result<(), MemoryError> {
        let area = self.areas.get_mut(&start.floor()).ok_or(MemoryError::NoSuchArea)?;
        let new_end = new_end.ceil();
        if new_end < area.vpn_range.get_start() || new_end > area.vpn_range.get_end() {
            return Err(MemoryError::InvalidRange);
        }
        area.shrink_to(&mut self.page_table, new_end)?;
        Ok(())
    }

    /// Grows the area starting at `start` so it ends at `new_end`.
    pub fn append_to(&mut self, start: VirtAddr, new_end: VirtAddr) -> Result<(), MemoryError> {
        let start_vpn = start.floor();
        let new_end = new_end.ceil();
        let old_end = self.areas.get(&start_vpn).ok_or(MemoryError::NoSuchArea)?.vpn_range.get_end();
        if new_end < old_end {
            return Err(MemoryError::InvalidRange);
        }
        let growth = VPNRange::new(old_end, new_end);
        if growth.contains(Self::trampoline_vpn())
            || self.areas.iter().any(|(key, area)| *key != start_vpn && area.vpn_range.overlaps(&growth))
            || self.areas.range(old_end..new_end).any(|(key, _)| *key != start_vpn)
        {
            return Err(MemoryError::Overlap);
        }
        let Some(area) = self.areas.get_mut(&start_vpn) else {
            return Err(MemoryError::NoSuchArea);
        };
        area.append_to(&mut self.page_table, new_end)?;
        Ok(())
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn trampoline_ppn() -> Result<PhysPageNum, MapError> {
    // Stands in for the linked `.text.trampoline` page; shared by every space.
    static HOST_TRAMPOLINE: spin::Once<FrameTracker> = spin::Once::new();
    HOST_TRAMPOLINE
        .try_call_once(|| frame_alloc().ok_or(MapError::AllocationExhausted))
        .map(|frame| frame.ppn)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn trampoline_ppn() -> Result<PhysPageNum, MapError> {
    extern "C" {
        fn strampoline();
    }
    Ok(super::address::PhysAddr::from(strampoline as usize).floor())
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod kernel_layout {
    use super::{MapArea, MapPermission, MapType, MemoryError, MemorySet};
    use crate::config::{MEMORY_END, MMIO};
    use crate::mm::address::VirtAddr;

    extern "C" {
        fn stext();
        fn etext();
        fn srodata();
        fn erodata();
        fn sdata();
        fn edata();
        fn sbss_with_stack();
        fn ebss();
        fn ekernel();
    }

    pub(super) fn map_sections(memory_set: &mut MemorySet) -> Result<(), MemoryError> {
        let rw = MapPermission::R | MapPermission::W;
        let sections = [
            (stext as usize, etext as usize, MapPermission::R | MapPermission::X),
            (srodata as usize, erodata as usize, MapPermission::R),
            (sdata as usize, edata as usize, rw),
            (sbss_with_stack as usize, ebss as usize, rw),
            (ekernel as usize, MEMORY_END, rw),
        ];
        for (start, end, perm) in sections {
            log::debug!("kernel map [{:#x}, {:#x}) {:?}", start, end, perm);
            memory_set.push(MapArea::new(VirtAddr::from(start), VirtAddr::from(end), MapType::Identical, perm), None)?;
        }
        for &(base, len) in MMIO {
            memory_set.push(MapArea::new(VirtAddr::from(base), VirtAddr::from(base + len), MapType::Identical, rw), None)?;
        }
        Ok(())
    }
}
