// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for address arithmetic and address-space copies
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Page number / offset composition is lossless for every valid pair
//!   - Deep-copied spaces never share frames and never observe each other's writes
//!
//! TEST_SCENARIOS:
//!   - va_compose_decompose(): (vpn, off) -> VirtAddr -> (floor, page_offset) is identity
//!   - pa_compose_decompose(): same for physical addresses
//!   - user_range_never_aliases(): accepted ranges keep their length and stay inside one half
//!   - copies_are_isolated(): random writes to a forked data page stay on their side

use proptest::prelude::*;

use super::*;
use crate::config::{PAGE_SIZE, PAGE_SIZE_BITS};
use crate::harness::sample_program;

const VPN_LIMIT: usize = 1 << 27;
const PPN_LIMIT: usize = 1 << 44;

proptest! {
    #[test]
    fn va_compose_decompose(vpn in 0usize..VPN_LIMIT, off in 0usize..PAGE_SIZE) {
        let va = VirtAddr::from(vpn << PAGE_SIZE_BITS | off);
        prop_assert_eq!(va.floor(), VirtPageNum(vpn));
        prop_assert_eq!(va.page_offset(), off);
        prop_assert_eq!(VirtAddr::from(va.floor()).0 + va.page_offset(), va.0);
        prop_assert_eq!(VirtAddr::from(usize::from(va)), va);
    }

    #[test]
    fn pa_compose_decompose(ppn in 0usize..PPN_LIMIT, off in 0usize..PAGE_SIZE) {
        let pa = PhysAddr::from(ppn << PAGE_SIZE_BITS | off);
        prop_assert_eq!(pa.floor(), PhysPageNum(ppn));
        prop_assert_eq!(pa.page_offset(), off);
        prop_assert_eq!(PhysAddr::from(pa.floor()).0 + pa.page_offset(), pa.0);
    }

    #[test]
    fn user_range_never_aliases(
        start in prop_oneof![0usize..(1 << 38), (usize::MAX << 38)..=usize::MAX],
        len in 0usize..(1 << 40),
    ) {
        if let Some((lo, hi)) = VirtAddr::user_range(start, len) {
            prop_assert_eq!(usize::from(lo), start);
            prop_assert_eq!(hi.0 - lo.0, len);
            prop_assert!(hi.0 <= 1 << 39);
            prop_assert!(lo.0 >= 1 << 38 || hi.0 <= 1 << 38);
        } else {
            prop_assert!(start.checked_add(len).map_or(true, |end| end > 1 << 38 && start < 1 << 38));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn copies_are_isolated(
        writes in proptest::collection::vec((0usize..PAGE_SIZE, any::<u8>(), any::<bool>()), 1..16)
    ) {
        init();
        let (parent, _, _) = MemorySet::from_elf(&sample_program(b"seed")).expect("load");
        let child = MemorySet::from_existing_user(&parent).expect("copy");
        let page = VirtAddr::from(0x11000usize).floor();
        let p = parent.translate(page).expect("parent page").ppn();
        let c = child.translate(page).expect("child page").ppn();
        prop_assert_ne!(p, c);

        let mut expect_p = p.get_bytes_array().to_vec();
        let mut expect_c = c.get_bytes_array().to_vec();
        for (off, byte, to_child) in writes {
            if to_child {
                c.get_bytes_array()[off] = byte;
                expect_c[off] = byte;
            } else {
                p.get_bytes_array()[off] = byte;
                expect_p[off] = byte;
            }
        }
        prop_assert_eq!(&p.get_bytes_array()[..], &expect_p[..]);
        prop_assert_eq!(&c.get_bytes_array()[..], &expect_c[..]);
    }
}
