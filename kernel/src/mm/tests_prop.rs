//! Property-based tests for the swap slot table and the fault/evict cycle.
//!
//! - Slot indices are never handed out twice before being freed, and the
//!   statistics always agree with the set of slots held.
//! - Any sequence of page writes with fewer frames than pages reads back
//!   the last value written to each page, and every page is in exactly one
//!   place: resident, swapped or never loaded.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::vec::Vec;

use proptest::prelude::*;
use x86_64::VirtAddr;

use super::*;
use crate::storage::{RamDisk, SECTOR_SIZE};

#[derive(Debug, Clone)]
enum SlotOp {
    Alloc,
    Free(usize),
}

fn arb_slot_op() -> impl Strategy<Value = SlotOp> {
    prop_oneof![
        2 => Just(SlotOp::Alloc),
        1 => any::<usize>().prop_map(SlotOp::Free),
    ]
}

fn swap_disk(slots: u64) -> Arc<RamDisk> {
    let sectors = slots * (PAGE_SIZE / SECTOR_SIZE) as u64;
    Arc::new(RamDisk::new(SECTOR_SIZE as u32, sectors))
}

proptest! {
    #[test]
    fn slots_never_issued_twice(slots in 1u64..40, ops in prop::collection::vec(arb_slot_op(), 1..200)) {
        let table = SwapTable::new(swap_disk(slots)).unwrap();
        let mut held: Vec<SwapSlot> = Vec::new();
        let mut seen = BTreeSet::new();

        for op in ops {
            match op {
                SlotOp::Alloc => match table.allocate_slot() {
                    Ok(slot) => {
                        prop_assert!(seen.insert(slot.index()));
                        prop_assert!((slot.index() as u64) < slots);
                        held.push(slot);
                    }
                    Err(e) => {
                        prop_assert_eq!(e, SwapError::NoSwapSpace);
                        prop_assert_eq!(held.len() as u64, slots);
                    }
                },
                SlotOp::Free(pick) if !held.is_empty() => {
                    let slot = held.swap_remove(pick % held.len());
                    seen.remove(&slot.index());
                    table.free_slot(slot);
                    prop_assert!(table.is_free(slot));
                }
                SlotOp::Free(_) => {}
            }
            let stats = table.stats();
            prop_assert_eq!(stats.used, held.len() as u64);
            prop_assert_eq!(stats.free + stats.used, slots);
        }
    }

    #[test]
    fn writes_survive_eviction(
        frames in 1usize..4,
        writes in prop::collection::vec((0u64..6, any::<u8>()), 1..40),
    ) {
        const PAGES: u64 = 6;
        const BASE: u64 = 0x2000_0000;
        let pg = PAGE_SIZE as u64;

        let pa = Arc::new(BitmapFrameAllocator::new(frames));
        let vm = Vm::new(VmConfig::default(), pa.clone(), swap_disk(PAGES)).unwrap();
        let pt = Arc::new(SoftPageTable::new(pa.clone()));
        let mut space = AddressSpace::new(pt.clone());
        for i in 0..PAGES {
            vm.alloc_page(&mut space, VmType::Anon, VirtAddr::new(BASE + i * pg), true).unwrap();
        }

        let mut model = [0u8; PAGES as usize];
        for (page, value) in writes {
            let va = VirtAddr::new(BASE + page * pg + 100);
            let mut done = false;
            for _ in 0..4 {
                match pt.user_write(va, &[value]) {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(fault) => {
                        prop_assert!(vm.handle_fault(&mut space, &fault).is_resolved());
                    }
                }
            }
            prop_assert!(done);
            model[page as usize] = value;
            prop_assert!(vm.stats().resident_frames <= frames);
        }

        for i in 0..PAGES {
            let page = space.spt().find(VirtAddr::new(BASE + i * pg)).unwrap();
            let page = page.lock();
            let loaded = page.frame.is_some();
            let swapped = matches!(page.residency(), Residency::Swapped(_));
            prop_assert!(!(loaded && swapped));
            if let PageKind::Anon(anon) = &page.kind {
                prop_assert!(!(loaded && anon.slot.is_some()));
            }
        }

        for i in 0..PAGES {
            let va = VirtAddr::new(BASE + i * pg + 100);
            let mut buf = [0u8; 1];
            let mut done = false;
            for _ in 0..4 {
                match pt.user_read(va, &mut buf) {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(fault) => {
                        prop_assert!(vm.handle_fault(&mut space, &fault).is_resolved());
                    }
                }
            }
            prop_assert!(done);
            prop_assert_eq!(buf[0], model[i as usize]);
        }

        vm.destroy_address_space(&mut space);
        prop_assert_eq!(pa.free_frames(), frames);
        prop_assert_eq!(vm.stats().swap.used, 0);
    }
}
