//! Anonymous pages: no file behind them, evicted to swap.
//!
//! uninit -> resident <-> swapped -> destroyed

use super::page::{Page, PageKind};
use super::phys::Kva;
use super::Vm;
use crate::util::{KError, KResult};

/// Reads the page back from its slot and frees the slot. A page that was
/// never swapped keeps the zeroed frame.
pub(super) fn swap_in(vm: &Vm, page: &mut Page, kva: Kva) -> KResult<()> {
    let PageKind::Anon(anon) = &mut page.kind else {
        return Err(KError::Invalid);
    };
    if let Some(slot) = anon.slot {
        vm.swap.load(slot, &*vm.palloc, kva)?;
        anon.slot = None;
    }
    Ok(())
}

/// Unmaps the page and writes its frame to a fresh slot. On failure the
/// mapping is restored and the page stays resident.
pub(super) fn swap_out(vm: &Vm, page: &mut Page) -> KResult<()> {
    let Some(kva) = page.frame else {
        return Err(KError::Invalid);
    };
    let (va, writable) = (page.va, page.writable);
    let mapper = page.mapper().clone();
    let PageKind::Anon(anon) = &mut page.kind else {
        return Err(KError::Invalid);
    };

    mapper.clear(va);
    match vm.swap.store(&*vm.palloc, kva) {
        Ok(slot) => {
            anon.slot = Some(slot);
            Ok(())
        }
        Err(e) => {
            mapper.map(va, kva, writable)?;
            Err(e.into())
        }
    }
}

pub(super) fn destroy(vm: &Vm, page: &mut Page) {
    if let PageKind::Anon(anon) = &mut page.kind {
        if let Some(slot) = anon.slot.take() {
            vm.swap.free_slot(slot);
        }
    }
    if let Some(kva) = page.frame.take() {
        page.mapper().clear(page.va);
        vm.frames.release(kva, page.space(), page.va);
    }
}
