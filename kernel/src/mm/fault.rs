//! Page fault entry and frame acquisition.
//!
//! A fault is resolved by one of: growing the stack, materializing a declared
//! page (possibly evicting another one to get a frame), or copy-on-write.
//! Anything else is reported back so the caller can kill the context.

use core::sync::atomic::Ordering;

use x86_64::VirtAddr;

use super::frame::FrameOwner;
use super::page::{PageRef, VmType};
use super::phys::Kva;
use super::spt::AddressSpace;
use super::{pg_round_down, Vm, USER_TOP};
use crate::util::{KError, KResult};

/// What the CPU reports about a page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub addr: VirtAddr,
    pub write: bool,
    /// The page was not present (as opposed to a protection violation).
    pub not_present: bool,
    /// User stack pointer at the time of the fault.
    pub rsp: Option<VirtAddr>,
}

impl Fault {
    pub fn new(addr: VirtAddr, write: bool, not_present: bool) -> Self {
        Self {
            addr,
            write,
            not_present,
            rsp: None,
        }
    }

    pub fn with_rsp(mut self, rsp: VirtAddr) -> Self {
        self.rsp = Some(rsp);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    Resolved,
    /// Not a fault the VM can fix; the faulting context must die.
    Unresolved(KError),
}

impl FaultResult {
    pub fn is_resolved(&self) -> bool {
        matches!(self, FaultResult::Resolved)
    }
}

impl Vm {
    pub fn handle_fault(&self, space: &mut AddressSpace, fault: &Fault) -> FaultResult {
        self.counters.faults.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "fault: addr={:#x} write={} not_present={}",
            fault.addr.as_u64(),
            fault.write,
            fault.not_present
        );
        match self.try_handle_fault(space, fault) {
            Ok(()) => FaultResult::Resolved,
            Err(e) => {
                log::debug!("fault: {:#x} unresolved: {}", fault.addr.as_u64(), e);
                FaultResult::Unresolved(e)
            }
        }
    }

    fn try_handle_fault(&self, space: &mut AddressSpace, fault: &Fault) -> KResult<()> {
        if fault.addr.as_u64() == 0 || fault.addr.as_u64() >= USER_TOP {
            return Err(KError::Invalid);
        }
        let upage = pg_round_down(fault.addr);

        let Some(page_ref) = space.spt().find(upage) else {
            if self.is_stack_access(fault) {
                return self.grow_stack(space, upage);
            }
            return Err(KError::Invalid);
        };

        {
            let page = page_ref.lock();
            if fault.write && !page.writable && !page.copy_on_write {
                return Err(KError::PermissionDenied);
            }
        }

        if fault.not_present {
            self.do_claim_page(&page_ref)
        } else if fault.write {
            self.handle_wp(&page_ref)
        } else {
            Err(KError::PermissionDenied)
        }
    }

    /// Inside the growable region and not too far below the stack pointer.
    fn is_stack_access(&self, fault: &Fault) -> bool {
        let addr = fault.addr.as_u64();
        let Some(rsp) = fault.rsp else {
            return false;
        };
        self.config.in_stack_region(addr)
            && addr.saturating_add(self.config.stack_slack) >= rsp.as_u64()
    }

    fn grow_stack(&self, space: &mut AddressSpace, upage: VirtAddr) -> KResult<()> {
        self.alloc_page(space, VmType::Anon, upage, true)?;
        if let Err(e) = self.claim_page(space, upage) {
            space.spt_mut().remove(upage);
            return Err(e);
        }
        self.counters.stack_growths.fetch_add(1, Ordering::Relaxed);
        log::debug!("fault: stack grown to {:#x}", upage.as_u64());
        Ok(())
    }

    /// Forces a declared page into memory.
    pub fn claim_page(&self, space: &AddressSpace, va: VirtAddr) -> KResult<()> {
        let page_ref = space.spt().find(va).ok_or(KError::NotFound)?;
        self.do_claim_page(&page_ref)
    }

    /// The frame is acquired before the page lock is taken: eviction locks
    /// the victim's page.
    pub(super) fn do_claim_page(&self, page_ref: &PageRef) -> KResult<()> {
        if page_ref.lock().is_resident() {
            return Ok(());
        }
        let kva = self.acquire_frame()?;
        let mut page = page_ref.lock();
        let (space, va, writable) = (page.space(), page.va, page.writable);
        if page.is_resident() {
            self.frames.release(kva, space, va);
            return Ok(());
        }

        page.frame = Some(kva);
        let res = self
            .swap_in(&mut page, kva)
            .and_then(|()| page.mapper().map(va, kva, writable));
        if let Err(e) = res {
            page.mapper().clear(va);
            page.frame = None;
            self.frames.release(kva, space, va);
            return Err(e);
        }
        self.frames.install(kva, FrameOwner::new(page_ref, &page));
        Ok(())
    }

    /// A zeroed frame with a count of 1, evicting when the allocator is dry.
    /// Must be called with no page lock held.
    pub(super) fn acquire_frame(&self) -> KResult<Kva> {
        if let Some(kva) = self.frames.alloc() {
            return Ok(kva);
        }
        self.evict_frame()
    }

    /// Every sharer of the victim leaves with its own copy: anonymous pages
    /// each get a slot, so swap needs no reference counts. If one of them
    /// fails, the ones already out stay out and the frame goes back on the
    /// clock for the rest.
    fn evict_frame(&self) -> KResult<Kva> {
        let (kva, owners) = self.frames.select_victim().ok_or(KError::NoMemory)?;

        for owner in &owners {
            // Destroyed since selection: its binding is already gone
            let Some(page_ref) = owner.page.upgrade() else {
                continue;
            };
            let mut page = page_ref.lock();
            if page.frame != Some(kva) {
                continue;
            }
            if let Err(e) = self.swap_out(&mut page) {
                drop(page);
                log::warn!("evict: swap-out of {:#x} failed: {}", owner.va.as_u64(), e);
                self.frames.abort_eviction(kva);
                return Err(e);
            }
            page.frame = None;
            self.frames.release(kva, owner.space, owner.va);
        }

        self.frames.reclaim(kva);
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "evict: frame {:#x} ({} sharers)",
            kva.as_u64(),
            owners.len()
        );
        Ok(kva)
    }
}
