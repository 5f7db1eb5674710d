//! Frame table: every physical frame handed to user pages, with its reference
//! count, the pages bound to it and the clock list the evictor walks.
//!
//! A frame moves through three states:
//! - `Pending`: allocated (or reclaimed) and not yet bound to a page; not on
//!   the clock, never a victim.
//! - `Resident`: bound to one or more pages; on the clock.
//! - `Evicting`: picked as a victim; off the clock until the evictor reclaims
//!   it or aborts.
//!
//! The frame lock is a leaf: nothing here takes a page lock, and callers do
//! swap and file I/O after `select_victim` returns.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::VirtAddr;

use super::page::{Page, PageRef};
use super::paging::PageMapper;
use super::phys::{Kva, PallocFlags, PhysAllocator};
use super::spt::SpaceId;

/// A page bound to a frame.
#[derive(Clone)]
pub struct FrameOwner {
    pub space: SpaceId,
    pub va: VirtAddr,
    pub mapper: Arc<dyn PageMapper>,
    pub page: Weak<Mutex<Page>>,
}

impl FrameOwner {
    pub fn new(page_ref: &PageRef, page: &Page) -> Self {
        Self {
            space: page.space(),
            va: page.va,
            mapper: page.mapper().clone(),
            page: Arc::downgrade(page_ref),
        }
    }

    fn is(&self, space: SpaceId, va: VirtAddr) -> bool {
        self.space == space && self.va == va
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Pending,
    Resident,
    Evicting,
}

struct FrameEntry {
    ref_count: usize,
    sharers: Vec<FrameOwner>,
    state: FrameState,
}

struct FrameList {
    entries: BTreeMap<u64, FrameEntry>,
    /// Resident frames in insertion order.
    clock: Vec<Kva>,
    hand: usize,
}

impl FrameList {
    fn unlink(&mut self, kva: Kva) {
        if let Some(pos) = self.clock.iter().position(|&k| k == kva) {
            self.clock.remove(pos);
            if pos < self.hand {
                self.hand -= 1;
            }
        }
    }
}

pub struct FrameTable {
    palloc: Arc<dyn PhysAllocator>,
    inner: Mutex<FrameList>,
}

impl FrameTable {
    pub fn new(palloc: Arc<dyn PhysAllocator>) -> Self {
        Self {
            palloc,
            inner: Mutex::new(FrameList {
                entries: BTreeMap::new(),
                clock: Vec::new(),
                hand: 0,
            }),
        }
    }

    /// Fresh zeroed user frame with a count of 1, `None` when the allocator
    /// is exhausted.
    pub fn alloc(&self) -> Option<Kva> {
        let kva = self.palloc.alloc_page(PallocFlags::ZERO | PallocFlags::USER)?;
        self.inner.lock().entries.insert(
            kva.as_u64(),
            FrameEntry {
                ref_count: 1,
                sharers: Vec::new(),
                state: FrameState::Pending,
            },
        );
        Some(kva)
    }

    /// Binds a pending frame to its page and puts it on the clock.
    pub fn install(&self, kva: Kva, owner: FrameOwner) {
        let mut guard = self.inner.lock();
        let list = &mut *guard;
        let Some(entry) = list.entries.get_mut(&kva.as_u64()) else {
            log::warn!("frame: install of unknown frame {:#x}", kva.as_u64());
            return;
        };
        entry.sharers.push(owner);
        if entry.state != FrameState::Resident {
            entry.state = FrameState::Resident;
            list.clock.push(kva);
        }
    }

    /// Adds another page to a resident frame. Fails while the frame is being
    /// evicted; the caller retries once the eviction settles.
    pub fn share(&self, kva: Kva, owner: FrameOwner) -> bool {
        let mut list = self.inner.lock();
        match list.entries.get_mut(&kva.as_u64()) {
            Some(entry) if entry.state == FrameState::Resident => {
                entry.ref_count += 1;
                entry.sharers.push(owner);
                true
            }
            _ => false,
        }
    }

    /// Drops the binding of `(space, va)`. The physical page goes back to the
    /// allocator when the last binding is gone, unless an evictor holds the
    /// frame; it then reclaims the orphan itself.
    pub fn release(&self, kva: Kva, space: SpaceId, va: VirtAddr) {
        let free = {
            let mut guard = self.inner.lock();
            let list = &mut *guard;
            let Some(entry) = list.entries.get_mut(&kva.as_u64()) else {
                log::warn!("frame: release of unknown frame {:#x}", kva.as_u64());
                return;
            };
            if let Some(pos) = entry.sharers.iter().position(|o| o.is(space, va)) {
                entry.sharers.remove(pos);
            }
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 || entry.state == FrameState::Evicting {
                false
            } else {
                list.entries.remove(&kva.as_u64());
                list.unlink(kva);
                true
            }
        };
        if free {
            self.palloc.free_page(kva);
        }
    }

    /// Second-chance clock over every bound frame, shared ones included. A
    /// frame counts as accessed when any sharer's accessed bit is set; the
    /// bits are cleared and the frame is passed over once. After two sweeps
    /// the next candidate is taken as is, so a victim is found whenever one
    /// exists. Returns the victim with all of its sharers.
    pub fn select_victim(&self) -> Option<(Kva, Vec<FrameOwner>)> {
        let mut guard = self.inner.lock();
        let list = &mut *guard;
        let candidates = list
            .clock
            .iter()
            .filter(|kva| {
                list.entries
                    .get(&kva.as_u64())
                    .is_some_and(|e| !e.sharers.is_empty())
            })
            .count();
        if candidates == 0 {
            return None;
        }

        let sweeps = 2 * candidates;
        let mut probes = 0;
        loop {
            if list.hand >= list.clock.len() {
                list.hand = 0;
            }
            let hand = list.hand;
            let kva = list.clock[hand];
            let owners = match list.entries.get(&kva.as_u64()) {
                Some(e) if !e.sharers.is_empty() => e.sharers.clone(),
                _ => {
                    list.hand += 1;
                    continue;
                }
            };

            probes += 1;
            if probes <= sweeps {
                let mut accessed = false;
                for owner in &owners {
                    if owner.mapper.is_accessed(owner.va) {
                        owner.mapper.set_accessed(owner.va, false);
                        accessed = true;
                    }
                }
                if accessed {
                    list.hand += 1;
                    continue;
                }
            }

            list.clock.remove(hand);
            if let Some(entry) = list.entries.get_mut(&kva.as_u64()) {
                entry.state = FrameState::Evicting;
            }
            return Some((kva, owners));
        }
    }

    /// Turns an evicted frame into a zeroed pending one for the evictor.
    pub fn reclaim(&self, kva: Kva) {
        self.palloc.zero(kva);
        let mut list = self.inner.lock();
        let entry = list.entries.entry(kva.as_u64()).or_insert(FrameEntry {
            ref_count: 1,
            sharers: Vec::new(),
            state: FrameState::Pending,
        });
        entry.ref_count = 1;
        entry.sharers.clear();
        entry.state = FrameState::Pending;
    }

    /// Puts a victim back on the clock after a failed swap-out.
    pub fn abort_eviction(&self, kva: Kva) {
        let free = {
            let mut guard = self.inner.lock();
            let list = &mut *guard;
            match list.entries.get_mut(&kva.as_u64()) {
                Some(entry) if entry.ref_count > 0 => {
                    entry.state = FrameState::Resident;
                    list.clock.push(kva);
                    false
                }
                Some(_) => {
                    list.entries.remove(&kva.as_u64());
                    true
                }
                None => false,
            }
        };
        if free {
            self.palloc.free_page(kva);
        }
    }

    pub fn ref_count(&self, kva: Kva) -> usize {
        self.inner
            .lock()
            .entries
            .get(&kva.as_u64())
            .map(|e| e.ref_count)
            .unwrap_or(0)
    }

    pub fn sharers(&self, kva: Kva) -> usize {
        self.inner
            .lock()
            .entries
            .get(&kva.as_u64())
            .map(|e| e.sharers.len())
            .unwrap_or(0)
    }

    pub fn state(&self, kva: Kva) -> Option<FrameState> {
        self.inner.lock().entries.get(&kva.as_u64()).map(|e| e.state)
    }

    /// Frames currently on the clock.
    pub fn resident(&self) -> usize {
        self.inner.lock().clock.len()
    }

    pub fn is_listed(&self, kva: Kva) -> bool {
        self.inner.lock().clock.contains(&kva)
    }
}
