//! Supplemental page table: what an address space knows about each of its
//! virtual pages, resident or not. Also address-space duplication and
//! teardown.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use x86_64::VirtAddr;

use super::file::MappedFile;
use super::frame::FrameOwner;
use super::page::{AnonPage, FileSlice, Page, PageInit, PageKind, PageRef, VmType};
use super::paging::PageMapper;
use super::{file, pg_round_down, Vm, PAGE_SIZE, USER_TOP};
use crate::util::{KError, KResult};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an address space, unique for the life of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(u64);

impl SpaceId {
    pub fn next() -> Self {
        Self(NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pages keyed by their page-aligned address.
#[derive(Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<u64, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Page containing `va`.
    pub fn find(&self, va: VirtAddr) -> Option<PageRef> {
        self.pages.get(&pg_round_down(va).as_u64()).cloned()
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.pages.contains_key(&pg_round_down(va).as_u64())
    }

    pub fn insert(&mut self, va: VirtAddr, page: PageRef) -> KResult<()> {
        let key = pg_round_down(va).as_u64();
        if self.pages.contains_key(&key) {
            return Err(KError::AlreadyExists);
        }
        self.pages.insert(key, page);
        Ok(())
    }

    /// Unlinks the page; the caller destroys it.
    pub fn remove(&mut self, va: VirtAddr) -> Option<PageRef> {
        self.pages.remove(&pg_round_down(va).as_u64())
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Pages in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtAddr, &PageRef)> {
        self.pages.iter().map(|(&va, page)| (VirtAddr::new(va), page))
    }

    fn pop_first(&mut self) -> Option<PageRef> {
        self.pages.pop_first().map(|(_, page)| page)
    }
}

/// One process's view of memory: its page table and the pages behind it.
pub struct AddressSpace {
    id: SpaceId,
    mapper: Arc<dyn PageMapper>,
    spt: SupplementalPageTable,
}

impl AddressSpace {
    pub fn new(mapper: Arc<dyn PageMapper>) -> Self {
        Self {
            id: SpaceId::next(),
            mapper,
            spt: SupplementalPageTable::new(),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn mapper(&self) -> &Arc<dyn PageMapper> {
        &self.mapper
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    pub fn spt_mut(&mut self) -> &mut SupplementalPageTable {
        &mut self.spt
    }
}

/// Private handles opened for the child, one per mapping of the parent.
type Reopened = BTreeMap<usize, Arc<MappedFile>>;

impl Vm {
    /// Declares a page at `va` to be initialized on first fault. `ty` is the
    /// type the page becomes and must agree with `init`.
    pub fn alloc_page_with_initializer(
        &self,
        space: &mut AddressSpace,
        ty: VmType,
        va: VirtAddr,
        writable: bool,
        init: PageInit,
    ) -> KResult<()> {
        if va.as_u64() == 0 || !va.is_aligned(PAGE_SIZE as u64) || va.as_u64() >= USER_TOP {
            return Err(KError::Invalid);
        }
        match (ty, &init) {
            (VmType::Anon, PageInit::Zero | PageInit::Segment(_)) => {}
            (VmType::File, PageInit::Mapped(_)) => {}
            _ => return Err(KError::Invalid),
        }
        if space.spt.contains(va) {
            return Err(KError::AlreadyExists);
        }
        let page = Page::new(
            space.id,
            space.mapper.clone(),
            va,
            writable,
            PageKind::Uninit(init),
        );
        space.spt.insert(va, page.into_ref())
    }

    /// Declares a zero-filled anonymous page. File pages need a slice and go
    /// through `alloc_page_with_initializer`.
    pub fn alloc_page(
        &self,
        space: &mut AddressSpace,
        ty: VmType,
        va: VirtAddr,
        writable: bool,
    ) -> KResult<()> {
        match ty {
            VmType::Anon => {
                self.alloc_page_with_initializer(space, ty, va, writable, PageInit::Zero)
            }
            _ => Err(KError::Invalid),
        }
    }

    /// Removes and destroys the page at `va`.
    pub fn remove_page(&self, space: &mut AddressSpace, va: VirtAddr) -> KResult<()> {
        let page_ref = space.spt.remove(va).ok_or(KError::NotFound)?;
        let res = self.destroy_page(&mut page_ref.lock());
        res
    }

    /// Duplicates `src` into a new address space using `mapper`. Anonymous
    /// resident pages share their frame copy-on-write; everything else is
    /// declared again lazily. The source must be quiesced.
    pub fn fork_address_space(
        &self,
        src: &AddressSpace,
        mapper: Arc<dyn PageMapper>,
    ) -> KResult<AddressSpace> {
        let mut child = AddressSpace::new(mapper);
        let mut reopened = Reopened::new();
        for (_, page_ref) in src.spt.iter() {
            if let Err(e) = self.copy_page(page_ref, &mut child, &mut reopened) {
                log::warn!("fork: copy of space {} failed: {}", src.id, e);
                self.destroy_address_space(&mut child);
                return Err(e);
            }
        }
        log::debug!(
            "fork: space {} -> {} ({} pages)",
            src.id,
            child.id,
            child.spt.len()
        );
        Ok(child)
    }

    fn copy_page(
        &self,
        src_ref: &PageRef,
        child: &mut AddressSpace,
        reopened: &mut Reopened,
    ) -> KResult<()> {
        loop {
            let mut src = src_ref.lock();
            let (va, writable) = (src.va, src.writable);

            let slot = match &src.kind {
                PageKind::Uninit(init) => {
                    let init = fork_init(init, reopened)?;
                    let ty = src.page_get_type();
                    drop(src);
                    return self.alloc_page_with_initializer(child, ty, va, writable, init);
                }
                PageKind::File(fp) => {
                    // The child reads the file; give it the parent's changes.
                    let slice = fp.slice.clone();
                    file::write_back(self, &src)?;
                    drop(src);
                    let init = fork_init(&PageInit::Mapped(slice), reopened)?;
                    return self.alloc_page_with_initializer(
                        child,
                        VmType::File,
                        va,
                        writable,
                        init,
                    );
                }
                PageKind::Anon(anon) => anon.slot,
            };

            if let Some(kva) = src.frame {
                let cow = src.writable || src.copy_on_write;
                let page = Page::new(
                    child.id,
                    child.mapper.clone(),
                    va,
                    false,
                    PageKind::Anon(AnonPage::default()),
                );
                let page_ref = page.into_ref();
                let owner = {
                    let mut page = page_ref.lock();
                    page.copy_on_write = cow;
                    page.frame = Some(kva);
                    FrameOwner::new(&page_ref, &page)
                };
                if !self.frames.share(kva, owner) {
                    // Being evicted; it will show up swapped on the next try
                    drop(src);
                    core::hint::spin_loop();
                    continue;
                }
                if let Err(e) = child.spt.insert(va, page_ref) {
                    self.frames.release(kva, child.id, va);
                    return Err(e);
                }
                child.mapper.map(va, kva, false)?;
                if src.writable {
                    src.writable = false;
                    src.copy_on_write = true;
                    src.mapper().map(va, kva, false)?;
                }
                return Ok(());
            }

            // Swapped out: the child gets a private copy of the slot
            let writable = src.writable || src.copy_on_write;
            let Some(slot) = slot else {
                drop(src);
                let page = Page::new(
                    child.id,
                    child.mapper.clone(),
                    va,
                    writable,
                    PageKind::Anon(AnonPage::default()),
                );
                return child.spt.insert(va, page.into_ref());
            };
            drop(src);

            let kva = self.acquire_frame()?;
            let src = src_ref.lock();
            let still_swapped = src.frame.is_none()
                && matches!(&src.kind, PageKind::Anon(AnonPage { slot: Some(s) }) if *s == slot);
            if !still_swapped {
                drop(src);
                self.frames.release(kva, child.id, va);
                continue;
            }
            let read = self.swap.peek(slot, &*self.palloc, kva);
            drop(src);
            if let Err(e) = read {
                self.frames.release(kva, child.id, va);
                return Err(e.into());
            }

            let mut page = Page::new(
                child.id,
                child.mapper.clone(),
                va,
                writable,
                PageKind::Anon(AnonPage::default()),
            );
            page.frame = Some(kva);
            let page_ref = page.into_ref();
            if let Err(e) = child.mapper.map(va, kva, writable) {
                self.frames.release(kva, child.id, va);
                return Err(e);
            }
            let owner = FrameOwner::new(&page_ref, &page_ref.lock());
            self.frames.install(kva, owner);
            return child.spt.insert(va, page_ref);
        }
    }

    /// Destroys every page, in ascending address order.
    pub fn destroy_address_space(&self, space: &mut AddressSpace) {
        let mut pages = 0usize;
        while let Some(page_ref) = space.spt.pop_first() {
            // Already logged by the backend; the space goes away regardless
            let _ = self.destroy_page(&mut page_ref.lock());
            pages += 1;
        }
        log::debug!("spt: space {} destroyed ({} pages)", space.id, pages);
    }
}

/// Same initializer for the child, with mapped files reopened so parent and
/// child close their own handles.
fn fork_init(init: &PageInit, reopened: &mut Reopened) -> KResult<PageInit> {
    let PageInit::Mapped(slice) = init else {
        return Ok(init.clone());
    };
    let key = Arc::as_ptr(&slice.file) as usize;
    let file = match reopened.get(&key) {
        Some(file) => file.clone(),
        None => {
            let file = slice.file.reopen()?;
            reopened.insert(key, file.clone());
            file
        }
    };
    Ok(PageInit::Mapped(FileSlice {
        file,
        ..slice.clone()
    }))
}
