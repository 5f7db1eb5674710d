//! Per-page metadata and backend dispatch.
//!
//! A `Page` starts `Uninit` with a lazy initializer and becomes `Anon` or
//! `File` on its first fault. The evictor reaches pages through the frame
//! table, so every page lives behind its own lock (`PageRef`).

use alloc::sync::Arc;

use spin::Mutex;
use x86_64::VirtAddr;

use super::file::MappedFile;
use super::paging::PageMapper;
use super::phys::Kva;
use super::spt::SpaceId;
use super::swap::SwapSlot;
use super::{anon, file, Vm, PAGE_SIZE};
use crate::util::{KError, KResult};

pub type PageRef = Arc<Mutex<Page>>;

/// Backend discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Uninit,
    Anon,
    File,
}

/// A page-sized window of a mapped file.
#[derive(Clone)]
pub struct FileSlice {
    pub file: Arc<MappedFile>,
    /// Byte offset of the window in the file.
    pub offset: u64,
    /// Bytes read from the file; the rest of the page is zero.
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Last page of its mapping; destroying it closes the handle.
    pub last: bool,
}

impl FileSlice {
    pub fn new(file: Arc<MappedFile>, offset: u64, read_bytes: usize, last: bool) -> Self {
        Self {
            file,
            offset,
            read_bytes,
            zero_bytes: PAGE_SIZE - read_bytes,
            last,
        }
    }
}

/// Lazy initializer of an `Uninit` page.
#[derive(Clone)]
pub enum PageInit {
    /// Anonymous zero-filled page.
    Zero,
    /// Loaded from a file once, then anonymous (evicted to swap).
    Segment(FileSlice),
    /// File-backed page, written back to the file.
    Mapped(FileSlice),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AnonPage {
    /// Set while the contents live in swap.
    pub slot: Option<SwapSlot>,
}

#[derive(Clone)]
pub struct FilePage {
    pub slice: FileSlice,
}

pub enum PageKind {
    Uninit(PageInit),
    Anon(AnonPage),
    File(FilePage),
}

/// Where the contents of a page currently are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Resident(Kva),
    Swapped(SwapSlot),
    /// Never materialized, or a clean file page whose contents are in the file.
    NotLoaded,
}

pub struct Page {
    pub va: VirtAddr,
    pub writable: bool,
    /// Shares a frame read-only; the first write takes a private copy.
    pub copy_on_write: bool,
    pub frame: Option<Kva>,
    pub kind: PageKind,
    space: SpaceId,
    mapper: Arc<dyn PageMapper>,
}

impl Page {
    pub fn new(
        space: SpaceId,
        mapper: Arc<dyn PageMapper>,
        va: VirtAddr,
        writable: bool,
        kind: PageKind,
    ) -> Self {
        Self {
            va,
            writable,
            copy_on_write: false,
            frame: None,
            kind,
            space,
            mapper,
        }
    }

    pub fn into_ref(self) -> PageRef {
        Arc::new(Mutex::new(self))
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn mapper(&self) -> &Arc<dyn PageMapper> {
        &self.mapper
    }

    /// Current backend.
    pub fn vm_type(&self) -> VmType {
        match self.kind {
            PageKind::Uninit(_) => VmType::Uninit,
            PageKind::Anon(_) => VmType::Anon,
            PageKind::File(_) => VmType::File,
        }
    }

    /// Backend the page has, or will have once initialized.
    pub fn page_get_type(&self) -> VmType {
        match &self.kind {
            PageKind::Uninit(PageInit::Zero | PageInit::Segment(_)) => VmType::Anon,
            PageKind::Uninit(PageInit::Mapped(_)) => VmType::File,
            _ => self.vm_type(),
        }
    }

    pub fn residency(&self) -> Residency {
        match (&self.kind, self.frame) {
            (_, Some(kva)) => Residency::Resident(kva),
            (PageKind::Anon(AnonPage { slot: Some(slot) }), None) => Residency::Swapped(*slot),
            _ => Residency::NotLoaded,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// File of a `Mapped` page, initialized or not.
    pub fn mapping(&self) -> Option<&Arc<MappedFile>> {
        match &self.kind {
            PageKind::File(fp) => Some(&fp.slice.file),
            PageKind::Uninit(PageInit::Mapped(slice)) => Some(&slice.file),
            _ => None,
        }
    }
}

impl Vm {
    /// Fills `kva` with the page contents. `page.frame` is already `kva`.
    pub(super) fn swap_in(&self, page: &mut Page, kva: Kva) -> KResult<()> {
        match page.vm_type() {
            VmType::Uninit => self.initialize(page, kva),
            VmType::Anon => anon::swap_in(self, page, kva),
            VmType::File => file::swap_in(self, page, kva),
        }
    }

    /// Moves the contents out of the frame and unmaps it. The caller drops
    /// `page.frame` on success.
    pub(super) fn swap_out(&self, page: &mut Page) -> KResult<()> {
        match page.vm_type() {
            VmType::Anon => anon::swap_out(self, page),
            VmType::File => file::swap_out(self, page),
            VmType::Uninit => Err(KError::Invalid),
        }
    }

    /// Releases everything the page holds: frame, swap slot, file handle.
    /// Dirty file contents are written back first; a failed writeback is
    /// reported once everything is released.
    pub(super) fn destroy_page(&self, page: &mut Page) -> KResult<()> {
        match page.vm_type() {
            VmType::Uninit => {
                if let PageKind::Uninit(PageInit::Mapped(slice)) = &page.kind {
                    if slice.last {
                        slice.file.close();
                    }
                }
                Ok(())
            }
            VmType::Anon => {
                anon::destroy(self, page);
                Ok(())
            }
            VmType::File => file::destroy(self, page),
        }
    }

    /// First materialization. The kind changes only once loading succeeded,
    /// so a failed fault can be retried.
    fn initialize(&self, page: &mut Page, kva: Kva) -> KResult<()> {
        let PageKind::Uninit(init) = &page.kind else {
            return Err(KError::Invalid);
        };
        let kind = match init {
            PageInit::Zero => PageKind::Anon(AnonPage::default()),
            PageInit::Segment(slice) => {
                file::load_slice(self, slice, kva)?;
                PageKind::Anon(AnonPage::default())
            }
            PageInit::Mapped(slice) => {
                file::load_slice(self, slice, kva)?;
                PageKind::File(FilePage {
                    slice: slice.clone(),
                })
            }
        };
        page.kind = kind;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;
    use crate::mm::paging::SoftPageTable;
    use crate::mm::phys::BitmapFrameAllocator;

    fn page(kind: PageKind) -> Page {
        let pa = Arc::new(BitmapFrameAllocator::new(1));
        let pt = Arc::new(SoftPageTable::new(pa));
        Page::new(SpaceId::next(), pt, VirtAddr::new(0x1000), true, kind)
    }

    fn slice() -> FileSlice {
        let file = Arc::new(MappedFile::new(alloc::boxed::Box::new(MemFile::create(b"x"))));
        FileSlice::new(file, 0, 1, true)
    }

    #[test]
    fn test_get_type_reports_target() {
        let zero = page(PageKind::Uninit(PageInit::Zero));
        assert_eq!(zero.vm_type(), VmType::Uninit);
        assert_eq!(zero.page_get_type(), VmType::Anon);

        let seg = page(PageKind::Uninit(PageInit::Segment(slice())));
        assert_eq!(seg.page_get_type(), VmType::Anon);
        assert!(seg.mapping().is_none());

        let mapped = page(PageKind::Uninit(PageInit::Mapped(slice())));
        assert_eq!(mapped.page_get_type(), VmType::File);
        assert!(mapped.mapping().is_some());
    }

    #[test]
    fn test_residency() {
        let mut p = page(PageKind::Anon(AnonPage {
            slot: Some(SwapSlot::new(3)),
        }));
        assert_eq!(p.residency(), Residency::Swapped(SwapSlot::new(3)));

        p.kind = PageKind::Anon(AnonPage::default());
        p.frame = Some(VirtAddr::new(0xffff_8000_0000_0000));
        assert_eq!(
            p.residency(),
            Residency::Resident(VirtAddr::new(0xffff_8000_0000_0000))
        );

        let p = page(PageKind::Uninit(PageInit::Zero));
        assert_eq!(p.residency(), Residency::NotLoaded);
        assert!(!p.is_resident());
    }

    #[test]
    fn test_slice_pads_with_zeros() {
        let s = slice();
        assert_eq!(s.read_bytes + s.zero_bytes, PAGE_SIZE);
        assert_eq!(s.zero_bytes, PAGE_SIZE - 1);
    }
}
