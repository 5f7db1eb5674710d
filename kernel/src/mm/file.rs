//! File-backed pages and memory-mapped files.
//!
//! A mapping owns a private handle on its file (`MappedFile`), shared by all
//! of its pages. Pages are loaded from the file on fault and written back only
//! when the hardware dirty bit says they changed.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::VirtAddr;

use super::page::{FileSlice, Page, PageInit, PageKind, VmType};
use super::phys::Kva;
use super::spt::AddressSpace;
use super::{Vm, PAGE_SIZE, USER_TOP};
use crate::fs::File;
use crate::util::{KError, KResult};

/// Private handle on a mapped file. Closed by the last page of the mapping,
/// by munmap, or on drop, whichever comes first.
pub struct MappedFile {
    handle: Mutex<Option<Box<dyn File>>>,
}

impl MappedFile {
    pub fn new(handle: Box<dyn File>) -> Self {
        Self {
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Reads at `offset` until `buf` is full or the file ends.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let mut guard = self.handle.lock();
        let file = guard.as_mut().ok_or(KError::Invalid)?;
        file.seek(offset);
        let mut done = 0;
        while done < buf.len() {
            let n = file.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> KResult<usize> {
        let mut guard = self.handle.lock();
        let file = guard.as_mut().ok_or(KError::Invalid)?;
        file.seek(offset);
        file.write(data)
    }

    pub fn length(&self) -> KResult<u64> {
        self.handle
            .lock()
            .as_ref()
            .map(|f| f.length())
            .ok_or(KError::Invalid)
    }

    /// Independent handle on the same file.
    pub fn reopen(&self) -> KResult<Arc<MappedFile>> {
        let handle = self
            .handle
            .lock()
            .as_ref()
            .ok_or(KError::Invalid)?
            .reopen()?;
        Ok(Arc::new(MappedFile::new(handle)))
    }

    pub fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }

    /// Idempotent.
    pub fn close(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.close();
        }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fills `kva` with `read_bytes` from the file and zeros after them.
pub(super) fn load_slice(vm: &Vm, slice: &FileSlice, kva: Kva) -> KResult<()> {
    let mut buf = vec![0u8; PAGE_SIZE];
    let n = slice.file.read_at(slice.offset, &mut buf[..slice.read_bytes])?;
    if n != slice.read_bytes {
        log::warn!(
            "mmap: short read at {:#x}: {} of {} bytes",
            slice.offset,
            n,
            slice.read_bytes
        );
        return Err(KError::IO);
    }
    vm.palloc.write(kva, 0, &buf);
    Ok(())
}

pub(super) fn swap_in(vm: &Vm, page: &mut Page, kva: Kva) -> KResult<()> {
    let PageKind::File(fp) = &page.kind else {
        return Err(KError::Invalid);
    };
    load_slice(vm, &fp.slice, kva)
}

/// Writes the page back if the hardware marked it dirty, then clears the bit.
pub(super) fn write_back(vm: &Vm, page: &Page) -> KResult<()> {
    let (PageKind::File(fp), Some(kva)) = (&page.kind, page.frame) else {
        return Ok(());
    };
    if !page.mapper().is_dirty(page.va) {
        return Ok(());
    }
    let slice = &fp.slice;
    let mut buf = vec![0u8; slice.read_bytes];
    vm.palloc.read(kva, 0, &mut buf);
    let n = slice.file.write_at(slice.offset, &buf)?;
    if n != slice.read_bytes {
        return Err(KError::IO);
    }
    page.mapper().set_dirty(page.va, false);
    log::debug!(
        "mmap: wrote back {} bytes at {:#x} for {:#x}",
        n,
        slice.offset,
        page.va.as_u64()
    );
    Ok(())
}

/// Unmaps first so the page cannot change under the writeback; the dirty bit
/// survives the unmap.
pub(super) fn swap_out(vm: &Vm, page: &mut Page) -> KResult<()> {
    let Some(kva) = page.frame else {
        return Err(KError::Invalid);
    };
    page.mapper().clear(page.va);
    if let Err(e) = write_back(vm, page) {
        page.mapper().map(page.va, kva, page.writable)?;
        page.mapper().set_dirty(page.va, true);
        return Err(e);
    }
    Ok(())
}

pub(super) fn destroy(vm: &Vm, page: &mut Page) -> KResult<()> {
    let flushed = write_back(vm, page);
    if let Err(e) = &flushed {
        log::warn!("mmap: writeback of {:#x} failed: {}", page.va.as_u64(), e);
    }
    if let Some(kva) = page.frame.take() {
        page.mapper().clear(page.va);
        vm.frames.release(kva, page.space(), page.va);
    }
    if let PageKind::File(fp) = &page.kind {
        if fp.slice.last {
            fp.slice.file.close();
        }
    }
    flushed
}

impl Vm {
    /// Maps `length` bytes of `file` starting at `offset` to `addr`. Pages are
    /// loaded lazily; the tail of the last page past the file is zero.
    pub fn mmap(
        &self,
        space: &mut AddressSpace,
        addr: VirtAddr,
        length: usize,
        writable: bool,
        file: &dyn File,
        offset: u64,
    ) -> KResult<VirtAddr> {
        let page = PAGE_SIZE as u64;
        if addr.as_u64() == 0
            || !addr.is_aligned(page)
            || length == 0
            || offset % page != 0
            || file.length() == 0
        {
            return Err(KError::Invalid);
        }
        let end = addr
            .as_u64()
            .checked_add(length as u64)
            .filter(|&end| end <= USER_TOP)
            .ok_or(KError::Invalid)?;
        let stack = &self.config;
        if addr.as_u64() < stack.stack_top && end > stack.stack_bottom() {
            return Err(KError::Invalid);
        }

        let pages = (length + PAGE_SIZE - 1) / PAGE_SIZE;
        let vas: Vec<VirtAddr> = (0..pages).map(|i| addr + (i * PAGE_SIZE) as u64).collect();
        if vas.iter().any(|&va| space.spt().contains(va)) {
            return Err(KError::AlreadyExists);
        }

        let mapped = Arc::new(MappedFile::new(file.reopen()?));
        let file_len = mapped.length()?;
        let mut declared = Vec::with_capacity(pages);
        for (i, &va) in vas.iter().enumerate() {
            let page_ofs = offset + (i * PAGE_SIZE) as u64;
            let in_mapping = (length - i * PAGE_SIZE).min(PAGE_SIZE);
            let read_bytes = file_len
                .saturating_sub(page_ofs)
                .min(in_mapping as u64) as usize;
            let slice = FileSlice::new(mapped.clone(), page_ofs, read_bytes, i + 1 == pages);
            let res = self.alloc_page_with_initializer(
                space,
                VmType::File,
                va,
                writable,
                PageInit::Mapped(slice),
            );
            if let Err(e) = res {
                for va in declared {
                    space.spt_mut().remove(va);
                }
                mapped.close();
                return Err(e);
            }
            declared.push(va);
        }

        log::debug!(
            "mmap: {:#x}..{:#x} offset {:#x} ({} pages)",
            addr.as_u64(),
            end,
            offset,
            pages
        );
        Ok(addr)
    }

    /// Removes the mapping starting at `addr`, writing back dirty pages.
    /// `addr` must be the first page of its mapping. Stops at the first
    /// address with no page of this mapping. Every page is torn down even
    /// when a writeback fails; the first failure is returned.
    pub fn munmap(&self, space: &mut AddressSpace, addr: VirtAddr) -> KResult<()> {
        let first = space.spt().find(addr).ok_or(KError::NotFound)?;
        let mapped = first.lock().mapping().cloned().ok_or(KError::Invalid)?;

        let mut va = addr.align_down(PAGE_SIZE as u64);
        let page = PAGE_SIZE as u64;
        if va.as_u64() >= page && same_mapping(space, va - page, &mapped) {
            return Err(KError::Invalid);
        }

        let mut pages = 0usize;
        let mut result = Ok(());
        while same_mapping(space, va, &mapped) {
            if let Some(page_ref) = space.spt_mut().remove(va) {
                let res = self.destroy_page(&mut page_ref.lock());
                if result.is_ok() {
                    result = res;
                }
            }
            pages += 1;
            if va.as_u64() + page >= USER_TOP {
                break;
            }
            va += page;
        }
        mapped.close();

        log::debug!("munmap: {:#x} ({} pages)", addr.as_u64(), pages);
        result
    }
}

/// Whether the page at `va` belongs to `mapped`.
fn same_mapping(space: &AddressSpace, va: VirtAddr, mapped: &Arc<MappedFile>) -> bool {
    let Some(page) = space.spt().find(va) else {
        return false;
    };
    let same = page
        .lock()
        .mapping()
        .is_some_and(|f| Arc::ptr_eq(f, mapped));
    same
}
