//! Swap Subsystem
//!
//! Provides the swap slot table used by anonymous pages:
//! - Fixed-size slots on a block device, one page each
//! - Slot allocation with a bitmap allocator (1 = free, 0 = in use)
//! - Page-sized transfers between frames and slots as sector operations
//!
//! The bitmap and all device I/O are serialized by one swap lock, separate from
//! the frame table lock so device latency never stalls frame bookkeeping.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;
use thiserror::Error;

use super::phys::{Kva, PhysAllocator};
use super::PAGE_SIZE;
use crate::storage::BlockDevice;
use crate::util::KError;

/// Swap slot identifier (index into the slot table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Swap statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwapStats {
    /// Total swap space (slots)
    pub total: u64,
    /// Free slots
    pub free: u64,
    /// Slots in use
    pub used: u64,
    /// Pages swapped in
    pub pages_swapped_in: u64,
    /// Pages swapped out
    pub pages_swapped_out: u64,
}

/// Swap error types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SwapError {
    /// No swap slot available
    #[error("no swap space")]
    NoSwapSpace,
    /// Slot index outside the table or not allocated
    #[error("invalid swap slot")]
    InvalidSlot,
    /// Device block size does not divide the page size
    #[error("unsupported swap device")]
    InvalidDevice,
    /// I/O error
    #[error("swap i/o error")]
    IoError,
}

impl From<SwapError> for KError {
    fn from(e: SwapError) -> Self {
        match e {
            SwapError::NoSwapSpace => KError::NoSwapSpace,
            SwapError::InvalidSlot | SwapError::InvalidDevice => KError::Invalid,
            SwapError::IoError => KError::IO,
        }
    }
}

struct SwapState {
    /// One bit per slot; set = free
    bitmap: Vec<u64>,
    stats: SwapStats,
}

impl SwapState {
    fn is_free(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Find the first free slot, mark it used
    fn scan_and_flip(&mut self) -> Option<usize> {
        for (wi, word) in self.bitmap.iter_mut().enumerate() {
            if *word != 0 {
                let bit = word.trailing_zeros() as usize;
                *word &= !(1 << bit);
                self.stats.free -= 1;
                self.stats.used += 1;
                return Some(wi * 64 + bit);
            }
        }
        None
    }

    fn release(&mut self, idx: usize) -> bool {
        if self.is_free(idx) {
            return false;
        }
        self.bitmap[idx / 64] |= 1 << (idx % 64);
        self.stats.free += 1;
        self.stats.used -= 1;
        true
    }
}

/// Swap slot table over one swap device
pub struct SwapTable {
    device: Arc<dyn BlockDevice>,
    /// Device blocks per slot
    blocks_per_slot: u64,
    total_slots: usize,
    inner: Mutex<SwapState>,
}

impl SwapTable {
    /// Build the slot table sized to the device capacity. Trailing blocks
    /// that do not fill a whole slot are unused.
    pub fn new(device: Arc<dyn BlockDevice>) -> Result<Self, SwapError> {
        let block_size = device.block_size() as usize;
        if block_size == 0 || PAGE_SIZE % block_size != 0 {
            return Err(SwapError::InvalidDevice);
        }
        let blocks_per_slot = (PAGE_SIZE / block_size) as u64;
        let total_slots = (device.num_blocks() / blocks_per_slot) as usize;

        // All slots start free; bits past the last slot stay clear
        let words = (total_slots + 63) / 64;
        let mut bitmap = vec![0u64; words];
        for idx in 0..total_slots {
            bitmap[idx / 64] |= 1 << (idx % 64);
        }

        Ok(Self {
            device,
            blocks_per_slot,
            total_slots,
            inner: Mutex::new(SwapState {
                bitmap,
                stats: SwapStats {
                    total: total_slots as u64,
                    free: total_slots as u64,
                    ..SwapStats::default()
                },
            }),
        })
    }

    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    /// Allocate a swap slot
    pub fn allocate_slot(&self) -> Result<SwapSlot, SwapError> {
        let mut state = self.inner.lock();
        state
            .scan_and_flip()
            .map(|idx| SwapSlot(idx as u32))
            .ok_or(SwapError::NoSwapSpace)
    }

    /// Free a swap slot. Freeing a free slot is a caller bug; it is logged
    /// and otherwise ignored.
    pub fn free_slot(&self, slot: SwapSlot) {
        if slot.index() >= self.total_slots {
            log::warn!("swap: free of out-of-range slot {}", slot.index());
            return;
        }
        if !self.inner.lock().release(slot.index()) {
            log::warn!("swap: double free of slot {}", slot.index());
        }
    }

    /// Check if slot is free
    pub fn is_free(&self, slot: SwapSlot) -> bool {
        slot.index() < self.total_slots && self.inner.lock().is_free(slot.index())
    }

    /// Swap out: take a slot and write the frame to it
    pub fn store(&self, palloc: &dyn PhysAllocator, kva: Kva) -> Result<SwapSlot, SwapError> {
        let mut state = self.inner.lock();
        let idx = state.scan_and_flip().ok_or(SwapError::NoSwapSpace)?;
        let slot = SwapSlot(idx as u32);

        if let Err(e) = self.write_sectors(slot, palloc, kva) {
            state.release(idx);
            return Err(e);
        }
        state.stats.pages_swapped_out += 1;
        log::debug!("swap: kva {:#x} -> slot {}", kva.as_u64(), idx);
        Ok(slot)
    }

    /// Swap in: read the slot into the frame and free the slot
    pub fn load(&self, slot: SwapSlot, palloc: &dyn PhysAllocator, kva: Kva) -> Result<(), SwapError> {
        let mut state = self.inner.lock();
        self.check_allocated(&state, slot)?;
        self.read_sectors(slot, palloc, kva)?;
        state.release(slot.index());
        state.stats.pages_swapped_in += 1;
        log::debug!("swap: slot {} -> kva {:#x}", slot.index(), kva.as_u64());
        Ok(())
    }

    /// Read the slot into the frame, keeping the slot allocated
    pub fn peek(&self, slot: SwapSlot, palloc: &dyn PhysAllocator, kva: Kva) -> Result<(), SwapError> {
        let state = self.inner.lock();
        self.check_allocated(&state, slot)?;
        self.read_sectors(slot, palloc, kva)
    }

    /// Get swap statistics
    pub fn stats(&self) -> SwapStats {
        self.inner.lock().stats
    }

    fn check_allocated(&self, state: &SwapState, slot: SwapSlot) -> Result<(), SwapError> {
        if slot.index() >= self.total_slots || state.is_free(slot.index()) {
            return Err(SwapError::InvalidSlot);
        }
        Ok(())
    }

    /// First device block of a slot
    fn slot_to_block(&self, slot: SwapSlot) -> u64 {
        slot.index() as u64 * self.blocks_per_slot
    }

    fn write_sectors(&self, slot: SwapSlot, palloc: &dyn PhysAllocator, kva: Kva) -> Result<(), SwapError> {
        let bs = self.device.block_size() as usize;
        let mut sector = vec![0u8; bs];
        let base = self.slot_to_block(slot);
        for i in 0..self.blocks_per_slot {
            palloc.read(kva, i as usize * bs, &mut sector);
            self.device
                .write_blocks(base + i, 1, &sector)
                .map_err(|_| SwapError::IoError)?;
        }
        Ok(())
    }

    fn read_sectors(&self, slot: SwapSlot, palloc: &dyn PhysAllocator, kva: Kva) -> Result<(), SwapError> {
        let bs = self.device.block_size() as usize;
        let mut sector = vec![0u8; bs];
        let base = self.slot_to_block(slot);
        for i in 0..self.blocks_per_slot {
            self.device
                .read_blocks(base + i, 1, &mut sector)
                .map_err(|_| SwapError::IoError)?;
            palloc.write(kva, i as usize * bs, &sector);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::phys::{BitmapFrameAllocator, PallocFlags};
    use crate::storage::{RamDisk, SECTOR_SIZE};

    const SECTORS_PER_SLOT: u64 = (PAGE_SIZE / SECTOR_SIZE) as u64;

    fn table(slots: u64) -> (Arc<RamDisk>, SwapTable) {
        let disk = Arc::new(RamDisk::new(SECTOR_SIZE as u32, slots * SECTORS_PER_SLOT));
        let swap = SwapTable::new(disk.clone()).unwrap();
        (disk, swap)
    }

    #[test]
    fn test_sized_from_device() {
        let disk = Arc::new(RamDisk::new(512, 8 * 3 + 5));
        let swap = SwapTable::new(disk).unwrap();
        assert_eq!(swap.total_slots(), 3);
        assert_eq!(swap.stats().free, 3);
    }

    #[test]
    fn test_rejects_odd_block_size() {
        let disk = Arc::new(RamDisk::new(3000, 10));
        assert!(matches!(SwapTable::new(disk), Err(SwapError::InvalidDevice)));
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let (_disk, swap) = table(2);
        let a = swap.allocate_slot().unwrap();
        let b = swap.allocate_slot().unwrap();
        assert_ne!(a, b);
        assert_eq!(swap.allocate_slot(), Err(SwapError::NoSwapSpace));

        swap.free_slot(a);
        assert!(swap.is_free(a));
        assert_eq!(swap.allocate_slot(), Ok(a));
    }

    #[test]
    fn test_double_free_keeps_counts() {
        let (_disk, swap) = table(2);
        let a = swap.allocate_slot().unwrap();
        swap.free_slot(a);
        swap.free_slot(a);
        let stats = swap.stats();
        assert_eq!(stats.free, 2);
        assert_eq!(stats.used, 0);
    }

    #[test]
    fn test_store_and_load_page() {
        let (disk, swap) = table(4);
        let pa = BitmapFrameAllocator::new(2);
        let src = pa.alloc_page(PallocFlags::ZERO).unwrap();
        let dst = pa.alloc_page(PallocFlags::ZERO).unwrap();
        let pattern: Vec<u8> = (0..PAGE_SIZE).map(|i| (i * 7 % 251) as u8).collect();
        pa.write(src, 0, &pattern);

        let slot = swap.store(&pa, src).unwrap();
        assert_eq!(disk.blocks_written(), SECTORS_PER_SLOT);
        assert!(!swap.is_free(slot));

        swap.load(slot, &pa, dst).unwrap();
        assert_eq!(disk.blocks_read(), SECTORS_PER_SLOT);
        assert!(swap.is_free(slot));

        let mut back = vec![0u8; PAGE_SIZE];
        pa.read(dst, 0, &mut back);
        assert_eq!(back, pattern);

        let stats = swap.stats();
        assert_eq!(stats.pages_swapped_out, 1);
        assert_eq!(stats.pages_swapped_in, 1);
    }

    #[test]
    fn test_load_of_free_slot_fails() {
        let (_disk, swap) = table(1);
        let pa = BitmapFrameAllocator::new(1);
        let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
        assert_eq!(swap.load(SwapSlot::new(0), &pa, kva), Err(SwapError::InvalidSlot));
        assert_eq!(swap.load(SwapSlot::new(9), &pa, kva), Err(SwapError::InvalidSlot));
    }

    #[test]
    fn test_store_without_space() {
        let (disk, swap) = table(0);
        let pa = BitmapFrameAllocator::new(1);
        let kva = pa.alloc_page(PallocFlags::ZERO).unwrap();
        assert_eq!(swap.store(&pa, kva), Err(SwapError::NoSwapSpace));
        assert_eq!(disk.blocks_written(), 0);
    }

    #[test]
    fn test_peek_keeps_slot() {
        let (_disk, swap) = table(1);
        let pa = BitmapFrameAllocator::new(2);
        let src = pa.alloc_page(PallocFlags::ZERO).unwrap();
        let dst = pa.alloc_page(PallocFlags::ZERO).unwrap();
        pa.write(src, 0, b"swap");
        let slot = swap.store(&pa, src).unwrap();

        swap.peek(slot, &pa, dst).unwrap();
        assert!(!swap.is_free(slot));
        let mut buf = [0u8; 4];
        pa.read(dst, 0, &mut buf);
        assert_eq!(&buf, b"swap");
    }
}
