use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::block::{check_io_args, BlockDevice};
use crate::util::{KError, KResult};

/// Dispositivo de bloco em RAM (ótimo para testes do swap).
///
/// Implementação *thread-safe* via lock interno. Conta as operações de
/// leitura/escrita por bloco para que os testes possam verificar o volume de I/O.
pub struct RamDisk {
    block_size: u32,
    data: Mutex<Vec<u8>>,
    blocks_read: AtomicU64,
    blocks_written: AtomicU64,
}

impl RamDisk {
    pub fn new(block_size: u32, num_blocks: u64) -> Self {
        let total = (block_size as u64 * num_blocks) as usize;
        let mut v = Vec::with_capacity(total);
        v.resize(total, 0);
        Self {
            block_size,
            data: Mutex::new(v),
            blocks_read: AtomicU64::new(0),
            blocks_written: AtomicU64::new(0),
        }
    }

    /// Blocos lidos desde a criação.
    pub fn blocks_read(&self) -> u64 {
        self.blocks_read.load(Ordering::Relaxed)
    }

    /// Blocos escritos desde a criação.
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }

    fn range(&self, lba: u64, count: u32) -> KResult<(usize, usize)> {
        let start = (lba as u128) * (self.block_size as u128);
        let len = (count as u128) * (self.block_size as u128);
        let end = start + len;

        let g = self.data.lock();
        if end > g.len() as u128 {
            return Err(KError::OutOfRange);
        }
        Ok((start as usize, end as usize))
    }
}

impl BlockDevice for RamDisk {
    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn num_blocks(&self) -> u64 {
        let g = self.data.lock();
        (g.len() as u64) / (self.block_size as u64)
    }

    fn read_blocks(&self, lba: u64, count: u32, out: &mut [u8]) -> KResult<()> {
        check_io_args(self.block_size, count, out.len())?;
        let (s, e) = self.range(lba, count)?;
        let g = self.data.lock();
        out.copy_from_slice(&g[s..e]);
        self.blocks_read.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    fn write_blocks(&self, lba: u64, count: u32, data: &[u8]) -> KResult<()> {
        check_io_args(self.block_size, count, data.len())?;
        let (s, e) = self.range(lba, count)?;
        let mut g = self.data.lock();
        g[s..e].copy_from_slice(data);
        self.blocks_written.fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_back_written_blocks() {
        let disk = RamDisk::new(512, 4);
        let data = [0xAB; 1024];
        disk.write_blocks(2, 2, &data).unwrap();

        let mut out = [0u8; 1024];
        disk.read_blocks(2, 2, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(disk.blocks_written(), 2);
        assert_eq!(disk.blocks_read(), 2);
    }

    #[test]
    fn test_rejects_out_of_range() {
        let disk = RamDisk::new(512, 4);
        let mut out = [0u8; 512];
        assert_eq!(disk.read_blocks(4, 1, &mut out), Err(KError::OutOfRange));
        assert_eq!(disk.num_blocks(), 4);
    }
}
