//! In-memory files, backed by a shared inode in the style of tmpfs.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use super::File;
use crate::util::KResult;

/// Shared contents of a [`MemFile`]. Every handle obtained through
/// [`File::reopen`] points at the same inode.
pub struct MemInode {
    data: RwLock<Vec<u8>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    writes: Mutex<Vec<(u64, usize)>>,
}

impl MemInode {
    /// Snapshot of the file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// `(offset, len)` of every `write` call, in order.
    pub fn write_log(&self) -> Vec<(u64, usize)> {
        self.writes.lock().clone()
    }

    /// Handles opened on this inode, including the first one.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Handles currently open.
    pub fn open_handles(&self) -> usize {
        self.opens().saturating_sub(self.closes())
    }
}

/// Open handle on a [`MemInode`].
///
/// Like the on-disk filesystems, writes never grow the file: bytes past the
/// end are dropped and the short count is returned.
pub struct MemFile {
    inode: Arc<MemInode>,
    pos: u64,
}

impl MemFile {
    pub fn create(data: &[u8]) -> Self {
        let inode = Arc::new(MemInode {
            data: RwLock::new(data.to_vec()),
            opens: AtomicUsize::new(1),
            closes: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        });
        Self { inode, pos: 0 }
    }

    pub fn inode(&self) -> Arc<MemInode> {
        self.inode.clone()
    }
}

impl File for MemFile {
    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let data = self.inode.data.read();
        let start = (self.pos as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, src: &[u8]) -> KResult<usize> {
        self.inode.writes.lock().push((self.pos, src.len()));
        let mut data = self.inode.data.write();
        let start = (self.pos as usize).min(data.len());
        let n = src.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&src[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn length(&self) -> u64 {
        self.inode.data.read().len() as u64
    }

    fn reopen(&self) -> KResult<Box<dyn File>> {
        self.inode.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemFile {
            inode: self.inode.clone(),
            pos: 0,
        }))
    }

    fn close(self: Box<Self>) {
        self.inode.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_at_position() {
        let mut f = MemFile::create(b"hello world");
        f.seek(6);
        let mut buf = [0u8; 16];
        assert_eq!(f.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"world");

        f.seek(0);
        assert_eq!(f.write(b"J").unwrap(), 1);
        assert_eq!(f.inode().contents(), b"Jello world");
        assert_eq!(f.inode().write_log(), alloc::vec![(0, 1)]);
    }

    #[test]
    fn test_write_does_not_grow() {
        let mut f = MemFile::create(b"abc");
        f.seek(2);
        assert_eq!(f.write(b"xyz").unwrap(), 1);
        assert_eq!(f.length(), 3);
        assert_eq!(f.inode().contents(), b"abx");
    }

    #[test]
    fn test_reopen_shares_inode() {
        let f = MemFile::create(b"data");
        let inode = f.inode();
        let g = f.reopen().unwrap();
        assert_eq!(inode.opens(), 2);
        assert_eq!(g.length(), 4);
        g.close();
        Box::new(f).close();
        assert_eq!(inode.closes(), 2);
        assert_eq!(inode.open_handles(), 0);
    }
}
