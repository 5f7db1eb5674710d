//! File abstraction consumed by file-backed memory.
//!
//! The VM layer only needs positioned byte I/O on an open file plus the
//! ability to reopen it privately, so mappings do not share a file position
//! or lifetime with the descriptor they were created from.

use alloc::boxed::Box;

use crate::util::KResult;

pub mod memfile;

pub use memfile::{MemFile, MemInode};

/// An open file.
pub trait File: Send {
    /// Moves the file position to `pos` bytes from the start.
    fn seek(&mut self, pos: u64);

    /// Reads up to `buf.len()` bytes at the current position, advancing it.
    /// Returns the number of bytes read, 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> KResult<usize>;

    /// Writes up to `data.len()` bytes at the current position, advancing it.
    /// Returns the number of bytes written.
    fn write(&mut self, data: &[u8]) -> KResult<usize>;

    /// File size in bytes.
    fn length(&self) -> u64;

    /// Opens a new, independent handle to the same file.
    fn reopen(&self) -> KResult<Box<dyn File>>;

    /// Closes the handle.
    fn close(self: Box<Self>);
}
