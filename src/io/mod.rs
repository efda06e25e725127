//! Request model: logical I/O requests, block buffers, completion status.

use std::cell::UnsafeCell;
use std::sync::Arc;

pub(crate) mod child;
pub(crate) mod completion;
pub(crate) mod dispatch;
pub(crate) mod member;

pub use child::{ChildIo, MemberDevice};
pub use member::FileMember;

/// Sectors are 512 bytes.
pub const SECTOR_SHIFT: u32 = 9;

/// Direction of a logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// Completion status of a logical request.
pub type IoResult = Result<(), IoError>;

/// Why a logical request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// Misaligned write, or a misaligned read spanning more than one block.
    #[error("misaligned request")]
    Misaligned,
    /// A member device failed a child request; the parent fails with the
    /// same status.
    #[error("member device error: {0:?}")]
    Member(std::io::ErrorKind),
}

/// Completion callback of a logical request. Invoked exactly once, from the
/// completion context of the last child; it must not block.
pub type EndIo = Box<dyn FnOnce(IoResult) + Send + 'static>;

/// A block-sized buffer shared between a parent request and its striped
/// children.
///
/// Backed by 64-bit words so the parity codec can run on lanes directly.
/// Striped children of a read write *disjoint* fragment columns of the same
/// buffer concurrently, which is why access goes through an `UnsafeCell`:
/// the raw accessors are sound as long as no two live borrows overlap a byte
/// range, which the striping geometry guarantees.
pub struct PageBuf {
    words: UnsafeCell<Box<[u64]>>,
}

// Children on different member threads access disjoint columns.
unsafe impl Send for PageBuf {}
unsafe impl Sync for PageBuf {}

impl PageBuf {
    /// A zeroed buffer of `len` bytes. `len` must be a multiple of the lane
    /// size.
    pub fn new(len: usize) -> Self {
        assert_eq!(len % crate::parity::LANE_BYTES, 0);
        Self {
            words: UnsafeCell::new(vec![0u64; len / crate::parity::LANE_BYTES].into_boxed_slice()),
        }
    }

    /// A buffer holding a copy of `data`.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.as_bytes_mut().copy_from_slice(data);
        buf
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        // The box itself (pointer and length) is never mutated, only the
        // pointed-to words are.
        unsafe { (&*self.words.get()).len() * crate::parity::LANE_BYTES }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive word view. Safe: `&mut self` proves exclusivity.
    pub fn as_words_mut(&mut self) -> &mut [u64] {
        self.words.get_mut()
    }

    /// Exclusive byte view. Safe: `&mut self` proves exclusivity.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.words.get_mut())
    }

    /// # Safety
    /// No concurrent mutable access to any part of the buffer.
    pub(crate) unsafe fn words(&self) -> &[u64] {
        &*self.words.get()
    }

    /// # Safety
    /// The caller must have exclusive access to the whole buffer, e.g. on
    /// the last-sibling completion path.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn words_mut(&self) -> &mut [u64] {
        &mut *self.words.get()
    }

    /// # Safety
    /// As [`Self::words`].
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.words())
    }

    /// # Safety
    /// The caller must ensure no other live access overlaps `offset..offset+len`.
    /// Striped children rely on this for their disjoint fragment columns.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn column_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut *self.words.get());
        &mut bytes[offset..offset + len]
    }

    /// Copy the contents out. The buffer must not be attached to an
    /// in-flight request; completion of the request makes its memory
    /// visible to the caller.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        unsafe { self.bytes().to_vec() }
    }
}

/// The page vector of a request: one [`PageBuf`] per block.
pub type PageVec = Vec<PageBuf>;

/// An incoming logical I/O spanning a single region.
///
/// The caller keeps a clone of the page `Arc` to read data back after the
/// completion callback fires.
pub struct IoRequest {
    pub(crate) dir: Direction,
    pub(crate) sector: u64,
    pub(crate) pages: Arc<PageVec>,
    pub(crate) len: usize,
    pub(crate) endio: EndIo,
}

impl IoRequest {
    pub fn new(dir: Direction, sector: u64, pages: Arc<PageVec>, endio: EndIo) -> Self {
        let len = pages.iter().map(PageBuf::len).sum();
        Self {
            dir,
            sector,
            pages,
            len,
            endio,
        }
    }

    pub fn read(sector: u64, pages: Arc<PageVec>, endio: EndIo) -> Self {
        Self::new(Direction::Read, sector, pages, endio)
    }

    pub fn write(sector: u64, pages: Arc<PageVec>, endio: EndIo) -> Self {
        Self::new(Direction::Write, sector, pages, endio)
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagebuf_round_trip() {
        let data: Vec<u8> = (0..64u8).collect();
        let buf = PageBuf::from_bytes(&data);
        assert_eq!(buf.len(), 64);
        assert_eq!(buf.copy_to_vec(), data);
    }

    #[test]
    fn pagebuf_column_writes_are_disjoint() {
        let buf = PageBuf::new(32);
        unsafe {
            buf.column_mut(0, 16).fill(0xaa);
            buf.column_mut(16, 16).fill(0xbb);
        }
        let out = buf.copy_to_vec();
        assert!(out[..16].iter().all(|&b| b == 0xaa));
        assert!(out[16..].iter().all(|&b| b == 0xbb));
    }

    #[test]
    fn request_len_sums_pages() {
        let pages = Arc::new(vec![PageBuf::new(4096), PageBuf::new(4096)]);
        let req = IoRequest::read(0, pages, Box::new(|_| ()));
        assert_eq!(req.len(), 8192);
        assert_eq!(req.direction(), Direction::Read);
    }
}
