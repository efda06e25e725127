//! Child requests and the member-device seam.
//!
//! A [`ChildIo`] is the per-member slice of a striped parent request. The
//! member device moves the child's bytes with [`ChildIo::payload`] /
//! [`ChildIo::fill`] and reports the outcome with [`ChildIo::complete`],
//! which runs the shared completion path. Each child carries an explicit
//! context record (the `Arc` to the parent) instead of aliasing fields of
//! the request the way a kernel driver would.

use std::sync::Arc;

use crate::io::completion::{self, ParentIo};
use crate::io::Direction;

/// One backing device of the array.
///
/// `submit` must arrange for `io.complete(..)` to be called exactly once.
/// Completion may run on any thread, including inline on the submitting
/// thread; it runs the crate's completion path, which never blocks on the
/// region lock.
pub trait MemberDevice: Send + Sync {
    fn submit(&self, io: ChildIo);
}

/// What part of the parent a child carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChildKind {
    /// One data fragment column per block.
    Data { column: usize },
    /// The parity fragment of each block, in the parent's parity pages.
    Parity,
    /// The whole request, unstriped (two-member balanced reads).
    Whole,
}

/// A per-member I/O carved from a parent request.
pub struct ChildIo {
    parent: Arc<ParentIo>,
    kind: ChildKind,
    member: usize,
    sector: u64,
    len: usize,
}

impl ChildIo {
    pub(crate) fn new(
        parent: Arc<ParentIo>,
        kind: ChildKind,
        member: usize,
        sector: u64,
        len: usize,
    ) -> Self {
        Self {
            parent,
            kind,
            member,
            sector,
            len,
        }
    }

    pub fn direction(&self) -> Direction {
        self.parent.dir
    }

    /// Index of the member device this child targets.
    pub fn member_index(&self) -> usize {
        self.member
    }

    /// Starting sector on the member device.
    pub fn sector(&self) -> u64 {
        self.sector
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gather the bytes to store, for a write child.
    pub fn payload(&self) -> Vec<u8> {
        debug_assert_eq!(self.parent.dir, Direction::Write);
        let mut out = Vec::with_capacity(self.len);
        self.for_each_segment(|page, offset, len| {
            // Parent data pages are not mutated while children are in
            // flight, and parity pages are written before submission.
            out.extend_from_slice(unsafe { &page.bytes()[offset..offset + len] });
        });
        debug_assert_eq!(out.len(), self.len);
        out
    }

    /// Scatter bytes read from the member into the parent, for a read child.
    pub fn fill(&self, data: &[u8]) {
        debug_assert_eq!(self.parent.dir, Direction::Read);
        assert_eq!(data.len(), self.len);
        let mut consumed = 0;
        self.for_each_segment(|page, offset, len| {
            // Sibling children fill disjoint columns.
            unsafe { page.column_mut(offset, len) }
                .copy_from_slice(&data[consumed..consumed + len]);
            consumed += len;
        });
    }

    /// Report the member's outcome and run the completion path. Consumes the
    /// child; must be called exactly once.
    pub fn complete(self, result: std::io::Result<()>) {
        let status = result.map_err(|e| {
            warn!(
                "member {} {} {:x}/{:x} error: {}",
                self.member,
                self.parent.dir.as_str(),
                self.sector,
                self.len,
                e
            );
            crate::io::IoError::Member(e.kind())
        });
        completion::child_complete(&self.parent, status);
    }

    /// Walk this child's (page, offset, len) segments in member order.
    fn for_each_segment(&self, mut f: impl FnMut(&crate::io::PageBuf, usize, usize)) {
        match self.kind {
            ChildKind::Data { column } => {
                let frag = self.parent.frag_bytes;
                for page in self.parent.pages.iter() {
                    f(page, column * frag, frag);
                }
            }
            ChildKind::Parity => {
                let parity = self
                    .parent
                    .parity
                    .as_ref()
                    .expect("parity child without parity pages");
                for page in parity.iter() {
                    f(page, 0, page.len());
                }
            }
            ChildKind::Whole => {
                for page in self.parent.pages.iter() {
                    f(page, 0, page.len());
                }
            }
        }
    }
}
