//! The completion path.
//!
//! Child completions arrive on member callback threads. Each decrements the
//! shared sibling counter; the last one handles the parent: reconstruction
//! for degraded reads, the region count decrement and delayed-release arming
//! for writes, then the caller's completion callback. This path never takes
//! the region lock and never allocates beyond the retire record.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use crate::device::DeviceInner;
use crate::io::{Direction, EndIo, IoError, IoResult, PageVec};
use crate::parity;
use crate::proto::outbound::Retire;
use crate::region::Region;

/// Shared completion context of a striped request: the hook threading the
/// parent to its children.
pub(crate) struct ParentIo {
    pub dev: Arc<DeviceInner>,
    pub dir: Direction,
    /// Original sector/length, for diagnostics.
    pub sector: u64,
    pub len: usize,
    /// Fragment size in bytes, snapshot of the device geometry.
    pub frag_bytes: usize,
    /// Outstanding children. The last decrement to zero owns the parent.
    pub remaining: AtomicI32,
    /// First child error wins; the parent completes with it.
    pub error: OnceLock<IoError>,
    pub pages: Arc<PageVec>,
    /// Freshly allocated parity fragments (write parity source, or degraded
    /// read destination). Freed when the parent drops.
    pub parity: Option<PageVec>,
    /// The owned region, for writes.
    pub region: Option<Arc<Region>>,
    /// Dead data column to rebuild from parity, for degraded reads.
    pub reconstruct: Option<usize>,
    pub endio: Mutex<Option<EndIo>>,
}

/// Called by [`crate::io::ChildIo::complete`] for every child.
pub(crate) fn child_complete(parent: &Arc<ParentIo>, status: IoResult) {
    if let Err(e) = status {
        let _ = parent.error.set(e);
    }
    if parent.remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }

    // Last sibling: the parent is ours now.
    let status: IoResult = match parent.error.get() {
        Some(e) => Err(e.clone()),
        None => Ok(()),
    };
    trace!(
        "{} {:x}/{:x} complete: {:?}",
        parent.dir.as_str(),
        parent.sector,
        parent.len,
        status
    );

    match parent.dir {
        Direction::Read => {
            if status.is_ok() {
                if let Some(column) = parent.reconstruct {
                    reconstruct_blocks(parent, column);
                }
            }
        }
        Direction::Write => {
            if let Some(region) = &parent.region {
                if region.put_test_zero() {
                    arm_release(&parent.dev, region.clone());
                }
            }
        }
    }

    let endio = parent.endio.lock().unwrap().take();
    if let Some(endio) = endio {
        endio(status);
    }
}

/// Rebuild the dead data column of every block from the parity fragments.
/// Runs with exclusive access: all siblings have completed.
fn reconstruct_blocks(parent: &Arc<ParentIo>, column: usize) {
    let frags = parent.dev.frags();
    let parity = parent
        .parity
        .as_ref()
        .expect("degraded read without parity pages");
    for (page, parity_page) in parent.pages.iter().zip(parity.iter()) {
        let block = unsafe { page.words_mut() };
        let lanes = unsafe { parity_page.words() };
        parity::reconstruct(block, lanes, column, frags);
    }
}

/// Arm the delayed release for a region whose last in-flight write just
/// completed.
///
/// Releasing immediately would make back-to-back writes repeat the grant
/// round trip, so the retire record carries a deadline and the outbound
/// worker sits on it. The region count is re-raised to 1 so the record stays
/// pinned; the worker drops that hold and only releases if it observes the
/// resulting zero. A destroy-hold keeps the device from being torn down
/// under the pending retire.
pub(crate) fn arm_release(dev: &Arc<DeviceInner>, region: Arc<Region>) {
    region.get();
    dev.destroy_hold.acquire();
    let due = Instant::now() + dev.opts.release_delay;
    trace!(
        "delay region {:x} release, count {}",
        region.regnum(),
        region.count()
    );
    dev.releases.lock().unwrap().push_back(Retire { region, due });
    dev.work.signal();
}
