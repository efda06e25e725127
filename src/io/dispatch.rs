//! The I/O dispatcher.
//!
//! Entry point for requests from the host block layer. A request is deferred
//! before the handshake, bounced when it is a short misaligned read, balanced
//! to a single member when it is a read of a synced region on a two-member
//! array, striped across the data members otherwise, and, for writes, either
//! submitted under the region's grant or parked on the region's wait list
//! while a grant query goes out.
//!
//! Life cycle of a raid write: if it cannot be submitted immediately it is
//! parked on the region record and a `REQUEST_WRITE` is queued to the
//! outbound worker. The inbound reader receives the grant, finds the region
//! with the parked requests, and submits them. Each submitted write holds a
//! reference on the region; when the last one completes, the completion path
//! arms a delayed release that the outbound worker later turns into a
//! `RELEASE_WRITE`, unless new writes arrived in the meantime.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::device::DeviceInner;
use crate::io::child::{ChildIo, ChildKind};
use crate::io::completion::ParentIo;
use crate::io::{Direction, EndIo, IoError, IoRequest, PageBuf, PageVec, SECTOR_SHIFT};
use crate::parity;
use crate::region::table::RegionTable;
use crate::region::{Region, COUNT_CACHED, COUNT_REQUESTED};

/// Accept a request from the block layer.
pub(crate) fn map(dev: &Arc<DeviceInner>, req: IoRequest) {
    if dev.region_bits().is_none() {
        // The region size arrives with the handshake; until then requests
        // park on the bogus list, which the identify handler drains back
        // through `map_request`.
        let mut table = dev.regions.lock().unwrap();
        if dev.region_bits().is_none() {
            table.bogus.push_back(req);
            return;
        }
        drop(table);
    }
    map_request(dev, req);
}

/// Dispatch with the handshake complete.
pub(crate) fn map_request(dev: &Arc<DeviceInner>, req: IoRequest) {
    let is_read = req.dir == Direction::Read;
    let sector = req.sector;
    let size = req.len;
    let sectors_per_block = dev.blocksize_bits - SECTOR_SHIFT;
    let secmask = (1u64 << sectors_per_block) - 1;
    let blockmask = (dev.blocksize() - 1) as u64;
    let Some(region_bits) = dev.region_bits() else {
        // Callers check the handshake first; don't lose the request if one
        // slips through.
        return map(dev, req);
    };
    let regnum = sector >> (region_bits - SECTOR_SHIFT);

    trace!(
        "{} {:x}/{:x}, region {:x}",
        req.dir.as_str(),
        sector,
        size,
        regnum
    );
    debug_assert!(size as u64 <= 1 << region_bits);

    if (sector & secmask) != 0 || (size as u64 & blockmask) != 0 {
        if !is_read || (sector & secmask) + (size as u64 >> SECTOR_SHIFT) > 1 << sectors_per_block
        {
            warn!("long odd block {} {:x}/{:x} failed", req.dir.as_str(), sector, size);
            let IoRequest { endio, .. } = req;
            endio(Err(IoError::Misaligned));
            return;
        }
        warn!("{} odd block, {:x}/{:x}", req.dir.as_str(), sector, size);
        bounce_read(dev, req, secmask, blockmask);
        return;
    }

    if is_read {
        read_request(dev, req, regnum);
    } else {
        write_request(dev, req, regnum);
    }
}

/// Short misaligned read: read the whole surrounding block into a bounce
/// buffer through the normal striping path and copy the requested slice back
/// on completion.
fn bounce_read(dev: &Arc<DeviceInner>, req: IoRequest, secmask: u64, blockmask: u64) {
    let IoRequest {
        sector,
        pages: caller_pages,
        len,
        endio: caller_endio,
        ..
    } = req;
    let offset = ((sector << SECTOR_SHIFT) & blockmask) as usize;
    let aligned_sector = sector & !secmask;
    let bounce: Arc<PageVec> = Arc::new(vec![PageBuf::new(dev.blocksize())]);

    let bounce_ref = bounce.clone();
    let endio: EndIo = Box::new(move |status| {
        if status.is_ok() {
            let block = unsafe { bounce_ref[0].bytes() };
            // The bounce parent has fully completed; the caller page is ours.
            unsafe { caller_pages[0].column_mut(0, len) }
                .copy_from_slice(&block[offset..offset + len]);
        }
        caller_endio(status);
    });

    submit_striped(dev, Direction::Read, aligned_sector, bounce, endio, None);
}

/// The read path: balance synced mirror reads, stripe everything else.
fn read_request(dev: &Arc<DeviceInner>, req: IoRequest, regnum: u64) {
    let mut synced = false;
    if regnum < dev.highwater.load(Ordering::Relaxed) {
        let table = dev.regions.lock().unwrap();
        synced = match table.lookup(regnum) {
            None => true,
            Some(entry) => !entry.region.is_desynced(),
        };
    }

    let balance = dev.balance_step(req.len);
    if dev.members.len() == 2 && synced {
        submit_whole(dev, req, balance);
        return;
    }

    let IoRequest {
        sector,
        pages,
        endio,
        ..
    } = req;
    submit_striped(dev, Direction::Read, sector, pages, endio, None);
}

/// The write path: submit under an existing grant, or park and query.
fn write_request(dev: &Arc<DeviceInner>, req: IoRequest, regnum: u64) {
    let mut queued = false;
    let mut table = dev.regions.lock().unwrap();
    loop {
        let found = table
            .lookup(regnum)
            .map(|entry| (entry.region.clone(), entry.region.count()));
        match found {
            Some((region, count)) if count >= 0 && !region.is_draining() => {
                // Grant already held; the region stays synced or unsynced.
                trace!("rewrite region {:x}, count {}", regnum, count);
                region.get();
                drop(table);
                submit_write(dev, req, region);
                return;
            }
            Some((region, count)) => {
                // Requested, draining, or cached: park. A cached record
                // turns into a fresh grant query; a draining one is
                // re-queried by the release path.
                if count == COUNT_CACHED {
                    region.set_count(COUNT_REQUESTED);
                    table.requests.push_back(regnum);
                    queued = true;
                }
                if let Some(entry) = table.lookup_mut(regnum) {
                    entry.wait.push_back(req);
                }
                break;
            }
            None => {
                if !table.has_spare() {
                    table = restore_spare(dev, table);
                    continue;
                }
                if table.insert_from_spare(regnum, 0, COUNT_REQUESTED).is_some() {
                    if let Some(entry) = table.lookup_mut(regnum) {
                        entry.wait.push_back(req);
                    }
                    table.requests.push_back(regnum);
                    queued = true;
                    break;
                }
            }
        }
    }
    if !table.has_spare() {
        table = restore_spare(dev, table);
    }
    drop(table);
    if queued {
        dev.work.signal();
    }
}

/// Submit a granted write. The caller has already taken the region count.
pub(crate) fn submit_write(dev: &Arc<DeviceInner>, req: IoRequest, region: Arc<Region>) {
    let IoRequest {
        sector,
        pages,
        endio,
        ..
    } = req;
    submit_striped(dev, Direction::Write, sector, pages, endio, Some(region));
}

/// Refill the spare region record. Drops and retakes the region lock.
pub(crate) fn restore_spare<'a>(
    dev: &'a DeviceInner,
    table: MutexGuard<'a, RegionTable>,
) -> MutexGuard<'a, RegionTable> {
    drop(table);
    let region = Arc::new(Region::new(0, 0, 0));
    let mut table = dev.regions.lock().unwrap();
    table.put_spare(region);
    table
}

/// Submit a whole, unstriped request to a single member (balanced mirror
/// reads).
fn submit_whole(dev: &Arc<DeviceInner>, req: IoRequest, member: usize) {
    let IoRequest {
        dir,
        sector,
        pages,
        len,
        endio,
    } = req;
    let parent = Arc::new(ParentIo {
        dev: dev.clone(),
        dir,
        sector,
        len,
        frag_bytes: dev.fragsize(),
        remaining: AtomicI32::new(1),
        error: OnceLock::new(),
        pages,
        parity: None,
        region: None,
        reconstruct: None,
        endio: Mutex::new(Some(endio)),
    });
    let child = ChildIo::new(parent, ChildKind::Whole, member, sector, len);
    dev.members[member].submit(child);
}

/// Stripe a request into per-member children and submit them.
///
/// Degraded mode: a dead parity member just loses its child; a dead data
/// member loses its data child, and reads gain the parity child plus a
/// reconstruction pass on completion. Write parity treats the dead column
/// as zeroes, so parity is always the XOR of the surviving fragments.
fn submit_striped(
    dev: &Arc<DeviceInner>,
    dir: Direction,
    sector: u64,
    pages: Arc<PageVec>,
    endio: EndIo,
    region: Option<Arc<Region>>,
) {
    let members = dev.members.len();
    let frags = members - 1;
    let dead = dev.dead;
    let fragsize = dev.fragsize();
    let blocks = pages.len();
    let len: usize = pages.iter().map(PageBuf::len).sum();
    let member_sector = sector >> dev.frags_per_block_bits();
    debug_assert!(pages.iter().all(|p| p.len() == dev.blocksize()));

    let mut children: Vec<(usize, ChildKind)> = Vec::with_capacity(members);
    let mut reconstruct = None;
    for column in 0..frags {
        if dead != Some(column) {
            children.push((column, ChildKind::Data { column }));
        }
    }
    match dir {
        Direction::Write => {
            if dead != Some(frags) {
                children.push((frags, ChildKind::Parity));
            }
        }
        Direction::Read => {
            // Parity is only fetched to rebuild a dead data column.
            if let Some(column) = dead {
                if column < frags {
                    children.push((frags, ChildKind::Parity));
                    reconstruct = Some(column);
                }
            }
        }
    }

    let wants_parity = children.iter().any(|(_, k)| *k == ChildKind::Parity);
    let parity_pages = if wants_parity {
        let mut parity: PageVec = (0..blocks).map(|_| PageBuf::new(fragsize)).collect();
        if dir == Direction::Write {
            for (page, parity_page) in pages.iter().zip(parity.iter_mut()) {
                // The parent is not submitted yet; its pages are ours.
                let data = unsafe { page.words() };
                let out = parity_page.as_words_mut();
                match dead {
                    Some(column) if column < frags => {
                        parity::compute_skip(data, out, frags, column)
                    }
                    _ => parity::compute(data, out, frags),
                }
            }
        }
        Some(parity)
    } else {
        None
    };

    trace!(
        "submit {} children, {} {:x}/{:x}",
        children.len(),
        dir.as_str(),
        sector,
        len
    );

    let parent = Arc::new(ParentIo {
        dev: dev.clone(),
        dir,
        sector,
        len,
        frag_bytes: fragsize,
        remaining: AtomicI32::new(children.len() as i32),
        error: OnceLock::new(),
        pages,
        parity: parity_pages,
        region,
        reconstruct,
        endio: Mutex::new(Some(endio)),
    });

    let child_len = blocks * fragsize;
    for (member, kind) in children {
        let child = ChildIo::new(parent.clone(), kind, member, member_sector, child_len);
        dev.members[member].submit(child);
    }
}
