//! The outbound side: the serialized data-socket writer and the worker that
//! drains the grant-query and release queues.
//!
//! The writer gate starts closed and opens when the first `REPLY_IDENTIFY`
//! arrives, so nothing is sent to a server that has not accepted us; it
//! closes again while a broken socket is being replaced. The worker parks on
//! the [`WorkMonitor`](crate::util::WorkMonitor) and otherwise sleeps until
//! the earliest pending delayed release comes due.

use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::device::DeviceInner;
use crate::proto::{region_body, write_message, MsgCode};
use crate::region::table::RegionTable;
use crate::region::{Region, COUNT_CACHED, COUNT_REQUESTED, DRAIN};

/// A region whose last in-flight write completed, waiting out the release
/// delay. Holds one region count and one destroy-hold.
pub(crate) struct Retire {
    pub region: Arc<Region>,
    pub due: Instant,
}

/// The gated, serialized data-socket writer.
pub(crate) struct Outbound {
    inner: Mutex<OutboundInner>,
    ready: Condvar,
}

struct OutboundInner {
    /// Opened by the identify reply; senders block while closed.
    open: bool,
    sock: Option<UnixStream>,
}

impl Outbound {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(OutboundInner {
                open: false,
                sock: None,
            }),
            ready: Condvar::new(),
        }
    }

    /// Install a replacement writer. The gate state is untouched; a
    /// reconnect closes it separately until the server re-identifies.
    pub fn install(&self, sock: UnixStream) {
        let mut inner = self.inner.lock().unwrap();
        inner.sock = Some(sock);
        self.ready.notify_all();
    }

    pub fn open_gate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open = true;
        self.ready.notify_all();
    }

    pub fn close_gate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.open = false;
    }

    /// Wake blocked senders so they can observe shutdown.
    pub fn wake(&self) {
        self.ready.notify_all();
    }

    /// Send a message, waiting for the gate if necessary. The guard is held
    /// across the write, serializing senders on the data socket.
    pub fn send(&self, dev: &DeviceInner, code: MsgCode, body: &[u8]) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if !dev.running() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Interrupted,
                    "device shutting down",
                ));
            }
            if inner.open && inner.sock.is_some() {
                break;
            }
            inner = self.ready.wait(inner).unwrap();
        }
        match inner.sock.as_ref() {
            Some(sock) => write_message(&mut &*sock, code, body),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }

    /// Send without waiting for the gate: the `IDENTIFY` that opens the
    /// conversation on a fresh socket.
    pub fn send_ungated(&self, code: MsgCode, body: &[u8]) -> std::io::Result<()> {
        let inner = self.inner.lock().unwrap();
        match inner.sock.as_ref() {
            Some(sock) => write_message(&mut &*sock, code, body),
            None => Err(std::io::ErrorKind::NotConnected.into()),
        }
    }
}

/// The outbound worker thread.
pub(crate) fn worker(dev: Arc<DeviceInner>) {
    trace!("outbound worker running");
    while dev.running() {
        flush_requests(&dev);
        let deadline = process_releases(&dev);
        if !dev.running() {
            break;
        }
        if log_enabled!(log::Level::Trace) {
            dev.regions.lock().unwrap().dump();
        }
        dev.work.wait_until(deadline);
    }
    trace!("outbound worker exiting");
}

/// Send `REQUEST_WRITE` for every queued grant query, unless paused. The
/// region lock is dropped across each send.
pub(crate) fn flush_requests(dev: &Arc<DeviceInner>) {
    loop {
        let mut table = dev.regions.lock().unwrap();
        if dev.paused() || !dev.running() {
            return;
        }
        let Some(regnum) = table.requests.pop_front() else {
            return;
        };
        drop(table);
        if let Err(e) = dev.outbound.send(dev, MsgCode::RequestWrite, &region_body(regnum)) {
            // The query is gone; the re-identify path re-queues REQUESTED
            // regions after a reconnect.
            warn!("request for region {:x} not sent: {}", regnum, e);
        }
    }
}

/// Process due retires. Returns the deadline of the earliest retire still
/// pending, for the worker's timed wait.
fn process_releases(dev: &Arc<DeviceInner>) -> Option<Instant> {
    loop {
        let retire = {
            let mut releases = dev.releases.lock().unwrap();
            let due = match releases.front() {
                None => return None,
                Some(first) => first.due,
            };
            if due > Instant::now() {
                return Some(due);
            }
            releases.pop_front()
        };
        let Some(retire) = retire else {
            return None;
        };

        let table = dev.regions.lock().unwrap();
        trace!(
            "release region {:x}, count {}",
            retire.region.regnum(),
            retire.region.count()
        );
        if !retire.region.put_test_zero() {
            // More writes were submitted before the delay ran out; the
            // release is off.
            drop(table);
        } else {
            release_region(dev, table, &retire.region);
        }
        dev.destroy_hold.release();
    }
}

/// Release a region that reached count zero. Consumes the region lock guard;
/// the socket writes happen after it is dropped.
fn release_region(
    dev: &Arc<DeviceInner>,
    mut table: MutexGuard<'_, RegionTable>,
    region: &Arc<Region>,
) {
    let regnum = region.regnum();
    trace!("release region {:x}", regnum);

    let Some(entry) = table.lookup(regnum) else {
        warn!("released region {:x} is not in the table", regnum);
        return;
    };
    debug_assert!(Arc::ptr_eq(&entry.region, region));

    if !entry.wait.is_empty() {
        // A drain landed while the release was pending: give the region
        // back, then immediately re-query it for the waiters.
        if !region.is_draining() {
            warn!("requests leaked on region {:x}", regnum);
        }
        region.clear_flag(DRAIN);
        region.set_count(COUNT_REQUESTED);
        drop(table);
        send_release(dev, regnum);
        dev.queue_request(regnum);
        return;
    }

    if region.is_desynced() && regnum < dev.highwater.load(std::sync::atomic::Ordering::Relaxed) {
        // Keep desynced regions below the highwater cached for readers.
        region.set_count(COUNT_CACHED);
        drop(table);
        send_release(dev, regnum);
        return;
    }

    table.remove(regnum);
    drop(table);
    send_release(dev, regnum);
}

fn send_release(dev: &Arc<DeviceInner>, regnum: u64) {
    if let Err(e) = dev.outbound.send(dev, MsgCode::ReleaseWrite, &region_body(regnum)) {
        warn!("release of region {:x} not sent: {}", regnum, e);
    }
}
