//! The inbound side: the data-socket reader with its message handlers, and
//! the control reader that performs the socket handover.
//!
//! The reader asks the control daemon for a data socket, then loops on
//! messages until the socket fails; if the device is still running it asks
//! for a replacement and resumes. Deferred requests stay parked across a
//! reconnect until a new grant arrives.

use std::os::unix::io::FromRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::device::DeviceInner;
use crate::io::completion;
use crate::io::dispatch;
use crate::proto::{arg32_body, fdpass, outbound, MessageBuf, MsgCode};
use crate::region::{COUNT_CACHED, COUNT_REQUESTED, DESYNC, DRAIN};

/// The inbound reader thread.
pub(crate) fn reader(dev: Arc<DeviceInner>) {
    let mut seen_generation = 0;
    let mut buf = MessageBuf::new();

    'connect: while dev.running() {
        trace!("requesting data socket");
        if let Err(e) = dev.send_control(MsgCode::NeedServer, &[]) {
            if dev.running() {
                warn!("control socket send failed: {}", e);
            }
            break;
        }
        let Some((generation, mut stream)) =
            dev.data_sock.wait_newer(seen_generation, &|| !dev.running())
        else {
            break;
        };
        seen_generation = generation;
        trace!("got data socket, generation {}", generation);

        while dev.running() {
            if let Err(e) = buf.read_from(&mut stream) {
                if dev.running() {
                    warn!("data socket error: {}", e);
                    // Block senders until the replacement is identified.
                    dev.outbound.close_gate();
                    continue 'connect;
                }
                break 'connect;
            }
            dispatch_message(&dev, &buf);
        }
    }
    trace!("inbound reader exiting");
}

fn dispatch_message(dev: &Arc<DeviceInner>, buf: &MessageBuf) {
    let Some(code) = buf.code() else {
        warn!("unknown message {:x}", buf.raw_code());
        return;
    };
    trace!("{:?}/{}", code, buf.body().len());

    // Regnum-carrying messages share the parse.
    let regnum = buf.regnum();
    match code {
        MsgCode::ReplyIdentify => match buf.arg32() {
            Ok(bits) => handle_identify(dev, bits),
            Err(e) => warn!("bad identify reply: {}", e),
        },
        MsgCode::GrantSynced => with_regnum(regnum, |r| grant(dev, r, true)),
        MsgCode::GrantUnsynced => with_regnum(regnum, |r| grant(dev, r, false)),
        MsgCode::AddUnsynced => with_regnum(regnum, |r| add_unsynced(dev, r)),
        MsgCode::DelUnsynced => with_regnum(regnum, |r| del_unsynced(dev, r)),
        MsgCode::SetHighwater => with_regnum(regnum, |r| {
            trace!("set highwater {:x}", r);
            dev.highwater.store(r, Ordering::Relaxed);
        }),
        MsgCode::DrainRegion => with_regnum(regnum, |r| drain_region(dev, r)),
        MsgCode::PauseRequests => dev.set_paused(true),
        MsgCode::ResumeRequests => {
            dev.set_paused(false);
            outbound::flush_requests(dev);
        }
        MsgCode::BounceRequest => with_regnum(regnum, |r| dev.queue_request(r)),
        MsgCode::NeedServer
        | MsgCode::ConnectServer
        | MsgCode::ReplyConnectServer
        | MsgCode::Identify
        | MsgCode::RequestWrite
        | MsgCode::ReleaseWrite => {
            warn!("unexpected message {:?} on data socket", code);
        }
    }
}

fn with_regnum(regnum: std::io::Result<u64>, f: impl FnOnce(u64)) {
    match regnum {
        Ok(r) => f(r),
        Err(e) => warn!("bad message body: {}", e),
    }
}

/// The server accepted us: record the region size, drain the pre-handshake
/// list, re-queue interrupted grant queries, open the send gate, and confirm
/// on the control channel.
fn handle_identify(dev: &Arc<DeviceInner>, region_bits: u32) {
    trace!("identify succeeded, region bits {}", region_bits);

    let mut table = dev.regions.lock().unwrap();
    dev.set_region_bits(region_bits);
    loop {
        let Some(req) = table.bogus.pop_front() else {
            break;
        };
        drop(table);
        dispatch::map_request(dev, req);
        table = dev.regions.lock().unwrap();
    }

    // Regions still waiting on a grant reply lost it with the old socket;
    // ask again.
    let requeue: Vec<u64> = table
        .entries()
        .filter(|(regnum, entry)| {
            entry.region.count() == COUNT_REQUESTED && !table.query_queued(**regnum)
        })
        .map(|(regnum, _)| *regnum)
        .collect();
    for regnum in requeue {
        table.requests.push_back(regnum);
    }
    drop(table);

    dev.outbound.open_gate();
    dev.work.signal();
    if let Err(e) = dev.send_control(MsgCode::ReplyConnectServer, &[]) {
        warn!("control socket send failed: {}", e);
    }
}

/// A grant reply: resolve the region's sync state and submit the parked
/// writes.
///
/// Submitting drops the region lock, and a submitted write may complete
/// before the lock is retaken, so the region holds a temporary count of 1
/// across the drain; dropping it at the end may itself trigger the release.
fn grant(dev: &Arc<DeviceInner>, regnum: u64, synced: bool) {
    trace!("granted {} region {:x}", if synced { "synced" } else { "unsynced" }, regnum);

    let mut table = dev.regions.lock().unwrap();
    let Some(entry) = table.lookup(regnum) else {
        warn!("grant for unknown region {:x}", regnum);
        return;
    };
    let region = entry.region.clone();

    if !synced && !region.is_desynced() && regnum < dev.highwater.load(Ordering::Relaxed) {
        warn!("desynced region {:x} not in cache", regnum);
    }
    if synced {
        region.clear_flag(DESYNC);
    } else {
        region.set_flag(DESYNC);
    }

    region.set_count(1);
    loop {
        let req = match table.lookup_mut(regnum) {
            Some(entry) => entry.wait.pop_front(),
            None => None,
        };
        let Some(req) = req else {
            break;
        };
        trace!("submit queued write, sector {:x}", req.sector());
        region.get();
        drop(table);
        dispatch::submit_write(dev, req, region.clone());
        table = dev.regions.lock().unwrap();
    }
    // Dropping the temporary count can hit zero if every submitted write
    // already completed; that is the ≥1 → 0 transition, so it arms the
    // delayed release like any other. The region lock is dropped first:
    // arming touches the endio lock, and the two never nest.
    let zero = region.put_test_zero();
    drop(table);
    if zero {
        completion::arm_release(dev, region);
    }
}

/// The server publishes a dirty region: cache it with no in-flight count, or
/// mark an existing record.
fn add_unsynced(dev: &Arc<DeviceInner>, regnum: u64) {
    trace!("add unsynced region {:x}", regnum);
    let mut table = dev.regions.lock().unwrap();
    loop {
        if let Some(entry) = table.lookup(regnum) {
            entry.region.set_flag(DESYNC);
            break;
        }
        if !table.has_spare() {
            table = dispatch::restore_spare(dev, table);
            continue;
        }
        table.insert_from_spare(regnum, DESYNC, COUNT_CACHED);
        break;
    }
}

/// The server is authoritative about clean regions: clear the bit, drop a
/// record that only existed for the reader cache.
fn del_unsynced(dev: &Arc<DeviceInner>, regnum: u64) {
    trace!("del unsynced region {:x}", regnum);
    let mut table = dev.regions.lock().unwrap();
    match table.lookup(regnum) {
        None => warn!("deleted uncached unsynced region {:x}", regnum),
        Some(entry) => {
            let region = entry.region.clone();
            region.clear_flag(DESYNC);
            if region.count() == COUNT_CACHED {
                table.remove(regnum);
            }
        }
    }
}

/// The server wants the region back: stop accruing writes; the in-flight
/// completions will release it.
fn drain_region(dev: &Arc<DeviceInner>, regnum: u64) {
    trace!("drain region {:x}", regnum);
    let table = dev.regions.lock().unwrap();
    if let Some(entry) = table.lookup(regnum) {
        if entry.region.count() >= 0 {
            entry.region.set_flag(DRAIN);
        }
    }
}

/// The control reader thread: waits for `CONNECT_SERVER`, receives the data
/// socket, installs it, and identifies to the server.
pub(crate) fn control(dev: Arc<DeviceInner>) {
    let mut stream = match dev.control.try_clone() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("control socket clone failed: {}", e);
            return;
        }
    };
    let mut buf = MessageBuf::new();

    while dev.running() {
        if let Err(e) = buf.read_from(&mut stream) {
            if dev.running() {
                warn!("control socket error: {}", e);
            }
            break;
        }
        match buf.code() {
            Some(MsgCode::ConnectServer) => {
                let sock = match fdpass::recv_fd(&stream) {
                    Ok(fd) => unsafe { UnixStream::from_raw_fd(fd) },
                    Err(e) => {
                        warn!("socket handover failed: {}", e);
                        continue;
                    }
                };
                trace!("received data socket");
                match sock.try_clone() {
                    Ok(writer) => dev.outbound.install(writer),
                    Err(e) => {
                        warn!("data socket clone failed: {}", e);
                        continue;
                    }
                }
                dev.data_sock.install(sock);
                if let Err(e) = dev
                    .outbound
                    .send_ungated(MsgCode::Identify, &arg32_body(dev.opts.client_id))
                {
                    warn!("identify not sent: {}", e);
                }
            }
            Some(code) => warn!("unexpected message {:?} on control socket", code),
            None => warn!("unknown message {:x} on control socket", buf.raw_code()),
        }
    }
    trace!("control reader exiting");
}
