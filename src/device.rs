//! Device lifecycle: construction, geometry, shared state, teardown.

use std::collections::VecDeque;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Options;
use crate::io::member::FileMember;
use crate::io::{dispatch, IoRequest, MemberDevice};
use crate::proto::outbound::{Outbound, Retire};
use crate::proto::{inbound, outbound, write_message, MsgCode};
use crate::region::table::RegionTable;
use crate::util::{logger, DestroyHold, SocketSlot, WorkMonitor};

/// Teardown has begun; the worker threads drain out.
const FINISH: u8 = 1 << 0;
/// The server asked us to stop sending grant queries.
const PAUSE: u8 = 1 << 1;

/// Upper bound on array width.
pub const MAX_MEMBERS: usize = 10;

/// The region size is unknown until the handshake.
const REGION_BITS_UNSET: u32 = u32::MAX;

/// Construction failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid member count {0}: need 2^k+1 members, at most 10")]
    MemberCount(usize),
    #[error("target length {0} sectors is not divisible by the data member count")]
    TargetLength(u64),
    #[error("dead member index {0} out of range")]
    DeadMember(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Construction parameters.
pub struct DeviceParams {
    /// Member device paths, in order. Data fragment d lives on member d;
    /// parity on the last member.
    pub members: Vec<PathBuf>,
    /// Control socket path. A leading `@` selects the abstract namespace.
    pub control_socket: String,
    /// Exported length in sectors; must divide evenly over the data members.
    pub target_sectors: u64,
    /// A member known missing, for degraded operation.
    pub dead: Option<usize>,
}

/// State shared by the dispatcher, the completion path, and the three
/// protocol threads.
pub(crate) struct DeviceInner {
    pub members: Vec<Arc<dyn MemberDevice>>,
    pub dead: Option<usize>,
    pub blocksize_bits: u32,
    pub fragsize_bits: u32,
    pub opts: Options,

    /// Published by the handshake.
    region_bits: AtomicU32,
    pub highwater: AtomicU64,
    flags: AtomicU8,

    /// The region lock: records, wait lists, the bogus list, the grant-query
    /// queue. Never nested with `releases`.
    pub regions: Mutex<RegionTable>,
    /// The endio lock: retires queued by completion context only.
    pub releases: Mutex<VecDeque<Retire>>,

    pub work: WorkMonitor,
    pub outbound: Outbound,
    pub data_sock: SocketSlot,
    pub control: UnixStream,
    control_out: Mutex<UnixStream>,
    pub destroy_hold: DestroyHold,

    balance_acc: AtomicU64,
    balance: AtomicUsize,
}

impl DeviceInner {
    pub fn running(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & FINISH == 0
    }

    pub fn paused(&self) -> bool {
        self.flags.load(Ordering::Relaxed) & PAUSE != 0
    }

    pub fn set_paused(&self, paused: bool) {
        if paused {
            self.flags.fetch_or(PAUSE, Ordering::Relaxed);
        } else {
            self.flags.fetch_and(!PAUSE, Ordering::Relaxed);
        }
    }

    fn finish(&self) {
        self.flags.fetch_or(FINISH, Ordering::Relaxed);
    }

    pub fn region_bits(&self) -> Option<u32> {
        match self.region_bits.load(Ordering::Acquire) {
            REGION_BITS_UNSET => None,
            bits => Some(bits),
        }
    }

    /// Called by the identify handler, under the region lock.
    pub fn set_region_bits(&self, bits: u32) {
        self.region_bits.store(bits, Ordering::Release);
    }

    pub fn blocksize(&self) -> usize {
        1 << self.blocksize_bits
    }

    pub fn fragsize(&self) -> usize {
        1 << self.fragsize_bits
    }

    /// Data fragments per block.
    pub fn frags(&self) -> usize {
        self.members.len() - 1
    }

    pub fn frags_per_block_bits(&self) -> u32 {
        self.blocksize_bits - self.fragsize_bits
    }

    /// Advance the read-balance accumulator by `len` bytes and return the
    /// member to read from. Relaxed atomics: balancing is policy, not
    /// correctness.
    pub fn balance_step(&self, len: usize) -> usize {
        let den = self.opts.balance_den;
        let acc = self.balance_acc.fetch_add(len as u64, Ordering::Relaxed) + len as u64;
        if acc >= den {
            self.balance_acc.fetch_sub(den, Ordering::Relaxed);
            let next = self.balance.fetch_add(1, Ordering::Relaxed) + 1;
            return next % self.members.len();
        }
        self.balance.load(Ordering::Relaxed) % self.members.len()
    }

    /// Queue a grant query for the outbound worker.
    pub fn queue_request(&self, regnum: u64) {
        let mut table = self.regions.lock().unwrap();
        table.requests.push_back(regnum);
        drop(table);
        self.work.signal();
    }

    /// Serialized write on the control socket.
    pub fn send_control(&self, code: MsgCode, body: &[u8]) -> std::io::Result<()> {
        let sock = self.control_out.lock().unwrap();
        write_message(&mut &*sock, code, body)
    }
}

/// A running cluster RAID device.
///
/// Dropping the device tears it down: pending delayed releases are allowed
/// to reach the server, the protocol threads are stopped and joined.
pub struct RaidDevice {
    inner: Arc<DeviceInner>,
    threads: Vec<JoinHandle<()>>,
}

impl RaidDevice {
    /// Open the member devices and the control socket, and start the data
    /// path. The device accepts requests immediately; they are deferred
    /// internally until the server handshake completes.
    pub fn open(params: DeviceParams, opts: Options) -> Result<Self, Error> {
        let mut members: Vec<Arc<dyn MemberDevice>> = Vec::with_capacity(params.members.len());
        for path in &params.members {
            members.push(Arc::new(FileMember::open(path)?));
        }
        let control = connect_control(&params.control_socket)?;
        Self::assemble(members, control, params.target_sectors, params.dead, opts)
    }

    /// Start the data path over already-opened members and control socket.
    pub fn assemble(
        members: Vec<Arc<dyn MemberDevice>>,
        control: UnixStream,
        target_sectors: u64,
        dead: Option<usize>,
        opts: Options,
    ) -> Result<Self, Error> {
        logger::try_init();

        let count = members.len();
        if count < 2 || count > MAX_MEMBERS || !(count - 1).is_power_of_two() {
            return Err(Error::MemberCount(count));
        }
        let frags = (count - 1) as u64;
        if target_sectors % frags != 0 {
            return Err(Error::TargetLength(target_sectors));
        }
        if let Some(dead) = dead {
            if dead >= count {
                return Err(Error::DeadMember(dead));
            }
        }

        let order = (count - 1).trailing_zeros();
        let blocksize_bits = opts.blocksize_bits;
        info!("order {} array over {} members", order, count);

        let control_out = control.try_clone()?;
        let inner = Arc::new(DeviceInner {
            members,
            dead,
            blocksize_bits,
            fragsize_bits: blocksize_bits - order,
            opts,
            region_bits: AtomicU32::new(REGION_BITS_UNSET),
            highwater: AtomicU64::new(0),
            flags: AtomicU8::new(0),
            regions: Mutex::new(RegionTable::new()),
            releases: Mutex::new(VecDeque::new()),
            work: WorkMonitor::new(),
            outbound: Outbound::new(),
            data_sock: SocketSlot::new(),
            control,
            control_out: Mutex::new(control_out),
            destroy_hold: DestroyHold::new(),
            balance_acc: AtomicU64::new(0),
            balance: AtomicUsize::new(0),
        });

        let threads = vec![
            spawn_named("gridraid-client", inner.clone(), inbound::reader),
            spawn_named("gridraid-worker", inner.clone(), outbound::worker),
            spawn_named("gridraid-control", inner.clone(), inbound::control),
        ];

        Ok(Self { inner, threads })
    }

    /// Accept a request from the block layer. All outcomes, including
    /// alignment failures, are reported through the request's completion
    /// callback.
    pub fn map(&self, req: IoRequest) {
        dispatch::map(&self.inner, req);
    }

    /// The region size in bytes, once the handshake has delivered it.
    pub fn region_size(&self) -> Option<u64> {
        self.inner.region_bits().map(|bits| 1 << bits)
    }

    /// Block size in bytes.
    pub fn blocksize(&self) -> usize {
        self.inner.blocksize()
    }

    /// Stop the data path. Blocks until pending delayed releases have been
    /// sent and the protocol threads have exited.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        trace!("tearing down");

        // Let armed delayed releases reach the server first. Bounded: with
        // the server gone the worker cannot send them, and teardown must
        // still finish.
        let grace = self.inner.opts.release_delay + std::time::Duration::from_secs(5);
        if !self.inner.destroy_hold.wait_idle_for(grace) {
            warn!("pending releases not drained, tearing down anyway");
        }

        self.inner.finish();
        self.inner.data_sock.shutdown();
        let _ = self.inner.control.shutdown(std::net::Shutdown::Both);
        self.inner.work.signal();
        self.inner.outbound.wake();

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }

}

impl Drop for RaidDevice {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn spawn_named(
    name: &str,
    inner: Arc<DeviceInner>,
    body: fn(Arc<DeviceInner>),
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(inner))
        .expect("thread spawn failed")
}

/// Connect to the local daemon's control socket. A leading `@` selects the
/// Linux abstract namespace.
fn connect_control(name: &str) -> std::io::Result<UnixStream> {
    #[cfg(target_os = "linux")]
    if let Some(abstract_name) = name.strip_prefix('@') {
        use std::os::linux::net::SocketAddrExt;
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(abstract_name.as_bytes())?;
        return UnixStream::connect_addr(&addr);
    }
    UnixStream::connect(name)
}
