//! Shared harness: in-memory member devices plus a scripted authority
//! server speaking over real Unix socket pairs.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gridraid::proto::{self, fdpass, MessageBuf, MsgCode};
use gridraid::{
    ChildIo, Direction, IoRequest, IoResult, MemberDevice, Options, PageBuf, PageVec, RaidDevice,
    SECTOR_SHIFT,
};

pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// One captured child submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub dir: Direction,
    pub sector: u64,
    pub len: usize,
    /// Payload, for writes.
    pub data: Option<Vec<u8>>,
}

/// A member device over an in-memory image. In auto mode children complete
/// inline; in manual mode they queue until [`MockMember::complete_all`].
pub struct MockMember {
    pub index: usize,
    manual: bool,
    state: Mutex<MemberState>,
}

struct MemberState {
    image: Vec<u8>,
    log: Vec<Submission>,
    pending: VecDeque<(ChildIo, Option<Vec<u8>>)>,
}

const IMAGE_SIZE: usize = 1 << 20;

impl MockMember {
    pub fn new(index: usize, manual: bool) -> Arc<Self> {
        Arc::new(Self {
            index,
            manual,
            state: Mutex::new(MemberState {
                image: vec![0; IMAGE_SIZE],
                log: Vec::new(),
                pending: VecDeque::new(),
            }),
        })
    }

    /// Preload the member image at a byte offset.
    pub fn seed(&self, offset: usize, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.image[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn image(&self, offset: usize, len: usize) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        state.image[offset..offset + len].to_vec()
    }

    pub fn log(&self) -> Vec<Submission> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Complete every queued child (manual mode).
    pub fn complete_all(&self) {
        loop {
            let entry = self.state.lock().unwrap().pending.pop_front();
            let Some((io, payload)) = entry else { break };
            self.finish(io, payload);
        }
    }

    fn finish(&self, io: ChildIo, payload: Option<Vec<u8>>) {
        let offset = (io.sector() << SECTOR_SHIFT) as usize;
        match io.direction() {
            Direction::Write => {
                let data = payload.expect("write child without payload");
                self.state.lock().unwrap().image[offset..offset + data.len()]
                    .copy_from_slice(&data);
            }
            Direction::Read => {
                let data = self.image(offset, io.len());
                io.fill(&data);
            }
        }
        io.complete(Ok(()));
    }
}

impl MemberDevice for MockMember {
    fn submit(&self, io: ChildIo) {
        let payload = match io.direction() {
            Direction::Write => Some(io.payload()),
            Direction::Read => None,
        };
        self.state.lock().unwrap().log.push(Submission {
            dir: io.direction(),
            sector: io.sector(),
            len: io.len(),
            data: payload.clone(),
        });
        if self.manual {
            self.state.lock().unwrap().pending.push_back((io, payload));
        } else {
            self.finish(io, payload);
        }
    }
}

/// The device under test plus the daemon/server ends of its sockets.
pub struct Harness {
    pub device: RaidDevice,
    pub members: Vec<Arc<MockMember>>,
    /// Daemon end of the control socket.
    pub control: UnixStream,
    /// Server end of the data socket, once connected.
    pub data: Option<UnixStream>,
    buf: MessageBuf,
}

impl Harness {
    pub fn new(member_count: usize, dead: Option<usize>, manual: bool, opts: Options) -> Self {
        let members: Vec<Arc<MockMember>> = (0..member_count)
            .map(|i| MockMember::new(i, manual))
            .collect();
        let as_devices: Vec<Arc<dyn MemberDevice>> = members
            .iter()
            .map(|m| m.clone() as Arc<dyn MemberDevice>)
            .collect();
        let (client_end, daemon_end) = UnixStream::pair().unwrap();
        daemon_end.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        let device = RaidDevice::assemble(
            as_devices,
            client_end,
            1 << 20,
            dead,
            opts,
        )
        .unwrap();
        Self {
            device,
            members,
            control: daemon_end,
            data: None,
            buf: MessageBuf::new(),
        }
    }

    /// Short release delay so the scenarios run fast.
    pub fn fast_options() -> Options {
        Options {
            release_delay: Duration::from_millis(100),
            ..Options::default()
        }
    }

    /// Read the next control-socket message.
    pub fn recv_control(&mut self) -> MsgCode {
        self.buf.read_from(&mut &self.control).unwrap();
        self.buf.code().expect("unknown control message")
    }

    /// Read the next data-socket message and its regnum body, if any.
    pub fn recv_data(&mut self) -> (MsgCode, Option<u64>) {
        let sock = self.data.as_ref().expect("no data socket");
        self.buf.read_from(&mut &*sock).unwrap();
        let code = self.buf.code().expect("unknown data message");
        (code, self.buf.regnum().ok())
    }

    /// Assert nothing arrives on the data socket for `window`.
    pub fn expect_data_silence(&mut self, window: Duration) {
        let sock = self.data.as_ref().expect("no data socket");
        sock.set_read_timeout(Some(window)).unwrap();
        let result = self.buf.read_from(&mut &*sock);
        sock.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        match result {
            Err(e) if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) => {}
            Err(e) => panic!("unexpected data socket error: {e}"),
            Ok(()) => panic!(
                "unexpected message {:?} on the data socket",
                self.buf.code()
            ),
        }
    }

    /// Serve the client's `NEED_SERVER`: hand over a fresh data socket and
    /// complete the identify exchange.
    pub fn handshake(&mut self, region_bits: u32) {
        assert_eq!(self.recv_control(), MsgCode::NeedServer);
        self.connect_data(region_bits);
    }

    /// The socket handover half of the handshake, reusable for reconnects.
    pub fn connect_data(&mut self, region_bits: u32) {
        let (client_end, server_end) = UnixStream::pair().unwrap();
        server_end.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        proto::write_message(&mut &self.control, MsgCode::ConnectServer, &[]).unwrap();
        fdpass::send_fd(&self.control, client_end.as_raw_fd()).unwrap();
        drop(client_end);
        self.data = Some(server_end);

        let (code, _) = self.recv_data();
        assert_eq!(code, MsgCode::Identify);
        self.send_data(MsgCode::ReplyIdentify, &proto::arg32_body(region_bits));
        assert_eq!(self.recv_control(), MsgCode::ReplyConnectServer);
    }

    pub fn send_data(&self, code: MsgCode, body: &[u8]) {
        let sock = self.data.as_ref().expect("no data socket");
        proto::write_message(&mut &*sock, code, body).unwrap();
    }

    pub fn send_region(&self, code: MsgCode, regnum: u64) {
        self.send_data(code, &proto::region_body(regnum));
    }
}

/// Build a write request over `data` (one 4 KiB page per block) plus the
/// completion channel and a handle on the pages.
pub fn write_request(sector: u64, data: &[u8]) -> (IoRequest, Receiver<IoResult>, Arc<PageVec>) {
    let pages: Arc<PageVec> = Arc::new(data.chunks(4096).map(PageBuf::from_bytes).collect());
    let (tx, rx) = channel();
    let req = IoRequest::write(
        sector,
        pages.clone(),
        Box::new(move |status| {
            let _ = tx.send(status);
        }),
    );
    (req, rx, pages)
}

/// Build a read request of `len` bytes.
pub fn read_request(sector: u64, len: usize) -> (IoRequest, Receiver<IoResult>, Arc<PageVec>) {
    let mut pages: PageVec = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        let chunk = remaining.min(4096);
        pages.push(PageBuf::new(chunk));
        remaining -= chunk;
    }
    let pages = Arc::new(pages);
    let (tx, rx) = channel();
    let req = IoRequest::read(
        sector,
        pages.clone(),
        Box::new(move |status| {
            let _ = tx.send(status);
        }),
    );
    (req, rx, pages)
}

/// Poll `cond` until it holds or the timeout expires.
pub fn wait_until(cond: impl Fn() -> bool, what: &str) {
    let deadline = Instant::now() + READ_TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Gather the pages back into one buffer.
pub fn page_bytes(pages: &PageVec) -> Vec<u8> {
    let mut out = Vec::new();
    for page in pages {
        out.extend_from_slice(&page.copy_to_vec());
    }
    out
}

/// XOR two equal-length fragments.
pub fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Deterministic test pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
