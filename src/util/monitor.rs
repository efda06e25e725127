//! Monitors used by the long-lived device threads.
//!
//! The kernel original drove its helper threads with counting semaphores;
//! here each wakeup relationship is a small `Mutex` + `Condvar` monitor:
//!
//! -   [`WorkMonitor`]: the outbound worker parks on this and is signaled
//!     whenever a grant query or a retire record is queued. The wait takes an
//!     optional deadline so the worker can sleep exactly until the earliest
//!     pending delayed release comes due.
//! -   [`SocketSlot`]: hands the data socket from the control reader to the
//!     inbound reader. A generation counter distinguishes a replacement
//!     socket from the one whose failure triggered the reconnect.
//! -   [`DestroyHold`]: counts armed delayed releases; teardown waits for it
//!     to reach zero so no release can fire into freed state.

use std::os::unix::net::UnixStream;
use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Wakeup channel for the outbound worker.
pub(crate) struct WorkMonitor {
    /// True when a signal arrived since the last wait returned.
    pending: Mutex<bool>,
    work_available: Condvar,
}

impl WorkMonitor {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            work_available: Condvar::new(),
        }
    }

    /// Wake the worker. Signals coalesce: the queues are drained wholesale,
    /// so one pending flag is enough.
    pub fn signal(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.work_available.notify_one();
    }

    /// Park until signaled, or until `deadline` passes when one is given.
    ///
    /// The actual wait condition is "a grant query or retire was queued", but
    /// both queues are filled without holding this monitor's mutex, so a
    /// queue push could race a worker that just found the queues empty. The
    /// pending flag is set under the mutex before notifying, which closes
    /// that window: either the worker sees the flag, or it is still inside
    /// `wait` and gets the notification.
    pub fn wait_until(&self, deadline: Option<Instant>) {
        let mut pending = self.pending.lock().unwrap();
        while !*pending {
            match deadline {
                Some(due) => {
                    let now = Instant::now();
                    if now >= due {
                        break;
                    }
                    let (guard, _timeout) = self
                        .work_available
                        .wait_timeout(pending, due - now)
                        .unwrap();
                    pending = guard;
                }
                None => pending = self.work_available.wait(pending).unwrap(),
            }
        }
        *pending = false;
    }
}

/// The data-socket handover slot.
pub(crate) struct SocketSlot {
    slot: Mutex<SlotInner>,
    installed: Condvar,
}

struct SlotInner {
    /// Bumped on every install, so a reader can tell a fresh socket from the
    /// broken one it already consumed.
    generation: u64,
    stream: Option<UnixStream>,
}

impl SocketSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(SlotInner {
                generation: 0,
                stream: None,
            }),
            installed: Condvar::new(),
        }
    }

    /// Install a replacement data socket and wake any waiting reader.
    pub fn install(&self, stream: UnixStream) {
        let mut slot = self.slot.lock().unwrap();
        slot.generation += 1;
        slot.stream = Some(stream);
        self.installed.notify_all();
    }

    /// Block until a socket with a generation newer than `seen` is installed,
    /// then return its generation and a clone of the stream. Returns `None`
    /// when `stop` reports shutdown or the stream cannot be cloned.
    pub fn wait_newer(&self, seen: u64, stop: &dyn Fn() -> bool) -> Option<(u64, UnixStream)> {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if stop() {
                return None;
            }
            if slot.generation > seen && slot.stream.is_some() {
                break;
            }
            slot = self.installed.wait(slot).unwrap();
        }
        let generation = slot.generation;
        match slot.stream.as_ref().and_then(|s| s.try_clone().ok()) {
            Some(stream) => Some((generation, stream)),
            None => {
                warn!("data socket clone failed");
                None
            }
        }
    }

    /// Shut the installed socket down (unblocking reads) and wake waiters.
    /// Used at teardown.
    pub fn shutdown(&self) {
        let slot = self.slot.lock().unwrap();
        if let Some(stream) = slot.stream.as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.installed.notify_all();
    }
}

/// Teardown gate counting armed delayed releases.
pub(crate) struct DestroyHold {
    count: Mutex<usize>,
    idle: Condvar,
}

impl DestroyHold {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Taken when a delayed release is armed.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
    }

    /// Dropped when the retire record is processed or cancelled.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    /// Block until no delayed release is pending, or until `timeout`
    /// expires. Returns false on timeout.
    pub fn wait_idle_for(&self, timeout: std::time::Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self.idle.wait_timeout(count, deadline - now).unwrap();
            count = guard;
        }
        true
    }
}
