//! gridraid is the client-side data path of a cluster block device. The
//! exported volume is striped RAID-4 style across N member devices (N−1 data
//! fragments plus one parity fragment per block), and write access is shared
//! between hosts: an authority server arbitrates which regions of the address
//! space a client may write, so that resync after a crash stays bounded.
//!
//! Logically, this crate includes these major parts:
//! * [Parity codec](parity/index.html): XOR parity compute, verify, and
//!   reconstruction of a missing fragment.
//! * Region table: per-region grant state, in-flight counts, and deferred
//!   requests, keyed by region number.
//! * [I/O dispatcher](io/dispatch/index.html): classifies incoming requests
//!   and stripes them into per-member children.
//! * Completion path: sibling counting, degraded-read reconstruction, and
//!   delayed region release.
//! * [Protocol engine](proto/index.html): the outbound worker and the inbound
//!   and control readers speaking the grant/release protocol.
//! * [Device lifecycle](device/index.html): construction from member devices
//!   and the control socket, and teardown.
//!
//! The kernel block layer, the authority server, and resync orchestration
//! are external collaborators; see [`MemberDevice`] for the member seam.

#[macro_use]
extern crate log;

pub mod config;
pub mod device;
pub mod io;
pub mod parity;
pub mod proto;
mod region;
mod util;

pub use crate::config::Options;
pub use crate::device::{DeviceParams, Error, RaidDevice, MAX_MEMBERS};
pub use crate::io::{
    ChildIo, Direction, EndIo, FileMember, IoError, IoRequest, IoResult, MemberDevice, PageBuf,
    PageVec, SECTOR_SHIFT,
};
