//! Shared utilities: synchronization primitives and the built-in logger.

pub(crate) mod logger;
pub(crate) mod monitor;

pub(crate) use monitor::{DestroyHold, SocketSlot, WorkMonitor};
