//! The client/server message protocol.
//!
//! Both sockets carry length-prefixed binary messages: a little-endian
//! `{ u32 code, u32 length }` head followed by `length` body bytes. Bodies
//! are a `u64` regnum, a `u32` argument, or empty. A body longer than
//! [`MAX_BODY`] is fatal for the connection.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;
use strum_macros::FromRepr;

pub mod fdpass;
pub(crate) mod inbound;
pub(crate) mod outbound;

/// Upper bound on a message body.
pub const MAX_BODY: usize = 64;
const_assert!(MAX_BODY >= 8);

/// Message codes shared with the server and the local control daemon.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MsgCode {
    /// Control: client asks the local daemon for a data socket.
    NeedServer = 1,
    /// Control: daemon reply; an SCM_RIGHTS fd with the data socket follows.
    ConnectServer = 2,
    /// Control: client confirms the data socket is up and identified.
    ReplyConnectServer = 3,
    /// Data: client introduces itself. Body: `u32` id.
    Identify = 4,
    /// Data: server accepts. Body: `u32` region-size bits.
    ReplyIdentify = 5,
    /// Data: client asks for a write grant. Body: `u64` regnum.
    RequestWrite = 6,
    /// Data: client returns a grant. Body: `u64` regnum.
    ReleaseWrite = 7,
    /// Data: grant reply, region parity is in sync. Body: `u64` regnum.
    GrantSynced = 8,
    /// Data: grant reply, region is dirty. Body: `u64` regnum.
    GrantUnsynced = 9,
    /// Data: server publishes a dirty region. Body: `u64` regnum.
    AddUnsynced = 10,
    /// Data: server withdraws a dirty region. Body: `u64` regnum.
    DelUnsynced = 11,
    /// Data: server advances the highwater boundary. Body: `u64` regnum.
    SetHighwater = 12,
    /// Data: server wants the region back as soon as it quiesces.
    DrainRegion = 13,
    /// Data: stop sending new grant queries.
    PauseRequests = 14,
    /// Data: resume and flush queued grant queries.
    ResumeRequests = 15,
    /// Data: server asks the client to re-send a grant query.
    BounceRequest = 16,
}

/// Receive buffer for one message.
pub struct MessageBuf {
    code: u32,
    len: usize,
    body: [u8; MAX_BODY],
}

impl MessageBuf {
    pub fn new() -> Self {
        Self {
            code: 0,
            len: 0,
            body: [0; MAX_BODY],
        }
    }

    /// Read the next message. An oversized body is reported as
    /// `InvalidData`, which callers treat like any other connection error.
    pub fn read_from(&mut self, reader: &mut impl Read) -> io::Result<()> {
        self.code = reader.read_u32::<LittleEndian>()?;
        let len = reader.read_u32::<LittleEndian>()? as usize;
        if len > MAX_BODY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message {:x} too long ({} bytes)", self.code, len),
            ));
        }
        reader.read_exact(&mut self.body[..len])?;
        self.len = len;
        Ok(())
    }

    pub fn code(&self) -> Option<MsgCode> {
        MsgCode::from_repr(self.code)
    }

    pub fn raw_code(&self) -> u32 {
        self.code
    }

    pub fn body(&self) -> &[u8] {
        &self.body[..self.len]
    }

    /// The `u64` regnum body.
    pub fn regnum(&self) -> io::Result<u64> {
        let mut body = self.body();
        if body.len() != 8 {
            return Err(bad_body(self.code, self.len));
        }
        body.read_u64::<LittleEndian>()
    }

    /// The `u32` argument body (identify id, region bits).
    pub fn arg32(&self) -> io::Result<u32> {
        let mut body = self.body();
        if body.len() != 4 {
            return Err(bad_body(self.code, self.len));
        }
        body.read_u32::<LittleEndian>()
    }
}

impl Default for MessageBuf {
    fn default() -> Self {
        Self::new()
    }
}

fn bad_body(code: u32, len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message {:x} with bad body length {}", code, len),
    )
}

/// Write one message. The head and body go out in a single write so
/// concurrent senders on different sockets never interleave a frame.
pub fn write_message(writer: &mut impl Write, code: MsgCode, body: &[u8]) -> io::Result<()> {
    debug_assert!(body.len() <= MAX_BODY);
    let mut frame = Vec::with_capacity(8 + body.len());
    frame.write_u32::<LittleEndian>(code as u32)?;
    frame.write_u32::<LittleEndian>(body.len() as u32)?;
    frame.extend_from_slice(body);
    writer.write_all(&frame)
}

/// Body of the regnum-carrying messages.
pub fn region_body(regnum: u64) -> [u8; 8] {
    regnum.to_le_bytes()
}

/// Body of the `u32`-argument messages.
pub fn arg32_body(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut frame = Vec::new();
        write_message(&mut frame, MsgCode::RequestWrite, &region_body(0x1234)).unwrap();

        let mut buf = MessageBuf::new();
        buf.read_from(&mut frame.as_slice()).unwrap();
        assert_eq!(buf.code(), Some(MsgCode::RequestWrite));
        assert_eq!(buf.regnum().unwrap(), 0x1234);
    }

    #[test]
    fn empty_body() {
        let mut frame = Vec::new();
        write_message(&mut frame, MsgCode::PauseRequests, &[]).unwrap();
        let mut buf = MessageBuf::new();
        buf.read_from(&mut frame.as_slice()).unwrap();
        assert_eq!(buf.code(), Some(MsgCode::PauseRequests));
        assert!(buf.body().is_empty());
        assert!(buf.regnum().is_err());
    }

    #[test]
    fn oversized_body_is_fatal() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&6u32.to_le_bytes());
        frame.extend_from_slice(&(MAX_BODY as u32 + 1).to_le_bytes());
        frame.resize(8 + MAX_BODY + 1, 0);
        let mut buf = MessageBuf::new();
        let err = buf.read_from(&mut frame.as_slice()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_code_is_preserved() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&0xdeadu32.to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes());
        let mut buf = MessageBuf::new();
        buf.read_from(&mut frame.as_slice()).unwrap();
        assert_eq!(buf.code(), None);
        assert_eq!(buf.raw_code(), 0xdead);
    }
}
