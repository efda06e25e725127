//! SCM_RIGHTS file-descriptor passing on the control socket.
//!
//! The data socket is opened by the local daemon and handed to the client as
//! ancillary data on a 4-byte carrier message. `send_fd` is the daemon side;
//! the in-tree consumer is the test harness, which plays the daemon.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

const CARRIER: [u8; 4] = *b"sock";

/// Ancillary buffer with cmsghdr alignment.
#[repr(align(8))]
struct CmsgSpace([u8; 64]);

/// Send `fd` over `sock` attached to a 4-byte carrier.
pub fn send_fd(sock: &UnixStream, fd: RawFd) -> io::Result<()> {
    let mut carrier = CARRIER;
    let mut iov = libc::iovec {
        iov_base: carrier.as_mut_ptr().cast(),
        iov_len: carrier.len(),
    };
    let mut space = CmsgSpace([0; 64]);

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.0.as_mut_ptr().cast();
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);

        if libc::sendmsg(sock.as_raw_fd(), &msg, 0) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Receive a file descriptor sent by [`send_fd`]. Reads exactly the 4-byte
/// carrier, so it composes with the framed messages around it.
pub fn recv_fd(sock: &UnixStream) -> io::Result<RawFd> {
    let mut carrier = [0u8; 4];
    let mut iov = libc::iovec {
        iov_base: carrier.as_mut_ptr().cast(),
        iov_len: carrier.len(),
    };
    let mut space = CmsgSpace([0; 64]);

    unsafe {
        let mut msg: libc::msghdr = mem::zeroed();
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = space.0.as_mut_ptr().cast();
        msg.msg_controllen = libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) as _;

        let received = libc::recvmsg(sock.as_raw_fd(), &mut msg, 0);
        if received < 0 {
            return Err(io::Error::last_os_error());
        }
        if received == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no ancillary data on socket handover",
            ));
        }
        if (*cmsg).cmsg_level != libc::SOL_SOCKET
            || (*cmsg).cmsg_type != libc::SCM_RIGHTS
            || (*cmsg).cmsg_len != libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected ancillary data on socket handover",
            ));
        }
        Ok(std::ptr::read_unaligned(
            libc::CMSG_DATA(cmsg).cast::<RawFd>(),
        ))
    }
}
