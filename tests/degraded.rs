//! Degraded-mode scenarios: a dead data member and a dead parity member.

mod common;

use common::*;
use gridraid::proto::MsgCode;
use gridraid::Direction;

/// With data member 1 dead, reads fetch the surviving data plus parity and
/// reconstruct the missing fragment.
#[test]
fn degraded_read_reconstructs_dead_member() {
    let mut h = Harness::new(3, Some(1), false, Harness::fast_options());
    h.handshake(12);

    // Fabricate the on-disk state of a healthy write of `block` to region 7:
    // member 0 holds the first fragment, the parity member holds the XOR.
    let block = pattern(4096, 11);
    let (lo, hi) = block.split_at(2048);
    let member_offset = (7u64 << 12) as usize / 2; // member sector = sector >> 1
    h.members[0].seed(member_offset, lo);
    h.members[2].seed(member_offset, &xor(lo, hi));

    let (req, done, pages) = read_request(7 << 3, 4096);
    h.device.map(req);
    done.recv_timeout(READ_TIMEOUT).unwrap().unwrap();

    assert_eq!(h.members[0].log_len(), 1);
    assert_eq!(h.members[1].log_len(), 0);
    assert_eq!(h.members[2].log_len(), 1);
    assert_eq!(page_bytes(&pages), block);
}

/// With a data member dead, writes skip its child and parity covers the
/// survivors only, so reconstructing the lost column yields zeroes.
#[test]
fn degraded_write_zero_fills_dead_column() {
    let mut h = Harness::new(3, Some(1), false, Harness::fast_options());
    h.handshake(12);

    let data = pattern(4096, 12);
    let (req, done, _pages) = write_request(0, &data);
    h.device.map(req);
    assert_eq!(h.recv_data(), (MsgCode::RequestWrite, Some(0)));
    h.send_region(MsgCode::GrantSynced, 0);
    done.recv_timeout(READ_TIMEOUT).unwrap().unwrap();

    assert_eq!(h.members[0].log_len(), 1);
    assert_eq!(h.members[1].log_len(), 0);
    assert_eq!(h.members[2].log_len(), 1);
    let parity = h.members[2].log()[0].clone();
    assert_eq!(parity.dir, Direction::Write);
    // Parity equals the XOR of the surviving fragments alone; the dead
    // column contributes zeroes.
    assert_eq!(parity.data.as_deref().unwrap(), &data[..2048]);
}

/// A dead parity member costs nothing but the parity child, in both
/// directions.
#[test]
fn dead_parity_member_is_skipped() {
    let mut h = Harness::new(3, Some(2), false, Harness::fast_options());
    h.handshake(12);

    let data = pattern(4096, 13);
    let (req, done, _pages) = write_request(0, &data);
    h.device.map(req);
    assert_eq!(h.recv_data(), (MsgCode::RequestWrite, Some(0)));
    h.send_region(MsgCode::GrantSynced, 0);
    done.recv_timeout(READ_TIMEOUT).unwrap().unwrap();

    assert_eq!(h.members[0].log_len(), 1);
    assert_eq!(h.members[1].log_len(), 1);
    assert_eq!(h.members[2].log_len(), 0);

    // Reads are served from the data members as usual.
    let (req, done, pages) = read_request(0, 4096);
    h.device.map(req);
    done.recv_timeout(READ_TIMEOUT).unwrap().unwrap();
    assert_eq!(h.members[2].log_len(), 0);
    assert_eq!(page_bytes(&pages), data);
}
