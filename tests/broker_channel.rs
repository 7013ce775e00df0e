//! Kernel-level checks for the broker socket contract.
//!
//! The launcher hands its compositor child one end of a SOCK_SEQPACKET pair
//! and the two sides exchange tagged JSON datagrams, with device descriptors
//! riding along as SCM_RIGHTS. These tests pin down the platform behavior
//! that contract depends on: one send is one read, transferred descriptors
//! arrive close-on-exec, a closed peer reads as EOF and writes as EPIPE.

use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::cmsg_space;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::socket::{
    recv, recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned,
    MsgFlags, SockFlag, SockType, UnixAddr,
};

fn pair() -> (OwnedFd, OwnedFd) {
    socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::empty(),
    )
    .expect("socketpair")
}

fn send_bytes(fd: RawFd, payload: &[u8]) {
    let iov = [IoSlice::new(payload)];
    sendmsg::<UnixAddr>(fd, &iov, &[], MsgFlags::MSG_NOSIGNAL, None).expect("sendmsg");
}

fn recv_bytes(fd: RawFd) -> Vec<u8> {
    let mut buf = vec![0u8; 4096];
    let n = recv(fd, &mut buf, MsgFlags::empty()).expect("recv");
    buf.truncate(n);
    buf
}

#[test]
fn test_each_send_is_one_datagram() {
    let (a, b) = pair();
    let first = serde_json::to_vec(&serde_json::json!({"type": "activate"})).unwrap();
    let second = serde_json::to_vec(&serde_json::json!({"type": "deactivate"})).unwrap();
    send_bytes(a.as_raw_fd(), &first);
    send_bytes(a.as_raw_fd(), &second);

    // SEQPACKET hands back exactly one message per read, so neither side
    // ever has to re-frame concatenated JSON.
    assert_eq!(recv_bytes(b.as_raw_fd()), first);
    assert_eq!(recv_bytes(b.as_raw_fd()), second);
}

#[test]
fn test_descriptor_transfer_sets_cloexec() {
    let (a, b) = pair();
    let file = std::fs::File::open("/dev/null").unwrap();

    let payload =
        serde_json::to_vec(&serde_json::json!({"type": "open_reply", "status": 0})).unwrap();
    let iov = [IoSlice::new(&payload)];
    let fds = [file.as_raw_fd()];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    sendmsg::<UnixAddr>(a.as_raw_fd(), &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None).unwrap();

    let mut buf = vec![0u8; 4096];
    let mut space = cmsg_space!([RawFd; 1]);
    let (n, received) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let msg = recvmsg::<UnixAddr>(
            b.as_raw_fd(),
            &mut iov,
            Some(&mut space),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .unwrap();
        let mut fd = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(list) = cmsg {
                fd = list.into_iter().next();
            }
        }
        (msg.bytes, fd)
    };
    buf.truncate(n);
    assert_eq!(buf, payload);

    let fd = received.expect("descriptor arrived with the reply");
    assert_ne!(fd, file.as_raw_fd());

    // MSG_CMSG_CLOEXEC must tag the descriptor as it arrives, otherwise it
    // would leak into any child forked between recvmsg and fcntl.
    let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
    assert_ne!(flags & libc::FD_CLOEXEC, 0);

    // The new descriptor refers to the same character device.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    assert_eq!(unsafe { libc::fstat(fd, &mut st) }, 0);
    assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFCHR);

    unsafe { libc::close(fd) };
}

#[test]
fn test_peer_close_reads_as_eof() {
    let (a, b) = pair();
    drop(a);

    let mut buf = [0u8; 64];
    assert_eq!(recv(b.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap(), 0);
    // EOF is sticky
    assert_eq!(recv(b.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap(), 0);
}

#[test]
fn test_send_after_close_is_epipe_not_sigpipe() {
    let (a, b) = pair();
    drop(b);

    // MSG_NOSIGNAL turns the would-be SIGPIPE into a plain error; without it
    // the default disposition would kill the whole test runner.
    let iov = [IoSlice::new(b"{\"type\":\"activate\"}")];
    let err =
        sendmsg::<UnixAddr>(a.as_raw_fd(), &iov, &[], MsgFlags::MSG_NOSIGNAL, None).unwrap_err();
    assert_eq!(err, Errno::EPIPE);
}

#[test]
fn test_nonblocking_read_reports_would_block() {
    let (_a, b) = pair();
    let mut buf = [0u8; 64];
    let err = recv(b.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT).unwrap_err();
    assert_eq!(err, Errno::EAGAIN);
}
