//! Broker channel between launcher and compositor child
//!
//! A SOCK_SEQPACKET socketpair carries JSON-encoded messages, one datagram
//! per message so boundaries are preserved. Device descriptors granted by
//! the launcher travel out-of-band via SCM_RIGHTS, attached to the reply
//! datagram. The launcher end is close-on-exec; the child end is inherited
//! across exec and its number is exported in `VTLAUNCH_SOCK`.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{
    self, recvmsg, sendmsg, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::fstat;
use serde::{Deserialize, Serialize};

use super::LaunchError;

/// Environment variable carrying the child end's fd number
pub const SOCK_ENV: &str = "VTLAUNCH_SOCK";

const MAX_MESSAGE: usize = 4096;

/// Messages sent by the child
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    /// Open a device with the launcher's privilege
    OpenRequest { device_path: String },
    /// Rendering has stopped after a `Deactivate` notice
    DeactivateDone,
}

/// Messages sent by the launcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LauncherMessage {
    /// Reply to `OpenRequest`: 0 with the descriptor attached, or the
    /// negated errno with nothing attached
    OpenReply { status: i32 },
    /// The VT was (re)acquired; rendering may resume
    Activate,
    /// The VT is being released; stop rendering and confirm
    Deactivate,
}

/// Outcome of a non-blocking read on the launcher end
#[derive(Debug)]
pub enum ChannelRead {
    Message(ChildMessage),
    /// Nothing to read right now (or a malformed datagram was dropped)
    Empty,
    /// The child closed its end
    Eof,
}

/// The privileged open behind `OpenRequest`. Only character devices are
/// handed out; anything else is refused with EPERM. Failures map to the
/// negated errno of the underlying open.
fn open_device(path: &str) -> Result<File, i32> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| -e.raw_os_error().unwrap_or(libc::EIO))?;
    let st = fstat(file.as_raw_fd()).map_err(|e| -(e as i32))?;
    if (st.st_mode & libc::S_IFMT) != libc::S_IFCHR {
        return Err(-libc::EPERM);
    }
    Ok(file)
}

fn send_json(fd: RawFd, json: &[u8]) -> Result<(), Errno> {
    loop {
        // MSG_NOSIGNAL: a dead peer must surface as EPIPE, not SIGPIPE
        match socket::send(fd, json, MsgFlags::MSG_NOSIGNAL) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Receive one datagram plus any attached descriptor
fn recv_with_fd(fd: RawFd, flags: MsgFlags) -> Result<(Vec<u8>, Option<OwnedFd>), Errno> {
    let mut buf = vec![0u8; MAX_MESSAGE];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);
    let (n, received) = loop {
        let mut iov = [IoSliceMut::new(&mut buf)];
        match recvmsg::<UnixAddr>(
            fd,
            &mut iov,
            Some(&mut cmsg_buf),
            flags | MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => {
                let mut received = None;
                for cmsg in msg.cmsgs() {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for f in fds {
                            received = Some(unsafe { OwnedFd::from_raw_fd(f) });
                        }
                    }
                }
                break (msg.bytes, received);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    };
    buf.truncate(n);
    Ok((buf, received))
}

/// Launcher end of the broker channel
pub struct BrokerChannel {
    launcher: Option<OwnedFd>,
    child: Option<OwnedFd>,
    peer_closed: bool,
}

impl BrokerChannel {
    /// Create the connected pair. Close-on-exec is set only on the
    /// launcher end; the child end must survive exec.
    pub fn new() -> Result<Self, LaunchError> {
        let (launcher, child) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )
        .map_err(|e| LaunchError::Channel(format!("socketpair: {}", e)))?;

        fcntl(launcher.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| LaunchError::Channel(format!("fcntl FD_CLOEXEC: {}", e)))?;

        Ok(Self {
            launcher: Some(launcher),
            child: Some(child),
            peer_closed: false,
        })
    }

    /// Launcher-end descriptor, for polling
    pub fn raw_fd(&self) -> RawFd {
        self.launcher.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    /// Child-end descriptor number, valid until the end is taken
    pub fn child_fd(&self) -> Option<RawFd> {
        self.child.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Launcher-end descriptor number, for the child to close before exec
    pub fn launcher_fd(&self) -> Option<RawFd> {
        self.launcher.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Take the child end out. The parent drops it right after fork so no
    /// duplicate lingers; tests use it to drive the other side directly.
    pub fn take_child_end(&mut self) -> Option<OwnedFd> {
        self.child.take()
    }

    /// True once the child has closed its end; polling it is pointless.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Non-blocking read of one child message. Malformed datagrams are
    /// logged and dropped; they never abort the session.
    pub fn recv(&mut self) -> ChannelRead {
        let fd = match &self.launcher {
            Some(fd) => fd.as_raw_fd(),
            None => return ChannelRead::Eof,
        };
        let mut buf = [0u8; MAX_MESSAGE];
        loop {
            match socket::recv(fd, &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => {
                    debug!("Broker channel: child closed its end");
                    self.peer_closed = true;
                    return ChannelRead::Eof;
                }
                Ok(n) => match serde_json::from_slice::<ChildMessage>(&buf[..n]) {
                    Ok(msg) => return ChannelRead::Message(msg),
                    Err(e) => {
                        warn!("Ignoring malformed broker message: {}", e);
                        return ChannelRead::Empty;
                    }
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => return ChannelRead::Empty,
                Err(e) => {
                    warn!("Broker channel read error: {}", e);
                    self.peer_closed = true;
                    return ChannelRead::Eof;
                }
            }
        }
    }

    /// Send a notification to the child. A peer that already went away is
    /// not an error; its death is reported through SIGCHLD.
    pub fn send(&mut self, msg: &LauncherMessage) -> Result<(), LaunchError> {
        let fd = match &self.launcher {
            Some(fd) => fd.as_raw_fd(),
            None => return Err(LaunchError::Channel("channel closed".to_string())),
        };
        let json = serde_json::to_vec(msg)
            .map_err(|e| LaunchError::Channel(format!("encode: {}", e)))?;
        match send_json(fd, &json) {
            Ok(()) => Ok(()),
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                debug!("Broker channel: send after child hangup");
                self.peer_closed = true;
                Ok(())
            }
            Err(e) => Err(LaunchError::Channel(format!("send: {}", e))),
        }
    }

    /// Send a reply with a descriptor attached via SCM_RIGHTS
    fn send_with_fd(&mut self, msg: &LauncherMessage, fd: BorrowedFd) -> Result<(), LaunchError> {
        let sock = match &self.launcher {
            Some(s) => s.as_raw_fd(),
            None => return Err(LaunchError::Channel("channel closed".to_string())),
        };
        let json = serde_json::to_vec(msg)
            .map_err(|e| LaunchError::Channel(format!("encode: {}", e)))?;
        let iov = [IoSlice::new(&json)];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        loop {
            match sendmsg::<UnixAddr>(sock, &iov, &cmsg, MsgFlags::MSG_NOSIGNAL, None) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    debug!("Broker channel: reply after child hangup");
                    self.peer_closed = true;
                    return Ok(());
                }
                Err(e) => return Err(LaunchError::Channel(format!("sendmsg: {}", e))),
            }
        }
    }

    /// Perform the privileged open for the child and send the reply. The
    /// launcher's copy of the descriptor is closed once it has been sent.
    pub fn answer_open(&mut self, path: &str) -> Result<(), LaunchError> {
        match open_device(path) {
            Ok(file) => {
                info!("Opened {} for the compositor", path);
                self.send_with_fd(&LauncherMessage::OpenReply { status: 0 }, file.as_fd())
            }
            Err(status) => {
                warn!(
                    "Refusing to open {}: {}",
                    path,
                    Errno::from_i32(-status)
                );
                self.send(&LauncherMessage::OpenReply { status })
            }
        }
    }

    /// Close both ends. Safe to call more than once.
    pub fn close(&mut self) {
        self.child.take();
        self.launcher.take();
    }
}

/// Compositor side of the channel. Connect with [`ChildChannel::from_env`]
/// inside the launched process.
#[allow(dead_code)]
pub struct ChildChannel {
    fd: OwnedFd,
    /// Notifications that arrived while a reply was being awaited
    pending: VecDeque<LauncherMessage>,
}

#[allow(dead_code)]
impl ChildChannel {
    /// Connect from the descriptor number exported by the launcher
    pub fn from_env() -> Result<Self, LaunchError> {
        let val = std::env::var(SOCK_ENV)
            .map_err(|_| LaunchError::Channel(format!("{} not set", SOCK_ENV)))?;
        let raw: RawFd = val
            .parse()
            .map_err(|_| LaunchError::Channel(format!("invalid {}: {}", SOCK_ENV, val)))?;
        let st = fstat(raw)
            .map_err(|e| LaunchError::Channel(format!("{} fd {}: {}", SOCK_ENV, raw, e)))?;
        if (st.st_mode & libc::S_IFMT) != libc::S_IFSOCK {
            return Err(LaunchError::Channel(format!(
                "{} fd {} is not a socket",
                SOCK_ENV, raw
            )));
        }
        Ok(Self::from_fd(unsafe { OwnedFd::from_raw_fd(raw) }))
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            fd,
            pending: VecDeque::new(),
        }
    }

    fn send(&mut self, msg: &ChildMessage) -> Result<(), LaunchError> {
        let json = serde_json::to_vec(msg)
            .map_err(|e| LaunchError::Channel(format!("encode: {}", e)))?;
        send_json(self.fd.as_raw_fd(), &json)
            .map_err(|e| LaunchError::Channel(format!("send: {}", e)))
    }

    /// Blocking read of one launcher message and any attached descriptor
    fn recv(&mut self) -> Result<(LauncherMessage, Option<OwnedFd>), LaunchError> {
        let (buf, fd) = recv_with_fd(self.fd.as_raw_fd(), MsgFlags::empty())
            .map_err(|e| LaunchError::Channel(format!("recv: {}", e)))?;
        if buf.is_empty() {
            return Err(LaunchError::Channel("launcher closed the channel".to_string()));
        }
        let msg = serde_json::from_slice(&buf)
            .map_err(|e| LaunchError::Protocol(format!("bad launcher message: {}", e)))?;
        Ok((msg, fd))
    }

    /// Ask the launcher to open a device; returns the transferred
    /// descriptor. Notifications arriving in the meantime are queued.
    pub fn open_device(&mut self, path: &str) -> Result<OwnedFd, LaunchError> {
        self.send(&ChildMessage::OpenRequest {
            device_path: path.to_string(),
        })?;
        loop {
            let (msg, fd) = self.recv()?;
            match msg {
                LauncherMessage::OpenReply { status: 0 } => {
                    return fd.ok_or_else(|| {
                        LaunchError::Protocol("open reply without a descriptor".to_string())
                    });
                }
                LauncherMessage::OpenReply { status } => {
                    return Err(LaunchError::Channel(format!(
                        "open {} refused: {}",
                        path,
                        Errno::from_i32(-status)
                    )));
                }
                notice => self.pending.push_back(notice),
            }
        }
    }

    /// Next VT notification (blocking), preferring any queued one
    pub fn next_notice(&mut self) -> Result<LauncherMessage, LaunchError> {
        if let Some(notice) = self.pending.pop_front() {
            return Ok(notice);
        }
        let (msg, _) = self.recv()?;
        Ok(msg)
    }

    /// Confirm that rendering stopped after a `Deactivate`
    pub fn confirm_deactivate(&mut self) -> Result<(), LaunchError> {
        self.send(&ChildMessage::DeactivateDone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (BrokerChannel, ChildChannel) {
        let mut broker = BrokerChannel::new().unwrap();
        let child_end = broker.take_child_end().unwrap();
        (broker, ChildChannel::from_fd(child_end))
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let json = serde_json::to_string(&ChildMessage::OpenRequest {
            device_path: "/dev/dri/card0".to_string(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"open_request\""));
        assert!(json.contains("\"device_path\""));
        let json = serde_json::to_string(&LauncherMessage::Deactivate).unwrap();
        assert!(json.contains("\"type\":\"deactivate\""));
    }

    #[test]
    fn test_open_device_accepts_only_character_devices() {
        assert!(open_device("/dev/null").is_ok());
        assert_eq!(open_device("/no/such/device").unwrap_err(), -libc::ENOENT);
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = open_device(file.path().to_str().unwrap()).unwrap_err();
        assert_eq!(err, -libc::EPERM);
    }

    #[test]
    fn test_notification_roundtrip_and_confirm() {
        let (mut broker, mut child) = pair();
        broker.send(&LauncherMessage::Deactivate).unwrap();
        assert_eq!(child.next_notice().unwrap(), LauncherMessage::Deactivate);
        child.confirm_deactivate().unwrap();
        match broker.recv() {
            ChannelRead::Message(ChildMessage::DeactivateDone) => {}
            other => panic!("unexpected read: {:?}", other),
        }
    }

    #[test]
    fn test_launcher_recv_is_nonblocking_and_tolerant() {
        let (mut broker, child) = pair();
        // Nothing queued
        assert!(matches!(broker.recv(), ChannelRead::Empty));
        // Garbage is dropped, not fatal
        socket::send(
            child.fd.as_raw_fd(),
            b"not json",
            MsgFlags::empty(),
        )
        .unwrap();
        assert!(matches!(broker.recv(), ChannelRead::Empty));
        assert!(!broker.peer_closed());
        // Hangup surfaces as Eof and sticks
        drop(child);
        assert!(matches!(broker.recv(), ChannelRead::Eof));
        assert!(broker.peer_closed());
    }

    #[test]
    fn test_answer_open_transfers_a_descriptor() {
        let (mut broker, mut child) = pair();

        // Queue the reply first; both halves run on one thread here.
        broker.answer_open("/dev/null").unwrap();
        let fd = child.open_device("/dev/null").unwrap();
        let st = fstat(fd.as_raw_fd()).unwrap();
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFCHR);

        // The request the child sent is still queued on the broker side
        match broker.recv() {
            ChannelRead::Message(ChildMessage::OpenRequest { device_path }) => {
                assert_eq!(device_path, "/dev/null");
            }
            other => panic!("unexpected read: {:?}", other),
        }
    }

    #[test]
    fn test_answer_open_refusal_carries_no_descriptor() {
        let (mut broker, mut child) = pair();
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();

        broker.answer_open(&path).unwrap();
        let err = child.open_device(&path).unwrap_err();
        assert!(err.to_string().contains("EPERM"), "got: {}", err);
    }

    #[test]
    fn test_send_after_child_hangup_is_absorbed() {
        let (mut broker, child) = pair();
        drop(child);
        broker.send(&LauncherMessage::Activate).unwrap();
        assert!(broker.peer_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut broker, _child) = pair();
        broker.close();
        broker.close();
        assert!(matches!(broker.recv(), ChannelRead::Eof));
        assert!(broker.send(&LauncherMessage::Activate).is_err());
    }
}
