//! Session control loop
//!
//! Single-threaded poll over two descriptors: the signalfd and the broker
//! channel. Transitions are computed as plain state + action pairs so the
//! switch protocol (notably the gated release acknowledgement) is
//! testable without a VT or a child process.

use std::os::unix::io::BorrowedFd;

use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::channel::{BrokerChannel, ChannelRead, ChildMessage, LauncherMessage};
use super::signals::{SignalEvent, SignalSource};
use super::supervisor;
use super::vt::VtSession;
use super::{LaunchError, Lifecycle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// Session up, VT owned (or a switch away has completed)
    Running,
    /// Release requested; waiting for the child to confirm it stopped
    Deactivating,
}

/// What the driver must do after a transition, in order
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    /// Collect the child and leave the loop with its status
    ReapChild,
    /// Pass a termination signal through to the child
    ForwardToChild(Signal),
    SendDeactivate,
    SendActivate,
    /// VT_RELDISP(1): allowed only once the child confirmed
    AckRelease,
    /// VT_RELDISP(VT_ACKACQ)
    AckAcquire,
    /// Privileged open on the child's behalf
    OpenDevice(String),
}

fn on_signal(state: LoopState, event: &SignalEvent) -> (LoopState, Vec<Action>) {
    match event {
        SignalEvent::ChildExit => (state, vec![Action::ReapChild]),
        SignalEvent::Terminate(sig) => (state, vec![Action::ForwardToChild(*sig)]),
        SignalEvent::ReleaseRequested => match state {
            LoopState::Running => (LoopState::Deactivating, vec![Action::SendDeactivate]),
            LoopState::Deactivating => {
                debug!("VT release requested while one is already pending");
                (LoopState::Deactivating, vec![])
            }
        },
        // The kernel hands the VT back regardless of our state; tell the
        // child to resume either way.
        SignalEvent::Acquired => (
            LoopState::Running,
            vec![Action::AckAcquire, Action::SendActivate],
        ),
    }
}

fn on_message(state: LoopState, msg: &ChildMessage) -> (LoopState, Vec<Action>) {
    match msg {
        ChildMessage::OpenRequest { device_path } => {
            (state, vec![Action::OpenDevice(device_path.clone())])
        }
        ChildMessage::DeactivateDone => match state {
            LoopState::Deactivating => (LoopState::Running, vec![Action::AckRelease]),
            LoopState::Running => {
                warn!("Unsolicited deactivation confirmation from the child");
                (LoopState::Running, vec![])
            }
        },
    }
}

/// Wait for either descriptor to become readable. A closed broker
/// channel is left out of the set so it cannot spin the loop.
fn wait_ready(signal_fd: i32, channel_fd: Option<i32>) -> Result<(bool, bool), LaunchError> {
    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    // Both descriptors outlive the poll call
    let signal_bfd = unsafe { BorrowedFd::borrow_raw(signal_fd) };
    let channel_bfd = channel_fd.map(|fd| unsafe { BorrowedFd::borrow_raw(fd) });
    let mut fds = vec![PollFd::new(&signal_bfd, PollFlags::POLLIN)];
    if let Some(bfd) = channel_bfd.as_ref() {
        fds.push(PollFd::new(bfd, PollFlags::POLLIN));
    }
    match poll(&mut fds, -1) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok((false, false)),
        Err(e) => return Err(LaunchError::EventWait(format!("poll: {}", e))),
    }
    let signal_ready = fds[0].revents().map_or(false, |r| r.intersects(ready));
    let channel_ready = fds
        .get(1)
        .and_then(|fd| fd.revents())
        .map_or(false, |r| r.intersects(ready));
    Ok((signal_ready, channel_ready))
}

fn publish(state: LoopState, lifecycle: &mut Lifecycle) {
    *lifecycle = match state {
        LoopState::Running => Lifecycle::Running,
        LoopState::Deactivating => Lifecycle::Deactivating,
    };
}

/// Drive the session until the child is gone. Returns the exit status the
/// launcher should report; channel trouble with the child is tolerated,
/// signalfd trouble is not.
pub fn run(
    signals: &mut SignalSource,
    channel: &mut BrokerChannel,
    vt: &mut VtSession,
    child: Pid,
    lifecycle: &mut Lifecycle,
) -> Result<i32, LaunchError> {
    let mut state = LoopState::Running;
    loop {
        let channel_fd = if channel.peer_closed() {
            None
        } else {
            Some(channel.raw_fd()).filter(|fd| *fd >= 0)
        };
        let (signal_ready, channel_ready) = wait_ready(signals.raw_fd(), channel_fd)?;

        if signal_ready {
            while let Some(event) = signals.read_event()? {
                let (next, actions) = on_signal(state, &event);
                state = next;
                publish(state, lifecycle);
                if let Some(status) = perform(actions, channel, vt, child) {
                    return Ok(status);
                }
            }
        }

        if channel_ready {
            loop {
                match channel.recv() {
                    ChannelRead::Message(msg) => {
                        let (next, actions) = on_message(state, &msg);
                        state = next;
                        publish(state, lifecycle);
                        if let Some(status) = perform(actions, channel, vt, child) {
                            return Ok(status);
                        }
                    }
                    ChannelRead::Empty => break,
                    ChannelRead::Eof => {
                        // Not fatal: the child's exit still arrives via
                        // SIGCHLD and decides the final status.
                        debug!("Broker channel closed; continuing on signals only");
                        break;
                    }
                }
            }
        }
    }
}

/// Execute the actions a transition produced. Failures here are logged
/// and absorbed; only a reaped child ends the loop.
fn perform(
    actions: Vec<Action>,
    channel: &mut BrokerChannel,
    vt: &mut VtSession,
    child: Pid,
) -> Option<i32> {
    for action in actions {
        match action {
            Action::ReapChild => {
                return Some(supervisor::reap(child).unwrap_or(super::EXIT_FAILURE));
            }
            Action::ForwardToChild(sig) => {
                debug!("Forwarding {} to the compositor", sig);
                if let Err(e) = kill(child, sig) {
                    warn!("Could not forward {} to pid {}: {}", sig, child, e);
                }
            }
            Action::SendDeactivate => {
                if let Err(e) = channel.send(&LauncherMessage::Deactivate) {
                    warn!("{}", e);
                }
            }
            Action::SendActivate => {
                if let Err(e) = channel.send(&LauncherMessage::Activate) {
                    warn!("{}", e);
                }
            }
            Action::AckRelease => {
                if let Err(e) = vt.ack_release() {
                    warn!("{}", e);
                }
            }
            Action::AckAcquire => {
                if let Err(e) = vt.ack_acquire() {
                    warn!("{}", e);
                }
            }
            Action::OpenDevice(path) => {
                if let Err(e) = channel.answer_open(&path) {
                    warn!("{}", e);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_is_not_acked_before_confirmation() {
        let (state, actions) = on_signal(LoopState::Running, &SignalEvent::ReleaseRequested);
        assert_eq!(state, LoopState::Deactivating);
        assert_eq!(actions, vec![Action::SendDeactivate]);
        assert!(!actions.contains(&Action::AckRelease));
    }

    #[test]
    fn test_confirmation_releases_the_vt() {
        let (state, actions) =
            on_message(LoopState::Deactivating, &ChildMessage::DeactivateDone);
        assert_eq!(state, LoopState::Running);
        assert_eq!(actions, vec![Action::AckRelease]);
    }

    #[test]
    fn test_unsolicited_confirmation_is_ignored() {
        let (state, actions) = on_message(LoopState::Running, &ChildMessage::DeactivateDone);
        assert_eq!(state, LoopState::Running);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_duplicate_release_request_sends_nothing() {
        let (state, actions) =
            on_signal(LoopState::Deactivating, &SignalEvent::ReleaseRequested);
        assert_eq!(state, LoopState::Deactivating);
        assert!(actions.is_empty());
    }

    #[test]
    fn test_acquire_acks_before_notifying() {
        let (state, actions) = on_signal(LoopState::Deactivating, &SignalEvent::Acquired);
        assert_eq!(state, LoopState::Running);
        assert_eq!(actions, vec![Action::AckAcquire, Action::SendActivate]);
    }

    #[test]
    fn test_termination_is_forwarded_not_fatal() {
        let (state, actions) =
            on_signal(LoopState::Running, &SignalEvent::Terminate(Signal::SIGTERM));
        assert_eq!(state, LoopState::Running);
        assert_eq!(actions, vec![Action::ForwardToChild(Signal::SIGTERM)]);
    }

    #[test]
    fn test_child_exit_reaps_in_any_state() {
        for state in [LoopState::Running, LoopState::Deactivating] {
            let (next, actions) = on_signal(state, &SignalEvent::ChildExit);
            assert_eq!(next, state);
            assert_eq!(actions, vec![Action::ReapChild]);
        }
    }

    #[test]
    fn test_open_request_passes_through_while_deactivating() {
        let (state, actions) = on_message(
            LoopState::Deactivating,
            &ChildMessage::OpenRequest {
                device_path: "/dev/input/event3".to_string(),
            },
        );
        assert_eq!(state, LoopState::Deactivating);
        assert_eq!(
            actions,
            vec![Action::OpenDevice("/dev/input/event3".to_string())]
        );
    }
}
