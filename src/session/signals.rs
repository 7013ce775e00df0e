//! Consolidated signal descriptor
//!
//! Every handled signal is blocked and read synchronously from a single
//! signalfd inside the control loop. No handler runs in interrupt context,
//! so no shared state is ever touched asynchronously.

use std::os::unix::io::{AsRawFd, RawFd};

use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};

use super::vt::{ACQUIRE_SIGNAL, RELEASE_SIGNAL};
use super::LaunchError;

/// A signal read from the descriptor, tagged for the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGCHLD: a child changed state
    ChildExit,
    /// SIGINT/SIGTERM: the launcher was asked to stop; forward to the child
    Terminate(Signal),
    /// The kernel wants the VT back
    ReleaseRequested,
    /// The kernel handed the VT over
    Acquired,
}

/// The signal set read through the descriptor. The child unblocks exactly
/// this set before exec so the compositor starts with a clean mask.
pub fn handled_signals() -> SigSet {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.add(Signal::SIGINT);
    mask.add(Signal::SIGTERM);
    mask.add(RELEASE_SIGNAL);
    mask.add(ACQUIRE_SIGNAL);
    mask
}

fn map_signal(signo: u32) -> Result<SignalEvent, LaunchError> {
    match Signal::try_from(signo as i32) {
        Ok(Signal::SIGCHLD) => Ok(SignalEvent::ChildExit),
        Ok(sig @ (Signal::SIGINT | Signal::SIGTERM)) => Ok(SignalEvent::Terminate(sig)),
        Ok(sig) if sig == RELEASE_SIGNAL => Ok(SignalEvent::ReleaseRequested),
        Ok(sig) if sig == ACQUIRE_SIGNAL => Ok(SignalEvent::Acquired),
        _ => Err(LaunchError::SignalRead(format!(
            "unexpected signal {} on descriptor",
            signo
        ))),
    }
}

/// Owns the signalfd, the blocked mask, and the changed dispositions;
/// everything is restored on close.
pub struct SignalSource {
    sfd: Option<SignalFd>,
    old_mask: SigSet,
}

impl SignalSource {
    /// Set dispositions (SIGCHLD with SA_NOCLDSTOP|SA_RESTART, SIGHUP
    /// ignored), block the handled set, and create the descriptor.
    pub fn new() -> Result<Self, LaunchError> {
        let chld = SigAction::new(
            SigHandler::SigDfl,
            SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGCHLD, &chld) }
            .map_err(|e| LaunchError::ResourceAcquisition(format!("sigaction SIGCHLD: {}", e)))?;

        // A dying controlling process must not take the launcher down; the
        // child restores the default before exec.
        let ign = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGHUP, &ign) }
            .map_err(|e| LaunchError::ResourceAcquisition(format!("sigaction SIGHUP: {}", e)))?;

        let mask = handled_signals();
        let old_mask = mask
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(|e| LaunchError::ResourceAcquisition(format!("block signals: {}", e)))?;

        let sfd = match SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
        {
            Ok(sfd) => sfd,
            Err(e) => {
                if let Err(e2) = old_mask.thread_set_mask() {
                    warn!("Failed to restore signal mask: {}", e2);
                }
                return Err(LaunchError::ResourceAcquisition(format!("signalfd: {}", e)));
            }
        };

        Ok(Self {
            sfd: Some(sfd),
            old_mask,
        })
    }

    /// Raw descriptor for polling
    pub fn raw_fd(&self) -> RawFd {
        self.sfd.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    /// Read one pending signal, non-blocking. `Ok(None)` means nothing is
    /// pending. Read failures and unexpected signal numbers are fatal per
    /// the control-loop contract.
    pub fn read_event(&mut self) -> Result<Option<SignalEvent>, LaunchError> {
        let sfd = self
            .sfd
            .as_mut()
            .ok_or_else(|| LaunchError::SignalRead("descriptor already closed".to_string()))?;
        match sfd.read_signal() {
            Ok(Some(siginfo)) => map_signal(siginfo.ssi_signo).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(LaunchError::SignalRead(e.to_string())),
        }
    }

    /// Restore dispositions and the saved mask, close the descriptor.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.sfd.take().is_none() {
            return;
        }
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            if let Err(e) = sigaction(Signal::SIGCHLD, &dfl) {
                warn!("Failed to restore SIGCHLD disposition: {}", e);
            }
            if let Err(e) = sigaction(Signal::SIGHUP, &dfl) {
                warn!("Failed to restore SIGHUP disposition: {}", e);
            }
        }
        if let Err(e) = self.old_mask.thread_set_mask() {
            warn!("Failed to restore signal mask: {}", e);
        }
        debug!("Signal descriptor closed");
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_signal() {
        assert_eq!(
            map_signal(Signal::SIGCHLD as u32).unwrap(),
            SignalEvent::ChildExit
        );
        assert_eq!(
            map_signal(Signal::SIGINT as u32).unwrap(),
            SignalEvent::Terminate(Signal::SIGINT)
        );
        assert_eq!(
            map_signal(Signal::SIGTERM as u32).unwrap(),
            SignalEvent::Terminate(Signal::SIGTERM)
        );
        assert_eq!(
            map_signal(Signal::SIGUSR1 as u32).unwrap(),
            SignalEvent::ReleaseRequested
        );
        assert_eq!(
            map_signal(Signal::SIGUSR2 as u32).unwrap(),
            SignalEvent::Acquired
        );
    }

    #[test]
    fn test_map_signal_rejects_unhandled() {
        assert!(map_signal(Signal::SIGPIPE as u32).is_err());
        assert!(map_signal(0).is_err());
    }

    #[test]
    fn test_handled_signals_contains_switch_pair() {
        let mask = handled_signals();
        assert!(mask.contains(RELEASE_SIGNAL));
        assert!(mask.contains(ACQUIRE_SIGNAL));
        assert!(mask.contains(Signal::SIGCHLD));
    }

    #[test]
    fn test_source_open_read_close() {
        let mut source = SignalSource::new().unwrap();
        assert!(source.raw_fd() >= 0);
        // Nothing pending
        assert!(matches!(source.read_event(), Ok(None)));
        source.close();
        // Second close is a no-op
        source.close();
        assert!(source.read_event().is_err());
    }
}
