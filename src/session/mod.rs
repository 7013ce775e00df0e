//! Privileged session plumbing
//!
//! [`LaunchSession`] carries a launch through its phases: VT acquisition,
//! PAM session, broker channel, signalfd, compositor child. Teardown runs
//! in strict reverse acquisition order, tolerates failing steps, and is
//! safe to repeat; a session that failed half-way unwinds through the
//! same path.

pub mod auth;
pub mod channel;
pub mod event_loop;
pub mod identity;
pub mod signals;
pub mod supervisor;
pub mod vt;

use log::{debug, info};
use nix::unistd::Pid;
use thiserror::Error;

use auth::AuthSession;
use channel::BrokerChannel;
use identity::Identity;
use signals::SignalSource;
use vt::VtSession;

/// Launcher exit status when the failure is our own rather than the
/// child's
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("tty/vt: {0}")]
    ResourceAcquisition(String),
    #[error("{0} is not a virtual terminal")]
    NotATerminal(String),
    #[error("pam: {0}")]
    Authentication(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("user lookup: {0}")]
    Identity(String),
    #[error("compositor start: {0}")]
    ChildStart(String),
    #[error("broker channel: {0}")]
    Channel(String),
    #[error("broker protocol: {0}")]
    Protocol(String),
    #[error("signalfd: {0}")]
    SignalRead(String),
    #[error("event wait: {0}")]
    EventWait(String),
}

/// Observable phase of a launch. Setup advances it in acquisition order;
/// the control loop toggles Running/Deactivating across VT switches;
/// teardown collapses everything to Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    TtyAcquired,
    SessionOpen,
    ChannelReady,
    Running,
    Deactivating,
    Terminating,
    Closed,
}

/// One privileged compositor launch, from VT acquisition to teardown
pub struct LaunchSession {
    identity: Identity,
    command: Vec<String>,
    lifecycle: Lifecycle,
    vt: Option<VtSession>,
    auth: Option<AuthSession>,
    channel: Option<BrokerChannel>,
    signals: Option<SignalSource>,
    child: Option<Pid>,
}

impl LaunchSession {
    pub fn new(identity: Identity, command: Vec<String>) -> Self {
        Self {
            identity,
            command,
            lifecycle: Lifecycle::Init,
            vt: None,
            auth: None,
            channel: None,
            signals: None,
            child: None,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Acquire everything and fork the child. The locals drop in reverse
    /// declaration order, which is the teardown order, so an error at any
    /// step unwinds exactly what was already acquired.
    fn bring_up(&mut self, tty: Option<&str>, pam_service: &str) -> Result<(), LaunchError> {
        let vt = VtSession::open(tty, self.identity.explicit)?;
        self.lifecycle = Lifecycle::TtyAcquired;
        info!("Virtual terminal {} acquired", vt.path());

        // A self-launch runs under the caller's existing login session;
        // only an identity switch gets its own PAM bracket.
        let auth = if self.identity.explicit {
            Some(AuthSession::open(
                pam_service,
                &self.identity.name,
                &vt.path(),
            )?)
        } else {
            None
        };
        self.lifecycle = Lifecycle::SessionOpen;

        let mut channel = BrokerChannel::new()?;
        let signals = SignalSource::new()?;
        self.lifecycle = Lifecycle::ChannelReady;

        let child = supervisor::spawn(&channel, &vt, &self.identity, &self.command)?;
        // The parent keeps only its own end of the channel
        channel.take_child_end();

        self.vt = Some(vt);
        self.auth = auth;
        self.channel = Some(channel);
        self.signals = Some(signals);
        self.child = Some(child);
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    fn drive(&mut self) -> Result<i32, LaunchError> {
        let (Some(signals), Some(channel), Some(vt), Some(child)) = (
            self.signals.as_mut(),
            self.channel.as_mut(),
            self.vt.as_mut(),
            self.child,
        ) else {
            return Err(LaunchError::EventWait("session is not running".to_string()));
        };
        event_loop::run(signals, channel, vt, child, &mut self.lifecycle)
    }

    /// Bring the session up, supervise the child, tear everything down.
    /// Returns the exit status the launcher should report for the child.
    pub fn run(&mut self, tty: Option<&str>, pam_service: &str) -> Result<i32, LaunchError> {
        self.bring_up(tty, pam_service)?;
        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]);

        let result = self.drive();

        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
        self.lifecycle = Lifecycle::Terminating;
        self.close();
        result
    }

    /// Tear down in reverse acquisition order: signal state, broker
    /// channel, PAM session, VT. Every step runs even when an earlier one
    /// fails; repeat calls are no-ops.
    pub fn close(&mut self) {
        if let Some(mut signals) = self.signals.take() {
            signals.close();
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        if let Some(mut auth) = self.auth.take() {
            auth.close();
        }
        if let Some(mut vt) = self.vt.take() {
            vt.restore();
        }
        if self.lifecycle != Lifecycle::Closed {
            debug!("Launch session closed");
            self.lifecycle = Lifecycle::Closed;
        }
    }
}

impl Drop for LaunchSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Gid, Uid};
    use std::path::PathBuf;

    fn test_identity() -> Identity {
        Identity {
            name: "tester".to_string(),
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home: PathBuf::from("/home/tester"),
            shell: PathBuf::from("/bin/sh"),
            explicit: false,
        }
    }

    #[test]
    fn test_new_session_starts_in_init() {
        let session = LaunchSession::new(test_identity(), vec!["weston".to_string()]);
        assert_eq!(session.lifecycle(), Lifecycle::Init);
    }

    #[test]
    fn test_close_before_setup_is_harmless() {
        let mut session = LaunchSession::new(test_identity(), vec![]);
        session.close();
        session.close();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
    }

    // Teardown must be idempotent for the parts that can exist in a test
    // environment (channel and signal source; VT and PAM need a console).
    #[test]
    fn test_close_is_idempotent_with_live_parts() {
        let mut session = LaunchSession::new(test_identity(), vec![]);
        session.channel = Some(BrokerChannel::new().unwrap());
        session.signals = Some(SignalSource::new().unwrap());
        session.lifecycle = Lifecycle::Running;

        session.close();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
        assert!(session.channel.is_none());
        assert!(session.signals.is_none());

        session.close();
        assert_eq!(session.lifecycle(), Lifecycle::Closed);
    }

    #[test]
    fn test_error_messages_name_the_failing_layer() {
        let e = LaunchError::NotATerminal("stdin".to_string());
        assert_eq!(e.to_string(), "stdin is not a virtual terminal");
        let e = LaunchError::PermissionDenied("not root".to_string());
        assert!(e.to_string().starts_with("permission denied"));
    }
}
