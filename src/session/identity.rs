//! Target identity resolution and the seat/session permission gate
//!
//! Decides whether the invoking process may broker a session at all and
//! resolves the account the session is created for. The logind query goes
//! through libsystemd loaded at runtime, so there is no link-time dependency.

use std::path::PathBuf;

use libc::{c_char, c_int, c_void};
use log::{debug, warn};
use nix::unistd::{Gid, Uid, User};

use super::LaunchError;

/// Resolved OS account for the session
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
    pub shell: PathBuf,
    /// True when the identity was requested with --user. Only then does the
    /// launcher open an authenticated session bracket.
    pub explicit: bool,
}

impl Identity {
    fn from_user(user: User, explicit: bool) -> Self {
        Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            home: user.dir,
            shell: user.shell,
            explicit,
        }
    }
}

/// Resolve the target account: an explicitly requested user (root only) or
/// the invoking user.
pub fn resolve(requested: Option<&str>) -> Result<Identity, LaunchError> {
    match requested {
        Some(name) => {
            if !Uid::current().is_root() {
                return Err(LaunchError::PermissionDenied(
                    "only root may launch a session for another user".to_string(),
                ));
            }
            let user = User::from_name(name)
                .map_err(|e| LaunchError::Identity(format!("user lookup failed: {}", e)))?
                .ok_or_else(|| LaunchError::Identity(format!("unknown user: {}", name)))?;
            Ok(Identity::from_user(user, true))
        }
        None => {
            let uid = Uid::current();
            let user = User::from_uid(uid)
                .map_err(|e| LaunchError::Identity(format!("user lookup failed: {}", e)))?
                .ok_or_else(|| LaunchError::Identity(format!("no account for uid {}", uid)))?;
            Ok(Identity::from_user(user, false))
        }
    }
}

/// What the login manager knows about the invoking process's session.
#[derive(Debug, Clone, Copy)]
pub struct SessionStanding {
    pub active: bool,
    pub seated: bool,
}

/// Root is always allowed; everyone else needs an active session with an
/// assigned seat.
fn gate(root: bool, standing: Option<SessionStanding>) -> bool {
    if root {
        return true;
    }
    matches!(standing, Some(s) if s.active && s.seated)
}

/// Check whether the invoking process may broker a session. Denial has no
/// side effects; nothing privileged has happened yet.
pub fn check_permission() -> Result<(), LaunchError> {
    let root = Uid::current().is_root();
    let standing = if root {
        None
    } else {
        Logind::open().and_then(|l| l.caller_standing())
    };
    debug!("permission gate: root={} standing={:?}", root, standing);
    if gate(root, standing) {
        Ok(())
    } else {
        Err(LaunchError::PermissionDenied(
            "not root and no active seated login session".to_string(),
        ))
    }
}

type SdPidGetSession = unsafe extern "C" fn(libc::pid_t, *mut *mut c_char) -> c_int;
type SdSessionIsActive = unsafe extern "C" fn(*const c_char) -> c_int;
type SdSessionGetSeat = unsafe extern "C" fn(*const c_char, *mut *mut c_char) -> c_int;

/// Minimal sd-login bindings, loaded at runtime
struct Logind {
    lib: libloading::Library,
}

impl Logind {
    fn open() -> Option<Self> {
        let lib = unsafe {
            libloading::Library::new("libsystemd.so.0")
                .or_else(|_| libloading::Library::new("libsystemd.so"))
        };
        match lib {
            Ok(lib) => Some(Self { lib }),
            Err(e) => {
                warn!("sd-login unavailable: {}", e);
                None
            }
        }
    }

    /// Session standing of the calling process; None when it belongs to no
    /// login session.
    fn caller_standing(&self) -> Option<SessionStanding> {
        unsafe {
            let pid_get_session: libloading::Symbol<SdPidGetSession> =
                self.lib.get(b"sd_pid_get_session\0").ok()?;
            let session_is_active: libloading::Symbol<SdSessionIsActive> =
                self.lib.get(b"sd_session_is_active\0").ok()?;
            let session_get_seat: libloading::Symbol<SdSessionGetSeat> =
                self.lib.get(b"sd_session_get_seat\0").ok()?;

            let mut session: *mut c_char = std::ptr::null_mut();
            if pid_get_session(libc::getpid(), &mut session) < 0 || session.is_null() {
                return None;
            }
            let active = session_is_active(session) > 0;
            let mut seat: *mut c_char = std::ptr::null_mut();
            let seated = session_get_seat(session, &mut seat) >= 0 && !seat.is_null();
            if !seat.is_null() {
                libc::free(seat as *mut c_void);
            }
            libc::free(session as *mut c_void);
            Some(SessionStanding { active, seated })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_root_always_allowed() {
        assert!(gate(true, None));
        assert!(gate(
            true,
            Some(SessionStanding {
                active: false,
                seated: false
            })
        ));
    }

    #[test]
    fn test_gate_requires_active_seated_session() {
        assert!(gate(
            false,
            Some(SessionStanding {
                active: true,
                seated: true
            })
        ));
        assert!(!gate(
            false,
            Some(SessionStanding {
                active: false,
                seated: true
            })
        ));
        assert!(!gate(
            false,
            Some(SessionStanding {
                active: true,
                seated: false
            })
        ));
        assert!(!gate(false, None));
    }

    #[test]
    fn test_resolve_self() {
        let id = resolve(None).unwrap();
        assert!(!id.explicit);
        assert_eq!(id.uid, Uid::current());
    }

    #[test]
    fn test_resolve_explicit_requires_root() {
        let res = resolve(Some("root"));
        if Uid::current().is_root() {
            let id = res.unwrap();
            assert!(id.explicit);
            assert!(id.uid.is_root());
        } else {
            assert!(matches!(res, Err(LaunchError::PermissionDenied(_))));
        }
    }

    #[test]
    fn test_resolve_unknown_user() {
        if !Uid::current().is_root() {
            return;
        }
        let res = resolve(Some("no-such-user-vtlaunch"));
        assert!(matches!(res, Err(LaunchError::Identity(_))));
    }
}
