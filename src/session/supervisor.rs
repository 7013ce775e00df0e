//! Compositor child process management
//!
//! Forks the unprivileged child, wires its end of the broker channel and
//! the TTY into place, and execs the configured command. The parent keeps
//! only the pid; everything else the child needs is prepared before fork
//! so the child-side path is plain syscalls plus exec.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::process;

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, execvpe, fork, setsid, ForkResult, Pid};

use super::channel::{BrokerChannel, SOCK_ENV};
use super::identity::Identity;
use super::signals;
use super::vt::VtSession;
use super::LaunchError;

/// Added to the signal number when the child was killed by one, so a
/// signal death is distinguishable from an ordinary exit code.
const SIGNAL_EXIT_OFFSET: i32 = 10;

/// Launcher exit status for the child, once it has been reaped
fn map_status(status: &WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(_, code) => Some(*code),
        WaitStatus::Signaled(_, sig, _) => Some(SIGNAL_EXIT_OFFSET + *sig as i32),
        _ => None,
    }
}

/// Overlay the session identity and broker socket onto an inherited
/// environment. Identity variables are rewritten only for an explicitly
/// requested user; a self-launch keeps the caller's environment.
fn merge_environment(
    mut base: Vec<(String, String)>,
    identity: &Identity,
    sock_fd: RawFd,
) -> Vec<(String, String)> {
    let mut overrides: Vec<(String, String)> = vec![(SOCK_ENV.to_string(), sock_fd.to_string())];
    if identity.explicit {
        overrides.push(("HOME".to_string(), identity.home.to_string_lossy().into_owned()));
        overrides.push(("USER".to_string(), identity.name.clone()));
        overrides.push(("LOGNAME".to_string(), identity.name.clone()));
        overrides.push(("SHELL".to_string(), identity.shell.to_string_lossy().into_owned()));
    }
    base.retain(|(key, _)| !overrides.iter().any(|(k, _)| k == key));
    base.extend(overrides);
    base
}

struct ChildPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    launcher_sock: RawFd,
    tty_fd: RawFd,
    take_tty: bool,
}

/// Child-side setup and exec. Returns only on failure.
fn exec_compositor(plan: &ChildPlan) -> LaunchError {
    // The launcher's channel end must not leak into the compositor
    let _ = close(plan.launcher_sock);

    // Give the child a clean slate: default SIGHUP, nothing blocked.
    // The launcher's mask would otherwise survive exec.
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    if let Err(e) = unsafe { sigaction(Signal::SIGHUP, &default) } {
        return LaunchError::ChildStart(format!("sigaction: {}", e));
    }
    if let Err(e) = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&signals::handled_signals()), None) {
        return LaunchError::ChildStart(format!("sigprocmask: {}", e));
    }

    if plan.take_tty {
        if let Err(e) = setsid() {
            return LaunchError::ChildStart(format!("setsid: {}", e));
        }
        if unsafe { libc::ioctl(plan.tty_fd, libc::TIOCSCTTY, 0) } == -1 {
            return LaunchError::ChildStart(format!("TIOCSCTTY: {}", Errno::last()));
        }
        for target in 0..3 {
            if let Err(e) = dup2(plan.tty_fd, target) {
                return LaunchError::ChildStart(format!("dup2: {}", e));
            }
        }
    }

    match execvpe(&plan.program, &plan.argv, &plan.envp) {
        Ok(_) => unreachable!(),
        Err(e) => LaunchError::ChildStart(format!("exec: {}", e)),
    }
}

/// Fork the compositor child. The child takes over the TTY as its
/// controlling terminal unless the launcher inherited it on stdin, drops
/// the launcher's signal state, and execs the command with the broker
/// socket number in the environment.
pub fn spawn(
    channel: &BrokerChannel,
    vt: &VtSession,
    identity: &Identity,
    command: &[String],
) -> Result<Pid, LaunchError> {
    let sock = channel
        .child_fd()
        .ok_or_else(|| LaunchError::ChildStart("broker channel already closed".to_string()))?;
    let launcher_sock = channel
        .launcher_fd()
        .ok_or_else(|| LaunchError::ChildStart("broker channel already closed".to_string()))?;

    let argv: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| LaunchError::ChildStart("command contains a NUL byte".to_string()))?;
    let program = argv
        .first()
        .cloned()
        .ok_or_else(|| LaunchError::ChildStart("empty compositor command".to_string()))?;
    let envp: Vec<CString> = merge_environment(std::env::vars().collect(), identity, sock)
        .into_iter()
        .map(|(key, value)| CString::new(format!("{}={}", key, value)))
        .collect::<Result<_, _>>()
        .map_err(|_| LaunchError::ChildStart("environment contains a NUL byte".to_string()))?;

    let plan = ChildPlan {
        program,
        argv,
        envp,
        launcher_sock,
        tty_fd: vt.fd(),
        take_tty: !vt.inherited_stdin(),
    };

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            info!("Launched {} (pid {})", command[0], child);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            let err = exec_compositor(&plan);
            eprintln!("vtlaunch: cannot start {}: {}", command[0], err);
            process::exit(super::EXIT_FAILURE);
        }
        Err(e) => Err(LaunchError::ChildStart(format!("fork: {}", e))),
    }
}

/// Reap until the tracked child has been collected, mapping its wait
/// status to the launcher's exit status. Deaths of unrelated processes
/// are absorbed; a wait error gives up without a status.
pub fn reap(tracked: Pid) -> Option<i32> {
    loop {
        match waitpid(Pid::from_raw(-1), None) {
            Ok(status) => {
                if status.pid() != Some(tracked) {
                    debug!("Reaped unrelated process {:?}", status.pid());
                    continue;
                }
                match map_status(&status) {
                    Some(code) => {
                        info!("Compositor (pid {}) finished, exit status {}", tracked, code);
                        return Some(code);
                    }
                    None => continue,
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid: {}", e);
                return None;
            }
        }
    }
}
