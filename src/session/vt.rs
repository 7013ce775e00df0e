//! TTY/VT session acquisition and restoration
//!
//! Opens and validates a virtual-terminal device, takes it into graphics
//! mode with the keyboard muted, and installs process-controlled VT
//! switching (VT_SETMODE with VT_PROCESS). Every mutation is undone in
//! reverse on failure, and full restoration runs unconditionally at
//! teardown. A VT left in graphics/raw mode is keyboard-dead, so the
//! restore path must work even when the original descriptor went stale.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_long};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::stat::{fstat, major, minor};

use super::LaunchError;

/// Signal the kernel delivers when it wants the VT back
pub(crate) const RELEASE_SIGNAL: Signal = Signal::SIGUSR1;
/// Signal the kernel delivers when it hands the VT over
pub(crate) const ACQUIRE_SIGNAL: Signal = Signal::SIGUSR2;

/// Global TTY fd for panic hook recovery.
/// When set (>= 0), the panic hook restores KD_TEXT, the saved keyboard
/// mode, and VT_AUTO so the console is not left dead.
static PANIC_RECOVERY_TTY_FD: AtomicI32 = AtomicI32::new(-1);
static PANIC_RECOVERY_KB_MODE: AtomicI32 = AtomicI32::new(-1);

/// Install a panic hook that restores the console to a usable state.
///
/// Even with `panic = "abort"`, `std::panic::set_hook` runs before the abort.
pub fn setup_panic_hook() {
    let prev = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let fd = PANIC_RECOVERY_TTY_FD.load(Ordering::Relaxed);
        if fd >= 0 {
            let kb_mode = PANIC_RECOVERY_KB_MODE.load(Ordering::Relaxed);
            unsafe {
                libc::ioctl(fd, KDSETMODE, KD_TEXT);
                libc::ioctl(fd, KDSKBMUTE, 0 as c_long);
                if kb_mode >= 0 {
                    libc::ioctl(fd, KDSKBMODE, kb_mode as c_long);
                }
                let mode = VtMode {
                    mode: VT_AUTO,
                    waitv: 0,
                    relsig: 0,
                    acqsig: 0,
                    frsig: 0,
                };
                libc::ioctl(fd, VT_SETMODE, &mode);
            }
        }
        // Print panic info to stderr so it's visible on the restored console
        eprintln!("[vtlaunch] PANIC: {}", info);
        prev(info);
    }));
}

// VT ioctl constants (from linux/vt.h)
const VT_OPENQRY: libc::c_ulong = 0x5600;
const VT_SETMODE: libc::c_ulong = 0x5602;
const VT_RELDISP: libc::c_ulong = 0x5605;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;

// VT_SETMODE constants
const VT_AUTO: libc::c_char = 0;
const VT_PROCESS: libc::c_char = 1;
const VT_ACKACQ: libc::c_int = 2;

// Console mode constants (from linux/kd.h)
const KDSETMODE: libc::c_ulong = 0x4B3A;
const KDGKBMODE: libc::c_ulong = 0x4B44;
const KDSKBMODE: libc::c_ulong = 0x4B45;
const KDSKBMUTE: libc::c_ulong = 0x4B51;
const KD_TEXT: c_long = 0x00;
const KD_GRAPHICS: c_long = 0x01;
const K_OFF: c_long = 0x04;

/// /dev/tty* character device major (from linux/major.h)
const TTY_MAJOR: u64 = 4;

/// vt_mode structure for VT_SETMODE ioctl
#[repr(C)]
struct VtMode {
    mode: libc::c_char,    // VT_AUTO or VT_PROCESS
    waitv: libc::c_char,   // unused
    relsig: libc::c_short, // signal to send on release
    acqsig: libc::c_short, // signal to send on acquire
    frsig: libc::c_short,  // unused
}

/// Console ioctl surface, separated so the setup/rollback sequence can be
/// exercised without a real VT.
trait ConsoleOps {
    fn activate(&mut self, vtnr: i32) -> Result<(), Errno>;
    fn wait_active(&mut self, vtnr: i32) -> Result<(), Errno>;
    fn keyboard_mode(&mut self) -> Result<c_int, Errno>;
    fn mute_keyboard(&mut self) -> Result<(), Errno>;
    fn restore_keyboard(&mut self, mode: c_int) -> Result<(), Errno>;
    fn set_graphics(&mut self) -> Result<(), Errno>;
    fn set_text(&mut self) -> Result<(), Errno>;
    fn set_process_switching(&mut self) -> Result<(), Errno>;
    fn set_auto_switching(&mut self) -> Result<(), Errno>;
}

/// Real console ioctls on an open tty descriptor
struct TtyIoctls {
    fd: RawFd,
}

impl ConsoleOps for TtyIoctls {
    fn activate(&mut self, vtnr: i32) -> Result<(), Errno> {
        Errno::result(unsafe { libc::ioctl(self.fd, VT_ACTIVATE, vtnr as c_int) }).map(drop)
    }

    fn wait_active(&mut self, vtnr: i32) -> Result<(), Errno> {
        Errno::result(unsafe { libc::ioctl(self.fd, VT_WAITACTIVE, vtnr as c_int) }).map(drop)
    }

    fn keyboard_mode(&mut self) -> Result<c_int, Errno> {
        let mut mode: c_int = 0;
        Errno::result(unsafe { libc::ioctl(self.fd, KDGKBMODE, &mut mode) })?;
        Ok(mode)
    }

    fn mute_keyboard(&mut self) -> Result<(), Errno> {
        // KDSKBMUTE is the modern interface; fall back to K_OFF on kernels
        // without it.
        if Errno::result(unsafe { libc::ioctl(self.fd, KDSKBMUTE, 1 as c_long) }).is_ok() {
            return Ok(());
        }
        Errno::result(unsafe { libc::ioctl(self.fd, KDSKBMODE, K_OFF) }).map(drop)
    }

    fn restore_keyboard(&mut self, mode: c_int) -> Result<(), Errno> {
        // Unmute first; the saved translation mode is reinstalled either way.
        let _ = unsafe { libc::ioctl(self.fd, KDSKBMUTE, 0 as c_long) };
        Errno::result(unsafe { libc::ioctl(self.fd, KDSKBMODE, mode as c_long) }).map(drop)
    }

    fn set_graphics(&mut self) -> Result<(), Errno> {
        Errno::result(unsafe { libc::ioctl(self.fd, KDSETMODE, KD_GRAPHICS) }).map(drop)
    }

    fn set_text(&mut self) -> Result<(), Errno> {
        Errno::result(unsafe { libc::ioctl(self.fd, KDSETMODE, KD_TEXT) }).map(drop)
    }

    fn set_process_switching(&mut self) -> Result<(), Errno> {
        let mode = VtMode {
            mode: VT_PROCESS,
            waitv: 0,
            relsig: RELEASE_SIGNAL as libc::c_short,
            acqsig: ACQUIRE_SIGNAL as libc::c_short,
            frsig: 0,
        };
        Errno::result(unsafe { libc::ioctl(self.fd, VT_SETMODE, &mode) }).map(drop)
    }

    fn set_auto_switching(&mut self) -> Result<(), Errno> {
        let mode = VtMode {
            mode: VT_AUTO,
            waitv: 0,
            relsig: 0,
            acqsig: 0,
            frsig: 0,
        };
        Errno::result(unsafe { libc::ioctl(self.fd, VT_SETMODE, &mode) }).map(drop)
    }
}

fn vt_err(op: &str, err: Errno) -> LaunchError {
    LaunchError::ResourceAcquisition(format!("{}: {}", op, err))
}

/// Setup steps 1-5: activate the VT, save the keyboard mode, mute the
/// keyboard, enter graphics mode, take over VT switching. On failure,
/// exactly the already-applied steps are undone, in reverse order.
/// Returns the saved keyboard mode.
fn run_setup(ops: &mut impl ConsoleOps, vtnr: i32) -> Result<c_int, LaunchError> {
    ops.activate(vtnr).map_err(|e| vt_err("VT_ACTIVATE", e))?;
    ops.wait_active(vtnr).map_err(|e| vt_err("VT_WAITACTIVE", e))?;

    let kb_mode = ops.keyboard_mode().map_err(|e| vt_err("KDGKBMODE", e))?;
    debug!("Saved keyboard mode: {:#x}", kb_mode);

    ops.mute_keyboard().map_err(|e| vt_err("mute keyboard", e))?;

    if let Err(e) = ops.set_graphics() {
        if let Err(e2) = ops.restore_keyboard(kb_mode) {
            warn!("Failed to restore keyboard mode: {}", e2);
        }
        return Err(vt_err("KDSETMODE(KD_GRAPHICS)", e));
    }

    if let Err(e) = ops.set_process_switching() {
        if let Err(e2) = ops.set_text() {
            warn!("Failed to restore KD_TEXT: {}", e2);
        }
        if let Err(e2) = ops.restore_keyboard(kb_mode) {
            warn!("Failed to restore keyboard mode: {}", e2);
        }
        return Err(vt_err("VT_SETMODE(VT_PROCESS)", e));
    }

    Ok(kb_mode)
}

/// Restoration sequence: text display mode, saved keyboard mode, automatic
/// VT switching. Errors are logged, never raised, so every step runs.
fn run_restore(ops: &mut impl ConsoleOps, kb_mode: c_int) {
    if let Err(e) = ops.set_text() {
        warn!("Failed to restore KD_TEXT: {}", e);
    }
    if let Err(e) = ops.restore_keyboard(kb_mode) {
        warn!("Failed to restore keyboard mode: {}", e);
    }
    if let Err(e) = ops.set_auto_switching() {
        warn!("Failed to reset vt switching to auto: {}", e);
    }
}

fn open_tty_by_number(vtnr: i32) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(format!("/dev/tty{}", vtnr))
}

/// Ask the console driver for the first unused VT
fn query_free_vt() -> Result<i32, LaunchError> {
    let tty0 = CString::new("/dev/tty0").expect("static path");
    let fd = unsafe { libc::open(tty0.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(vt_err("open /dev/tty0", Errno::last()));
    }
    let mut vtnr: c_int = -1;
    let ret = Errno::result(unsafe { libc::ioctl(fd, VT_OPENQRY, &mut vtnr) });
    unsafe { libc::close(fd) };
    ret.map_err(|e| vt_err("VT_OPENQRY", e))?;
    if vtnr == -1 {
        return Err(LaunchError::ResourceAcquisition(
            "no free virtual terminal".to_string(),
        ));
    }
    Ok(vtnr)
}

/// The descriptor must be a VT character device, and not the console
/// control device (minor 0). Returns the VT number.
fn validate_tty(fd: RawFd, what: &str) -> Result<i32, LaunchError> {
    let st = fstat(fd).map_err(|e| vt_err("fstat tty", e))?;
    let is_char = (st.st_mode & libc::S_IFMT) == libc::S_IFCHR;
    if !is_char || major(st.st_rdev) != TTY_MAJOR || minor(st.st_rdev) == 0 {
        return Err(LaunchError::NotATerminal(what.to_string()));
    }
    Ok(minor(st.st_rdev) as i32)
}

/// Whether stdin already refers to the given tty device
fn stdin_matches(path: &str) -> bool {
    let stdin_st = match fstat(libc::STDIN_FILENO) {
        Ok(st) => st,
        Err(_) => return false,
    };
    if major(stdin_st.st_rdev) != TTY_MAJOR {
        return false;
    }
    match nix::sys::stat::stat(path) {
        Ok(st) => st.st_rdev == stdin_st.st_rdev,
        Err(_) => false,
    }
}

/// An acquired virtual terminal, held in graphics mode with the keyboard
/// muted and process-controlled switching installed
pub struct VtSession {
    tty_fd: RawFd,
    /// False when stdin is the tty; the inherited descriptor is not closed.
    owns_fd: bool,
    vtnr: i32,
    saved_kb_mode: c_int,
    restored: bool,
}

impl VtSession {
    /// Acquire a VT. Without an identity switch the current controlling
    /// terminal is used; with one, either the requested device or the first
    /// free VT the console driver reports.
    pub fn open(tty_path: Option<&str>, identity_switch: bool) -> Result<Self, LaunchError> {
        let (fd, owns_fd, queried_vt, what) = if !identity_switch {
            (libc::STDIN_FILENO, false, None, "stdin".to_string())
        } else if let Some(path) = tty_path {
            if stdin_matches(path) {
                (libc::STDIN_FILENO, false, None, path.to_string())
            } else {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(libc::O_NOCTTY)
                    .open(path)
                    .map_err(|e| {
                        LaunchError::ResourceAcquisition(format!("open {}: {}", path, e))
                    })?;
                (file.into_raw_fd(), true, None, path.to_string())
            }
        } else {
            let vtnr = query_free_vt()?;
            info!("Allocated /dev/tty{}", vtnr);
            let file = open_tty_by_number(vtnr).map_err(|e| {
                LaunchError::ResourceAcquisition(format!("open /dev/tty{}: {}", vtnr, e))
            })?;
            (file.into_raw_fd(), true, Some(vtnr), format!("/dev/tty{}", vtnr))
        };

        let minor = match validate_tty(fd, &what) {
            Ok(m) => m,
            Err(e) => {
                if owns_fd {
                    unsafe { libc::close(fd) };
                }
                return Err(e);
            }
        };
        let vtnr = queried_vt.unwrap_or(minor);

        let mut console = TtyIoctls { fd };
        let saved_kb_mode = match run_setup(&mut console, vtnr) {
            Ok(mode) => mode,
            Err(e) => {
                if owns_fd {
                    unsafe { libc::close(fd) };
                }
                return Err(e);
            }
        };

        // From here on a panic restores the console before aborting
        PANIC_RECOVERY_KB_MODE.store(saved_kb_mode, Ordering::Relaxed);
        PANIC_RECOVERY_TTY_FD.store(fd, Ordering::Relaxed);

        info!("VT{} acquired (graphics mode, keyboard off)", vtnr);

        Ok(Self {
            tty_fd: fd,
            owns_fd,
            vtnr,
            saved_kb_mode,
            restored: false,
        })
    }

    pub fn vt_number(&self) -> i32 {
        self.vtnr
    }

    /// Device path, e.g. "/dev/tty7". Used as the session terminal name.
    pub fn path(&self) -> String {
        format!("/dev/tty{}", self.vtnr)
    }

    pub fn fd(&self) -> RawFd {
        self.tty_fd
    }

    /// True when the tty is the inherited controlling terminal (stdin)
    pub fn inherited_stdin(&self) -> bool {
        !self.owns_fd
    }

    /// Acknowledge the pending release to the kernel. Must only be called
    /// once the child has confirmed it stopped rendering.
    pub fn ack_release(&mut self) -> Result<(), LaunchError> {
        debug!("VT_RELDISP: release acknowledged");
        Errno::result(unsafe { libc::ioctl(self.tty_fd, VT_RELDISP, 1 as c_int) })
            .map(drop)
            .map_err(|e| vt_err("VT_RELDISP(1)", e))
    }

    /// Acknowledge reacquisition of the VT to the kernel
    pub fn ack_acquire(&mut self) -> Result<(), LaunchError> {
        debug!("VT_RELDISP: reacquisition acknowledged");
        Errno::result(unsafe { libc::ioctl(self.tty_fd, VT_RELDISP, VT_ACKACQ) })
            .map(drop)
            .map_err(|e| vt_err("VT_RELDISP(VT_ACKACQ)", e))
    }

    /// Restore text mode, keyboard mode and automatic switching, then close
    /// the descriptor. Runs at most once; later calls are no-ops. The VT is
    /// reopened by number because the held descriptor may have gone stale
    /// while the child owned the terminal.
    pub fn restore(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;

        PANIC_RECOVERY_TTY_FD.store(-1, Ordering::Relaxed);
        PANIC_RECOVERY_KB_MODE.store(-1, Ordering::Relaxed);

        let reopened = open_tty_by_number(self.vtnr);
        let fd = match &reopened {
            Ok(file) => file.as_raw_fd(),
            Err(e) => {
                warn!("Could not reopen /dev/tty{}: {}", self.vtnr, e);
                self.tty_fd
            }
        };

        run_restore(&mut TtyIoctls { fd }, self.saved_kb_mode);

        if self.owns_fd {
            unsafe { libc::close(self.tty_fd) };
        }
        info!("VT{} restored", self.vtnr);
    }
}

impl Drop for VtSession {
    fn drop(&mut self) {
        self.restore();
    }
}
