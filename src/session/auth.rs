//! PAM session bracket
//!
//! Opens and closes a PAM session around the compositor so lastlog,
//! systemd-logind tracking and session modules see a proper login. The
//! launcher never authenticates: the caller already holds the VT or is
//! root, so only the session phase of the stack runs.
//!
//! libpam is loaded at runtime; the binary starts fine on systems
//! without it as long as no session bracket is requested.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;

use log::{debug, info, warn};

use super::LaunchError;

const PAM_SUCCESS: c_int = 0;
const PAM_CONV_ERR: c_int = 19;

/// pam_set_item item type for the terminal name
const PAM_TTY: c_int = 3;

/// Conversation message styles
const PAM_ERROR_MSG: c_int = 3;

type PamHandle = *mut c_void;

#[repr(C)]
struct PamMessage {
    msg_style: c_int,
    msg: *const c_char,
}

#[repr(C)]
struct PamResponse {
    resp: *mut c_char,
    resp_retcode: c_int,
}

type ConvCallback = extern "C" fn(
    c_int,
    *mut *const PamMessage,
    *mut *mut PamResponse,
    *mut c_void,
) -> c_int;

#[repr(C)]
struct PamConv {
    conv: ConvCallback,
    appdata_ptr: *mut c_void,
}

type PamStart = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    *const PamConv,
    *mut PamHandle,
) -> c_int;
type PamSetItem = unsafe extern "C" fn(PamHandle, c_int, *const c_void) -> c_int;
type PamOpenSession = unsafe extern "C" fn(PamHandle, c_int) -> c_int;
type PamCloseSession = unsafe extern "C" fn(PamHandle, c_int) -> c_int;
type PamEnd = unsafe extern "C" fn(PamHandle, c_int) -> c_int;
type PamStrerror = unsafe extern "C" fn(PamHandle, c_int) -> *const c_char;

/// Conversation handler for an unattended launcher: prompts cannot be
/// answered, so messages are logged and no responses are allocated.
extern "C" fn conversation(
    num_msg: c_int,
    msg: *mut *const PamMessage,
    resp: *mut *mut PamResponse,
    _appdata: *mut c_void,
) -> c_int {
    if msg.is_null() || resp.is_null() {
        return PAM_CONV_ERR;
    }
    for i in 0..num_msg as isize {
        let message = unsafe { *msg.offset(i) };
        if message.is_null() {
            continue;
        }
        let (style, text) = unsafe {
            let text = if (*message).msg.is_null() {
                String::new()
            } else {
                CStr::from_ptr((*message).msg).to_string_lossy().into_owned()
            };
            ((*message).msg_style, text)
        };
        if style == PAM_ERROR_MSG {
            warn!("pam: {}", text);
        } else {
            info!("pam: {}", text);
        }
    }
    unsafe {
        *resp = ptr::null_mut();
    }
    PAM_SUCCESS
}

fn describe(lib: &libloading::Library, handle: PamHandle, code: c_int) -> String {
    unsafe {
        if let Ok(strerror) = lib.get::<PamStrerror>(b"pam_strerror\0") {
            let text = strerror(handle, code);
            if !text.is_null() {
                return CStr::from_ptr(text).to_string_lossy().into_owned();
            }
        }
    }
    format!("pam error {}", code)
}

fn end_handle(lib: &libloading::Library, handle: PamHandle, status: c_int) {
    unsafe {
        if let Ok(end) = lib.get::<PamEnd>(b"pam_end\0") {
            end(handle, status);
        }
    }
}

/// An open PAM session, torn down in [`AuthSession::close`] or on drop
pub struct AuthSession {
    lib: libloading::Library,
    handle: PamHandle,
    // pam keeps a pointer to the conversation; it must outlive the handle
    _conv: Box<PamConv>,
    closed: bool,
}

impl AuthSession {
    /// Run pam_start, bind the terminal with PAM_TTY and open the
    /// session phase. Any failure ends the handle before returning.
    pub fn open(service: &str, user: &str, tty_path: &str) -> Result<Self, LaunchError> {
        let lib = unsafe {
            libloading::Library::new("libpam.so.0")
                .or_else(|_| libloading::Library::new("libpam.so"))
        }
        .map_err(|e| LaunchError::Authentication(format!("libpam unavailable: {}", e)))?;

        let service_c = CString::new(service)
            .map_err(|_| LaunchError::Authentication("NUL in service name".to_string()))?;
        let user_c = CString::new(user)
            .map_err(|_| LaunchError::Authentication("NUL in user name".to_string()))?;
        let tty_c = CString::new(tty_path)
            .map_err(|_| LaunchError::Authentication("NUL in tty path".to_string()))?;

        let conv = Box::new(PamConv {
            conv: conversation,
            appdata_ptr: ptr::null_mut(),
        });

        let mut handle: PamHandle = ptr::null_mut();
        unsafe {
            let start: libloading::Symbol<PamStart> = lib
                .get(b"pam_start\0")
                .map_err(|e| LaunchError::Authentication(format!("pam_start symbol: {}", e)))?;
            let ret = start(service_c.as_ptr(), user_c.as_ptr(), &*conv, &mut handle);
            if ret != PAM_SUCCESS {
                return Err(LaunchError::Authentication(format!(
                    "pam_start({}, {}): {}",
                    service,
                    user,
                    describe(&lib, handle, ret)
                )));
            }

            let set_item: libloading::Symbol<PamSetItem> = lib
                .get(b"pam_set_item\0")
                .map_err(|e| LaunchError::Authentication(format!("pam_set_item symbol: {}", e)))?;
            let ret = set_item(handle, PAM_TTY, tty_c.as_ptr() as *const c_void);
            if ret != PAM_SUCCESS {
                let reason = describe(&lib, handle, ret);
                end_handle(&lib, handle, ret);
                return Err(LaunchError::Authentication(format!(
                    "pam_set_item(PAM_TTY, {}): {}",
                    tty_path, reason
                )));
            }

            let open_session: libloading::Symbol<PamOpenSession> =
                lib.get(b"pam_open_session\0").map_err(|e| {
                    LaunchError::Authentication(format!("pam_open_session symbol: {}", e))
                })?;
            let ret = open_session(handle, 0);
            if ret != PAM_SUCCESS {
                let reason = describe(&lib, handle, ret);
                end_handle(&lib, handle, ret);
                return Err(LaunchError::Authentication(format!(
                    "pam_open_session: {}",
                    reason
                )));
            }
        }

        info!(
            "PAM session opened (service {}, user {}, tty {})",
            service, user, tty_path
        );
        Ok(Self {
            lib,
            handle,
            _conv: conv,
            closed: false,
        })
    }

    /// Close the session phase and end the handle. Failures are logged;
    /// teardown continues regardless. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        unsafe {
            if let Ok(close_session) = self.lib.get::<PamCloseSession>(b"pam_close_session\0") {
                let ret = close_session(self.handle, 0);
                if ret != PAM_SUCCESS {
                    warn!(
                        "pam_close_session: {}",
                        describe(&self.lib, self.handle, ret)
                    );
                }
            }
            if let Ok(end) = self.lib.get::<PamEnd>(b"pam_end\0") {
                let ret = end(self.handle, PAM_SUCCESS);
                if ret != PAM_SUCCESS {
                    warn!("pam_end: {}", describe(&self.lib, self.handle, ret));
                }
            }
        }
        debug!("PAM session closed");
    }
}

impl Drop for AuthSession {
    fn drop(&mut self) {
        self.close();
    }
}
