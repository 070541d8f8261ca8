//! Boundary to the packet-forwarding engine
//!
//! The engine is opaque: it is handed the open interface descriptor and the
//! proxy address, runs until the tunnel ends, and can be told to stop from
//! another thread. Everything the session controller needs from it fits in
//! the two calls of [`TunnelEngine`], which keeps the engine swappable in
//! tests.

use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use socktun_tun::TunFd;

use crate::endpoint::ProxyEndpoint;
use crate::error::{Error, Result};

/// Exit code reported when the engine could not run at all
pub const EXIT_LAUNCH_FAILED: i32 = -1;

/// Arguments for one engine run, prepared before the worker starts
#[derive(Debug, Clone)]
pub struct EngineInvocation {
    fd: TunFd,
    mtu: u16,
    server: CString,
    user: Option<CString>,
    pass: Option<CString>,
}

impl EngineInvocation {
    /// Prepare an invocation for `endpoint` on the open descriptor
    ///
    /// Fails with [`Error::EngineLaunch`] when a field cannot cross the
    /// C boundary (an interior NUL byte).
    pub fn new(fd: TunFd, mtu: u16, endpoint: &ProxyEndpoint) -> Result<Self> {
        Ok(Self {
            fd,
            mtu,
            server: c_string("server", endpoint.server_address())?,
            user: endpoint
                .user
                .as_ref()
                .map(|u| c_string("user", u.clone()))
                .transpose()?,
            pass: endpoint
                .pass
                .as_ref()
                .map(|p| c_string("pass", p.clone()))
                .transpose()?,
        })
    }

    pub fn fd(&self) -> TunFd {
        self.fd
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// `host:port` of the proxy
    pub fn server(&self) -> &CStr {
        &self.server
    }

    pub fn user(&self) -> Option<&CStr> {
        self.user.as_deref()
    }

    pub fn pass(&self) -> Option<&CStr> {
        self.pass.as_deref()
    }
}

fn c_string(field: &str, value: String) -> Result<CString> {
    CString::new(value)
        .map_err(|_| Error::EngineLaunch(format!("{} contains a NUL byte", field)))
}

/// A packet-forwarding engine
pub trait TunnelEngine: Send + Sync {
    /// Run the engine until the tunnel ends or [`stop`](Self::stop) is called
    ///
    /// Blocks the calling thread. Returns 0 on a normal end.
    fn start(&self, invocation: &EngineInvocation) -> i32;

    /// Ask a running engine to return from `start`
    ///
    /// Idempotent; safe to call when nothing is running.
    fn stop(&self);
}

/// Which engine the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// An external tun2socks executable fed the descriptor
    #[default]
    Command,
    /// The tun2socks library linked into this binary
    Native,
}

/// Runs an external tun2socks executable
///
/// The descriptor is inherited by the child and passed as `fd://N`.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
    child: Mutex<Option<u32>>,
    stopping: AtomicBool,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            child: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    /// Extra arguments appended after the generated ones
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Command-line arguments for an invocation
    pub fn command_args(&self, invocation: &EngineInvocation) -> Vec<String> {
        let credentials = match (invocation.user(), invocation.pass()) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                user.to_string_lossy(),
                pass.to_string_lossy()
            ),
            (Some(user), None) => format!("{}@", user.to_string_lossy()),
            _ => String::new(),
        };

        let mut args = vec![
            "-device".to_string(),
            format!("fd://{}", invocation.fd()),
            "-proxy".to_string(),
            format!("socks5://{}{}", credentials, invocation.server().to_string_lossy()),
            "-mtu".to_string(),
            invocation.mtu().to_string(),
        ];
        args.extend(self.args.iter().cloned());
        args
    }

    fn set_child(&self, pid: Option<u32>) {
        if let Ok(mut child) = self.child.lock() {
            *child = pid;
        }
    }
}

impl TunnelEngine for CommandEngine {
    fn start(&self, invocation: &EngineInvocation) -> i32 {
        self.stopping.store(false, Ordering::SeqCst);

        let mut command = Command::new(&self.program);
        command
            .args(self.command_args(invocation))
            .stdin(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            let fd = invocation.fd();
            // SAFETY: only async-signal-safe calls between fork and exec
            unsafe {
                command.pre_exec(move || {
                    let flags = libc::fcntl(fd, libc::F_GETFD);
                    if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("Failed to run {}: {}", self.program.display(), e);
                return EXIT_LAUNCH_FAILED;
            }
        };

        log::info!("Engine {} running (pid {})", self.program.display(), child.id());
        self.set_child(Some(child.id()));
        let status = child.wait();
        self.set_child(None);

        match status {
            Ok(status) => match status.code() {
                Some(code) => code,
                // killed by the signal sent from stop()
                None if self.stopping.load(Ordering::SeqCst) => 0,
                None => {
                    log::warn!("Engine terminated by signal: {}", status);
                    EXIT_LAUNCH_FAILED
                }
            },
            Err(e) => {
                log::error!("Failed to wait for engine: {}", e);
                EXIT_LAUNCH_FAILED
            }
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let pid = self.child.lock().ok().and_then(|child| *child);
        if let Some(pid) = pid {
            log::debug!("Sending SIGTERM to engine pid {}", pid);
            terminate(pid);
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32) {
    // SAFETY: kill has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        log::debug!("kill({}) failed: {}", pid, std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) {
    log::warn!("Cannot signal engine pid {} on this platform", pid);
}

#[cfg(feature = "native-engine")]
pub use native::NativeEngine;

#[cfg(feature = "native-engine")]
mod native {
    use std::os::raw::{c_char, c_int};
    use std::ptr;

    use super::{EngineInvocation, TunnelEngine};

    #[link(name = "tun2socks")]
    extern "C" {
        fn tun2socks_start(
            fd: c_int,
            mtu: c_int,
            server: *const c_char,
            user: *const c_char,
            pass: *const c_char,
        ) -> c_int;

        fn tun2socks_stop();
    }

    /// The tun2socks library linked into this binary
    #[derive(Debug, Default)]
    pub struct NativeEngine;

    impl NativeEngine {
        pub fn new() -> Self {
            Self
        }
    }

    impl TunnelEngine for NativeEngine {
        fn start(&self, invocation: &EngineInvocation) -> i32 {
            let user = invocation.user().map_or(ptr::null(), |u| u.as_ptr());
            let pass = invocation.pass().map_or(ptr::null(), |p| p.as_ptr());
            // SAFETY: every pointer is either null or a NUL-terminated string
            // owned by `invocation`, which outlives the call
            unsafe {
                tun2socks_start(
                    invocation.fd(),
                    c_int::from(invocation.mtu()),
                    invocation.server().as_ptr(),
                    user,
                    pass,
                )
            }
        }

        fn stop(&self) {
            // SAFETY: the library documents stop as callable at any time
            unsafe { tun2socks_stop() }
        }
    }
}
