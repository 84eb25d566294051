//! Signal intake for the root thread.
//!
//! Signals are blocked process-wide before any thread is spawned so every
//! child inherits the mask; only the root thread then opens a signalfd and
//! receives them as reactor callbacks.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// The signal set the daemon handles.
pub fn daemon_signals() -> Vec<i32> {
    let rt_base = unsafe { libc::SIGRTMIN() };
    vec![
        libc::SIGINT,
        libc::SIGTERM,
        libc::SIGHUP,
        libc::SIGUSR1,
        rt_base,
        rt_base + 1,
        rt_base + 2,
    ]
}

/// A blocked signal set, ready to be watched through a signalfd.
pub struct SignalSet {
    set: libc::sigset_t,
    signos: Vec<i32>,
}

impl SignalSet {
    /// Block `signos` for the calling thread and (by inheritance) all threads
    /// it spawns afterwards. Call once from the main thread before spawn.
    pub fn block(signos: &[i32]) -> Result<Self> {
        let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut set);
            for &s in signos {
                libc::sigaddset(&mut set, s);
            }
            if libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) != 0 {
                return Err(Error::last_os());
            }
        }
        Ok(Self {
            set,
            signos: signos.to_vec(),
        })
    }

    pub fn signos(&self) -> &[i32] {
        &self.signos
    }
}

/// Owned signalfd over a blocked set.
pub struct SignalFd {
    fd: RawFd,
}

impl SignalFd {
    pub fn new(set: &SignalSet) -> Result<Self> {
        let fd = unsafe {
            libc::signalfd(-1, &set.set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::last_os());
        }
        Ok(Self { fd })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Drain pending signals, returning their numbers in arrival order.
    pub fn read_pending(&self) -> Vec<i32> {
        let mut out = Vec::new();
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::read(
                    self.fd,
                    &mut info as *mut libc::signalfd_siginfo as *mut libc::c_void,
                    std::mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if n < std::mem::size_of::<libc::signalfd_siginfo>() as isize {
                break;
            }
            out.push(info.ssi_signo as i32);
        }
        out
    }
}

impl Drop for SignalFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
