//! Thin owned wrappers over the kernel descriptors the reactor multiplexes.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Put a descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::last_os());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os());
    }
    Ok(())
}

/// Owned `eventfd`. Writes accumulate into the counter; a single read drains
/// the whole burst, so a sleeping reader wakes exactly once however many
/// posts arrived while it slept.
#[derive(Debug)]
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os());
        }
        Ok(Self { fd })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Post one increment. Safe from any thread.
    pub fn post(&self) -> Result<()> {
        let val: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // EAGAIN means the counter is saturated; the reader is already
            // guaranteed to wake.
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        Ok(())
    }

    /// Drain the counter, returning the number of posts it accumulated.
    pub fn drain(&self) -> Result<u64> {
        let mut val: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EAGAIN) {
                return Ok(0);
            }
            return Err(Error::Io(err));
        }
        Ok(val)
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// eventfd read/write are thread-safe kernel operations on an fd we own until
// drop.
unsafe impl Send for EventFd {}
unsafe impl Sync for EventFd {}

/// What a descriptor became ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// Owned epoll instance.
#[derive(Debug)]
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os());
        }
        Ok(Self { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) } < 0 {
            return Err(Error::last_os());
        }
        Ok(())
    }

    pub fn add(&self, fd: RawFd, read: bool, write: bool, token: u64) -> Result<()> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub fn modify(&self, fd: RawFd, read: bool, write: bool, token: u64) -> Result<()> {
        let mut events = 0u32;
        if read {
            events |= libc::EPOLLIN as u32;
        }
        if write {
            events |= libc::EPOLLOUT as u32;
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    pub fn remove(&self, fd: RawFd) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Block until at least one descriptor is ready or `timeout_ms` elapses
    /// (`-1` blocks indefinitely). Returns `(token, readiness)` pairs.
    pub fn wait(&self, timeout_ms: i32, out: &mut Vec<(u64, Readiness)>) -> Result<()> {
        const MAX_EVENTS: usize = 32;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(Error::Io(err));
        }
        out.clear();
        for ev in events.iter().take(n as usize) {
            out.push((
                ev.u64,
                Readiness {
                    fd: -1,
                    readable: ev.events & libc::EPOLLIN as u32 != 0,
                    writable: ev.events & libc::EPOLLOUT as u32 != 0,
                    error: ev.events & libc::EPOLLERR as u32 != 0,
                    hangup: ev.events & libc::EPOLLHUP as u32 != 0,
                },
            ));
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventfd_coalesces_posts() {
        let ev = EventFd::new().unwrap();
        ev.post().unwrap();
        ev.post().unwrap();
        ev.post().unwrap();
        assert_eq!(ev.drain().unwrap(), 3);
        // Second drain sees nothing: the burst was consumed in one read.
        assert_eq!(ev.drain().unwrap(), 0);
    }

    #[test]
    fn test_epoll_reports_eventfd_readable() {
        let ep = Epoll::new().unwrap();
        let ev = EventFd::new().unwrap();
        ep.add(ev.raw(), true, false, 7).unwrap();

        let mut out = Vec::new();
        ep.wait(0, &mut out).unwrap();
        assert!(out.is_empty());

        ev.post().unwrap();
        ep.wait(1000, &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, 7);
        assert!(out[0].1.readable);
    }
}
