//! Daemon-wide error taxonomy.
//!
//! Every boundary in the core returns [`Error`]. Handlers translate runtime
//! errors into alarm bits where a sync instance can keep operating; invariant
//! violations terminate the implicated thread with a critical log.

use std::io;

/// Errors produced by the tsyncd core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --- Transient local conditions, recovered in place ---------------------
    /// A message pool had no free envelope. Carries the allocation site.
    #[error("message pool '{pool}' exhausted (requested at {site})")]
    PoolExhausted {
        pool: &'static str,
        site: &'static str,
    },

    /// A non-blocking operation would have blocked.
    #[error("operation would block")]
    WouldBlock,

    /// The operation cannot complete right now but may after re-service.
    /// Used by link-table publication when the ring head is still referenced.
    #[error("try again: {0}")]
    TryAgain(&'static str),

    /// The kernel event buffer overran; a full re-dump is required.
    #[error("kernel event buffer overrun")]
    Overflow,

    // --- Configuration problems, fatal at startup ---------------------------
    #[error("configuration: {0}")]
    Config(String),

    /// A clock or interface named in the configuration does not exist.
    #[error("no such device: {0}")]
    NoSuchDevice(String),

    /// Another process holds the daemon lock file.
    #[error("already running (lock file {0} is held)")]
    AlreadyRunning(String),

    // --- Runtime correctness, surfaced as alarms ----------------------------
    /// A hardware transmit or receive timestamp did not arrive in time.
    #[error("missing {0} timestamp")]
    MissingTimestamp(&'static str),

    /// A malformed or unexpected protocol message.
    #[error("protocol: {0}")]
    Protocol(String),

    /// The named peer thread is gone or never existed.
    #[error("no such thread: {0}")]
    NoSuchThread(String),

    // --- Invariant violations, fatal to the implicated thread ---------------
    /// A link-table slot was released more times than it was acquired.
    #[error("link table v{0} reference count underflow")]
    RefcountUnderflow(u64),

    /// A message envelope was returned to a pool it is not checked out of.
    #[error("message double free (pool '{0}')")]
    DoubleFree(&'static str),

    /// A synchronous send would violate the one-direction rule for the pair.
    #[error("send_wait direction violation: {0} -> {1}")]
    SendWaitAsymmetry(String, String),

    /// A thread failed to stop within the join timeout.
    #[error("thread '{0}' did not exit within the join timeout")]
    JoinTimeout(String),

    // --- Operating system ---------------------------------------------------
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Last-OS-error constructor for raw `libc` call sites.
    pub fn last_os() -> Self {
        Error::Io(io::Error::last_os_error())
    }

    /// True for conditions the caller is expected to retry or absorb.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::WouldBlock
                | Error::TryAgain(_)
                | Error::Overflow
        )
    }

    /// The errno to report through `NOTIFY_SOCKET` on startup failure.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::WouldBlock => libc::EAGAIN,
            Error::PoolExhausted { .. } => libc::ENOMEM,
            Error::NoSuchDevice(_) => libc::ENODEV,
            Error::AlreadyRunning(_) => libc::EEXIST,
            Error::Config(_) => libc::EINVAL,
            _ => libc::EIO,
        }
    }
}

/// Convenience alias used across the core.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::WouldBlock.is_transient());
        assert!(Error::TryAgain("ring full").is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
        assert!(!Error::RefcountUnderflow(3).is_transient());
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NoSuchDevice("eth9".into()).errno(), libc::ENODEV);
        assert_eq!(
            Error::Io(io::Error::from_raw_os_error(libc::EPERM)).errno(),
            libc::EPERM
        );
    }
}
