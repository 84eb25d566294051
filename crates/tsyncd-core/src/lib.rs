//! # tsyncd-core
//!
//! Core runtime of the tsyncd time-synchronization daemon.
//!
//! The daemon disciplines the clocks attached to a host — the system clock
//! and per-NIC hardware clocks — against one or more reference sources: PTP
//! over Ethernet, a pulse-per-second input, a freerunning local clock, or a
//! local NTP daemon queried through a helper socket.
//!
//! ## Architecture
//!
//! 1. Every thread runs a cooperative reactor ([`runtime`]) multiplexing
//!    timers, events, user descriptors, signals and a message queue over one
//!    epoll loop.
//! 2. A dedicated netlink thread ingests kernel interface events and
//!    publishes versioned immutable link tables ([`link`]) handed to
//!    consumers under reference counting.
//! 3. Each configured sync instance ([`sync`]) runs in its own thread and
//!    reports a status stream; the deterministic [`selector`] elects the
//!    reference instance each tick.
//! 4. The [`engine`] owns the clock registry ([`clocks`]), the per-pair PID
//!    servos ([`servo`]) and the instance threads, and propagates selection,
//!    grandmaster and leap-second state.
//!
//! Threads never share mutable state directly: interaction is by ownership-
//! transferring messages ([`message`]), multicast groups, and refcounted
//! link-table reads. The single process-wide exception is the recursive
//! hardware state lock guarding clock mutations.

pub mod clocks;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod message;
pub mod runtime;
pub mod selector;
pub mod servo;
pub mod sync;
pub mod time;

pub use config::Config;
pub use error::{Error, Result};
pub use time::{ClockDomain, TimeSpec};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
