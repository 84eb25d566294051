//! Cooperative per-thread reactor runtime.
//!
//! Every daemon thread runs exactly one reactor loop multiplexing, over a
//! single epoll instance: its message queue, kernel timers, event objects,
//! user I/O descriptors, and (root thread only) a signal descriptor. Inside a
//! thread all handler callbacks run strictly serialized; a handler can assume
//! no concurrent callback on the same thread and must never block
//! indefinitely. The only suspension point is the reactor's epoll wait.
//!
//! Threads are addressed by [`ThreadHandle`]s. Point-to-point messages go
//! through mailboxes with FIFO order per sender-receiver pair; synchronous
//! request-reply uses a dedicated per-thread reply channel and must only ever
//! flow in one direction for any given pair of threads.

pub mod event;
pub mod fd;
pub mod signals;
pub mod thread;
pub mod timer;

pub use event::{EventId, EventWriter};
pub use fd::Readiness;
pub use thread::{Runtime, ThreadContext, ThreadHandle};
pub use timer::{TimerId, TimerSpec};

use crate::error::Result;
use crate::message::Msg;

/// The callbacks a thread is built from. Construction of a thread takes an
/// implementation of this trait; state the callbacks share lives in `self`.
pub trait ThreadHandlers: Send {
    /// Runs on the new thread before the parent's `spawn` returns. A returned
    /// error aborts the spawn and tears the nascent thread down.
    fn on_startup(&mut self, ctx: &mut ThreadContext) -> Result<()>;

    /// Runs after the reactor loop ends, before the thread is joined.
    fn on_shutdown(&mut self, ctx: &mut ThreadContext, exit_code: i32);

    /// One queued message. Ownership of `msg` is the handler's; replying or
    /// dropping both return the envelope correctly.
    fn on_message(&mut self, ctx: &mut ThreadContext, msg: Msg);

    /// User descriptors that became ready in this reactor turn.
    fn on_user_fds(&mut self, ctx: &mut ThreadContext, ready: &[Readiness]);

    /// A timer created with [`ThreadContext::create_timer`] expired.
    /// `expiries` is how many periods elapsed since the last dispatch.
    fn on_timer(&mut self, _ctx: &mut ThreadContext, _id: TimerId, _expiries: u64) {}

    /// An event created with [`ThreadContext::create_event`] was posted.
    fn on_event(&mut self, _ctx: &mut ThreadContext, _id: EventId) {}

    /// A watched signal arrived (root thread only).
    fn on_signal(&mut self, _ctx: &mut ThreadContext, _signo: i32) {}
}
