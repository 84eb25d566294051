//! Typed inter-thread messages and mailboxes.
//!
//! Messages are drawn from fixed-count pools ([`pool`]), travel point-to-point
//! through per-thread mailboxes, and fan out through multicast groups
//! ([`multicast`]). Ownership of a [`Msg`] transfers with every successful
//! send; an undelivered message returns to its pool when dropped, so every
//! envelope is freed exactly once however a send attempt ends.

pub mod multicast;
pub mod pool;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime::fd::EventFd;
use crate::sync::status::{ControlFlags, GrandmasterInfo, SyncInstanceStatus};
use crate::time::TimeSpec;

pub use pool::{Pool, PoolSet, PoolStats};

/// Routing identifier carried by every message. The recipient dispatches on
/// this, not on the payload variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgId(pub u32);

impl std::fmt::Display for MsgId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Well-known message ids.
pub mod msg_id {
    use super::MsgId;

    pub const STATUS_GET: MsgId = MsgId(0x0001);
    pub const STATUS_REPLY: MsgId = MsgId(0x0002);
    pub const CONTROL: MsgId = MsgId(0x0003);
    pub const STEP_CLOCK: MsgId = MsgId(0x0004);
    pub const GRANDMASTER_UPDATE: MsgId = MsgId(0x0005);
    pub const LEAP_UPDATE: MsgId = MsgId(0x0006);
    pub const SAVE_STATE: MsgId = MsgId(0x0007);
    pub const WRITE_TOPOLOGY: MsgId = MsgId(0x0008);
    pub const STATS_TICK: MsgId = MsgId(0x0009);
    pub const CONTROL_COMMAND: MsgId = MsgId(0x000a);
    pub const THREAD_EXITED: MsgId = MsgId(0x000b);
    pub const TEST_MODE: MsgId = MsgId(0x000c);

    /// Multicast group: a new link-table version is available.
    pub const LINK_TABLE_PUBLISHED: MsgId = MsgId(0x0100);
    /// Multicast group: realtime servo/offset statistics.
    pub const RT_STATS: MsgId = MsgId(0x0101);
}

/// Message payloads. The id, not the variant, is authoritative for routing;
/// the variant carries the data the id promises.
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Status(Box<SyncInstanceStatus>),
    Control {
        mask: ControlFlags,
        flags: ControlFlags,
    },
    StepClock {
        offset: TimeSpec,
    },
    Grandmaster(Box<GrandmasterInfo>),
    Leap {
        leap59: bool,
        leap61: bool,
    },
    LinkTable {
        version: u64,
    },
    RtStats {
        instance: String,
        offset_ns: f64,
        in_sync: bool,
    },
    /// Control-socket command text plus the reply address, if any.
    Command {
        line: String,
    },
    /// A child thread finished; sent to its parent's mailbox.
    ThreadExited {
        name: String,
        code: i32,
    },
    /// Fault-injection toggle for test harnesses.
    TestMode {
        id: u32,
        params: [i64; 3],
    },
}

/// The per-thread priority reply channel used by `send_wait`. Only replies to
/// this thread's own synchronous requests ever appear here.
#[derive(Clone)]
pub struct ReplyQueue {
    inner: Arc<ReplyInner>,
}

struct ReplyInner {
    q: Mutex<VecDeque<Msg>>,
    cv: Condvar,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ReplyInner {
                q: Mutex::new(VecDeque::new()),
                cv: Condvar::new(),
            }),
        }
    }

    pub fn push(&self, msg: Msg) {
        let mut q = self.inner.q.lock().unwrap();
        q.push_back(msg);
        self.inner.cv.notify_one();
    }

    /// Block until a reply arrives or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<Msg> {
        let mut q = self.inner.q.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(m) = q.pop_front() {
                return Ok(m);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::WouldBlock);
            }
            let (guard, _res) = self.inner.cv.wait_timeout(q, deadline - now).unwrap();
            q = guard;
        }
    }
}

impl Default for ReplyQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A checked-out message envelope. Dropping it returns the envelope to its
/// pool; sending it transfers ownership to the recipient.
pub struct Msg {
    pub id: MsgId,
    pub body: Body,
    reply_to: Option<ReplyQueue>,
    pool: pool::PoolRef,
}

impl Msg {
    pub(crate) fn new(pool: pool::PoolRef) -> Self {
        Self {
            id: MsgId(0),
            body: Body::Empty,
            reply_to: None,
            pool,
        }
    }

    /// Name of the pool this envelope belongs to.
    pub fn pool_name(&self) -> &'static str {
        self.pool.name()
    }

    pub(crate) fn set_reply_to(&mut self, rq: ReplyQueue) {
        self.reply_to = Some(rq);
    }

    pub(crate) fn take_reply_to(&mut self) -> Option<ReplyQueue> {
        self.reply_to.take()
    }

    /// Turn this request into its reply in place, reusing the envelope. The
    /// recorded reply queue is preserved for [`Mailbox::reply`].
    pub fn into_reply(mut self, id: MsgId, body: Body) -> Msg {
        self.id = id;
        self.body = body;
        self
    }
}

impl Drop for Msg {
    fn drop(&mut self) {
        self.pool.note_freed();
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("id", &self.id)
            .field("pool", &self.pool.name())
            .finish()
    }
}

/// The receiving end of a thread's message queue. Owned by the thread's
/// reactor; everyone else holds [`Mailbox`] clones.
pub struct MailboxReceiver {
    shared: Arc<MailboxShared>,
}

struct MailboxShared {
    name: String,
    queue: Mutex<VecDeque<Msg>>,
    wake: EventFd,
    /// Set when the owner has exited; sends fail cleanly afterwards.
    closed: std::sync::atomic::AtomicBool,
}

impl MailboxReceiver {
    pub fn new(name: &str) -> Result<(Self, Mailbox)> {
        let shared = Arc::new(MailboxShared {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            wake: EventFd::new()?,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        Ok((
            Self {
                shared: Arc::clone(&shared),
            },
            Mailbox { shared },
        ))
    }

    /// The descriptor the reactor watches for queue wakeups.
    pub fn wake_fd(&self) -> std::os::unix::io::RawFd {
        self.shared.wake.raw()
    }

    /// Drain the wakeup counter and return all queued messages in FIFO order.
    pub fn drain(&self) -> Vec<Msg> {
        let _ = self.shared.wake.drain();
        let mut q = self.shared.queue.lock().unwrap();
        q.drain(..).collect()
    }

    /// Mark the mailbox closed and free anything still queued.
    pub fn close(&self) {
        self.shared
            .closed
            .store(true, std::sync::atomic::Ordering::Release);
        let undrained: Vec<Msg> = {
            let mut q = self.shared.queue.lock().unwrap();
            q.drain(..).collect()
        };
        if !undrained.is_empty() {
            log::debug!(
                "mailbox {}: freeing {} undrained messages on close",
                self.shared.name,
                undrained.len()
            );
        }
        // Dropping the messages returns them to their pools.
    }
}

/// Cloneable sending handle for one thread's message queue.
#[derive(Clone)]
pub struct Mailbox {
    shared: Arc<MailboxShared>,
}

impl Mailbox {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Asynchronous send. On success ownership of `msg` has transferred to
    /// the recipient; on failure the message is dropped back to its pool and
    /// the error surfaced.
    pub fn send(&self, mut msg: Msg, id: MsgId) -> Result<()> {
        msg.id = id;
        self.deliver(msg)
    }

    pub(crate) fn deliver(&self, msg: Msg) -> Result<()> {
        if self.shared.closed.load(std::sync::atomic::Ordering::Acquire) {
            // msg drops here, returning to its pool.
            return Err(Error::NoSuchThread(self.shared.name.clone()));
        }
        {
            let mut q = self.shared.queue.lock().unwrap();
            q.push_back(msg);
        }
        self.shared.wake.post()
    }

    /// Synchronous request-reply. `replies` must be the calling thread's own
    /// reply queue. For any pair of threads, synchronous sends must only ever
    /// flow in one direction; both directions can deadlock.
    pub fn send_wait(
        &self,
        mut msg: Msg,
        id: MsgId,
        replies: &ReplyQueue,
        timeout: Duration,
    ) -> Result<Msg> {
        msg.id = id;
        msg.set_reply_to(replies.clone());
        self.deliver(msg)?;
        replies.wait(timeout)
    }

    /// Route a message to the reply queue recorded at `send_wait` time, or
    /// free it if the request was asynchronous.
    pub fn reply(mut msg: Msg) {
        match msg.take_reply_to() {
            Some(rq) => rq.push(msg),
            None => drop(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::pool::Pool;

    #[test]
    fn test_send_transfers_fifo_order() {
        let pool = Pool::new("test", 8);
        let (rx, tx) = MailboxReceiver::new("t").unwrap();
        for i in 0..3u32 {
            let mut m = pool.alloc("test", false).unwrap();
            m.body = Body::LinkTable { version: i as u64 };
            tx.send(m, MsgId(i)).unwrap();
        }
        let got = rx.drain();
        assert_eq!(got.len(), 3);
        for (i, m) in got.iter().enumerate() {
            assert_eq!(m.id, MsgId(i as u32));
        }
    }

    #[test]
    fn test_drop_returns_envelope_to_pool() {
        let pool = Pool::new("test", 1);
        let m = pool.alloc("here", false).unwrap();
        assert!(pool.alloc("there", false).is_err());
        drop(m);
        assert!(pool.alloc("again", false).is_ok());
    }

    #[test]
    fn test_send_to_closed_mailbox_fails_and_frees() {
        let pool = Pool::new("test", 1);
        let (rx, tx) = MailboxReceiver::new("t").unwrap();
        rx.close();
        let m = pool.alloc("x", false).unwrap();
        assert!(tx.send(m, MsgId(1)).is_err());
        // The failed send freed the envelope.
        assert!(pool.alloc("y", false).is_ok());
    }

    #[test]
    fn test_reply_routes_to_reply_queue() {
        let pool = Pool::new("test", 2);
        let (rx, tx) = MailboxReceiver::new("t").unwrap();
        let rq = ReplyQueue::new();

        let mut m = pool.alloc("req", false).unwrap();
        m.set_reply_to(rq.clone());
        tx.send(m, msg_id::STATUS_GET).unwrap();

        // Recipient side: drain and answer in place.
        let req = rx.drain().pop().unwrap();
        let rep = req.into_reply(msg_id::STATUS_REPLY, Body::Empty);
        Mailbox::reply(rep);

        let got = rq.wait(Duration::from_secs(1)).unwrap();
        assert_eq!(got.id, msg_id::STATUS_REPLY);
    }
}
