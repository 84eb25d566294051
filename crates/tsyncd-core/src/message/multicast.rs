//! Multicast groups: pub/sub fan-out keyed by message id.
//!
//! A thread *publishes* to a group to become a potential sender, and
//! *subscribes* to receive. Message subscribers get a cloned envelope drawn
//! from the pool they nominated at registration; event subscribers only have
//! their thread's event posted, with no payload. Registration is idempotent
//! per (thread, group).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::message::pool::Pool;
use crate::message::{Body, Mailbox, Msg, MsgId};
use crate::runtime::event::EventWriter;

enum SubscriberKind {
    /// Deliver a cloned envelope allocated from this pool.
    Message { mailbox: Mailbox, pool: Pool },
    /// Post the thread's event only.
    Event { writer: EventWriter },
}

struct Subscriber {
    thread: String,
    kind: SubscriberKind,
}

#[derive(Default)]
struct Group {
    publishers: Vec<String>,
    subscribers: Vec<Subscriber>,
}

/// The process-wide multicast bus. Owned by the root thread and passed to
/// thread constructors; there is no hidden global.
#[derive(Default)]
pub struct MulticastBus {
    groups: Mutex<HashMap<u32, Group>>,
}

impl MulticastBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `thread` as a sender for `group`. Idempotent.
    pub fn publish(&self, thread: &str, group: MsgId) {
        let mut groups = self.groups.lock().unwrap();
        let g = groups.entry(group.0).or_default();
        if !g.publishers.iter().any(|p| p == thread) {
            g.publishers.push(thread.to_string());
        }
    }

    /// Register `thread` as a message receiver for `group`, cloning into
    /// envelopes from `pool`. Duplicate registration is rejected quietly.
    pub fn subscribe_messages(&self, thread: &str, group: MsgId, mailbox: Mailbox, pool: Pool) {
        self.subscribe(
            group,
            Subscriber {
                thread: thread.to_string(),
                kind: SubscriberKind::Message { mailbox, pool },
            },
        );
    }

    /// Register `thread` as an event receiver for `group`: no payload, only
    /// the thread's event is posted per send.
    pub fn subscribe_events(&self, thread: &str, group: MsgId, writer: EventWriter) {
        self.subscribe(
            group,
            Subscriber {
                thread: thread.to_string(),
                kind: SubscriberKind::Event { writer },
            },
        );
    }

    fn subscribe(&self, group: MsgId, sub: Subscriber) {
        let mut groups = self.groups.lock().unwrap();
        let g = groups.entry(group.0).or_default();
        if g.subscribers.iter().any(|s| s.thread == sub.thread) {
            log::debug!(
                "thread {} already subscribed to group {group}, ignoring",
                sub.thread
            );
            return;
        }
        g.subscribers.push(sub);
    }

    pub fn unsubscribe(&self, thread: &str, group: MsgId) {
        let mut groups = self.groups.lock().unwrap();
        if let Some(g) = groups.get_mut(&group.0) {
            g.subscribers.retain(|s| s.thread != thread);
        }
    }

    /// Drop every registration belonging to `thread` (thread exit path).
    pub fn forget_thread(&self, thread: &str) {
        let mut groups = self.groups.lock().unwrap();
        for g in groups.values_mut() {
            g.subscribers.retain(|s| s.thread != thread);
            g.publishers.retain(|p| p != thread);
        }
    }

    /// Number of current subscribers to `group`. Link-table publication
    /// commits this as the version's initial reference count.
    pub fn subscriber_count(&self, group: MsgId) -> usize {
        let groups = self.groups.lock().unwrap();
        groups.get(&group.0).map_or(0, |g| g.subscribers.len())
    }

    /// Fan `body` out to every subscriber of `group`.
    ///
    /// The subscriber list is snapshotted under the bus lock; dispatch happens
    /// after it is released. Envelopes for all message subscribers are
    /// allocated up front: if one allocation fails, clones not yet delivered
    /// are freed and the first error is returned, while nothing has been
    /// delivered. Delivery failures to dead mailboxes are logged and skipped.
    pub fn send(&self, group: MsgId, body: &Body, wait: bool) -> Result<()> {
        // Snapshot under the lock: (mailbox, pool) pairs and event writers.
        let (message_subs, event_subs) = {
            let groups = self.groups.lock().unwrap();
            let Some(g) = groups.get(&group.0) else {
                return Ok(());
            };
            let mut msgs = Vec::new();
            let mut events = Vec::new();
            for s in &g.subscribers {
                match &s.kind {
                    SubscriberKind::Message { mailbox, pool } => {
                        msgs.push((mailbox.clone(), pool.clone()));
                    }
                    SubscriberKind::Event { writer } => events.push(writer.clone()),
                }
            }
            (msgs, events)
        };

        // Clone phase: draw one envelope per message subscriber.
        let mut staged: Vec<(Mailbox, Msg)> = Vec::with_capacity(message_subs.len());
        for (mailbox, pool) in message_subs {
            match pool.alloc("multicast_send", wait) {
                Ok(mut m) => {
                    m.id = group;
                    m.body = body.clone();
                    staged.push((mailbox, m));
                }
                Err(e) => {
                    // `staged` drops here, freeing every undelivered clone.
                    return Err(e);
                }
            }
        }

        // Dispatch phase: deliveries that succeed stay delivered.
        let mut first_err: Option<Error> = None;
        for (mailbox, m) in staged {
            if let Err(e) = mailbox.deliver(m) {
                log::warn!("multicast {group}: delivery to {} failed: {e}", mailbox.name());
                first_err.get_or_insert(e);
            }
        }
        for writer in event_subs {
            if let Err(e) = writer.post() {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
